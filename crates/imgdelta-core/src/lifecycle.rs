use crate::DeltaError;
use std::fmt;
use tracing::debug;

/// States of one apply operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    AwaitHeader,
    BaselineReady,
    BatchStreaming,
    ProcessExiting,
    Fsync,
    Done,
    ErrorCleanup,
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AwaitHeader => "await-header",
            Self::BaselineReady => "baseline-ready",
            Self::BatchStreaming => "batch-streaming",
            Self::ProcessExiting => "process-exiting",
            Self::Fsync => "fsync",
            Self::Done => "done",
            Self::ErrorCleanup => "error-cleanup",
        })
    }
}

impl ApplyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::ErrorCleanup)
    }
}

pub fn validate_transition(from: ApplyState, to: ApplyState) -> Result<(), DeltaError> {
    use ApplyState::{
        AwaitHeader, BaselineReady, BatchStreaming, Done, ErrorCleanup, Fsync, ProcessExiting,
    };

    let valid = matches!(
        (from, to),
        (AwaitHeader, BaselineReady)
            | (BaselineReady, BatchStreaming)
            | (BatchStreaming, ProcessExiting)
            | (ProcessExiting, Fsync)
            | (Fsync, Done)
    ) || (to == ErrorCleanup && !from.is_terminal());

    if valid {
        Ok(())
    } else {
        Err(DeltaError::InvalidTransition { from, to })
    }
}

/// Current state of one apply, advanced only through valid transitions.
#[derive(Debug)]
pub(crate) struct ApplyLifecycle {
    state: ApplyState,
}

impl ApplyLifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ApplyState::AwaitHeader,
        }
    }

    pub(crate) fn state(&self) -> ApplyState {
        self.state
    }

    pub(crate) fn advance(&mut self, to: ApplyState) -> Result<(), DeltaError> {
        validate_transition(self.state, to)?;
        debug!("apply: {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }
}
