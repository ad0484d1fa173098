//! Delta engine: create and apply image filesystem deltas.
//!
//! [`create_delta`] mounts two image roots, asks rsync for a batch that turns
//! the first into the second, and writes a framed delta stream (JSON header,
//! `0x00`, batch bytes). [`apply_delta`] reads such a stream, creates an empty
//! destination image, builds a baseline from the source image according to
//! the storage driver, and replays the batch onto it under supervision.
//! [`spawn_create_delta`] and [`spawn_apply_delta`] wrap both behind byte
//! streams and an `id` / `error` / `close` event channel.

pub mod decoder;
pub mod encoder;
pub mod events;
pub mod lifecycle;
pub mod options;
pub mod scope;

pub use decoder::{apply_delta, plan_baseline, ApplyReport};
pub use encoder::{create_delta, CreateReport};
pub use events::{spawn_apply_delta, spawn_create_delta, DeltaEvent, DeltaReader, DeltaWriter};
pub use lifecycle::{validate_transition, ApplyState};
pub use options::{ApplyOptions, CreateOptions, Progress, RSYNC_EXIT_TIMEOUT};
pub use scope::{with_root_mounted, with_root_mounted_collecting};

use imgdelta_runtime::RuntimeError;
use imgdelta_schema::ProtocolError;
use imgdelta_store::StoreError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// rsync exit codes that mean the batch does not fit the destination.
///
/// 19 is rsync's "received SIGUSR1", 23 a partial transfer, 24 vanished
/// source files.
pub const OUT_OF_SYNC_CODES: [i32; 3] = [19, 23, 24];

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("image out of sync with delta (rsync exit code {code})")]
    OutOfSync { code: i32 },
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("unsupported storage driver '{0}'")]
    UnsupportedDriver(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("invalid apply state transition: {from} -> {to}")]
    InvalidTransition { from: ApplyState, to: ApplyState },
}

/// Coarse failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    OutOfSync,
    Process,
    Configuration,
    Io,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Protocol => "protocol",
            Self::OutOfSync => "out-of-sync",
            Self::Process => "process",
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        })
    }
}

impl DeltaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::OutOfSync { .. } => ErrorKind::OutOfSync,
            Self::Runtime(RuntimeError::Io(_)) | Self::Io(_) | Self::Store(_) => ErrorKind::Io,
            Self::Runtime(_) => ErrorKind::Process,
            Self::UnsupportedDriver(_) => ErrorKind::Configuration,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidTransition { .. } => ErrorKind::Internal,
        }
    }

    /// Classify a failure of the replay rsync: designated exit codes become
    /// [`DeltaError::OutOfSync`], everything else stays a process error.
    pub fn from_replay(err: RuntimeError) -> Self {
        match err.exit_code() {
            Some(code) if OUT_OF_SYNC_CODES.contains(&code) => Self::OutOfSync { code },
            _ => Self::Runtime(err),
        }
    }
}

/// A failed apply: the error that stopped it plus any failures hit while
/// cleaning up afterwards. Cleanup failures never replace the primary error.
#[derive(Debug, Error)]
#[error("{primary}")]
pub struct ApplyError {
    #[source]
    pub primary: DeltaError,
    pub secondary: Vec<DeltaError>,
}

impl ApplyError {
    pub fn new(primary: DeltaError) -> Self {
        Self {
            primary,
            secondary: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.primary.kind()
    }
}

impl From<DeltaError> for ApplyError {
    fn from(primary: DeltaError) -> Self {
        Self::new(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> RuntimeError {
        RuntimeError::ProcessFailed {
            program: "rsync".to_owned(),
            code: Some(code),
            signal: None,
        }
    }

    #[test]
    fn designated_codes_are_out_of_sync() {
        for code in OUT_OF_SYNC_CODES {
            let e = DeltaError::from_replay(exited(code));
            assert_eq!(e.kind(), ErrorKind::OutOfSync);
            assert!(matches!(e, DeltaError::OutOfSync { code: c } if c == code));
        }
    }

    #[test]
    fn other_codes_are_process_errors() {
        for code in [1, 2, 12, 20, 25, 30] {
            assert_eq!(DeltaError::from_replay(exited(code)).kind(), ErrorKind::Process);
        }
        let signalled = RuntimeError::ProcessFailed {
            program: "rsync".to_owned(),
            code: None,
            signal: Some("SIGKILL".to_owned()),
        };
        assert_eq!(DeltaError::from_replay(signalled).kind(), ErrorKind::Process);
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            DeltaError::from(ProtocolError::UnsupportedVersion("1".to_owned())).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            DeltaError::UnsupportedDriver("zfs".to_owned()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            DeltaError::from(StoreError::ImageNotFound("x".to_owned())).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            DeltaError::from(RuntimeError::Io(std::io::Error::other("pipe"))).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            DeltaError::Timeout {
                stage: "batch forwarding",
                after: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn apply_error_displays_primary() {
        let mut e = ApplyError::new(DeltaError::OutOfSync { code: 23 });
        e.secondary
            .push(DeltaError::from(StoreError::Injected("remove".to_owned())));
        assert!(e.to_string().contains("code 23"));
        assert_eq!(e.kind(), ErrorKind::OutOfSync);
    }
}
