//! Subprocess plumbing for the delta engine.
//!
//! This crate owns everything that touches external programs: the process
//! supervisor (`SupervisedProcess`, race-free exit outcomes and signal-based
//! kill), the batch generator that runs `rsync --only-write-batch` into a
//! named pipe, the baseline builder that prepares a destination root before
//! replay (btrfs snapshot or rsync hardlink copy), the `Tools` table of
//! program paths, and prerequisite checks.

pub mod baseline;
pub mod batch;
pub mod btrfs;
pub mod prereq;
pub mod process;
pub mod tools;

pub use baseline::BaselinePlan;
pub use batch::{
    create_batch_stream, generate_args, hardlink_copy_args, replay_args, BatchStream, PIPE_NAME,
};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};
pub use process::{
    run_to_completion, signal_name, ProcessOutcome, SupervisedProcess, FORCE_KILL_SIGNAL,
};
pub use tools::Tools;

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("{program} exited. {}", process::describe_exit(.code, .signal))]
    ProcessFailed {
        program: String,
        code: Option<i32>,
        signal: Option<String>,
    },
    #[error("failed to send {signal} to {program} (pid {pid}): {source}")]
    Signal {
        program: String,
        pid: u32,
        signal: String,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Exit code of a subprocess that ran and failed, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessFailed { code, .. } => *code,
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable `sh` script into `dir`.
    pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn have_program(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_failed_display_names_code_and_signal() {
        let e = RuntimeError::ProcessFailed {
            program: "rsync".to_owned(),
            code: Some(23),
            signal: None,
        };
        assert_eq!(e.to_string(), "rsync exited. code: 23 signal: none");
        assert_eq!(e.exit_code(), Some(23));

        let e = RuntimeError::ProcessFailed {
            program: "rsync".to_owned(),
            code: None,
            signal: Some("SIGUSR1".to_owned()),
        };
        assert_eq!(e.to_string(), "rsync exited. code: none signal: SIGUSR1");
        assert_eq!(e.exit_code(), None);
    }
}
