pub mod apply;
pub mod completions;
pub mod create;
pub mod doctor;
pub mod header;
pub mod images;
pub mod import;
pub mod man_pages;
pub mod rm;

use crate::config::Config;
use imgdelta_core::{ApplyError, DeltaError, ErrorKind, Progress};
use imgdelta_schema::DriverKind;
use imgdelta_store::{DirStore, StoreError};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PROTOCOL_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_OUT_OF_SYNC: u8 = 4;

/// Failure of a subcommand: the message printed on stderr and the exit code.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
}

impl CommandError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        Self::new(EXIT_FAILURE, message)
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        Self::new(EXIT_STORE_ERROR, format!("store error: {e}"))
    }
}

impl From<DeltaError> for CommandError {
    fn from(e: DeltaError) -> Self {
        Self::new(exit_code_for(&e), e.to_string())
    }
}

impl From<ApplyError> for CommandError {
    fn from(e: ApplyError) -> Self {
        let mut message = e.primary.to_string();
        for secondary in &e.secondary {
            message.push_str(&format!("\n  cleanup also failed: {secondary}"));
        }
        Self::new(exit_code_for(&e.primary), message)
    }
}

pub type CommandResult = Result<u8, CommandError>;

pub fn exit_code_for(e: &DeltaError) -> u8 {
    match (e, e.kind()) {
        (DeltaError::Store(_), _) => EXIT_STORE_ERROR,
        (_, ErrorKind::Protocol) => EXIT_PROTOCOL_ERROR,
        (_, ErrorKind::OutOfSync) => EXIT_OUT_OF_SYNC,
        _ => EXIT_FAILURE,
    }
}

/// Shared state resolved from flags and the config file.
pub struct Context {
    pub config: Config,
    pub store_root: PathBuf,
    pub json: bool,
}

impl Context {
    pub fn driver(&self) -> DriverKind {
        DriverKind::from(self.config.driver())
    }

    pub fn open_store(&self) -> Result<DirStore, CommandError> {
        let store = DirStore::open(&self.store_root, self.driver())?
            .with_btrfs_program(self.config.tools.btrfs.clone());
        Ok(store)
    }

    /// Spinner fed by engine milestones, when stderr is a terminal and
    /// output is for humans.
    pub fn progress(&self, initial: &str) -> (Option<ProgressBar>, Progress) {
        if self.json || !std::io::stderr().is_terminal() {
            return (None, Progress::none());
        }
        let pb = spinner(initial);
        let sink = pb.clone();
        (
            Some(pb),
            Progress::new(move |msg| sink.set_message(msg.to_owned())),
        )
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(finish_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(finish_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Close out an optional spinner according to `result`.
pub fn finish_spinner<T, E>(pb: Option<&ProgressBar>, result: &Result<T, E>, ok: &str, fail: &str) {
    if let Some(pb) = pb {
        match result {
            Ok(_) => spin_ok(pb, ok),
            Err(_) => spin_fail(pb, fail),
        }
    }
}
