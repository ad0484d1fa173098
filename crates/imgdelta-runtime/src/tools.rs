use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Paths of the external programs the engine runs.
///
/// Defaults resolve the bare names on `PATH`. Every subprocess the engine
/// spawns goes through one of these entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub rsync: PathBuf,
    pub btrfs: PathBuf,
    pub sync: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            rsync: PathBuf::from("rsync"),
            btrfs: PathBuf::from("btrfs"),
            sync: PathBuf::from("sync"),
        }
    }
}

impl Tools {
    pub fn rsync<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        quiet_command(&self.rsync, args)
    }

    pub fn btrfs<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        quiet_command(&self.btrfs, args)
    }

    pub fn sync(&self) -> Command {
        quiet_command(&self.sync, std::iter::empty::<&OsStr>())
    }
}

/// Command with stdin and stdout detached; stderr goes to ours so tool
/// diagnostics stay visible. Callers that need a pipe override the stream.
fn quiet_command<I, S>(program: &Path, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    cmd
}
