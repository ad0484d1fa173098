use crate::process::run_to_completion;
use crate::tools::Tools;
use crate::RuntimeError;
use std::ffi::OsStr;
use std::path::Path;

pub async fn delete_subvolume(tools: &Tools, subvolume: &Path) -> Result<(), RuntimeError> {
    let mut cmd = tools.btrfs([OsStr::new("subvolume"), OsStr::new("delete"), subvolume.as_os_str()]);
    run_to_completion(&mut cmd).await
}

/// Copy-on-write snapshot of `src` at `dest`. `dest` must not exist.
pub async fn snapshot_subvolume(tools: &Tools, src: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let mut cmd = tools.btrfs([
        OsStr::new("subvolume"),
        OsStr::new("snapshot"),
        src.as_os_str(),
        dest.as_os_str(),
    ]);
    run_to_completion(&mut cmd).await
}
