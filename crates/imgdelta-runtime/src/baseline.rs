use crate::batch::hardlink_copy_args;
use crate::btrfs;
use crate::process::run_to_completion;
use crate::tools::Tools;
use crate::RuntimeError;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Filesystem state to build at the destination root before a batch is
/// replayed onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselinePlan {
    /// No source image: replay onto the empty destination root.
    Empty,
    /// Replace the destination subvolume with a snapshot of `source`.
    Snapshot { source: PathBuf },
    /// rsync `source` into the destination, hardlinking unchanged files found
    /// under `link_dests`.
    HardlinkCopy {
        source: PathBuf,
        link_dests: Vec<PathBuf>,
    },
}

impl BaselinePlan {
    pub async fn execute(&self, dst_root: &Path, tools: &Tools) -> Result<(), RuntimeError> {
        match self {
            Self::Empty => {}
            Self::Snapshot { source } => {
                btrfs::delete_subvolume(tools, dst_root).await?;
                btrfs::snapshot_subvolume(tools, source, dst_root).await?;
            }
            Self::HardlinkCopy { source, link_dests } => {
                let mut cmd = tools.rsync(hardlink_copy_args(source, dst_root, link_dests));
                run_to_completion(&mut cmd).await?;
            }
        }
        info!("baseline ready at {}: {self}", dst_root.display());
        Ok(())
    }
}

impl fmt::Display for BaselinePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty root"),
            Self::Snapshot { source } => write!(f, "btrfs snapshot of {}", source.display()),
            Self::HardlinkCopy { source, link_dests } => write!(
                f,
                "hardlink copy of {} ({} link-dest hints)",
                source.display(),
                link_dests.len()
            ),
        }
    }
}
