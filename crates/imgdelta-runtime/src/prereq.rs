use crate::tools::Tools;
use imgdelta_schema::DriverKind;
use std::fmt;
use std::path::Path;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Whether `program` can be run: an existing file for explicit paths, a
/// `PATH` lookup for bare names.
fn command_exists(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    Command::new("which")
        .arg(program)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the external tools needed to create and apply deltas with `driver`.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_prereqs(tools: &Tools, driver: &DriverKind) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(&tools.rsync) {
        missing.push(MissingPrereq {
            name: tools.rsync.display().to_string(),
            purpose: "computing and replaying delta batches",
            install_hint:
                "zypper install rsync | apt install rsync | dnf install rsync | pacman -S rsync",
        });
    }

    if !command_exists(&tools.sync) {
        missing.push(MissingPrereq {
            name: tools.sync.display().to_string(),
            purpose: "flushing applied deltas to disk",
            install_hint: "part of coreutils (usually pre-installed)",
        });
    }

    if *driver == DriverKind::Btrfs && !command_exists(&tools.btrfs) {
        missing.push(MissingPrereq {
            name: tools.btrfs.display().to_string(),
            purpose: "snapshotting the source image on the btrfs driver",
            install_hint: "zypper install btrfsprogs | apt install btrfs-progs | dnf install btrfs-progs | pacman -S btrfs-progs",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nimgdelta runs these tools to create and apply image deltas.");
    msg
}
