#![allow(dead_code)]

use imgdelta_runtime::Tools;
use imgdelta_schema::{encode_header, DeltaMetadata};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable `sh` script into `dir`.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Scripted stand-ins for rsync, btrfs and sync living in `bin`.
///
/// Every invocation appends `<tool> <args>` to `bin/calls`. The fake rsync
/// copies its stdin to `bin/batch` when replaying, then runs `replay`;
/// any other rsync invocation (a baseline hardlink copy) succeeds.
pub fn fake_tools(bin: &Path, replay: &str) -> Tools {
    let calls = bin.join("calls");
    let batch = bin.join("batch");
    let rsync = format!(
        r#"echo "rsync $*" >> {calls}
case "$*" in
  *--read-batch*)
    cat > {batch}
    {replay}
    ;;
esac
exit 0"#,
        calls = calls.display(),
        batch = batch.display(),
    );
    Tools {
        rsync: script(bin, "rsync", &rsync),
        btrfs: script(
            bin,
            "btrfs",
            &format!("echo \"btrfs $*\" >> {}", calls.display()),
        ),
        sync: script(
            bin,
            "sync",
            &format!("echo sync >> {}", calls.display()),
        ),
    }
}

/// Fake generator rsync: writes `payload` into the batch pipe.
pub fn generating_tools(bin: &Path, payload: &str) -> Tools {
    let body = format!(
        r#"while [ "$#" -gt 0 ]; do
  if [ "$1" = "--only-write-batch" ]; then pipe="$2"; fi
  shift
done
printf '%s' '{payload}' > "$pipe""#
    );
    Tools {
        rsync: script(bin, "rsync", &body),
        ..Tools::default()
    }
}

pub fn calls(bin: &Path) -> Vec<String> {
    fs::read_to_string(bin.join("calls"))
        .map(|s| s.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

pub fn framed(config: serde_json::Value, payload: &[u8]) -> Vec<u8> {
    let mut out = encode_header(&DeltaMetadata::new(config)).unwrap();
    out.extend_from_slice(payload);
    out
}

pub fn have_rsync() -> bool {
    std::process::Command::new("which")
        .arg("rsync")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[derive(Debug, PartialEq, Eq)]
pub enum Entry {
    Dir,
    File(Vec<u8>),
    Symlink(PathBuf),
}

/// Relative path → entry for everything under `root`.
pub fn snapshot_tree(root: &Path) -> BTreeMap<PathBuf, Entry> {
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Entry>) {
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_path_buf();
        let ft = entry.file_type().unwrap();
        if ft.is_symlink() {
            out.insert(rel, Entry::Symlink(fs::read_link(&path).unwrap()));
        } else if ft.is_dir() {
            out.insert(rel, Entry::Dir);
            walk(root, &path, out);
        } else {
            out.insert(rel, Entry::File(fs::read(&path).unwrap()));
        }
    }
}
