use crate::StoreError;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

/// Recursively copy the contents of `src` into `dst`.
///
/// Regular files keep their permission bits, symlinks are recreated as
/// symlinks (never followed), directories are created as needed. Sockets,
/// FIFOs and device nodes are skipped with a warning. Returns the number of
/// entries copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64, StoreError> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", src.display()),
        )));
    }
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    copy_dir_contents(src, dst, &mut copied)?;
    fs::set_permissions(dst, meta.permissions())?;
    Ok(copied)
}

fn copy_dir_contents(src: &Path, dst: &Path, copied: &mut u64) -> Result<(), StoreError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            symlink(&target, &to)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&to)?;
            copy_dir_contents(&from, &to, copied)?;
            fs::set_permissions(&to, entry.metadata()?.permissions())?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        } else {
            tracing::warn!("skipping special file {}", from.display());
            continue;
        }
        *copied += 1;
    }
    Ok(())
}
