use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a [`DirStore`](crate::DirStore).
///
/// ```text
/// <root>/store/version          format marker
/// <root>/store/images/<id>.json image records
/// <root>/store/layers/<layer>/  layer root directories
/// <root>/store/.lock            exclusive lock for record mutations
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.store_dir().join("images")
    }

    #[inline]
    pub fn image_record(&self, image_id: &str) -> PathBuf {
        self.images_dir().join(format!("{image_id}.json"))
    }

    #[inline]
    pub fn layers_dir(&self) -> PathBuf {
        self.store_dir().join("layers")
    }

    #[inline]
    pub fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.layers_dir().join(layer_id)
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    pub fn is_initialized(&self) -> bool {
        self.store_dir().join(VERSION_FILE).exists()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.layers_dir())?;

        let store_dir = self.store_dir();
        let version_path = store_dir.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/tmp/imgdelta-test");
        assert_eq!(
            layout.images_dir(),
            PathBuf::from("/tmp/imgdelta-test/store/images")
        );
        assert_eq!(
            layout.image_record("abc123"),
            PathBuf::from("/tmp/imgdelta-test/store/images/abc123.json")
        );
        assert_eq!(
            layout.layer_path("l1"),
            PathBuf::from("/tmp/imgdelta-test/store/layers/l1")
        );
        assert_eq!(
            layout.lock_file(),
            PathBuf::from("/tmp/imgdelta-test/store/.lock")
        );
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        assert!(!layout.is_initialized());
        layout.initialize().unwrap();

        assert!(layout.images_dir().is_dir());
        assert!(layout.layers_dir().is_dir());
        assert!(layout.is_initialized());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn foreign_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(
            layout.store_dir().join(VERSION_FILE),
            r#"{"format_version": 99}"#,
        )
        .unwrap();
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
