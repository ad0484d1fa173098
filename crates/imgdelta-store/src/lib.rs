//! Image store collaborator interface and a directory-backed reference store.
//!
//! The delta engine only touches images through the [`ImageStore`] trait:
//! inspect, create an empty image, mount/unmount a root, report the storage
//! driver, list layer diff paths, and remove an image. [`DirStore`] implements
//! it on plain directories (`images/<id>.json` records plus `layers/<id>/`
//! roots) with atomic record writes and an exclusive store lock;
//! [`MockStore`] wraps it with fault injection for engine tests.

pub mod collaborator;
pub mod copy;
pub mod dir;
pub mod integrity;
pub mod layout;
pub mod lock;
pub mod mock;
pub mod records;

pub use collaborator::ImageStore;
pub use copy::copy_tree;
pub use dir::DirStore;
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::StoreLock;
pub use mock::MockStore;
pub use records::{validate_image_name, ImageRecord, RecordStore};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been fsynced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for image '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("ambiguous image reference '{reference}': matches {count} images")]
    AmbiguousReference { reference: String, count: usize },
    #[error("image {0} is mounted and cannot be removed")]
    ImageInUse(String),
    #[error("image {0} is not mounted")]
    NotMounted(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid image name: {0}")]
    InvalidName(String),
    #[error("name '{name}' is already used by image {existing_id}")]
    NameConflict { name: String, existing_id: String },
    #[error("{program} failed: {message}")]
    CommandFailed { program: String, message: String },
    #[error("injected failure: {0}")]
    Injected(String),
}
