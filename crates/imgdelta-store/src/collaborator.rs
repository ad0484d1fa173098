use crate::StoreError;
use async_trait::async_trait;
use imgdelta_schema::{DriverKind, ImageId};
use std::path::PathBuf;

/// The image store operations the delta engine depends on.
///
/// Image arguments are references the store knows how to resolve (ids,
/// names). Every root returned by [`mount_root`](Self::mount_root) must be
/// released with [`unmount_root`](Self::unmount_root) by the same caller.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Image configuration, carried opaquely in delta headers.
    async fn inspect(&self, image: &str) -> Result<serde_json::Value, StoreError>;

    /// Create an image record with `config` and an empty root.
    async fn create_empty_image(&self, config: &serde_json::Value) -> Result<ImageId, StoreError>;

    /// Make the image root visible and return its path.
    async fn mount_root(&self, image: &str) -> Result<PathBuf, StoreError>;

    async fn unmount_root(&self, image: &str) -> Result<(), StoreError>;

    /// Path of the image root without mounting it. Used for the freshly
    /// created destination image, which the engine fills in place.
    async fn root_dir(&self, image: &str) -> Result<PathBuf, StoreError>;

    async fn driver_kind(&self) -> Result<DriverKind, StoreError>;

    /// Per-layer diff directories of `image`, lowest layer first.
    async fn layer_diff_paths(&self, image: &str) -> Result<Vec<PathBuf>, StoreError>;

    async fn remove_image(&self, image: &str) -> Result<(), StoreError>;
}
