use crate::collaborator::ImageStore;
use crate::dir::DirStore;
use crate::records::ImageRecord;
use crate::StoreError;
use async_trait::async_trait;
use imgdelta_schema::{DriverKind, ImageId};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

/// [`DirStore`] in a private temporary directory, with fault injection and
/// call accounting for engine tests.
///
/// The reported driver can be overridden without touching how images are
/// laid out, so baseline planning for every driver can be exercised on a
/// plain filesystem.
pub struct MockStore {
    inner: DirStore,
    _dir: TempDir,
    driver: Mutex<Option<DriverKind>>,
    fail_create: AtomicBool,
    fail_next_remove: AtomicBool,
    fail_next_unmount: AtomicBool,
    remove_calls: AtomicUsize,
    created: Mutex<Vec<ImageId>>,
}

impl MockStore {
    pub fn new() -> Result<Self, StoreError> {
        let dir = tempfile::tempdir()?;
        let inner = DirStore::open(dir.path(), DriverKind::Overlay2)?;
        Ok(Self {
            inner,
            _dir: dir,
            driver: Mutex::new(None),
            fail_create: AtomicBool::new(false),
            fail_next_remove: AtomicBool::new(false),
            fail_next_unmount: AtomicBool::new(false),
            remove_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn with_driver(driver: impl Into<DriverKind>) -> Result<Self, StoreError> {
        let store = Self::new()?;
        store.set_driver(driver.into());
        Ok(store)
    }

    pub fn set_driver(&self, driver: DriverKind) {
        if let Ok(mut d) = self.driver.lock() {
            *d = Some(driver);
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.layout().root()
    }

    pub fn inner(&self) -> &DirStore {
        &self.inner
    }

    /// Make every `create_empty_image` call fail until reset.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make the next `remove_image` call fail without removing anything.
    pub fn fail_next_remove(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }

    /// Make the next `unmount_root` call report failure. The root is still
    /// released, so mount accounting stays balanced.
    pub fn fail_next_unmount(&self) {
        self.fail_next_unmount.store(true, Ordering::SeqCst);
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn active_mounts(&self) -> usize {
        self.inner.active_mounts()
    }

    /// Ids returned by `create_empty_image`, in creation order.
    pub fn created_images(&self) -> Vec<ImageId> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn image_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.list()?.len())
    }

    pub async fn import(
        &self,
        source: &Path,
        config: serde_json::Value,
        name: Option<&str>,
    ) -> Result<ImageRecord, StoreError> {
        self.inner.import(source, config, name).await
    }
}

#[async_trait]
impl ImageStore for MockStore {
    async fn inspect(&self, image: &str) -> Result<serde_json::Value, StoreError> {
        self.inner.inspect(image).await
    }

    async fn create_empty_image(&self, config: &serde_json::Value) -> Result<ImageId, StoreError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("create_empty_image".to_owned()));
        }
        let id = self.inner.create_empty_image(config).await?;
        if let Ok(mut created) = self.created.lock() {
            created.push(id.clone());
        }
        Ok(id)
    }

    async fn mount_root(&self, image: &str) -> Result<PathBuf, StoreError> {
        self.inner.mount_root(image).await
    }

    async fn unmount_root(&self, image: &str) -> Result<(), StoreError> {
        self.inner.unmount_root(image).await?;
        if self.fail_next_unmount.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Injected("unmount_root".to_owned()));
        }
        Ok(())
    }

    async fn root_dir(&self, image: &str) -> Result<PathBuf, StoreError> {
        self.inner.root_dir(image).await
    }

    async fn driver_kind(&self) -> Result<DriverKind, StoreError> {
        let overridden = self
            .driver
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("mutex poisoned: {e}")))?
            .clone();
        match overridden {
            Some(driver) => Ok(driver),
            None => self.inner.driver_kind().await,
        }
    }

    async fn layer_diff_paths(&self, image: &str) -> Result<Vec<PathBuf>, StoreError> {
        self.inner.layer_diff_paths(image).await
    }

    async fn remove_image(&self, image: &str) -> Result<(), StoreError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Injected("remove_image".to_owned()));
        }
        self.inner.remove_image(image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn driver_override() {
        let store = MockStore::with_driver("btrfs").unwrap();
        assert_eq!(store.driver_kind().await.unwrap(), DriverKind::Btrfs);
        store.set_driver(DriverKind::Unsupported("zfs".to_owned()));
        assert!(!store.driver_kind().await.unwrap().is_supported());
    }

    #[tokio::test]
    async fn injected_remove_failure_fires_once() {
        let store = MockStore::new().unwrap();
        let id = store
            .create_empty_image(&serde_json::json!({}))
            .await
            .unwrap();

        store.fail_next_remove();
        assert!(matches!(
            store.remove_image(&id).await,
            Err(StoreError::Injected(_))
        ));
        assert_eq!(store.image_count().unwrap(), 1);

        store.remove_image(&id).await.unwrap();
        assert_eq!(store.remove_calls(), 2);
        assert_eq!(store.image_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_unmount_failure_still_releases() {
        let store = MockStore::new().unwrap();
        let id = store
            .create_empty_image(&serde_json::json!({}))
            .await
            .unwrap();
        store.mount_root(&id).await.unwrap();

        store.fail_next_unmount();
        assert!(matches!(
            store.unmount_root(&id).await,
            Err(StoreError::Injected(_))
        ));
        assert_eq!(store.active_mounts(), 0);
        store.remove_image(&id).await.unwrap();
    }

    #[tokio::test]
    async fn create_failure_records_nothing() {
        let store = MockStore::new().unwrap();
        store.set_fail_create(true);
        assert!(store
            .create_empty_image(&serde_json::json!({}))
            .await
            .is_err());
        assert!(store.created_images().is_empty());
        assert_eq!(store.image_count().unwrap(), 0);
    }
}
