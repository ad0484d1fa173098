use crate::collaborator::ImageStore;
use crate::copy::copy_tree;
use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::records::{ImageRecord, RecordStore};
use crate::StoreError;
use async_trait::async_trait;
use imgdelta_schema::{compute_image_id, DriverKind, ImageId, LayerId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory-backed image store.
///
/// Each image is a JSON record plus one layer directory holding its root
/// filesystem. Roots are plain directories, so "mounting" only tracks an
/// in-process use count that blocks removal while a root is in use. With the
/// btrfs driver, layer directories are created as subvolumes so snapshot
/// baselines work against them.
pub struct DirStore {
    layout: StoreLayout,
    records: RecordStore,
    driver: DriverKind,
    btrfs: PathBuf,
    mounts: Mutex<HashMap<String, usize>>,
    counter: AtomicU64,
    mutations: tokio::sync::Mutex<()>,
}

/// Exclusive hold on the store for one record mutation.
///
/// Fields drop in order, so the file lock is released before the next
/// in-process caller is let through.
struct MutationGuard<'a> {
    _file: StoreLock,
    _local: tokio::sync::MutexGuard<'a, ()>,
}

impl DirStore {
    /// Open (and initialize if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, driver: DriverKind) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        Ok(Self {
            records: RecordStore::new(layout.clone()),
            layout,
            driver,
            btrfs: PathBuf::from("btrfs"),
            mounts: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            mutations: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn with_btrfs_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.btrfs = program.into();
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn driver(&self) -> &DriverKind {
        &self.driver
    }

    pub fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.records.list()
    }

    pub fn resolve(&self, reference: &str) -> Result<ImageRecord, StoreError> {
        self.records.resolve(reference)
    }

    /// Root directory of a resolved record.
    pub fn root_path(&self, record: &ImageRecord) -> Result<PathBuf, StoreError> {
        let layer = record
            .root_layer()
            .ok_or_else(|| StoreError::ImageNotFound(format!("{} has no layers", record.short_id)))?;
        Ok(self.layout.layer_path(layer))
    }

    /// Total number of roots currently mounted through this store.
    pub fn active_mounts(&self) -> usize {
        self.mounts
            .lock()
            .map(|m| m.values().sum())
            .unwrap_or_default()
    }

    /// Copy the directory tree at `source` into a new single-layer image.
    pub async fn import(
        &self,
        source: &Path,
        config: serde_json::Value,
        name: Option<&str>,
    ) -> Result<ImageRecord, StoreError> {
        let _guard = self.lock_mutations().await?;
        let mut record = self.new_record(config);
        if let Some(name) = name {
            self.records.ensure_name_free(name, &record.id)?;
            record.name = Some(name.to_owned());
        }

        let root = self.root_path(&record)?;
        self.make_layer_dir(&root).await?;

        let from = source.to_path_buf();
        let to = root.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                self.roll_back_layer(&root).await;
                return Err(e);
            }
        };

        if let Err(e) = self.records.put(&record) {
            self.roll_back_layer(&root).await;
            return Err(e);
        }
        info!(
            "imported {} entries from {} as image {}",
            copied,
            source.display(),
            record.short_id
        );
        Ok(record)
    }

    fn new_record(&self, config: serde_json::Value) -> ImageRecord {
        let nonce = format!(
            "{}:{}:{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            std::process::id(),
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        let identity = compute_image_id(&config, nonce.as_bytes());
        ImageRecord {
            layers: vec![LayerId::new(identity.image_id.as_str())],
            id: identity.image_id,
            short_id: identity.short_id,
            name: None,
            config,
            created_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    /// Serialize record mutations within this process, then across processes.
    ///
    /// The file lock is taken on the blocking pool so a contended `flock`
    /// never stalls a runtime worker.
    async fn lock_mutations(&self) -> Result<MutationGuard<'_>, StoreError> {
        let local = self.mutations.lock().await;
        let path = self.layout.lock_file();
        let file = tokio::task::spawn_blocking(move || StoreLock::acquire(&path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(MutationGuard {
            _file: file,
            _local: local,
        })
    }

    async fn roll_back_layer(&self, root: &Path) {
        if let Err(e) = self.remove_layer_dir(root).await {
            warn!("failed to roll back layer {}: {e}", root.display());
        }
    }

    async fn make_layer_dir(&self, path: &Path) -> Result<(), StoreError> {
        if self.driver == DriverKind::Btrfs {
            self.run_btrfs(&["subvolume", "create"], path).await
        } else {
            tokio::fs::create_dir_all(path).await?;
            Ok(())
        }
    }

    async fn remove_layer_dir(&self, path: &Path) -> Result<(), StoreError> {
        if !path.exists() {
            return Ok(());
        }
        if self.driver == DriverKind::Btrfs {
            self.run_btrfs(&["subvolume", "delete"], path).await
        } else {
            tokio::fs::remove_dir_all(path).await?;
            Ok(())
        }
    }

    async fn run_btrfs(&self, args: &[&str], path: &Path) -> Result<(), StoreError> {
        debug!("{} {} {}", self.btrfs.display(), args.join(" "), path.display());
        let output = tokio::process::Command::new(&self.btrfs)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StoreError::CommandFailed {
                program: self.btrfs.display().to_string(),
                message: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StoreError::CommandFailed {
                program: self.btrfs.display().to_string(),
                message: format!(
                    "{} ({})",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    fn mount_table(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, usize>>, StoreError> {
        self.mounts
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("mutex poisoned: {e}")))
    }
}

#[async_trait]
impl ImageStore for DirStore {
    async fn inspect(&self, image: &str) -> Result<serde_json::Value, StoreError> {
        Ok(self.resolve(image)?.config)
    }

    async fn create_empty_image(&self, config: &serde_json::Value) -> Result<ImageId, StoreError> {
        let _guard = self.lock_mutations().await?;
        let record = self.new_record(config.clone());
        let root = self.root_path(&record)?;
        self.make_layer_dir(&root).await?;
        if let Err(e) = self.records.put(&record) {
            self.roll_back_layer(&root).await;
            return Err(e);
        }
        debug!("created empty image {}", record.short_id);
        Ok(record.id)
    }

    async fn mount_root(&self, image: &str) -> Result<PathBuf, StoreError> {
        let record = self.resolve(image)?;
        let root = self.root_path(&record)?;
        if !root.is_dir() {
            return Err(StoreError::ImageNotFound(format!(
                "root of {} is missing at {}",
                record.short_id,
                root.display()
            )));
        }
        *self.mount_table()?.entry(record.id.into_inner()).or_default() += 1;
        Ok(root)
    }

    async fn unmount_root(&self, image: &str) -> Result<(), StoreError> {
        let record = self.resolve(image)?;
        let mut table = self.mount_table()?;
        match table.get_mut(record.id.as_str()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                table.remove(record.id.as_str());
            }
            None => return Err(StoreError::NotMounted(record.short_id.into_inner())),
        }
        Ok(())
    }

    async fn root_dir(&self, image: &str) -> Result<PathBuf, StoreError> {
        let record = self.resolve(image)?;
        self.root_path(&record)
    }

    async fn driver_kind(&self) -> Result<DriverKind, StoreError> {
        Ok(self.driver.clone())
    }

    async fn layer_diff_paths(&self, image: &str) -> Result<Vec<PathBuf>, StoreError> {
        let record = self.resolve(image)?;
        Ok(record
            .layers
            .iter()
            .map(|layer| self.layout.layer_path(layer))
            .collect())
    }

    async fn remove_image(&self, image: &str) -> Result<(), StoreError> {
        let record = self.resolve(image)?;
        let in_use = self.mount_table()?.contains_key(record.id.as_str());
        if in_use {
            return Err(StoreError::ImageInUse(record.short_id.into_inner()));
        }

        let _guard = self.lock_mutations().await?;
        // Record first: a crash in between leaves an orphaned layer, never a
        // record pointing at a missing root.
        self.records.remove(&record.id)?;
        for layer in &record.layers {
            self.remove_layer_dir(&self.layout.layer_path(layer)).await?;
        }
        info!("removed image {}", record.short_id);
        Ok(())
    }
}
