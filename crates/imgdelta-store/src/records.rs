use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use imgdelta_schema::{ImageId, LayerId, ShortId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;

/// Persistent description of one image in a [`DirStore`](crate::DirStore).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    pub id: ImageId,
    pub short_id: ShortId,
    #[serde(default)]
    pub name: Option<String>,
    /// Opaque image configuration, carried verbatim in delta headers.
    pub config: serde_json::Value,
    /// Layer directories, lowest first. The last layer is the image root.
    pub layers: Vec<LayerId>,
    pub created_at: String,
    /// blake3 checksum for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ImageRecord {
    /// The layer holding the image's root filesystem.
    pub fn root_layer(&self) -> Option<&LayerId> {
        self.layers.last()
    }

    /// Compute the checksum over the record content (excluding the checksum field itself).
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

pub fn validate_image_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 128 {
        return Err(StoreError::InvalidName(
            "image name must be 1-128 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':' | b'/'))
    {
        return Err(StoreError::InvalidName(
            "image name must match [a-zA-Z0-9_.:/-]".to_owned(),
        ));
    }
    Ok(())
}

pub struct RecordStore {
    layout: StoreLayout,
}

impl RecordStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let dest = self.layout.image_record(&record.id);

        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        let dir = self.layout.images_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        Ok(())
    }

    pub fn get(&self, image_id: &str) -> Result<ImageRecord, StoreError> {
        let path = self.layout.image_record(image_id);
        if !path.exists() {
            return Err(StoreError::ImageNotFound(image_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let record: ImageRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: image_id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(record)
    }

    pub fn exists(&self, image_id: &str) -> bool {
        self.layout.image_record(image_id).exists()
    }

    pub fn remove(&self, image_id: &str) -> Result<(), StoreError> {
        let path = self.layout.image_record(image_id);
        if path.exists() {
            fs::remove_file(path)?;
            fsync_dir(&self.layout.images_dir())?;
        }
        Ok(())
    }

    /// All readable records, oldest first. Corrupted entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let mut results = Vec::new();
        for entry in self.list_with_errors()? {
            match entry {
                Ok(record) => results.push(record),
                Err((id, e)) => {
                    tracing::warn!("skipping corrupted image record '{id}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    /// Like `list()`, but returns per-entry `Result`s so integrity checks can
    /// surface individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<ImageRecord, (String, StoreError)>>, StoreError> {
        let dir = self.layout.images_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            match self.get(id) {
                Ok(record) => results.push(Ok(record)),
                Err(e) => results.push(Err((id.to_owned(), e))),
            }
        }
        Ok(results)
    }

    pub fn get_by_name(&self, name: &str) -> Result<ImageRecord, StoreError> {
        self.list()?
            .into_iter()
            .find(|r| r.name.as_deref() == Some(name))
            .ok_or_else(|| StoreError::ImageNotFound(format!("name '{name}'")))
    }

    /// Resolve a full id, short id, name, or unique id prefix to a record.
    pub fn resolve(&self, reference: &str) -> Result<ImageRecord, StoreError> {
        if reference.len() == 64 && self.exists(reference) {
            return self.get(reference);
        }

        let records = self.list()?;
        if let Some(exact) = records.iter().find(|r| {
            *r.id == *reference || *r.short_id == *reference || r.name.as_deref() == Some(reference)
        }) {
            return Ok(exact.clone());
        }

        let matches: Vec<_> = records
            .iter()
            .filter(|r| !reference.is_empty() && r.id.starts_with(reference))
            .collect();
        match matches.len() {
            0 => Err(StoreError::ImageNotFound(reference.to_owned())),
            1 => Ok(matches[0].clone()),
            count => Err(StoreError::AmbiguousReference {
                reference: reference.to_owned(),
                count,
            }),
        }
    }

    /// Fail with `NameConflict` if `name` already belongs to another image.
    pub fn ensure_name_free(&self, name: &str, for_id: &str) -> Result<(), StoreError> {
        validate_image_name(name)?;
        match self.get_by_name(name) {
            Ok(existing) if *existing.id != *for_id => Err(StoreError::NameConflict {
                name: name.to_owned(),
                existing_id: existing.short_id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, RecordStore::new(layout))
    }

    fn sample_record(id: &str) -> ImageRecord {
        ImageRecord {
            id: id.into(),
            short_id: id[..12.min(id.len())].into(),
            name: None,
            config: serde_json::json!({"Cmd": ["sh"]}),
            layers: vec![id.into()],
            created_at: "2025-01-01T00:00:00Z".to_owned(),
            checksum: None,
        }
    }

    #[test]
    fn record_roundtrip_embeds_checksum() {
        let (_dir, store) = test_record_store();
        let record = sample_record("abc123def4567890");
        store.put(&record).unwrap();
        let back = store.get(&record.id).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.config, record.config);
        assert!(back.checksum.is_some(), "put() must embed a checksum");
    }

    #[test]
    fn tampered_record_fails_integrity() {
        let (dir, store) = test_record_store();
        let record = sample_record("abc123def4567890");
        store.put(&record).unwrap();

        let path = StoreLayout::new(dir.path()).image_record(&record.id);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"sh\"", "\"bash\"")).unwrap();

        assert!(matches!(
            store.get(&record.id),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn missing_record_is_not_found() {
        let (_dir, store) = test_record_store();
        assert!(matches!(
            store.get("nope"),
            Err(StoreError::ImageNotFound(_))
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = test_record_store();
        let record = sample_record("abc123def4567890");
        store.put(&record).unwrap();
        store.remove(&record.id).unwrap();
        store.remove(&record.id).unwrap();
        assert!(!store.exists(&record.id));
    }

    #[test]
    fn resolve_by_short_id_name_and_prefix() {
        let (_dir, store) = test_record_store();
        let mut a = sample_record("aaaa11112222333344445555");
        a.name = Some("base:latest".to_owned());
        store.put(&a).unwrap();
        store.put(&sample_record("bbbb11112222333344445555")).unwrap();

        assert_eq!(store.resolve("aaaa11112222").unwrap().id, a.id);
        assert_eq!(store.resolve("base:latest").unwrap().id, a.id);
        assert_eq!(store.resolve("bbbb1").unwrap().short_id.as_str(), "bbbb11112222");
    }

    #[test]
    fn resolve_ambiguous_prefix() {
        let (_dir, store) = test_record_store();
        store.put(&sample_record("cccc11112222333344445555")).unwrap();
        store.put(&sample_record("cccc99992222333344445555")).unwrap();
        assert!(matches!(
            store.resolve("cccc"),
            Err(StoreError::AmbiguousReference { count: 2, .. })
        ));
    }

    #[test]
    fn name_validation() {
        assert!(validate_image_name("registry.local/app:v1").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("has spaces").is_err());
        assert!(validate_image_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn name_uniqueness_enforced() {
        let (_dir, store) = test_record_store();
        let mut a = sample_record("dddd11112222333344445555");
        a.name = Some("shared".to_owned());
        store.put(&a).unwrap();

        assert!(store.ensure_name_free("shared", &a.id).is_ok());
        assert!(matches!(
            store.ensure_name_free("shared", "eeee11112222333344445555"),
            Err(StoreError::NameConflict { .. })
        ));
    }

    #[test]
    fn list_skips_foreign_files_and_sorts() {
        let (dir, store) = test_record_store();
        let mut late = sample_record("ffff11112222333344445555");
        late.created_at = "2025-02-01T00:00:00Z".to_owned();
        store.put(&late).unwrap();
        store.put(&sample_record("eeee11112222333344445555")).unwrap();
        fs::write(
            StoreLayout::new(dir.path()).images_dir().join("README"),
            "x",
        )
        .unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].id, late.id);
    }
}
