use crate::layout::StoreLayout;
use crate::records::RecordStore;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub records_checked: usize,
    pub records_passed: usize,
    pub layers_checked: usize,
    pub layers_passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub id: String,
    pub reason: String,
}

/// Check every image record's embedded checksum and that each layer it
/// references exists as a directory.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    layout.verify_version()?;
    let records = RecordStore::new(layout.clone());
    let mut report = IntegrityReport::default();

    for entry in records.list_with_errors()? {
        report.records_checked += 1;
        let record = match entry {
            Ok(record) => record,
            Err((id, StoreError::IntegrityFailure { actual, .. })) => {
                report.failed.push(IntegrityFailure {
                    id,
                    reason: format!("record checksum mismatch: got {actual}"),
                });
                continue;
            }
            Err((id, e)) => {
                report.failed.push(IntegrityFailure {
                    id,
                    reason: format!("record read error: {e}"),
                });
                continue;
            }
        };
        report.records_passed += 1;

        for layer in &record.layers {
            report.layers_checked += 1;
            if layout.layer_path(layer).is_dir() {
                report.layers_passed += 1;
            } else {
                report.failed.push(IntegrityFailure {
                    id: record.id.to_string(),
                    reason: format!("layer {layer} is missing"),
                });
            }
        }
    }

    Ok(report)
}
