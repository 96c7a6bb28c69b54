use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use crate::{
    config::{METADATA_DIRECTORY, RetryPolicy, TABLE_STATUS_FILE},
    errors::{self, ErrorCodes, Errors},
    lock::SegmentLock,
    os::write_file_atomically,
};

pub mod details;

pub use details::{LoadMetadataDetails, SegmentStatus};

/// The table status ledger: the authoritative list of per-segment load metadata.
///
/// The file is only ever replaced whole (temp file + rename), so a reader sees the old list
/// or the new one and never a partial record. Mutations go through [`Self::update`], which
/// serializes read-modify-write cycles on the table status lock.
#[derive(Debug, Clone)]
pub struct LoadMetadataLedger {
    table_name: String,
    status_path: PathBuf,
    lock: SegmentLock,
    lock_policy: RetryPolicy,
}

impl LoadMetadataLedger {
    pub fn new(
        table_name: &str,
        table_root: &Path,
        lock: SegmentLock,
        lock_policy: RetryPolicy,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            status_path: table_root.join(METADATA_DIRECTORY).join(TABLE_STATUS_FILE),
            lock,
            lock_policy,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    // Missing file means a table nothing has been loaded into yet.
    pub async fn read(&self) -> errors::Result<Vec<LoadMetadataDetails>> {
        let data = match tokio::fs::read(&self.status_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(Errors::new(ErrorCodes::LedgerReadError).with_message(format!(
                    "Failed to read table status {:?}: {}",
                    self.status_path, e
                )));
            }
        };

        serde_json::from_slice(&data)
            .map_err(|e| Errors::new(ErrorCodes::LedgerDecodeError).with_message(e.to_string()))
    }

    pub async fn write_atomically(&self, entries: &[LoadMetadataDetails]) -> errors::Result<()> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.segment_id.as_str()) {
                return Err(
                    Errors::new(ErrorCodes::CommitIntegrityError).with_message(format!(
                        "Duplicate table status entry for segment {}",
                        entry.segment_id
                    )),
                );
            }
        }

        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| Errors::new(ErrorCodes::LedgerEncodeError).with_message(e.to_string()))?;

        write_file_atomically(&self.status_path, &data, ErrorCodes::LedgerWriteError).await?;

        log::debug!(
            "Table status of {} rewritten ({} entries)",
            self.table_name,
            entries.len()
        );

        Ok(())
    }

    // Read-modify-write under the table status lock. The closure's error aborts the write;
    // the lock is released on every path.
    pub async fn update<F, T>(&self, mutate: F) -> errors::Result<T>
    where
        F: FnOnce(&mut Vec<LoadMetadataDetails>) -> errors::Result<T>,
    {
        let handle = self
            .lock
            .acquire_table_status(&self.table_name, self.lock_policy)
            .await?;

        let result: errors::Result<T> = async {
            let mut entries = self.read().await?;
            let value = mutate(&mut entries)?;
            self.write_atomically(&entries).await?;
            Ok(value)
        }
        .await;

        let released = handle.release();

        let value = result?;
        released?;
        Ok(value)
    }
}

pub fn find<'a>(
    entries: &'a [LoadMetadataDetails],
    segment_id: &str,
) -> Option<&'a LoadMetadataDetails> {
    entries.iter().find(|entry| entry.segment_id == segment_id)
}

pub fn find_mut<'a>(
    entries: &'a mut [LoadMetadataDetails],
    segment_id: &str,
) -> Option<&'a mut LoadMetadataDetails> {
    entries.iter_mut().find(|entry| entry.segment_id == segment_id)
}

// Segments readers may scan.
pub fn valid_segments(entries: &[LoadMetadataDetails]) -> Vec<&LoadMetadataDetails> {
    entries.iter().filter(|entry| entry.is_valid()).collect()
}

// Next id after the largest numeric id in the ledger, starting at 0.
pub fn next_segment_id(entries: &[LoadMetadataDetails]) -> String {
    entries
        .iter()
        .filter_map(|entry| entry.segment_id.parse::<u64>().ok())
        .max()
        .map(|max| max.saturating_add(1))
        .unwrap_or(0)
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tempfile::TempDir;

    use super::*;
    use crate::{config::STAGING_EXT, lock::InProcessLockProvider};

    fn ledger(root: &Path) -> LoadMetadataLedger {
        LoadMetadataLedger::new(
            "sales",
            root,
            SegmentLock::new(Arc::new(InProcessLockProvider::new())),
            RetryPolicy::new(100, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_read_missing_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(ledger(temp_dir.path()).read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_replaces_whole_file() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(temp_dir.path());

        let mut first = LoadMetadataDetails::new_in_progress("0", 10);
        first.transition_to(SegmentStatus::Success).unwrap();
        let second = LoadMetadataDetails::new_in_progress("1", 20);

        ledger
            .write_atomically(&[first.clone(), second.clone()])
            .await
            .unwrap();
        assert_eq!(ledger.read().await.unwrap(), vec![first.clone(), second]);

        ledger.write_atomically(&[first.clone()]).await.unwrap();
        assert_eq!(ledger.read().await.unwrap(), vec![first]);

        // the temp file never outlives a successful write
        let temp_path = temp_dir
            .path()
            .join(METADATA_DIRECTORY)
            .join(format!("{}{}", TABLE_STATUS_FILE, STAGING_EXT));
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_write_rejects_duplicate_segment() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(temp_dir.path());

        let entry = LoadMetadataDetails::new_in_progress("3", 10);
        let err = ledger
            .write_atomically(&[entry.clone(), entry])
            .await
            .unwrap_err();

        assert!(err.is(ErrorCodes::CommitIntegrityError));
        assert!(!ledger.status_path().exists());
    }

    #[tokio::test]
    async fn test_update_failure_leaves_ledger_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(temp_dir.path());

        ledger
            .write_atomically(&[LoadMetadataDetails::new_in_progress("0", 10)])
            .await
            .unwrap();

        let result: errors::Result<()> = ledger
            .update(|entries| {
                entries.clear();
                Err(Errors::new(ErrorCodes::CommitIntegrityError))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.read().await.unwrap().len(), 1);

        // the table status lock was released despite the error
        ledger.update(|_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_entries() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(temp_dir.path());
        let mut handles = vec![];

        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .update(|entries| {
                        entries.push(LoadMetadataDetails::new_in_progress(&i.to_string(), i));
                        Ok(())
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = ledger.read().await.unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(next_segment_id(&entries), "10");
    }

    #[test]
    fn test_next_segment_id() {
        assert_eq!(next_segment_id(&[]), "0");

        let entries = vec![
            LoadMetadataDetails::new_in_progress("0", 1),
            LoadMetadataDetails::new_in_progress("7", 1),
            LoadMetadataDetails::new_in_progress("3", 1),
        ];
        assert_eq!(next_segment_id(&entries), "8");
    }

    #[test]
    fn test_valid_segments() {
        let mut success = LoadMetadataDetails::new_in_progress("0", 1);
        success.transition_to(SegmentStatus::Success).unwrap();
        let mut failed = LoadMetadataDetails::new_in_progress("1", 1);
        failed.transition_to(SegmentStatus::LoadFailure).unwrap();
        let running = LoadMetadataDetails::new_in_progress("2", 1);

        let entries = vec![success, failed, running];
        let valid = valid_segments(&entries);

        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].segment_id, "0");
        assert!(find(&entries, "2").is_some());
        assert!(find(&entries, "9").is_none());
    }
}
