use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    config::TEMPORARY_DIRECTORY,
    errors::{self, ErrorCodes, Errors},
    os::remove_dir_if_exists,
};

/// Generic staged-output promotion that runs before the segment-specific commit steps.
#[async_trait]
pub trait JobOutputPromoter: std::fmt::Debug + Send + Sync {
    // Returns the number of files promoted.
    async fn promote(&self, table_root: &Path, job_id: &str) -> errors::Result<usize>;

    async fn abort(&self, table_root: &Path, job_id: &str) -> errors::Result<()>;
}

/// Promotes `<root>/_temporary/<job>/<task>/**` into `<root>/**`.
#[derive(Debug, Default, Clone)]
pub struct TemporaryDirPromoter;

impl TemporaryDirPromoter {
    pub fn job_dir(table_root: &Path, job_id: &str) -> PathBuf {
        table_root.join(TEMPORARY_DIRECTORY).join(job_id)
    }

    async fn move_tree(source_root: &Path, target_root: &Path) -> errors::Result<usize> {
        let io_err = |path: &Path, e: std::io::Error| {
            Errors::new(ErrorCodes::PartialWriteError)
                .with_message(format!("Failed to promote {:?}: {}", path, e))
        };

        let mut moved = 0;
        let mut pending = vec![PathBuf::new()];

        while let Some(relative) = pending.pop() {
            let dir = source_root.join(&relative);
            let mut dir_entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&dir, e)),
            };

            while let Some(entry) = dir_entries
                .next_entry()
                .await
                .map_err(|e| io_err(&dir, e))?
            {
                let entry_relative = relative.join(entry.file_name());
                let file_type = entry.file_type().await.map_err(|e| io_err(&dir, e))?;

                if file_type.is_dir() {
                    pending.push(entry_relative);
                    continue;
                }

                let target = target_root.join(&entry_relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        Errors::new(ErrorCodes::DirectoryCreateError)
                            .with_message(format!("Failed to create directory {:?}: {}", parent, e))
                    })?;
                }

                tokio::fs::rename(entry.path(), &target)
                    .await
                    .map_err(|e| io_err(&entry.path(), e))?;
                moved += 1;
            }
        }

        Ok(moved)
    }
}

#[async_trait]
impl JobOutputPromoter for TemporaryDirPromoter {
    async fn promote(&self, table_root: &Path, job_id: &str) -> errors::Result<usize> {
        let job_dir = Self::job_dir(table_root, job_id);
        let mut moved = 0;

        let mut task_dirs = match tokio::fs::read_dir(&job_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Errors::new(ErrorCodes::PartialWriteError)
                    .with_message(format!("Failed to read {:?}: {}", job_dir, e)));
            }
        };

        while let Some(entry) = task_dirs.next_entry().await.map_err(|e| {
            Errors::new(ErrorCodes::PartialWriteError)
                .with_message(format!("Failed to read {:?}: {}", job_dir, e))
        })? {
            moved += Self::move_tree(&entry.path(), table_root).await?;
        }

        remove_dir_if_exists(&job_dir).await?;

        log::debug!("Promoted {} files of job {}", moved, job_id);

        Ok(moved)
    }

    async fn abort(&self, table_root: &Path, job_id: &str) -> errors::Result<()> {
        remove_dir_if_exists(&Self::job_dir(table_root, job_id)).await?;
        Ok(())
    }
}
