use std::path::PathBuf;

use crate::{
    config::{DATA_FILE_EXT, FRAGMENT_EXT, INDEX_FILE_EXT},
    errors::{self, ErrorCodes, Errors},
    os::write_file_atomically,
    segment_file::{
        PartitionSpec, SegmentFile, SegmentFileStore, gen_segment_file_name, staging_dir_name,
    },
    validate::validate_task_id,
};

#[derive(Debug, serde::Serialize)]
struct IndexSidecar<'a> {
    data_file: &'a str,
    row_count: usize,
    partition: &'a [String],
}

/// Staging write path of one task.
///
/// Data files go to `<location>/<id>_<ts>.tmp/`, invisible to readers until the job commit
/// relocates them. The files written are recorded in a fragment that `close` leaves in the
/// segment's fragment area for the commit to merge.
#[derive(Debug)]
pub struct TaskFragmentWriter {
    store: SegmentFileStore,
    task_id: String,
    segment_id: String,
    timestamp: u64,
    fragment: SegmentFile,
    file_count: usize,
}

impl TaskFragmentWriter {
    pub fn new(
        store: SegmentFileStore,
        task_id: &str,
        segment_id: &str,
        timestamp: u64,
    ) -> errors::Result<Self> {
        validate_task_id(task_id)?;

        Ok(Self {
            store,
            task_id: task_id.to_string(),
            segment_id: segment_id.to_string(),
            timestamp,
            fragment: SegmentFile::default(),
            file_count: 0,
        })
    }

    fn stem(&self) -> String {
        gen_segment_file_name(&self.segment_id, self.timestamp)
    }

    fn staging_dir(&self, spec: &PartitionSpec) -> PathBuf {
        self.store
            .table_root()
            .join(&spec.location)
            .join(staging_dir_name(&self.stem()))
    }

    // Returns the data file name, or None when there was nothing to write.
    pub async fn write_partition(
        &mut self,
        spec: &PartitionSpec,
        rows: &[String],
    ) -> errors::Result<Option<String>> {
        if rows.is_empty() {
            return Ok(None);
        }

        let base_name = format!(
            "{}-{}-{}-{}",
            self.task_id, self.segment_id, self.timestamp, self.file_count
        );
        let data_file = format!("part-{}{}", base_name, DATA_FILE_EXT);
        let index_file = format!("{}{}", base_name, INDEX_FILE_EXT);
        let staging_dir = self.staging_dir(spec);

        let mut data = rows.join("\n").into_bytes();
        data.push(b'\n');
        write_file_atomically(
            &staging_dir.join(&data_file),
            &data,
            ErrorCodes::SegmentFileWriteError,
        )
        .await?;

        let sidecar = serde_json::to_vec(&IndexSidecar {
            data_file: &data_file,
            row_count: rows.len(),
            partition: &spec.values,
        })
        .map_err(|e| Errors::new(ErrorCodes::SegmentFileEncodeError).with_message(e.to_string()))?;
        write_file_atomically(
            &staging_dir.join(&index_file),
            &sidecar,
            ErrorCodes::SegmentFileWriteError,
        )
        .await?;

        self.fragment
            .add_files(spec, [data_file.clone(), index_file]);
        self.file_count += 1;

        Ok(Some(data_file))
    }

    /// Persist the fragment as `<task>.fragment`. A task that wrote nothing leaves no
    /// fragment behind.
    pub async fn close(self) -> errors::Result<SegmentFile> {
        if self.file_count == 0 {
            return Ok(self.fragment);
        }

        let data = self.store.codec().encode(&self.fragment)?;
        let path = self
            .store
            .staging_area(&staging_dir_name(&self.stem()))
            .join(format!("{}{}", self.task_id, FRAGMENT_EXT));

        write_file_atomically(&path, &data, ErrorCodes::SegmentFileWriteError).await?;

        log::debug!(
            "Task {} staged {} files for segment {}",
            self.task_id,
            self.file_count,
            self.segment_id
        );

        Ok(self.fragment)
    }
}
