use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::{
        FRAGMENT_EXT, INDEX_FILE_EXT, LOCK_FILES_DIRECTORY, METADATA_DIRECTORY,
        SEGMENT_EXT, SEGMENTS_DIRECTORY, STAGING_EXT, TEMPORARY_DIRECTORY,
    },
    errors::{self, ErrorCodes, Errors},
    ledger::LoadMetadataDetails,
    os::{path_exists, remove_dir_if_exists, remove_file_if_exists, write_file_atomically},
    validate::validate_partition_values,
};

pub mod encode;
pub mod writer;

use encode::{FragmentBincodeCodec, SegmentFragmentCodec};

pub use writer::TaskFragmentWriter;

/// A partition directory relative to the table root plus the `column=value` pairs it holds.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PartitionSpec {
    pub location: String,
    pub values: Vec<String>,
}

impl PartitionSpec {
    // An empty value list is the table root of an unpartitioned table.
    pub fn new(values: Vec<String>) -> errors::Result<Self> {
        validate_partition_values(&values)?;

        Ok(Self {
            location: values.join("/"),
            values,
        })
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum FolderStatus {
    #[serde(rename = "success")]
    Success,
    // superseded by an overwrite; files stay until the reclaimer gets to them
    #[serde(rename = "marked_for_delete")]
    MarkedForDelete,
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct FolderDetails {
    pub files: BTreeSet<String>,
    pub partitions: Vec<String>,
    pub status: FolderStatus,
    pub relative: bool,
}

/// Segment descriptor: partition location -> the files of this segment stored there.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct SegmentFile {
    pub locations: BTreeMap<String, FolderDetails>,
}

impl SegmentFile {
    pub fn add_files(&mut self, spec: &PartitionSpec, files: impl IntoIterator<Item = String>) {
        let details = self
            .locations
            .entry(spec.location.clone())
            .or_insert_with(|| FolderDetails {
                files: BTreeSet::new(),
                partitions: spec.values.clone(),
                status: FolderStatus::Success,
                relative: true,
            });

        details.files.extend(files);
    }

    // Union. A location live on either side stays live.
    pub fn merge(&mut self, other: SegmentFile) {
        for (location, details) in other.locations {
            match self.locations.get_mut(&location) {
                Some(existing) => {
                    existing.files.extend(details.files);
                    if details.status == FolderStatus::Success {
                        existing.status = FolderStatus::Success;
                    }
                }
                None => {
                    self.locations.insert(location, details);
                }
            }
        }
    }

    pub fn live_locations(&self) -> impl Iterator<Item = (&String, &FolderDetails)> {
        self.locations
            .iter()
            .filter(|(_, details)| details.status == FolderStatus::Success)
    }

    pub fn partition_specs(&self) -> Vec<PartitionSpec> {
        self.live_locations()
            .map(|(location, details)| PartitionSpec {
                location: location.clone(),
                values: details.partitions.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.live_locations()
            .all(|(_, details)| details.files.is_empty())
    }
}

// Segments touched by an overwrite: `updated` keep some partitions under a new descriptor,
// `deleted` kept none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropOutcome {
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl DropOutcome {
    pub fn extend(&mut self, other: DropOutcome) {
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

// `<segment_id>_<timestamp>`: the stem shared by the descriptor and the staging directories.
pub fn gen_segment_file_name(segment_id: &str, timestamp: u64) -> String {
    format!("{}_{}", segment_id, timestamp)
}

pub fn descriptor_file_name(stem: &str) -> String {
    format!("{}{}", stem, SEGMENT_EXT)
}

pub fn staging_dir_name(stem: &str) -> String {
    format!("{}{}", stem, STAGING_EXT)
}

#[derive(Debug, Clone)]
pub struct SegmentFileStore {
    table_root: PathBuf,
    segments_dir: PathBuf,
    codec: Arc<dyn SegmentFragmentCodec>,
}

impl SegmentFileStore {
    pub fn new(table_root: PathBuf) -> Self {
        Self::with_codec(table_root, Arc::new(FragmentBincodeCodec))
    }

    pub fn with_codec(table_root: PathBuf, codec: Arc<dyn SegmentFragmentCodec>) -> Self {
        let segments_dir = table_root.join(METADATA_DIRECTORY).join(SEGMENTS_DIRECTORY);

        Self {
            table_root,
            segments_dir,
            codec,
        }
    }

    pub fn table_root(&self) -> &Path {
        &self.table_root
    }

    pub fn segments_dir(&self) -> &Path {
        &self.segments_dir
    }

    pub(crate) fn codec(&self) -> &Arc<dyn SegmentFragmentCodec> {
        &self.codec
    }

    pub fn descriptor_path(&self, segment_file_name: &str) -> PathBuf {
        self.segments_dir.join(segment_file_name)
    }

    // Where the tasks of one load leave their fragments.
    pub fn staging_area(&self, staging_dir_name: &str) -> PathBuf {
        self.segments_dir.join(staging_dir_name)
    }

    pub async fn read_segment_file(
        &self,
        segment_file_name: &str,
    ) -> errors::Result<Option<SegmentFile>> {
        let path = self.descriptor_path(segment_file_name);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Errors::new(ErrorCodes::SegmentFileReadError)
                    .with_message(format!("Failed to read {:?}: {}", path, e)));
            }
        };

        let segment_file = serde_json::from_slice(&data).map_err(|e| {
            Errors::new(ErrorCodes::SegmentFileDecodeError)
                .with_message(format!("Failed to decode {}: {}", segment_file_name, e))
        })?;

        Ok(Some(segment_file))
    }

    pub async fn write_segment_file(
        &self,
        segment_file_name: &str,
        segment_file: &SegmentFile,
    ) -> errors::Result<()> {
        let data = serde_json::to_vec_pretty(segment_file).map_err(|e| {
            Errors::new(ErrorCodes::SegmentFileEncodeError).with_message(e.to_string())
        })?;

        write_file_atomically(
            &self.descriptor_path(segment_file_name),
            &data,
            ErrorCodes::SegmentFileWriteError,
        )
        .await
    }

    /// Union every task fragment under `staging_area` into the canonical descriptor
    /// `segment_file_name`, then drop the fragments.
    ///
    /// Returns `None` when no task produced rows. A descriptor already sitting under
    /// `segment_file_name` is not data of this load and never stands in for fragments.
    pub async fn merge_fragments(
        &self,
        staging_area: &Path,
        segment_file_name: &str,
    ) -> errors::Result<Option<SegmentFile>> {
        let fragments = self.read_fragments(staging_area).await?;

        if fragments.is_empty() {
            return Ok(None);
        }

        let mut merged = SegmentFile::default();
        for fragment in fragments {
            merged.merge(fragment);
        }

        if merged.is_empty() {
            return Ok(None);
        }

        self.write_segment_file(segment_file_name, &merged).await?;

        if let Err(e) = remove_dir_if_exists(staging_area).await {
            // the descriptor is written; stale fragments only cost disk space
            log::warn!("Failed to remove fragment area {:?}: {}", staging_area, e);
        }

        log::info!(
            "Merged fragments into {} ({} locations)",
            segment_file_name,
            merged.locations.len()
        );

        Ok(Some(merged))
    }

    async fn read_fragments(&self, staging_area: &Path) -> errors::Result<Vec<SegmentFile>> {
        let read_err = |e: std::io::Error| {
            Errors::new(ErrorCodes::SegmentFileReadError)
                .with_message(format!("Failed to read fragments in {:?}: {}", staging_area, e))
        };

        let mut dir_entries = match tokio::fs::read_dir(staging_area).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(read_err(e)),
        };

        let mut paths = vec![];
        while let Some(entry) = dir_entries.next_entry().await.map_err(read_err)? {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|name| name.to_str())
                && name.ends_with(FRAGMENT_EXT)
            {
                paths.push(path);
            }
        }
        paths.sort();

        let mut fragments = Vec::with_capacity(paths.len());
        for path in paths {
            let data = tokio::fs::read(&path).await.map_err(read_err)?;
            fragments.push(self.codec.decode(&data)?);
        }

        Ok(fragments)
    }

    /// Move the staged data files of `segment_file` into their partition directories.
    ///
    /// Safe to repeat: a file already at its destination is skipped, and a missing staging
    /// directory means the location was relocated by an earlier attempt.
    pub async fn move_from_temp(
        &self,
        segment_file: &SegmentFile,
        staging_dir_name: &str,
    ) -> errors::Result<usize> {
        let mut moved = 0;

        for (location, details) in segment_file.live_locations() {
            let partition_dir = self.table_root.join(location);
            let staging_dir = partition_dir.join(staging_dir_name);

            for file in &details.files {
                let source = staging_dir.join(file);
                let target = partition_dir.join(file);

                if path_exists(&target).await {
                    // retried commit: a leftover staged copy is a duplicate of the target
                    remove_file_if_exists(&source).await?;
                    continue;
                }

                tokio::fs::rename(&source, &target).await.map_err(|e| {
                    Errors::new(ErrorCodes::PartialWriteError).with_message(format!(
                        "Failed to move {:?} to {:?} after {} files: {}",
                        source, target, moved, e
                    ))
                })?;
                moved += 1;
            }

            if let Err(e) = remove_dir_if_exists(&staging_dir).await {
                log::warn!("Failed to remove staging directory {:?}: {}", staging_dir, e);
            }
        }

        log::debug!("Moved {} files out of {}", moved, staging_dir_name);

        Ok(moved)
    }

    /// Rewrite `segment`'s partition map without the partitions an overwrite replaces.
    ///
    /// The result goes to a new descriptor `<id>_<version_tag>.segment`; the old one stays
    /// readable until the ledger swap points at the new one.
    pub async fn drop_partitions(
        &self,
        segment: &LoadMetadataDetails,
        partitions_to_remove: &[PartitionSpec],
        version_tag: &str,
    ) -> errors::Result<DropOutcome> {
        let Some(segment_file_name) = &segment.segment_file_name else {
            return Ok(DropOutcome::default());
        };

        let mut segment_file = self
            .read_segment_file(segment_file_name)
            .await?
            .ok_or_else(|| {
                Errors::new(ErrorCodes::SegmentFileReadError).with_message(format!(
                    "Descriptor {} of segment {} is missing",
                    segment_file_name, segment.segment_id
                ))
            })?;

        let mut dropped = 0;
        for spec in partitions_to_remove {
            if let Some(details) = segment_file.locations.get_mut(&spec.location)
                && details.status == FolderStatus::Success
            {
                details.status = FolderStatus::MarkedForDelete;
                dropped += 1;
            }
        }

        if dropped == 0 {
            return Ok(DropOutcome::default());
        }

        let new_name =
            descriptor_file_name(&format!("{}_{}", segment.segment_id, version_tag));
        self.write_segment_file(&new_name, &segment_file).await?;

        let mut outcome = DropOutcome::default();
        if segment_file.live_locations().next().is_none() {
            outcome.deleted.push(segment.segment_id.clone());
        } else {
            outcome.updated.push(segment.segment_id.clone());
        }

        log::info!(
            "Dropped {} partitions from segment {} (version {})",
            dropped,
            segment.segment_id,
            version_tag
        );

        Ok(outcome)
    }

    pub async fn read_partition_specs(
        &self,
        segment_file_name: &str,
    ) -> errors::Result<Vec<PartitionSpec>> {
        let segment_file = self
            .read_segment_file(segment_file_name)
            .await?
            .ok_or_else(|| {
                Errors::new(ErrorCodes::SegmentFileReadError)
                    .with_message(format!("Descriptor {} is missing", segment_file_name))
            })?;

        Ok(segment_file.partition_specs())
    }

    // (data_size, index_size) of the live, relocated files.
    pub async fn segment_sizes(&self, segment_file: &SegmentFile) -> errors::Result<(u64, u64)> {
        let mut data_size = 0u64;
        let mut index_size = 0u64;

        for (location, details) in segment_file.live_locations() {
            for file in &details.files {
                let path = self.table_root.join(location).join(file);
                let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                    Errors::new(ErrorCodes::SegmentFileReadError)
                        .with_message(format!("Failed to stat {:?}: {}", path, e))
                })?;

                if file.ends_with(INDEX_FILE_EXT) {
                    index_size += metadata.len();
                } else {
                    data_size += metadata.len();
                }
            }
        }

        Ok((data_size, index_size))
    }

    // Remove a segment's files and its descriptor. Missing files are fine.
    pub async fn delete_segment(&self, segment_file_name: &str) -> errors::Result<()> {
        if let Some(segment_file) = self.read_segment_file(segment_file_name).await? {
            for (location, details) in &segment_file.locations {
                for file in &details.files {
                    remove_file_if_exists(&self.table_root.join(location).join(file)).await?;
                }
            }
        }

        remove_file_if_exists(&self.descriptor_path(segment_file_name)).await?;

        Ok(())
    }

    // Remove the fragment area and every `<location>/<staging_dir_name>` directory of a load.
    pub async fn cleanup_staging(&self, staging_dir_name: &str) -> errors::Result<usize> {
        let mut removed = 0;

        if remove_dir_if_exists(&self.staging_area(staging_dir_name)).await? {
            removed += 1;
        }

        let read_err = |e: std::io::Error| {
            Errors::new(ErrorCodes::FileDeleteError)
                .with_message(format!("Failed to scan table directory: {}", e))
        };

        let mut pending = vec![self.table_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut dir_entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(read_err(e)),
            };

            while let Some(entry) = dir_entries.next_entry().await.map_err(read_err)? {
                let file_type = entry.file_type().await.map_err(read_err)?;
                if !file_type.is_dir() {
                    continue;
                }

                let name = entry.file_name();
                let name = name.to_string_lossy();

                if name == staging_dir_name {
                    if remove_dir_if_exists(&entry.path()).await? {
                        removed += 1;
                    }
                } else if dir == self.table_root
                    && (name == METADATA_DIRECTORY
                        || name == LOCK_FILES_DIRECTORY
                        || name == TEMPORARY_DIRECTORY)
                {
                    continue;
                } else {
                    pending.push(entry.path());
                }
            }
        }

        Ok(removed)
    }
}
