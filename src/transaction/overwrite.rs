use std::collections::BTreeMap;

use crate::{
    errors,
    ledger::{self, LoadMetadataDetails},
    os::now_millis,
    segment_file::{DropOutcome, PartitionSpec, SegmentFileStore, descriptor_file_name},
};

/// Partitions an overwriting load replaces, and the drops computed for them against one
/// ledger snapshot.
///
/// `base` maps every other valid segment to its descriptor as that snapshot saw them. The
/// deltas are only correct for a ledger whose valid segments still match `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverwritePlan {
    pub partitions: Vec<PartitionSpec>,
    pub version_tag: String,
    pub deltas: DropOutcome,
    pub base: BTreeMap<String, Option<String>>,
}

// `<millis>-<segment id>`. Two overwrites in the same millisecond still differ, the loading
// segment being locked by exactly one job.
pub fn overwrite_version_tag(segment_id: &str) -> String {
    format!("{}-{}", now_millis(), segment_id)
}

fn other_valid_segments(
    entries: &[LoadMetadataDetails],
    segment_id: &str,
) -> BTreeMap<String, Option<String>> {
    ledger::valid_segments(entries)
        .into_iter()
        .filter(|entry| entry.segment_id != segment_id)
        .map(|entry| (entry.segment_id.clone(), entry.segment_file_name.clone()))
        .collect()
}

impl OverwritePlan {
    /// Drop `partitions` from every valid segment of `entries` except `segment_id` itself.
    pub async fn compute(
        store: &SegmentFileStore,
        entries: &[LoadMetadataDetails],
        segment_id: &str,
        partitions: Vec<PartitionSpec>,
    ) -> errors::Result<Self> {
        let version_tag = overwrite_version_tag(segment_id);
        let mut deltas = DropOutcome::default();

        for segment in ledger::valid_segments(entries) {
            if segment.segment_id == segment_id {
                continue;
            }
            deltas.extend(
                store
                    .drop_partitions(segment, &partitions, &version_tag)
                    .await?,
            );
        }

        Ok(Self {
            base: other_valid_segments(entries, segment_id),
            partitions,
            version_tag,
            deltas,
        })
    }

    pub fn is_current(&self, entries: &[LoadMetadataDetails], segment_id: &str) -> bool {
        other_valid_segments(entries, segment_id) == self.base
    }

    // Descriptor the drop wrote for `segment_id`.
    pub fn descriptor_name(&self, segment_id: &str) -> String {
        descriptor_file_name(&format!("{}_{}", segment_id, self.version_tag))
    }

    pub fn touched_segments(&self) -> impl Iterator<Item = &String> {
        self.deltas.updated.iter().chain(self.deltas.deleted.iter())
    }
}
