use crate::errors::{self, ErrorCodes, Errors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SegmentStatus {
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "marked_for_delete")]
    MarkedForDelete,
    #[serde(rename = "load_failure")]
    LoadFailure,
}

impl SegmentStatus {
    // Nothing leaves these two.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, SegmentStatus::MarkedForDelete | SegmentStatus::LoadFailure)
    }

    // IN_PROGRESS -> SUCCESS -> {MARKED_FOR_DELETE, LOAD_FAILURE}
    pub fn can_transition_to(&self, next: SegmentStatus) -> bool {
        if *self == next {
            return true;
        }

        match self {
            SegmentStatus::InProgress => true,
            SegmentStatus::Success => next.is_absorbing(),
            SegmentStatus::MarkedForDelete | SegmentStatus::LoadFailure => false,
        }
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SegmentStatus::InProgress => "IN_PROGRESS",
            SegmentStatus::Success => "SUCCESS",
            SegmentStatus::MarkedForDelete => "MARKED_FOR_DELETE",
            SegmentStatus::LoadFailure => "LOAD_FAILURE",
        };

        write!(f, "{}", text)
    }
}

/// One table status entry. The ledger holds exactly one per segment id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoadMetadataDetails {
    pub segment_id: String,
    pub status: SegmentStatus,
    pub load_start_time: u64,
    #[serde(default)]
    pub load_end_time: Option<u64>,
    #[serde(default)]
    pub data_size: u64,
    #[serde(default)]
    pub index_size: u64,
    // canonical descriptor, e.g. `3_1000.segment`
    #[serde(default)]
    pub segment_file_name: Option<String>,
    // version tag of the last overwrite that rewrote this segment's partition map
    #[serde(default)]
    pub update_status_file_name: Option<String>,
}

impl LoadMetadataDetails {
    pub fn new_in_progress(segment_id: &str, load_start_time: u64) -> Self {
        Self {
            segment_id: segment_id.to_string(),
            status: SegmentStatus::InProgress,
            load_start_time,
            load_end_time: None,
            data_size: 0,
            index_size: 0,
            segment_file_name: None,
            update_status_file_name: None,
        }
    }

    pub fn transition_to(&mut self, next: SegmentStatus) -> errors::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(
                Errors::new(ErrorCodes::CommitIntegrityError).with_message(format!(
                    "Segment {} cannot move from {} to {}",
                    self.segment_id, self.status, next
                )),
            );
        }

        self.status = next;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.status == SegmentStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use SegmentStatus::*;

        assert!(InProgress.can_transition_to(Success));
        assert!(InProgress.can_transition_to(LoadFailure));
        assert!(Success.can_transition_to(MarkedForDelete));
        assert!(Success.can_transition_to(LoadFailure));
        assert!(!Success.can_transition_to(InProgress));
        assert!(!LoadFailure.can_transition_to(Success));
        assert!(!LoadFailure.can_transition_to(MarkedForDelete));
        assert!(!MarkedForDelete.can_transition_to(Success));
        assert!(MarkedForDelete.can_transition_to(MarkedForDelete));
    }

    #[test]
    fn test_transition_to_rejects_leaving_failure() {
        let mut details = LoadMetadataDetails::new_in_progress("3", 1000);
        details.transition_to(SegmentStatus::LoadFailure).unwrap();

        let err = details.transition_to(SegmentStatus::Success).unwrap_err();
        assert!(err.is(ErrorCodes::CommitIntegrityError));
        assert_eq!(details.status, SegmentStatus::LoadFailure);
    }

    #[test]
    fn test_details_json_shape() {
        let details = LoadMetadataDetails::new_in_progress("3", 1000);
        let json = serde_json::to_value(&details).unwrap();

        assert_eq!(json["segment_id"], "3");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["load_start_time"], 1000);

        // older entries without the optional fields still load
        let parsed: LoadMetadataDetails = serde_json::from_str(
            r#"{"segment_id":"1","status":"success","load_start_time":5}"#,
        )
        .unwrap();
        assert_eq!(parsed.data_size, 0);
        assert!(parsed.segment_file_name.is_none());
    }
}
