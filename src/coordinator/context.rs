/// Everything a job's setup, commit and abort need to know about the load.
///
/// Passed explicitly to every coordinator call. `segment_id` is filled in by `setup_job`
/// when the caller leaves it unset.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoadContext {
    pub table_name: String,
    #[serde(default)]
    pub segment_id: Option<String>,
    pub fact_timestamp: u64,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub job_id: String,
}

impl LoadContext {
    pub fn new(table_name: &str, job_id: &str, fact_timestamp: u64) -> Self {
        Self {
            table_name: table_name.to_string(),
            segment_id: None,
            fact_timestamp,
            overwrite: false,
            transaction_id: None,
            job_id: job_id.to_string(),
        }
    }

    pub fn with_segment_id(mut self, segment_id: &str) -> Self {
        self.segment_id = Some(segment_id.to_string());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }
}

// JOB_SETUP -> TASKS_RUNNING -> COMMITTING -> {SUCCESS, FAILED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum JobState {
    #[serde(rename = "job_setup")]
    JobSetup,
    #[serde(rename = "tasks_running")]
    TasksRunning,
    #[serde(rename = "committing")]
    Committing,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            JobState::JobSetup => "JOB_SETUP",
            JobState::TasksRunning => "TASKS_RUNNING",
            JobState::Committing => "COMMITTING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
        };

        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    // the ledger now shows the segment as SUCCESS
    Committed {
        segment_id: String,
        data_size: u64,
        index_size: u64,
    },
    // recorded under a transaction id; visible once the transaction commits
    Deferred {
        segment_id: String,
        transaction_id: String,
    },
    // no task produced rows; the segment is recorded as LOAD_FAILURE
    NoData { segment_id: String },
}
