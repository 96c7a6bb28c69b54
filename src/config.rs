use std::{sync::LazyLock, time::Duration};

pub const HTTP_DEFAULT_PORT: u16 = 53100;

pub const TABLES_DIRECTORY: &str = "tables";
pub const METADATA_DIRECTORY: &str = "Metadata";
pub const SEGMENTS_DIRECTORY: &str = "segments";
pub const LOCK_FILES_DIRECTORY: &str = "LockFiles";
pub const TEMPORARY_DIRECTORY: &str = "_temporary";

pub const TABLE_STATUS_FILE: &str = "tablestatus";
pub const TABLE_STATUS_LOCK: &str = "tablestatus.lock";

pub const SEGMENT_EXT: &str = ".segment";
pub const STAGING_EXT: &str = ".tmp";
pub const FRAGMENT_EXT: &str = ".fragment";
pub const DATA_FILE_EXT: &str = ".data";
pub const INDEX_FILE_EXT: &str = ".index";

pub const TABLE_NAME_MAX_SIZE: usize = 128;
pub const SEGMENT_ID_MAX_SIZE: usize = 64;

pub const LOCK_DEFAULT_RETRIES: u32 = 3;
pub const LOCK_DEFAULT_BACKOFF_MS: u64 = 100;

// table status rewrites are short; they get a longer budget than segment locks
pub const TABLE_STATUS_LOCK_RETRIES: u32 = 50;
pub const TABLE_STATUS_LOCK_BACKOFF_MS: u64 = 20;

// rounds of "pick next free id, lock it, insert" before giving up on auto-allocation
pub const SEGMENT_ALLOCATION_ATTEMPTS: u32 = 5;

// times an overwrite recomputes its partition drops after the table changed underneath it
pub const OVERWRITE_REPLAN_ATTEMPTS: u32 = 3;

pub static DATA_DIR: LazyLock<String> =
    LazyLock::new(|| std::env::var("SEGCOMMIT_DATA_DIR").unwrap_or_else(|_| "data".to_string()));

pub static HTTP_PORT: LazyLock<u16> = LazyLock::new(|| {
    std::env::var("SEGCOMMIT_HTTP_PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(HTTP_DEFAULT_PORT)
});

pub static LOCK_RETRIES: LazyLock<u32> = LazyLock::new(|| {
    std::env::var("SEGCOMMIT_LOCK_RETRIES")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(LOCK_DEFAULT_RETRIES)
});

pub static LOCK_BACKOFF_MS: LazyLock<u64> = LazyLock::new(|| {
    std::env::var("SEGCOMMIT_LOCK_BACKOFF_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(LOCK_DEFAULT_BACKOFF_MS)
});

// "memory" or "file"
pub static LOCK_PROVIDER: LazyLock<String> = LazyLock::new(|| {
    std::env::var("SEGCOMMIT_LOCK_PROVIDER").unwrap_or_else(|_| "file".to_string())
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

// Settings threaded through the commit path. Built once from the environment in main,
// built directly in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitConfig {
    pub segment_lock: RetryPolicy,
    pub table_status_lock: RetryPolicy,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            segment_lock: RetryPolicy::new(
                LOCK_DEFAULT_RETRIES,
                Duration::from_millis(LOCK_DEFAULT_BACKOFF_MS),
            ),
            table_status_lock: RetryPolicy::new(
                TABLE_STATUS_LOCK_RETRIES,
                Duration::from_millis(TABLE_STATUS_LOCK_BACKOFF_MS),
            ),
        }
    }
}

impl CommitConfig {
    pub fn from_env() -> Self {
        Self {
            segment_lock: RetryPolicy::new(*LOCK_RETRIES, Duration::from_millis(*LOCK_BACKOFF_MS)),
            ..Default::default()
        }
    }
}
