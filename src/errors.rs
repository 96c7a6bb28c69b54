#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCodes {
    // lock
    LockTimeout,
    LockAcquireError,
    LockReleaseError,

    // ledger (table status)
    LedgerReadError,
    LedgerDecodeError,
    LedgerEncodeError,
    LedgerWriteError,
    CommitIntegrityError,
    OverwriteConflict,

    // segment files
    SegmentFileReadError,
    SegmentFileDecodeError,
    SegmentFileEncodeError,
    SegmentFileWriteError,
    FragmentEncodeError,
    FragmentDecodeError,
    PartialWriteError,
    FileDeleteError,
    DirectoryCreateError,

    // transaction
    TransactionNotFound,
    TransactionRollbackError,
    InvalidTransactionState,

    // job lifecycle
    InvalidJobState,
    JobNotFound,
    PreStatusUpdateRejected,

    // table catalog
    TableNotFound,
    TableAlreadyExists,
    TableCreationError,
    TableListFailed,
    TableGetFailed,
    TableNameIsEmpty,
    TableNameTooLong,
    TableNameIsInvalid,
    SegmentIdIsInvalid,
    PartitionIsInvalid,
    TaskIdIsInvalid,
}

impl std::fmt::Display for ErrorCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCodes::LockTimeout => "Lock Timeout",
            ErrorCodes::LockAcquireError => "Lock Acquire Error",
            ErrorCodes::LockReleaseError => "Lock Release Error",
            ErrorCodes::LedgerReadError => "Ledger Read Error",
            ErrorCodes::LedgerDecodeError => "Ledger Decode Error",
            ErrorCodes::LedgerEncodeError => "Ledger Encode Error",
            ErrorCodes::LedgerWriteError => "Ledger Write Error",
            ErrorCodes::CommitIntegrityError => "Commit Integrity Error",
            ErrorCodes::OverwriteConflict => "Overwrite Conflict",
            ErrorCodes::SegmentFileReadError => "Segment File Read Error",
            ErrorCodes::SegmentFileDecodeError => "Segment File Decode Error",
            ErrorCodes::SegmentFileEncodeError => "Segment File Encode Error",
            ErrorCodes::SegmentFileWriteError => "Segment File Write Error",
            ErrorCodes::FragmentEncodeError => "Fragment Encode Error",
            ErrorCodes::FragmentDecodeError => "Fragment Decode Error",
            ErrorCodes::PartialWriteError => "Partial Write Error",
            ErrorCodes::FileDeleteError => "File Delete Error",
            ErrorCodes::DirectoryCreateError => "Directory Create Error",
            ErrorCodes::TransactionNotFound => "Transaction Not Found",
            ErrorCodes::TransactionRollbackError => "Transaction Rollback Error",
            ErrorCodes::InvalidTransactionState => "Invalid Transaction State",
            ErrorCodes::InvalidJobState => "Invalid Job State",
            ErrorCodes::JobNotFound => "Job Not Found",
            ErrorCodes::PreStatusUpdateRejected => "Pre Status Update Rejected",
            ErrorCodes::TableNotFound => "Table Not Found",
            ErrorCodes::TableAlreadyExists => "Table Already Exists",
            ErrorCodes::TableCreationError => "Table Creation Error",
            ErrorCodes::TableListFailed => "Table List Failed",
            ErrorCodes::TableGetFailed => "Table Get Failed",
            ErrorCodes::TableNameIsEmpty => "Table Name Is Empty",
            ErrorCodes::TableNameTooLong => "Table Name Too Long",
            ErrorCodes::TableNameIsInvalid => "Table Name Is Invalid",
            ErrorCodes::SegmentIdIsInvalid => "Segment ID Is Invalid",
            ErrorCodes::PartitionIsInvalid => "Partition Is Invalid",
            ErrorCodes::TaskIdIsInvalid => "Task ID Is Invalid",
        };

        write!(f, "{}", text)
    }
}

#[derive(Debug)]
pub struct Errors {
    pub code: ErrorCodes,
    pub message: Option<String>,
}

impl Errors {
    pub fn new(code: ErrorCodes) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }

    pub fn is(&self, code: ErrorCodes) -> bool {
        self.code == code
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Errors {}

pub type Result<T> = std::result::Result<T, Errors>;
