use async_trait::async_trait;

use crate::errors;

/// One deferred unit of a multi-table transaction.
///
/// Only `commit` is mandatory. The other hooks default to doing nothing, so an action that
/// cannot be undone simply keeps the default `rollback`.
#[async_trait]
pub trait TransactionAction: std::fmt::Debug + Send + Sync {
    async fn commit(&mut self) -> errors::Result<()>;

    async fn rollback(&mut self) -> errors::Result<()> {
        Ok(())
    }

    // Update bookkeeping used to order actions across tables.
    fn record_update_details(
        &mut self,
        _update_time: u64,
        _segments: &[String],
        _load_as_new_segment: bool,
    ) {
    }

    // "*" means every segment of the table.
    fn transaction_segment(&self) -> String {
        "*".to_string()
    }

    fn transaction_table_name(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Committed,
    RolledBack,
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ActionState::Pending => "PENDING",
            ActionState::Committed => "COMMITTED",
            ActionState::RolledBack => "ROLLED_BACK",
        };

        write!(f, "{}", text)
    }
}
