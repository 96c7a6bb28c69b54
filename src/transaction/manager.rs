use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{
    errors::{self, ErrorCodes, Errors},
    transaction::TransactionAction,
};

pub type BoxedAction = Box<dyn TransactionAction>;

/// Registry of deferred actions, grouped by transaction id.
///
/// Actions of one transaction commit in registration order. The first failure rolls every
/// action of the transaction back in reverse order, so a failed transaction leaves no
/// partial multi-table state. A transaction id is removed from the registry once it reaches
/// a terminal state.
#[derive(Debug, Default)]
pub struct TransactionManager {
    transactions: Mutex<HashMap<String, Vec<BoxedAction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, tx_id: &str, action: BoxedAction) {
        log::debug!(
            "Transaction {}: recorded action on {} segment {}",
            tx_id,
            action.transaction_table_name(),
            action.transaction_segment()
        );

        let mut transactions = self.transactions.lock().await;
        transactions.entry(tx_id.to_string()).or_default().push(action);
    }

    pub async fn pending_count(&self, tx_id: &str) -> usize {
        let transactions = self.transactions.lock().await;
        transactions.get(tx_id).map(Vec::len).unwrap_or(0)
    }

    async fn take(&self, tx_id: &str) -> errors::Result<Vec<BoxedAction>> {
        let mut transactions = self.transactions.lock().await;

        transactions.remove(tx_id).ok_or_else(|| {
            Errors::new(ErrorCodes::TransactionNotFound).with_message(tx_id.to_string())
        })
    }

    pub async fn commit_all(&self, tx_id: &str) -> errors::Result<()> {
        let mut actions = self.take(tx_id).await?;

        for index in 0..actions.len() {
            if let Err(error) = actions[index].commit().await {
                log::error!(
                    "Transaction {}: action {} of {} failed, rolling back: {}",
                    tx_id,
                    index + 1,
                    actions.len(),
                    error
                );

                Self::rollback_actions(tx_id, &mut actions).await;
                return Err(error);
            }
        }

        log::info!("Transaction {} committed ({} actions)", tx_id, actions.len());

        Ok(())
    }

    pub async fn rollback_all(&self, tx_id: &str) -> errors::Result<()> {
        let mut actions = self.take(tx_id).await?;

        Self::rollback_actions(tx_id, &mut actions).await;
        log::info!("Transaction {} rolled back ({} actions)", tx_id, actions.len());

        Ok(())
    }

    // Reverse registration order. A failing rollback does not stop the others.
    async fn rollback_actions(tx_id: &str, actions: &mut [BoxedAction]) {
        for action in actions.iter_mut().rev() {
            if let Err(e) = action.rollback().await {
                let error = Errors::new(ErrorCodes::TransactionRollbackError).with_message(format!(
                    "Transaction {}: rollback of {} segment {} failed: {}",
                    tx_id,
                    action.transaction_table_name(),
                    action.transaction_segment(),
                    e
                ));
                log::error!("{}", error);
            }
        }
    }
}
