use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    errors::{self, ErrorCodes, Errors},
    ledger::LoadMetadataDetails,
    segment_file::PartitionSpec,
};

/// Fired after a load's files are in place and before its ledger entry turns visible.
#[derive(Debug, Clone)]
pub struct PreStatusUpdateEvent {
    pub table_name: String,
    pub segment_id: String,
    pub segment_file_name: String,
    pub partitions: Vec<PartitionSpec>,
    pub details: LoadMetadataDetails,
}

// Hook for the index/pruning layer. An error aborts the commit.
#[async_trait]
pub trait PreStatusUpdateListener: std::fmt::Debug + Send + Sync {
    async fn on_pre_status_update(&self, event: &PreStatusUpdateEvent) -> errors::Result<()>;
}

#[derive(Debug, Default)]
pub struct ListenerBus {
    listeners: RwLock<Vec<Arc<dyn PreStatusUpdateListener>>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, listener: Arc<dyn PreStatusUpdateListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    // Listeners run in registration order; the first error stops the rest.
    pub async fn fire(&self, event: &PreStatusUpdateEvent) -> errors::Result<()> {
        let listeners = self.listeners.read().await.clone();

        for listener in listeners {
            listener.on_pre_status_update(event).await.map_err(|e| {
                Errors::new(ErrorCodes::PreStatusUpdateRejected).with_message(format!(
                    "Listener {:?} rejected segment {}: {}",
                    listener, event.segment_id, e
                ))
            })?;
        }

        Ok(())
    }
}
