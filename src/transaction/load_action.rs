use async_trait::async_trait;

use crate::{
    config::OVERWRITE_REPLAN_ATTEMPTS,
    errors::{self, ErrorCodes, Errors},
    ledger::{self, LoadMetadataDetails, LoadMetadataLedger, SegmentStatus},
    lock::LockHandle,
    os::remove_file_if_exists,
    segment_file::SegmentFileStore,
    transaction::{ActionState, OverwritePlan, TransactionAction},
};

// One overwrite delta as written by `apply`, kept so rollback can undo exactly that write.
#[derive(Debug, Clone)]
struct DeltaUndo {
    before: LoadMetadataDetails,
    after: LoadMetadataDetails,
    descriptor: String,
}

/// Makes one load visible: swaps the segment's ledger entry to its final details and applies
/// the overwrite deltas in the same ledger rewrite.
///
/// Owns the segment lock once handed over and releases it when it reaches a terminal state.
/// The entry is identified by segment id and load start time, so a later load that reuses
/// the id is never mistaken for this one.
#[derive(Debug)]
pub struct LoadTransactionAction {
    ledger: LoadMetadataLedger,
    store: SegmentFileStore,
    details: LoadMetadataDetails,
    overwrite: Option<OverwritePlan>,
    lock: Option<LockHandle>,
    state: ActionState,
    undo: Vec<DeltaUndo>,
    update_time: Option<u64>,
    update_segments: Vec<String>,
    load_as_new_segment: bool,
}

impl LoadTransactionAction {
    pub fn new(
        ledger: LoadMetadataLedger,
        store: SegmentFileStore,
        details: LoadMetadataDetails,
    ) -> Self {
        Self {
            ledger,
            store,
            details,
            overwrite: None,
            lock: None,
            state: ActionState::Pending,
            undo: vec![],
            update_time: None,
            update_segments: vec![],
            load_as_new_segment: true,
        }
    }

    pub fn with_overwrite(mut self, plan: OverwritePlan) -> Self {
        self.details.update_status_file_name = Some(plan.version_tag.clone());
        self.overwrite = Some(plan);
        self
    }

    pub fn with_lock(mut self, lock: LockHandle) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn details(&self) -> &LoadMetadataDetails {
        &self.details
    }

    pub fn overwrite(&self) -> Option<&OverwritePlan> {
        self.overwrite.as_ref()
    }

    pub fn update_time(&self) -> Option<u64> {
        self.update_time
    }

    fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(|lock| !lock.is_released())
    }

    fn release_lock(&self) -> errors::Result<()> {
        match &self.lock {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }

    fn apply(
        entries: &mut [LoadMetadataDetails],
        details: &LoadMetadataDetails,
        plan: Option<&OverwritePlan>,
    ) -> errors::Result<Vec<DeltaUndo>> {
        if let Some(plan) = plan
            && !plan.is_current(entries, &details.segment_id)
        {
            return Err(Errors::new(ErrorCodes::OverwriteConflict).with_message(format!(
                "Valid segments changed since overwrite version {} was planned",
                plan.version_tag
            )));
        }

        let entry = ledger::find_mut(entries, &details.segment_id).ok_or_else(|| {
            Errors::new(ErrorCodes::CommitIntegrityError).with_message(format!(
                "Segment {} has no table status entry",
                details.segment_id
            ))
        })?;

        if entry.load_start_time != details.load_start_time {
            return Err(
                Errors::new(ErrorCodes::CommitIntegrityError).with_message(format!(
                    "Segment {} belongs to the load started at {}, not {}",
                    details.segment_id, entry.load_start_time, details.load_start_time
                )),
            );
        }

        if entry.status.is_absorbing() || !entry.status.can_transition_to(details.status) {
            return Err(
                Errors::new(ErrorCodes::CommitIntegrityError).with_message(format!(
                    "Segment {} is {} in the table status",
                    details.segment_id, entry.status
                )),
            );
        }
        *entry = details.clone();

        let Some(plan) = plan else {
            return Ok(vec![]);
        };

        let mut undo = vec![];

        for segment_id in &plan.deltas.updated {
            let Some(entry) = ledger::find_mut(entries, segment_id) else {
                continue;
            };
            let before = entry.clone();

            entry.segment_file_name = Some(plan.descriptor_name(segment_id));
            entry.update_status_file_name = Some(plan.version_tag.clone());

            undo.push(DeltaUndo {
                before,
                after: entry.clone(),
                descriptor: plan.descriptor_name(segment_id),
            });
        }

        for segment_id in &plan.deltas.deleted {
            let Some(entry) = ledger::find_mut(entries, segment_id) else {
                continue;
            };
            let before = entry.clone();

            entry.transition_to(SegmentStatus::MarkedForDelete)?;
            entry.update_status_file_name = Some(plan.version_tag.clone());

            undo.push(DeltaUndo {
                before,
                after: entry.clone(),
                descriptor: plan.descriptor_name(segment_id),
            });
        }

        Ok(undo)
    }

    // Returns the overwrite descriptors no entry points at any more.
    fn revert(
        entries: &mut [LoadMetadataDetails],
        details: &LoadMetadataDetails,
        undo: &[DeltaUndo],
    ) -> errors::Result<Vec<String>> {
        let mut orphaned = vec![];

        for step in undo {
            match ledger::find_mut(entries, &step.before.segment_id) {
                // Only this action's own write is taken back, which is also the only way a
                // MARKED_FOR_DELETE entry returns to SUCCESS.
                Some(entry) if *entry == step.after => {
                    *entry = step.before.clone();
                    orphaned.push(step.descriptor.clone());
                }
                _ => log::warn!(
                    "Segment {} changed after this overwrite, leaving it as is",
                    step.before.segment_id
                ),
            }
        }

        if let Some(entry) = ledger::find_mut(entries, &details.segment_id)
            && entry.load_start_time == details.load_start_time
            && !entry.status.is_absorbing()
        {
            entry.transition_to(SegmentStatus::LoadFailure)?;
        }

        Ok(orphaned)
    }

    // Recompute the overwrite drops against the current ledger.
    async fn replan(&mut self) -> errors::Result<()> {
        let Some(plan) = &self.overwrite else {
            return Ok(());
        };
        let partitions = plan.partitions.clone();

        let entries = self.ledger.read().await?;
        let plan =
            OverwritePlan::compute(&self.store, &entries, &self.details.segment_id, partitions)
                .await?;

        self.details.update_status_file_name = Some(plan.version_tag.clone());
        self.overwrite = Some(plan);

        Ok(())
    }

    async fn remove_descriptor(&self, name: &str) -> errors::Result<()> {
        remove_file_if_exists(&self.store.descriptor_path(name)).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionAction for LoadTransactionAction {
    async fn commit(&mut self) -> errors::Result<()> {
        if self.state != ActionState::Pending {
            return Err(
                Errors::new(ErrorCodes::InvalidTransactionState).with_message(format!(
                    "Load of segment {} is already {}",
                    self.details.segment_id, self.state
                )),
            );
        }

        if self.details.status.is_absorbing() {
            return Err(
                Errors::new(ErrorCodes::CommitIntegrityError).with_message(format!(
                    "Failed to commit transaction: segment {} is {}",
                    self.details.segment_id, self.details.status
                )),
            );
        }

        let mut replans = 0;
        let undo = loop {
            let details = &self.details;
            let plan = self.overwrite.as_ref();
            let result = self
                .ledger
                .update(|entries| Self::apply(entries, details, plan))
                .await;

            match result {
                Ok(undo) => break undo,
                Err(e) if e.is(ErrorCodes::OverwriteConflict) => {
                    if replans >= OVERWRITE_REPLAN_ATTEMPTS {
                        return Err(Errors::new(ErrorCodes::CommitIntegrityError).with_message(
                            format!(
                                "Overwrite of segment {} gave up after {} replans: {}",
                                self.details.segment_id, replans, e
                            ),
                        ));
                    }

                    replans += 1;
                    log::info!(
                        "Table {} changed under the overwrite of segment {}, recomputing drops",
                        self.ledger.table_name(),
                        self.details.segment_id
                    );
                    self.replan().await?;
                }
                Err(e) => return Err(e),
            }
        };

        self.undo = undo;
        self.state = ActionState::Committed;

        let (updated, deleted) = self
            .overwrite
            .as_ref()
            .map(|plan| (plan.deltas.updated.len(), plan.deltas.deleted.len()))
            .unwrap_or_default();
        log::info!(
            "Committed segment {} of {} as {} ({} updated, {} deleted by overwrite)",
            self.details.segment_id,
            self.ledger.table_name(),
            self.details.status,
            updated,
            deleted
        );

        // The ledger swap is durable at this point; a release failure must not undo it.
        if let Err(e) = self.release_lock() {
            log::error!(
                "Segment {} committed but its lock was not released: {}",
                self.details.segment_id,
                e
            );
        }

        Ok(())
    }

    async fn rollback(&mut self) -> errors::Result<()> {
        if self.state == ActionState::RolledBack {
            return Ok(());
        }

        let segment_id = self.details.segment_id.clone();

        // Neither committed nor locked: the load failed before reaching the table status,
        // and its id may already belong to a newer load.
        let committed = self.state == ActionState::Committed;
        if !committed && !self.holds_lock() {
            self.state = ActionState::RolledBack;
            log::debug!("Load of segment {} left nothing to roll back", segment_id);
            return Ok(());
        }

        let mut first_error: Option<Errors> = None;

        let details = &self.details;
        let undo = &self.undo;
        match self
            .ledger
            .update(|entries| Self::revert(entries, details, undo))
            .await
        {
            Ok(orphaned) => {
                for name in orphaned {
                    if let Err(e) = self.remove_descriptor(&name).await {
                        log::warn!("Failed to remove overwrite descriptor {}: {}", name, e);
                    }
                }
            }
            Err(e) => {
                log::warn!("Failed to restore table status of segment {}: {}", segment_id, e);
                first_error.get_or_insert(e);
            }
        }

        // drops of an overwrite that never reached the table status
        if !committed && let Some(plan) = &self.overwrite {
            for touched in plan.touched_segments() {
                let name = plan.descriptor_name(touched);
                if let Err(e) = self.remove_descriptor(&name).await {
                    log::warn!("Failed to remove overwrite descriptor {}: {}", name, e);
                }
            }
        }

        if let Some(segment_file_name) = &self.details.segment_file_name
            && let Err(e) = self.store.delete_segment(segment_file_name).await
        {
            log::warn!("Failed to delete files of segment {}: {}", segment_id, e);
            first_error.get_or_insert(e);
        }

        if let Err(e) = self.release_lock() {
            first_error.get_or_insert(e);
        }

        self.details.status = SegmentStatus::LoadFailure;
        self.state = ActionState::RolledBack;

        match first_error {
            None => {
                log::info!("Rolled back load of segment {}", segment_id);
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    fn record_update_details(
        &mut self,
        update_time: u64,
        segments: &[String],
        load_as_new_segment: bool,
    ) {
        self.update_time = Some(update_time);
        self.update_segments = segments.to_vec();
        self.load_as_new_segment = load_as_new_segment;
    }

    fn transaction_segment(&self) -> String {
        self.details.segment_id.clone()
    }

    fn transaction_table_name(&self) -> String {
        self.ledger.table_name().to_string()
    }
}
