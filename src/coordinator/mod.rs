use std::sync::Arc;

use crate::{
    config::{CommitConfig, SEGMENT_ALLOCATION_ATTEMPTS},
    errors::{self, ErrorCodes, Errors},
    ledger::{self, LoadMetadataDetails, LoadMetadataLedger, SegmentStatus},
    lock::{LockHandle, SegmentLock},
    os::now_millis,
    segment_file::{
        SegmentFileStore, descriptor_file_name, gen_segment_file_name, staging_dir_name,
    },
    table::TableHandle,
    transaction::{LoadTransactionAction, OverwritePlan, TransactionAction, TransactionManager},
    validate::validate_segment_id,
};

pub mod context;
pub mod listener;
pub mod promoter;

pub use context::{CommitOutcome, JobState, LoadContext};
pub use listener::{ListenerBus, PreStatusUpdateEvent, PreStatusUpdateListener};
pub use promoter::{JobOutputPromoter, TemporaryDirPromoter};

/// Process-wide collaborators shared by every job's coordinator.
#[derive(Debug, Clone)]
pub struct CommitServices {
    pub lock: SegmentLock,
    pub transactions: Arc<TransactionManager>,
    pub listeners: Arc<ListenerBus>,
    pub promoter: Arc<dyn JobOutputPromoter>,
    pub config: CommitConfig,
}

/// Drives one load job through setup, commit and abort.
///
/// The segment lock taken in `setup_job` is released exactly once: by `commit_job` or
/// `abort_job` when the coordinator still holds it, or by the transaction action it was
/// handed to when the commit is deferred under a transaction id.
#[derive(Debug)]
pub struct LoadCommitCoordinator {
    table: TableHandle,
    services: CommitServices,
    ledger: LoadMetadataLedger,
    store: SegmentFileStore,
    state: JobState,
    lock: Option<LockHandle>,
}

impl LoadCommitCoordinator {
    pub fn new(table: TableHandle, services: CommitServices) -> Self {
        let ledger = LoadMetadataLedger::new(
            &table.name,
            &table.root,
            services.lock.clone(),
            services.config.table_status_lock,
        );
        let store = SegmentFileStore::new(table.root.clone());

        Self {
            table,
            services,
            ledger,
            store,
            state: JobState::JobSetup,
            lock: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn ledger(&self) -> &LoadMetadataLedger {
        &self.ledger
    }

    pub fn store(&self) -> &SegmentFileStore {
        &self.store
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(|lock| !lock.is_released())
    }

    fn check_context(&self, ctx: &LoadContext) -> errors::Result<()> {
        if ctx.table_name != self.table.name {
            return Err(Errors::new(ErrorCodes::InvalidJobState).with_message(format!(
                "Job {} belongs to table {}, not {}",
                ctx.job_id, self.table.name, ctx.table_name
            )));
        }

        Ok(())
    }

    fn invalid_state(&self, ctx: &LoadContext, operation: &str) -> Errors {
        Errors::new(ErrorCodes::InvalidJobState).with_message(format!(
            "Cannot {} job {} in state {}",
            operation, ctx.job_id, self.state
        ))
    }

    /// Lock the segment and record it IN_PROGRESS.
    ///
    /// Without a segment id in `ctx`, the next free id is allocated and written back into
    /// `ctx`. A failure to lock leaves the ledger untouched.
    pub async fn setup_job(&mut self, ctx: &mut LoadContext) -> errors::Result<String> {
        self.check_context(ctx)?;
        if self.state != JobState::JobSetup || self.lock.is_some() {
            return Err(self.invalid_state(ctx, "set up"));
        }

        let auto_allocate = ctx.segment_id.is_none();
        let attempts = if auto_allocate {
            SEGMENT_ALLOCATION_ATTEMPTS
        } else {
            1
        };
        let mut last_error = None;

        for _ in 0..attempts {
            let segment_id = match &ctx.segment_id {
                Some(segment_id) => segment_id.clone(),
                None => ledger::next_segment_id(&self.ledger.read().await?),
            };
            validate_segment_id(&segment_id)?;

            let handle = match self
                .services
                .lock
                .acquire(&self.table.name, &segment_id, self.services.config.segment_lock)
                .await
            {
                Ok(handle) => handle,
                // another job allocated the same id first
                Err(e) if auto_allocate && e.is(ErrorCodes::LockTimeout) => {
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let claimed = match self.purge_failed_load(&segment_id).await {
                Ok(()) => self.insert_in_progress(&segment_id, ctx.fact_timestamp).await,
                Err(e) => Err(e),
            };

            match claimed {
                Ok(()) => {
                    log::info!(
                        "Job {} set up segment {} of {}",
                        ctx.job_id,
                        segment_id,
                        self.table.name
                    );

                    ctx.segment_id = Some(segment_id.clone());
                    self.lock = Some(handle);
                    self.state = JobState::TasksRunning;

                    return Ok(segment_id);
                }
                Err(e) => {
                    if let Err(release_error) = handle.release() {
                        log::error!("{}", release_error);
                    }

                    if !(auto_allocate && e.is(ErrorCodes::CommitIntegrityError)) {
                        return Err(e);
                    }

                    log::warn!("Segment {} was taken concurrently, allocating again", segment_id);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Errors::new(ErrorCodes::CommitIntegrityError)))
    }

    // Files a dead load under this id left behind: its descriptor, moved data files and
    // staging. A reusing load may pick the same timestamp and file names. Runs under the
    // segment lock.
    async fn purge_failed_load(&self, segment_id: &str) -> errors::Result<()> {
        let entries = self.ledger.read().await?;
        let Some(dead) = ledger::find(&entries, segment_id)
            .filter(|entry| entry.status == SegmentStatus::LoadFailure)
        else {
            return Ok(());
        };

        let stem = gen_segment_file_name(segment_id, dead.load_start_time);
        let own_descriptor = descriptor_file_name(&stem);

        self.store.delete_segment(&own_descriptor).await?;
        if let Some(name) = &dead.segment_file_name
            && *name != own_descriptor
        {
            self.store.delete_segment(name).await?;
        }
        self.store.cleanup_staging(&staging_dir_name(&stem)).await?;

        log::info!(
            "Purged files of failed load {} of segment {}",
            stem,
            segment_id
        );

        Ok(())
    }

    // A LOAD_FAILURE id may be reused; any other existing entry is live.
    async fn insert_in_progress(&self, segment_id: &str, load_start_time: u64) -> errors::Result<()> {
        self.ledger
            .update(|entries| match ledger::find_mut(entries, segment_id) {
                Some(entry) if entry.status == SegmentStatus::LoadFailure => {
                    *entry = LoadMetadataDetails::new_in_progress(segment_id, load_start_time);
                    Ok(())
                }
                Some(entry) => Err(Errors::new(ErrorCodes::CommitIntegrityError).with_message(
                    format!("Segment {} already exists as {}", segment_id, entry.status),
                )),
                None => {
                    entries.push(LoadMetadataDetails::new_in_progress(
                        segment_id,
                        load_start_time,
                    ));
                    Ok(())
                }
            })
            .await
    }

    // IN_PROGRESS -> LOAD_FAILURE. Any other state is left alone.
    async fn set_load_failure(&self, segment_id: &str) -> errors::Result<bool> {
        self.ledger
            .update(|entries| match ledger::find_mut(entries, segment_id) {
                Some(entry) if entry.status == SegmentStatus::InProgress => {
                    entry.transition_to(SegmentStatus::LoadFailure)?;
                    entry.load_end_time = Some(now_millis());
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await
    }

    pub async fn commit_job(&mut self, ctx: &LoadContext) -> errors::Result<CommitOutcome> {
        self.check_context(ctx)?;
        if self.state != JobState::TasksRunning {
            return Err(self.invalid_state(ctx, "commit"));
        }
        let segment_id = ctx
            .segment_id
            .clone()
            .ok_or_else(|| self.invalid_state(ctx, "commit unallocated"))?;

        self.state = JobState::Committing;

        // Concurrent loads may remove each other's temporary folders; none of that affects
        // the segment itself.
        match self
            .services
            .promoter
            .promote(&self.table.root, &ctx.job_id)
            .await
        {
            Ok(promoted) => log::debug!("Job {} promoted {} files", ctx.job_id, promoted),
            Err(e) => log::warn!("Ignoring output promotion error of job {}: {}", ctx.job_id, e),
        }

        let started = now_millis();
        let result = self.commit_segment(ctx, &segment_id).await;

        match &result {
            Ok(CommitOutcome::NoData { segment_id }) => {
                self.state = JobState::Failed;
                log::warn!("Job {} finished without data in segment {}", ctx.job_id, segment_id);
            }
            Ok(outcome) => {
                self.state = JobState::Success;
                log::info!(
                    "Job {} committed in {} ms: {:?}",
                    ctx.job_id,
                    now_millis().saturating_sub(started),
                    outcome
                );
            }
            Err(e) => {
                self.state = JobState::Failed;
                log::error!("Commit of segment {} failed: {}", segment_id, e);
                self.record_failure(ctx, &segment_id).await;
            }
        }

        let released = match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        };

        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn commit_segment(
        &mut self,
        ctx: &LoadContext,
        segment_id: &str,
    ) -> errors::Result<CommitOutcome> {
        let stem = gen_segment_file_name(segment_id, ctx.fact_timestamp);
        let staging = staging_dir_name(&stem);
        let segment_file_name = descriptor_file_name(&stem);

        let Some(segment_file) = self
            .store
            .merge_fragments(&self.store.staging_area(&staging), &segment_file_name)
            .await?
        else {
            self.discard_staging(ctx, segment_id).await;
            self.set_load_failure(segment_id).await?;
            self.record_failed_action(ctx, segment_id).await;
            log::warn!(
                "Job {} produced no data, segment {} recorded as {}",
                ctx.job_id,
                segment_id,
                SegmentStatus::LoadFailure
            );

            return Ok(CommitOutcome::NoData {
                segment_id: segment_id.to_string(),
            });
        };

        self.store.move_from_temp(&segment_file, &staging).await?;

        let (data_size, index_size) = self.store.segment_sizes(&segment_file).await?;

        let entries = self.ledger.read().await?;
        let mut details = ledger::find(&entries, segment_id).cloned().ok_or_else(|| {
            Errors::new(ErrorCodes::CommitIntegrityError)
                .with_message(format!("Segment {} has no table status entry", segment_id))
        })?;
        details.transition_to(SegmentStatus::Success)?;
        details.data_size = data_size;
        details.index_size = index_size;
        details.load_end_time = Some(now_millis());
        details.segment_file_name = Some(segment_file_name.clone());

        let partitions = segment_file.partition_specs();

        self.services
            .listeners
            .fire(&PreStatusUpdateEvent {
                table_name: self.table.name.clone(),
                segment_id: segment_id.to_string(),
                segment_file_name,
                partitions: partitions.clone(),
                details: details.clone(),
            })
            .await?;

        let mut action =
            LoadTransactionAction::new(self.ledger.clone(), self.store.clone(), details);
        if ctx.overwrite {
            // Planned on this snapshot; the action replans if the table moves on before the
            // ledger swap.
            let plan =
                OverwritePlan::compute(&self.store, &entries, segment_id, partitions).await?;
            action = action.with_overwrite(plan);
        }
        action.record_update_details(now_millis(), &[segment_id.to_string()], true);

        match &ctx.transaction_id {
            Some(transaction_id) => {
                if let Some(lock) = self.lock.take() {
                    action = action.with_lock(lock);
                }
                self.services
                    .transactions
                    .record(transaction_id, Box::new(action))
                    .await;

                Ok(CommitOutcome::Deferred {
                    segment_id: segment_id.to_string(),
                    transaction_id: transaction_id.clone(),
                })
            }
            None => {
                action.commit().await?;

                Ok(CommitOutcome::Committed {
                    segment_id: segment_id.to_string(),
                    data_size,
                    index_size,
                })
            }
        }
    }

    // Runs while the segment lock is still held; nothing of the segment is touched after
    // commit_job lets go of it.
    async fn record_failure(&self, ctx: &LoadContext, segment_id: &str) {
        self.discard_staging(ctx, segment_id).await;

        if let Err(e) = self.set_load_failure(segment_id).await {
            log::error!("Failed to record segment {} as failed: {}", segment_id, e);
        }

        self.record_failed_action(ctx, segment_id).await;
    }

    // With a transaction id, a failed load still joins its transaction so the whole
    // transaction fails. The action carries no lock and never touches the table status.
    async fn record_failed_action(&self, ctx: &LoadContext, segment_id: &str) {
        if let Some(transaction_id) = &ctx.transaction_id {
            let mut details = LoadMetadataDetails::new_in_progress(segment_id, ctx.fact_timestamp);
            details.status = SegmentStatus::LoadFailure;
            details.segment_file_name = Some(descriptor_file_name(&gen_segment_file_name(
                segment_id,
                ctx.fact_timestamp,
            )));

            self.services
                .transactions
                .record(
                    transaction_id,
                    Box::new(LoadTransactionAction::new(
                        self.ledger.clone(),
                        self.store.clone(),
                        details,
                    )),
                )
                .await;
        }
    }

    async fn discard_staging(&self, ctx: &LoadContext, segment_id: &str) {
        let staging = staging_dir_name(&gen_segment_file_name(segment_id, ctx.fact_timestamp));
        if let Err(e) = self.store.cleanup_staging(&staging).await {
            log::warn!("Failed to clean up staging of segment {}: {}", segment_id, e);
        }
    }

    /// Best-effort cleanup of a failed or abandoned job. Safe after any partial commit and
    /// safe to repeat. Only a lock release failure is reported.
    pub async fn abort_job(&mut self, ctx: &LoadContext, reason: &str) -> errors::Result<()> {
        self.check_context(ctx)?;

        if self.state == JobState::Success {
            log::warn!("Job {} already committed, abort ignored", ctx.job_id);
            return Ok(());
        }

        if let Err(e) = self
            .services
            .promoter
            .abort(&self.table.root, &ctx.job_id)
            .await
        {
            log::warn!("Failed to discard temporary output of job {}: {}", ctx.job_id, e);
        }

        // Only the lock holder may touch the segment. Before setup it was never ours, and
        // after a failed commit it was already cleaned up and may have a new load by now.
        if self.holds_lock()
            && let Some(segment_id) = &ctx.segment_id
        {
            self.discard_staging(ctx, segment_id).await;

            if let Err(e) = self.set_load_failure(segment_id).await {
                log::warn!("Failed to record segment {} as failed: {}", segment_id, e);
            }
        }

        if self.state != JobState::Failed {
            log::error!("Loading failed for job {}: {}", ctx.job_id, reason);
        }
        self.state = JobState::Failed;

        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::RetryPolicy,
        lock::InProcessLockProvider,
        segment_file::{PartitionSpec, TaskFragmentWriter},
        table::TableCatalog,
    };

    #[derive(Debug)]
    struct RejectSegment(&'static str);

    #[async_trait]
    impl PreStatusUpdateListener for RejectSegment {
        async fn on_pre_status_update(&self, event: &PreStatusUpdateEvent) -> errors::Result<()> {
            if event.segment_id == self.0 {
                return Err(Errors::new(ErrorCodes::SegmentFileReadError)
                    .with_message("index build failed".to_string()));
            }
            Ok(())
        }
    }

    // rejects one load of a segment, identified by its start time
    #[derive(Debug)]
    struct RejectLoad(&'static str, u64);

    #[async_trait]
    impl PreStatusUpdateListener for RejectLoad {
        async fn on_pre_status_update(&self, event: &PreStatusUpdateEvent) -> errors::Result<()> {
            if event.segment_id == self.0 && event.details.load_start_time == self.1 {
                return Err(Errors::new(ErrorCodes::SegmentFileReadError)
                    .with_message("index build failed".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        table: TableHandle,
        services: CommitServices,
    }

    impl Fixture {
        async fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let catalog = TableCatalog::new(temp_dir.path().to_path_buf());
            catalog.initialize().await.unwrap();
            catalog
                .create_table("sales", vec!["p".to_string()])
                .await
                .unwrap();

            let services = CommitServices {
                lock: SegmentLock::new(Arc::new(InProcessLockProvider::new())),
                transactions: Arc::new(TransactionManager::new()),
                listeners: Arc::new(ListenerBus::new()),
                promoter: Arc::new(TemporaryDirPromoter),
                config: CommitConfig {
                    segment_lock: RetryPolicy::new(2, Duration::from_millis(1)),
                    table_status_lock: RetryPolicy::new(100, Duration::from_millis(1)),
                },
            };

            Self {
                table: catalog.open("sales").await.unwrap(),
                _temp_dir: temp_dir,
                services,
            }
        }

        fn root(&self) -> &Path {
            &self.table.root
        }

        fn coordinator(&self) -> LoadCommitCoordinator {
            LoadCommitCoordinator::new(self.table.clone(), self.services.clone())
        }

        fn ledger(&self) -> LoadMetadataLedger {
            self.coordinator().ledger().clone()
        }

        async fn write_task(&self, ctx: &LoadContext, task: &str, partitions: &[&str]) {
            for partition in partitions {
                self.write_rows(ctx, task, partition, &[format!("{}-{}", task, partition)])
                    .await;
            }
        }

        async fn write_rows(&self, ctx: &LoadContext, task: &str, partition: &str, rows: &[String]) {
            let store = SegmentFileStore::new(self.table.root.clone());
            let mut writer = TaskFragmentWriter::new(
                store,
                task,
                ctx.segment_id.as_deref().unwrap(),
                ctx.fact_timestamp,
            )
            .unwrap();

            let spec = PartitionSpec::new(vec![partition.to_string()]).unwrap();
            writer.write_partition(&spec, rows).await.unwrap();
            writer.close().await.unwrap();
        }

        // setup + tasks + commit of one load
        async fn load(
            &self,
            ctx: &mut LoadContext,
            partitions: &[&str],
        ) -> (LoadCommitCoordinator, errors::Result<CommitOutcome>) {
            let mut coordinator = self.coordinator();
            coordinator.setup_job(ctx).await.unwrap();
            for (i, partition) in partitions.iter().enumerate() {
                self.write_task(ctx, &format!("task-{}", i), &[partition]).await;
            }
            let outcome = coordinator.commit_job(ctx).await;
            (coordinator, outcome)
        }

        async fn status(&self, segment_id: &str) -> SegmentStatus {
            let entries = self.ledger().read().await.unwrap();
            ledger::find(&entries, segment_id).unwrap().status
        }

        // (segment id, location) of every live partition of every valid segment
        async fn live_partitions(&self) -> Vec<(String, String)> {
            let store = SegmentFileStore::new(self.table.root.clone());
            let entries = self.ledger().read().await.unwrap();
            let mut live = vec![];

            for segment in ledger::valid_segments(&entries) {
                let name = segment.segment_file_name.as_deref().unwrap();
                for spec in store.read_partition_specs(name).await.unwrap() {
                    live.push((segment.segment_id.clone(), spec.location));
                }
            }

            live.sort();
            live
        }

        async fn can_lock(&self, segment_id: &str) -> bool {
            let policy = RetryPolicy::new(0, Duration::from_millis(1));
            match self.services.lock.acquire("sales", segment_id, policy).await {
                Ok(handle) => {
                    handle.release().unwrap();
                    true
                }
                Err(_) => false,
            }
        }
    }

    #[tokio::test]
    async fn test_commit_two_partitions() {
        let f = Fixture::new().await;
        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("3");

        let (coordinator, outcome) = f.load(&mut ctx, &["p=1", "p=2"]).await;

        match outcome.unwrap() {
            CommitOutcome::Committed {
                segment_id,
                data_size,
                ..
            } => {
                assert_eq!(segment_id, "3");
                assert!(data_size > 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(coordinator.state(), JobState::Success);
        assert!(!coordinator.holds_lock());

        let entries = f.ledger().read().await.unwrap();
        let entry = ledger::find(&entries, "3").unwrap();
        assert_eq!(entry.status, SegmentStatus::Success);
        assert_eq!(entry.segment_file_name.as_deref(), Some("3_1000.segment"));
        assert!(entry.data_size > 0);

        let specs = coordinator
            .store()
            .read_partition_specs("3_1000.segment")
            .await
            .unwrap();
        assert_eq!(specs.len(), 2);
        assert!(f.root().join("p=1").join("part-task-0-3-1000-0.data").exists());
        assert!(f.can_lock("3").await);
    }

    #[tokio::test]
    async fn test_second_job_on_same_segment_fails_at_lock() {
        let f = Fixture::new().await;

        let mut first = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("3");
        first.setup_job(&mut ctx).await.unwrap();

        let mut second = f.coordinator();
        let mut other = LoadContext::new("sales", "job-2", 2000).with_segment_id("3");
        let err = second.setup_job(&mut other).await.unwrap_err();
        assert!(err.is(ErrorCodes::LockTimeout));
        assert_eq!(second.state(), JobState::JobSetup);

        // the loser left no trace and its abort does not touch the winner's segment
        second.abort_job(&other, "lock timeout").await.unwrap();
        assert_eq!(f.ledger().read().await.unwrap().len(), 1);
        assert_eq!(f.status("3").await, SegmentStatus::InProgress);
        assert!(first.holds_lock());
    }

    #[tokio::test]
    async fn test_auto_allocated_segment_ids() {
        let f = Fixture::new().await;

        let mut first = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-1", 1000);
        assert_eq!(first.setup_job(&mut ctx).await.unwrap(), "0");
        assert_eq!(ctx.segment_id.as_deref(), Some("0"));

        let mut second = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-2", 1000);
        assert_eq!(second.setup_job(&mut ctx).await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_abort_twice_is_abort_once() {
        let f = Fixture::new().await;
        let mut coordinator = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("3");

        coordinator.setup_job(&mut ctx).await.unwrap();
        f.write_task(&ctx, "task-0", &["p=1"]).await;

        coordinator.abort_job(&ctx, "cancelled").await.unwrap();
        coordinator.abort_job(&ctx, "cancelled").await.unwrap();

        assert_eq!(coordinator.state(), JobState::Failed);
        assert_eq!(f.status("3").await, SegmentStatus::LoadFailure);
        assert!(!f.root().join("p=1").join("3_1000.tmp").exists());
        assert!(f.can_lock("3").await);

        let err = coordinator.commit_job(&ctx).await.unwrap_err();
        assert!(err.is(ErrorCodes::InvalidJobState));
    }

    #[tokio::test]
    async fn test_failed_commit_then_abort_frees_segment() {
        let f = Fixture::new().await;
        f.services
            .listeners
            .register(Arc::new(RejectSegment("3")))
            .await;

        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("3");
        let (mut coordinator, outcome) = f.load(&mut ctx, &["p=1"]).await;

        assert!(outcome.unwrap_err().is(ErrorCodes::PreStatusUpdateRejected));
        // files were already in their partition directory when the listener refused
        assert!(f.root().join("p=1").join("part-task-0-3-1000-0.data").exists());

        coordinator.abort_job(&ctx, "commit failed").await.unwrap();
        assert_eq!(f.status("3").await, SegmentStatus::LoadFailure);
        assert!(f.can_lock("3").await);

        // the failed id can be loaded again
        let mut retry = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-2", 2000).with_segment_id("3");
        retry.setup_job(&mut ctx).await.unwrap();
        assert_eq!(f.status("3").await, SegmentStatus::InProgress);
    }

    #[tokio::test]
    async fn test_empty_job_records_no_data() {
        let f = Fixture::new().await;
        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("4");

        let (coordinator, outcome) = f.load(&mut ctx, &[]).await;

        assert_eq!(
            outcome.unwrap(),
            CommitOutcome::NoData {
                segment_id: "4".to_string()
            }
        );
        assert_eq!(coordinator.state(), JobState::Failed);
        assert_eq!(f.status("4").await, SegmentStatus::LoadFailure);
        assert!(f.can_lock("4").await);
    }

    #[tokio::test]
    async fn test_empty_load_fails_its_transaction() {
        let f = Fixture::new().await;

        let mut ctx5 = LoadContext::new("sales", "job-5", 1000)
            .with_segment_id("5")
            .with_transaction_id("tx1");
        let (_, outcome) = f.load(&mut ctx5, &["p=1"]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::Deferred { .. }));

        let mut ctx7 = LoadContext::new("sales", "job-7", 1000)
            .with_segment_id("7")
            .with_transaction_id("tx1");
        let (coordinator7, outcome) = f.load(&mut ctx7, &[]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::NoData { .. }));
        assert_eq!(coordinator7.state(), JobState::Failed);

        assert_eq!(f.services.transactions.pending_count("tx1").await, 2);
        let err = f.services.transactions.commit_all("tx1").await.unwrap_err();
        assert!(err.is(ErrorCodes::CommitIntegrityError));

        assert_eq!(f.status("5").await, SegmentStatus::LoadFailure);
        assert_eq!(f.status("7").await, SegmentStatus::LoadFailure);
        assert!(f.can_lock("5").await);
        assert!(f.can_lock("7").await);
    }

    #[tokio::test]
    async fn test_interrupted_move_reports_partial_write() {
        let f = Fixture::new().await;
        let mut coordinator = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("3");

        coordinator.setup_job(&mut ctx).await.unwrap();
        f.write_task(&ctx, "task-0", &["p=1"]).await;
        f.write_task(&ctx, "task-1", &["p=2"]).await;
        // p=1 moves first, then p=2 hits the missing file
        std::fs::remove_file(
            f.root()
                .join("p=2")
                .join("3_1000.tmp")
                .join("part-task-1-3-1000-0.data"),
        )
        .unwrap();

        let err = coordinator.commit_job(&ctx).await.unwrap_err();
        assert!(err.is(ErrorCodes::PartialWriteError));
        assert_eq!(coordinator.state(), JobState::Failed);
        assert!(!coordinator.holds_lock());

        coordinator.abort_job(&ctx, "commit failed").await.unwrap();

        assert_eq!(f.status("3").await, SegmentStatus::LoadFailure);
        assert!(f.can_lock("3").await);
        assert!(f.root().join("p=1").join("part-task-0-3-1000-0.data").exists());
        assert!(!f.root().join("p=2").join("3_1000.tmp").exists());
    }

    #[tokio::test]
    async fn test_reused_segment_starts_from_clean_files() {
        let f = Fixture::new().await;

        // a load of "3" at ts 1000 dies after moving p=1
        let mut failed = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("3");
        failed.setup_job(&mut ctx).await.unwrap();
        f.write_task(&ctx, "task-0", &["p=1"]).await;
        f.write_task(&ctx, "task-1", &["p=2"]).await;
        std::fs::remove_file(
            f.root()
                .join("p=2")
                .join("3_1000.tmp")
                .join("part-task-1-3-1000-0.data"),
        )
        .unwrap();
        assert!(failed.commit_job(&ctx).await.is_err());
        failed.abort_job(&ctx, "commit failed").await.unwrap();
        let stale = f.root().join("p=1").join("part-task-0-3-1000-0.data");
        assert!(stale.exists());

        // same id, same timestamp, no tasks
        let mut ctx = LoadContext::new("sales", "job-2", 1000).with_segment_id("3");
        let (empty, outcome) = f.load(&mut ctx, &[]).await;
        assert_eq!(
            outcome.unwrap(),
            CommitOutcome::NoData {
                segment_id: "3".to_string()
            }
        );
        assert_eq!(empty.state(), JobState::Failed);
        assert_eq!(f.status("3").await, SegmentStatus::LoadFailure);
        assert!(!stale.exists());
        assert!(!empty.store().descriptor_path("3_1000.segment").exists());

        // same id and timestamp again, with data of its own
        let mut loaded = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-3", 1000).with_segment_id("3");
        loaded.setup_job(&mut ctx).await.unwrap();
        f.write_rows(&ctx, "task-0", "p=1", &["fresh".to_string()]).await;
        assert!(matches!(
            loaded.commit_job(&ctx).await.unwrap(),
            CommitOutcome::Committed { .. }
        ));

        assert_eq!(std::fs::read_to_string(&stale).unwrap(), "fresh\n");
        assert_eq!(
            f.live_partitions().await,
            vec![("3".to_string(), "p=1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_overwrite_is_invisible_until_transaction_commits() {
        let f = Fixture::new().await;

        let mut ctx = LoadContext::new("sales", "job-1", 1000).with_segment_id("0");
        f.load(&mut ctx, &["p=1", "p=2"]).await.1.unwrap();

        let mut ctx = LoadContext::new("sales", "job-2", 2000)
            .with_segment_id("1")
            .with_overwrite(true)
            .with_transaction_id("tx1");
        let (coordinator, outcome) = f.load(&mut ctx, &["p=1"]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::Deferred { .. }));
        // lock ownership moved to the pending action
        assert!(!coordinator.holds_lock());
        assert!(!f.can_lock("1").await);

        // readers still see the old partition map of segment 0 and no segment 1
        let entries = f.ledger().read().await.unwrap();
        let old = ledger::find(&entries, "0").unwrap().clone();
        assert_eq!(old.segment_file_name.as_deref(), Some("0_1000.segment"));
        assert_eq!(ledger::valid_segments(&entries).len(), 1);

        f.services.transactions.commit_all("tx1").await.unwrap();
        assert!(f.can_lock("1").await);

        let entries = f.ledger().read().await.unwrap();
        let updated = ledger::find(&entries, "0").unwrap();
        let new_name = updated.segment_file_name.clone().unwrap();
        assert_ne!(new_name, "0_1000.segment");
        assert_eq!(ledger::find(&entries, "1").unwrap().status, SegmentStatus::Success);

        let store = coordinator.store();
        let live: Vec<_> = store
            .read_partition_specs(&new_name)
            .await
            .unwrap()
            .into_iter()
            .map(|spec| spec.location)
            .collect();
        assert_eq!(live, vec!["p=2".to_string()]);
        assert_eq!(store.read_partition_specs("0_1000.segment").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_load_fails_its_transaction() {
        let f = Fixture::new().await;
        f.services
            .listeners
            .register(Arc::new(RejectSegment("6")))
            .await;

        let mut ctx5 = LoadContext::new("sales", "job-5", 1000)
            .with_segment_id("5")
            .with_transaction_id("tx1");
        let (_, outcome) = f.load(&mut ctx5, &["p=1"]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::Deferred { .. }));

        let mut ctx6 = LoadContext::new("sales", "job-6", 1000)
            .with_segment_id("6")
            .with_transaction_id("tx1");
        let (mut coordinator6, outcome) = f.load(&mut ctx6, &["p=2"]).await;
        assert!(outcome.unwrap_err().is(ErrorCodes::PreStatusUpdateRejected));
        coordinator6.abort_job(&ctx6, "commit failed").await.unwrap();

        assert_eq!(f.services.transactions.pending_count("tx1").await, 2);
        let err = f.services.transactions.commit_all("tx1").await.unwrap_err();
        assert!(err.is(ErrorCodes::CommitIntegrityError));

        assert_eq!(f.status("5").await, SegmentStatus::LoadFailure);
        assert_eq!(f.status("6").await, SegmentStatus::LoadFailure);
        assert!(f.can_lock("5").await);
        assert!(f.can_lock("6").await);
        assert!(!f.root().join("p=1").join("part-task-0-5-1000-0.data").exists());
    }

    #[tokio::test]
    async fn test_failed_load_spares_reused_segment() {
        let f = Fixture::new().await;
        f.services
            .listeners
            .register(Arc::new(RejectLoad("6", 1000)))
            .await;

        let mut ctx5 = LoadContext::new("sales", "job-5", 1000)
            .with_segment_id("5")
            .with_transaction_id("tx1");
        let (_, outcome) = f.load(&mut ctx5, &["p=1"]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::Deferred { .. }));

        let mut ctx6 = LoadContext::new("sales", "job-6", 1000)
            .with_segment_id("6")
            .with_transaction_id("tx1");
        let (mut failed, outcome) = f.load(&mut ctx6, &["p=2"]).await;
        assert!(outcome.unwrap_err().is(ErrorCodes::PreStatusUpdateRejected));
        failed.abort_job(&ctx6, "commit failed").await.unwrap();

        // a new load takes over the failed id before tx1 finishes
        let mut reused = f.coordinator();
        let mut ctx = LoadContext::new("sales", "job-7", 2000).with_segment_id("6");
        reused.setup_job(&mut ctx).await.unwrap();

        // a late abort of the failed job must not reach the new load
        failed.abort_job(&ctx6, "commit failed").await.unwrap();
        assert_eq!(f.status("6").await, SegmentStatus::InProgress);

        f.write_task(&ctx, "task-0", &["p=3"]).await;
        assert!(matches!(
            reused.commit_job(&ctx).await.unwrap(),
            CommitOutcome::Committed { .. }
        ));
        assert_eq!(f.status("6").await, SegmentStatus::Success);

        let err = f.services.transactions.commit_all("tx1").await.unwrap_err();
        assert!(err.is(ErrorCodes::CommitIntegrityError));

        assert_eq!(f.status("5").await, SegmentStatus::LoadFailure);
        assert_eq!(f.status("6").await, SegmentStatus::Success);
        assert!(f.root().join("p=3").join("part-task-0-6-2000-0.data").exists());
        assert_eq!(
            f.live_partitions().await,
            vec![("6".to_string(), "p=3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_concurrent_overwrites_keep_one_live_copy() {
        let f = Fixture::new().await;

        let mut ctx = LoadContext::new("sales", "job-0", 1000).with_segment_id("0");
        f.load(&mut ctx, &["p=1", "p=2"]).await.1.unwrap();

        // both planned while only segment 0 is valid
        let mut ctx_a = LoadContext::new("sales", "job-a", 2000)
            .with_segment_id("1")
            .with_overwrite(true)
            .with_transaction_id("txa");
        let (_, outcome) = f.load(&mut ctx_a, &["p=2"]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::Deferred { .. }));

        let mut ctx_b = LoadContext::new("sales", "job-b", 3000)
            .with_segment_id("2")
            .with_overwrite(true)
            .with_transaction_id("txb");
        let (_, outcome) = f.load(&mut ctx_b, &["p=1"]).await;
        assert!(matches!(outcome.unwrap(), CommitOutcome::Deferred { .. }));

        f.services.transactions.commit_all("txa").await.unwrap();
        f.services.transactions.commit_all("txb").await.unwrap();

        assert_eq!(
            f.live_partitions().await,
            vec![
                ("1".to_string(), "p=2".to_string()),
                ("2".to_string(), "p=1".to_string()),
            ]
        );
        assert_eq!(f.status("0").await, SegmentStatus::MarkedForDelete);
        assert!(f.can_lock("1").await);
        assert!(f.can_lock("2").await);
    }
}
