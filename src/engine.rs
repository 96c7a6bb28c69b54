use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::{
    config::CommitConfig,
    coordinator::{
        CommitOutcome, CommitServices, JobState, ListenerBus, LoadCommitCoordinator, LoadContext,
        PreStatusUpdateListener, TemporaryDirPromoter,
    },
    errors::{self, ErrorCodes, Errors},
    ledger::{LoadMetadataDetails, LoadMetadataLedger},
    lock::{LockProvider, SegmentLock},
    os::now_millis,
    segment_file::{PartitionSpec, TaskFragmentWriter},
    table::{TableCatalog, TableInfo},
    transaction::TransactionManager,
    validate::validate_task_id,
};

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SetupJobRequest {
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub fact_timestamp: Option<u64>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TaskPartition {
    // `column=value` pairs; empty for an unpartitioned table
    #[serde(default)]
    pub values: Vec<String>,
    pub rows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub table_name: String,
    pub segment_id: String,
    pub fact_timestamp: u64,
    pub state: JobState,
}

#[derive(Debug)]
struct Job {
    ctx: LoadContext,
    coordinator: LoadCommitCoordinator,
}

/// Entry point of the commit path: one lock provider, one transaction registry and one
/// listener bus shared by every job, plus the jobs currently between setup and commit.
#[derive(Debug)]
pub struct CommitEngine {
    base_path: PathBuf,
    catalog: TableCatalog,
    services: CommitServices,
    jobs: Mutex<HashMap<String, Arc<Mutex<Job>>>>,
    job_counter: AtomicU64,
}

impl CommitEngine {
    pub async fn initialize(
        base_path: PathBuf,
        config: CommitConfig,
        lock_provider: Arc<dyn LockProvider>,
    ) -> errors::Result<Self> {
        // 1. Data directory
        tokio::fs::create_dir_all(&base_path).await.map_err(|e| {
            Errors::new(ErrorCodes::DirectoryCreateError)
                .with_message(format!("Failed to create data directory {:?}: {}", base_path, e))
        })?;

        // 2. Table catalog
        let catalog = TableCatalog::new(base_path.clone());
        catalog.initialize().await?;

        // 3. Shared commit services
        let services = CommitServices {
            lock: SegmentLock::new(lock_provider),
            transactions: Arc::new(TransactionManager::new()),
            listeners: Arc::new(ListenerBus::new()),
            promoter: Arc::new(TemporaryDirPromoter),
            config,
        };

        log::info!("Commit engine initialized at {:?}", base_path);

        Ok(Self {
            base_path,
            catalog,
            services,
            jobs: Mutex::new(HashMap::new()),
            job_counter: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.services.transactions
    }

    pub async fn register_listener(&self, listener: Arc<dyn PreStatusUpdateListener>) {
        self.services.listeners.register(listener).await;
    }

    pub async fn create_table(
        &self,
        table: &str,
        partition_columns: Vec<String>,
    ) -> errors::Result<TableInfo> {
        self.catalog.create_table(table, partition_columns).await
    }

    pub async fn get_table(&self, table: &str) -> errors::Result<TableInfo> {
        self.catalog.get_table(table).await
    }

    pub async fn list_tables(&self) -> errors::Result<Vec<String>> {
        self.catalog.list_tables().await
    }

    pub async fn delete_table(&self, table: &str) -> errors::Result<()> {
        let jobs = self.jobs.lock().await;
        for job in jobs.values() {
            if job.lock().await.ctx.table_name == table {
                return Err(Errors::new(ErrorCodes::InvalidJobState).with_message(format!(
                    "Table '{}' has a running load job",
                    table
                )));
            }
        }

        self.catalog.delete_table(table).await
    }

    pub async fn table_status(&self, table: &str) -> errors::Result<Vec<LoadMetadataDetails>> {
        let handle = self.catalog.open(table).await?;
        let ledger = LoadMetadataLedger::new(
            &handle.name,
            &handle.root,
            self.services.lock.clone(),
            self.services.config.table_status_lock,
        );

        ledger.read().await
    }

    fn next_job_id(&self) -> String {
        let n = self.job_counter.fetch_add(1, Ordering::SeqCst);
        format!("job-{}-{}", now_millis(), n)
    }

    async fn job(&self, job_id: &str) -> errors::Result<Arc<Mutex<Job>>> {
        self.jobs.lock().await.get(job_id).cloned().ok_or_else(|| {
            Errors::new(ErrorCodes::JobNotFound).with_message(job_id.to_string())
        })
    }

    async fn forget_job(&self, job_id: &str) {
        self.jobs.lock().await.remove(job_id);
    }

    pub async fn setup_job(
        &self,
        table: &str,
        request: SetupJobRequest,
    ) -> errors::Result<JobSummary> {
        let handle = self.catalog.open(table).await?;
        let job_id = self.next_job_id();

        let mut ctx = LoadContext::new(
            &handle.name,
            &job_id,
            request.fact_timestamp.unwrap_or_else(now_millis),
        )
        .with_overwrite(request.overwrite);
        ctx.segment_id = request.segment_id;
        ctx.transaction_id = request.transaction_id;

        let mut coordinator = LoadCommitCoordinator::new(handle, self.services.clone());

        let segment_id = match coordinator.setup_job(&mut ctx).await {
            Ok(segment_id) => segment_id,
            Err(e) => {
                if let Err(abort_error) = coordinator.abort_job(&ctx, &e.to_string()).await {
                    log::error!("Abort after failed setup of {}: {}", job_id, abort_error);
                }
                return Err(e);
            }
        };

        let summary = JobSummary {
            job_id: job_id.clone(),
            table_name: ctx.table_name.clone(),
            segment_id,
            fact_timestamp: ctx.fact_timestamp,
            state: coordinator.state(),
        };

        self.jobs
            .lock()
            .await
            .insert(job_id, Arc::new(Mutex::new(Job { ctx, coordinator })));

        Ok(summary)
    }

    // The task-side write path: stage rows, then leave the task's fragment for the commit.
    pub async fn write_task(
        &self,
        job_id: &str,
        task_id: &str,
        partitions: Vec<TaskPartition>,
    ) -> errors::Result<Vec<String>> {
        validate_task_id(task_id)?;

        // Tasks of one job stage in parallel; the job lock only covers the state check.
        let (store, segment_id, fact_timestamp) = {
            let job = self.job(job_id).await?;
            let job = job.lock().await;

            if job.coordinator.state() != JobState::TasksRunning {
                return Err(Errors::new(ErrorCodes::InvalidJobState).with_message(format!(
                    "Job {} is {}",
                    job_id,
                    job.coordinator.state()
                )));
            }
            let segment_id = job.ctx.segment_id.clone().ok_or_else(|| {
                Errors::new(ErrorCodes::InvalidJobState)
                    .with_message(format!("Job {} has no segment", job_id))
            })?;

            let store = job.coordinator.store().clone();
            let fact_timestamp = job.ctx.fact_timestamp;

            (store, segment_id, fact_timestamp)
        };

        let mut writer = TaskFragmentWriter::new(store, task_id, &segment_id, fact_timestamp)?;

        let mut files = vec![];
        for partition in partitions {
            let spec = PartitionSpec::new(partition.values)?;
            if let Some(file) = writer.write_partition(&spec, &partition.rows).await? {
                files.push(file);
            }
        }
        writer.close().await?;

        Ok(files)
    }

    // A failed commit is aborted before the error is returned.
    pub async fn commit_job(&self, job_id: &str) -> errors::Result<CommitOutcome> {
        let job = self.job(job_id).await?;
        let result = {
            let mut job = job.lock().await;
            let Job { ctx, coordinator } = &mut *job;

            match coordinator.commit_job(ctx).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    if let Err(abort_error) = coordinator.abort_job(ctx, &e.to_string()).await {
                        log::error!("Abort after failed commit of {}: {}", job_id, abort_error);
                    }
                    Err(e)
                }
            }
        };

        self.forget_job(job_id).await;

        result
    }

    pub async fn abort_job(&self, job_id: &str, reason: &str) -> errors::Result<()> {
        let job = self.job(job_id).await?;
        let result = {
            let mut job = job.lock().await;
            let Job { ctx, coordinator } = &mut *job;
            coordinator.abort_job(ctx, reason).await
        };

        self.forget_job(job_id).await;

        result
    }

    pub async fn commit_transaction(&self, transaction_id: &str) -> errors::Result<()> {
        self.services.transactions.commit_all(transaction_id).await
    }

    pub async fn rollback_transaction(&self, transaction_id: &str) -> errors::Result<()> {
        self.services.transactions.rollback_all(transaction_id).await
    }

    pub async fn running_jobs(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        ledger::SegmentStatus,
        lock::{FileLockProvider, InProcessLockProvider},
    };

    async fn engine(temp_dir: &TempDir) -> CommitEngine {
        CommitEngine::initialize(
            temp_dir.path().to_path_buf(),
            CommitConfig::default(),
            Arc::new(InProcessLockProvider::new()),
        )
        .await
        .unwrap()
    }

    fn partition(value: &str, rows: &[&str]) -> TaskPartition {
        TaskPartition {
            values: vec![value.to_string()],
            rows: rows.iter().map(|row| row.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_load_through_engine() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;
        engine.create_table("sales", vec!["p".to_string()]).await.unwrap();

        let job = engine
            .setup_job(
                "sales",
                SetupJobRequest {
                    fact_timestamp: Some(1000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.segment_id, "0");
        assert_eq!(job.state, JobState::TasksRunning);

        let files = engine
            .write_task(&job.job_id, "task-0", vec![partition("p=1", &["a", "b"])])
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        engine
            .write_task(&job.job_id, "task-1", vec![partition("p=2", &["c"])])
            .await
            .unwrap();

        let outcome = engine.commit_job(&job.job_id).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert_eq!(engine.running_jobs().await, 0);

        let status = engine.table_status("sales").await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, SegmentStatus::Success);

        let err = engine.commit_job(&job.job_id).await.unwrap_err();
        assert!(err.is(ErrorCodes::JobNotFound));
    }

    #[tokio::test]
    async fn test_abort_and_unknown_table() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;
        engine.create_table("sales", vec![]).await.unwrap();

        let err = engine
            .setup_job("missing", SetupJobRequest::default())
            .await
            .unwrap_err();
        assert!(err.is(ErrorCodes::TableNotFound));

        let job = engine
            .setup_job("sales", SetupJobRequest::default())
            .await
            .unwrap();
        assert!(engine.delete_table("sales").await.is_err());

        engine.abort_job(&job.job_id, "cancelled").await.unwrap();
        let status = engine.table_status("sales").await.unwrap();
        assert_eq!(status[0].status, SegmentStatus::LoadFailure);

        engine.delete_table("sales").await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_commit_with_file_locks() {
        let temp_dir = TempDir::new().unwrap();
        let engine = CommitEngine::initialize(
            temp_dir.path().to_path_buf(),
            CommitConfig::default(),
            Arc::new(FileLockProvider::new(temp_dir.path().to_path_buf())),
        )
        .await
        .unwrap();
        engine.create_table("sales", vec!["p".to_string()]).await.unwrap();

        let job = engine
            .setup_job(
                "sales",
                SetupJobRequest {
                    segment_id: Some("7".to_string()),
                    fact_timestamp: Some(1000),
                    transaction_id: Some("tx1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let lock_file = temp_dir
            .path()
            .join("tables")
            .join("sales")
            .join("LockFiles")
            .join("Segment_7.lock");
        assert!(lock_file.exists());

        engine
            .write_task(&job.job_id, "task-0", vec![partition("p=1", &["a"])])
            .await
            .unwrap();
        let outcome = engine.commit_job(&job.job_id).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Deferred { .. }));
        assert!(lock_file.exists());
        assert_eq!(engine.table_status("sales").await.unwrap()[0].status, SegmentStatus::InProgress);

        engine.commit_transaction("tx1").await.unwrap();
        assert!(!lock_file.exists());
        assert_eq!(engine.table_status("sales").await.unwrap()[0].status, SegmentStatus::Success);

        let err = engine.rollback_transaction("tx1").await.unwrap_err();
        assert!(err.is(ErrorCodes::TransactionNotFound));
    }
}
