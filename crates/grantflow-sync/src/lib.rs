//! Ingestion orchestration: scheduled discovery ticks, the detail/commit
//! worker pool, health reporting and operator actions on dead letters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use grantflow_adapters::{GrantsGovClient, OpportunitySource, SearchQuery};
use grantflow_core::{AttemptStatus, DeadLetter, DeadLetterKind, FetchAttempt, OpportunityRef};
use grantflow_storage::{
    BlobArchive, DeadLetterStore, Delivery, FsBlobArchive, HttpFetcher, OpportunityStore,
    PgQueue, PgStore, WatermarkStore, WorkQueue,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub mod commit;
mod config;
pub mod detail;
pub mod discovery;

pub use commit::{detail_fields, CommitError, CommitReceipt, CommitStage};
pub use config::{default_commit_backoff, load_queries, ConfigError, IngestConfig};
pub use detail::{DetailStage, ProcessError, ProcessedDetail};
pub use discovery::{in_window, unchanged_since, Discovery, DiscoveryRun};

pub const CRATE_NAME: &str = "grantflow-sync";

/// A delivery whose raw payload cannot be archived is left for redelivery
/// this many times before it is dead-lettered.
pub const MAX_ARCHIVE_DELIVERIES: u32 = 5;

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Collaborators the pipeline drives. Postgres and the filesystem in
/// production, in-memory doubles in tests.
#[derive(Clone)]
pub struct PipelineDeps {
    pub source: Arc<dyn OpportunitySource>,
    pub store: Arc<dyn OpportunityStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub archive: Arc<dyn BlobArchive>,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    rate_limited_retries: AtomicU64,
    transient_retries: AtomicU64,
    dead_lettered: AtomicU64,
    enqueued: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited_retries: self.rate_limited_retries.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
        }
    }
}

/// Totals since the process started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited_retries: u64,
    pub transient_retries: u64,
    pub dead_lettered: u64,
    pub enqueued: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub last_commit_at: Option<DateTime<Utc>>,
    /// `None` when the dead-letter store could not be reached.
    pub dead_letter_count: Option<u64>,
    pub queue_depth: Option<u64>,
    pub last_discovery_error: Option<String>,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Default)]
struct HealthState {
    last_discovery_at: Option<DateTime<Utc>>,
    last_commit_at: Option<DateTime<Utc>>,
    last_discovery_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub pages_fetched: u32,
    pub enqueued: usize,
    pub complete: bool,
    pub watermark_advanced: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Committed,
    DeadLettered(DeadLetterKind),
    /// Handed back to the queue for immediate redelivery.
    Released,
    /// Left invisible; the queue redelivers it once the visibility timeout lapses.
    Deferred,
    /// Empty message body; acked and dropped.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub requeued: u32,
    pub recommitted: u32,
}

impl ReplayOutcome {
    pub fn found(&self) -> bool {
        self.requeued + self.recommitted > 0
    }
}

struct Settings {
    queries: Vec<SearchQuery>,
    worker_count: usize,
    visibility_timeout: Duration,
    discovery_cron: String,
}

pub struct Pipeline {
    settings: Settings,
    deps: PipelineDeps,
    discovery: Discovery,
    detail: DetailStage,
    commit: CommitStage,
    discovery_guard: Mutex<()>,
    counters: Counters,
    health: StdMutex<HealthState>,
    shutdown: watch::Sender<bool>,
}

/// Retries actually taken, split by cause.
fn retry_counts(attempts: &[FetchAttempt]) -> (u64, u64) {
    attempts
        .iter()
        .filter(|attempt| attempt.next_retry_at.is_some())
        .fold((0, 0), |(rate_limited, transient), attempt| match attempt.status {
            AttemptStatus::RateLimited { .. } => (rate_limited + 1, transient),
            AttemptStatus::Transient { .. } => (rate_limited, transient + 1),
            _ => (rate_limited, transient),
        })
}

impl Pipeline {
    /// `shutdown` must be the sender whose receivers were handed to the
    /// HTTP fetcher, so that stopping the pipeline also stops retries.
    pub fn new(
        config: &IngestConfig,
        queries: Vec<SearchQuery>,
        deps: PipelineDeps,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self> {
        if queries.is_empty() {
            anyhow::bail!("at least one discovery query is required");
        }
        let commit = CommitStage::new(Arc::clone(&deps.store), config.commit_backoff)
            .context("commit backoff policy")?
            .with_shutdown(shutdown.subscribe());
        Ok(Self {
            settings: Settings {
                queries,
                worker_count: config.worker_count.max(1),
                visibility_timeout: config.visibility_timeout,
                discovery_cron: config.discovery_cron.clone(),
            },
            discovery: Discovery::new(
                Arc::clone(&deps.source),
                config.max_pages,
                config.page_rows,
            ),
            detail: DetailStage::new(Arc::clone(&deps.source), Arc::clone(&deps.archive)),
            commit,
            deps,
            discovery_guard: Mutex::new(()),
            counters: Counters::default(),
            health: StdMutex::new(HealthState::default()),
            shutdown,
        })
    }

    /// Production wiring: Postgres store and queue, grants.gov over HTTP,
    /// raw payloads on the local filesystem.
    pub async fn connect(config: &IngestConfig) -> Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(config.worker_count as u32 + 4)
            .connect(&config.database_url)
            .await
            .context("connecting to Postgres")?;
        let store = Arc::new(PgStore::new(pool.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let fetcher = HttpFetcher::new(config.http_client_config())
            .context("building HTTP client")?
            .with_shutdown(shutdown_rx);
        let queries = load_queries(&config.queries_path)?;
        let deps = PipelineDeps {
            source: Arc::new(GrantsGovClient::new(Arc::new(fetcher), &config.api_base_url)),
            store: store.clone(),
            watermarks: store.clone(),
            dead_letters: store,
            queue: Arc::new(PgQueue::new(pool)),
            archive: Arc::new(FsBlobArchive::new(&config.archive_dir)),
        };
        Ok(Arc::new(Self::new(config, queries, deps, shutdown)?))
    }

    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`Pipeline::shutdown`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    fn health_state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn watermark_name(&self) -> &'static str {
        self.deps.source.source_id()
    }

    /// One discovery pass. Returns `None` when another tick still holds the guard.
    pub async fn run_discovery_tick(&self) -> Result<Option<TickReport>> {
        let Ok(_guard) = self.discovery_guard.try_lock() else {
            info!("discovery tick skipped; previous tick still running");
            return Ok(None);
        };
        let run_at = Utc::now();
        let result = self
            .discovery_tick(run_at)
            .instrument(info_span!("discovery_tick", %run_at))
            .await;

        let mut health = self.health_state();
        match &result {
            Ok(report) if report.complete => {
                health.last_discovery_at = Some(run_at);
                health.last_discovery_error = None;
            }
            Ok(report) => health.last_discovery_error = report.failure.clone(),
            Err(err) => health.last_discovery_error = Some(format!("{err:#}")),
        }
        result.map(Some)
    }

    async fn discovery_tick(&self, run_at: DateTime<Utc>) -> Result<TickReport> {
        let name = self.watermark_name();
        let watermark = self
            .deps
            .watermarks
            .load_watermark(name)
            .await
            .context("loading discovery watermark")?;

        let run = self
            .discovery
            .discover(&self.settings.queries, &watermark, run_at.date_naive(), run_at)
            .await;

        for item in &run.refs {
            self.deps
                .queue
                .send(&item.id)
                .await
                .with_context(|| format!("enqueueing {}", item.id))?;
            Counters::bump(&self.counters.enqueued, 1);
        }

        let watermark_advanced = match &run.next_watermark {
            Some(next) => {
                self.deps
                    .watermarks
                    .save_watermark(name, next)
                    .await
                    .context("saving discovery watermark")?;
                true
            }
            None => {
                warn!(failure = ?run.failure, "discovery incomplete; watermark left unchanged");
                false
            }
        };

        info!(
            enqueued = run.refs.len(),
            pages = run.pages_fetched,
            watermark_advanced,
            "discovery tick finished"
        );
        Ok(TickReport {
            pages_fetched: run.pages_fetched,
            enqueued: run.refs.len(),
            complete: run.complete,
            watermark_advanced,
            failure: run.failure,
        })
    }

    /// Pulls and handles one message. `None` when the queue has nothing visible.
    pub async fn process_next(&self) -> Result<Option<WorkOutcome>> {
        let delivery = self
            .deps
            .queue
            .receive(self.settings.visibility_timeout)
            .await
            .context("receiving from work queue")?;
        match delivery {
            Some(delivery) => self.handle_delivery(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handles messages until none is visible or shutdown is requested.
    pub async fn drain(&self) -> Result<Vec<WorkOutcome>> {
        let mut outcomes = Vec::new();
        while !self.is_shutting_down() {
            match self.process_next().await? {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        Ok(outcomes)
    }

    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<WorkOutcome> {
        let id = delivery.body.trim().to_string();
        let span = info_span!("work_item", %id, dequeue_count = delivery.dequeue_count);
        self.handle_delivery_inner(id, delivery).instrument(span).await
    }

    async fn handle_delivery_inner(&self, id: String, delivery: Delivery) -> Result<WorkOutcome> {
        if id.is_empty() {
            warn!("empty work item dropped");
            self.ack(&delivery).await;
            return Ok(WorkOutcome::Discarded);
        }

        let item = OpportunityRef::new(id.clone(), Utc::now());
        let processed = match self.detail.process(&item).await {
            Ok(processed) => processed,
            Err(err) if err.is_cancelled() => {
                self.release(&delivery).await;
                return Ok(WorkOutcome::Released);
            }
            Err(err @ ProcessError::Archive { .. })
                if delivery.dequeue_count < MAX_ARCHIVE_DELIVERIES =>
            {
                error!(error = %err, "raw payload not archived; waiting for redelivery");
                return Ok(WorkOutcome::Deferred);
            }
            Err(err) => {
                self.count_retries(err.attempts());
                let attempts = match &err {
                    ProcessError::Archive { .. } => delivery.dequeue_count,
                    _ => err.attempts().len() as u32,
                };
                let letter = DeadLetter {
                    id,
                    kind: DeadLetterKind::Fetch,
                    reason: err.dead_letter_reason(),
                    attempts,
                    last_error: err.to_string(),
                    recorded_at: Utc::now(),
                    detail: None,
                };
                self.dead_letter(letter, &delivery).await?;
                return Ok(WorkOutcome::DeadLettered(DeadLetterKind::Fetch));
            }
        };
        self.count_retries(&processed.attempts);

        match self.commit.commit(&processed.detail).await {
            Ok(_) => {
                Counters::bump(&self.counters.succeeded, 1);
                self.health_state().last_commit_at = Some(Utc::now());
                self.ack(&delivery).await;
                Ok(WorkOutcome::Committed)
            }
            Err(err) if err.is_cancelled() => {
                self.release(&delivery).await;
                Ok(WorkOutcome::Released)
            }
            Err(err) => {
                let letter = DeadLetter {
                    id,
                    kind: DeadLetterKind::Commit,
                    reason: err.dead_letter_reason(),
                    attempts: err.attempts(),
                    last_error: err.last_error(),
                    recorded_at: Utc::now(),
                    detail: Some(processed.detail),
                };
                self.dead_letter(letter, &delivery).await?;
                Ok(WorkOutcome::DeadLettered(DeadLetterKind::Commit))
            }
        }
    }

    fn count_retries(&self, attempts: &[FetchAttempt]) {
        let (rate_limited, transient) = retry_counts(attempts);
        Counters::bump(&self.counters.rate_limited_retries, rate_limited);
        Counters::bump(&self.counters.transient_retries, transient);
    }

    /// Records the letter, then acks. If recording fails the message stays
    /// un-acked so the queue hands it out again.
    async fn dead_letter(&self, letter: DeadLetter, delivery: &Delivery) -> Result<()> {
        self.deps
            .dead_letters
            .record(&letter)
            .await
            .with_context(|| format!("recording {} dead letter for {}", letter.kind, letter.id))?;
        Counters::bump(&self.counters.dead_lettered, 1);
        Counters::bump(&self.counters.failed, 1);
        warn!(
            kind = %letter.kind,
            reason = %letter.reason,
            attempts = letter.attempts,
            "work item dead-lettered"
        );
        self.ack(delivery).await;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.deps.queue.ack(delivery).await {
            warn!(error = %err, "ack failed; message will be redelivered");
        }
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(err) = self.deps.queue.release(delivery).await {
            warn!(error = %err, "release failed; message reappears after its visibility timeout");
        }
    }

    /// Runs `worker_count` workers until shutdown is requested.
    pub async fn run_workers(self: Arc<Self>) -> Result<()> {
        let mut workers = JoinSet::new();
        for worker in 0..self.settings.worker_count {
            let pipeline = Arc::clone(&self);
            workers.spawn(
                async move { pipeline.worker_loop().await }.instrument(info_span!("worker", worker)),
            );
        }
        info!(workers = self.settings.worker_count, "workers started");
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task ended abnormally");
            }
        }
        info!("workers stopped");
        Ok(())
    }

    async fn worker_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => error!(error = %format!("{err:#}"), "work item failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.settings.discovery_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_discovery_tick().await {
                    error!(error = %format!("{err:#}"), "scheduled discovery tick failed");
                }
            })
        })
        .with_context(|| format!("creating discovery job for cron {cron}"))?;
        sched.add(job).await.context("adding discovery job")?;
        Ok(sched)
    }

    /// Scheduler plus workers until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut scheduler = self.build_scheduler().await?;
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %self.settings.discovery_cron, "discovery scheduled");
        let result = Arc::clone(&self).run_workers().await;
        scheduler.shutdown().await.context("stopping scheduler")?;
        result
    }

    pub async fn health(&self) -> HealthSnapshot {
        let dead_letter_count = match self.deps.dead_letters.count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "dead-letter store unreachable");
                None
            }
        };
        let queue_depth = self.deps.queue.approximate_len().await.ok();
        let state = self.health_state();
        let status = if dead_letter_count.is_some() && state.last_discovery_error.is_none() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthSnapshot {
            status,
            last_discovery_at: state.last_discovery_at,
            last_commit_at: state.last_commit_at,
            dead_letter_count,
            queue_depth,
            last_discovery_error: state.last_discovery_error.clone(),
            counters: self.counters.snapshot(),
        }
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.deps
            .dead_letters
            .list()
            .await
            .context("listing dead letters")
    }

    /// Fetch dead letters go back on the queue; commit dead letters are
    /// re-committed from their stored detail.
    pub async fn replay_dead_letter(&self, id: &str) -> Result<ReplayOutcome> {
        let letters: Vec<DeadLetter> = self
            .dead_letters()
            .await?
            .into_iter()
            .filter(|letter| letter.id == id)
            .collect();

        let mut outcome = ReplayOutcome::default();
        for letter in letters {
            match (letter.kind, &letter.detail) {
                (DeadLetterKind::Commit, Some(detail)) => {
                    match self.commit.commit(detail).await {
                        Ok(_) => {
                            Counters::bump(&self.counters.succeeded, 1);
                            self.health_state().last_commit_at = Some(Utc::now());
                            outcome.recommitted += 1;
                        }
                        Err(err) => {
                            let context = format!("re-committing {id}");
                            let refreshed = DeadLetter {
                                reason: err.dead_letter_reason(),
                                attempts: letter.attempts + err.attempts(),
                                last_error: err.last_error(),
                                recorded_at: Utc::now(),
                                ..letter
                            };
                            self.deps
                                .dead_letters
                                .record(&refreshed)
                                .await
                                .context("refreshing commit dead letter")?;
                            return Err(anyhow!(err).context(context));
                        }
                    }
                }
                _ => {
                    self.deps
                        .queue
                        .send(&letter.id)
                        .await
                        .with_context(|| format!("re-enqueueing {}", letter.id))?;
                    Counters::bump(&self.counters.enqueued, 1);
                    outcome.requeued += 1;
                }
            }
            self.deps
                .dead_letters
                .remove(&letter.id, letter.kind)
                .await
                .with_context(|| format!("removing {} dead letter for {}", letter.kind, letter.id))?;
            info!(id = %letter.id, kind = %letter.kind, "dead letter replayed");
        }
        Ok(outcome)
    }

    /// Deletes rows whose `last_updated` is more than `older_than` before today.
    pub async fn prune_stale(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now()
            .date_naive()
            .checked_sub_signed(older_than)
            .context("prune threshold out of range")?;
        self.commit
            .prune(cutoff)
            .await
            .with_context(|| format!("pruning opportunities last updated before {cutoff}"))
    }
}
