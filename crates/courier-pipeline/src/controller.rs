//! Pipeline lifecycle controller.
//!
//! Owns the worker and sweeper tasks and exposes the operational surface:
//! idempotent start and stop, a status snapshot, manual retry, and queue
//! clearing. All collaborators are injected so the controller can drive real
//! Redis and PostgreSQL in production and in-memory doubles in tests.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::{Clock, CoreError, DeliveryRecord, EventId, StatusCounts};

use crate::{
    error::{PipelineError, Result},
    queue::EventQueue,
    scheduler::{RetrySweeper, SweeperConfig},
    sender::ChannelSender,
    store::DeliveryStore,
    worker::{Worker, WorkerConfig, WorkerStats, WorkerStatsSnapshot},
};

/// Controller tuning parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker poll loop settings.
    pub worker: WorkerConfig,
    /// Sweeper loop settings.
    pub sweeper: SweeperConfig,
    /// How long `stop` waits for in-flight work before giving up.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            sweeper: SweeperConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Whether the pipeline tasks are currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Worker and sweeper tasks are live.
    Running,
    /// No tasks are running.
    Stopped,
}

/// Operational snapshot of the pipeline.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStatus {
    /// Task liveness.
    pub worker_state: WorkerState,
    /// Events waiting on the queue.
    pub queue_length: usize,
    /// Configured poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Configured batch size.
    pub max_batch_size: usize,
    /// Ledger record counts by status.
    pub records: StatusCounts,
    /// Worker lifetime counters.
    pub worker_stats: WorkerStatsSnapshot,
}

struct RunningTasks {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Lifecycle owner for the delivery worker and retry sweeper.
pub struct PipelineController {
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn DeliveryStore>,
    sender: Arc<dyn ChannelSender>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    stats: Arc<WorkerStats>,
    tasks: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl PipelineController {
    /// Creates a stopped controller over injected collaborators.
    pub fn new(
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn DeliveryStore>,
        sender: Arc<dyn ChannelSender>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            queue,
            store,
            sender,
            clock,
            config,
            stats: Arc::new(WorkerStats::default()),
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the worker and sweeper tasks.
    ///
    /// Calling `start` while running is a logged no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            info!("pipeline already running, start ignored");
            return;
        }

        let cancel = CancellationToken::new();

        let worker = Worker::new(
            self.queue.clone(),
            self.store.clone(),
            self.sender.clone(),
            self.clock.clone(),
            self.config.worker.clone(),
            cancel.clone(),
            self.stats.clone(),
        );
        let sweeper = RetrySweeper::new(
            self.queue.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.config.sweeper.clone(),
            cancel.clone(),
        );

        *tasks = Some(RunningTasks {
            cancel,
            worker: tokio::spawn(worker.run()),
            sweeper: tokio::spawn(sweeper.run()),
        });

        info!("notification pipeline started");
    }

    /// Stops the pipeline, waiting for in-flight work to finish.
    ///
    /// Calling `stop` while stopped is a logged no-op. The worker finishes
    /// its current batch before exiting; events still on the queue stay
    /// there for the next start.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when tasks do not exit within the
    /// configured deadline and `WorkerPanic` when a task panicked.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.tasks.lock().await.take() else {
            info!("pipeline already stopped, stop ignored");
            return Ok(());
        };

        running.cancel.cancel();

        let joined = tokio::time::timeout(self.config.shutdown_timeout, async {
            let worker = running.worker.await;
            let sweeper = running.sweeper.await;
            worker.and(sweeper)
        })
        .await;

        match joined {
            Ok(Ok(())) => {
                info!("notification pipeline stopped");
                Ok(())
            },
            Ok(Err(e)) => Err(PipelineError::WorkerPanic { reason: e.to_string() }),
            Err(_) => Err(PipelineError::ShutdownTimeout {
                reason: format!(
                    "pipeline tasks did not stop within {}s",
                    self.config.shutdown_timeout.as_secs()
                ),
            }),
        }
    }

    /// Whether the pipeline tasks are running.
    pub async fn state(&self) -> WorkerState {
        if self.tasks.lock().await.is_some() {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    /// Builds the operational status snapshot.
    pub async fn status(&self) -> Result<PipelineStatus> {
        let queue_length = match self.queue.len().await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "failed to read queue length for status");
                0
            },
        };

        Ok(PipelineStatus {
            worker_state: self.state().await,
            queue_length,
            poll_interval_ms: self.config.worker.poll_interval.as_millis() as u64,
            max_batch_size: self.config.worker.max_batch_size,
            records: self.store.count_by_status().await?,
            worker_stats: self.stats.snapshot(),
        })
    }

    /// Manually retries a failed delivery.
    ///
    /// Only records that are `failed` with remaining attempt budget are
    /// eligible; the record moves back to `retrying` and the event is
    /// re-enqueued immediately.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no eligible record exists for the event.
    pub async fn force_retry(&self, event_id: EventId) -> Result<DeliveryRecord> {
        let max_attempts = self.config.worker.retry_policy.max_attempts as i32;
        let record = self
            .store
            .revive_failed(event_id, max_attempts)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "no failed delivery with retry budget for event {event_id}"
                ))
            })?;

        self.queue.push(record.to_event()).await?;
        info!(event_id = %event_id, "manual retry enqueued");
        Ok(record)
    }

    /// Discards every event waiting on the queue.
    pub async fn clear_queue(&self) -> Result<()> {
        self.queue.clear().await?;
        info!("notification queue cleared");
        Ok(())
    }

    /// Current queue depth.
    pub async fn queue_length(&self) -> Result<usize> {
        self.queue.len().await
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.try_lock() {
            if let Some(running) = tasks.as_ref() {
                running.cancel.cancel();
            }
        }
    }
}
