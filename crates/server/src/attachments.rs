use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parley_core::{ImageState, Message, ServerEvent, UploadTarget, UserId};
use parley_media::{ObjectStore, TransformOptions, UploadError};
use rand::Rng;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::AttachmentConfig,
    delivery::DeliveryRouter,
    profiles::ProfileDirectory,
    store::{MessageStore, StoreError},
};

const SWEEP_BATCH: usize = 500;

#[derive(Debug)]
pub struct UploadJob {
    pub job_id: Uuid,
    pub target: UploadTarget,
    pub payload: Vec<u8>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_bytes: usize,
    pub avatar_max_bytes: usize,
    pub upload_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub pending_grace: Duration,
    pub sweep_interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl From<&AttachmentConfig> for PipelineSettings {
    fn from(config: &AttachmentConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            avatar_max_bytes: config.avatar_max_bytes,
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
            max_attempts: config.max_attempts,
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            pending_grace: Duration::from_secs(config.pending_grace_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            workers: config.workers,
            queue_capacity: config.queue_capacity,
        }
    }
}

impl PipelineSettings {
    fn ceiling_for(&self, target: &UploadTarget) -> usize {
        match target {
            UploadTarget::ChatAttachment { .. } => self.max_bytes,
            UploadTarget::ProfilePicture { .. } => self.avatar_max_bytes,
        }
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        let grace = chrono::Duration::from_std(self.pending_grace).unwrap_or_default();
        Utc::now() - grace
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("an upload for {0} is already in flight")]
    Duplicate(Uuid),
    #[error("upload queue is full")]
    QueueFull,
    #[error("upload pipeline is shut down")]
    Closed,
}

/// Exponential backoff from `initial`, doubling per attempt and capped at
/// `max`, plus up to a quarter of the capped delay as jitter.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let capped = initial.saturating_mul(factor).min(max);
    let spread = (capped.as_millis() / 4) as u64;
    let jitter = if spread == 0 {
        0
    } else {
        rand::rng().random_range(0..=spread)
    };
    capped + Duration::from_millis(jitter)
}

/// Sent by workers to the dispatcher once the store reflects the outcome.
#[derive(Debug)]
enum Resolution {
    Message(Message),
    Avatar { user_id: UserId, avatar: ImageState },
}

pub struct PipelineDeps {
    pub store: Arc<dyn MessageStore>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub object_store: Arc<dyn ObjectStore>,
    pub router: DeliveryRouter,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Arc<MetricsContext>>,
}

struct PipelineInner {
    queue: mpsc::Sender<UploadJob>,
    in_flight: Mutex<HashSet<Uuid>>,
    store: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileDirectory>,
    object_store: Arc<dyn ObjectStore>,
    resolutions: mpsc::UnboundedSender<Resolution>,
    settings: PipelineSettings,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

/// Bounded upload queue consumed by a worker pool, a dispatcher turning
/// resolutions into `message-updated`/`profile-updated` events, and a sweeper
/// failing attachments stranded in `pending`.
#[derive(Clone)]
pub struct AttachmentPipeline {
    inner: Arc<PipelineInner>,
}

impl AttachmentPipeline {
    pub fn start(
        deps: PipelineDeps,
        settings: PipelineSettings,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
        let workers = settings.workers.max(1);

        let pipeline = Self {
            inner: Arc::new(PipelineInner {
                queue: queue_tx,
                in_flight: Mutex::new(HashSet::new()),
                store: deps.store,
                profiles: deps.profiles,
                object_store: deps.object_store,
                resolutions: resolution_tx,
                settings,
                #[cfg(feature = "metrics")]
                metrics: deps.metrics,
            }),
        };

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut tasks = Vec::with_capacity(workers + 2);
        for worker in 0..workers {
            tasks.push(tokio::spawn(pipeline.clone().run_worker(
                worker,
                queue_rx.clone(),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(dispatch_resolutions(
            resolution_rx,
            deps.router,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(pipeline.clone().run_sweeper(shutdown)));

        (pipeline, tasks)
    }

    /// Queue an upload. Jobs are idempotent per target id: a second job for
    /// the same message or user is refused while the first is in flight.
    pub async fn enqueue(&self, target: UploadTarget, payload: Vec<u8>) -> Result<Uuid, EnqueueError> {
        let key = target.key();
        if !self.inner.in_flight.lock().await.insert(key) {
            return Err(EnqueueError::Duplicate(key));
        }

        let job = UploadJob {
            job_id: Uuid::new_v4(),
            target,
            payload,
            attempts: 0,
        };
        let job_id = job.job_id;
        let size = job.payload.len();

        match self.inner.queue.try_send(job) {
            Ok(()) => {
                tracing::debug!(%job_id, kind = target.kind(), %key, size, "upload job queued");
                Ok(job_id)
            }
            Err(err) => {
                self.inner.in_flight.lock().await.remove(&key);
                match err {
                    TrySendError::Full(_) => Err(EnqueueError::QueueFull),
                    TrySendError::Closed(_) => Err(EnqueueError::Closed),
                }
            }
        }
    }

    /// Resolve a pending attachment to `failed` without going through a
    /// worker; used when the job could not be queued at all.
    pub async fn fail_immediately(&self, message_id: Uuid) -> Result<Message, StoreError> {
        let message = self
            .inner
            .store
            .update_image_state(message_id, ImageState::Failed)
            .await?;
        self.record_outcome("failed");
        Ok(message)
    }

    #[cfg(any(test, feature = "metrics"))]
    pub async fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }

    /// Fail every attachment pending since before `cutoff` that this process
    /// is not working on. Returns how many messages were resolved.
    pub async fn reconcile_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let in_flight: Vec<Uuid> = self.inner.in_flight.lock().await.iter().copied().collect();
        let stale = self
            .inner
            .store
            .stale_pending(cutoff, &in_flight, SWEEP_BATCH)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut resolved = 0;
        for message in &stale {
            if self
                .resolve_message(message.id, ImageState::Failed, "reconciled")
                .await
            {
                resolved += 1;
            }
        }
        if resolved > 0 {
            tracing::warn!(resolved, %cutoff, "failed stale pending attachments");
        }
        Ok(resolved)
    }

    async fn run_worker(
        self,
        worker: usize,
        queue: Arc<Mutex<mpsc::Receiver<UploadJob>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let job = tokio::select! {
                job = async { queue.lock().await.recv().await } => job,
                _ = shutdown.changed() => break,
            };
            let Some(job) = job else {
                break;
            };
            self.process(job).await;
        }
        tracing::debug!(worker, "upload worker stopped");
    }

    async fn run_sweeper(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.inner.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = self.inner.settings.stale_cutoff();
                    if let Err(err) = self.reconcile_stale(cutoff).await {
                        tracing::error!(?err, "reconciliation sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("reconciliation sweeper stopped");
    }

    async fn process(&self, mut job: UploadJob) {
        let key = job.target.key();
        let outcome = self.upload_with_retry(&mut job).await;
        if let Err(err) = &outcome {
            tracing::warn!(
                job_id = %job.job_id,
                kind = job.target.kind(),
                %key,
                attempts = job.attempts,
                error = %err,
                "upload failed permanently"
            );
        }

        match job.target {
            UploadTarget::ChatAttachment { message_id } => {
                let (next, outcome_label) = match outcome {
                    Ok(url) => (ImageState::Uploaded { url }, "uploaded"),
                    Err(_) => (ImageState::Failed, "failed"),
                };
                self.resolve_message(message_id, next, outcome_label).await;
            }
            UploadTarget::ProfilePicture { user_id } => {
                self.resolve_avatar(user_id, outcome).await;
            }
        }

        self.inner.in_flight.lock().await.remove(&key);
    }

    async fn upload_with_retry(&self, job: &mut UploadJob) -> Result<String, UploadError> {
        let settings = &self.inner.settings;
        let ceiling = settings.ceiling_for(&job.target);
        if job.payload.is_empty() {
            return Err(UploadError::Empty);
        }
        if job.payload.len() > ceiling {
            return Err(UploadError::TooLarge {
                size: job.payload.len(),
                max: ceiling,
            });
        }

        let transform = match job.target {
            UploadTarget::ChatAttachment { .. } => TransformOptions::chat_attachment(),
            UploadTarget::ProfilePicture { .. } => TransformOptions::avatar(),
        };
        let folder = job.target.folder();

        loop {
            job.attempts += 1;
            let attempt = self.inner.object_store.upload(&job.payload, folder, &transform);
            let result = match timeout(settings.upload_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(UploadError::Timeout(settings.upload_timeout)),
            };

            match result {
                Ok(url) => {
                    tracing::info!(
                        job_id = %job.job_id,
                        kind = job.target.kind(),
                        attempts = job.attempts,
                        %url,
                        "upload stored"
                    );
                    return Ok(url);
                }
                Err(err) if err.is_retryable() && job.attempts < settings.max_attempts => {
                    let delay =
                        backoff_delay(job.attempts, settings.backoff_initial, settings.backoff_max);
                    tracing::warn!(
                        job_id = %job.job_id,
                        attempt = job.attempts,
                        ?delay,
                        error = %err,
                        "upload attempt failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns true when this call moved the message out of `pending`.
    async fn resolve_message(&self, message_id: Uuid, next: ImageState, outcome: &'static str) -> bool {
        match self.inner.store.update_image_state(message_id, next).await {
            Ok(message) => {
                self.record_outcome(outcome);
                let _ = self.inner.resolutions.send(Resolution::Message(message));
                true
            }
            Err(StoreError::InvalidStateTransition(err)) => {
                tracing::debug!(%message_id, error = %err, "attachment already resolved");
                false
            }
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(%message_id, "message vanished before attachment resolved");
                false
            }
            Err(err) => {
                tracing::error!(%message_id, ?err, "failed to record attachment outcome");
                false
            }
        }
    }

    async fn resolve_avatar(&self, user_id: UserId, outcome: Result<String, UploadError>) {
        let avatar = match outcome {
            Ok(url) => match self.inner.profiles.set_avatar_url(user_id, &url).await {
                Ok(()) => ImageState::Uploaded { url },
                Err(err) => {
                    tracing::error!(%user_id, ?err, "failed to store avatar url");
                    ImageState::Failed
                }
            },
            Err(_) => ImageState::Failed,
        };
        self.record_outcome(if avatar.url().is_some() {
            "uploaded"
        } else {
            "failed"
        });
        let _ = self
            .inner
            .resolutions
            .send(Resolution::Avatar { user_id, avatar });
    }

    fn record_outcome(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_attachment_outcome(outcome);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (self, outcome);
        }
    }
}

async fn dispatch_resolutions(
    mut resolutions: mpsc::UnboundedReceiver<Resolution>,
    router: DeliveryRouter,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let resolution = tokio::select! {
            resolution = resolutions.recv() => resolution,
            _ = shutdown.changed() => break,
        };
        let Some(resolution) = resolution else {
            break;
        };

        match resolution {
            Resolution::Message(message) => {
                let (sender, receiver) = (message.sender_id, message.receiver_id);
                let event = Arc::new(ServerEvent::MessageUpdated { message });
                let mut reached = router.notify_shared(receiver, event.clone()).await;
                if sender != receiver {
                    reached += router.notify_shared(sender, event).await;
                }
                tracing::debug!(reached, "dispatched message-updated");
            }
            Resolution::Avatar { user_id, avatar } => {
                router
                    .notify(user_id, ServerEvent::ProfileUpdated { user_id, avatar })
                    .await;
            }
        }
    }
    tracing::debug!("resolution dispatcher stopped");
}
