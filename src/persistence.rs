use crate::error::StoreError;
use crate::types::{
    EventFilter, EventQuery, StoreStats, StoredEvent, WebhookRegistration,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Durable side of the receiver: webhook registrations and the event log.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Upsert by `webhook_gid`. An existing row keeps its counters and
    /// gets the new secret.
    async fn save_webhook(&self, webhook: WebhookRegistration) -> Result<WebhookRegistration, StoreError>;

    /// Append to the event log. Returns the event with its assigned id.
    async fn save_event(&self, event: StoredEvent) -> Result<StoredEvent, StoreError>;

    /// Bump `event_count` and `last_event_at`. Returns `None` for an
    /// unknown webhook.
    async fn update_webhook_stats(&self, webhook_gid: &str) -> Result<Option<WebhookRegistration>, StoreError>;

    async fn list_webhooks(&self) -> Result<Vec<WebhookRegistration>, StoreError>;

    async fn recent_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError>;

    async fn count_events(&self, filter: &EventFilter) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Deferred write dispatched from the request path.
#[derive(Debug, Clone)]
pub enum PersistJob {
    SaveWebhook(WebhookRegistration),
    /// Save the event, then bump the stats of `stats_for` if set.
    SaveEvent {
        event: StoredEvent,
        stats_for: Option<String>,
    },
}

impl PersistJob {
    fn label(&self) -> &'static str {
        match self {
            PersistJob::SaveWebhook(_) => "save_webhook",
            PersistJob::SaveEvent { .. } => "save_event",
        }
    }

    async fn run(self, store: &dyn Persistence) -> Result<(), StoreError> {
        match self {
            PersistJob::SaveWebhook(webhook) => {
                let saved = store.save_webhook(webhook).await?;
                debug!(webhook_gid = %saved.webhook_gid, "webhook registration saved");
            }
            PersistJob::SaveEvent { event, stats_for } => {
                let saved = store.save_event(event).await?;
                debug!(event_id = %saved.id, "event saved");
                if let Some(gid) = stats_for {
                    if store.update_webhook_stats(&gid).await?.is_none() {
                        debug!(webhook_gid = %gid, "stats update for unregistered webhook");
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Fire-and-forget dispatcher in front of a [`Persistence`] store.
///
/// `dispatch` never waits: jobs go onto a bounded queue drained in order by
/// one detached worker. Failures are logged and counted, never returned to
/// the dispatching call site.
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<QueueCounters>,
}

impl PersistenceQueue {
    /// Spawn the worker. It stops once every queue handle is dropped and
    /// the backlog is drained.
    pub fn spawn(store: Arc<dyn Persistence>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PersistJob>(capacity.max(1));
        let counters = Arc::new(QueueCounters::default());

        let worker_counters = Arc::clone(&counters);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let label = job.label();
                if let Err(e) = job.run(store.as_ref()).await {
                    worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(job = label, error = %e, "persistence job failed");
                }
            }
            debug!("persistence worker stopped");
        });

        (Self { tx, counters }, worker)
    }

    pub fn dispatch(&self, job: PersistJob) {
        if let Err(e) = self.tx.try_send(job) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let (reason, job) = match e {
                TrySendError::Full(job) => ("queue full", job),
                TrySendError::Closed(job) => ("worker stopped", job),
            };
            warn!(job = job.label(), reason, "persistence job dropped");
        }
    }

    /// Jobs that ran and failed.
    pub fn failures(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Jobs that never ran.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}
