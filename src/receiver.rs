use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::error::ReceiverError;
use crate::history::HistoryBuffer;
use crate::persistence::{Persistence, PersistJob, PersistenceQueue};
use crate::secret::{redact, SecretStore};
use crate::types::{EventRecord, Notification, StoredEvent, WebhookBatch, WebhookRegistration};
use crate::verification::{SignatureCheck, UnverifiedReason};
use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Challenge header of the handshake. `HeaderMap` lookups are
/// case-insensitive.
pub const HOOK_SECRET_HEADER: &str = "x-hook-secret";
pub const HOOK_SIGNATURE_HEADER: &str = "x-hook-signature";

/// Everything the request handlers share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub secret: SecretStore,
    pub history: Arc<HistoryBuffer>,
    pub broadcaster: Arc<Broadcaster>,
    pub persistence: PersistenceQueue,
    /// Read side of the store, for the reporting endpoints.
    pub store: Arc<dyn Persistence>,
}

impl AppState {
    /// Build the shared state and spawn the persistence worker.
    pub fn new(config: Config, store: Arc<dyn Persistence>) -> (Self, JoinHandle<()>) {
        let history = Arc::new(HistoryBuffer::new(config.max_history));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&history)));
        let (persistence, worker) =
            PersistenceQueue::spawn(Arc::clone(&store), config.persist_queue_capacity);

        let secret = SecretStore::new();
        if let Some(initial) = config.initial_secret.as_deref() {
            secret.set(initial);
            info!(secret = %redact(initial), "webhook secret pre-bound from configuration");
        }

        let state = Self {
            config: Arc::new(config),
            secret,
            history,
            broadcaster,
            persistence,
            store,
        };
        (state, worker)
    }

    /// Bind the challenge as the current secret, queue the registration
    /// write and notify observers. Never fails: the caller answers the
    /// sender regardless of what happens here.
    pub fn handle_handshake(&self, challenge: &str, body: &[u8]) -> HandshakeOutcome {
        let rebound = self.secret.set(challenge);

        let info: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let webhook_gid = text(&info, "webhook_gid").unwrap_or_else(synthetic_webhook_gid);

        let now = Utc::now();
        self.persistence.dispatch(PersistJob::SaveWebhook(WebhookRegistration {
            webhook_gid: webhook_gid.clone(),
            resource_gid: text(&info, "resource").unwrap_or_else(|| "unknown".to_string()),
            resource_type: text(&info, "resource_type").unwrap_or_else(|| "unknown".to_string()),
            target_url: self.config.webhook_url(),
            secret: challenge.to_string(),
            active: true,
            event_count: 0,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }));

        self.broadcaster.publish(&Notification::Handshake {
            hook_secret: redact(challenge),
            secret_saved: true,
            webhook_gid: webhook_gid.clone(),
            timestamp: now,
        });

        info!(
            webhook_gid = %webhook_gid,
            secret = %redact(challenge),
            rebound,
            "handshake completed"
        );
        HandshakeOutcome { webhook_gid, rebound }
    }

    /// Authenticate and ingest one event batch.
    ///
    /// `body` is the exact request body. A present-but-wrong signature
    /// rejects the whole batch before anything is recorded.
    pub fn ingest_batch(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestOutcome, ReceiverError> {
        // Read the secret now, not at request start: a handshake may have
        // rebound it in between.
        let secret = self.secret.get();
        let check = SignatureCheck::evaluate(body, signature, secret.as_deref());

        match check {
            SignatureCheck::Rejected => {
                warn!(bytes = body.len(), "rejecting batch with invalid signature");
                self.broadcaster.publish(&Notification::Error {
                    error: "Invalid signature".to_string(),
                    timestamp: Utc::now(),
                });
                return Err(ReceiverError::InvalidSignature);
            }
            SignatureCheck::Unverified(UnverifiedReason::NoSecretBound) => {
                warn!("signed batch accepted unverified: no secret bound yet");
            }
            SignatureCheck::Unverified(UnverifiedReason::NoSignature) => {
                debug!("unsigned batch accepted unverified");
            }
            SignatureCheck::Verified => {}
        }

        let batch: WebhookBatch = if body.iter().all(u8::is_ascii_whitespace) {
            WebhookBatch::default()
        } else {
            serde_json::from_slice(body)?
        };

        let parent_gid = batch.parent_gid();
        let webhook_gid = parent_gid.clone().unwrap_or_else(synthetic_webhook_gid);
        let verified = check.is_verified();

        let records = batch
            .into_events()
            .iter()
            .enumerate()
            .map(|(i, event)| EventRecord::from_event(event, Utc::now(), verified).with_index(i + 1))
            .collect();
        let stored = self.broadcaster.record_batch(records);
        for record in &stored {
            self.persistence.dispatch(PersistJob::SaveEvent {
                event: StoredEvent::from_record(record, &webhook_gid),
                stats_for: parent_gid.clone(),
            });
        }
        let processed = stored.len();

        info!(processed, verification = check.label(), "batch ingested");
        Ok(IngestOutcome { processed, check })
    }

    /// Empty the in-memory history and notify observers.
    pub fn clear_history(&self) -> usize {
        self.broadcaster.clear_history()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub webhook_gid: String,
    /// A secret was already bound and has been replaced.
    pub rebound: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub processed: usize,
    pub check: SignatureCheck,
}

/// Raw challenge header. Its presence alone makes the request a
/// handshake, whatever the value.
pub fn handshake_challenge(headers: &HeaderMap) -> Option<&HeaderValue> {
    headers.get(HOOK_SECRET_HEADER)
}

/// Challenge value usable as a secret: visible ASCII, non-empty.
pub fn challenge_secret(value: &HeaderValue) -> Option<&str> {
    value.to_str().ok().filter(|v| !v.is_empty())
}

pub fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(HOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn text(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn synthetic_webhook_gid() -> String {
    format!("webhook_{}", &Uuid::new_v4().simple().to_string()[..8])
}
