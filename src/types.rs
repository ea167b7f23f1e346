use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized form of one inbound webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_gid: Option<String>,
    pub resource_name: Option<String>,
    /// Sender-supplied, not validated.
    pub created_at: Option<String>,
    pub received_at: DateTime<Utc>,
    pub user: Option<Value>,
    pub parent: Option<Value>,
    pub full_event: Value,
    pub signature_verified: bool,
    /// 1-based position within its delivery batch.
    #[serde(default = "first_index")]
    pub index: usize,
}

impl EventRecord {
    pub fn from_event(event: &Value, received_at: DateTime<Utc>, signature_verified: bool) -> Self {
        let resource = event.get("resource");
        Self {
            action: str_field(Some(event), "action"),
            resource_type: str_field(resource, "resource_type"),
            resource_gid: str_field(resource, "gid"),
            resource_name: str_field(resource, "name"),
            created_at: str_field(Some(event), "created_at"),
            received_at,
            user: non_null(event.get("user")),
            parent: non_null(event.get("parent")),
            full_event: event.clone(),
            signature_verified,
            index: first_index(),
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }
}

fn first_index() -> usize {
    1
}

/// Gids are strings on the wire, but numeric ids are tolerated.
fn str_field(obj: Option<&Value>, key: &str) -> Option<String> {
    match obj?.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_null(v: Option<&Value>) -> Option<Value> {
    v.filter(|v| !v.is_null()).cloned()
}

/// Body of an event delivery. Everything is optional: a batch without an
/// `events` array is a valid batch of zero.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookBatch {
    #[serde(default)]
    pub events: Option<Vec<Value>>,
    #[serde(default)]
    pub parent: Option<Value>,
}

impl WebhookBatch {
    pub fn parent_gid(&self) -> Option<String> {
        str_field(self.parent.as_ref(), "gid")
    }

    pub fn into_events(self) -> Vec<Value> {
        self.events.unwrap_or_default()
    }
}

/// Messages fanned out to stream subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Connected {
        message: String,
        #[serde(rename = "historyCount")]
        history_count: usize,
        timestamp: DateTime<Utc>,
    },
    History {
        events: Vec<EventRecord>,
        count: usize,
    },
    WebhookEvent {
        event: EventRecord,
        #[serde(rename = "totalEvents")]
        total_events: usize,
        #[serde(rename = "currentIndex")]
        current_index: usize,
    },
    Handshake {
        /// Always redacted.
        #[serde(rename = "hookSecret")]
        hook_secret: String,
        #[serde(rename = "secretSaved")]
        secret_saved: bool,
        #[serde(rename = "webhookGid")]
        webhook_gid: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
    HistoryCleared {
        #[serde(rename = "clearedCount")]
        cleared_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Connected { .. } => "connected",
            Notification::History { .. } => "history",
            Notification::WebhookEvent { .. } => "webhook_event",
            Notification::Handshake { .. } => "handshake",
            Notification::Error { .. } => "error",
            Notification::HistoryCleared { .. } => "history_cleared",
        }
    }
}

/// A row of the webhook registration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub webhook_gid: String,
    pub resource_gid: String,
    pub resource_type: String,
    pub target_url: String,
    pub secret: String,
    pub active: bool,
    pub event_count: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration as exposed over the API, without the secret.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookSummary {
    pub webhook_gid: String,
    pub resource_gid: String,
    pub resource_type: String,
    pub target_url: String,
    pub active: bool,
    pub event_count: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WebhookRegistration> for WebhookSummary {
    fn from(wh: WebhookRegistration) -> Self {
        Self {
            webhook_gid: wh.webhook_gid,
            resource_gid: wh.resource_gid,
            resource_type: wh.resource_type,
            target_url: wh.target_url,
            active: wh.active,
            event_count: wh.event_count,
            last_event_at: wh.last_event_at,
            created_at: wh.created_at,
            updated_at: wh.updated_at,
        }
    }
}

/// An entry of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Assigned by the store; empty until saved.
    #[serde(default)]
    pub id: String,
    pub webhook_gid: String,
    pub event_type: String,
    pub action: Option<String>,
    pub resource_gid: Option<String>,
    pub resource_type: Option<String>,
    pub user_gid: Option<String>,
    pub created_at: String,
    pub payload: Value,
    pub signature_verified: bool,
    pub received_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn from_record(record: &EventRecord, webhook_gid: &str) -> Self {
        let event = &record.full_event;
        Self {
            id: String::new(),
            webhook_gid: webhook_gid.to_string(),
            event_type: str_field(Some(event), "type").unwrap_or_else(|| "webhook".to_string()),
            action: record.action.clone(),
            resource_gid: record.resource_gid.clone(),
            resource_type: record.resource_type.clone(),
            user_gid: str_field(record.user.as_ref(), "gid"),
            created_at: record
                .created_at
                .clone()
                .unwrap_or_else(|| record.received_at.to_rfc3339()),
            payload: event.clone(),
            signature_verified: record.signature_verified,
            received_at: record.received_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub resource_type: Option<String>,
    pub action: Option<String>,
    /// Substring match.
    pub resource_gid: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, ev: &StoredEvent) -> bool {
        if let Some(rt) = &self.resource_type {
            if ev.resource_type.as_deref() != Some(rt.as_str()) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if ev.action.as_deref() != Some(action.as_str()) {
                return false;
            }
        }
        if let Some(gid) = &self.resource_gid {
            if !ev.resource_gid.as_deref().is_some_and(|g| g.contains(gid.as_str())) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct EventQuery {
    pub filter: EventFilter,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub active_webhooks: usize,
    pub total_events: usize,
    pub events_24h: usize,
    pub verified_events_24h: usize,
    pub last_event_time: Option<DateTime<Utc>>,
}
