use crate::error::StoreError;
use crate::persistence::Persistence;
use crate::types::{
    EventFilter, EventQuery, StoreStats, StoredEvent, WebhookRegistration,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const WEBHOOKS_FILE: &str = "webhooks.json";
const EVENTS_FILE: &str = "events.jsonl";

/// File-backed store: the webhook table as a JSON array and the event log
/// as append-only JSON lines, both under `data_dir`.
pub struct FileStore {
    data_dir: PathBuf,
    webhooks: Mutex<HashMap<String, WebhookRegistration>>,
    /// Serializes appends to the event log.
    log: Mutex<()>,
}

impl FileStore {
    /// Open the store, creating `data_dir` and loading registrations.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut webhooks = HashMap::new();
        let path = data_dir.join(WEBHOOKS_FILE);
        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let items: Vec<WebhookRegistration> = serde_json::from_str(&content)?;
            for wh in items {
                webhooks.insert(wh.webhook_gid.clone(), wh);
            }
        }
        info!(dir = %data_dir.display(), webhooks = webhooks.len(), "store opened");

        Ok(Self {
            data_dir,
            webhooks: Mutex::new(webhooks),
            log: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn save_webhooks(&self, webhooks: &HashMap<String, WebhookRegistration>) -> Result<(), StoreError> {
        let mut items: Vec<&WebhookRegistration> = webhooks.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let content = serde_json::to_string_pretty(&items)?;

        // Write-then-rename so a crash never leaves a truncated table.
        let path = self.data_dir.join(WEBHOOKS_FILE);
        let tmp = self.data_dir.join(format!("{WEBHOOKS_FILE}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write the table with `row` applied, then apply it in memory. On a
    /// failed write the in-memory table is left as it was.
    async fn commit(
        &self,
        webhooks: &mut HashMap<String, WebhookRegistration>,
        row: WebhookRegistration,
    ) -> Result<(), StoreError> {
        let mut next = webhooks.clone();
        next.insert(row.webhook_gid.clone(), row);
        self.save_webhooks(&next).await?;
        *webhooks = next;
        Ok(())
    }

    /// Every logged event, oldest first. Unreadable lines are skipped.
    async fn load_events(&self) -> Result<Vec<StoredEvent>, StoreError> {
        let path = self.data_dir.join(EVENTS_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredEvent>(line) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!(line = n + 1, error = %e, "skipping unreadable event log line"),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn save_webhook(&self, webhook: WebhookRegistration) -> Result<WebhookRegistration, StoreError> {
        let mut webhooks = self.webhooks.lock().await;
        let saved = match webhooks.get(&webhook.webhook_gid) {
            Some(existing) => WebhookRegistration {
                secret: webhook.secret,
                updated_at: Utc::now(),
                active: true,
                ..existing.clone()
            },
            None => webhook,
        };
        self.commit(&mut webhooks, saved.clone()).await?;
        Ok(saved)
    }

    async fn save_event(&self, mut event: StoredEvent) -> Result<StoredEvent, StoreError> {
        event.id = Uuid::new_v4().to_string();
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let _guard = self.log.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(EVENTS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(event)
    }

    async fn update_webhook_stats(&self, webhook_gid: &str) -> Result<Option<WebhookRegistration>, StoreError> {
        let mut webhooks = self.webhooks.lock().await;
        let updated = match webhooks.get(webhook_gid) {
            Some(wh) => WebhookRegistration {
                event_count: wh.event_count + 1,
                last_event_at: Some(Utc::now()),
                ..wh.clone()
            },
            None => return Ok(None),
        };
        self.commit(&mut webhooks, updated.clone()).await?;
        Ok(Some(updated))
    }

    async fn list_webhooks(&self) -> Result<Vec<WebhookRegistration>, StoreError> {
        let webhooks = self.webhooks.lock().await;
        let mut items: Vec<WebhookRegistration> =
            webhooks.values().filter(|w| w.active).cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn recent_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        let mut events: Vec<StoredEvent> = self
            .load_events()
            .await?
            .into_iter()
            .filter(|e| query.filter.matches(e))
            .collect();
        // Stable sort keeps log order among equal timestamps.
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(events.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn count_events(&self, filter: &EventFilter) -> Result<usize, StoreError> {
        Ok(self
            .load_events()
            .await?
            .iter()
            .filter(|e| filter.matches(e))
            .count())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let active_webhooks = self.webhooks.lock().await.values().filter(|w| w.active).count();
        let events = self.load_events().await?;
        let since = Utc::now() - Duration::hours(24);
        let recent: Vec<&StoredEvent> = events.iter().filter(|e| e.received_at > since).collect();

        Ok(StoreStats {
            active_webhooks,
            total_events: events.len(),
            events_24h: recent.len(),
            verified_events_24h: recent.iter().filter(|e| e.signature_verified).count(),
            last_event_time: events.iter().map(|e| e.received_at).max(),
        })
    }
}
