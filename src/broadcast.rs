use crate::history::HistoryBuffer;
use crate::types::{EventRecord, Notification};
use axum::response::sse::Event;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

pub type ClientId = u64;

/// One unit written to a stream client. A sink queues each frame as a
/// single entry, whatever its size.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A serialized notification, shared by every recipient.
    Message(Arc<str>),
    /// The `webhook_event` notifications of one delivery, in order.
    Batch(Arc<[Arc<str>]>),
    Heartbeat,
}

impl Frame {
    /// SSE events for this frame, in delivery order.
    pub fn into_sse_events(self) -> Vec<Event> {
        match self {
            Frame::Message(json) => vec![Event::default().data(&*json)],
            Frame::Batch(messages) => messages
                .iter()
                .map(|json| Event::default().data(&**json))
                .collect(),
            Frame::Heartbeat => vec![Event::default().comment("heartbeat")],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("subscriber is not keeping up")]
    Lagging,
    #[error("subscriber disconnected")]
    Closed,
}

/// Output side of one stream client. Delivery must not block.
pub trait StreamSink: Send + Sync {
    fn deliver(&self, frame: Frame) -> Result<(), SinkError>;
}

impl StreamSink for mpsc::Sender<Frame> {
    fn deliver(&self, frame: Frame) -> Result<(), SinkError> {
        self.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Lagging,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Registry of connected stream clients.
///
/// The broadcaster exclusively owns every sink. A failed write on one sink
/// removes that client and never interrupts delivery to the others.
pub struct Broadcaster {
    clients: Mutex<Registry>,
    next_id: AtomicU64,
    history: Arc<HistoryBuffer>,
}

impl Broadcaster {
    pub fn new(history: Arc<HistoryBuffer>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            history,
        }
    }

    /// Register `sink`, after pushing it a `connected` frame and a
    /// `history` frame with the current buffer.
    ///
    /// The registry lock is held across the replay, so no live frame can
    /// reach this client ahead of its history. If the initial frames cannot
    /// be written the client is never registered.
    pub fn subscribe<S>(&self, sink: S) -> Result<ClientId, SinkError>
    where
        S: StreamSink + 'static,
    {
        let mut clients = self.lock_clients();
        let events = self.history.snapshot();
        let count = events.len();

        sink.deliver(encode(&Notification::Connected {
            message: "Connected to Asana Webhook Receiver".to_string(),
            history_count: count,
            timestamp: Utc::now(),
        }))?;
        sink.deliver(encode(&Notification::History { events, count }))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        clients.insert(id, Box::new(sink));
        info!(client_id = id, total = clients.len(), "stream client connected");
        Ok(id)
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ClientId) -> bool {
        let mut clients = self.lock_clients();
        let removed = clients.remove(&id).is_some();
        if removed {
            info!(client_id = id, total = clients.len(), "stream client disconnected");
        }
        removed
    }

    /// Serialize `notification` once and write it to every client.
    /// Returns the number of clients that accepted it.
    pub fn publish(&self, notification: &Notification) -> usize {
        let delivered = self.deliver_all(encode(notification));
        if delivered > 0 {
            debug!(kind = notification.kind(), delivered, "broadcast");
        }
        delivered
    }

    /// Prepend each record of one delivery to the history, in order, and
    /// broadcast them as `webhook_event` notifications.
    ///
    /// The whole batch goes to each client as one [`Frame::Batch`], so a
    /// large delivery costs a client one queue slot. This is atomic with
    /// respect to [`Broadcaster::subscribe`]: a new client sees each record
    /// either in its replay or live, never both. Returns the records as
    /// stored in the history.
    pub fn record_batch(&self, records: Vec<EventRecord>) -> Vec<EventRecord> {
        if records.is_empty() {
            return Vec::new();
        }
        let total_events = records.len();
        let mut stored = Vec::with_capacity(total_events);
        let mut messages = Vec::with_capacity(total_events);

        let mut clients = self.lock_clients();
        for (i, record) in records.into_iter().enumerate() {
            let record = self.history.append(record);
            messages.push(encode_json(&Notification::WebhookEvent {
                event: record.clone(),
                total_events,
                current_index: i + 1,
            }));
            stored.push(record);
        }
        let delivered = deliver_locked(&mut clients, Frame::Batch(messages.into()));
        debug!(kind = "webhook_event", events = total_events, delivered, "broadcast");
        stored
    }

    /// Empty the history and broadcast `history_cleared`. Returns the
    /// number of records removed.
    pub fn clear_history(&self) -> usize {
        let mut clients = self.lock_clients();
        let cleared_count = self.history.clear();
        deliver_locked(
            &mut clients,
            encode(&Notification::HistoryCleared {
                cleared_count,
                timestamp: Utc::now(),
            }),
        );
        info!(cleared_count, "history cleared");
        cleared_count
    }

    /// Keep-alive to every client; failures take the same removal path.
    pub fn heartbeat(&self) -> usize {
        self.deliver_all(Frame::Heartbeat)
    }

    /// Drop every client. Their streams end once buffered frames drain.
    pub fn disconnect_all(&self) -> usize {
        let mut clients = self.lock_clients();
        let count = clients.len();
        clients.clear();
        if count > 0 {
            info!(count, "disconnected all stream clients");
        }
        count
    }

    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    /// Open a channel-backed subscription suitable for an SSE response.
    /// Dropping the returned stream unsubscribes the client.
    pub fn subscribe_stream(
        self: &Arc<Self>,
        buffer: usize,
    ) -> Result<SubscriberStream, SinkError> {
        let (tx, rx) = mpsc::channel(buffer.max(2));
        let id = self.subscribe(tx)?;
        Ok(SubscriberStream {
            id,
            frames: ReceiverStream::new(rx),
            pending: VecDeque::new(),
            broadcaster: Arc::clone(self),
        })
    }

    /// Send a heartbeat every `period` until the task is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let alive = broadcaster.heartbeat();
                debug!(alive, "heartbeat");
            }
        })
    }

    fn deliver_all(&self, frame: Frame) -> usize {
        deliver_locked(&mut self.lock_clients(), frame)
    }

    fn lock_clients(&self) -> MutexGuard<'_, Registry> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type Registry = HashMap<ClientId, Box<dyn StreamSink>>;

/// One delivery attempt per client; failed clients are removed.
fn deliver_locked(clients: &mut Registry, frame: Frame) -> usize {
    let mut failed = Vec::new();
    for (id, sink) in clients.iter() {
        if let Err(e) = sink.deliver(frame.clone()) {
            warn!(client_id = *id, error = %e, "dropping stream client");
            failed.push(*id);
        }
    }
    for id in &failed {
        clients.remove(id);
    }
    if !failed.is_empty() {
        info!(removed = failed.len(), total = clients.len(), "stream clients removed");
    }
    clients.len()
}

fn encode(notification: &Notification) -> Frame {
    Frame::Message(encode_json(notification))
}

fn encode_json(notification: &Notification) -> Arc<str> {
    match serde_json::to_string(notification) {
        Ok(json) => json.into(),
        Err(e) => {
            warn!(kind = notification.kind(), error = %e, "failed to serialize notification");
            r#"{"type":"error","error":"serialization failed"}"#.into()
        }
    }
}

/// Live frames of one SSE client.
pub struct SubscriberStream {
    id: ClientId,
    frames: ReceiverStream<Frame>,
    /// Remaining events of a dequeued batch.
    pending: VecDeque<Event>,
    broadcaster: Arc<Broadcaster>,
}

impl Stream for SubscriberStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            let frame = ready!(Pin::new(&mut this.frames).poll_next(cx));
            match frame {
                Some(frame) => this.pending.extend(frame.into_sse_events()),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicBool;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Frame>>>,
        broken: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .flat_map(|f| match f {
                    Frame::Message(json) => vec![serde_json::from_str(json).unwrap()],
                    Frame::Batch(messages) => messages
                        .iter()
                        .map(|json| serde_json::from_str(json).unwrap())
                        .collect(),
                    Frame::Heartbeat => Vec::new(),
                })
                .collect()
        }

        fn break_it(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    impl StreamSink for RecordingSink {
        fn deliver(&self, frame: Frame) -> Result<(), SinkError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct AlwaysFails;

    impl StreamSink for AlwaysFails {
        fn deliver(&self, _frame: Frame) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn cleared(n: usize) -> Notification {
        Notification::HistoryCleared {
            cleared_count: n,
            timestamp: Utc::now(),
        }
    }

    fn broadcaster_with_history(n: usize) -> Broadcaster {
        let history = Arc::new(HistoryBuffer::new(10));
        for i in 0..n {
            history.append(EventRecord::from_event(&json!({ "seq": i }), Utc::now(), false));
        }
        Broadcaster::new(history)
    }

    #[test]
    fn subscribe_replays_connected_then_history() {
        let b = broadcaster_with_history(2);
        let sink = RecordingSink::default();
        b.subscribe(sink.clone()).unwrap();

        let msgs = sink.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["type"], "connected");
        assert_eq!(msgs[0]["historyCount"], 2);
        assert_eq!(msgs[1]["type"], "history");
        assert_eq!(msgs[1]["count"], 2);
        assert_eq!(msgs[1]["events"][0]["full_event"]["seq"], 1);
    }

    #[test]
    fn history_frame_is_sent_even_when_empty() {
        let b = broadcaster_with_history(0);
        let sink = RecordingSink::default();
        b.subscribe(sink.clone()).unwrap();
        let msgs = sink.messages();
        assert_eq!(msgs[1]["type"], "history");
        assert_eq!(msgs[1]["events"], json!([]));
    }

    #[test]
    fn failing_client_is_isolated_and_removed() {
        let b = broadcaster_with_history(0);
        let one = RecordingSink::default();
        let two = RecordingSink::default();
        let three = RecordingSink::default();
        b.subscribe(one.clone()).unwrap();
        let two_id = b.subscribe(two.clone()).unwrap();
        b.subscribe(three.clone()).unwrap();
        two.break_it();

        let delivered = b.publish(&cleared(4));
        assert_eq!(delivered, 2);
        assert_eq!(b.client_count(), 2);
        assert_eq!(one.messages().last().unwrap()["clearedCount"], 4);
        assert_eq!(three.messages().last().unwrap()["clearedCount"], 4);
        assert!(!b.unsubscribe(two_id));
    }

    #[test]
    fn sink_failing_on_connect_is_never_registered() {
        let b = broadcaster_with_history(0);
        assert_eq!(b.subscribe(AlwaysFails), Err(SinkError::Closed));
        assert_eq!(b.client_count(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let b = broadcaster_with_history(0);
        let id = b.subscribe(RecordingSink::default()).unwrap();
        assert!(b.unsubscribe(id));
        assert!(!b.unsubscribe(id));
        assert_eq!(b.client_count(), 0);
    }

    #[test]
    fn heartbeat_removes_broken_clients() {
        let b = broadcaster_with_history(0);
        let ok = RecordingSink::default();
        let broken = RecordingSink::default();
        b.subscribe(ok.clone()).unwrap();
        b.subscribe(broken.clone()).unwrap();
        broken.break_it();

        assert_eq!(b.heartbeat(), 1);
        assert_eq!(ok.frames.lock().unwrap().last(), Some(&Frame::Heartbeat));
    }

    #[test]
    fn lagging_channel_is_dropped() {
        let b = broadcaster_with_history(0);
        let (tx, _rx) = mpsc::channel(2);
        b.subscribe(tx).unwrap();
        // connected + history already fill the buffer
        assert_eq!(b.publish(&cleared(1)), 0);
        assert_eq!(b.client_count(), 0);
    }

    #[test]
    fn closed_channel_is_dropped() {
        let b = broadcaster_with_history(0);
        let (tx, rx) = mpsc::channel(8);
        b.subscribe(tx).unwrap();
        drop(rx);
        assert_eq!(b.publish(&cleared(1)), 0);
        assert_eq!(b.client_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_unsubscribes() {
        let b = Arc::new(broadcaster_with_history(0));
        let stream = b.subscribe_stream(8).unwrap();
        assert_eq!(b.client_count(), 1);
        drop(stream);
        assert_eq!(b.client_count(), 0);
    }

    #[tokio::test]
    async fn stream_yields_replay_then_live_frames() {
        use tokio_stream::StreamExt;

        let b = Arc::new(broadcaster_with_history(0));
        let mut stream = b.subscribe_stream(8).unwrap();
        b.publish(&cleared(7));
        let mut n = 0;
        while let Some(Ok(_)) = stream.next().await {
            n += 1;
            if n == 3 {
                break;
            }
        }
        assert_eq!(n, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_task_ticks() {
        let b = Arc::new(broadcaster_with_history(0));
        let sink = RecordingSink::default();
        b.subscribe(sink.clone()).unwrap();
        let task = b.spawn_heartbeat(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(61)).await;
        task.abort();

        let beats = sink
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| **f == Frame::Heartbeat)
            .count();
        assert_eq!(beats, 2);
    }

    fn records(n: usize) -> Vec<EventRecord> {
        (0..n)
            .map(|i| {
                EventRecord::from_event(&json!({ "action": "added", "seq": i }), Utc::now(), true)
                    .with_index(i + 1)
            })
            .collect()
    }

    #[test]
    fn record_batch_appends_and_broadcasts() {
        let b = broadcaster_with_history(0);
        let sink = RecordingSink::default();
        b.subscribe(sink.clone()).unwrap();

        let stored = b.record_batch(records(2));
        assert_eq!(stored.len(), 2);

        let msgs = sink.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[2]["type"], "webhook_event");
        assert_eq!(msgs[2]["event"]["action"], "added");
        assert_eq!(msgs[2]["event"]["signature_verified"], true);
        assert_eq!(msgs[2]["totalEvents"], 2);
        assert_eq!(msgs[2]["currentIndex"], 1);
        assert_eq!(msgs[3]["currentIndex"], 2);
        assert_eq!(msgs[3]["event"]["index"], 2);
        assert_eq!(b.history.len(), 2);
        // one queued unit per delivery
        assert_eq!(sink.frames.lock().unwrap().len(), 3);
    }

    #[test]
    fn empty_batch_sends_nothing() {
        let b = broadcaster_with_history(0);
        let sink = RecordingSink::default();
        b.subscribe(sink.clone()).unwrap();
        assert!(b.record_batch(Vec::new()).is_empty());
        assert_eq!(sink.frames.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_larger_than_the_buffer_keeps_healthy_clients() {
        use tokio_stream::StreamExt;

        let b = Arc::new(broadcaster_with_history(0));
        let mut stream = b.subscribe_stream(4).unwrap();
        b.record_batch(records(70));
        assert_eq!(b.client_count(), 1);

        let mut events = 0;
        while let Some(Ok(_)) = stream.next().await {
            events += 1;
            if events == 72 {
                break;
            }
        }
        // connected + history + every event of the batch
        assert_eq!(events, 72);
        assert_eq!(b.client_count(), 1);
    }

    #[test]
    fn clear_history_reports_and_broadcasts() {
        let b = broadcaster_with_history(3);
        let sink = RecordingSink::default();
        b.subscribe(sink.clone()).unwrap();

        assert_eq!(b.clear_history(), 3);
        assert!(b.history.is_empty());
        let last = sink.messages().pop().unwrap();
        assert_eq!(last["type"], "history_cleared");
        assert_eq!(last["clearedCount"], 3);
    }

    #[tokio::test]
    async fn disconnect_all_ends_streams() {
        use tokio_stream::StreamExt;

        let b = Arc::new(broadcaster_with_history(0));
        let mut stream = b.subscribe_stream(8).unwrap();
        assert_eq!(b.disconnect_all(), 1);

        let mut frames = 0;
        while stream.next().await.is_some() {
            frames += 1;
        }
        // connected + history, then end of stream
        assert_eq!(frames, 2);
    }
}
