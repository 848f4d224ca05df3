//! Live event fan-out.
//!
//! ```text
//! producer ── publish(event) ──┬── try_send ──► subscriber 1 queue ──► SSE stream
//!                              ├── try_send ──► subscriber 2 queue ──► SSE stream
//!                              └── try_send ──► subscriber 3 queue ──► SSE stream
//! ```
//!
//! Each subscriber owns a bounded queue. A push that fails (receiver gone or
//! queue full) closes that subscriber only; the others are never blocked.
//! The registry lock is synchronous and never held across an await.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cronpilot_config::EventsConfig;
use cronpilot_types::{EventSink, LiveEvent};

/// Sent as the acknowledgement comment when a stream opens.
pub const ACK_COMMENT: &str = "connected";

/// Smallest usable queue: the retry hint, the acknowledgement and one event.
pub const MIN_BUFFER: usize = 3;

/// Errors internal to the hub. Never surfaced to users.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("subscriber {0} is closed")]
    StreamClosed(u64),
    #[error("event hub is not running")]
    Stopped,
}

/// One unit of output on a subscriber stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reconnection delay hint, sent once at open.
    Retry(Duration),
    Comment(String),
    Event(LiveEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberState {
    Connecting,
    Open,
    Closed,
}

struct Subscriber {
    tx: mpsc::Sender<Frame>,
    state: SubscriberState,
    heartbeat: CancellationToken,
}

struct HubInner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    /// `Some` while running; cancelling it stops every heartbeat.
    lifecycle: Mutex<Option<CancellationToken>>,
    heartbeat: Duration,
    retry: Duration,
    buffer: usize,
}

/// Registry of live subscribers. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(heartbeat: Duration, retry: Duration, buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                lifecycle: Mutex::new(None),
                heartbeat,
                retry,
                buffer: buffer.max(MIN_BUFFER),
            }),
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(
            Duration::from_secs(config.heartbeat_secs),
            Duration::from_millis(config.retry_ms),
            config.buffer_size,
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, Subscriber>> {
        self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, Subscriber>> {
        self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept subscribers. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.is_some() {
            return false;
        }
        *lifecycle = Some(CancellationToken::new());
        info!(heartbeat_secs = self.inner.heartbeat.as_secs(), "Event hub started");
        true
    }

    /// Close every subscriber and stop accepting new ones.
    pub fn stop(&self) {
        let Some(token) = self.lifecycle().take() else {
            return;
        };
        token.cancel();
        let drained: Vec<(u64, Subscriber)> = self.write().drain().collect();
        for (_, sub) in &drained {
            sub.heartbeat.cancel();
        }
        info!(closed = drained.len(), "Event hub stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle().is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// State of a subscriber. Unknown ids are reported as closed.
    pub fn state(&self, id: u64) -> SubscriberState {
        self.read()
            .get(&id)
            .map_or(SubscriberState::Closed, |s| s.state)
    }

    /// Register a new subscriber stream.
    pub fn subscribe(&self) -> Result<Subscription, HubError> {
        let heartbeat = self
            .lifecycle()
            .as_ref()
            .map(CancellationToken::child_token)
            .ok_or(HubError::Stopped)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.write().insert(
            id,
            Subscriber {
                tx,
                state: SubscriberState::Connecting,
                heartbeat: heartbeat.clone(),
            },
        );

        let subscription = Subscription {
            id,
            rx,
            hub: self.clone(),
        };

        self.send_to(id, Frame::Retry(self.inner.retry))?;
        self.send_to(id, Frame::Comment(ACK_COMMENT.to_string()))?;
        if let Some(sub) = self.write().get_mut(&id) {
            sub.state = SubscriberState::Open;
        }
        self.spawn_heartbeat(id, heartbeat);

        debug!(subscriber = id, "Subscriber opened");
        Ok(subscription)
    }

    fn spawn_heartbeat(&self, id: u64, token: CancellationToken) {
        let hub = self.clone();
        let period = self.inner.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if hub.send_to(id, Frame::Event(LiveEvent::Heartbeat)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Push one frame to one subscriber, closing it on failure.
    fn send_to(&self, id: u64, frame: Frame) -> Result<(), HubError> {
        let result = match self.read().get(&id) {
            Some(sub) => sub.tx.try_send(frame),
            None => return Err(HubError::StreamClosed(id)),
        };
        result.map_err(|_| {
            self.close(id);
            HubError::StreamClosed(id)
        })
    }

    /// Deliver an event to every open subscriber. Returns how many got it.
    pub fn publish(&self, event: LiveEvent) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let subscribers = self.read();
            for (id, sub) in subscribers.iter() {
                if sub.state != SubscriberState::Open {
                    continue;
                }
                match sub.tx.try_send(Frame::Event(event.clone())) {
                    Ok(()) => delivered += 1,
                    Err(_) => failed.push(*id),
                }
            }
        }
        for id in failed {
            self.close(id);
        }
        debug!(event = event.name(), job_id = event.job_id(), delivered, "Event published");
        delivered
    }

    /// Remove a subscriber and stop its heartbeat.
    pub fn close(&self, id: u64) {
        let removed = self.write().remove(&id);
        if let Some(sub) = removed {
            sub.heartbeat.cancel();
            debug!(subscriber = id, "Subscriber closed");
        }
    }
}

impl EventSink for BroadcastHub {
    fn publish(&self, event: LiveEvent) {
        BroadcastHub::publish(self, event);
    }
}

/// Receiving end of one subscriber. Dropping it closes the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Frame>,
    hub: BroadcastHub,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.close(self.id);
    }
}
