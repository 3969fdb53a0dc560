//! Change notification channel from adapters to state cells.
//!
//! A per-adapter broadcast: every subscriber sees every event sent after it
//! joined, and a late subscriber is first replayed the latest event for each
//! key it watches.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::warn;

use crate::value::PrimitiveValue;

/// Default broadcast capacity per adapter.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// Type of change that occurred to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A value was written.
    Saved,
    /// The key was removed (or a null was written).
    Removed,
}

/// A change to one key, as observed through an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The key that changed.
    pub key: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// New value; `None` for removals.
    pub value: Option<PrimitiveValue>,
}

impl ChangeEvent {
    /// Create a Saved event.
    pub fn saved(key: impl Into<String>, value: PrimitiveValue) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Saved,
            value: Some(value),
        }
    }

    /// Create a Removed event.
    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Removed,
            value: None,
        }
    }

    /// Build the event matching a `save_data(key, value)` call.
    pub fn for_write(key: impl Into<String>, value: Option<PrimitiveValue>) -> Self {
        match value {
            Some(v) => Self::saved(key, v),
            None => Self::removed(key),
        }
    }
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// A stream of change events for one key or key pattern.
pub struct ChangeStream {
    replay: VecDeque<ChangeEvent>,
    inner: BroadcastStream<ChangeEvent>,
    pattern: String,
}

impl ChangeStream {
    fn new(
        receiver: broadcast::Receiver<ChangeEvent>,
        replay: VecDeque<ChangeEvent>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            replay,
            inner: BroadcastStream::new(receiver),
            pattern: pattern.into(),
        }
    }

    /// Get the pattern this stream is watching.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, key: &str) -> bool {
        pattern_matches(&self.pattern, key)
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.replay.pop_front() {
            return Poll::Ready(Some(event));
        }
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.matches(&event.key) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!("change stream `{}` lagged, skipped {} events", self.pattern, skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

struct Shared {
    sender: broadcast::Sender<ChangeEvent>,
    latest: BTreeMap<String, ChangeEvent>,
}

/// Handle adapters use to publish change events.
#[derive(Clone)]
pub struct ChangeSender {
    shared: Arc<Mutex<Shared>>,
}

impl ChangeSender {
    /// Create a new change sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Mutex::new(Shared {
                sender,
                latest: BTreeMap::new(),
            })),
        }
    }

    /// Send an event to all subscribers and remember it for late joiners.
    pub fn send(&self, event: ChangeEvent) {
        let mut shared = self.shared.lock();
        shared.latest.insert(event.key.clone(), event.clone());
        // No subscribers is not an error
        let _ = shared.sender.send(event);
    }

    /// Subscribe to events for a key, or a prefix when the pattern ends in `*`.
    pub fn subscribe(&self, pattern: impl Into<String>) -> ChangeStream {
        let pattern = pattern.into();
        let shared = self.shared.lock();
        let replay = shared
            .latest
            .values()
            .filter(|event| pattern_matches(&pattern, &event.key))
            .cloned()
            .collect();
        ChangeStream::new(shared.sender.subscribe(), replay, pattern)
    }

    /// The latest event sent for a key, if any.
    pub fn latest(&self, key: &str) -> Option<ChangeEvent> {
        self.shared.lock().latest.get(key).cloned()
    }

    /// Get the number of current subscribers.
    pub fn receiver_count(&self) -> usize {
        self.shared.lock().sender.receiver_count()
    }
}

impl Default for ChangeSender {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_CAPACITY)
    }
}
