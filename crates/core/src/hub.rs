//! The streaming hub, redesigned away from
//! `original_source/stream/stream.go`'s package-level global channels:
//! buses here are instance-scoped, owned by whoever constructs them (the
//! service facade), and passed in explicitly — the same posture
//! `crates/server/src/handler.rs` takes with its
//! `write_tx: mpsc::Sender<WriteOp>` field rather than a process-wide
//! channel.
//!
//! Delivery rides on `tokio::sync::broadcast`: a lagging subscriber's oldest
//! queued messages are the ones dropped when its buffer fills (the
//! channel's own semantics), matching the desired "newest-wins,
//! drop-oldest" overflow policy without hand-rolling it.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default bound on each subscriber's queue (a recommended 64 entries).
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// A single-message-type fan-out bus. Generic over the payload so
/// `ObjectBus` and `EventBus` share one implementation.
pub struct Bus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
    /// Receivers not yet claimed by `get_stream`. `subscribe` inserts here;
    /// `get_stream` removes and hands ownership to the caller.
    pending: Mutex<HashMap<String, broadcast::Receiver<T>>>,
}

impl<T: Clone + Send + 'static> Bus<T> {
    pub fn new(queue_depth: usize) -> Self {
        let (tx, _rx) = broadcast::channel(queue_depth.max(1));
        Self {
            tx,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new subscriber slot and returns its id. If the caller
    /// omits an id, one is generated. Re-subscribing with an existing id
    /// replaces that slot's receiver (the old one, if never claimed via
    /// `get_stream`, is dropped).
    pub fn subscribe(&self, client_id: Option<String>) -> String {
        let id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.pending.lock().insert(id.clone(), self.tx.subscribe());
        id
    }

    /// Claims the receive end for `client_id`, if it hasn't already been
    /// claimed. Returns `None` for an unknown or already-claimed id.
    pub fn get_stream(&self, client_id: &str) -> Option<broadcast::Receiver<T>> {
        self.pending.lock().remove(client_id)
    }

    /// Drops an unclaimed slot. A stream already handed out via
    /// `get_stream` is closed by the caller simply dropping its receiver.
    pub fn unsubscribe(&self, client_id: &str) {
        self.pending.lock().remove(client_id);
    }

    /// Number of receivers currently alive, claimed or not.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Delivers `msg` to every live subscriber. `send` never blocks: a full
    /// subscriber buffer simply overwrites its oldest entry.
    pub fn publish(&self, msg: T) {
        let _ = self.tx.send(msg);
    }
}

pub type ObjectBus = Bus<geodb_types::ObjectDetail>;
pub type EventBus = Bus<geodb_types::EventBatch>;
