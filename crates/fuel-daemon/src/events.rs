//! Daemon-wide event publication.
//!
//! Every broadcast event gets a monotonically increasing `event_id` and,
//! except snapshots, is kept in a bounded log so reattaching clients can
//! catch up on what they missed.

use fuel_ipc::{IpcMessage, Payload};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Events retained for replay.
pub const EVENT_LOG_CAPACITY: usize = 512;

const CHANNEL_CAPACITY: usize = 1024;

struct EventLog {
    next_id: u64,
    entries: VecDeque<IpcMessage>,
}

struct BusInner {
    instance_id: String,
    tx: broadcast::Sender<IpcMessage>,
    log: Mutex<EventLog>,
}

/// Cloneable handle for publishing and subscribing to daemon events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                instance_id: instance_id.into(),
                tx,
                log: Mutex::new(EventLog {
                    next_id: 1,
                    entries: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
                }),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    fn log(&self) -> MutexGuard<'_, EventLog> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Broadcast an event to every subscriber.
    pub fn publish(&self, payload: Payload) -> IpcMessage {
        let mut log = self.log();
        let id = log.next_id;
        log.next_id += 1;

        let retain = !matches!(payload, Payload::Snapshot(_));
        let message = IpcMessage::new(payload, self.inner.instance_id.clone()).with_event_id(id);
        if retain {
            if log.entries.len() == EVENT_LOG_CAPACITY {
                log.entries.pop_front();
            }
            log.entries.push_back(message.clone());
        }

        // Sent under the lock so subscribers observe ids in order.
        let _ = self.inner.tx.send(message.clone());
        message
    }

    /// An unbroadcast message addressed to one client.
    pub fn reply(&self, payload: Payload, request_id: Option<String>) -> IpcMessage {
        IpcMessage::new(payload, self.inner.instance_id.clone()).with_request_id(request_id)
    }

    /// Retained events with an id greater than `after`.
    pub fn replay_after(&self, after: u64) -> Vec<IpcMessage> {
        self.log()
            .entries
            .iter()
            .filter(|m| m.event_id.is_some_and(|id| id > after))
            .cloned()
            .collect()
    }

    /// Id of the most recently published event, zero before the first.
    pub fn last_event_id(&self) -> u64 {
        self.log().next_id - 1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpcMessage> {
        self.inner.tx.subscribe()
    }
}
