//! Consensus event stream
//!
//! Subscribers get their own bounded buffer. When a buffer is full the
//! publisher blocks until that subscriber catches up or the hub is closed, so
//! no subscriber ever misses an event; a subscriber that is dropped is pruned
//! on the next publish. Sequence numbers are assigned under the hub lock, so
//! every subscriber sees events in generation order.
//!
//! A node never publishes from its consensus path: it queues events for a
//! publisher thread of its own, and only that thread waits on slow readers.

use crate::types::{ConsensusEvent, EventType};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a blocked publish checks whether the hub was closed
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

struct Subscriber {
    id: u64,
    tx: Sender<ConsensusEvent>,
    include_heartbeats: bool,
}

#[derive(Default)]
struct HubInner {
    next_sequence: u64,
    next_subscriber_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of one node's events to any number of subscribers
pub struct EventHub {
    buffer_size: usize,
    closed: AtomicBool,
    inner: Mutex<HubInner>,
}

impl EventHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            closed: AtomicBool::new(false),
            inner: Mutex::new(HubInner::default()),
        }
    }

    /// Open a stream of every event published from now on
    pub fn subscribe(&self, include_heartbeats: bool) -> EventStream {
        let (tx, rx) = bounded(self.buffer_size);
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        if self.is_closed() {
            // already ended
            return EventStream { id, rx };
        }
        inner.subscribers.push(Subscriber {
            id,
            tx,
            include_heartbeats,
        });
        tracing::debug!("Event subscriber {} added", id);
        EventStream { id, rx }
    }

    /// Number the events and deliver them to every live subscriber
    pub fn publish(&self, events: Vec<ConsensusEvent>) {
        if events.is_empty() || self.is_closed() {
            return;
        }
        let mut inner = self.inner.lock();
        for mut event in events {
            event.sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let heartbeat = event.event_type == EventType::Heartbeat;
            inner.subscribers.retain(|sub| {
                if heartbeat && !sub.include_heartbeats {
                    return true;
                }
                self.deliver(sub, event.clone())
            });
        }
    }

    /// Blocks while the subscriber's buffer is full; false drops the subscriber
    fn deliver(&self, sub: &Subscriber, mut event: ConsensusEvent) -> bool {
        loop {
            match sub.tx.send_timeout(event, CLOSE_CHECK_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.is_closed() {
                        return false;
                    }
                    event = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    tracing::debug!("Event subscriber {} disconnected", sub.id);
                    return false;
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Sequence number the next event will carry
    pub fn next_sequence(&self) -> u64 {
        self.inner.lock().next_sequence
    }

    /// Drop every subscriber; their streams end once drained
    ///
    /// A publish blocked on a full buffer gives up, and later publishes are
    /// discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.lock().subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One subscriber's view of the event stream
///
/// Iterating blocks for the next event and ends when the hub is closed or
/// dropped.
pub struct EventStream {
    id: u64,
    rx: Receiver<ConsensusEvent>,
}

impl EventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` after `timeout` or once the stream has ended
    pub fn next_timeout(&self, timeout: Duration) -> Option<ConsensusEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Events already buffered, without blocking
    pub fn drain(&self) -> Vec<ConsensusEvent> {
        self.rx.try_iter().collect()
    }
}

impl Iterator for EventStream {
    type Item = ConsensusEvent;

    fn next(&mut self) -> Option<ConsensusEvent> {
        self.rx.recv().ok()
    }
}
