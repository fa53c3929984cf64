//! Fan-out of a session's output to every attached interface.
//!
//! The relay keeps a bounded ring of recent chunks for replay and one bounded
//! queue per subscriber. A slow subscriber only ever loses its own oldest
//! events: output beyond its capacity, and prompt traffic beyond
//! [`MAX_PROMPT_EVENTS`]. The closing notification is never dropped, and
//! nothing a subscriber does can block the publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, trace};

use crate::lock;
use crate::session::types::{BridgeEvent, CloseReason, InputOrigin, OutputChunk, SubscriberId};

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Prompt and resolution events held for one subscriber.
pub const MAX_PROMPT_EVENTS: usize = 16;

fn is_prompt_event(event: &BridgeEvent) -> bool {
    matches!(event, BridgeEvent::Prompt(_) | BridgeEvent::PromptResolved(_))
}

/// Receiving end of one attached interface.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

#[derive(Debug)]
struct SubscriberInner {
    id: SubscriberId,
    name: String,
    queue: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<BridgeEvent>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

impl Subscriber {
    /// Create a subscriber whose queue holds at most `capacity` output events.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(SubscriberInner {
                id,
                name: name.into(),
                queue: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    capacity: capacity.max(1),
                    dropped: 0,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Input origin for lines typed through this subscriber.
    pub fn origin(&self) -> InputOrigin {
        InputOrigin::Client {
            name: self.inner.name.clone(),
            subscriber: Some(self.inner.id),
        }
    }

    /// Queue an event without blocking.
    ///
    /// Output and prompt events are bounded separately; when either class is
    /// full its oldest queued event makes room. `SessionClosed` is always
    /// accepted. Returns false once the subscriber is closed.
    pub(crate) fn push(&self, event: BridgeEvent) -> bool {
        let mut queue = lock(&self.inner.queue);
        if queue.closed {
            return false;
        }

        let class: Option<(fn(&BridgeEvent) -> bool, usize)> = if event.is_droppable() {
            Some((BridgeEvent::is_droppable, queue.capacity))
        } else if is_prompt_event(&event) {
            Some((is_prompt_event, MAX_PROMPT_EVENTS))
        } else {
            None
        };

        if let Some((same_class, limit)) = class {
            let held = queue.events.iter().filter(|e| same_class(e)).count();
            let oldest = queue.events.iter().position(same_class);
            if held >= limit {
                if let Some(index) = oldest {
                    queue.events.remove(index);
                    queue.dropped += 1;
                    trace!(subscriber = %self.inner.id, "subscriber behind, dropped oldest event");
                }
            }
        }

        queue.events.push_back(event);
        drop(queue);
        self.inner.ready.notify_one();
        true
    }

    /// Block until an event arrives. `None` once closed and drained.
    pub fn recv(&self) -> Option<BridgeEvent> {
        let mut queue = lock(&self.inner.queue);
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            if queue.closed {
                return None;
            }
            queue = self
                .inner
                .ready
                .wait(queue)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like [`recv`](Self::recv) with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<BridgeEvent, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.inner.queue);
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Ok(event);
            }
            if queue.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvTimeoutError::Timeout);
            }
            queue = self
                .inner
                .ready
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_recv(&self) -> Option<BridgeEvent> {
        lock(&self.inner.queue).events.pop_front()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        lock(&self.inner.queue).dropped
    }

    /// Events queued and not yet received.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).events.len()
    }

    /// True once no further events will be queued.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.queue).closed
    }

    /// Stop accepting events and wake any blocked receiver. Queued events can
    /// still be drained.
    pub(crate) fn close(&self) {
        lock(&self.inner.queue).closed = true;
        self.inner.ready.notify_all();
    }
}

/// Replay buffer plus the set of live subscribers for one session.
#[derive(Debug)]
pub struct OutputRelay {
    inner: Mutex<RelayInner>,
}

#[derive(Debug)]
struct RelayInner {
    ring: VecDeque<OutputChunk>,
    ring_capacity: usize,
    next_sequence: u64,
    subscribers: HashMap<SubscriberId, Subscriber>,
    closed: Option<CloseReason>,
}

impl OutputRelay {
    /// `ring_capacity` is the number of recent chunks kept for replay.
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RelayInner {
                ring: VecDeque::with_capacity(ring_capacity),
                ring_capacity: ring_capacity.max(1),
                next_sequence: 1,
                subscribers: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Stamp `text` as the next chunk, buffer it and deliver it to everyone.
    ///
    /// Returns `None` after the relay has closed.
    pub fn publish(&self, text: impl Into<String>) -> Option<OutputChunk> {
        let mut inner = lock(&self.inner);
        if inner.closed.is_some() {
            return None;
        }

        let chunk = OutputChunk {
            sequence: inner.next_sequence,
            timestamp: Utc::now(),
            text: text.into(),
        };
        inner.next_sequence += 1;

        if inner.ring.len() >= inner.ring_capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(chunk.clone());

        for subscriber in inner.subscribers.values() {
            subscriber.push(BridgeEvent::Output(chunk.clone()));
        }
        Some(chunk)
    }

    /// Deliver a non-output event (prompt or resolution) to everyone.
    pub fn broadcast(&self, event: BridgeEvent) {
        let inner = lock(&self.inner);
        if inner.closed.is_some() {
            return;
        }
        for subscriber in inner.subscribers.values() {
            subscriber.push(event.clone());
        }
    }

    /// Register `subscriber`, queueing a replay of the buffered chunks first.
    ///
    /// Replay and registration happen under one lock, so no chunk is both
    /// replayed and delivered live, and none falls between the two. Fails
    /// with the close reason once the relay has closed.
    pub fn subscribe(&self, subscriber: &Subscriber) -> Result<(), CloseReason> {
        let mut inner = lock(&self.inner);
        if let Some(reason) = inner.closed {
            return Err(reason);
        }

        let chunks = inner.ring.iter().cloned().collect();
        subscriber.push(BridgeEvent::Replay { chunks });
        inner.subscribers.insert(subscriber.id(), subscriber.clone());
        debug!(subscriber = %subscriber.id(), name = subscriber.name(), "subscriber attached");
        Ok(())
    }

    /// Remove a subscriber. Its queue is closed; returns false if unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = lock(&self.inner).subscribers.remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.close();
                debug!(subscriber = %id, "subscriber detached");
                true
            }
            None => false,
        }
    }

    /// Queue a replay of buffered chunks with sequence greater than `after`
    /// (all of them for `None`) to one subscriber. Returns the number of
    /// chunks replayed.
    pub fn resync(&self, id: SubscriberId, after: Option<u64>) -> Option<usize> {
        let inner = lock(&self.inner);
        let subscriber = inner.subscribers.get(&id)?;
        let chunks: Vec<OutputChunk> = inner
            .ring
            .iter()
            .filter(|c| after.map_or(true, |seq| c.sequence > seq))
            .cloned()
            .collect();
        let count = chunks.len();
        subscriber.push(BridgeEvent::Replay { chunks });
        Some(count)
    }

    /// Send the closing event to every subscriber and refuse further output.
    ///
    /// Only the first call has any effect; returns whether this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut inner = lock(&self.inner);
        if inner.closed.is_some() {
            return false;
        }
        inner.closed = Some(reason);

        for (_, subscriber) in inner.subscribers.drain() {
            subscriber.push(BridgeEvent::SessionClosed { reason });
            subscriber.close();
        }
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.inner).closed
    }

    /// The last `count` buffered chunks, oldest first.
    pub fn recent(&self, count: usize) -> Vec<OutputChunk> {
        let inner = lock(&self.inner);
        let skip = inner.ring.len().saturating_sub(count);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    pub fn buffered(&self) -> usize {
        lock(&self.inner).ring.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Sequence number of the newest chunk, 0 before any output.
    pub fn last_sequence(&self) -> u64 {
        lock(&self.inner).next_sequence - 1
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::session::types::PromptResolution;

    fn sequences(events: &[BridgeEvent]) -> Vec<u64> {
        events
            .iter()
            .flat_map(|e| match e {
                BridgeEvent::Output(c) => vec![c.sequence],
                BridgeEvent::Replay { chunks } => chunks.iter().map(|c| c.sequence).collect(),
                _ => vec![],
            })
            .collect()
    }

    fn drain(subscriber: &Subscriber) -> Vec<BridgeEvent> {
        std::iter::from_fn(|| subscriber.try_recv()).collect()
    }

    #[test]
    fn every_subscriber_sees_the_same_sequence() {
        let relay = OutputRelay::new(10);
        let a = Subscriber::new("a", 100);
        let b = Subscriber::new("b", 100);
        relay.subscribe(&a).unwrap();
        relay.subscribe(&b).unwrap();

        for i in 0..5 {
            relay.publish(format!("chunk {i}"));
        }

        let a_events = drain(&a);
        let b_events = drain(&b);
        assert_eq!(sequences(&a_events), vec![1, 2, 3, 4, 5]);
        assert_eq!(a_events, b_events);
    }

    #[test]
    fn attach_replays_ring_then_goes_live() {
        let relay = OutputRelay::new(3);
        for i in 0..5 {
            relay.publish(format!("early {i}"));
        }

        let late = Subscriber::new("late", 100);
        relay.subscribe(&late).unwrap();
        relay.publish("live");

        let events = drain(&late);
        assert!(matches!(events[0], BridgeEvent::Replay { .. }));
        assert_eq!(sequences(&events), vec![3, 4, 5, 6]);
    }

    #[test]
    fn attach_to_empty_relay_gets_empty_replay() {
        let relay = OutputRelay::new(3);
        let sub = Subscriber::new("first", 10);
        relay.subscribe(&sub).unwrap();
        assert_eq!(sub.try_recv(), Some(BridgeEvent::Replay { chunks: vec![] }));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn slow_subscriber_keeps_newest_output() {
        let relay = OutputRelay::new(50);
        let fast = Subscriber::new("fast", 100);
        let slow = Subscriber::new("slow", 5);
        relay.subscribe(&fast).unwrap();
        relay.subscribe(&slow).unwrap();
        // Discard the initial replays.
        fast.try_recv();
        slow.try_recv();

        for i in 0..10 {
            relay.publish(format!("line {i}"));
        }

        assert_eq!(sequences(&drain(&slow)), vec![6, 7, 8, 9, 10]);
        assert_eq!(slow.dropped(), 5);
        assert_eq!(sequences(&drain(&fast)), (1..=10).collect::<Vec<_>>());
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn control_events_survive_a_full_queue() {
        let relay = OutputRelay::new(50);
        let slow = Subscriber::new("slow", 2);
        relay.subscribe(&slow).unwrap();
        for i in 0..5 {
            relay.publish(format!("line {i}"));
        }
        relay.close(CloseReason::IdleTimeout);

        let events = drain(&slow);
        assert_eq!(
            events.last(),
            Some(&BridgeEvent::SessionClosed {
                reason: CloseReason::IdleTimeout
            })
        );
        assert_eq!(sequences(&events), vec![4, 5]);
    }

    #[test]
    fn prompt_traffic_is_bounded_for_a_stalled_subscriber() {
        let relay = OutputRelay::new(50);
        let stalled = Subscriber::new("stalled", 5);
        relay.subscribe(&stalled).unwrap();
        relay.publish("before");

        for prompt_id in 1..=1000 {
            relay.broadcast(BridgeEvent::PromptResolved(PromptResolution {
                prompt_id,
                choice: "n".into(),
                answered_by: InputOrigin::System,
            }));
        }
        assert_eq!(stalled.pending(), 2 + MAX_PROMPT_EVENTS);
        assert_eq!(stalled.dropped(), 1000 - MAX_PROMPT_EVENTS as u64);

        relay.close(CloseReason::ProcessCrashed);
        let events = drain(&stalled);
        assert_eq!(events.len(), 3 + MAX_PROMPT_EVENTS);
        assert_eq!(sequences(&events), vec![1]);
        let kept: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::PromptResolved(r) => Some(r.prompt_id),
                _ => None,
            })
            .collect();
        assert_eq!(kept, (985..=1000).collect::<Vec<_>>());
        assert_eq!(
            events.last(),
            Some(&BridgeEvent::SessionClosed {
                reason: CloseReason::ProcessCrashed
            })
        );
    }

    #[test]
    fn close_is_delivered_once_and_stops_output() {
        let relay = OutputRelay::new(5);
        let sub = Subscriber::new("sub", 10);
        relay.subscribe(&sub).unwrap();
        sub.try_recv();

        assert!(relay.close(CloseReason::ProcessCrashed));
        assert!(!relay.close(CloseReason::ExplicitDisconnect));
        assert!(relay.publish("after").is_none());

        assert_eq!(
            sub.recv(),
            Some(BridgeEvent::SessionClosed {
                reason: CloseReason::ProcessCrashed
            })
        );
        assert_eq!(sub.recv(), None);
        assert!(sub.is_closed());
        assert_eq!(relay.close_reason(), Some(CloseReason::ProcessCrashed));
        assert_eq!(
            relay.subscribe(&Subscriber::new("late", 10)),
            Err(CloseReason::ProcessCrashed)
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let relay = OutputRelay::new(5);
        let sub = Subscriber::new("sub", 10);
        relay.subscribe(&sub).unwrap();
        assert!(relay.unsubscribe(sub.id()));
        assert!(!relay.unsubscribe(sub.id()));

        relay.publish("ignored");
        assert_eq!(sequences(&drain(&sub)), Vec::<u64>::new());
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[test]
    fn resync_replays_only_missing_chunks() {
        let relay = OutputRelay::new(10);
        let sub = Subscriber::new("sub", 10);
        relay.subscribe(&sub).unwrap();
        for i in 0..4 {
            relay.publish(format!("{i}"));
        }
        drain(&sub);

        assert_eq!(relay.resync(sub.id(), Some(2)), Some(2));
        assert_eq!(sequences(&drain(&sub)), vec![3, 4]);
        assert_eq!(relay.resync(SubscriberId(u64::MAX), None), None);
    }

    #[test]
    fn recv_blocks_until_publish() {
        let relay = Arc::new(OutputRelay::new(5));
        let sub = Subscriber::new("waiter", 10);
        relay.subscribe(&sub).unwrap();
        sub.try_recv();

        let publisher = Arc::clone(&relay);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            publisher.publish("wake");
        });

        let event = sub.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, BridgeEvent::Output(c) if c.text == "wake"));
        handle.join().unwrap();

        assert_eq!(
            sub.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn recent_and_sequence_bookkeeping() {
        let relay = OutputRelay::new(3);
        assert_eq!(relay.last_sequence(), 0);
        for i in 0..5 {
            relay.publish(format!("{i}"));
        }
        assert_eq!(relay.last_sequence(), 5);
        assert_eq!(relay.buffered(), 3);
        let recent: Vec<u64> = relay.recent(2).iter().map(|c| c.sequence).collect();
        assert_eq!(recent, vec![4, 5]);
    }
}
