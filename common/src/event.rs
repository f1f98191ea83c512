//! Event Substrate
//!
//! Events carry a kind and a tag; nothing else crosses threads. The
//! queues are fixed-capacity lock-free rings; a full queue is the
//! system's only admission control, so both enqueue ladders (spin
//! forever for completions, spin-then-escalate for the master) live
//! here next to the plain try operations.

use crate::tag::Tag;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Spin iterations before an enqueue ladder falls back to timed parks.
const SPIN_RETRIES: usize = 64;
/// Park interval once spinning has not freed space.
const PARK: Duration = Duration::from_micros(1);
/// Parked retries after which the master treats a full queue as a
/// deadlock and escalates.
const FATAL_RETRIES: usize = 1_000_000;

/// Discriminant of every event in the system. Request kinds are consumed
/// by workers; `*Done` kinds and `PacketRx` flow to the master;
/// `PacketTx` flows to the transmit thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PacketRx,
    Fft,
    FftDone,
    Zf,
    ZfDone,
    Demul,
    DemulDone,
    Decode,
    DecodeDone,
    Encode,
    EncodeDone,
    Precode,
    PrecodeDone,
    Ifft,
    IfftDone,
    PacketTx,
}

impl EventKind {
    /// The completion kind a worker posts after running this request.
    pub fn completion(&self) -> EventKind {
        match self {
            EventKind::Fft => EventKind::FftDone,
            EventKind::Zf => EventKind::ZfDone,
            EventKind::Demul => EventKind::DemulDone,
            EventKind::Decode => EventKind::DecodeDone,
            EventKind::Encode => EventKind::EncodeDone,
            EventKind::Precode => EventKind::PrecodeDone,
            EventKind::Ifft => EventKind::IfftDone,
            other => unreachable!("{other:?} is not a request kind"),
        }
    }

    /// Big-station stage group this request kind belongs to. Downlink
    /// kinds share the group of their uplink mirror.
    pub fn stage_group(&self) -> usize {
        match self {
            EventKind::Fft | EventKind::Ifft => 0,
            EventKind::Zf => 1,
            EventKind::Demul | EventKind::Precode => 2,
            EventKind::Decode | EventKind::Encode => 3,
            other => unreachable!("{other:?} is not a request kind"),
        }
    }
}

/// One unit of cross-thread communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub tag: Tag,
}

impl Event {
    pub fn new(kind: EventKind, tag: Tag) -> Self {
        Self { kind, tag }
    }
}

/// Raised when the master's escalation ladder exhausts its retries.
#[derive(Error, Debug)]
#[error("event queue saturated after {retries} retries enqueueing {kind:?}")]
pub struct QueueSaturated {
    pub kind: EventKind,
    pub retries: usize,
}

/// Fixed-capacity lock-free MPMC event ring.
///
/// FIFO per producer; no cross-producer ordering. `try_enqueue_bulk` is
/// all-or-none under the sole-producer discipline the scheduler follows
/// for its request queues.
pub struct EventQueue {
    ring: ArrayQueue<Event>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity),
        }
    }

    /// Non-blocking enqueue. Returns false when the ring is full.
    pub fn try_enqueue(&self, event: Event) -> bool {
        self.ring.push(event).is_ok()
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<Event> {
        self.ring.pop()
    }

    /// All-or-none burst enqueue.
    ///
    /// Consumers only ever free space, so once the spare capacity covers
    /// the burst every push must succeed, provided this thread is the
    /// queue's only producer, which holds for the master's request
    /// queues.
    pub fn try_enqueue_bulk(&self, events: &[Event]) -> bool {
        if self.ring.capacity() - self.ring.len() < events.len() {
            return false;
        }
        for &event in events {
            let pushed = self.ring.push(event).is_ok();
            debug_assert!(pushed, "bulk enqueue raced another producer");
        }
        true
    }

    /// Retry with backoff until the event fits or `running` clears.
    ///
    /// Used by workers for completions: losing a completion would
    /// deadlock its frame, so there is no failure path short of
    /// shutdown. Returns false only when shutting down.
    pub fn enqueue_spin(&self, event: Event, running: &AtomicBool) -> bool {
        let backoff = Backoff::new();
        let mut spins = 0usize;
        loop {
            if self.try_enqueue(event) {
                return true;
            }
            if spins < SPIN_RETRIES {
                backoff.snooze();
                spins += 1;
            } else {
                if !running.load(Ordering::Relaxed) {
                    return false;
                }
                std::thread::sleep(PARK);
            }
        }
    }

    /// The master's ladder: bounded spin, then 1 µs parks, then a
    /// saturation error so liveness bugs surface instead of hanging.
    pub fn enqueue_escalating(&self, event: Event) -> Result<(), QueueSaturated> {
        let backoff = Backoff::new();
        for retry in 0..FATAL_RETRIES {
            if self.try_enqueue(event) {
                return Ok(());
            }
            if retry < SPIN_RETRIES {
                backoff.snooze();
            } else {
                std::thread::sleep(PARK);
            }
        }
        Err(QueueSaturated {
            kind: event.kind,
            retries: FATAL_RETRIES,
        })
    }

    /// Bulk form of the escalation ladder.
    pub fn enqueue_bulk_escalating(&self, events: &[Event]) -> Result<(), QueueSaturated> {
        let backoff = Backoff::new();
        for retry in 0..FATAL_RETRIES {
            if self.try_enqueue_bulk(events) {
                return Ok(());
            }
            if retry < SPIN_RETRIES {
                backoff.snooze();
            } else {
                std::thread::sleep(PARK);
            }
        }
        Err(QueueSaturated {
            kind: events[0].kind,
            retries: FATAL_RETRIES,
        })
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Per-thread handle for posting events toward the master.
///
/// Each producing thread (worker or receive thread) owns one queue on
/// the completion bus, which keeps per-producer FIFO order without any
/// cross-producer coordination.
#[derive(Clone)]
pub struct CompletionProducer {
    id: usize,
    queue: Arc<EventQueue>,
}

impl CompletionProducer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn try_send(&self, event: Event) -> bool {
        self.queue.try_enqueue(event)
    }

    /// Post with the spin-forever ladder; false only on shutdown.
    pub fn send(&self, event: Event, running: &AtomicBool) -> bool {
        self.queue.enqueue_spin(event, running)
    }
}

/// The master-facing side of all per-producer queues.
pub struct CompletionBus {
    queues: Vec<Arc<EventQueue>>,
}

impl CompletionBus {
    pub fn new(producers: usize, capacity: usize) -> Self {
        Self {
            queues: (0..producers)
                .map(|_| Arc::new(EventQueue::new(capacity)))
                .collect(),
        }
    }

    pub fn num_producers(&self) -> usize {
        self.queues.len()
    }

    /// The producer token for thread `id`.
    pub fn producer(&self, id: usize) -> CompletionProducer {
        CompletionProducer {
            id,
            queue: Arc::clone(&self.queues[id]),
        }
    }

    /// Dequeue from producer `id`'s queue.
    pub fn try_dequeue(&self, id: usize) -> Option<Event> {
        self.queues[id].try_dequeue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(kind: EventKind, raw: u64) -> Event {
        Event::new(kind, Tag(raw))
    }

    #[test]
    fn test_fifo_per_producer() {
        let q = EventQueue::new(8);
        for i in 0..5 {
            assert!(q.try_enqueue(ev(EventKind::Fft, i)));
        }
        for i in 0..5 {
            assert_eq!(q.try_dequeue().unwrap().tag.0, i);
        }
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn test_bulk_all_or_none() {
        let q = EventQueue::new(4);
        let burst: Vec<Event> = (0..3).map(|i| ev(EventKind::Zf, i)).collect();
        assert!(q.try_enqueue_bulk(&burst));
        // Only one slot left: a burst of three must be refused whole
        assert!(!q.try_enqueue_bulk(&burst));
        assert_eq!(q.len(), 3);
        assert!(q.try_enqueue(ev(EventKind::Zf, 99)));
    }

    #[test]
    fn test_backpressure_no_loss() {
        let q = Arc::new(EventQueue::new(4));
        let running = Arc::new(AtomicBool::new(true));
        let total = 256u64;

        let producer = {
            let q = Arc::clone(&q);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                for i in 0..total {
                    assert!(q.enqueue_spin(ev(EventKind::DemulDone, i), &running));
                }
            })
        };

        // Deliberately slow consumer: the producer must stall, not lose
        let mut seen = 0u64;
        while seen < total {
            if let Some(event) = q.try_dequeue() {
                assert_eq!(event.tag.0, seen);
                seen += 1;
            }
            if seen % 32 == 0 {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_completion_bus_routing() {
        let bus = CompletionBus::new(2, 8);
        let p0 = bus.producer(0);
        let p1 = bus.producer(1);
        assert!(p0.try_send(ev(EventKind::FftDone, 10)));
        assert!(p1.try_send(ev(EventKind::ZfDone, 20)));
        assert_eq!(bus.try_dequeue(0).unwrap().tag.0, 10);
        assert_eq!(bus.try_dequeue(1).unwrap().tag.0, 20);
    }

    #[test]
    fn test_completion_kinds() {
        assert_eq!(EventKind::Fft.completion(), EventKind::FftDone);
        assert_eq!(EventKind::Precode.completion(), EventKind::PrecodeDone);
        assert_eq!(EventKind::Demul.stage_group(), EventKind::Precode.stage_group());
    }
}
