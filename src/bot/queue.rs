// src/bot/queue.rs - Bounded, drop-on-full inbound queue shared by dispatcher and one processor

use log::warn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::Event;

/// What happened to one pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the event is gone
    Dropped,
    /// The owning processor is not running
    Stopped,
}

/// Sending half of a feature's queue. Pushing never waits.
#[derive(Clone)]
pub struct EventQueue {
    name: &'static str,
    tx: mpsc::Sender<Event>,
    open: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl EventQueue {
    /// Create a closed queue of `capacity` slots and its receiving half
    pub fn bounded(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            name,
            tx,
            open: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, rx)
    }

    pub fn push(&self, event: Event) -> PushOutcome {
        if !self.is_open() {
            return PushOutcome::Stopped;
        }

        match self.tx.try_send(event) {
            Ok(()) => PushOutcome::Queued,
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "[{}] queue full, dropping {} from {} in {} ({} dropped so far)",
                    self.name,
                    event.kind.as_str(),
                    event.user_id,
                    event.channel_id,
                    total
                );
                PushOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Stopped,
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    fn event(n: usize) -> Event {
        Event::new(EventKind::Message, "U1", "C1", format!("msg {}", n), n.to_string())
    }

    #[test]
    fn test_overflow_drops_exactly_one_and_keeps_order() {
        const CAPACITY: usize = 4;
        let (queue, mut rx) = EventQueue::bounded("test", CAPACITY);
        queue.open();

        let outcomes: Vec<PushOutcome> = (0..=CAPACITY).map(|n| queue.push(event(n))).collect();
        assert_eq!(outcomes.iter().filter(|o| **o == PushOutcome::Dropped).count(), 1);
        assert_eq!(outcomes[CAPACITY], PushOutcome::Dropped);
        assert_eq!(queue.dropped(), 1);

        let received: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.message_id)
            .collect();
        assert_eq!(received, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_closed_queue_rejects() {
        let (queue, rx) = EventQueue::bounded("test", 2);
        assert_eq!(queue.push(event(0)), PushOutcome::Stopped);

        queue.open();
        assert_eq!(queue.push(event(1)), PushOutcome::Queued);

        drop(rx);
        assert_eq!(queue.push(event(2)), PushOutcome::Stopped);
        assert_eq!(queue.capacity(), 2);
    }
}
