// src/bot/dispatcher.rs - Fan-out of inbound events to every registered feature queue

use log::{debug, warn};
use std::sync::Arc;

use crate::bot::processor::EventSink;
use crate::bot::queue::PushOutcome;
use crate::types::Event;

/// Per-dispatch delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
    pub stopped: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Queued => self.delivered += 1,
            PushOutcome::Dropped => self.dropped += 1,
            PushOutcome::Stopped => self.stopped += 1,
        }
    }
}

/// Hands each event to every registered sink without ever waiting on one.
///
/// Sinks are registered once during startup.
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn EventSink>) {
        debug!("Registered event sink {}", sink.name());
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Push a copy of `event` into every sink. A full sink loses this event;
    /// the others still receive it.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::default();
        for sink in &self.sinks {
            report.record(sink.push_event(event.clone()));
        }

        if report.dropped > 0 {
            warn!(
                "Event {} from {} dropped by {} of {} features",
                event.message_id,
                event.user_id,
                report.dropped,
                self.sinks.len()
            );
        }
        report
    }
}
