//! Per-channel event dispatch.
//!
//! An [`EventDispatcher`] is the [`DeliverySink`] a subscription hands to the
//! transport. For each event it updates statistics, advances the channel
//! cursor and invokes the application handler. Handler failures are logged
//! and never reach the transport.

pub mod handler;
pub mod stats;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::DeliverySink;
use crate::event::DeliveredEvent;
use crate::subscription::ChannelHandle;

pub use handler::{LogHandler, MessageHandler};
pub use stats::{
    ByteCountSource, GapReport, RateReport, RecordOutcome, SequenceCheck, StatsTotals,
    StatsTracker, Verbosity,
};

/// Whether the dispatcher is currently inside a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
}

struct DispatchSlot {
    tracker: StatsTracker,
    handler: Box<dyn MessageHandler>,
}

pub struct EventDispatcher {
    channel: Arc<ChannelHandle>,
    /// Held for the whole of one delivery, so deliveries never overlap.
    slot: Mutex<DispatchSlot>,
    dispatching: AtomicBool,
    faults: AtomicU64,
}

impl EventDispatcher {
    pub fn new(
        channel: Arc<ChannelHandle>,
        tracker: StatsTracker,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        Self {
            channel,
            slot: Mutex::new(DispatchSlot {
                tracker,
                handler: Box::new(handler),
            }),
            dispatching: AtomicBool::new(false),
            faults: AtomicU64::new(0),
        }
    }

    /// Process one delivered event. Returns `None` if the channel is no longer
    /// subscribed and the event was dropped.
    pub fn dispatch(&self, event: &DeliveredEvent) -> Option<RecordOutcome> {
        if !self.channel.is_active() {
            tracing::debug!(
                channel = %self.channel.name(),
                seq = event.sequence_id,
                "dropping event for inactive subscription"
            );
            return None;
        }

        let mut guard = self.slot.lock();
        let slot = &mut *guard;
        self.dispatching.store(true, Ordering::Release);

        let outcome = slot.tracker.record(event);
        self.channel.advance_past(event.sequence_id);

        if let Some(payload) = event.payload.as_deref() {
            let handler = &mut slot.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.faults.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        channel = %self.channel.name(),
                        seq = event.sequence_id,
                        error = %err,
                        "message handler failed"
                    );
                }
                Err(panic) => {
                    self.faults.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        channel = %self.channel.name(),
                        seq = event.sequence_id,
                        panic = %panic_message(panic.as_ref()),
                        "message handler panicked"
                    );
                }
            }
        }

        self.dispatching.store(false, Ordering::Release);
        Some(outcome)
    }

    pub fn channel(&self) -> &Arc<ChannelHandle> {
        &self.channel
    }

    pub fn state(&self) -> DispatchState {
        if self.dispatching.load(Ordering::Acquire) {
            DispatchState::Dispatching
        } else {
            DispatchState::Idle
        }
    }

    /// Waits for any in-flight delivery to finish.
    pub fn totals(&self) -> StatsTotals {
        self.slot.lock().tracker.totals()
    }

    /// Handler errors and panics caught so far.
    pub fn handler_faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

impl DeliverySink for EventDispatcher {
    fn on_event(&self, event: &DeliveredEvent) {
        self.dispatch(event);
    }

    fn attached(&self, channel: &str, expected: Option<i64>) {
        tracing::debug!(%channel, ?expected, "dispatcher attached");
        if let Some(next) = expected {
            self.slot.lock().tracker.expect_from(next);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
