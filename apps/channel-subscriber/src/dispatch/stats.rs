//! Throughput statistics and sequence gap detection.
//!
//! A [`StatsTracker`] is owned by exactly one dispatcher and only ever touched
//! from inside its dispatch slot, so none of its fields need synchronisation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broker::ByteCounts;
use crate::event::DeliveredEvent;

/// Default number of events between rate reports.
pub const DEFAULT_REPORT_COUNT: u64 = 1000;

/// Source of the session's cumulative wire byte counters.
pub trait ByteCountSource: Send + Sync {
    fn byte_counts(&self) -> ByteCounts;
}

/// How much the tracker logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Gap reports only.
    Silent = 0,
    /// Rate summaries.
    Summary = 1,
    /// Summaries plus each sequence id and end-of-channel markers.
    Sequence = 2,
    /// Everything, including payload, tag, attributes and properties.
    Full = 3,
}

impl Verbosity {
    /// Map a numeric log level; anything above 3 is treated as 3.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Silent,
            1 => Self::Summary,
            2 => Self::Sequence,
            _ => Self::Full,
        }
    }
}

/// A run of sequence ids that were never delivered, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapReport {
    pub from: i64,
    pub to: i64,
}

impl GapReport {
    pub fn missed(&self) -> u64 {
        self.to.abs_diff(self.from).saturating_add(1)
    }
}

/// How an event's id related to the expected cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Matched the cursor (or established it, for the first event).
    InOrder,
    /// Ids were skipped.
    Gap(GapReport),
    /// Id is behind the cursor (redelivered or out of order). Counted as a
    /// gap; the cursor is left where it was.
    Stale { expected: i64 },
}

/// Emitted each time a window fills up.
#[derive(Debug, Clone, PartialEq)]
pub enum RateReport {
    Measured {
        events: u64,
        bytes: u64,
        elapsed: Duration,
        events_per_sec: f64,
        bytes_per_sec: f64,
        session_bytes: ByteCounts,
    },
    /// The window closed within the clock's resolution; no rate computed.
    FasterThanClock { events: u64 },
}

/// What `record` observed for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub sequence: SequenceCheck,
    pub report: Option<RateReport>,
}

/// Running totals since the tracker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsTotals {
    pub events: u64,
    pub bytes: u64,
    pub gaps: u64,
    pub missed: u64,
}

/// Counters for the current reporting interval.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    events: u64,
    bytes: u64,
}

impl RateWindow {
    fn starting_at(started: Instant) -> Self {
        Self {
            started,
            events: 0,
            bytes: 0,
        }
    }
}

pub struct StatsTracker {
    report_count: u64,
    verbosity: Verbosity,
    /// `None` until the first event opens the clock.
    window: Option<RateWindow>,
    /// `None` until primed by a subscription or the first event.
    expected: Option<i64>,
    totals: StatsTotals,
    byte_source: Option<Arc<dyn ByteCountSource>>,
}

impl StatsTracker {
    /// `report_count` of zero is treated as one.
    pub fn new(report_count: u64, verbosity: Verbosity) -> Self {
        Self {
            report_count: report_count.max(1),
            verbosity,
            window: None,
            expected: None,
            totals: StatsTotals::default(),
            byte_source: None,
        }
    }

    /// Include the session's wire counters in rate reports.
    pub fn with_byte_source(mut self, source: Arc<dyn ByteCountSource>) -> Self {
        self.byte_source = Some(source);
        self
    }

    /// Set the next expected sequence id. Never moves the cursor backwards.
    pub fn expect_from(&mut self, next: i64) {
        self.expected = Some(self.expected.map_or(next, |current| current.max(next)));
    }

    pub fn expected(&self) -> Option<i64> {
        self.expected
    }

    pub fn totals(&self) -> StatsTotals {
        self.totals
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn record(&mut self, event: &DeliveredEvent) -> RecordOutcome {
        self.record_at(event, Instant::now())
    }

    /// `record` with an explicit clock reading.
    pub fn record_at(&mut self, event: &DeliveredEvent, now: Instant) -> RecordOutcome {
        let len = event.payload_len() as u64;
        self.totals.events += 1;
        self.totals.bytes += len;

        // The first event only opens the clock; the window counts what follows.
        let report = match self.window.as_mut() {
            None => {
                self.window = Some(RateWindow::starting_at(now));
                None
            }
            Some(window) => {
                window.events += 1;
                window.bytes += len;
                if window.events >= self.report_count {
                    self.close_window(now)
                } else {
                    None
                }
            }
        };

        let sequence = self.check_sequence(event.sequence_id);
        self.log_event(event);

        RecordOutcome { sequence, report }
    }

    fn check_sequence(&mut self, id: i64) -> SequenceCheck {
        match self.expected {
            Some(expected) if id > expected => {
                let gap = GapReport {
                    from: expected,
                    to: id - 1,
                };
                self.totals.gaps += 1;
                self.totals.missed += gap.missed();
                self.expected = Some(id.saturating_add(1));
                tracing::warn!(
                    from = gap.from,
                    to = gap.to,
                    missed = gap.missed(),
                    "expired event range {} - {}",
                    gap.from,
                    gap.to
                );
                SequenceCheck::Gap(gap)
            }
            Some(expected) if id < expected => {
                self.totals.gaps += 1;
                tracing::warn!(
                    seq = id,
                    expected,
                    "event {} arrived behind cursor {}",
                    id,
                    expected
                );
                SequenceCheck::Stale { expected }
            }
            _ => {
                self.expected = Some(id.saturating_add(1));
                SequenceCheck::InOrder
            }
        }
    }

    /// Close the current window and start the next one at `now`.
    fn close_window(&mut self, now: Instant) -> Option<RateReport> {
        let window = self.window.replace(RateWindow::starting_at(now))?;
        if self.verbosity < Verbosity::Summary {
            return None;
        }

        let elapsed = now.saturating_duration_since(window.started);
        let millis = elapsed.as_millis();
        if millis == 0 {
            tracing::info!(
                events = window.events,
                "received {} faster than the clock resolution",
                window.events
            );
            return Some(RateReport::FasterThanClock {
                events: window.events,
            });
        }

        let millis = millis as f64;
        let events_per_sec = window.events as f64 * 1000.0 / millis;
        let bytes_per_sec = window.bytes as f64 * 1000.0 / millis;
        let session_bytes = self
            .byte_source
            .as_ref()
            .map(|source| source.byte_counts())
            .unwrap_or_default();

        tracing::info!(
            events = window.events,
            elapsed_ms = millis,
            events_per_sec,
            bytes_per_sec,
            "received {} in {}ms",
            window.events,
            millis
        );
        tracing::info!(
            bytes_tx = session_bytes.sent,
            bytes_rx = session_bytes.received,
            "bandwidth"
        );

        Some(RateReport::Measured {
            events: window.events,
            bytes: window.bytes,
            elapsed,
            events_per_sec,
            bytes_per_sec,
            session_bytes,
        })
    }

    fn log_event(&self, event: &DeliveredEvent) {
        if self.verbosity < Verbosity::Sequence {
            return;
        }
        tracing::info!(seq = event.sequence_id, "event received");
        if event.end_of_channel {
            tracing::info!(seq = event.sequence_id, "end of channel reached");
        }
        if self.verbosity < Verbosity::Full {
            return;
        }

        let data = event
            .payload
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        tracing::info!(
            seq = event.sequence_id,
            tag = ?event.tag,
            data = %data,
            "event detail"
        );
        if let Some(attributes) = &event.attributes {
            tracing::info!(seq = event.sequence_id, ?attributes, "event attributes");
        }
        if let Some(properties) = &event.properties {
            tracing::info!(seq = event.sequence_id, ?properties, "event properties");
        }
    }
}
