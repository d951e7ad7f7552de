use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;

/// A resolved channel plus the consumer's position in it.
///
/// The cursor is the next sequence id the consumer expects. It only moves
/// forward, and it survives reconnects so a new session can resume from it.
#[derive(Debug)]
pub struct ChannelHandle {
    name: String,
    /// Newest id on the channel when it was resolved.
    resolved_last_id: i64,
    filter: RwLock<Option<String>>,
    cursor: AtomicI64,
    active: AtomicBool,
}

impl ChannelHandle {
    pub fn new(name: impl Into<String>, resolved_last_id: i64) -> Self {
        Self {
            name: name.into(),
            resolved_last_id,
            filter: RwLock::new(None),
            cursor: AtomicI64::new(0),
            active: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolved_last_id(&self) -> i64 {
        self.resolved_last_id
    }

    pub fn filter(&self) -> Option<String> {
        self.filter.read().clone()
    }

    pub(crate) fn set_filter(&self, filter: Option<&str>) {
        *self.filter.write() = filter.map(str::to_string);
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Move the cursor to at least `start`.
    pub(crate) fn start_at(&self, start: i64) {
        self.cursor.fetch_max(start, Ordering::AcqRel);
    }

    /// Record that `sequence_id` was delivered.
    pub(crate) fn advance_past(&self, sequence_id: i64) {
        self.cursor.fetch_max(sequence_id.saturating_add(1), Ordering::AcqRel);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}
