use crate::types::Timestamp;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Mutex;

/// Default minimum interval between emitted events for one subject.
pub const DEFAULT_WINDOW_MS: i64 = 5000;

/// Per-subject cooldown filter for recognition events.
///
/// Rate limiting only: the ledger enforces at-most-once per kind per day on
/// its own.
#[derive(Debug)]
pub struct EventThrottle {
    window: Duration,
    last_emitted: Mutex<HashMap<String, Timestamp>>,
}

impl EventThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_window_ms(window_ms: i64) -> Self {
        Self::new(Duration::milliseconds(window_ms))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true and records `now` when the subject has never emitted or
    /// its last emission is at least one window old. Otherwise leaves state
    /// untouched.
    pub fn should_emit(&self, subject_id: &str, now: Timestamp) -> bool {
        let mut last = match self.last_emitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let due = match last.get(subject_id) {
            Some(prev) => now.signed_duration_since(*prev) >= self.window,
            None => true,
        };
        if due {
            last.insert(subject_id.to_string(), now);
        }
        due
    }

    pub fn last_emitted(&self, subject_id: &str) -> Option<Timestamp> {
        let last = match self.last_emitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        last.get(subject_id).copied()
    }

    /// Forget every subject. Called when a session stops.
    pub fn clear(&self) {
        let mut last = match self.last_emitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        last.clear();
    }
}

impl Default for EventThrottle {
    fn default() -> Self {
        Self::with_window_ms(DEFAULT_WINDOW_MS)
    }
}
