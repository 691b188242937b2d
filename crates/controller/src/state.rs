use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Process-wide ephemeral state: connectivity plus a ring buffer of recent
/// events. Per-entity state lives in the zone/program snapshots.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Zone,
    Program,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a zone phase change or cycle result.
    pub fn record_zone(&mut self, zone_id: &str, detail: impl AsRef<str>) {
        self.push_event(EventKind::Zone, format!("{zone_id}: {}", detail.as_ref()));
    }

    /// Record a program lifecycle event.
    pub fn record_program(&mut self, program_id: &str, detail: impl AsRef<str>) {
        self.push_event(
            EventKind::Program,
            format!("{program_id}: {}", detail.as_ref()),
        );
    }

    /// Record an accepted command.
    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Events newest first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_prefixed_with_entity_id() {
        let mut st = SystemState::new();
        st.record_zone("lawn", "watering");
        st.record_program("morning", "started");
        assert_eq!(st.events[0].detail, "lawn: watering");
        assert_eq!(st.events[0].kind, EventKind::Zone);
        assert_eq!(st.events[1].detail, "morning: started");
        assert_eq!(st.events[1].kind, EventKind::Program);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 5");
    }

    #[test]
    fn recent_events_newest_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_error("second".into());
        let events = st.recent_events();
        assert_eq!(events[0].detail, "second");
        assert_eq!(events[1].detail, "first");
    }
}
