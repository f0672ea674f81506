//! Per-person event timeline.
//!
//! The log is append-only and owned by a single worker. `before` assumes
//! entries were appended in non-decreasing time order and stops scanning at
//! the first entry past its cutoff; `after` makes no such assumption.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

pub const BIRTH: &str = "birth";
pub const DEATH: &str = "death";

/// A timestamped life event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: Timestamp,
    #[serde(rename = "type")]
    pub kind: String,
    /// Name of the rule or state that produced the event.
    pub rule: String,
    pub processed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn create(
        &mut self,
        time: Timestamp,
        kind: impl Into<String>,
        rule: impl Into<String>,
        processed: bool,
    ) -> &Event {
        self.events.push(Event {
            time,
            kind: kind.into(),
            rule: rule.into(),
            processed,
        });
        &self.events[self.events.len() - 1]
    }

    /// Most recent event of the given type.
    pub fn event(&self, kind: &str) -> Option<&Event> {
        self.events.iter().rev().find(|e| e.kind == kind)
    }

    /// Events at or before `time`, optionally of one type.
    pub fn before(&self, time: Timestamp, kind: Option<&str>) -> Vec<&Event> {
        self.events
            .iter()
            .take_while(|e| e.time <= time)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect()
    }

    /// Events at or after `time`, optionally of one type.
    pub fn after(&self, time: Timestamp, kind: Option<&str>) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.time >= time)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect()
    }

    /// Returns true if any event of `kind` is at or before `time`.
    ///
    /// Scans the whole log, so it is exact for out-of-order entries such as
    /// a death scheduled in the future.
    pub fn occurred_by(&self, kind: &str, time: Timestamp) -> bool {
        self.events.iter().any(|e| e.kind == kind && e.time <= time)
    }

    /// Returns true if entries were appended in non-decreasing time order.
    pub fn is_chronological(&self) -> bool {
        self.events.windows(2).all(|w| w[0].time <= w[1].time)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
