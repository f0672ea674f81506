//! In-memory clinical record.
//!
//! The record is an append-mostly list of encounters. Every clinical entry
//! lives inside the encounter that was current when it was recorded; the
//! per-kind active index points back into that list so ending an entry
//! updates it in place.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A coded concept, e.g. `{"system": "SNOMED-CT", "code": "195967001", "display": "Asthma"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Code {
    pub system: String,
    pub code: String,
    #[serde(default)]
    pub display: String,
}

impl Code {
    pub fn new(system: &str, code: &str, display: &str) -> Self {
        Self {
            system: system.to_string(),
            code: code.to_string(),
            display: display.to_string(),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.system, self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Condition,
    Allergy,
    Medication,
    CarePlan,
    Procedure,
    Observation,
    Report,
    Device,
    Supply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncounterClass {
    Wellness,
    Ambulatory,
    Outpatient,
    Inpatient,
    Emergency,
    #[serde(alias = "urgent_care")]
    Urgentcare,
    Home,
    Virtual,
}

/// Value of a recorded observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Code(Code),
}

impl ObservationValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ObservationValue::Number(n) => serde_json::json!(n),
            ObservationValue::Bool(b) => serde_json::Value::Bool(*b),
            ObservationValue::Text(s) => serde_json::Value::String(s.clone()),
            ObservationValue::Code(c) => serde_json::json!({
                "system": c.system,
                "code": c.code,
                "display": c.display,
            }),
        }
    }
}

/// One clinical fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    /// Name of the state that recorded the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Timestamp>,
    /// Primary code.
    pub code: String,
    #[serde(default)]
    pub codes: Vec<Code>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<Code>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<Code>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ObservationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    /// Free-form details such as prescriptions, goals or device models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Grouped observations of a multi-observation or report.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Entry>,
    #[serde(default)]
    pub chronic: bool,
}

impl Entry {
    pub fn new(kind: EntryKind, start: Timestamp, code: impl Into<String>) -> Self {
        Self {
            kind,
            name: None,
            start,
            stop: None,
            code: code.into(),
            codes: Vec::new(),
            reasons: Vec::new(),
            stop_reason: None,
            value: None,
            category: None,
            unit: None,
            quantity: None,
            details: None,
            members: Vec::new(),
            chronic: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Timestamp>,
    pub class: EncounterClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub codes: Vec<Code>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Code>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge: Option<Code>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Encounter {
    fn new(start: Timestamp, class: EncounterClass) -> Self {
        Self {
            start,
            stop: None,
            class,
            name: None,
            codes: Vec::new(),
            reason: None,
            discharge: None,
            entries: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stop.is_none()
    }
}

/// Location of an entry inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub encounter: usize,
    pub entry: usize,
}

/// A person's clinical record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthRecord {
    pub encounters: Vec<Encounter>,
    #[serde(skip)]
    active: BTreeMap<(EntryKind, String), EntryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_wellness: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub death: Option<Timestamp>,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Encounters
    // =========================================================================

    /// Opens a new encounter and returns its index.
    pub fn encounter_start(&mut self, time: Timestamp, class: EncounterClass) -> usize {
        if class == EncounterClass::Wellness {
            self.last_wellness = Some(time);
        }
        self.encounters.push(Encounter::new(time, class));
        self.encounters.len() - 1
    }

    /// Closes the most recent open encounter of `class`.
    pub fn encounter_end(&mut self, time: Timestamp, class: EncounterClass) -> bool {
        match self
            .encounters
            .iter_mut()
            .rev()
            .find(|e| e.class == class && e.is_open())
        {
            Some(encounter) => {
                encounter.stop = Some(time);
                true
            }
            None => false,
        }
    }

    /// Index of the most recent encounter, opening a wellness encounter if
    /// nothing has been recorded yet.
    pub fn current_encounter(&mut self, time: Timestamp) -> usize {
        if self.encounters.is_empty() {
            let index = self.encounter_start(time, EncounterClass::Wellness);
            self.encounters[index].name = Some("First Wellness".to_string());
        }
        self.encounters.len() - 1
    }

    pub fn encounter(&self, index: usize) -> Option<&Encounter> {
        self.encounters.get(index)
    }

    pub fn encounter_mut(&mut self, index: usize) -> Option<&mut Encounter> {
        self.encounters.get_mut(index)
    }

    /// Milliseconds since the last wellness encounter, or `i64::MAX` if none.
    pub fn time_since_last_wellness(&self, time: Timestamp) -> i64 {
        self.last_wellness
            .map(|last| time - last)
            .unwrap_or(i64::MAX)
    }

    // =========================================================================
    // Entries
    // =========================================================================

    pub fn entry(&self, at: EntryRef) -> Option<&Entry> {
        self.encounters.get(at.encounter)?.entries.get(at.entry)
    }

    pub fn entry_mut(&mut self, at: EntryRef) -> Option<&mut Entry> {
        self.encounters
            .get_mut(at.encounter)?
            .entries
            .get_mut(at.entry)
    }

    fn push_entry(&mut self, time: Timestamp, entry: Entry) -> EntryRef {
        let encounter = self.current_encounter(time);
        let entries = &mut self.encounters[encounter].entries;
        entries.push(entry);
        EntryRef {
            encounter,
            entry: entries.len() - 1,
        }
    }

    /// Records an entry that stays active until ended.
    ///
    /// Starting a code that is already active returns the existing entry.
    pub fn start(&mut self, time: Timestamp, kind: EntryKind, code: &str) -> EntryRef {
        let key = (kind, code.to_string());
        if let Some(existing) = self.active.get(&key) {
            return *existing;
        }
        let at = self.push_entry(time, Entry::new(kind, time, code));
        self.active.insert(key, at);
        at
    }

    /// Records an entry that is complete when recorded.
    pub fn record(&mut self, time: Timestamp, kind: EntryKind, code: &str) -> EntryRef {
        self.push_entry(time, Entry::new(kind, time, code))
    }

    /// Ends the active entry of `kind` with `code`.
    pub fn end(
        &mut self,
        time: Timestamp,
        kind: EntryKind,
        code: &str,
        reason: Option<&Code>,
    ) -> bool {
        match self.active.remove(&(kind, code.to_string())) {
            Some(at) => {
                if let Some(entry) = self.entry_mut(at) {
                    entry.stop = Some(time);
                    entry.stop_reason = reason.cloned();
                }
                true
            }
            None => false,
        }
    }

    /// Ends every active entry of `kind` recorded by the state `state`.
    pub fn end_by_state(
        &mut self,
        time: Timestamp,
        kind: EntryKind,
        state: &str,
        reason: Option<&Code>,
    ) -> usize {
        let codes: Vec<String> = self
            .active
            .iter()
            .filter(|((k, _), at)| {
                *k == kind
                    && self
                        .entry(**at)
                        .and_then(|e| e.name.as_deref())
                        .map_or(false, |name| name == state)
            })
            .map(|((_, code), _)| code.clone())
            .collect();
        for code in &codes {
            self.end(time, kind, code, reason);
        }
        codes.len()
    }

    pub fn is_active(&self, kind: EntryKind, code: &str) -> bool {
        self.active.contains_key(&(kind, code.to_string()))
    }

    pub fn active(&self, kind: EntryKind) -> impl Iterator<Item = &Entry> {
        self.active
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .filter_map(|(_, at)| self.entry(*at))
    }

    /// First active entry of `kind` recorded by the state `state`.
    pub fn active_by_state(&self, kind: EntryKind, state: &str) -> Option<&Entry> {
        self.active(kind)
            .find(|e| e.name.as_deref() == Some(state))
    }

    // =========================================================================
    // Observations
    // =========================================================================

    pub fn observation(
        &mut self,
        time: Timestamp,
        code: &str,
        value: Option<ObservationValue>,
    ) -> EntryRef {
        let at = self.record(time, EntryKind::Observation, code);
        if let Some(entry) = self.entry_mut(at) {
            entry.value = value;
        }
        at
    }

    /// Groups the last `count` observations of the current encounter under a
    /// new entry of `kind`.
    pub fn group_observations(
        &mut self,
        time: Timestamp,
        kind: EntryKind,
        code: &str,
        count: usize,
    ) -> EntryRef {
        let encounter = self.current_encounter(time);
        let entries = &mut self.encounters[encounter].entries;

        let mut positions: Vec<usize> = entries
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, e)| e.kind == EntryKind::Observation)
            .map(|(i, _)| i)
            .take(count)
            .collect();
        positions.sort_unstable();

        let mut members = Vec::with_capacity(positions.len());
        for (removed, position) in positions.into_iter().enumerate() {
            members.push(entries.remove(position - removed));
        }

        let mut group = Entry::new(kind, time, code);
        group.members = members;
        entries.push(group);
        let at = EntryRef {
            encounter,
            entry: entries.len() - 1,
        };
        self.reindex(encounter);
        at
    }

    /// Rebuilds active references into one encounter after entries moved.
    fn reindex(&mut self, encounter: usize) {
        let mut moved = Vec::new();
        for ((kind, code), at) in &self.active {
            if at.encounter == encounter {
                moved.push((*kind, code.clone()));
            }
        }
        for (kind, code) in moved {
            let position = self.encounters[encounter]
                .entries
                .iter()
                .rposition(|e| e.kind == kind && e.code == code && e.stop.is_none());
            match position {
                Some(entry) => {
                    self.active
                        .insert((kind, code), EntryRef { encounter, entry });
                }
                None => {
                    self.active.remove(&(kind, code));
                }
            }
        }
    }

    /// Most recent observation with `code`, including grouped members.
    pub fn latest_observation(&self, code: &str) -> Option<&Entry> {
        for encounter in self.encounters.iter().rev() {
            for entry in encounter.entries.iter().rev() {
                if entry.kind == EntryKind::Observation && entry.code == code {
                    return Some(entry);
                }
                if let Some(member) = entry.members.iter().rev().find(|m| m.code == code) {
                    return Some(member);
                }
            }
        }
        None
    }
}
