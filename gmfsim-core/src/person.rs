//! Per-person simulation context.
//!
//! A [`Person`] owns everything that changes while one individual is
//! simulated: attributes, the seeded RNG, module histories, the event log
//! and the clinical record. It is confined to the worker simulating it.

use crate::events::{EventLog, BIRTH, DEATH};
use crate::record::{Code, Entry, EntryKind, EntryRef, HealthRecord, ObservationValue};
use crate::state::ModuleHistory;
use crate::time::{Timestamp, YEAR};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const BIRTHDATE: &str = "birthdate";
pub const GENDER: &str = "gender";
pub const RACE: &str = "race";
pub const SOCIOECONOMIC_CATEGORY: &str = "socioeconomic_category";
pub const CAUSE_OF_DEATH: &str = "cause_of_death";
pub const ACTIVE_WELLNESS_ENCOUNTER: &str = "active_wellness_encounter";
pub const ACTIVE_URGENT_CARE_ENCOUNTER: &str = "active_urgent_care_encounter";
pub const ACTIVE_EMERGENCY_ENCOUNTER: &str = "active_emergency_encounter";

/// Value stored in the attribute map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Value(serde_json::Value),
    Code(Code),
    Entry(Box<Entry>),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Value(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Value(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Value(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            AttributeValue::Entry(entry) => Some(entry),
            _ => None,
        }
    }

    /// JSON view used for comparisons; entries have none.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            AttributeValue::Value(v) => Some(v.clone()),
            AttributeValue::Code(c) => Some(ObservationValue::Code(c.clone()).to_json()),
            AttributeValue::Entry(_) => None,
        }
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(v: serde_json::Value) -> Self {
        AttributeValue::Value(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Value(serde_json::json!(v))
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Value(serde_json::json!(v))
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Value(serde_json::Value::Bool(v))
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Value(serde_json::Value::String(v.to_string()))
    }
}

/// Severity of one symptom from one cause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymptomSource {
    pub severity: u32,
    pub time: Timestamp,
    pub addressed: bool,
}

/// An onset recorded before its target encounter happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOnset {
    pub module: String,
    pub state: String,
    pub kind: EntryKind,
    pub codes: Vec<Code>,
    pub assign_to_attribute: Option<String>,
    pub target_encounter: String,
}

/// Covered and uncovered records kept alongside the current record.
///
/// The current record collects care of the status in `current_covered`;
/// the stored record of that status stays empty until the next switch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DualRecords {
    pub covered: HealthRecord,
    pub uncovered: HealthRecord,
    pub current_covered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Person {
    pub id: Uuid,
    seed: u64,
    #[serde(skip)]
    rng: StdRng,
    pub attributes: BTreeMap<String, AttributeValue>,
    histories: BTreeMap<String, ModuleHistory>,
    pub events: EventLog,
    pub record: HealthRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    dual: Option<Box<DualRecords>>,
    observation_history: BTreeMap<String, Entry>,
    symptoms: BTreeMap<String, BTreeMap<String, SymptomSource>>,
    vital_signs: BTreeMap<String, f64>,
    #[serde(skip)]
    current_encounters: BTreeMap<String, usize>,
    #[serde(skip)]
    pending_onsets: Vec<PendingOnset>,
}

impl Person {
    /// Creates a person whose every random draw derives from `seed`.
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        Self {
            id: uuid::Builder::from_random_bytes(bytes).into_uuid(),
            seed,
            rng,
            attributes: BTreeMap::new(),
            histories: BTreeMap::new(),
            events: EventLog::new(),
            record: HealthRecord::new(),
            dual: None,
            observation_history: BTreeMap::new(),
            symptoms: BTreeMap::new(),
            vital_signs: BTreeMap::new(),
            current_encounters: BTreeMap::new(),
            pending_onsets: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    // =========================================================================
    // Randomness
    // =========================================================================

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Uniform draw in `[0, 1)`.
    pub fn rand(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub fn rand_range(&mut self, low: f64, high: f64) -> f64 {
        crate::distribution::uniform(&mut self.rng, low, high)
    }

    pub fn rand_gaussian(&mut self) -> f64 {
        crate::distribution::standard_normal(&mut self.rng)
    }

    pub fn rand_u64(&mut self) -> u64 {
        self.rng.gen::<u64>()
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<AttributeValue> {
        self.attributes.remove(key)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    // =========================================================================
    // Life
    // =========================================================================

    /// Records birth at `time`.
    pub fn birth(&mut self, time: Timestamp) {
        self.set_attribute(BIRTHDATE, time);
        self.events.create(time, BIRTH, "birth", true);
    }

    pub fn birthdate(&self) -> Option<Timestamp> {
        match self.attributes.get(BIRTHDATE) {
            Some(AttributeValue::Value(v)) => v.as_i64(),
            _ => None,
        }
    }

    /// Completed years of age at `time`.
    pub fn age_in_years(&self, time: Timestamp) -> Option<f64> {
        self.birthdate()
            .map(|birth| ((time - birth) as f64 / YEAR as f64).floor())
    }

    /// Completed months of age at `time`.
    pub fn age_in_months(&self, time: Timestamp) -> Option<f64> {
        self.birthdate()
            .map(|birth| ((time - birth) as f64 / (YEAR as f64 / 12.0)).floor())
    }

    /// Born, and no death recorded at or before `time`.
    pub fn alive(&self, time: Timestamp) -> bool {
        self.events.event(BIRTH).is_some() && !self.events.occurred_by(DEATH, time)
    }

    /// Records a death at `time`, which may lie in the future.
    pub fn record_death(&mut self, time: Timestamp, cause: Option<Code>, rule: &str) {
        self.events.create(time, DEATH, rule, true);
        self.record.death = Some(self.record.death.map_or(time, |d| d.min(time)));
        if let Some(cause) = cause {
            self.attributes
                .insert(CAUSE_OF_DEATH.to_string(), AttributeValue::Code(cause));
        }
    }

    pub fn death_time(&self) -> Option<Timestamp> {
        self.record.death
    }

    // =========================================================================
    // Module histories
    // =========================================================================

    pub fn history(&self, module: &str) -> Option<&ModuleHistory> {
        self.histories.get(module)
    }

    pub fn history_mut(&mut self, module: &str) -> Option<&mut ModuleHistory> {
        self.histories.get_mut(module)
    }

    pub fn history_or_insert_with(
        &mut self,
        module: &str,
        init: impl FnOnce() -> ModuleHistory,
    ) -> &mut ModuleHistory {
        self.histories
            .entry(module.to_string())
            .or_insert_with(init)
    }

    pub fn take_history(&mut self, module: &str) -> Option<ModuleHistory> {
        self.histories.remove(module)
    }

    pub fn histories(&self) -> impl Iterator<Item = (&str, &ModuleHistory)> {
        self.histories.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if `name` appears in the module's history.
    ///
    /// With `since`, only visits more recent than the latest visit of
    /// `since` count. With `since_time`, only visits that exited strictly
    /// after that time, or have not exited yet, count.
    pub fn had_prior_state(
        &self,
        module: &str,
        name: &str,
        since: Option<&str>,
        since_time: Option<Timestamp>,
    ) -> bool {
        let Some(history) = self.histories.get(module) else {
            return false;
        };
        for instance in history.iter() {
            if instance.name() == name {
                let in_window = since_time
                    .map_or(true, |t| instance.exited.map_or(true, |exited| exited > t));
                if in_window {
                    return true;
                }
            } else if since == Some(instance.name()) {
                return false;
            }
        }
        false
    }

    // =========================================================================
    // Encounters
    // =========================================================================

    pub fn current_encounter(&self, module: &str) -> Option<usize> {
        self.current_encounters.get(module).copied()
    }

    pub fn set_current_encounter(&mut self, module: &str, encounter: Option<usize>) {
        match encounter {
            Some(index) => {
                self.current_encounters.insert(module.to_string(), index);
            }
            None => {
                self.current_encounters.remove(module);
            }
        }
    }

    pub fn has_current_encounter(&self) -> bool {
        self.current_encounters
            .values()
            .any(|i| self.record.encounter(*i).map_or(false, |e| e.is_open()))
    }

    pub fn add_pending_onset(&mut self, onset: PendingOnset) {
        self.pending_onsets.push(onset);
    }

    /// Removes and returns the pending onsets of `module` waiting on `encounter`.
    pub fn take_pending_onsets(&mut self, module: &str, encounter: &str) -> Vec<PendingOnset> {
        let (matched, rest) = std::mem::take(&mut self.pending_onsets)
            .into_iter()
            .partition(|p| p.module == module && p.target_encounter == encounter);
        self.pending_onsets = rest;
        matched
    }

    // =========================================================================
    // Symptoms and vital signs
    // =========================================================================

    pub fn set_symptom(
        &mut self,
        cause: &str,
        symptom: &str,
        time: Timestamp,
        severity: u32,
        addressed: bool,
    ) {
        self.symptoms.entry(symptom.to_string()).or_default().insert(
            cause.to_string(),
            SymptomSource {
                severity,
                time,
                addressed,
            },
        );
    }

    /// Highest severity of `symptom` across causes.
    pub fn symptom(&self, symptom: &str) -> u32 {
        self.symptoms
            .get(symptom)
            .and_then(|causes| causes.values().map(|s| s.severity).max())
            .unwrap_or(0)
    }

    pub fn symptom_total(&self) -> u32 {
        self.symptoms.keys().map(|s| self.symptom(s)).sum()
    }

    pub fn set_vital_sign(&mut self, name: &str, value: f64) {
        self.vital_signs.insert(name.to_string(), value);
    }

    pub fn vital_sign(&self, name: &str) -> Option<f64> {
        self.vital_signs.get(name).copied()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Keeps covered and uncovered care apart. The current record starts
    /// out collecting covered care.
    pub fn enable_dual_records(&mut self) {
        if self.dual.is_none() {
            self.dual = Some(Box::new(DualRecords {
                current_covered: true,
                ..DualRecords::default()
            }));
        }
    }

    pub fn has_multiple_records(&self) -> bool {
        self.dual.is_some()
    }

    pub fn dual_records(&self) -> Option<&DualRecords> {
        self.dual.as_deref()
    }

    pub fn dual_records_mut(&mut self) -> Option<&mut DualRecords> {
        self.dual.as_deref_mut()
    }

    /// Switches the current record to collect covered or uncovered care.
    ///
    /// The current record is stored under the status it was collecting and
    /// the stored record of the new status becomes current. Module encounter
    /// indices point into the old record and are dropped, so switch only
    /// while no encounter is open. Returns whether a switch happened.
    pub fn set_covered(&mut self, covered: bool) -> bool {
        let Some(dual) = self.dual.as_deref_mut() else {
            return false;
        };
        if dual.current_covered == covered {
            return false;
        }
        let (stored, next) = if covered {
            (&mut dual.uncovered, &mut dual.covered)
        } else {
            (&mut dual.covered, &mut dual.uncovered)
        };
        let next = std::mem::take(next);
        *stored = std::mem::replace(&mut self.record, next);
        dual.current_covered = covered;
        self.current_encounters.clear();
        true
    }

    pub fn record_observation(
        &mut self,
        time: Timestamp,
        code: &str,
        value: Option<ObservationValue>,
    ) -> EntryRef {
        self.record.observation(time, code, value)
    }

    /// Copies a finished observation into the cross-module history, which
    /// outlives grouping and record switches.
    pub fn remember_observation(&mut self, at: EntryRef) {
        if let Some(entry) = self.record.entry(at) {
            self.observation_history
                .insert(entry.code.clone(), entry.clone());
        }
    }

    /// Latest observation with `code`: current record, then the uncovered and
    /// covered records in dual-record mode, then the cross-module history.
    pub fn latest_observation(&self, code: &str) -> Option<&Entry> {
        if let Some(entry) = self.record.latest_observation(code) {
            return Some(entry);
        }
        if let Some(dual) = &self.dual {
            if let Some(entry) = dual.uncovered.latest_observation(code) {
                return Some(entry);
            }
            if let Some(entry) = dual.covered.latest_observation(code) {
                return Some(entry);
            }
        }
        self.observation_history.get(code)
    }

    /// Returns true if an entry with `code` is open in the current record,
    /// or in either additional record in dual-record mode.
    pub fn is_active(&self, kind: EntryKind, code: &str) -> bool {
        if self.record.is_active(kind, code) {
            return true;
        }
        match &self.dual {
            Some(dual) => dual.uncovered.is_active(kind, code) || dual.covered.is_active(kind, code),
            None => false,
        }
    }
}
