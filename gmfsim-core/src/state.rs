//! State templates, per-person state instances and module histories.
//!
//! A [`StateTemplate`] is parsed once per module and shared through an
//! `Arc`. Entering a state creates a [`StateInstance`] that points at the
//! template and carries the three per-person timestamps; nothing per-person
//! is ever written to the template.

use crate::distribution::{
    Distribution, Exact, ExactWithUnit, Range, RangeWithUnit, Span,
};
use crate::logic::Condition;
use crate::record::{Code, EncounterClass};
use crate::time::{TimeUnit, Timestamp};
use crate::transition::TransitionRule;
use rand::Rng;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Name every module's entry state must have.
pub const INITIAL: &str = "Initial";

/// An immutable, parsed state.
#[derive(Debug)]
pub struct StateTemplate {
    pub name: String,
    pub kind: StateKind,
    /// Absent only for Terminal states.
    pub transition: Option<TransitionRule>,
    pub remarks: Vec<String>,
}

impl StateTemplate {
    pub fn new(name: impl Into<String>, kind: StateKind, transition: Option<TransitionRule>) -> Self {
        Self {
            name: name.into(),
            kind,
            transition,
            remarks: Vec::new(),
        }
    }
}

/// Variant-specific state parameters.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StateKind {
    Initial,
    Simple,
    Terminal,
    CallSubmodule(CallSubmodule),
    Delay(Delay),
    Guard(Guard),
    SetAttribute(SetAttribute),
    Counter(Counter),
    Encounter(Encounter),
    EncounterEnd(EncounterEnd),
    ConditionOnset(Onset),
    AllergyOnset(Onset),
    ConditionEnd(EndEntry),
    AllergyEnd(EndEntry),
    MedicationOrder(MedicationOrder),
    MedicationEnd(EndEntry),
    CarePlanStart(CarePlanStart),
    CarePlanEnd(EndEntry),
    Procedure(Procedure),
    Observation(Observation),
    MultiObservation(ObservationGroup),
    DiagnosticReport(ObservationGroup),
    Symptom(Symptom),
    VitalSign(VitalSign),
    Device(Device),
    DeviceEnd(EndEntry),
    SupplyList(SupplyList),
    Death(Death),
}

impl StateKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StateKind::Initial => "Initial",
            StateKind::Simple => "Simple",
            StateKind::Terminal => "Terminal",
            StateKind::CallSubmodule(_) => "CallSubmodule",
            StateKind::Delay(_) => "Delay",
            StateKind::Guard(_) => "Guard",
            StateKind::SetAttribute(_) => "SetAttribute",
            StateKind::Counter(_) => "Counter",
            StateKind::Encounter(_) => "Encounter",
            StateKind::EncounterEnd(_) => "EncounterEnd",
            StateKind::ConditionOnset(_) => "ConditionOnset",
            StateKind::AllergyOnset(_) => "AllergyOnset",
            StateKind::ConditionEnd(_) => "ConditionEnd",
            StateKind::AllergyEnd(_) => "AllergyEnd",
            StateKind::MedicationOrder(_) => "MedicationOrder",
            StateKind::MedicationEnd(_) => "MedicationEnd",
            StateKind::CarePlanStart(_) => "CarePlanStart",
            StateKind::CarePlanEnd(_) => "CarePlanEnd",
            StateKind::Procedure(_) => "Procedure",
            StateKind::Observation(_) => "Observation",
            StateKind::MultiObservation(_) => "MultiObservation",
            StateKind::DiagnosticReport(_) => "DiagnosticReport",
            StateKind::Symptom(_) => "Symptom",
            StateKind::VitalSign(_) => "VitalSign",
            StateKind::Device(_) => "Device",
            StateKind::DeviceEnd(_) => "DeviceEnd",
            StateKind::SupplyList(_) => "SupplyList",
            StateKind::Death(_) => "Death",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Terminal)
    }

    /// Delayable states report `next` rather than the tick time as their
    /// exit time.
    pub fn is_delayable(&self) -> bool {
        matches!(self, StateKind::Delay(_) | StateKind::Procedure(_))
    }

    /// Names of other states this state refers to by name.
    pub fn state_references(&self) -> Vec<&str> {
        match self {
            StateKind::ConditionOnset(onset) | StateKind::AllergyOnset(onset) => {
                onset.target_encounter.iter().map(String::as_str).collect()
            }
            StateKind::ConditionEnd(end)
            | StateKind::AllergyEnd(end)
            | StateKind::MedicationEnd(end)
            | StateKind::CarePlanEnd(end)
            | StateKind::DeviceEnd(end) => end.state.iter().map(String::as_str).collect(),
            StateKind::Death(death) => death.condition_onset.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Checks constraints that depend on more than one field.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StateKind::Guard(guard) => guard.allow.validate(),
            StateKind::Encounter(encounter) => {
                if !encounter.wellness {
                    if encounter.encounter_class.is_none() {
                        return Err("non-wellness Encounter needs an 'encounter_class'".to_string());
                    }
                    require_codes(&encounter.codes)?;
                }
                Ok(())
            }
            StateKind::ConditionOnset(onset) | StateKind::AllergyOnset(onset) => {
                require_codes(&onset.codes)
            }
            StateKind::ConditionEnd(end)
            | StateKind::AllergyEnd(end)
            | StateKind::MedicationEnd(end)
            | StateKind::CarePlanEnd(end)
            | StateKind::DeviceEnd(end) => {
                if end.state.is_none() && end.referenced_by_attribute.is_none() && end.codes.is_none()
                {
                    return Err(
                        "end state needs a state name, 'referenced_by_attribute' or 'codes'"
                            .to_string(),
                    );
                }
                Ok(())
            }
            StateKind::MedicationOrder(order) => require_codes(&order.codes),
            StateKind::CarePlanStart(careplan) => require_codes(&careplan.codes),
            StateKind::Procedure(procedure) => require_codes(&procedure.codes),
            StateKind::Observation(observation) => observation.validate(),
            StateKind::MultiObservation(group) | StateKind::DiagnosticReport(group) => {
                require_codes(&group.codes)?;
                group.observations.iter().try_for_each(Observation::validate)
            }
            StateKind::Symptom(symptom) => match symptom.probability {
                Some(p) if !(0.0..=1.0).contains(&p) => {
                    Err(format!("symptom probability {} is outside [0, 1]", p))
                }
                _ => Ok(()),
            },
            StateKind::Counter(counter) => {
                if counter.amount < 1 {
                    return Err(format!(
                        "Counter amount must be at least 1, got {}",
                        counter.amount
                    ));
                }
                Ok(())
            }
            StateKind::VitalSign(vital) => {
                if !vital.amount.is_set() {
                    return Err("VitalSign needs 'exact', 'range' or 'distribution'".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn require_codes(codes: &[Code]) -> Result<(), String> {
    if codes.is_empty() {
        return Err("at least one code is required".to_string());
    }
    Ok(())
}

// =============================================================================
// Variant parameters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CallSubmodule {
    /// Catalog key, e.g. `medications/otc_antihistamine`.
    pub submodule: String,
}

#[derive(Debug, Deserialize)]
struct RawSpan {
    #[serde(default)]
    exact: Option<ExactWithUnit>,
    #[serde(default)]
    range: Option<RangeWithUnit>,
    #[serde(default)]
    distribution: Option<Distribution>,
    #[serde(default)]
    unit: Option<TimeUnit>,
}

/// Waits for a span of simulated time drawn on first visit.
#[derive(Debug)]
pub struct Delay {
    pub span: Span,
}

impl<'de> Deserialize<'de> for Delay {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawSpan::deserialize(deserializer)?;
        let span = Span::from_parts(raw.exact, raw.range, raw.distribution, raw.unit)
            .map_err(serde::de::Error::custom)?
            .ok_or_else(|| {
                serde::de::Error::custom("Delay needs 'exact', 'range' or 'distribution'")
            })?;
        Ok(Self { span })
    }
}

#[derive(Debug, Deserialize)]
pub struct Guard {
    pub allow: Condition,
}

#[derive(Debug, Deserialize)]
pub struct SetAttribute {
    pub attribute: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub range: Option<Range>,
    #[serde(default)]
    pub distribution: Option<Distribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterAction {
    Increment,
    Decrement,
}

#[derive(Debug, Deserialize)]
pub struct Counter {
    pub attribute: String,
    pub action: CounterAction,
    /// Positive; load rejects anything else.
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_amount() -> i64 {
    1
}

impl Counter {
    /// Signed step applied per visit.
    pub fn step(&self) -> i64 {
        match self.action {
            CounterAction::Increment => self.amount,
            CounterAction::Decrement => -self.amount,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Encounter {
    #[serde(default)]
    pub wellness: bool,
    #[serde(default)]
    pub encounter_class: Option<EncounterClass>,
    #[serde(default)]
    pub codes: Vec<Code>,
    /// Attribute or ConditionOnset state naming the reason for the visit.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EncounterEnd {
    #[serde(default)]
    pub discharge_disposition: Option<Code>,
}

/// ConditionOnset / AllergyOnset parameters.
#[derive(Debug, Deserialize)]
pub struct Onset {
    pub codes: Vec<Code>,
    #[serde(default)]
    pub assign_to_attribute: Option<String>,
    /// Encounter state that diagnoses the onset.
    #[serde(default)]
    pub target_encounter: Option<String>,
}

impl Onset {
    /// Returns the target encounter name, treating blank names as unset.
    pub fn target(&self) -> Option<&str> {
        self.target_encounter
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Parameters shared by the end states. The state-name field is spelled
/// differently per variant.
#[derive(Debug, Deserialize)]
pub struct EndEntry {
    #[serde(default)]
    pub codes: Option<Vec<Code>>,
    #[serde(
        default,
        rename = "condition_onset",
        alias = "allergy_onset",
        alias = "medication_order",
        alias = "careplan",
        alias = "device"
    )]
    pub state: Option<String>,
    #[serde(default)]
    pub referenced_by_attribute: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MedicationOrder {
    pub codes: Vec<Code>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub prescription: Option<serde_json::Value>,
    #[serde(default)]
    pub assign_to_attribute: Option<String>,
    #[serde(default)]
    pub administration: bool,
    #[serde(default)]
    pub chronic: bool,
}

#[derive(Debug, Deserialize)]
pub struct CarePlanStart {
    pub codes: Vec<Code>,
    #[serde(default)]
    pub activities: Vec<Code>,
    #[serde(default)]
    pub goals: Vec<serde_json::Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub assign_to_attribute: Option<String>,
}

#[derive(Debug)]
pub struct Procedure {
    pub codes: Vec<Code>,
    pub reason: Option<String>,
    pub duration: Option<Span>,
    pub assign_to_attribute: Option<String>,
}

#[derive(Deserialize)]
struct RawProcedure {
    codes: Vec<Code>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    duration: Option<RangeWithUnit>,
    #[serde(default)]
    distribution: Option<Distribution>,
    #[serde(default)]
    unit: Option<TimeUnit>,
    #[serde(default)]
    assign_to_attribute: Option<String>,
}

impl<'de> Deserialize<'de> for Procedure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawProcedure::deserialize(deserializer)?;
        let duration = Span::from_parts(None, raw.duration, raw.distribution, raw.unit)
            .map_err(serde::de::Error::custom)?;
        Ok(Self {
            codes: raw.codes,
            reason: raw.reason,
            duration,
            assign_to_attribute: raw.assign_to_attribute,
        })
    }
}

/// A unitless quantity: legacy `exact` / `range` or a `distribution`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Amount {
    #[serde(default)]
    pub exact: Option<Exact>,
    #[serde(default)]
    pub range: Option<Range>,
    #[serde(default)]
    pub distribution: Option<Distribution>,
}

impl Amount {
    pub fn is_set(&self) -> bool {
        self.exact.is_some() || self.range.is_some() || self.distribution.is_some()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<f64> {
        if let Some(exact) = &self.exact {
            Some(exact.quantity)
        } else if let Some(range) = &self.range {
            Some(range.sample(rng))
        } else {
            self.distribution.as_ref().map(|d| d.sample(rng))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Observation {
    pub codes: Vec<Code>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub amount: Amount,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub vital_sign: Option<String>,
    #[serde(default)]
    pub value_code: Option<Code>,
}

impl Observation {
    fn validate(&self) -> Result<(), String> {
        require_codes(&self.codes)?;
        let sources = [
            self.amount.is_set(),
            self.attribute.is_some(),
            self.vital_sign.is_some(),
            self.value_code.is_some(),
        ];
        if sources.iter().filter(|s| **s).count() > 1 {
            return Err("Observation may have only one value source".to_string());
        }
        Ok(())
    }
}

/// MultiObservation / DiagnosticReport parameters.
#[derive(Debug, Deserialize)]
pub struct ObservationGroup {
    pub codes: Vec<Code>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub observations: Vec<Observation>,
    /// Groups already-recorded observations when no nested ones are given.
    #[serde(default)]
    pub number_of_observations: Option<usize>,
}

impl ObservationGroup {
    pub fn count(&self) -> usize {
        if self.observations.is_empty() {
            self.number_of_observations.unwrap_or(0)
        } else {
            self.observations.len()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Symptom {
    pub symptom: String,
    /// Defaults to the module name.
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub addressed: bool,
    #[serde(flatten)]
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
pub struct VitalSign {
    pub vital_sign: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
pub struct Device {
    pub code: Code,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub assign_to_attribute: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Supply {
    pub code: Code,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct SupplyList {
    pub supplies: Vec<Supply>,
}

#[derive(Debug)]
pub struct Death {
    pub codes: Option<Vec<Code>>,
    pub condition_onset: Option<String>,
    pub referenced_by_attribute: Option<String>,
    /// Delay before death; immediate when absent.
    pub delay: Option<Span>,
}

#[derive(Deserialize)]
struct RawDeath {
    #[serde(default)]
    codes: Option<Vec<Code>>,
    #[serde(default)]
    condition_onset: Option<String>,
    #[serde(default)]
    referenced_by_attribute: Option<String>,
    #[serde(default)]
    exact: Option<ExactWithUnit>,
    #[serde(default)]
    range: Option<RangeWithUnit>,
}

impl<'de> Deserialize<'de> for Death {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawDeath::deserialize(deserializer)?;
        let delay =
            Span::from_parts(raw.exact, raw.range, None, None).map_err(serde::de::Error::custom)?;
        Ok(Self {
            codes: raw.codes,
            condition_onset: raw.condition_onset,
            referenced_by_attribute: raw.referenced_by_attribute,
            delay,
        })
    }
}

// =============================================================================
// Instances and histories
// =============================================================================

/// One visit of one person to one state.
#[derive(Debug, Clone)]
pub struct StateInstance {
    pub template: Arc<StateTemplate>,
    pub entered: Option<Timestamp>,
    pub exited: Option<Timestamp>,
    /// Frozen resume time of a delayable state.
    pub next: Option<Timestamp>,
}

impl StateInstance {
    pub fn new(template: Arc<StateTemplate>) -> Self {
        Self {
            template,
            entered: None,
            exited: None,
            next: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn kind(&self) -> &StateKind {
        &self.template.kind
    }
}

impl Serialize for StateInstance {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("StateInstance", 5)?;
        s.serialize_field("name", self.name())?;
        s.serialize_field("type", self.kind().type_name())?;
        s.serialize_field("entered", &self.entered)?;
        s.serialize_field("exited", &self.exited)?;
        s.serialize_field("next", &self.next)?;
        s.end()
    }
}

/// A person's visits to one module's states, most recent first.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct ModuleHistory {
    states: VecDeque<StateInstance>,
}

impl ModuleHistory {
    /// Starts a history at the module's Initial state.
    pub fn new(initial: Arc<StateTemplate>) -> Self {
        let mut states = VecDeque::new();
        states.push_front(StateInstance::new(initial));
        Self { states }
    }

    /// The active instance. A history is never empty.
    pub fn current(&self) -> &StateInstance {
        &self.states[0]
    }

    pub fn current_mut(&mut self) -> &mut StateInstance {
        &mut self.states[0]
    }

    pub fn push_front(&mut self, instance: StateInstance) {
        self.states.push_front(instance);
    }

    /// Places another history's visits in front of this one's, keeping
    /// their order.
    pub fn prepend(&mut self, other: ModuleHistory) {
        for instance in other.states.into_iter().rev() {
            self.states.push_front(instance);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateInstance> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
