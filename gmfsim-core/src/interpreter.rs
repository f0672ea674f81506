//! Module interpreter.
//!
//! [`Interpreter::process`] runs one module for one person for one tick.
//! The active state is run; while it exits, its transition is resolved and
//! a fresh instance of the target state is pushed onto the person's history
//! for that module. A delayable state that finished between ticks reports
//! an exit time earlier than the tick, and the module is re-run at that
//! earlier time before the tick continues so recorded facts stay in
//! chronological order.

use crate::catalog::ModuleCatalog;
use crate::definition::ModuleDefinition;
use crate::error::CoreError;
use crate::person::{AttributeValue, PendingOnset, Person, ACTIVE_WELLNESS_ENCOUNTER};
use crate::record::{Code, EncounterClass, Entry, EntryKind, EntryRef, ObservationValue};
use crate::state::{
    CallSubmodule, Death, EndEntry, ModuleHistory, Observation, ObservationGroup, Onset,
    StateInstance, StateKind,
};
use crate::time::Timestamp;
use serde_json::Value;
use tracing::trace;

/// Stop reason for ended medications.
fn medication_expired() -> Code {
    Code::new(
        "SNOMED-CT",
        "182840001",
        "Drug treatment stopped - medical advice",
    )
}

/// Stop reason for ended care plans.
fn careplan_finished() -> Code {
    Code::new("SNOMED-CT", "385658003", "Done")
}

/// Result of running the active state once.
enum Step {
    Blocked,
    Exit,
    /// A CallSubmodule state exited; carries the finished submodule history.
    Returned(Option<ModuleHistory>),
}

/// Runs modules from a catalog against people.
pub struct Interpreter<'a> {
    catalog: &'a ModuleCatalog,
}

impl<'a> Interpreter<'a> {
    pub fn new(catalog: &'a ModuleCatalog) -> Self {
        Self { catalog }
    }

    /// Runs `module` for `person` at `time`.
    ///
    /// Returns true when the module is complete: the active state is
    /// Terminal or the person is dead.
    pub fn process(
        &self,
        module: &ModuleDefinition,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<bool, CoreError> {
        if !person.alive(time) {
            return Ok(true);
        }
        if person.history(&module.key).is_none() {
            let initial = module.initial()?.clone();
            person.history_or_insert_with(&module.key, || ModuleHistory::new(initial));
        }

        let wellness_key = format!("{} {}", ACTIVE_WELLNESS_ENCOUNTER, module.name);
        if person.has_attribute(ACTIVE_WELLNESS_ENCOUNTER) {
            person.set_attribute(wellness_key.as_str(), true);
        }
        let result = self.run_module(module, person, time);
        person.remove_attribute(&wellness_key);
        result
    }

    fn run_module(
        &self,
        module: &ModuleDefinition,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<bool, CoreError> {
        if !person.alive(time) {
            return Ok(true);
        }
        let key = module.key.as_str();

        loop {
            let mut current = history(person, key)?.current().clone();
            let step = self.run(module, &mut current, person, time)?;

            let slot = history_mut(person, key)?;
            *slot.current_mut() = current.clone();
            match step {
                Step::Blocked => break,
                Step::Exit => {}
                Step::Returned(submodule) => {
                    if let Some(submodule) = submodule {
                        slot.prepend(submodule);
                    }
                    // marks the return to the calling module
                    slot.push_front(current.clone());
                }
            }

            let template = current.template.clone();
            let rule = template.transition.as_ref().ok_or_else(|| {
                CoreError::invalid(key, format!("state '{}' has no transition", template.name))
            })?;
            let target = rule.resolve(person, key, time)?;
            let next = module.require_state(target)?.clone();
            trace!(module = key, from = %template.name, to = target, time, "transition");
            history_mut(person, key)?.push_front(StateInstance::new(next));

            if let Some(exited) = current.exited {
                if exited < time {
                    self.run_module(module, person, exited)?;
                    if !person.alive(time) {
                        return Ok(true);
                    }
                }
            }
        }

        let terminal = history(person, key)?.current().kind().is_terminal();
        Ok(terminal || !person.alive(time))
    }

    /// Runs one instance, stamping `entered` on the first call and `exited`
    /// on the call that exits.
    fn run(
        &self,
        module: &ModuleDefinition,
        instance: &mut StateInstance,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<Step, CoreError> {
        if !person.alive(time) {
            return Ok(Step::Blocked);
        }
        if instance.entered.is_none() {
            instance.entered = Some(time);
        }
        let step = self.process_state(module, instance, person, time)?;
        if !matches!(step, Step::Blocked) {
            instance.exited = if instance.kind().is_delayable() {
                instance.next
            } else {
                Some(time)
            };
        }
        Ok(step)
    }

    fn process_state(
        &self,
        module: &ModuleDefinition,
        instance: &mut StateInstance,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<Step, CoreError> {
        let template = instance.template.clone();
        let name = template.name.as_str();
        let key = module.key.as_str();

        let exit = match &template.kind {
            StateKind::Initial | StateKind::Simple => true,
            StateKind::Terminal => false,
            StateKind::CallSubmodule(call) => {
                return self.call_submodule(module, call, person, time);
            }
            StateKind::Delay(delay) => {
                let next = match instance.next {
                    Some(next) => next,
                    None => {
                        let next = time + delay.span.millis(person.rng_mut());
                        instance.next = Some(next);
                        next
                    }
                };
                time >= next && person.alive(next)
            }
            StateKind::Guard(guard) => guard.allow.test(person, key, time)?,
            StateKind::SetAttribute(set) => {
                let value = if let Some(range) = &set.range {
                    Some(AttributeValue::from(range.sample(person.rng_mut())))
                } else if let Some(distribution) = &set.distribution {
                    Some(AttributeValue::from(distribution.sample(person.rng_mut())))
                } else {
                    set.value
                        .as_ref()
                        .filter(|v| !v.is_null())
                        .map(|v| AttributeValue::Value(integral(v)))
                };
                match value {
                    Some(value) => person.set_attribute(set.attribute.as_str(), value),
                    None => {
                        person.remove_attribute(&set.attribute);
                    }
                }
                true
            }
            StateKind::Counter(counter) => {
                let current = person
                    .attribute(&counter.attribute)
                    .and_then(|a| match a {
                        AttributeValue::Value(Value::String(s)) => s.parse::<f64>().ok(),
                        other => other.as_f64(),
                    })
                    .map(|v| v as i64)
                    .unwrap_or(0);
                person.set_attribute(counter.attribute.as_str(), current + counter.step());
                true
            }
            StateKind::Encounter(encounter) => {
                if encounter.wellness {
                    let index = person.record.current_encounter(time);
                    let active_key = format!("{} {}", ACTIVE_WELLNESS_ENCOUNTER, module.name);
                    if person.remove_attribute(&active_key).is_none() {
                        // blocks until the next scheduled wellness visit
                        return Ok(Step::Blocked);
                    }
                    person.set_current_encounter(key, Some(index));
                    self.diagnose_pending(key, name, person, time);
                } else {
                    let class = encounter.encounter_class.ok_or_else(|| {
                        CoreError::invalid(key, format!("state '{}' has no encounter_class", name))
                    })?;
                    let reason = encounter
                        .reason
                        .as_deref()
                        .and_then(|r| reason_codes(person, key, r).into_iter().next());
                    let index = person.record.encounter_start(time, class);
                    if let Some(record) = person.record.encounter_mut(index) {
                        record.codes = encounter.codes.clone();
                        record.name = Some(name.to_string());
                        record.reason = reason;
                    }
                    person.set_current_encounter(key, Some(index));
                    self.diagnose_pending(key, name, person, time);
                }
                true
            }
            StateKind::EncounterEnd(end) => {
                if let Some(index) = person.current_encounter(key) {
                    let class = person.record.encounter(index).map(|e| e.class);
                    if let Some(class) = class {
                        if class != EncounterClass::Wellness {
                            person.record.encounter_end(time, class);
                        }
                    }
                    if let Some(record) = person.record.encounter_mut(index) {
                        record.discharge = end.discharge_disposition.clone();
                    }
                }
                person.set_current_encounter(key, None);
                true
            }
            StateKind::ConditionOnset(onset) => {
                self.onset(key, name, EntryKind::Condition, onset, person, time)?;
                true
            }
            StateKind::AllergyOnset(onset) => {
                self.onset(key, name, EntryKind::Allergy, onset, person, time)?;
                true
            }
            StateKind::ConditionEnd(end) => {
                end_entries(person, name, EntryKind::Condition, end, None, true, time)?;
                true
            }
            StateKind::AllergyEnd(end) => {
                end_entries(person, name, EntryKind::Allergy, end, None, true, time)?;
                true
            }
            StateKind::MedicationEnd(end) => {
                let reason = medication_expired();
                end_entries(person, name, EntryKind::Medication, end, Some(&reason), true, time)?;
                true
            }
            StateKind::CarePlanEnd(end) => {
                let reason = careplan_finished();
                end_entries(person, name, EntryKind::CarePlan, end, Some(&reason), true, time)?;
                true
            }
            StateKind::DeviceEnd(end) => {
                end_entries(person, name, EntryKind::Device, end, None, false, time)?;
                true
            }
            StateKind::MedicationOrder(order) => {
                let reasons = order
                    .reason
                    .as_deref()
                    .map(|r| reason_codes(person, key, r))
                    .unwrap_or_default();
                let code = primary_code(key, name, &order.codes)?;
                let at = person.record.start(time, EntryKind::Medication, code);
                if let Some(entry) = person.record.entry_mut(at) {
                    describe(entry, name, &order.codes);
                    entry.reasons = reasons;
                    entry.chronic = order.chronic;
                    entry.details = Some(serde_json::json!({
                        "prescription": order.prescription,
                        "administration": order.administration,
                    }));
                }
                assign(person, at, order.assign_to_attribute.as_deref());
                true
            }
            StateKind::CarePlanStart(careplan) => {
                let reasons = careplan
                    .reason
                    .as_deref()
                    .map(|r| reason_codes(person, key, r))
                    .unwrap_or_default();
                let details = serde_json::json!({
                    "activities": serde_json::to_value(&careplan.activities)?,
                    "goals": careplan.goals,
                });
                let code = primary_code(key, name, &careplan.codes)?;
                let at = person.record.start(time, EntryKind::CarePlan, code);
                if let Some(entry) = person.record.entry_mut(at) {
                    describe(entry, name, &careplan.codes);
                    entry.reasons = reasons;
                    entry.details = Some(details);
                }
                assign(person, at, careplan.assign_to_attribute.as_deref());
                true
            }
            StateKind::Procedure(procedure) => {
                let next = match instance.next {
                    Some(next) => next,
                    None => {
                        let reasons = procedure
                            .reason
                            .as_deref()
                            .map(|r| reason_codes(person, key, r))
                            .unwrap_or_default();
                        let stop = procedure
                            .duration
                            .as_ref()
                            .map(|span| time + span.millis(person.rng_mut()));
                        let code = primary_code(key, name, &procedure.codes)?;
                        let at = person.record.record(time, EntryKind::Procedure, code);
                        if let Some(entry) = person.record.entry_mut(at) {
                            describe(entry, name, &procedure.codes);
                            entry.reasons = reasons;
                            entry.stop = stop;
                        }
                        assign(person, at, procedure.assign_to_attribute.as_deref());
                        let next = stop.unwrap_or(time);
                        instance.next = Some(next);
                        next
                    }
                };
                time >= next && person.alive(next)
            }
            StateKind::Observation(observation) => {
                record_observation(person, key, name, observation, time)?;
                true
            }
            StateKind::MultiObservation(group) => {
                let at = record_group(person, key, name, EntryKind::Observation, group, time)?;
                person.remember_observation(at);
                true
            }
            StateKind::DiagnosticReport(group) => {
                record_group(person, key, name, EntryKind::Report, group, time)?;
                true
            }
            StateKind::Symptom(symptom) => {
                let probability = symptom.probability.unwrap_or(1.0);
                if person.rand() <= probability {
                    let severity = symptom
                        .amount
                        .sample(person.rng_mut())
                        .map(|v| v.max(0.0) as u32)
                        .unwrap_or(0);
                    let cause = symptom.cause.as_deref().unwrap_or(&module.name);
                    person.set_symptom(cause, &symptom.symptom, time, severity, symptom.addressed);
                }
                true
            }
            StateKind::VitalSign(vital) => {
                let value = vital.amount.sample(person.rng_mut()).ok_or_else(|| {
                    CoreError::invalid(key, format!("state '{}' has no value", name))
                })?;
                person.set_vital_sign(&vital.vital_sign, value);
                true
            }
            StateKind::Device(device) => {
                let at = person.record.start(time, EntryKind::Device, &device.code.code);
                if let Some(entry) = person.record.entry_mut(at) {
                    describe(entry, name, std::slice::from_ref(&device.code));
                    entry.details = Some(serde_json::json!({
                        "manufacturer": device.manufacturer,
                        "model": device.model,
                    }));
                }
                assign(person, at, device.assign_to_attribute.as_deref());
                true
            }
            StateKind::SupplyList(list) => {
                for supply in &list.supplies {
                    let at = person.record.record(time, EntryKind::Supply, &supply.code.code);
                    if let Some(entry) = person.record.entry_mut(at) {
                        describe(entry, name, std::slice::from_ref(&supply.code));
                        entry.quantity = Some(supply.quantity);
                    }
                }
                true
            }
            StateKind::Death(death) => {
                self.death(key, name, death, person, time)?;
                true
            }
        };

        Ok(if exit { Step::Exit } else { Step::Blocked })
    }

    fn call_submodule(
        &self,
        module: &ModuleDefinition,
        call: &CallSubmodule,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<Step, CoreError> {
        let submodule = self.catalog.get(&call.submodule)?;
        if let Some(encounter) = person.current_encounter(&module.key) {
            person.set_current_encounter(&submodule.key, Some(encounter));
        }

        if !self.process(&submodule, person, time)? {
            return Ok(Step::Blocked);
        }

        let history = person.take_history(&submodule.key);
        if let Some(encounter) = person.current_encounter(&submodule.key) {
            person.set_current_encounter(&module.key, Some(encounter));
            person.set_current_encounter(&submodule.key, None);
        }
        Ok(Step::Returned(history))
    }

    fn onset(
        &self,
        module: &str,
        state: &str,
        kind: EntryKind,
        onset: &Onset,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<(), CoreError> {
        let in_target = match onset.target() {
            None => true,
            Some(target) => person
                .current_encounter(module)
                .and_then(|i| person.record.encounter(i))
                .and_then(|e| e.name.as_deref())
                == Some(target),
        };
        if in_target {
            diagnose(person, state, kind, &onset.codes, onset.assign_to_attribute.as_deref(), time);
            return Ok(());
        }

        if let Some(attribute) = &onset.assign_to_attribute {
            // placeholder until the target encounter records the real entry
            let code = primary_code(module, state, &onset.codes)?;
            let mut entry = Entry::new(kind, time, code);
            entry.codes = onset.codes.clone();
            entry.name = Some(state.to_string());
            person.set_attribute(attribute.as_str(), AttributeValue::Entry(Box::new(entry)));
        }
        person.add_pending_onset(PendingOnset {
            module: module.to_string(),
            state: state.to_string(),
            kind,
            codes: onset.codes.clone(),
            assign_to_attribute: onset.assign_to_attribute.clone(),
            target_encounter: onset.target_encounter.clone().unwrap_or_default(),
        });
        Ok(())
    }

    /// Records onsets that were waiting for the encounter state `encounter`.
    fn diagnose_pending(&self, module: &str, encounter: &str, person: &mut Person, time: Timestamp) {
        for pending in person.take_pending_onsets(module, encounter) {
            diagnose(
                person,
                &pending.state,
                pending.kind,
                &pending.codes,
                pending.assign_to_attribute.as_deref(),
                time,
            );
        }
    }

    fn death(
        &self,
        module: &str,
        state: &str,
        death: &Death,
        person: &mut Person,
        time: Timestamp,
    ) -> Result<(), CoreError> {
        let cause = if let Some(codes) = &death.codes {
            codes.first().cloned()
        } else if let Some(onset) = &death.condition_onset {
            if person.had_prior_state(module, onset, None, None) {
                person
                    .record
                    .active_by_state(EntryKind::Condition, onset)
                    .and_then(|e| e.codes.first().cloned())
            } else {
                None
            }
        } else if let Some(attribute) = &death.referenced_by_attribute {
            let entry = person
                .attribute(attribute)
                .and_then(|a| a.as_entry())
                .ok_or_else(|| CoreError::MissingAttribute {
                    attribute: attribute.clone(),
                    state: state.to_string(),
                })?;
            entry.codes.first().cloned()
        } else {
            None
        };

        let when = match &death.delay {
            Some(span) => time + span.millis(person.rng_mut()),
            None => time,
        };
        trace!(module, state, when, "death recorded");
        person.record_death(when, cause, state);
        Ok(())
    }
}

fn history<'p>(person: &'p Person, module: &str) -> Result<&'p ModuleHistory, CoreError> {
    person.history(module).ok_or_else(|| CoreError::ModuleNotFound {
        module: module.to_string(),
    })
}

fn history_mut<'p>(person: &'p mut Person, module: &str) -> Result<&'p mut ModuleHistory, CoreError> {
    person.history_mut(module).ok_or_else(|| CoreError::ModuleNotFound {
        module: module.to_string(),
    })
}

/// Stores whole floats as integers so `3.0` and `3` compare alike.
fn integral(value: &Value) -> Value {
    match value.as_f64() {
        Some(f) if value.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Value::from(f as i64)
        }
        _ => value.clone(),
    }
}

fn describe(entry: &mut Entry, state: &str, codes: &[Code]) {
    entry.name = Some(state.to_string());
    if entry.codes.is_empty() {
        entry.codes = codes.to_vec();
    }
}

fn assign(person: &mut Person, at: EntryRef, attribute: Option<&str>) {
    if let Some(attribute) = attribute {
        if let Some(entry) = person.record.entry(at).cloned() {
            person.set_attribute(attribute, AttributeValue::Entry(Box::new(entry)));
        }
    }
}

/// Code of the entry a state records. Loaded definitions always carry one.
fn primary_code<'c>(module: &str, state: &str, codes: &'c [Code]) -> Result<&'c str, CoreError> {
    codes
        .first()
        .map(|c| c.code.as_str())
        .ok_or_else(|| CoreError::invalid(module, format!("state '{}' has no codes", state)))
}

fn diagnose(
    person: &mut Person,
    state: &str,
    kind: EntryKind,
    codes: &[Code],
    attribute: Option<&str>,
    time: Timestamp,
) {
    let Some(primary) = codes.first() else {
        return;
    };
    let at = person.record.start(time, kind, &primary.code);
    if let Some(entry) = person.record.entry_mut(at) {
        describe(entry, state, codes);
    }
    assign(person, at, attribute);
}

/// Codes of the entry named by `reason`: an attribute holding an entry, or
/// an active condition recorded by a state of that name.
fn reason_codes(person: &Person, module: &str, reason: &str) -> Vec<Code> {
    if let Some(entry) = person.attribute(reason).and_then(|a| a.as_entry()) {
        return entry.codes.clone();
    }
    if person.had_prior_state(module, reason, None, None) {
        return person
            .record
            .active(EntryKind::Condition)
            .filter(|e| e.name.as_deref() == Some(reason))
            .flat_map(|e| e.codes.iter().cloned())
            .collect();
    }
    Vec::new()
}

fn end_entries(
    person: &mut Person,
    state: &str,
    kind: EntryKind,
    end: &EndEntry,
    reason: Option<&Code>,
    require_attribute: bool,
    time: Timestamp,
) -> Result<(), CoreError> {
    if let Some(by_state) = &end.state {
        person.record.end_by_state(time, kind, by_state, reason);
    } else if let Some(attribute) = &end.referenced_by_attribute {
        match person.attributes.get_mut(attribute) {
            Some(AttributeValue::Entry(entry)) => {
                entry.stop = Some(time);
                let code = entry.code.clone();
                person.record.end(time, kind, &code, reason);
            }
            _ if require_attribute => {
                return Err(CoreError::MissingAttribute {
                    attribute: attribute.clone(),
                    state: state.to_string(),
                })
            }
            _ => {}
        }
    } else if let Some(codes) = &end.codes {
        for code in codes {
            person.record.end(time, kind, &code.code, reason);
        }
    }
    Ok(())
}

fn observation_value(
    person: &mut Person,
    observation: &Observation,
) -> Option<ObservationValue> {
    if observation.amount.is_set() {
        return observation
            .amount
            .sample(person.rng_mut())
            .map(ObservationValue::Number);
    }
    if let Some(attribute) = &observation.attribute {
        return match person.attribute(attribute)? {
            AttributeValue::Value(Value::Number(n)) => n.as_f64().map(ObservationValue::Number),
            AttributeValue::Value(Value::Bool(b)) => Some(ObservationValue::Bool(*b)),
            AttributeValue::Value(Value::String(s)) => Some(ObservationValue::Text(s.clone())),
            AttributeValue::Code(code) => Some(ObservationValue::Code(code.clone())),
            _ => None,
        };
    }
    if let Some(vital) = &observation.vital_sign {
        return person.vital_sign(vital).map(ObservationValue::Number);
    }
    observation.value_code.clone().map(ObservationValue::Code)
}

fn record_observation(
    person: &mut Person,
    module: &str,
    state: &str,
    observation: &Observation,
    time: Timestamp,
) -> Result<EntryRef, CoreError> {
    let code = primary_code(module, state, &observation.codes)?;
    let value = observation_value(person, observation);
    let at = person.record_observation(time, code, value);
    if let Some(entry) = person.record.entry_mut(at) {
        describe(entry, state, &observation.codes);
        entry.category = observation.category.clone();
        entry.unit = observation.unit.clone();
    }
    person.remember_observation(at);
    Ok(at)
}

fn record_group(
    person: &mut Person,
    module: &str,
    state: &str,
    kind: EntryKind,
    group: &ObservationGroup,
    time: Timestamp,
) -> Result<EntryRef, CoreError> {
    let code = primary_code(module, state, &group.codes)?;
    for observation in &group.observations {
        record_observation(person, module, state, observation, time)?;
    }
    let at = person
        .record
        .group_observations(time, kind, code, group.count());
    if let Some(entry) = person.record.entry_mut(at) {
        describe(entry, state, &group.codes);
        entry.category = group.category.clone();
    }
    Ok(at)
}
