//! Passes that run around the modules on every tick.
//!
//! Birth sampling happens once per attempt. Encounter detection runs before
//! the modules of a tick, close-out after them, and the death pass once at
//! the stop time.

use gmfsim_core::person::{
    ACTIVE_EMERGENCY_ENCOUNTER, ACTIVE_URGENT_CARE_ENCOUNTER, ACTIVE_WELLNESS_ENCOUNTER,
    CAUSE_OF_DEATH, GENDER, RACE, SOCIOECONOMIC_CATEGORY,
};
use gmfsim_core::record::ObservationValue;
use gmfsim_core::time::{TimeUnit, Timestamp};
use gmfsim_core::{AttributeValue, Code, EncounterClass, EntryKind, Person};
use tracing::trace;

pub const ACTIVE_OUTPATIENT_ENCOUNTER: &str = "active_outpatient_encounter";

/// Modules set this to false while the person's care is not covered.
pub const COVERED: &str = "covered";

/// Symptom total at the last symptom-driven visit.
pub const LAST_VISIT_SYMPTOM_TOTAL: &str = "last_visit_symptom_total";

pub const OUTPATIENT_SYMPTOM_THRESHOLD: u32 = 300;
pub const URGENT_CARE_SYMPTOM_THRESHOLD: u32 = 350;
pub const EMERGENCY_SYMPTOM_THRESHOLD: u32 = 500;

const GENDERS: &[(&str, f64)] = &[("M", 0.5), ("F", 0.5)];

const RACES: &[(&str, f64)] = &[
    ("white", 0.63),
    ("hispanic", 0.17),
    ("black", 0.12),
    ("asian", 0.06),
    ("native", 0.01),
    ("other", 0.01),
];

const SOCIOECONOMIC: &[(&str, f64)] = &[("Low", 0.3), ("Middle", 0.5), ("High", 0.2)];

/// Encounter flags opened by detection and the class each one closes.
const LIFECYCLE_ENCOUNTERS: &[(&str, EncounterClass)] = &[
    (ACTIVE_WELLNESS_ENCOUNTER, EncounterClass::Wellness),
    (ACTIVE_OUTPATIENT_ENCOUNTER, EncounterClass::Outpatient),
    (ACTIVE_URGENT_CARE_ENCOUNTER, EncounterClass::Urgentcare),
    (ACTIVE_EMERGENCY_ENCOUNTER, EncounterClass::Emergency),
];

fn death_certification() -> Code {
    Code::new("SNOMED-CT", "308646001", "Death Certification")
}

fn cause_of_death_observation() -> Code {
    Code::new(
        "LOINC",
        "69453-9",
        "Cause of Death [US Standard Certificate of Death]",
    )
}

fn death_certificate() -> Code {
    Code::new(
        "LOINC",
        "69409-1",
        "U.S. standard certificate of death - 2003 revision",
    )
}

/// Samples a birth time and starting demographics.
#[derive(Debug, Clone, Copy)]
pub struct BirthSampler {
    start: Timestamp,
    stop: Timestamp,
}

impl BirthSampler {
    /// Births fall uniformly in `[start, stop)`.
    pub fn new(start: Timestamp, stop: Timestamp) -> Self {
        Self { start, stop }
    }

    /// Records birth and demographics on `person` and returns the birth time.
    pub fn sample(&self, person: &mut Person) -> Timestamp {
        let span = (self.stop - self.start).max(0) as f64;
        let birth = self.start + (person.rand() * span) as Timestamp;
        person.birth(birth);

        let gender = pick(person, GENDERS);
        person.set_attribute(GENDER, gender);
        let race = pick(person, RACES);
        person.set_attribute(RACE, race);
        let category = pick(person, SOCIOECONOMIC);
        person.set_attribute(SOCIOECONOMIC_CATEGORY, category);
        birth
    }
}

/// Weighted choice; falls back to the last option.
fn pick(person: &mut Person, options: &[(&'static str, f64)]) -> &'static str {
    let p = person.rand();
    let mut cumulative = 0.0;
    for (value, weight) in options {
        cumulative += weight;
        if cumulative > p {
            return *value;
        }
    }
    options.last().map(|(v, _)| *v).unwrap_or_default()
}

/// Recommended time between wellness visits at the person's age.
pub fn wellness_interval(person: &Person, time: Timestamp) -> Option<i64> {
    let years = person.age_in_years(time)?;
    let interval = if years <= 3.0 {
        let months = person.age_in_months(time)?;
        let every = if months <= 1.0 {
            1.0
        } else if months <= 5.0 {
            2.0
        } else if months <= 17.0 {
            3.0
        } else {
            6.0
        };
        TimeUnit::Months.to_millis(every)
    } else if years <= 19.0 {
        TimeUnit::Years.to_millis(1.0)
    } else if years <= 39.0 {
        TimeUnit::Years.to_millis(3.0)
    } else if years <= 49.0 {
        TimeUnit::Years.to_millis(2.0)
    } else {
        TimeUnit::Years.to_millis(1.0)
    };
    Some(interval)
}

/// Points the current record at covered or uncovered care in dual-record
/// mode, following the `covered` attribute (covered when unset).
///
/// Runs between encounters only. Returns whether the record was switched.
pub fn coverage_pass(person: &mut Person, time: Timestamp) -> bool {
    let lifecycle_open = LIFECYCLE_ENCOUNTERS
        .iter()
        .any(|(flag, _)| person.has_attribute(flag));
    if !person.has_multiple_records() || lifecycle_open || person.has_current_encounter() {
        return false;
    }
    let covered = person
        .attribute(COVERED)
        .and_then(AttributeValue::as_bool)
        .unwrap_or(true);
    let switched = person.set_covered(covered);
    if switched {
        trace!(person = %person.id, time, covered, "record switched");
    }
    switched
}

/// Opens a wellness or symptom-driven encounter when one is due.
///
/// Returns the class of the opened encounter.
pub fn encounter_detection(person: &mut Person, time: Timestamp) -> Option<EncounterClass> {
    if !person.alive(time) || person.has_current_encounter() {
        return None;
    }

    let due = wellness_interval(person, time)
        .map_or(false, |interval| person.record.time_since_last_wellness(time) >= interval);
    if due {
        person.record.encounter_start(time, EncounterClass::Wellness);
        person.set_attribute(ACTIVE_WELLNESS_ENCOUNTER, true);
        trace!(person = %person.id, time, "wellness encounter");
        return Some(EncounterClass::Wellness);
    }

    let total = person.symptom_total();
    let last = person
        .attribute(LAST_VISIT_SYMPTOM_TOTAL)
        .and_then(AttributeValue::as_f64)
        .map(|v| v as u32);
    if last == Some(total) {
        return None;
    }
    let (class, flag) = if total > EMERGENCY_SYMPTOM_THRESHOLD {
        (EncounterClass::Emergency, ACTIVE_EMERGENCY_ENCOUNTER)
    } else if total > URGENT_CARE_SYMPTOM_THRESHOLD {
        (EncounterClass::Urgentcare, ACTIVE_URGENT_CARE_ENCOUNTER)
    } else if total > OUTPATIENT_SYMPTOM_THRESHOLD {
        (EncounterClass::Outpatient, ACTIVE_OUTPATIENT_ENCOUNTER)
    } else {
        return None;
    };

    person.record.encounter_start(time, class);
    person.set_attribute(flag, true);
    person.set_attribute(LAST_VISIT_SYMPTOM_TOTAL, total as i64);
    trace!(person = %person.id, time, ?class, total, "symptom encounter");
    Some(class)
}

/// Ends the encounters opened by detection this tick.
pub fn encounter_close_out(person: &mut Person, time: Timestamp) {
    for (flag, class) in LIFECYCLE_ENCOUNTERS {
        if person.remove_attribute(flag).is_some() {
            person.record.encounter_end(time, *class);
        }
    }
}

/// Records the death certification of a person who died with a known cause.
///
/// Returns whether anything was recorded.
pub fn death_pass(person: &mut Person, stop: Timestamp) -> bool {
    if person.alive(stop) {
        return false;
    }
    let (Some(time), Some(AttributeValue::Code(cause))) =
        (person.death_time(), person.attribute(CAUSE_OF_DEATH).cloned())
    else {
        return false;
    };

    let index = person.record.encounter_start(time, EncounterClass::Ambulatory);
    if let Some(encounter) = person.record.encounter_mut(index) {
        encounter.codes = vec![death_certification()];
        encounter.name = Some("Death Certification".to_string());
    }

    let observation = cause_of_death_observation();
    let at = person.record_observation(time, &observation.code, Some(ObservationValue::Code(cause)));
    if let Some(entry) = person.record.entry_mut(at) {
        entry.codes = vec![observation];
    }
    person.remember_observation(at);

    let certificate = death_certificate();
    let at = person
        .record
        .group_observations(time, EntryKind::Report, &certificate.code, 1);
    if let Some(entry) = person.record.entry_mut(at) {
        entry.codes = vec![certificate];
    }

    person.record.encounter_end(time, EncounterClass::Ambulatory);
    true
}
