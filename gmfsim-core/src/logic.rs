//! Condition evaluation.
//!
//! Conditions are boolean expression trees attached to Guard states and to
//! conditional and complex transitions. They are parsed once with the
//! module and shared by every simulated person, so evaluation never writes
//! to the tree (the PriorState window cache is write-once and
//! data-independent).
//!
//! ```json
//! {
//!   "condition_type": "And",
//!   "conditions": [
//!     {"condition_type": "Age", "operator": ">=", "quantity": 18, "unit": "years"},
//!     {"condition_type": "Active Condition", "codes": [{"system": "SNOMED-CT", "code": "195967001"}]}
//!   ]
//! }
//! ```
//!
//! Missing data is an error rather than `false` where a comparison needs a
//! value: an Observation or Vital Sign test against an unrecorded value
//! fails the person's run unless the operator is `is nil` / `is not nil`.

use crate::error::CoreError;
use crate::person::{Person, GENDER, RACE, SOCIOECONOMIC_CATEGORY};
use crate::record::{Code, EntryKind};
use crate::time::{self, Quantity, TimeUnit, Timestamp};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "is nil")]
    IsNil,
    #[serde(rename = "is not nil")]
    IsNotNil,
}

impl Operator {
    pub fn is_nil_check(self) -> bool {
        matches!(self, Operator::IsNil | Operator::IsNotNil)
    }

    pub fn compare_f64(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Operator::Ge => lhs >= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Ne => (lhs - rhs).abs() >= f64::EPSILON,
            Operator::IsNil => false,
            Operator::IsNotNil => true,
        }
    }

    fn compare_ord<T: PartialOrd>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Eq => lhs == rhs,
            Operator::Ge => lhs >= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Ne => lhs != rhs,
            Operator::IsNil => false,
            Operator::IsNotNil => true,
        }
    }

    /// Compares an optional left-hand value to a right-hand value.
    ///
    /// Nil checks only look at `lhs`. A missing `lhs` is `false` for every
    /// other operator; mismatched types are an error.
    pub fn compare(self, lhs: Option<&Value>, rhs: Option<&Value>) -> Result<bool, CoreError> {
        match self {
            Operator::IsNil => return Ok(lhs.map_or(true, Value::is_null)),
            Operator::IsNotNil => return Ok(lhs.map_or(false, |v| !v.is_null())),
            _ => {}
        }
        let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
            return Ok(false);
        };
        match (lhs, rhs) {
            (Value::Null, _) => Ok(false),
            (Value::Number(a), Value::Number(b)) => {
                match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => Ok(self.compare_f64(a, b)),
                    _ => Ok(false),
                }
            }
            (Value::Bool(a), Value::Bool(b)) => Ok(match self {
                Operator::Eq => a == b,
                // booleans have no order; every other operator means "differs"
                _ => a != b,
            }),
            (Value::String(a), Value::String(b)) => Ok(self.compare_ord(a, b)),
            (Value::Object(a), Value::Object(b)) => {
                // coded values compare by code
                match (a.get("code"), b.get("code")) {
                    (Some(Value::String(a)), Some(Value::String(b))) => Ok(self.compare_ord(a, b)),
                    _ => Err(CoreError::logic("cannot compare objects without codes")),
                }
            }
            (lhs, rhs) => Err(CoreError::logic(format!(
                "cannot compare {} to {}",
                type_name(lhs),
                type_name(rhs)
            ))),
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Absolute point in time for Date conditions.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DateSpec {
    pub year: i32,
    #[serde(default = "one")]
    pub month: u32,
    #[serde(default = "one")]
    pub day: u32,
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
    #[serde(default)]
    pub millisecond: u32,
}

fn one() -> u32 {
    1
}

impl DateSpec {
    pub fn timestamp(&self) -> Option<Timestamp> {
        Utc.with_ymd_and_hms(
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        )
        .single()
        .map(|dt| dt.timestamp_millis() + self.millisecond as i64)
    }
}

/// A code list or an attribute holding an entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryReference {
    #[serde(default)]
    pub codes: Option<Vec<Code>>,
    #[serde(default)]
    pub referenced_by_attribute: Option<String>,
}

impl EntryReference {
    fn is_active(&self, person: &Person, kind: EntryKind) -> bool {
        if let Some(codes) = &self.codes {
            return codes.iter().any(|c| person.is_active(kind, &c.code));
        }
        if let Some(attribute) = &self.referenced_by_attribute {
            return person
                .attribute(attribute)
                .and_then(|a| a.as_entry())
                .map_or(false, |entry| person.is_active(kind, &entry.code));
        }
        false
    }
}

/// PriorState test with a memoized window.
#[derive(Debug, Deserialize)]
pub struct PriorState {
    pub name: String,
    #[serde(default)]
    pub since: Option<String>,
    /// A visit counts only if it exited strictly after `now - within`.
    #[serde(default)]
    pub within: Option<Quantity>,
    #[serde(skip)]
    window: OnceLock<i64>,
}

impl PriorState {
    pub fn new(name: impl Into<String>, since: Option<String>, within: Option<Quantity>) -> Self {
        Self {
            name: name.into(),
            since,
            within,
            window: OnceLock::new(),
        }
    }

    /// Trailing window in milliseconds, converted on first use.
    pub fn window(&self) -> Option<i64> {
        let within = self.within.as_ref()?;
        Some(*self.window.get_or_init(|| within.millis()))
    }

    pub fn is_window_cached(&self) -> bool {
        self.window.get().is_some()
    }
}

/// A condition expression.
#[derive(Debug, Deserialize)]
#[serde(tag = "condition_type")]
pub enum Condition {
    /// All children are true.
    And { conditions: Vec<Condition> },
    /// Any child is true.
    Or { conditions: Vec<Condition> },
    /// The child is false.
    Not { condition: Box<Condition> },
    /// At least `minimum` children are true.
    #[serde(rename = "At Least", alias = "AtLeast")]
    AtLeast {
        minimum: usize,
        conditions: Vec<Condition>,
    },
    /// At most `maximum` children are true.
    #[serde(rename = "At Most", alias = "AtMost")]
    AtMost {
        maximum: usize,
        conditions: Vec<Condition>,
    },
    Gender { gender: String },
    Age {
        operator: Operator,
        quantity: f64,
        unit: TimeUnit,
    },
    /// Exactly one of `year`, `month` or `date` is set.
    Date {
        operator: Operator,
        #[serde(default)]
        year: Option<i32>,
        #[serde(default)]
        month: Option<u32>,
        #[serde(default)]
        date: Option<DateSpec>,
    },
    #[serde(rename = "Socioeconomic Status", alias = "SocioeconomicStatus")]
    SocioeconomicStatus { category: String },
    Race { race: String },
    Symptom {
        symptom: String,
        operator: Operator,
        value: f64,
    },
    Observation {
        operator: Operator,
        #[serde(flatten)]
        reference: EntryReference,
        #[serde(default)]
        value: Option<Value>,
    },
    Attribute {
        attribute: String,
        operator: Operator,
        #[serde(default)]
        value: Option<Value>,
    },
    #[serde(rename = "Vital Sign", alias = "VitalSign")]
    VitalSign {
        vital_sign: String,
        operator: Operator,
        value: f64,
    },
    PriorState(PriorState),
    #[serde(rename = "Active Condition", alias = "ActiveCondition")]
    ActiveCondition(EntryReference),
    #[serde(rename = "Active Allergy", alias = "ActiveAllergy")]
    ActiveAllergy(EntryReference),
    #[serde(rename = "Active Medication", alias = "ActiveMedication")]
    ActiveMedication(EntryReference),
    #[serde(rename = "Active CarePlan", alias = "ActiveCarePlan")]
    ActiveCarePlan(EntryReference),
    True,
    False,
}

impl Condition {
    /// Checks load-time constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Condition::And { conditions }
            | Condition::Or { conditions }
            | Condition::AtLeast { conditions, .. }
            | Condition::AtMost { conditions, .. } => {
                conditions.iter().try_for_each(Condition::validate)
            }
            Condition::Not { condition } => condition.validate(),
            Condition::Age { operator, unit, .. } => {
                if !matches!(unit, TimeUnit::Years | TimeUnit::Months) {
                    return Err(format!("unsupported unit '{}' in Age condition", unit));
                }
                if operator.is_nil_check() {
                    return Err("Age condition cannot use a nil check".to_string());
                }
                Ok(())
            }
            Condition::Date {
                year, month, date, ..
            } => {
                let set = [year.is_some(), month.is_some(), date.is_some()]
                    .iter()
                    .filter(|b| **b)
                    .count();
                if set != 1 {
                    return Err(
                        "Date condition needs exactly one of 'year', 'month' or 'date'".to_string(),
                    );
                }
                if let Some(date) = date {
                    if date.timestamp().is_none() {
                        return Err(format!("invalid date {:?}", date));
                    }
                }
                Ok(())
            }
            Condition::Observation { reference, .. } => {
                if reference.codes.is_none() && reference.referenced_by_attribute.is_none() {
                    return Err(
                        "Observation condition needs 'codes' or 'referenced_by_attribute'"
                            .to_string(),
                    );
                }
                Ok(())
            }
            Condition::ActiveCondition(r)
            | Condition::ActiveAllergy(r)
            | Condition::ActiveMedication(r)
            | Condition::ActiveCarePlan(r) => {
                if r.codes.is_none() && r.referenced_by_attribute.is_none() {
                    return Err(
                        "Active condition needs 'codes' or 'referenced_by_attribute'".to_string(),
                    );
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Evaluates the condition for `person` at `time`.
    ///
    /// `module` names the history slot PriorState consults.
    pub fn test(&self, person: &Person, module: &str, time: Timestamp) -> Result<bool, CoreError> {
        match self {
            Condition::And { conditions } => {
                for c in conditions {
                    if !c.test(person, module, time)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { conditions } => {
                for c in conditions {
                    if c.test(person, module, time)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!condition.test(person, module, time)?),
            Condition::AtLeast {
                minimum,
                conditions,
            } => Ok(count_true(conditions, person, module, time)? >= *minimum),
            Condition::AtMost {
                maximum,
                conditions,
            } => Ok(count_true(conditions, person, module, time)? <= *maximum),
            Condition::Gender { gender } => Ok(attribute_is(person, GENDER, gender)),
            Condition::Race { race } => Ok(attribute_is(person, RACE, race)),
            Condition::SocioeconomicStatus { category } => {
                Ok(attribute_is(person, SOCIOECONOMIC_CATEGORY, category))
            }
            Condition::Age {
                operator,
                quantity,
                unit,
            } => {
                let age = match unit {
                    TimeUnit::Years => person.age_in_years(time),
                    TimeUnit::Months => person.age_in_months(time),
                    other => {
                        return Err(CoreError::UnsupportedUnit {
                            unit: other.to_string(),
                            context: "Age condition".to_string(),
                        })
                    }
                };
                let age = age.ok_or_else(|| CoreError::logic("person has no birthdate"))?;
                Ok(operator.compare_f64(age, *quantity))
            }
            Condition::Date {
                operator,
                year,
                month,
                date,
            } => {
                if let Some(year) = year {
                    let current = time::year_of(time)
                        .ok_or_else(|| CoreError::logic(format!("time {} out of range", time)))?;
                    Ok(operator.compare_f64(current as f64, *year as f64))
                } else if let Some(month) = month {
                    let current = time::month_of(time)
                        .ok_or_else(|| CoreError::logic(format!("time {} out of range", time)))?;
                    Ok(operator.compare_f64(current as f64, *month as f64))
                } else if let Some(date) = date {
                    let target = date
                        .timestamp()
                        .ok_or_else(|| CoreError::logic(format!("invalid date {:?}", date)))?;
                    Ok(operator.compare_f64(time as f64, target as f64))
                } else {
                    Err(CoreError::logic("Date condition has no year, month or date"))
                }
            }
            Condition::Symptom {
                symptom,
                operator,
                value,
            } => Ok(operator.compare_f64(person.symptom(symptom) as f64, *value)),
            Condition::Observation {
                operator,
                reference,
                value,
            } => test_observation(person, *operator, reference, value.as_ref()),
            Condition::Attribute {
                attribute,
                operator,
                value,
            } => {
                let current = person.attribute(attribute).and_then(|a| a.to_json());
                match value {
                    // string targets are an equality test whatever the operator
                    Some(Value::String(expected)) if !operator.is_nil_check() => {
                        Ok(current.as_ref().and_then(Value::as_str) == Some(expected.as_str()))
                    }
                    _ => operator.compare(current.as_ref(), value.as_ref()),
                }
            }
            Condition::VitalSign {
                vital_sign,
                operator,
                value,
            } => match person.vital_sign(vital_sign) {
                Some(current) => Ok(operator.compare_f64(current, *value)),
                None if operator.is_nil_check() => Ok(*operator == Operator::IsNil),
                None => Err(CoreError::logic(format!(
                    "vital sign '{}' has no value",
                    vital_sign
                ))),
            },
            Condition::PriorState(prior) => {
                let since_time = prior.window().map(|w| time - w);
                Ok(person.had_prior_state(
                    module,
                    &prior.name,
                    prior.since.as_deref(),
                    since_time,
                ))
            }
            Condition::ActiveCondition(r) => Ok(r.is_active(person, EntryKind::Condition)),
            Condition::ActiveAllergy(r) => Ok(r.is_active(person, EntryKind::Allergy)),
            Condition::ActiveMedication(r) => Ok(r.is_active(person, EntryKind::Medication)),
            Condition::ActiveCarePlan(r) => Ok(r.is_active(person, EntryKind::CarePlan)),
            Condition::True => Ok(true),
            Condition::False => Ok(false),
        }
    }
}

/// Counts true children, evaluating every child so an error in any of them
/// always surfaces.
fn count_true(
    conditions: &[Condition],
    person: &Person,
    module: &str,
    time: Timestamp,
) -> Result<usize, CoreError> {
    let mut count = 0;
    for c in conditions {
        if c.test(person, module, time)? {
            count += 1;
        }
    }
    Ok(count)
}

fn attribute_is(person: &Person, key: &str, expected: &str) -> bool {
    person.attribute(key).and_then(|a| a.as_str()) == Some(expected)
}

fn test_observation(
    person: &Person,
    operator: Operator,
    reference: &EntryReference,
    value: Option<&Value>,
) -> Result<bool, CoreError> {
    let observed = if let Some(codes) = &reference.codes {
        codes
            .iter()
            .find_map(|c| person.latest_observation(&c.code))
            .and_then(|entry| entry.value.as_ref())
            .map(|v| v.to_json())
    } else if let Some(attribute) = &reference.referenced_by_attribute {
        match person.attribute(attribute) {
            Some(a) => a
                .as_entry()
                .and_then(|entry| entry.value.as_ref())
                .map(|v| v.to_json()),
            None if operator.is_nil_check() => None,
            None => return Ok(false),
        }
    } else {
        None
    };

    if observed.is_none() && !operator.is_nil_check() {
        let what = reference
            .codes
            .as_ref()
            .map(|codes| {
                codes
                    .iter()
                    .map(|c| c.code.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .or_else(|| reference.referenced_by_attribute.clone())
            .unwrap_or_default();
        return Err(CoreError::logic(format!(
            "no observation recorded for [{}]",
            what
        )));
    }
    operator.compare(observed.as_ref(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObservationValue;
    use crate::state::{ModuleHistory, StateInstance, StateKind, StateTemplate};
    use crate::time::{start_of_year, DAY, YEAR};
    use std::sync::Arc;
    use serde_json::json;

    fn parse(v: Value) -> Condition {
        let c: Condition = serde_json::from_value(v).unwrap();
        c.validate().unwrap();
        c
    }

    fn person_aged(years: i64, now: Timestamp) -> Person {
        let mut p = Person::new(1);
        p.birth(now - years * YEAR - DAY);
        p
    }

    #[test]
    fn test_true_false() {
        let p = Person::new(1);
        assert!(parse(json!({"condition_type": "True"})).test(&p, "m", 0).unwrap());
        assert!(!parse(json!({"condition_type": "False"})).test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_age_years() {
        let now = start_of_year(2020).unwrap();
        let c = parse(json!({
            "condition_type": "Age", "operator": ">=", "quantity": 18, "unit": "years"
        }));
        assert!(c.test(&person_aged(25, now), "m", now).unwrap());
        assert!(!c.test(&person_aged(10, now), "m", now).unwrap());
        assert!(c.test(&person_aged(18, now), "m", now).unwrap());
    }

    #[test]
    fn test_age_months_and_equals_alias() {
        let mut p = Person::new(1);
        p.birth(0);
        let c = parse(json!({
            "condition_type": "Age", "operator": "=", "quantity": 6, "unit": "months"
        }));
        assert!(c.test(&p, "m", YEAR / 2 + DAY).unwrap());
    }

    #[test]
    fn test_age_unsupported_unit_rejected_at_load() {
        let c: Condition = serde_json::from_value(json!({
            "condition_type": "Age", "operator": ">", "quantity": 3, "unit": "days"
        }))
        .unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_age_without_birthdate_is_error() {
        let c = parse(json!({
            "condition_type": "Age", "operator": ">", "quantity": 3, "unit": "years"
        }));
        let result = c.test(&Person::new(1), "m", 0);
        assert!(matches!(result, Err(CoreError::LogicEvaluation { .. })));
    }

    #[test]
    fn test_date_requires_exactly_one() {
        let c: Condition = serde_json::from_value(json!({
            "condition_type": "Date", "operator": ">", "year": 2000, "month": 3
        }))
        .unwrap();
        assert!(c.validate().is_err());

        let c: Condition = serde_json::from_value(json!({
            "condition_type": "Date", "operator": ">"
        }))
        .unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_date_forms() {
        let p = Person::new(1);
        let t = start_of_year(2010).unwrap() + 40 * DAY;
        let year = parse(json!({"condition_type": "Date", "operator": "==", "year": 2010}));
        assert!(year.test(&p, "m", t).unwrap());
        let month = parse(json!({"condition_type": "Date", "operator": "==", "month": 2}));
        assert!(month.test(&p, "m", t).unwrap());
        let date = parse(json!({
            "condition_type": "Date", "operator": "<",
            "date": {"year": 2010, "month": 3, "day": 1}
        }));
        assert!(date.test(&p, "m", t).unwrap());
    }

    #[test]
    fn test_demographic_leaves() {
        let mut p = Person::new(1);
        p.set_attribute(GENDER, "F");
        p.set_attribute(RACE, "asian");
        let c = parse(json!({"condition_type": "Gender", "gender": "F"}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Race", "race": "white"}));
        assert!(!c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Socioeconomic Status", "category": "High"}));
        assert!(!c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_attribute_comparisons() {
        let mut p = Person::new(1);
        p.set_attribute("count", 3i64);
        p.set_attribute("smoker", true);
        p.set_attribute("state", "MA");

        let c = parse(json!({"condition_type": "Attribute", "attribute": "count", "operator": ">", "value": 2}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Attribute", "attribute": "smoker", "operator": "==", "value": true}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Attribute", "attribute": "state", "operator": "==", "value": "MA"}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Attribute", "attribute": "missing", "operator": "is nil"}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Attribute", "attribute": "count", "operator": "is not nil"}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Attribute", "attribute": "missing", "operator": ">", "value": 1}));
        assert!(!c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_attribute_type_mismatch_is_error() {
        let mut p = Person::new(1);
        p.set_attribute("count", 3i64);
        let c = parse(json!({"condition_type": "Attribute", "attribute": "count", "operator": "==", "value": true}));
        assert!(c.test(&p, "m", 0).is_err());
        // string targets only test equality
        let c = parse(json!({"condition_type": "Attribute", "attribute": "count", "operator": "!=", "value": "three"}));
        assert!(!c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_observation_missing_is_fatal() {
        let p = Person::new(1);
        let codes = json!([{"system": "LOINC", "code": "8302-2"}]);
        let c = parse(json!({"condition_type": "Observation", "codes": codes, "operator": ">", "value": 100}));
        assert!(matches!(c.test(&p, "m", 0), Err(CoreError::LogicEvaluation { .. })));

        let c = parse(json!({"condition_type": "Observation", "codes": codes, "operator": "is nil"}));
        assert!(c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_observation_latest_value() {
        let mut p = Person::new(1);
        p.record_observation(0, "8302-2", Some(ObservationValue::Number(90.0)));
        p.record_observation(DAY, "8302-2", Some(ObservationValue::Number(120.0)));
        let c = parse(json!({
            "condition_type": "Observation",
            "codes": [{"system": "LOINC", "code": "8302-2"}],
            "operator": ">", "value": 100
        }));
        assert!(c.test(&p, "m", DAY).unwrap());
    }

    #[test]
    fn test_symptom_and_vital_sign() {
        let mut p = Person::new(1);
        p.set_symptom("asthma", "cough", 0, 40, false);
        let c = parse(json!({"condition_type": "Symptom", "symptom": "cough", "operator": ">=", "value": 40}));
        assert!(c.test(&p, "m", 0).unwrap());

        let c = parse(json!({"condition_type": "Vital Sign", "vital_sign": "BMI", "operator": ">", "value": 30}));
        assert!(c.test(&p, "m", 0).is_err());
        p.set_vital_sign("BMI", 31.0);
        assert!(c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_active_condition_by_code_and_attribute() {
        let mut p = Person::new(1);
        let at = p.record.start(0, EntryKind::Condition, "195967001");
        let entry = p.record.entry(at).unwrap().clone();
        p.set_attribute(
            "asthma",
            crate::person::AttributeValue::Entry(Box::new(entry)),
        );

        let c = parse(json!({
            "condition_type": "Active Condition",
            "codes": [{"system": "SNOMED-CT", "code": "195967001"}]
        }));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Active Condition", "referenced_by_attribute": "asthma"}));
        assert!(c.test(&p, "m", 0).unwrap());

        p.record.end(1, EntryKind::Condition, "195967001", None);
        assert!(!c.test(&p, "m", 1).unwrap());
    }

    #[test]
    fn test_active_without_reference_rejected() {
        let c: Condition =
            serde_json::from_value(json!({"condition_type": "Active Medication"})).unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_combinators() {
        let p = Person::new(1);
        let t = json!({"condition_type": "True"});
        let f = json!({"condition_type": "False"});

        let c = parse(json!({"condition_type": "And", "conditions": [t, f]}));
        assert!(!c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Or", "conditions": [f, t]}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "Not", "condition": f}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "At Least", "minimum": 2, "conditions": [t, f, t]}));
        assert!(c.test(&p, "m", 0).unwrap());
        let c = parse(json!({"condition_type": "AtMost", "maximum": 1, "conditions": [t, f, t]}));
        assert!(!c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_at_least_evaluates_every_child() {
        // the threshold is met by the first child, but the failing second
        // child still surfaces its error
        let p = Person::new(1);
        let c = parse(json!({
            "condition_type": "At Least",
            "minimum": 1,
            "conditions": [
                {"condition_type": "True"},
                {"condition_type": "Vital Sign", "vital_sign": "BMI", "operator": ">", "value": 1}
            ]
        }));
        assert!(c.test(&p, "m", 0).is_err());
    }

    #[test]
    fn test_or_short_circuits_before_error() {
        let p = Person::new(1);
        let c = parse(json!({
            "condition_type": "Or",
            "conditions": [
                {"condition_type": "True"},
                {"condition_type": "Vital Sign", "vital_sign": "BMI", "operator": ">", "value": 1}
            ]
        }));
        assert!(c.test(&p, "m", 0).unwrap());
    }

    #[test]
    fn test_prior_state_window_cached() {
        let prior = PriorState::new(
            "Diagnosis",
            None,
            Some(Quantity {
                quantity: 2.0,
                unit: TimeUnit::Weeks,
            }),
        );
        assert!(!prior.is_window_cached());
        assert_eq!(prior.window(), Some(14 * DAY));
        assert!(prior.is_window_cached());
        for _ in 0..3 {
            assert_eq!(prior.window(), Some(14 * DAY));
        }
        assert_eq!(PriorState::new("x", None, None).window(), None);
    }

    /// A person whose module "m" history holds `visits`, oldest first.
    fn with_history(visits: &[(&str, Timestamp, Option<Timestamp>)]) -> Person {
        let mut p = Person::new(1);
        let mut history: Option<ModuleHistory> = None;
        for (name, entered, exited) in visits {
            let template = Arc::new(StateTemplate::new(*name, StateKind::Simple, None));
            let mut instance = StateInstance::new(template.clone());
            instance.entered = Some(*entered);
            instance.exited = *exited;
            match &mut history {
                Some(h) => h.push_front(instance),
                None => {
                    let mut h = ModuleHistory::new(template);
                    *h.current_mut() = instance;
                    history = Some(h);
                }
            }
        }
        if let Some(h) = history {
            p.history_or_insert_with("m", || h);
        }
        p
    }

    fn within_two_weeks() -> Condition {
        parse(json!({
            "condition_type": "PriorState",
            "name": "Diagnosis",
            "within": {"quantity": 2, "unit": "weeks"}
        }))
    }

    #[test]
    fn test_prior_state_within_window() {
        let now = 100 * DAY;
        let c = within_two_weeks();

        let inside = with_history(&[("Diagnosis", 85 * DAY, Some(90 * DAY)), ("Wait", 90 * DAY, None)]);
        assert!(c.test(&inside, "m", now).unwrap());

        let before = with_history(&[("Diagnosis", 70 * DAY, Some(80 * DAY)), ("Wait", 80 * DAY, None)]);
        assert!(!c.test(&before, "m", now).unwrap());

        let active = with_history(&[("Wait", 0, Some(10 * DAY)), ("Diagnosis", 10 * DAY, None)]);
        assert!(c.test(&active, "m", now).unwrap());

        // other modules' histories are not consulted
        assert!(!c.test(&inside, "other", now).unwrap());
    }

    #[test]
    fn test_prior_state_window_start_is_exclusive() {
        let now = 100 * DAY;
        let c = within_two_weeks();

        let on_edge = with_history(&[("Diagnosis", 80 * DAY, Some(86 * DAY)), ("Wait", 86 * DAY, None)]);
        assert!(!c.test(&on_edge, "m", now).unwrap());

        let just_inside =
            with_history(&[("Diagnosis", 80 * DAY, Some(86 * DAY + 1)), ("Wait", 86 * DAY + 1, None)]);
        assert!(c.test(&just_inside, "m", now).unwrap());
    }

    #[test]
    fn test_prior_state_since() {
        let c = parse(json!({
            "condition_type": "PriorState",
            "name": "Diagnosis",
            "since": "Treatment"
        }));

        let treated_after = with_history(&[
            ("Diagnosis", 0, Some(DAY)),
            ("Treatment", DAY, Some(2 * DAY)),
            ("Wait", 2 * DAY, None),
        ]);
        assert!(!c.test(&treated_after, "m", 3 * DAY).unwrap());

        let diagnosed_again = with_history(&[
            ("Diagnosis", 0, Some(DAY)),
            ("Treatment", DAY, Some(2 * DAY)),
            ("Diagnosis", 2 * DAY, Some(3 * DAY)),
            ("Wait", 3 * DAY, None),
        ]);
        assert!(c.test(&diagnosed_again, "m", 4 * DAY).unwrap());

        let never_treated = with_history(&[("Diagnosis", 0, Some(DAY)), ("Wait", DAY, None)]);
        assert!(c.test(&never_treated, "m", 2 * DAY).unwrap());
    }

    #[test]
    fn test_prior_state_cached_window_shared_across_people() {
        let c = within_two_weeks();
        let early = with_history(&[("Diagnosis", 85 * DAY, Some(90 * DAY)), ("Wait", 90 * DAY, None)]);
        let late = with_history(&[("Diagnosis", 185 * DAY, Some(190 * DAY)), ("Wait", 190 * DAY, None)]);

        assert!(c.test(&early, "m", 100 * DAY).unwrap());
        assert!(c.test(&late, "m", 200 * DAY).unwrap());
        assert!(!c.test(&early, "m", 200 * DAY).unwrap());

        match &c {
            Condition::PriorState(prior) => {
                assert!(prior.is_window_cached());
                assert_eq!(prior.window(), Some(14 * DAY));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_condition_type_rejected() {
        let result = serde_json::from_value::<Condition>(json!({"condition_type": "Moon Phase"}));
        assert!(result.is_err());
    }
}
