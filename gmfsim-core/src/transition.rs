//! Transition resolution.
//!
//! A state leaves through exactly one of four transition forms:
//!
//! ```json
//! {"direct_transition": "Next"}
//! {"distributed_transition": [{"distribution": 0.3, "transition": "A"}, {"distribution": 0.7, "transition": "B"}]}
//! {"conditional_transition": [{"condition": {...}, "transition": "A"}, {"transition": "B"}]}
//! {"complex_transition": [{"condition": {...}, "distributions": [...]}, {"transition": "C"}]}
//! ```
//!
//! Every form falls back to its last option when nothing else is chosen.

use crate::error::CoreError;
use crate::logic::Condition;
use crate::person::Person;
use crate::time::Timestamp;
use serde::Deserialize;

/// Probability of a distributed option.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Weight {
    Fixed(f64),
    /// Read from a numeric person attribute, or `default` if unset.
    Named { attribute: String, default: f64 },
}

impl Weight {
    pub fn resolve(&self, person: &Person) -> f64 {
        match self {
            Weight::Fixed(p) => *p,
            Weight::Named { attribute, default } => person
                .attribute(attribute)
                .and_then(|a| a.as_f64())
                .unwrap_or(*default),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributedOption {
    pub distribution: Weight,
    pub transition: String,
}

#[derive(Debug, Deserialize)]
pub struct ConditionalOption {
    #[serde(default)]
    pub condition: Option<Condition>,
    pub transition: String,
}

/// Destination of a complex option.
#[derive(Debug)]
pub enum Outcome {
    State(String),
    Distributed(Vec<DistributedOption>),
}

#[derive(Debug, Deserialize)]
#[serde(try_from = "RawComplexOption")]
pub struct ComplexOption {
    pub condition: Option<Condition>,
    pub outcome: Outcome,
}

#[derive(Deserialize)]
struct RawComplexOption {
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    transition: Option<String>,
    #[serde(default)]
    distributions: Option<Vec<DistributedOption>>,
}

impl TryFrom<RawComplexOption> for ComplexOption {
    type Error = String;

    fn try_from(raw: RawComplexOption) -> Result<Self, Self::Error> {
        let outcome = match (raw.transition, raw.distributions) {
            (Some(name), None) => Outcome::State(name),
            (None, Some(options)) if !options.is_empty() => Outcome::Distributed(options),
            (None, Some(_)) => return Err("complex option has empty 'distributions'".to_string()),
            _ => {
                return Err(
                    "complex option needs exactly one of 'transition' or 'distributions'"
                        .to_string(),
                )
            }
        };
        Ok(Self {
            condition: raw.condition,
            outcome,
        })
    }
}

/// How a state picks its successor.
#[derive(Debug)]
pub enum TransitionRule {
    Direct(String),
    Distributed(Vec<DistributedOption>),
    Conditional(Vec<ConditionalOption>),
    Complex(Vec<ComplexOption>),
}

impl TransitionRule {
    /// Builds a rule from the transition fields of a state. At most one may
    /// be set and option lists must not be empty.
    pub fn from_parts(
        direct: Option<String>,
        distributed: Option<Vec<DistributedOption>>,
        conditional: Option<Vec<ConditionalOption>>,
        complex: Option<Vec<ComplexOption>>,
    ) -> Result<Option<Self>, String> {
        let set = [
            direct.is_some(),
            distributed.is_some(),
            conditional.is_some(),
            complex.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set > 1 {
            return Err("only one transition may be defined".to_string());
        }

        let rule = if let Some(name) = direct {
            TransitionRule::Direct(name)
        } else if let Some(options) = distributed {
            TransitionRule::Distributed(options)
        } else if let Some(options) = conditional {
            TransitionRule::Conditional(options)
        } else if let Some(options) = complex {
            TransitionRule::Complex(options)
        } else {
            return Ok(None);
        };
        if rule.targets().is_empty() {
            return Err("transition has no options".to_string());
        }
        Ok(Some(rule))
    }

    /// Every state name this rule can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            TransitionRule::Direct(name) => vec![name.as_str()],
            TransitionRule::Distributed(options) => {
                options.iter().map(|o| o.transition.as_str()).collect()
            }
            TransitionRule::Conditional(options) => {
                options.iter().map(|o| o.transition.as_str()).collect()
            }
            TransitionRule::Complex(options) => options
                .iter()
                .flat_map(|o| match &o.outcome {
                    Outcome::State(name) => vec![name.as_str()],
                    Outcome::Distributed(d) => d.iter().map(|o| o.transition.as_str()).collect(),
                })
                .collect(),
        }
    }

    /// Every condition attached to this rule.
    pub fn conditions(&self) -> Vec<&Condition> {
        match self {
            TransitionRule::Conditional(options) => {
                options.iter().filter_map(|o| o.condition.as_ref()).collect()
            }
            TransitionRule::Complex(options) => {
                options.iter().filter_map(|o| o.condition.as_ref()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Picks the next state for `person` at `time`.
    pub fn resolve<'a>(
        &'a self,
        person: &mut Person,
        module: &str,
        time: Timestamp,
    ) -> Result<&'a str, CoreError> {
        match self {
            TransitionRule::Direct(name) => Ok(name),
            TransitionRule::Distributed(options) => pick_distributed(options, person),
            TransitionRule::Conditional(options) => {
                for option in options {
                    let passes = match &option.condition {
                        Some(condition) => condition.test(person, module, time)?,
                        None => true,
                    };
                    if passes {
                        return Ok(&option.transition);
                    }
                }
                options
                    .last()
                    .map(|o| o.transition.as_str())
                    .ok_or_else(|| CoreError::logic("conditional transition has no options"))
            }
            TransitionRule::Complex(options) => {
                let mut chosen = None;
                for option in options {
                    let passes = match &option.condition {
                        Some(condition) => condition.test(person, module, time)?,
                        None => true,
                    };
                    if passes {
                        chosen = Some(option);
                        break;
                    }
                }
                let option = chosen
                    .or_else(|| options.last())
                    .ok_or_else(|| CoreError::logic("complex transition has no options"))?;
                match &option.outcome {
                    Outcome::State(name) => Ok(name),
                    Outcome::Distributed(d) => pick_distributed(d, person),
                }
            }
        }
    }
}

/// One uniform draw against the cumulative weights, falling back to the
/// last option.
fn pick_distributed<'a>(
    options: &'a [DistributedOption],
    person: &mut Person,
) -> Result<&'a str, CoreError> {
    let p = person.rand();
    let mut cumulative = 0.0;
    for option in options {
        cumulative += option.distribution.resolve(person);
        if cumulative > p {
            return Ok(&option.transition);
        }
    }
    options
        .last()
        .map(|o| o.transition.as_str())
        .ok_or_else(|| CoreError::logic("distributed transition has no options"))
}
