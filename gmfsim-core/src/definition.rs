//! Module definition types.
//!
//! Modules use the GMF JSON DSL:
//!
//! ```json
//! {
//!   "name": "Example",
//!   "remarks": ["Adults and minors take different paths."],
//!   "states": {
//!     "Initial": {
//!       "type": "Initial",
//!       "conditional_transition": [
//!         {"condition": {"condition_type": "Age", "operator": ">=", "quantity": 18, "unit": "years"}, "transition": "Adult"},
//!         {"transition": "Minor"}
//!       ]
//!     },
//!     "Adult": {"type": "Simple", "direct_transition": "Terminal"},
//!     "Minor": {"type": "Simple", "direct_transition": "Terminal"},
//!     "Terminal": {"type": "Terminal"}
//!   }
//! }
//! ```

use crate::error::CoreError;
use crate::state::{StateKind, StateTemplate, INITIAL};
use crate::transition::{ComplexOption, ConditionalOption, DistributedOption, TransitionRule};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

fn deserialize_remarks<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct RemarksVisitor;

    impl<'de> Visitor<'de> for RemarksVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut remarks = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                remarks.push(s);
            }
            Ok(remarks)
        }
    }

    deserializer.deserialize_any(RemarksVisitor)
}

/// A state as written in a module file.
#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(flatten)]
    kind: StateKind,

    #[serde(default)]
    direct_transition: Option<String>,

    #[serde(default)]
    distributed_transition: Option<Vec<DistributedOption>>,

    #[serde(default)]
    conditional_transition: Option<Vec<ConditionalOption>>,

    #[serde(default)]
    complex_transition: Option<Vec<ComplexOption>>,

    #[serde(default, deserialize_with = "deserialize_remarks")]
    remarks: Vec<String>,
}

/// A module as written in a module file.
#[derive(Debug, Deserialize)]
struct RawModule {
    name: String,

    #[serde(default, deserialize_with = "deserialize_remarks")]
    remarks: Vec<String>,

    #[serde(default)]
    gmf_version: Option<u32>,

    states: BTreeMap<String, serde_json::Value>,
}

/// Parsed and validated module definition.
#[derive(Debug)]
pub struct ModuleDefinition {
    /// Catalog key: the path below the module root without extension.
    pub key: String,

    /// Display name from the file.
    pub name: String,

    pub remarks: Vec<String>,

    pub gmf_version: Option<u32>,

    /// Submodules live in subdirectories and are only run through
    /// CallSubmodule.
    pub submodule: bool,

    states: BTreeMap<String, Arc<StateTemplate>>,

    /// CRC32C of the source bytes.
    pub checksum: String,
}

impl ModuleDefinition {
    /// Parses and validates a module from JSON bytes.
    pub fn from_slice(key: impl Into<String>, bytes: &[u8]) -> Result<Self, CoreError> {
        let key = key.into();
        let raw: RawModule =
            serde_json::from_slice(bytes).map_err(|e| CoreError::invalid(&key, e.to_string()))?;
        let checksum = format!("{:08x}", crc32c::crc32c(bytes));
        Self::from_raw(key, raw, checksum)
    }

    /// Parses and validates a module from a JSON value.
    pub fn from_json(key: impl Into<String>, json: &serde_json::Value) -> Result<Self, CoreError> {
        let bytes = serde_json::to_vec(json)?;
        Self::from_slice(key, &bytes)
    }

    fn from_raw(key: String, raw: RawModule, checksum: String) -> Result<Self, CoreError> {
        let mut states = BTreeMap::new();
        for (name, value) in raw.states {
            let state: RawState = serde_json::from_value(value)
                .map_err(|e| CoreError::invalid(&key, format!("state '{}': {}", name, e)))?;

            state
                .kind
                .validate()
                .map_err(|reason| CoreError::invalid(&key, format!("state '{}': {}", name, reason)))?;

            let transition = TransitionRule::from_parts(
                state.direct_transition,
                state.distributed_transition,
                state.conditional_transition,
                state.complex_transition,
            )
            .map_err(|reason| CoreError::invalid(&key, format!("state '{}': {}", name, reason)))?;

            if let Some(rule) = &transition {
                for condition in rule.conditions() {
                    condition.validate().map_err(|reason| {
                        CoreError::invalid(&key, format!("state '{}': {}", name, reason))
                    })?;
                }
            } else if !state.kind.is_terminal() {
                return Err(CoreError::invalid(
                    &key,
                    format!("state '{}' has no transition", name),
                ));
            }

            let template = StateTemplate {
                name: name.clone(),
                kind: state.kind,
                transition,
                remarks: state.remarks,
            };
            states.insert(name, Arc::new(template));
        }

        match states.get(INITIAL) {
            Some(initial) if matches!(initial.kind, StateKind::Initial) => {}
            Some(_) => {
                return Err(CoreError::invalid(
                    &key,
                    "state 'Initial' must have type Initial",
                ))
            }
            None => return Err(CoreError::invalid(&key, "missing 'Initial' state")),
        }

        for template in states.values() {
            if let Some(rule) = &template.transition {
                for target in rule.targets() {
                    if !states.contains_key(target) {
                        return Err(CoreError::invalid(
                            &key,
                            format!(
                                "state '{}' transitions to unknown state '{}'",
                                template.name, target
                            ),
                        ));
                    }
                }
            }
        }

        let submodule = key.contains('/');
        Ok(Self {
            key,
            name: raw.name,
            remarks: raw.remarks,
            gmf_version: raw.gmf_version,
            submodule,
            states,
            checksum,
        })
    }

    pub fn state(&self, name: &str) -> Option<&Arc<StateTemplate>> {
        self.states.get(name)
    }

    /// Looks up a transition target, which load-time validation guarantees
    /// to exist.
    pub fn require_state(&self, name: &str) -> Result<&Arc<StateTemplate>, CoreError> {
        self.states.get(name).ok_or_else(|| CoreError::StateNotFound {
            module: self.key.clone(),
            state: name.to_string(),
        })
    }

    pub fn initial(&self) -> Result<&Arc<StateTemplate>, CoreError> {
        self.require_state(INITIAL)
    }

    pub fn states(&self) -> impl Iterator<Item = &Arc<StateTemplate>> {
        self.states.values()
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Submodule keys referenced by CallSubmodule states.
    pub fn submodule_references(&self) -> BTreeSet<&str> {
        self.states
            .values()
            .filter_map(|t| match &t.kind {
                StateKind::CallSubmodule(call) => Some(call.submodule.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Returns non-fatal problems: unreachable states, dangling state-name
    /// references and a missing Terminal state.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::from([INITIAL]);
        while let Some(name) = queue.pop_front() {
            if !reachable.insert(name) {
                continue;
            }
            if let Some(rule) = self.states.get(name).and_then(|t| t.transition.as_ref()) {
                queue.extend(rule.targets());
            }
        }
        for name in self.states.keys() {
            if !reachable.contains(name.as_str()) {
                warnings.push(format!("{}: state '{}' is unreachable", self.name, name));
            }
        }

        for template in self.states.values() {
            for reference in template.kind.state_references() {
                if !self.states.contains_key(reference) {
                    warnings.push(format!(
                        "{}: state '{}' refers to unknown state '{}'",
                        self.name, template.name, reference
                    ));
                }
            }
            if template.kind.is_terminal() && template.transition.is_some() {
                warnings.push(format!(
                    "{}: Terminal state '{}' has a transition that is never taken",
                    self.name, template.name
                ));
            }
        }

        if !self.states.values().any(|t| t.kind.is_terminal()) {
            warnings.push(format!("{}: module has no Terminal state", self.name));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn age_module() -> serde_json::Value {
        json!({
            "name": "Age Split",
            "remarks": "adults and minors",
            "states": {
                "Initial": {
                    "type": "Initial",
                    "conditional_transition": [
                        {
                            "condition": {"condition_type": "Age", "operator": ">=", "quantity": 18, "unit": "years"},
                            "transition": "Adult"
                        },
                        {"transition": "Minor"}
                    ]
                },
                "Adult": {"type": "Simple", "direct_transition": "Terminal"},
                "Minor": {"type": "Simple", "direct_transition": "Terminal"},
                "Terminal": {"type": "Terminal"}
            }
        })
    }

    #[test]
    fn test_parse_module() {
        let def = ModuleDefinition::from_json("age_split", &age_module()).unwrap();
        assert_eq!(def.name, "Age Split");
        assert_eq!(def.key, "age_split");
        assert_eq!(def.remarks, vec!["adults and minors"]);
        assert_eq!(def.len(), 4);
        assert!(!def.submodule);
        assert!(def.validate().is_empty());
        assert_eq!(def.initial().unwrap().name, "Initial");
        assert_eq!(def.checksum.len(), 8);
    }

    #[test]
    fn test_submodule_by_key() {
        let def = ModuleDefinition::from_json("medications/age_split", &age_module()).unwrap();
        assert!(def.submodule);
    }

    #[test]
    fn test_checksum_follows_bytes() {
        let a = ModuleDefinition::from_json("a", &age_module()).unwrap();
        let b = ModuleDefinition::from_json("b", &age_module()).unwrap();
        assert_eq!(a.checksum, b.checksum);

        let mut changed = age_module();
        changed["name"] = json!("Renamed");
        let c = ModuleDefinition::from_json("a", &changed).unwrap();
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn test_missing_initial() {
        let json = json!({
            "name": "Broken",
            "states": {"Terminal": {"type": "Terminal"}}
        });
        let result = ModuleDefinition::from_json("broken", &json);
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_dangling_transition_target() {
        let json = json!({
            "name": "Broken",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Nowhere"},
                "Terminal": {"type": "Terminal"}
            }
        });
        let err = ModuleDefinition::from_json("broken", &json).unwrap_err();
        assert!(err.to_string().contains("Nowhere"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_transition() {
        let json = json!({
            "name": "Broken",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Stuck"},
                "Stuck": {"type": "Simple"},
                "Terminal": {"type": "Terminal"}
            }
        });
        let err = ModuleDefinition::from_json("broken", &json).unwrap_err();
        assert!(err.to_string().contains("Stuck"));
    }

    #[test]
    fn test_unknown_state_type() {
        let json = json!({
            "name": "Broken",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Odd"},
                "Odd": {"type": "Teleport", "direct_transition": "Terminal"},
                "Terminal": {"type": "Terminal"}
            }
        });
        let err = ModuleDefinition::from_json("broken", &json).unwrap_err();
        assert!(err.to_string().contains("Odd"));
    }

    #[test]
    fn test_bad_age_unit_fails_at_load() {
        let json = json!({
            "name": "Broken",
            "states": {
                "Initial": {
                    "type": "Initial",
                    "conditional_transition": [
                        {"condition": {"condition_type": "Age", "operator": ">", "quantity": 3, "unit": "days"}, "transition": "Terminal"},
                        {"transition": "Terminal"}
                    ]
                },
                "Terminal": {"type": "Terminal"}
            }
        });
        assert!(ModuleDefinition::from_json("broken", &json).is_err());
    }

    #[test]
    fn test_guard_condition_validated() {
        let json = json!({
            "name": "Broken",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Wait"},
                "Wait": {
                    "type": "Guard",
                    "allow": {"condition_type": "Date", "operator": ">"},
                    "direct_transition": "Terminal"
                },
                "Terminal": {"type": "Terminal"}
            }
        });
        assert!(ModuleDefinition::from_json("broken", &json).is_err());
    }

    #[test]
    fn test_two_transitions_rejected() {
        let json = json!({
            "name": "Broken",
            "states": {
                "Initial": {
                    "type": "Initial",
                    "direct_transition": "Terminal",
                    "distributed_transition": [{"distribution": 1.0, "transition": "Terminal"}]
                },
                "Terminal": {"type": "Terminal"}
            }
        });
        assert!(ModuleDefinition::from_json("broken", &json).is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let json = json!({
            "name": "Loose",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Loop"},
                "Loop": {"type": "Simple", "direct_transition": "Loop"},
                "Orphan": {
                    "type": "ConditionEnd",
                    "condition_onset": "Missing",
                    "direct_transition": "Loop"
                }
            }
        });
        let def = ModuleDefinition::from_json("loose", &json).unwrap();
        let warnings = def.validate();
        assert!(warnings.iter().any(|w| w.contains("'Orphan' is unreachable")));
        assert!(warnings.iter().any(|w| w.contains("unknown state 'Missing'")));
        assert!(warnings.iter().any(|w| w.contains("no Terminal")));
    }

    #[test]
    fn test_submodule_references() {
        let json = json!({
            "name": "Caller",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Call"},
                "Call": {"type": "CallSubmodule", "submodule": "meds/otc", "direct_transition": "Terminal"},
                "Terminal": {"type": "Terminal"}
            }
        });
        let def = ModuleDefinition::from_json("caller", &json).unwrap();
        assert_eq!(
            def.submodule_references().into_iter().collect::<Vec<_>>(),
            vec!["meds/otc"]
        );
    }

    #[test]
    fn test_state_remarks_string_or_array() {
        let json = json!({
            "name": "Remarks",
            "remarks": ["one", "two"],
            "states": {
                "Initial": {"type": "Initial", "remarks": "start here", "direct_transition": "Terminal"},
                "Terminal": {"type": "Terminal", "remarks": ["end", "done"]}
            }
        });
        let def = ModuleDefinition::from_json("remarks", &json).unwrap();
        assert_eq!(def.remarks.len(), 2);
        assert_eq!(def.state("Initial").unwrap().remarks, vec!["start here"]);
        assert_eq!(def.state("Terminal").unwrap().remarks.len(), 2);
    }
}
