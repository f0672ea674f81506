//! One person's lifetime.

use crate::config::{Config, KeepPolicy};
use crate::error::RunnerError;
use crate::lifecycle::{self, BirthSampler};
use gmfsim_core::time::Timestamp;
use gmfsim_core::{CoreError, Interpreter, ModuleCatalog, ModuleDefinition, Person};
use std::sync::Arc;
use tracing::{debug, warn};

/// An accepted person and how it was produced.
#[derive(Debug)]
pub struct PersonOutcome {
    /// Position in the population.
    pub index: usize,
    /// Seed of the accepted attempt.
    pub seed: u64,
    pub attempts: u32,
    pub alive: bool,
    pub person: Person,
}

/// Runs people from birth to the stop time.
pub struct Simulation {
    catalog: Arc<ModuleCatalog>,
    modules: Vec<Arc<ModuleDefinition>>,
    births: BirthSampler,
    stop: Timestamp,
    timestep: Timestamp,
    keep: KeepPolicy,
    max_attempts: u32,
    dual_records: bool,
}

impl Simulation {
    pub fn new(
        catalog: Arc<ModuleCatalog>,
        modules: Vec<Arc<ModuleDefinition>>,
        births: BirthSampler,
        stop: Timestamp,
        timestep: Timestamp,
    ) -> Self {
        Self {
            catalog,
            modules,
            births,
            stop,
            timestep,
            keep: KeepPolicy::Any,
            max_attempts: 1,
            dual_records: false,
        }
    }

    /// Builds a simulation from validated configuration.
    pub fn from_config(
        config: &Config,
        catalog: Arc<ModuleCatalog>,
        modules: Vec<Arc<ModuleDefinition>>,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        let invalid = || {
            crate::config::ConfigError::ValidationError("simulation time out of range".to_string())
        };
        let start = config.simulation.start_time().ok_or_else(invalid)?;
        let stop = config.simulation.stop_time().ok_or_else(invalid)?;

        Ok(Self::new(
            catalog,
            modules,
            BirthSampler::new(start, stop),
            stop,
            config.simulation.timestep(),
        )
        .with_retries(config.population.keep, config.population.max_attempts)
        .with_dual_records(config.simulation.dual_records))
    }

    /// Sets the life status filter and attempt cap.
    pub fn with_retries(mut self, keep: KeepPolicy, max_attempts: u32) -> Self {
        self.keep = keep;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Gives every person separate covered and uncovered records.
    pub fn with_dual_records(mut self, enabled: bool) -> Self {
        self.dual_records = enabled;
        self
    }

    pub fn stop(&self) -> Timestamp {
        self.stop
    }

    /// Simulates one lifetime from `seed`.
    pub fn simulate(&self, seed: u64) -> Result<Person, CoreError> {
        let mut person = Person::new(seed);
        if self.dual_records {
            person.enable_dual_records();
        }
        let birth = self.births.sample(&mut person);
        let interpreter = Interpreter::new(&self.catalog);

        let mut active: Vec<&Arc<ModuleDefinition>> = self.modules.iter().collect();
        let mut time = birth;
        while time <= self.stop && person.alive(time) {
            lifecycle::coverage_pass(&mut person, time);
            lifecycle::encounter_detection(&mut person, time);

            let mut running = Vec::with_capacity(active.len());
            for module in active {
                if !interpreter.process(module, &mut person, time)? {
                    running.push(module);
                }
            }
            active = running;

            lifecycle::encounter_close_out(&mut person, time);
            time += self.timestep;
        }

        lifecycle::death_pass(&mut person, self.stop);
        Ok(person)
    }

    /// Simulates person `index`, reseeding until the outcome passes the
    /// keep filter.
    pub fn run_person(&self, index: usize, seed: u64) -> Result<PersonOutcome, RunnerError> {
        let mut seed = seed;
        for attempt in 1..=self.max_attempts {
            let mut person = self.simulate(seed)?;
            let alive = person.alive(self.stop);
            if self.keep.accepts(alive) {
                return Ok(PersonOutcome {
                    index,
                    seed,
                    attempts: attempt,
                    alive,
                    person,
                });
            }
            let next = person.rand_u64();
            debug!(
                "Person {} attempt {} rejected (alive={}), reseeding {} -> {}",
                index, attempt, alive, seed, next
            );
            seed = next;
        }

        warn!(
            "Person {} exhausted {} attempts without a {:?} outcome",
            index, self.max_attempts, self.keep
        );
        Err(RunnerError::RetriesExhausted {
            index,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmfsim_core::time::{start_of_year, DAY, YEAR};
    use serde_json::json;

    fn catalog_with(modules: &[(&str, serde_json::Value)]) -> (Arc<ModuleCatalog>, Vec<Arc<ModuleDefinition>>) {
        let catalog = Arc::new(ModuleCatalog::new());
        let loaded = modules
            .iter()
            .map(|(key, json)| {
                catalog
                    .put_module(ModuleDefinition::from_json(*key, json).unwrap())
                    .unwrap()
            })
            .collect();
        (catalog, loaded)
    }

    fn mortality() -> serde_json::Value {
        json!({
            "name": "Mortality",
            "states": {
                "Initial": {
                    "type": "Initial",
                    "distributed_transition": [
                        {"distribution": 0.5, "transition": "Doomed"},
                        {"distribution": 0.5, "transition": "Terminal"}
                    ]
                },
                "Doomed": {
                    "type": "Delay",
                    "range": {"low": 1, "high": 30, "unit": "years"},
                    "direct_transition": "Die"
                },
                "Die": {
                    "type": "Death",
                    "codes": [{"system": "SNOMED-CT", "code": "22298006", "display": "Myocardial infarction"}],
                    "direct_transition": "Terminal"
                },
                "Terminal": {"type": "Terminal"}
            }
        })
    }

    fn simulation(keep: KeepPolicy, max_attempts: u32) -> Simulation {
        let (catalog, modules) = catalog_with(&[("mortality", mortality())]);
        let start = start_of_year(1950).unwrap();
        let stop = start_of_year(2000).unwrap();
        Simulation::new(catalog, modules, BirthSampler::new(start, start + YEAR), stop, 30 * DAY)
            .with_retries(keep, max_attempts)
    }

    #[test]
    fn test_simulate_is_deterministic() {
        let sim = simulation(KeepPolicy::Any, 1);
        for seed in 0..10 {
            let a = sim.simulate(seed).unwrap();
            let b = sim.simulate(seed).unwrap();
            assert_eq!(
                serde_json::to_value(&a).unwrap(),
                serde_json::to_value(&b).unwrap()
            );
        }
    }

    #[test]
    fn test_dead_people_get_certificate() {
        let sim = simulation(KeepPolicy::Dead, 100);
        let outcome = sim.run_person(0, 1).unwrap();
        assert!(!outcome.alive);
        assert!(outcome.person.death_time().unwrap() <= sim.stop());
        assert!(outcome.person.latest_observation("69453-9").is_some());
    }

    #[test]
    fn test_keep_alive_retries_deterministically() {
        let sim = simulation(KeepPolicy::Alive, 100);
        let a = sim.run_person(3, 42).unwrap();
        let b = sim.run_person(3, 42).unwrap();
        assert!(a.alive);
        assert_eq!(a.seed, b.seed);
        assert_eq!(a.attempts, b.attempts);
        assert_eq!(a.person.id, b.person.id);
    }

    #[test]
    fn test_retries_exhausted() {
        let (catalog, modules) = catalog_with(&[(
            "fatal",
            json!({
                "name": "Fatal",
                "states": {
                    "Initial": {"type": "Initial", "direct_transition": "Die"},
                    "Die": {"type": "Death", "direct_transition": "Terminal"},
                    "Terminal": {"type": "Terminal"}
                }
            }),
        )]);
        let start = start_of_year(1990).unwrap();
        let sim = Simulation::new(catalog, modules, BirthSampler::new(start, start + YEAR), start + 10 * YEAR, YEAR)
            .with_retries(KeepPolicy::Alive, 3);
        let err = sim.run_person(0, 9).unwrap_err();
        assert!(matches!(err, RunnerError::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_logic_error_surfaces() {
        let (catalog, modules) = catalog_with(&[(
            "labs",
            json!({
                "name": "Labs",
                "states": {
                    "Initial": {
                        "type": "Initial",
                        "conditional_transition": [
                            {
                                "condition": {
                                    "condition_type": "Observation",
                                    "codes": [{"system": "LOINC", "code": "2093-3"}],
                                    "operator": ">",
                                    "value": 200
                                },
                                "transition": "Terminal"
                            }
                        ]
                    },
                    "Terminal": {"type": "Terminal"}
                }
            }),
        )]);
        let start = start_of_year(1990).unwrap();
        let sim = Simulation::new(catalog, modules, BirthSampler::new(start, start + YEAR), start + 10 * YEAR, YEAR);
        let err = sim.run_person(0, 1).unwrap_err();
        assert!(matches!(err, RunnerError::Core(CoreError::LogicEvaluation { .. })));
        assert!(!err.is_configuration());
    }

    fn coverage_loss() -> serde_json::Value {
        json!({
            "name": "Coverage Loss",
            "states": {
                "Initial": {"type": "Initial", "direct_transition": "Lab"},
                "Lab": {
                    "type": "Observation",
                    "codes": [{"system": "LOINC", "code": "2093-3", "display": "Cholesterol"}],
                    "exact": {"quantity": 250},
                    "unit": "mg/dL",
                    "direct_transition": "Lose"
                },
                "Lose": {"type": "SetAttribute", "attribute": "covered", "value": false, "direct_transition": "Wait"},
                "Wait": {
                    "type": "Delay",
                    "exact": {"quantity": 60, "unit": "days"},
                    "direct_transition": "Check"
                },
                "Check": {
                    "type": "Guard",
                    "allow": {
                        "condition_type": "Observation",
                        "codes": [{"system": "LOINC", "code": "2093-3"}],
                        "operator": ">",
                        "value": 200
                    },
                    "direct_transition": "Found"
                },
                "Found": {"type": "SetAttribute", "attribute": "found", "value": true, "direct_transition": "Terminal"},
                "Terminal": {"type": "Terminal"}
            }
        })
    }

    fn coverage_simulation(dual_records: bool) -> Simulation {
        let (catalog, modules) = catalog_with(&[("coverage_loss", coverage_loss())]);
        let start = start_of_year(1990).unwrap();
        Simulation::new(catalog, modules, BirthSampler::new(start, start + YEAR), start + 10 * YEAR, 30 * DAY)
            .with_dual_records(dual_records)
    }

    #[test]
    fn test_covered_record_observation_satisfies_condition() {
        let person = coverage_simulation(true).simulate(4).unwrap();
        assert_eq!(person.attribute("found").and_then(|a| a.as_bool()), Some(true));

        let dual = person.dual_records().unwrap();
        assert!(!dual.current_covered);
        assert!(dual.covered.latest_observation("2093-3").is_some());
        assert!(person.record.latest_observation("2093-3").is_none());
    }

    #[test]
    fn test_single_record_by_default() {
        let person = coverage_simulation(false).simulate(4).unwrap();
        assert!(!person.has_multiple_records());
        assert!(person.record.latest_observation("2093-3").is_some());
        assert_eq!(person.attribute("found").and_then(|a| a.as_bool()), Some(true));
    }
}
