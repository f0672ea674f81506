//! Command execution.

use crate::Commands;
use colored::Colorize;
use gmfsim_core::time::Timestamp;
use gmfsim_core::{ModuleCatalog, Person};
use gmfsim_runner::{Config, Simulation};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Executes a command and returns the formatted output.
pub fn execute(config: &Config, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Validate { dir } => validate(&dir),

        Commands::List { dir } => {
            let catalog = ModuleCatalog::open(&dir)?;
            let keys = catalog.keys();
            if keys.is_empty() {
                return Ok("No modules found".yellow().to_string());
            }

            let mut output = String::new();
            for key in keys {
                let module = catalog.get(&key)?;
                let kind = if module.submodule {
                    "submodule".dimmed().to_string()
                } else {
                    "module".to_string()
                };
                output.push_str(&format!(
                    "{}  {} ({} states, checksum {})\n",
                    key.cyan(),
                    kind,
                    module.len(),
                    module.checksum
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Simulate {
            dir,
            seed,
            modules,
            full,
        } => {
            let catalog = ModuleCatalog::open(&dir)?;
            let loaded = match modules {
                Some(keys) => keys
                    .iter()
                    .map(|key| catalog.get(key))
                    .collect::<Result<Vec<_>, _>>()?,
                None => catalog.load_all()?,
            };
            let simulation = Simulation::from_config(config, Arc::new(catalog), loaded)?;
            let person = simulation.simulate(seed)?;

            let value = if full {
                serde_json::to_value(&person)?
            } else {
                summary(&person, simulation.stop())
            };
            Ok(serde_json::to_string_pretty(&value)?)
        }

        Commands::Config => Ok(serde_yaml::to_string(config)?),
    }
}

/// Loads every module under `dir`, listing warnings and failures.
fn validate(dir: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let catalog = ModuleCatalog::open(dir)?;
    let mut output = String::new();
    let mut failed = 0;
    let keys = catalog.keys();

    for key in &keys {
        match catalog.get(key) {
            Ok(module) => {
                let mut problems = module.validate();
                for submodule in module.submodule_references() {
                    if !catalog.contains(submodule) {
                        problems.push(format!("submodule '{}' does not exist", submodule));
                    }
                }
                if problems.is_empty() {
                    output.push_str(&format!("{} {}\n", "ok".green(), key));
                } else {
                    output.push_str(&format!("{} {}\n", "warn".yellow(), key));
                    for problem in problems {
                        output.push_str(&format!("    {}\n", problem));
                    }
                }
            }
            Err(e) => {
                failed += 1;
                output.push_str(&format!("{} {}\n    {}\n", "fail".red(), key, e));
            }
        }
    }

    if failed > 0 {
        return Err(format!("{}{} of {} modules failed to load", output, failed, keys.len()).into());
    }
    output.push_str(&format!("{} modules loaded", keys.len()));
    Ok(output)
}

/// Compact description of a simulated person.
fn summary(person: &Person, stop: Timestamp) -> Value {
    let attributes: Map<String, Value> = person
        .attributes
        .iter()
        .filter_map(|(key, value)| value.to_json().map(|v| (key.clone(), v)))
        .collect();
    let modules: Map<String, Value> = person
        .histories()
        .map(|(key, history)| {
            (
                key.to_string(),
                json!({
                    "current": history.current().name(),
                    "visits": history.len(),
                }),
            )
        })
        .collect();

    json!({
        "id": person.id.to_string(),
        "seed": person.seed(),
        "alive": person.alive(stop),
        "birthdate": person.birthdate(),
        "death": person.death_time(),
        "attributes": attributes,
        "modules": modules,
        "encounters": person.record.encounters.len(),
        "events": person.events,
    })
}
