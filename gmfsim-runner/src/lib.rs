//! # gmfsim-runner
//!
//! Population runner for gmfsim.
//!
//! This crate provides:
//! - Configuration loading (YAML file plus environment overrides)
//! - Lifecycle passes: birth, encounter detection and close-out, death
//! - The per-person tick loop with seeded retries
//! - A worker pool that simulates a whole population

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod scheduler;
pub mod simulation;

pub use config::{Config, ConfigError, KeepPolicy, ModulesConfig, PopulationConfig, SimulationConfig};
pub use error::RunnerError;
pub use lifecycle::BirthSampler;
pub use scheduler::{CollectSink, Counters, DiscardSink, OutcomeSink, PopulationScheduler, RunSummary};
pub use simulation::{PersonOutcome, Simulation};
