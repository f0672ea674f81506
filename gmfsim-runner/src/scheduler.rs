//! Population scheduler.
//!
//! Every person runs as a blocking task on the tokio blocking pool, gated by
//! a semaphore sized to the configured thread count. Per-person seeds are
//! drawn from the population seed before any task is submitted, so results
//! do not depend on completion order.

use crate::config::Config;
use crate::error::RunnerError;
use crate::simulation::{PersonOutcome, Simulation};
use gmfsim_core::{ModuleCatalog, ModuleDefinition};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Receives accepted people.
///
/// Called from worker threads, possibly concurrently.
pub trait OutcomeSink: Send + Sync {
    fn accept(&self, outcome: PersonOutcome);
}

/// Drops every outcome.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl OutcomeSink for DiscardSink {
    fn accept(&self, _outcome: PersonOutcome) {}
}

/// Keeps every outcome in memory.
#[derive(Debug, Default)]
pub struct CollectSink {
    outcomes: Mutex<Vec<PersonOutcome>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the collected outcomes, ordered by population index.
    pub fn take(&self) -> Vec<PersonOutcome> {
        let mut outcomes = std::mem::take(&mut *self.outcomes.lock());
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}

impl OutcomeSink for CollectSink {
    fn accept(&self, outcome: PersonOutcome) {
        self.outcomes.lock().push(outcome);
    }
}

/// Shared outcome counters.
#[derive(Debug, Default)]
pub struct Counters {
    completed: AtomicU64,
    alive: AtomicU64,
    dead: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &PersonOutcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if outcome.alive {
            self.alive.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dead.fetch_add(1, Ordering::Relaxed);
        }
        self.retries
            .fetch_add(u64::from(outcome.attempts.saturating_sub(1)), Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Totals of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub population: usize,
    pub completed: u64,
    pub alive: u64,
    pub dead: u64,
    pub retries: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

/// Runs a population over a shared catalog.
pub struct PopulationScheduler {
    simulation: Arc<Simulation>,
    population: usize,
    seed: u64,
    threads: usize,
    report_interval: Duration,
    counters: Arc<Counters>,
}

impl PopulationScheduler {
    /// Validates `config`, loads every module and prepares the run.
    pub fn new(config: &Config, catalog: Arc<ModuleCatalog>) -> Result<Self, RunnerError> {
        config.validate()?;
        let modules = catalog.load_all()?;
        tracing::info!(
            "Loaded {} modules ({} files indexed)",
            modules.len(),
            catalog.loaded()
        );
        Self::with_modules(config, catalog, modules)
    }

    /// Prepares a run over already loaded top-level modules.
    pub fn with_modules(
        config: &Config,
        catalog: Arc<ModuleCatalog>,
        modules: Vec<Arc<ModuleDefinition>>,
    ) -> Result<Self, RunnerError> {
        let simulation = Simulation::from_config(config, catalog, modules)?;
        Ok(Self {
            simulation: Arc::new(simulation),
            population: config.population.size,
            seed: config.population.seed,
            threads: config.population.threads,
            report_interval: config.simulation.report_interval(),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Per-person seeds, drawn in order from the population seed.
    pub fn person_seeds(&self) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.population).map(|_| rng.gen()).collect()
    }

    /// Simulates the whole population, handing each accepted person to `sink`.
    ///
    /// A failed person is logged and counted; the rest of the population
    /// still runs.
    pub async fn run(&self, sink: Arc<dyn OutcomeSink>) -> RunSummary {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.threads));
        let mut tasks = JoinSet::new();

        tracing::info!(
            "Simulating {} people on {} threads (seed={})",
            self.population,
            self.threads,
            self.seed
        );

        for (index, seed) in self.person_seeds().into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let simulation = self.simulation.clone();
            let counters = self.counters.clone();
            let sink = sink.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = tokio::task::spawn_blocking(move || {
                    let outcome = simulation.run_person(index, seed)?;
                    counters.record(&outcome);
                    sink.accept(outcome);
                    Ok::<(), RunnerError>(())
                })
                .await;
                (index, result.map_err(RunnerError::from).and_then(|r| r))
            });
        }

        let mut report = tokio::time::interval(self.report_interval);
        report.tick().await;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(())))) => {}
                    Some(Ok((index, Err(e)))) => {
                        self.counters.record_failure();
                        tracing::error!("Person {} aborted: {}", index, e);
                    }
                    Some(Err(e)) => {
                        self.counters.record_failure();
                        tracing::error!("Worker task failed: {}", e);
                    }
                },
                _ = report.tick() => {
                    tracing::info!(
                        "Progress: {}/{} people ({} failed)",
                        self.counters.completed(),
                        self.population,
                        self.counters.failed()
                    );
                }
            }
        }

        let summary = self.summary(started.elapsed());
        tracing::info!(
            "Simulation complete: {} alive, {} dead, {} retries, {} failed in {:?}",
            summary.alive,
            summary.dead,
            summary.retries,
            summary.failed,
            summary.elapsed
        );
        summary
    }

    fn summary(&self, elapsed: Duration) -> RunSummary {
        RunSummary {
            population: self.population,
            completed: self.counters.completed(),
            alive: self.counters.alive.load(Ordering::Relaxed),
            dead: self.counters.dead.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failed: self.counters.failed(),
            elapsed,
        }
    }
}
