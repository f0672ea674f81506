//! Runner configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GMFSIM_CONFIG)
//! 3. Environment variables

use gmfsim_core::time::{start_of_year, Timestamp, DAY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Population configuration.
    pub population: PopulationConfig,
    /// Simulated time configuration.
    pub simulation: SimulationConfig,
    /// Module source configuration.
    pub modules: ModulesConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("GMFSIM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.population.apply_env_overrides();
        self.simulation.apply_env_overrides();
        self.modules.apply_env_overrides();
    }

    /// Checks values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.population.validate()?;
        self.simulation.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Which simulated people are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepPolicy {
    /// Keep every person.
    #[default]
    Any,
    /// Retry until the person is alive at the stop time.
    Alive,
    /// Retry until the person is dead at the stop time.
    Dead,
}

impl KeepPolicy {
    /// Returns whether a person with this life status is accepted.
    pub fn accepts(&self, alive: bool) -> bool {
        match self {
            KeepPolicy::Any => true,
            KeepPolicy::Alive => alive,
            KeepPolicy::Dead => !alive,
        }
    }
}

/// Population configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Number of people to simulate.
    pub size: usize,
    /// Population seed; every per-person seed derives from it.
    pub seed: u64,
    /// Worker pool size.
    pub threads: usize,
    /// Life status filter.
    pub keep: KeepPolicy,
    /// Attempts per person before giving up on the keep filter.
    pub max_attempts: u32,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: 100,
            seed: 0,
            threads: 4,
            keep: KeepPolicy::Any,
            max_attempts: 1000,
        }
    }
}

impl PopulationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("GMFSIM_POPULATION") {
            if let Ok(n) = size.parse() {
                self.size = n;
            }
        }

        if let Ok(seed) = std::env::var("GMFSIM_SEED") {
            if let Ok(n) = seed.parse() {
                self.seed = n;
            }
        }

        if let Ok(threads) = std::env::var("GMFSIM_THREADS") {
            if let Ok(n) = threads.parse() {
                self.threads = n;
            }
        }

        if let Ok(keep) = std::env::var("GMFSIM_KEEP") {
            self.keep = match keep.to_lowercase().as_str() {
                "alive" => KeepPolicy::Alive,
                "dead" => KeepPolicy::Dead,
                _ => KeepPolicy::Any,
            };
        }

        if let Ok(max) = std::env::var("GMFSIM_MAX_ATTEMPTS") {
            if let Ok(n) = max.parse() {
                self.max_attempts = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::ValidationError(
                "population.size must be greater than 0".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(ConfigError::ValidationError(
                "population.threads must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "population.max_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Simulated time configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// First year of the birth window.
    pub start_year: i32,
    /// Year whose first instant ends the simulation.
    pub stop_year: i32,
    /// Exact stop time in epoch milliseconds; wins over `stop_year`.
    pub stop_time: Option<Timestamp>,
    /// Length of one tick in days.
    pub timestep_days: u32,
    /// Progress report interval in seconds.
    pub report_interval_secs: u64,
    /// Keep covered and uncovered care in separate records, switched by the
    /// `covered` attribute.
    pub dual_records: bool,
}

/// Default end of the simulation; fixed so a seed always yields the same
/// population.
pub const DEFAULT_STOP_YEAR: i32 = 2020;

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_year: 1920,
            stop_year: DEFAULT_STOP_YEAR,
            stop_time: None,
            timestep_days: 7,
            report_interval_secs: 10,
            dual_records: false,
        }
    }
}

impl SimulationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(year) = std::env::var("GMFSIM_START_YEAR") {
            if let Ok(n) = year.parse() {
                self.start_year = n;
            }
        }

        if let Ok(year) = std::env::var("GMFSIM_STOP_YEAR") {
            if let Ok(n) = year.parse() {
                self.stop_year = n;
            }
        }

        if let Ok(time) = std::env::var("GMFSIM_STOP_TIME") {
            if let Ok(n) = time.parse() {
                self.stop_time = Some(n);
            }
        }

        if let Ok(days) = std::env::var("GMFSIM_TIMESTEP_DAYS") {
            if let Ok(n) = days.parse() {
                self.timestep_days = n;
            }
        }

        if let Ok(secs) = std::env::var("GMFSIM_REPORT_INTERVAL") {
            if let Ok(n) = secs.parse() {
                self.report_interval_secs = n;
            }
        }

        if let Ok(dual) = std::env::var("GMFSIM_DUAL_RECORDS") {
            if let Ok(b) = dual.parse() {
                self.dual_records = b;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timestep_days == 0 {
            return Err(ConfigError::ValidationError(
                "simulation.timestep_days must be greater than 0".to_string(),
            ));
        }
        let start = self.start_time().ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "simulation.start_year {} is out of range",
                self.start_year
            ))
        })?;
        let stop = self.stop_time().ok_or_else(|| {
            ConfigError::ValidationError("simulation stop time is out of range".to_string())
        })?;
        if start >= stop {
            return Err(ConfigError::ValidationError(format!(
                "simulation start ({}) must be before stop ({})",
                start, stop
            )));
        }
        Ok(())
    }

    /// Start of the birth window.
    pub fn start_time(&self) -> Option<Timestamp> {
        start_of_year(self.start_year)
    }

    /// End of the simulation.
    pub fn stop_time(&self) -> Option<Timestamp> {
        self.stop_time.or_else(|| start_of_year(self.stop_year))
    }

    /// Tick length in milliseconds.
    pub fn timestep(&self) -> Timestamp {
        self.timestep_days as Timestamp * DAY
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

/// Module source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Root of the module tree.
    pub dir: PathBuf,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./modules"),
        }
    }
}

impl ModulesConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("GMFSIM_MODULES") {
            self.dir = PathBuf::from(dir);
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
