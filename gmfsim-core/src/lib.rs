//! # gmfsim-core
//!
//! Module interpreter for gmfsim.
//!
//! This crate provides:
//! - Module definition parsing and validation
//! - Condition evaluation and transition resolution
//! - The per-person state machine interpreter
//! - Person state: attributes, event log, clinical record

pub mod catalog;
pub mod definition;
pub mod distribution;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod logic;
pub mod person;
pub mod record;
pub mod state;
pub mod time;
pub mod transition;

pub use catalog::ModuleCatalog;
pub use definition::ModuleDefinition;
pub use distribution::Distribution;
pub use error::CoreError;
pub use events::{Event, EventLog};
pub use interpreter::Interpreter;
pub use logic::Condition;
pub use person::{AttributeValue, Person};
pub use record::{Code, EncounterClass, Entry, EntryKind, HealthRecord};
pub use state::{ModuleHistory, StateInstance, StateKind, StateTemplate};
pub use time::{TimeUnit, Timestamp};
pub use transition::TransitionRule;
