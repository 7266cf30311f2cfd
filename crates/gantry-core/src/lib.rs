//! Agent run engine: run state machine, persistence, operator commands,
//! reports and configuration loading.

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod report;
pub mod run;
pub mod store;

pub use bootstrap::{AppBuilder, BuiltinTools};
pub use config::Config;
pub use console::{Console, Job, Response};
pub use engine::{Drive, EngineParts, EngineSettings, RunEngine, StepEdit};
pub use error::EngineError;
pub use run::{PauseReason, PlannedStep, Run, RunState, Step, StepStatus};
pub use store::RunStore;
