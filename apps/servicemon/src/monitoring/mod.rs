/// Monitoring engine module - schedules and executes service checks
///
/// This module is responsible for:
/// - Building protocol checkers from their datastore definitions
/// - Spreading check executions over the check interval
/// - Detecting state transitions and turning them into events
pub mod arena;
pub mod checker;
pub mod controller;
pub mod executor;
pub mod registry;
pub mod run_queue;
pub mod transition;
pub mod types;
pub mod validation;

pub use checker::CheckDefaults;
pub use controller::{Controller, ControllerConfig};
pub use executor::CheckExecutor;
pub use registry::CheckerRegistry;
pub use run_queue::RunQueue;
pub use transition::ResultHandler;
