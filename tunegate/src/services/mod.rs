//! Application services.

pub mod container;
pub mod intents;

pub use container::ServiceContainer;
pub use intents::{CreateIntent, CreateOutcome, IntentService};
