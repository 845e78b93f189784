//! Route handlers.

pub mod health;
pub mod intents;
pub mod sessions;
