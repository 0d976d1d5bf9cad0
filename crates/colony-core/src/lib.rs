//! # Colony Core
//!
//! Shared data model, error taxonomy, configuration and the repository
//! contracts that storage backends implement for the scheduling engine.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ColonyConfig;
pub use error::{ColonyError, Result};
