//! Shared model for the cadence job runtime: configuration, job definitions,
//! trigger specs and cron expressions.

pub mod config;
pub mod cron;
pub mod error;
pub mod types;

pub use config::{CadenceConfig, JobsConfig};
pub use cron::CronExpression;
pub use error::{CadenceError, Result};
pub use types::{JobDefinition, TriggerSpec};
