use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::JobsConfig;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};

/// A unit of work. Implementations own their retry and timeout policy; the
/// runtime only reports failures.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, info: &ExecutionInfo, cancel: CancellationToken) -> anyhow::Result<()>;
}

type Constructor = Arc<dyn Fn() -> anyhow::Result<Box<dyn Job>> + Send + Sync>;

/// Name-keyed job constructors supplied by the host.
#[derive(Default, Clone)]
pub struct JobTypeRegistry {
    constructors: HashMap<String, Constructor>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Job>> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Arc::new(constructor));
        self
    }

    /// Register a job type built with `Default`.
    pub fn register_default<J>(&mut self, key: impl Into<String>) -> &mut Self
    where
        J: Job + Default + 'static,
    {
        self.register(key, || Ok(Box::new(J::default()) as Box<dyn Job>))
    }

    /// Build a fresh instance for one execution.
    pub fn resolve(&self, key: &str) -> Result<Box<dyn Job>> {
        let ctor = self
            .constructors
            .get(key)
            .ok_or_else(|| SchedulerError::UnknownJobType {
                job_type: key.to_string(),
            })?;
        ctor().map_err(|e| SchedulerError::JobConstruction {
            job_type: key.to_string(),
            reason: format!("{e:#}"),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.constructors.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// What a job sees about itself while executing.
#[derive(Clone)]
pub struct ExecutionInfo {
    pub job_name: String,
    pub settings: JobSettings,
}

/// Typed access to `[jobs.<name>.settings]`, read from the latest
/// configuration snapshot at the time of the call.
#[derive(Clone)]
pub struct JobSettings {
    job: String,
    config: watch::Receiver<Arc<JobsConfig>>,
}

impl JobSettings {
    pub fn new(job: impl Into<String>, config: watch::Receiver<Arc<JobsConfig>>) -> Self {
        Self {
            job: job.into(),
            config,
        }
    }

    /// Settings pinned to one configuration, for tests and one-off runs.
    pub fn fixed(job: impl Into<String>, config: JobsConfig) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(config));
        Self::new(job, rx)
    }

    pub fn get<T: DeserializeOwned>(&self) -> cadence_core::Result<T> {
        let snapshot = self.config.borrow().clone();
        snapshot.settings(&self.job)
    }
}
