use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::error;

use crate::cron::CronExpression;
use crate::error::{CadenceError, Result};
use crate::types::{JobDefinition, TriggerSpec};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_LOCK_COOLDOWN_SECS: u64 = 60; // wait after a denied lock
pub const DEFAULT_MIN_SPACING_MS: u64 = 1000; // floor between two runs of one job
pub const DEFAULT_STORAGE_RETRY_SECS: u64 = 30;
pub const DEFAULT_RELOAD_POLL_SECS: u64 = 5;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub anchors: AnchorsConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

// ---------------------------------------------------------------------------
// Runtime sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnchorBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorsConfig {
    #[serde(default)]
    pub backend: AnchorBackend,
    /// Directory for `file`, database path for `sqlite`.
    #[serde(default = "default_anchor_path")]
    pub path: String,
}

impl Default for AnchorsConfig {
    fn default() -> Self {
        Self {
            backend: AnchorBackend::default(),
            path: default_anchor_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockProviderKind {
    /// Always grants. Only safe with a single host instance.
    None,
    /// One lock for every job in the process.
    Singleton,
    #[default]
    Named,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default)]
    pub provider: LockProviderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_lock_cooldown_secs")]
    pub lock_cooldown_secs: u64,
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
    #[serde(default = "default_storage_retry_secs")]
    pub storage_retry_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_cooldown_secs: DEFAULT_LOCK_COOLDOWN_SECS,
            min_spacing_ms: DEFAULT_MIN_SPACING_MS,
            storage_retry_secs: DEFAULT_STORAGE_RETRY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadConfig {
    /// How often the config file is re-read for job changes. 0 disables reload.
    #[serde(default = "default_reload_poll_secs")]
    pub poll_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            poll_secs: DEFAULT_RELOAD_POLL_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// `[jobs.<name>]` tables, keyed by job name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobsConfig(pub BTreeMap<String, JobConfig>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub triggers: TriggersSection,
    /// Free-form, job-scoped settings. Typed at lookup.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Triggers may be written grouped by kind, or as a list of tagged tables:
///
/// ```toml
/// [jobs.report.triggers]
/// schedules = [{ schedule = "0 3 * * *" }]
/// manual = true
/// jobCompletions = [{ jobName = "import" }]
///
/// # or
/// [[jobs.report.triggers]]
/// kind = "schedule"
/// schedule = "0 3 * * *"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggersSection {
    Tagged(Vec<TriggerConfig>),
    Grouped(TriggersConfig),
}

impl Default for TriggersSection {
    fn default() -> Self {
        TriggersSection::Grouped(TriggersConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggersConfig {
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub job_completions: Vec<JobCompletionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletionConfig {
    #[serde(alias = "job_name")]
    pub job_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerConfig {
    Schedule {
        schedule: String,
    },
    Manual,
    JobCompletion {
        #[serde(rename = "jobName", alias = "job_name")]
        job_name: String,
    },
}

impl TriggersSection {
    /// Normalize either form into a [`TriggerSpec`], parsing cron expressions.
    pub fn to_spec(&self) -> Result<TriggerSpec> {
        let mut spec = TriggerSpec::default();
        match self {
            TriggersSection::Grouped(g) => {
                for s in &g.schedules {
                    spec.schedules.push(CronExpression::parse(&s.schedule)?);
                }
                spec.manual = g.manual;
                spec.completions = g
                    .job_completions
                    .iter()
                    .map(|c| c.job_name.clone())
                    .collect();
            }
            TriggersSection::Tagged(list) => {
                for t in list {
                    match t {
                        TriggerConfig::Schedule { schedule } => {
                            spec.schedules.push(CronExpression::parse(schedule)?)
                        }
                        TriggerConfig::Manual => spec.manual = true,
                        TriggerConfig::JobCompletion { job_name } => {
                            spec.completions.push(job_name.clone())
                        }
                    }
                }
            }
        }
        Ok(spec)
    }
}

impl JobConfig {
    pub fn definition(&self, name: &str) -> Result<JobDefinition> {
        validate_job_name(name)?;
        Ok(JobDefinition::new(name, &self.job_type, self.triggers.to_spec()?))
    }
}

/// Reject names that cannot be used as a single path segment.
fn validate_job_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        "must not be empty"
    } else if name == "." || name == ".." {
        "must not be a relative path"
    } else if name.contains(['/', '\\']) {
        "must not contain path separators"
    } else if name.chars().any(char::is_control) {
        "must not contain control characters"
    } else {
        return Ok(());
    };
    Err(CadenceError::InvalidJobName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

impl JobsConfig {
    pub fn get(&self, name: &str) -> Option<&JobConfig> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The desired set of jobs. A job whose triggers fail to parse is logged
    /// and left out; the rest are unaffected.
    pub fn definitions(&self) -> BTreeMap<String, JobDefinition> {
        let mut out = BTreeMap::new();
        for (name, job) in &self.0 {
            match job.definition(name) {
                Ok(def) => {
                    out.insert(name.clone(), def);
                }
                Err(e) => {
                    error!(job = %name, error = %e, "invalid job configuration; job excluded");
                }
            }
        }
        out
    }

    /// Deserialize the `settings` table of `job`. A missing table reads as `{}`
    /// so that settings structs made of defaults still resolve.
    pub fn settings<T: DeserializeOwned>(&self, job: &str) -> Result<T> {
        let value = match self.0.get(job).map(|j| &j.settings) {
            Some(v) if !v.is_null() => v.clone(),
            _ => serde_json::Value::Object(Default::default()),
        };
        serde_json::from_value(value).map_err(|e| CadenceError::InvalidSettings {
            job: job.to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `CADENCE_CONFIG`
    ///   3. ~/.cadence/cadence.toml
    ///
    /// Nested keys are addressed with a double underscore, e.g.
    /// `CADENCE_HTTP__PORT=9000`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = resolve_config_path(config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(source: &str) -> Result<Self> {
        Figment::from(Toml::string(source))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))
    }
}

pub fn resolve_config_path(explicit: Option<&str>) -> String {
    explicit
        .map(String::from)
        .or_else(|| std::env::var("CADENCE_CONFIG").ok())
        .unwrap_or_else(default_config_path)
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

fn default_config_path() -> String {
    format!("{}/.cadence/cadence.toml", home_dir())
}

fn default_anchor_path() -> String {
    format!("{}/.cadence/anchors", home_dir())
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_lock_cooldown_secs() -> u64 {
    DEFAULT_LOCK_COOLDOWN_SECS
}
fn default_min_spacing_ms() -> u64 {
    DEFAULT_MIN_SPACING_MS
}
fn default_storage_retry_secs() -> u64 {
    DEFAULT_STORAGE_RETRY_SECS
}
fn default_reload_poll_secs() -> u64 {
    DEFAULT_RELOAD_POLL_SECS
}
