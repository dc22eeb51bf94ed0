use std::fmt;

use crate::cron::CronExpression;

/// Everything the runtime needs to host one job.
///
/// Definitions are immutable: a configuration change produces a new
/// definition and the scheduler replaces the running job wholesale.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    /// Unique key; not part of structural equality.
    pub name: String,
    /// Key into the host's job-type registry.
    pub job_type: String,
    pub triggers: TriggerSpec,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>, triggers: TriggerSpec) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            triggers,
        }
    }
}

impl PartialEq for JobDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.job_type == other.job_type && self.triggers == other.triggers
    }
}

impl Eq for JobDefinition {}

impl fmt::Display for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.job_type)
    }
}

/// The set of conditions that start a run attempt. Any of them firing is
/// enough.
#[derive(Debug, Clone, Default)]
pub struct TriggerSpec {
    pub schedules: Vec<CronExpression>,
    pub manual: bool,
    /// Upstream job names whose completion triggers this job.
    pub completions: Vec<String>,
}

impl TriggerSpec {
    pub fn schedule(mut self, expression: CronExpression) -> Self {
        self.schedules.push(expression);
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.completions.push(upstream.into());
        self
    }

    /// True when nothing can ever fire this job.
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty() && !self.manual && self.completions.is_empty()
    }

    fn sorted_schedules(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.schedules.iter().map(|c| c.as_str()).collect();
        v.sort_unstable();
        v
    }

    fn sorted_completions(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.completions.iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}

// List order in configuration is not meaningful.
impl PartialEq for TriggerSpec {
    fn eq(&self, other: &Self) -> bool {
        self.manual == other.manual
            && self.sorted_schedules() == other.sorted_schedules()
            && self.sorted_completions() == other.sorted_completions()
    }
}

impl Eq for TriggerSpec {}
