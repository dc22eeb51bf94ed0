use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid settings for job {job}: {reason}")]
    InvalidSettings { job: String, reason: String },

    /// Job names end up in anchor file names and URL paths.
    #[error("Invalid job name `{name}`: {reason}")]
    InvalidJobName { name: String, reason: String },
}

impl CadenceError {
    /// Short error code string, used in HTTP error bodies and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
            CadenceError::InvalidCron { .. } => "INVALID_CRON",
            CadenceError::InvalidSettings { .. } => "INVALID_SETTINGS",
            CadenceError::InvalidJobName { .. } => "INVALID_JOB_NAME",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
