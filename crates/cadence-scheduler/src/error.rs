use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An anchor could not be read or written. Fails the current round.
    #[error("Anchor store error for job {job}: {reason}")]
    AnchorStore { job: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No constructor registered under the job's type key.
    #[error("Unknown job type: {job_type}")]
    UnknownJobType { job_type: String },

    /// The constructor for the job type returned an error.
    #[error("Failed to construct job type {job_type}: {reason}")]
    JobConstruction { job_type: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
