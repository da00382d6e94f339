use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Another non-terminal job already exists for the resource.
    #[error("{resource} already has active job {job_id}")]
    ActiveJobExists { resource: String, job_id: String },

    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidStatus {
        job_id: String,
        status: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    #[must_use]
    pub fn active_job_exists(resource: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self::ActiveJobExists {
            resource: resource.into(),
            job_id: job_id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
