use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("disk {disk_id} is already attached to sandbox {sandbox_id}")]
    AlreadyAttached { disk_id: String, sandbox_id: String },

    #[error("disk {0} is not attached")]
    NotAttached(String),

    /// The operation is not allowed from the resource's current state.
    #[error("cannot {action} {kind} {id} in state {state}")]
    InvalidState {
        kind: &'static str,
        id: String,
        state: String,
        action: &'static str,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Common(#[from] corral_common::Error),

    #[error(transparent)]
    Registry(#[from] corral_registry::Error),

    #[error(transparent)]
    Jobs(#[from] corral_jobs::Error),

    #[error(transparent)]
    Runner(#[from] corral_runner_client::Error),

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
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    #[must_use]
    pub fn invalid_state(
        kind: &'static str,
        id: impl Into<String>,
        state: impl std::fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidState {
            kind,
            id: id.into(),
            state: state.to_string(),
            action,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
