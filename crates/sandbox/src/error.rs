use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("warm pool not found: {0}")]
    PoolNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not allowed from the sandbox's current state.
    #[error("cannot {action} sandbox {sandbox_id} in state {state}")]
    InvalidState {
        sandbox_id: String,
        state: String,
        action: &'static str,
    },

    #[error(transparent)]
    Common(#[from] corral_common::Error),

    #[error(transparent)]
    Registry(#[from] corral_registry::Error),

    #[error(transparent)]
    Allocation(#[from] corral_registry::AllocationError),

    #[error(transparent)]
    Jobs(#[from] corral_jobs::Error),

    #[error(transparent)]
    Volumes(#[from] corral_volumes::Error),

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
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    #[must_use]
    pub fn invalid_state(
        sandbox_id: impl Into<String>,
        state: impl std::fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidState {
            sandbox_id: sandbox_id.into(),
            state: state.to_string(),
            action,
        }
    }

    /// No runner had room. The request may succeed later.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::Allocation(e) if e.is_capacity_exhausted())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
