use {corral_common::Resources, thiserror::Error};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("runner not found: {0}")]
    RunnerNotFound(String),

    #[error("region not found: {0}")]
    RegionNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Common(#[from] corral_common::Error),

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
    pub fn runner_not_found(id: impl Into<String>) -> Self {
        Self::RunnerNotFound(id.into())
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why the allocator could not place a request.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// No runner in the region and class has room. Safe to retry later.
    #[error("no runner with capacity for {requested} in region {region} ({class})")]
    CapacityExhausted {
        requested: Resources,
        region: String,
        class: String,
    },

    #[error(transparent)]
    Registry(#[from] Error),
}

impl AllocationError {
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }
}
