//! The seam between the dispatcher and the components that own job targets.

use async_trait::async_trait;

use crate::{
    recovery::{Classification, ErrorPayload, SanitizedError, normalize},
    types::Job,
};

/// Why executing a job failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Runner(#[from] corral_runner_client::Error),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Message(String),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl JobError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Normalize into what gets stored on the failed resource.
    ///
    /// A runner's JSON error body is read as a structured payload, keeping
    /// the status line in front of its reason; other errors contribute their
    /// full source chain.
    pub fn sanitize(&self) -> SanitizedError {
        match self {
            Self::Runner(e) => match (e.details(), e.status()) {
                (Some(details), Some(status)) => {
                    let mut sanitized = normalize(&ErrorPayload::Structured(&details));
                    sanitized.error_reason = format!(
                        "request failed with status code {status}: {}",
                        sanitized.error_reason
                    );
                    sanitized
                },
                _ => normalize(&ErrorPayload::Wrapped(e)),
            },
            Self::Timeout(_) | Self::Message(_) => normalize(&ErrorPayload::Text(&self.to_string())),
            Self::External { .. } => normalize(&ErrorPayload::Wrapped(self)),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed {
        error: SanitizedError,
        classification: Classification,
    },
}

/// Executes the runner-side work of a family of job types and applies the
/// result to the resource the job targets.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Perform the work. May be called more than once for the same job when
    /// a transient failure is retried, so it must be idempotent.
    async fn execute(&self, job: &Job) -> Result<(), JobError>;

    /// Apply the terminal outcome. Called once per job, after the job row
    /// has reached `done` or `failed`.
    async fn finish(&self, job: &Job, outcome: &JobOutcome) -> Result<(), JobError>;
}
