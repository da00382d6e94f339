use thiserror::Error;

/// A failed call to a runner.
#[derive(Error, Debug)]
pub enum Error {
    /// The runner answered with a non-success status. `body` is kept verbatim
    /// so the recovery classifier can inspect structured error payloads.
    #[error("request failed with status code {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid runner url: {0}")]
    Url(#[from] url::ParseError),

    /// Failure reported by a runner implementation that is not an HTTP
    /// status, e.g. the scripted runner used in tests.
    #[error("{0}")]
    Remote(String),
}

impl Error {
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// The structured error body, when the runner sent JSON.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Status { body, .. } => serde_json::from_str(body)
                .ok()
                .filter(serde_json::Value::is_object),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
