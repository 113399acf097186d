use thiserror::Error;

/// Errors surfaced by the repository client.
///
/// `NotFound` and `OpNotAllowed` carry meaning for the caching layer above:
/// callers branch on them. Everything else is a transient or fatal transport
/// condition and is treated uniformly.
#[derive(Error, Debug)]
pub enum Error {
    #[error("remote path not found")]
    NotFound,

    #[error("operation not allowed: {0}")]
    OpNotAllowed(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    /// True when the remote definitively reported the path absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
