use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Gallery source error: {0}")]
    SourceError(#[from] SourceError),
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Cannot encode/decode JSON: {0}")]
    JSONError(#[from] serde_json::Error),
    #[error("Cannot parse URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the gallery site collaborators, pre-classified so the worker
/// can map them onto page errors without inspecting messages.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Cannot parse HTML: {0}")]
    Parse(String),
}
