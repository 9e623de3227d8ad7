use thiserror::Error;

use spider_core::SourceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Rate Limit: {0}")]
    RateLimit(String),
    #[error("Invalid HTML: {0}")]
    InvalidHTML(String),
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Network Error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Cannot parse URL: {0}")]
    UrlError(#[from] url::ParseError),
}

impl From<Error> for SourceError {
    fn from(error: Error) -> Self {
        match error {
            Error::UrlError(e) => SourceError::InvalidUrl(e.to_string()),
            Error::InvalidHTML(e) => SourceError::Parse(e),
            Error::RateLimit(e) => SourceError::Network(e),
            Error::IOError(e) => SourceError::Network(e.to_string()),
            Error::NetworkError(e) => SourceError::Network(e.to_string()),
        }
    }
}
