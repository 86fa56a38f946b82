use thiserror::Error;

/// Failures while following a single breadcrumb.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("breadcrumb for {url} has no `type` attribute")]
    MissingStage { url: String },

    #[error("unknown stage type {0:?}")]
    UnknownStage(String),

    #[error("stage {stage} requires attribute `{key}`")]
    MissingAttr { stage: &'static str, key: &'static str },

    #[error("version link {text:?} on {url} does not match `From YYYY-MM-DD to YYYY-MM-DD`")]
    MalformedVersionRange { url: String, text: String },

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
