use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Noise-filter exclusion vocabulary is empty")]
    MissingVocabulary,

    #[error("Invalid rounding precision: {0} decimals (expected 0..=7)")]
    InvalidPrecision(u32),

    #[error("Geocoding service unreachable: {0}")]
    GeocoderUnreachable(String),

    #[error("Invalid extractor source: {0}")]
    InvalidSource(String),

    #[error("Invalid match quality: {0}")]
    InvalidMatchQuality(String),

    #[error("Canonical location is finalized: {0}")]
    Frozen(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
