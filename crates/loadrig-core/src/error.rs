use thiserror::Error;

/// Failure of a single remote call before a status code was observed.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CallError::Decode(err.to_string())
        } else {
            CallError::Transport(err.to_string())
        }
    }
}

/// Rejected run parameters. Always raised before any worker is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero (got {value})")]
    NotPositive { field: &'static str, value: i64 },

    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },

    #[error("{field} is too large: {reason}")]
    TooLarge { field: &'static str, reason: String },

    #[error("invalid target base URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown {field} value {value:?}")]
    UnknownValue { field: &'static str, value: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
