use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreakError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse config file: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("auth failed for evergreen: {message}")]
    AuthFailed { message: String },

    #[error("rate limited by evergreen")]
    RateLimited,

    #[error("upstream error from evergreen: {message}")]
    Upstream {
        message: String,
        status: Option<u16>,
    },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StreakError {
    /// Returns true for transient provider errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited => true,
            // 5xx = server error (retryable), 4xx = client error (not retryable)
            Self::Upstream { status, .. } => status.is_some_and(|s| s >= 500),
            Self::Request(e) => !e.is_decode(),
            _ => false,
        }
    }

    /// Short machine-readable reason, used as a structured log field.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::TomlParse(_) => "config",
            Self::AuthFailed { .. } => "auth_failed",
            Self::RateLimited => "rate_limited",
            Self::Upstream { .. } => "upstream",
            Self::Request(_) => "request",
            Self::SchemaParse(_) => "schema_parse",
            Self::Store(_) => "store",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = StreakError::Upstream {
            message: "502 Bad Gateway".to_string(),
            status: Some(502),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = StreakError::Upstream {
            message: "404 Not Found".to_string(),
            status: Some(404),
        };
        assert!(!err.is_retryable());

        // No status means the error did not come from HTTP.
        let err = StreakError::Upstream {
            message: "empty body".to_string(),
            status: None,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_is_retryable_and_auth_is_not() {
        assert!(StreakError::RateLimited.is_retryable());
        assert!(
            !StreakError::AuthFailed {
                message: "401".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(StreakError::RateLimited.reason(), "rate_limited");
        assert_eq!(StreakError::Store("x".into()).reason(), "store");
        assert_eq!(StreakError::Other("x".into()).reason(), "other");
    }
}
