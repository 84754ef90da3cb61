use thiserror::Error;

/// Errors surfaced by the monitoring core.
///
/// Only `ConfigurationInvalid`, `AuthenticationFailed`, `AuthenticationExpired`
/// and `Transport` ever reach the event channel; `CacheCorrupt` is absorbed by
/// the token store and only logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("configuration is missing {}; check settings", .missing.join(", "))]
    ConfigurationInvalid { missing: Vec<&'static str> },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authentication expired: {0}")]
    AuthenticationExpired(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("token cache: {0}")]
    CacheCorrupt(String),
}

impl MonitorError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthenticationExpired(_))
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(error: std::io::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::MonitorError;

    #[test]
    fn configuration_error_lists_missing_fields() {
        let error = MonitorError::ConfigurationInvalid {
            missing: vec!["client id", "email"],
        };
        assert_eq!(
            error.to_string(),
            "configuration is missing client id, email; check settings"
        );
    }

    #[test]
    fn io_errors_map_to_transport() {
        let error: MonitorError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert!(matches!(error, MonitorError::Transport(ref msg) if msg.contains("reset")));
        assert!(!error.is_auth_expired());
    }
}
