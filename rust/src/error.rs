use thiserror::Error;

/// Failures surfaced by the broker and its collaborators.
///
/// None of these are fatal to the process: callers log them and move on to
/// the next room or connection.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("upstream bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("failed to subscribe to {channel}: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("failed to unsubscribe from {channel}: {reason}")]
    Unsubscribe { channel: String, reason: String },

    #[error("failed to publish to {channel}: {reason}")]
    Publish { channel: String, reason: String },

    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_error_maps_to_store_unavailable() {
        let e = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err: BrokerError = e.into();
        assert!(matches!(err, BrokerError::StoreUnavailable(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_subscribe_error_names_channel() {
        let err = BrokerError::Subscribe {
            channel: "alpha".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "failed to subscribe to alpha: timeout");
    }
}
