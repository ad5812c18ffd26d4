//! Error types for the event bus

use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Error, Debug)]
pub enum BusError {
    /// The broker could not accept the write or the subscription
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// No configured stream captures the subject
    #[error("no stream covers subject {0}")]
    UnknownSubject(String),

    #[error("invalid bus configuration: {0}")]
    InvalidConfig(String),

    /// The bus has been drained and accepts no new subscriptions
    #[error("event bus is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::BrokerUnavailable(e.to_string())
    }
}

impl BusError {
    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::BrokerUnavailable(_))
    }
}
