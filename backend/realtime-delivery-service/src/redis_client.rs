use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Shared multiplexed Redis connection (presence and session cache).
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// Clones are cheap and share the underlying connection.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}
