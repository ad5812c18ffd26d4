//! Session token to user resolution.
//!
//! The session service caches active sessions in Redis as a hash at
//! `session:<token>` (`session_token`, `account_id`, `is_active`, ...). The
//! account is mapped to its user through `user_info.account_id`.

use crate::error::{AppError, AppResult};
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// User behind `token`, or [`AppError::Unauthorized`].
    async fn resolve(&self, token: &str) -> AppResult<Uuid>;
}

pub fn session_key(token: &str) -> String {
    format!("session:{token}")
}

pub struct CachedSessionResolver {
    redis: RedisClient,
    db: Pool,
}

impl CachedSessionResolver {
    pub fn new(redis: RedisClient, db: Pool) -> Self {
        Self { redis, db }
    }
}

#[async_trait]
impl SessionResolver for CachedSessionResolver {
    async fn resolve(&self, token: &str) -> AppResult<Uuid> {
        let mut conn = self.redis.connection();
        let session: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(session_key(token))
            .query_async::<_, HashMap<String, String>>(&mut conn)
            .await?;

        if session.is_empty() {
            debug!("session token not found in cache");
            return Err(AppError::Unauthorized);
        }
        if session.get("is_active").map(String::as_str) == Some("false") {
            debug!("session token is deactivated");
            return Err(AppError::Unauthorized);
        }
        let account_id = session
            .get("account_id")
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                warn!("cached session has no valid account_id");
                AppError::Unauthorized
            })?;

        let client = self.db.get().await?;
        let row = client
            .query_opt(
                "SELECT id FROM user_info WHERE account_id = $1",
                &[&account_id],
            )
            .await?;

        match row {
            Some(row) => Ok(row.get("id")),
            None => {
                warn!(account_id = %account_id, "session account has no user profile");
                Err(AppError::Unauthorized)
            }
        }
    }
}
