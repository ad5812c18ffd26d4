//! Online status shared between replicas.
//!
//! Each user has a Redis set `presence:user:<id>` holding the ids of the
//! instances that currently hold a live connection for them. A user is online
//! while the set exists. The key carries a TTL, refreshed periodically for
//! every locally connected user, so a crashed instance cannot keep users
//! online forever.

use crate::error::{AppError, AppResult};
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, user_id: Uuid) -> AppResult<()>;

    async fn set_offline(&self, user_id: Uuid) -> AppResult<()>;

    /// The subset of `user_ids` currently online on any instance.
    async fn online_users(&self, user_ids: &[Uuid]) -> AppResult<HashSet<Uuid>>;

    /// Extend the online status of users still connected to this instance.
    async fn refresh(&self, user_ids: &[Uuid]) -> AppResult<()>;
}

pub fn presence_key(user_id: Uuid) -> String {
    format!("presence:user:{user_id}")
}

pub struct RedisPresenceStore {
    redis: RedisClient,
    instance_id: String,
    ttl: Duration,
}

impl RedisPresenceStore {
    pub fn new(redis: RedisClient, instance_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            redis,
            instance_id: instance_id.into(),
            ttl,
        }
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

fn presence_error(e: redis::RedisError) -> AppError {
    AppError::PresenceLookupFailed(e.to_string())
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let key = presence_key(user_id);

        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(&key)
            .arg(&self.instance_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(presence_error)?;

        debug!(user_id = %user_id, instance_id = %self.instance_id, "user online");
        Ok(())
    }

    async fn set_offline(&self, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.connection();

        // The key disappears with its last member
        redis::cmd("SREM")
            .arg(presence_key(user_id))
            .arg(&self.instance_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(presence_error)?;

        debug!(user_id = %user_id, instance_id = %self.instance_id, "user offline on this instance");
        Ok(())
    }

    async fn online_users(&self, user_ids: &[Uuid]) -> AppResult<HashSet<Uuid>> {
        if user_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = self.redis.connection();

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            pipe.cmd("EXISTS").arg(presence_key(*user_id));
        }
        let exists: Vec<bool> = pipe
            .query_async::<_, Vec<bool>>(&mut conn)
            .await
            .map_err(presence_error)?;

        Ok(user_ids
            .iter()
            .zip(exists)
            .filter_map(|(user_id, online)| online.then_some(*user_id))
            .collect())
    }

    async fn refresh(&self, user_ids: &[Uuid]) -> AppResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.connection();

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            let key = presence_key(*user_id);
            pipe.cmd("SADD")
                .arg(&key)
                .arg(&self.instance_id)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.ttl_secs())
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(presence_error)?;
        Ok(())
    }
}
