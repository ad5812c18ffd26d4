use crate::error::AppError;
use crate::models::events::stream_catalogue;
use crate::services::conversation_store::PointerPolicy;
use dotenvy::dotenv;
use event_bus::BusConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// Stable per replica; names this instance's exclusive consumer groups
    pub instance_id: String,
    pub run_migrations: bool,
    pub db_max_connections: usize,
    pub db_connect_timeout_secs: u64,

    pub bus_ack_wait_ms: u64,
    pub bus_max_deliver: u32,
    pub bus_batch_size: usize,
    pub bus_block_ms: u64,
    pub bus_stream_max_len: usize,
    pub bus_workers: usize,

    pub pointer_policy: PointerPolicy,
    pub fanout_deliver_to_author: bool,
    pub presence_ttl_secs: u64,

    /// Outbound frames buffered per connection before writes count as failed
    pub ws_send_buffer: usize,
    pub ws_heartbeat_interval_secs: u64,
    pub ws_client_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://127.0.0.1:6379".into(),
            port: 3000,
            instance_id: Uuid::new_v4().to_string(),
            run_migrations: true,
            db_max_connections: 20,
            db_connect_timeout_secs: 5,
            bus_ack_wait_ms: 5_000,
            bus_max_deliver: 10,
            bus_batch_size: 64,
            bus_block_ms: 5_000,
            bus_stream_max_len: 100_000,
            bus_workers: 4,
            pointer_policy: PointerPolicy::default(),
            fanout_deliver_to_author: false,
            presence_ttl_secs: 120,
            ws_send_buffer: 256,
            ws_heartbeat_interval_secs: 5,
            ws_client_timeout_secs: 30,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let defaults = Self::default();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let instance_id = env::var("INSTANCE_ID")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or(defaults.instance_id);
        let pointer_policy = match env::var("POINTER_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.pointer_policy,
        };

        let config = Self {
            database_url,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            port: parse_env("PORT", defaults.port),
            instance_id,
            run_migrations: parse_env("RUN_MIGRATIONS", defaults.run_migrations),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            db_connect_timeout_secs: parse_env(
                "DB_CONNECT_TIMEOUT_SECS",
                defaults.db_connect_timeout_secs,
            ),
            bus_ack_wait_ms: parse_env("BUS_ACK_WAIT_MS", defaults.bus_ack_wait_ms),
            bus_max_deliver: parse_env("BUS_MAX_DELIVER", defaults.bus_max_deliver),
            bus_batch_size: parse_env("BUS_BATCH_SIZE", defaults.bus_batch_size),
            bus_block_ms: parse_env("BUS_BLOCK_MS", defaults.bus_block_ms),
            bus_stream_max_len: parse_env("BUS_STREAM_MAX_LEN", defaults.bus_stream_max_len),
            bus_workers: parse_env("BUS_WORKERS", defaults.bus_workers),
            pointer_policy,
            fanout_deliver_to_author: parse_env(
                "FANOUT_DELIVER_TO_AUTHOR",
                defaults.fanout_deliver_to_author,
            ),
            presence_ttl_secs: parse_env("PRESENCE_TTL_SECS", defaults.presence_ttl_secs),
            ws_send_buffer: parse_env("WS_SEND_BUFFER", defaults.ws_send_buffer),
            ws_heartbeat_interval_secs: parse_env(
                "WS_HEARTBEAT_INTERVAL_SECS",
                defaults.ws_heartbeat_interval_secs,
            ),
            ws_client_timeout_secs: parse_env(
                "WS_CLIENT_TIMEOUT_SECS",
                defaults.ws_client_timeout_secs,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.ws_send_buffer == 0 {
            return Err(AppError::Config("WS_SEND_BUFFER must be at least 1".into()));
        }
        if self.ws_client_timeout_secs <= self.ws_heartbeat_interval_secs {
            return Err(AppError::Config(
                "WS_CLIENT_TIMEOUT_SECS must exceed WS_HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }
        self.bus_config().validate()?;
        Ok(())
    }

    /// Bus retry policy plus the stream catalogue.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            ack_wait: Duration::from_millis(self.bus_ack_wait_ms),
            max_deliver: self.bus_max_deliver,
            batch_size: self.bus_batch_size,
            block: Duration::from_millis(self.bus_block_ms),
            max_len: self.bus_stream_max_len,
            workers: self.bus_workers,
            ..BusConfig::with_streams(stream_catalogue())
        }
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_client_timeout_secs)
    }
}
