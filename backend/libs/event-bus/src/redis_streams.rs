//! Redis Streams backend.
//!
//! - one stream key per configured stream (`stream:<name>`), trimmed
//!   approximately to `max_len` on every append
//! - a subscription is a consumer group: exclusive subscriptions get a group
//!   of their own (`<durable>.<instance>`), competing ones share the named group
//! - new entries are read with `XREADGROUP ... >`; entries left unacknowledged
//!   for longer than `ack_wait` are taken back with `XAUTOCLAIM`, which both
//!   retries failed handlers and recovers work from crashed members
//! - entries that reached `max_deliver` are copied to `<key>:dlq` and acked
//!
//! Requires Redis 6.2+ (`XAUTOCLAIM`).

use crate::subject;
use crate::subscription::{dispatch, Outcome, ShutdownGroup, StopSignal, Teardown};
use crate::{BusConfig, BusError, BusResult, Event, EventBus, EventHandler, Subscription};
use async_trait::async_trait;
use futures::FutureExt;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use redis::{Client, RedisResult, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Stream key naming convention
pub fn stream_key(stream_name: &str) -> String {
    format!("stream:{}", stream_name.to_lowercase())
}

pub fn dead_letter_key(stream_name: &str) -> String {
    format!("{}:dlq", stream_key(stream_name))
}

struct ConsumerSpec {
    stream_name: String,
    stream_key: String,
    group: String,
    consumer: String,
    filter: String,
}

struct StreamEntry {
    id: String,
    subject: Option<String>,
    payload: Vec<u8>,
}

impl StreamEntry {
    fn from_fields(id: String, fields: &HashMap<String, Vec<u8>>) -> Self {
        Self {
            id,
            subject: fields
                .get("subject")
                .map(|raw| String::from_utf8_lossy(raw).into_owned()),
            payload: fields.get("payload").cloned().unwrap_or_default(),
        }
    }
}

/// [`EventBus`] backed by Redis Streams consumer groups.
pub struct RedisStreamsBus {
    client: Client,
    publisher: ConnectionManager,
    config: Arc<BusConfig>,
    instance_id: String,
    shutdown: ShutdownGroup,
}

impl RedisStreamsBus {
    /// `instance_id` must be stable across restarts of the same replica so its
    /// exclusive groups (and their pending entries) are picked up again.
    pub async fn connect(
        redis_url: &str,
        instance_id: impl Into<String>,
        config: BusConfig,
    ) -> BusResult<Self> {
        config.validate()?;
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let instance_id = instance_id.into();

        info!(
            instance_id = %instance_id,
            streams = config.streams.len(),
            "connected Redis Streams event bus"
        );

        Ok(Self {
            client,
            publisher,
            config: Arc::new(config),
            instance_id,
            shutdown: ShutdownGroup::new(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Number of delivered-but-unacknowledged entries of `group` on `stream_name`.
    pub async fn pending_count(&self, stream_name: &str, group: &str) -> BusResult<u64> {
        let mut conn = self.publisher.clone();
        let summary: Vec<Value> = redis::cmd("XPENDING")
            .arg(stream_key(stream_name))
            .arg(group)
            .query_async::<_, Vec<Value>>(&mut conn)
            .await?;
        match summary.first() {
            Some(count) => Ok(redis::from_redis_value(count)?),
            None => Ok(0),
        }
    }

    /// Number of dead-lettered entries for `stream_name`.
    pub async fn dead_letter_count(&self, stream_name: &str) -> BusResult<u64> {
        let mut conn = self.publisher.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(dead_letter_key(stream_name))
            .query_async::<_, u64>(&mut conn)
            .await?;
        Ok(len)
    }

    async fn subscribe(
        &self,
        group: String,
        consumer_prefix: String,
        filter: &str,
        exclusive: bool,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        if self.shutdown.is_closed() {
            return Err(BusError::Closed);
        }
        subject::validate_pattern(filter)?;
        let stream_name = self.config.stream_for(filter)?.name.clone();
        let key = stream_key(&stream_name);

        let mut conn = self.publisher.clone();
        ensure_group(&mut conn, &key, &group).await?;

        let (stop_tx, _) = watch::channel(false);
        let workers = self.config.workers_for(exclusive);
        let mut consumers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let stop = self.shutdown.worker_signal(&stop_tx)?;
            let spec = Arc::new(ConsumerSpec {
                stream_name: stream_name.clone(),
                stream_key: key.clone(),
                group: group.clone(),
                consumer: format!("{consumer_prefix}-{i}"),
                filter: filter.to_string(),
            });
            consumers.push(spec.consumer.clone());
            handles.push(tokio::spawn(run_consumer(
                self.client.clone(),
                Arc::clone(&self.config),
                spec,
                Arc::clone(&handler),
                stop,
            )));
        }

        let teardown_conn = self.publisher.clone();
        let teardown_key = key.clone();
        let teardown_group = group.clone();
        let teardown: Teardown = Box::new(move || {
            async move {
                let mut conn = teardown_conn;
                if exclusive {
                    redis::cmd("XGROUP")
                        .arg("DESTROY")
                        .arg(&teardown_key)
                        .arg(&teardown_group)
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                    return Ok(());
                }
                for consumer in consumers {
                    let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
                        .arg(&teardown_key)
                        .arg(&teardown_group)
                        .arg("-")
                        .arg("+")
                        .arg(1)
                        .arg(&consumer)
                        .query_async::<_, Vec<(String, String, u64, u64)>>(&mut conn)
                        .await?;
                    // Entries still pending stay with the consumer so other
                    // group members can claim them.
                    if pending.is_empty() {
                        redis::cmd("XGROUP")
                            .arg("DELCONSUMER")
                            .arg(&teardown_key)
                            .arg(&teardown_group)
                            .arg(&consumer)
                            .query_async::<_, ()>(&mut conn)
                            .await?;
                    }
                }
                Ok(())
            }
            .boxed()
        });

        info!(
            stream = %stream_name,
            group = %group,
            subject = %filter,
            exclusive,
            workers,
            "subscribed to Redis stream"
        );
        Ok(Subscription::new(group, stop_tx, handles, Some(teardown)))
    }
}

#[async_trait]
impl EventBus for RedisStreamsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<String> {
        if subject.split('.').any(|t| t == "*" || t == ">") {
            return Err(BusError::InvalidConfig(format!(
                "cannot publish to wildcard subject {subject}"
            )));
        }
        let stream = self.config.stream_for(subject)?;
        let mut conn = self.publisher.clone();

        let id = redis::cmd("XADD")
            .arg(stream_key(&stream.name))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_len)
            .arg("*")
            .arg("subject")
            .arg(subject)
            .arg("payload")
            .arg(payload)
            .arg("published_at")
            .arg(chrono::Utc::now().timestamp_millis())
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| {
                error!(subject = %subject, error = %e, "failed to append event to stream");
                BusError::BrokerUnavailable(e.to_string())
            })?;

        debug!(subject = %subject, event_id = %id, "event published");
        Ok(id)
    }

    async fn subscribe_exclusive(
        &self,
        durable: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        self.subscribe(
            format!("{durable}.{}", self.instance_id),
            self.instance_id.clone(),
            subject,
            true,
            handler,
        )
        .await
    }

    async fn subscribe_competing(
        &self,
        group: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        self.subscribe(
            group.to_string(),
            self.instance_id.clone(),
            subject,
            false,
            handler,
        )
        .await
    }

    async fn drain(&self) -> BusResult<()> {
        self.shutdown.drain().await;
        info!(instance_id = %self.instance_id, "Redis Streams bus drained");
        Ok(())
    }
}

/// Create the consumer group at the stream tail (idempotent).
async fn ensure_group(conn: &mut ConnectionManager, key: &str, group: &str) -> BusResult<()> {
    let created = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(key)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async::<_, ()>(conn)
        .await;

    match created {
        Ok(()) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_consumer(
    client: Client,
    config: Arc<BusConfig>,
    spec: Arc<ConsumerSpec>,
    handler: Arc<dyn EventHandler>,
    mut stop: StopSignal,
) {
    let mut backoff = INITIAL_BACKOFF;

    // Dedicated connection: blocking reads would stall a shared multiplexed one.
    let mut conn = loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => break conn,
            Err(e) => {
                warn!(consumer = %spec.consumer, error = %e, "stream consumer cannot connect, retrying");
                if sleep_or_stop(backoff, &mut stop).await {
                    return;
                }
                backoff = (backoff * 2).min(config.reconnect_backoff_max);
            }
        }
    };
    backoff = INITIAL_BACKOFF;

    debug!(consumer = %spec.consumer, group = %spec.group, "stream consumer started");
    loop {
        if stop.is_stopped() {
            break;
        }
        match poll_once(&mut conn, &config, &spec, handler.as_ref(), &mut stop).await {
            Ok(()) => backoff = INITIAL_BACKOFF,
            Err(e) => {
                warn!(
                    consumer = %spec.consumer,
                    group = %spec.group,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "stream consumer error, backing off"
                );
                if sleep_or_stop(backoff, &mut stop).await {
                    break;
                }
                backoff = (backoff * 2).min(config.reconnect_backoff_max);
            }
        }
    }
    debug!(consumer = %spec.consumer, group = %spec.group, "stream consumer stopped");
}

/// Returns `true` when stopped during the sleep.
async fn sleep_or_stop(duration: Duration, stop: &mut StopSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => stop.is_stopped(),
        _ = stop.stopped() => true,
    }
}

async fn poll_once(
    conn: &mut ConnectionManager,
    config: &BusConfig,
    spec: &ConsumerSpec,
    handler: &dyn EventHandler,
    stop: &mut StopSignal,
) -> RedisResult<()> {
    let claimed = autoclaim(conn, config, spec).await?;
    if !claimed.is_empty() {
        let attempts = delivery_counts(conn, spec, &claimed).await?;
        for entry in claimed {
            if stop.is_stopped() {
                return Ok(());
            }
            let attempt = attempts.get(&entry.id).copied().unwrap_or(2);
            process_entry(conn, config, spec, handler, entry, attempt).await?;
        }
    }

    let mut read_cmd = redis::cmd("XREADGROUP");
    read_cmd
        .arg("GROUP")
        .arg(&spec.group)
        .arg(&spec.consumer)
        .arg("COUNT")
        .arg(config.batch_size)
        .arg("BLOCK")
        .arg(config.block.as_millis() as u64)
        .arg("STREAMS")
        .arg(&spec.stream_key)
        .arg(">");

    let reply = tokio::select! {
        reply = read_cmd.query_async::<_, Option<StreamReadReply>>(conn) => reply?,
        _ = stop.stopped() => return Ok(()),
    };

    let Some(reply) = reply else {
        return Ok(());
    };
    for key in reply.keys {
        for stream_id in key.ids {
            if stop.is_stopped() {
                return Ok(());
            }
            let entry = StreamEntry {
                subject: stream_id.get::<String>("subject"),
                payload: stream_id.get::<Vec<u8>>("payload").unwrap_or_default(),
                id: stream_id.id,
            };
            process_entry(conn, config, spec, handler, entry, 1).await?;
        }
    }
    Ok(())
}

async fn process_entry(
    conn: &mut ConnectionManager,
    config: &BusConfig,
    spec: &ConsumerSpec,
    handler: &dyn EventHandler,
    entry: StreamEntry,
    attempt: u32,
) -> RedisResult<()> {
    let subject = match entry.subject.as_deref() {
        Some(s) if subject::matches(&spec.filter, s) => s.to_string(),
        // Another subject on the same stream: not ours to handle.
        _ => return ack(conn, spec, &entry.id).await,
    };

    if attempt > config.max_deliver {
        dead_letter(conn, config, spec, &entry, &subject, attempt, "max deliveries exceeded").await?;
        return ack(conn, spec, &entry.id).await;
    }

    let event = Event {
        id: entry.id.clone(),
        subject: subject.clone(),
        payload: entry.payload.clone(),
        attempt,
    };

    match dispatch(handler, &event, &spec.consumer).await {
        Outcome::Ack => ack(conn, spec, &entry.id).await,
        Outcome::Nack(reason) if attempt >= config.max_deliver => {
            dead_letter(conn, config, spec, &entry, &subject, attempt, &reason).await?;
            ack(conn, spec, &entry.id).await
        }
        Outcome::Nack(_) => {
            // Left in the pending list; XAUTOCLAIM redelivers it after ack_wait.
            Ok(())
        }
    }
}

async fn ack(conn: &mut ConnectionManager, spec: &ConsumerSpec, id: &str) -> RedisResult<()> {
    redis::cmd("XACK")
        .arg(&spec.stream_key)
        .arg(&spec.group)
        .arg(id)
        .query_async::<_, ()>(conn)
        .await
}

async fn dead_letter(
    conn: &mut ConnectionManager,
    config: &BusConfig,
    spec: &ConsumerSpec,
    entry: &StreamEntry,
    subject: &str,
    attempt: u32,
    reason: &str,
) -> RedisResult<()> {
    error!(
        stream = %spec.stream_name,
        group = %spec.group,
        event_id = %entry.id,
        attempts = attempt,
        reason = %reason,
        "event exceeded max deliveries, dead-lettering"
    );
    redis::cmd("XADD")
        .arg(dead_letter_key(&spec.stream_name))
        .arg("MAXLEN")
        .arg("~")
        .arg(config.max_len)
        .arg("*")
        .arg("subject")
        .arg(subject)
        .arg("payload")
        .arg(&entry.payload)
        .arg("source_id")
        .arg(&entry.id)
        .arg("group")
        .arg(&spec.group)
        .arg("attempts")
        .arg(attempt)
        .arg("reason")
        .arg(reason)
        .query_async::<_, String>(conn)
        .await
        .map(|_| ())
}

/// Take over entries of this group idle for longer than `ack_wait`.
async fn autoclaim(
    conn: &mut ConnectionManager,
    config: &BusConfig,
    spec: &ConsumerSpec,
) -> RedisResult<Vec<StreamEntry>> {
    let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
        .arg(&spec.stream_key)
        .arg(&spec.group)
        .arg(&spec.consumer)
        .arg(config.ack_wait.as_millis() as u64)
        .arg("0-0")
        .arg("COUNT")
        .arg(config.batch_size)
        .query_async::<_, Vec<Value>>(conn)
        .await?;

    let Some(raw_entries) = reply.get(1) else {
        return Ok(Vec::new());
    };
    let entries: Vec<(String, Option<HashMap<String, Vec<u8>>>)> =
        redis::from_redis_value(raw_entries)?;

    Ok(entries
        .into_iter()
        .filter_map(|(id, fields)| fields.map(|f| StreamEntry::from_fields(id, &f)))
        .collect())
}

/// Delivery counter per claimed entry, as tracked by the broker.
async fn delivery_counts(
    conn: &mut ConnectionManager,
    spec: &ConsumerSpec,
    entries: &[StreamEntry],
) -> RedisResult<HashMap<String, u32>> {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Ok(HashMap::new());
    };
    let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
        .arg(&spec.stream_key)
        .arg(&spec.group)
        .arg(&first.id)
        .arg(&last.id)
        .arg(entries.len())
        .arg(&spec.consumer)
        .query_async::<_, Vec<(String, String, u64, u64)>>(conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(id, _consumer, _idle_ms, deliveries)| (id, deliveries as u32))
        .collect())
}
