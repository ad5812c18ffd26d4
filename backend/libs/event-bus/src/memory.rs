//! Single-process bus with the same delivery semantics as the Redis backend.
//!
//! Every stream is an append-only log. Consumer groups keep a cursor into the
//! log plus a queue of events waiting for redelivery; workers of all members of
//! a group pull from the same cursor, which is what load-balances a competing
//! group. The log is not trimmed, so this backend suits tests and embedded use.

use crate::subject;
use crate::subscription::{dispatch, Outcome, ShutdownGroup, StopSignal, Teardown};
use crate::{BusConfig, BusError, BusResult, Event, EventBus, EventHandler, Subscription};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info};

struct LogEntry {
    subject: String,
    payload: Vec<u8>,
}

struct Redelivery {
    seq: usize,
    attempt: u32,
}

struct GroupState {
    filter: String,
    cursor: usize,
    redeliveries: VecDeque<Redelivery>,
    members: usize,
    wake: watch::Sender<u64>,
}

impl GroupState {
    fn new(filter: &str, cursor: usize) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            filter: filter.to_string(),
            cursor,
            redeliveries: VecDeque::new(),
            members: 0,
            wake,
        }
    }

    fn notify(&self) {
        self.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

#[derive(Default)]
struct StreamState {
    log: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
    dead_letters: Vec<Event>,
}

struct Shared {
    config: BusConfig,
    streams: Mutex<HashMap<String, StreamState>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_delivery(&self, stream: &str, group: &str) -> Option<Event> {
        let mut streams = self.lock();
        let state = streams.get_mut(stream)?;
        let StreamState { log, groups, .. } = state;
        let group = groups.get_mut(group)?;

        if let Some(redelivery) = group.redeliveries.pop_front() {
            let entry = &log[redelivery.seq];
            return Some(Event {
                id: redelivery.seq.to_string(),
                subject: entry.subject.clone(),
                payload: entry.payload.clone(),
                attempt: redelivery.attempt,
            });
        }

        while group.cursor < log.len() {
            let seq = group.cursor;
            group.cursor += 1;
            let entry = &log[seq];
            if subject::matches(&group.filter, &entry.subject) {
                return Some(Event {
                    id: seq.to_string(),
                    subject: entry.subject.clone(),
                    payload: entry.payload.clone(),
                    attempt: 1,
                });
            }
        }
        None
    }

    fn nack(self: &Arc<Self>, stream: &str, group: &str, event: Event, reason: String) {
        if event.attempt >= self.config.max_deliver {
            error!(
                stream = %stream,
                group = %group,
                event_id = %event.id,
                attempts = event.attempt,
                reason = %reason,
                "event exceeded max deliveries, dead-lettering"
            );
            if let Some(state) = self.lock().get_mut(stream) {
                state.dead_letters.push(event);
            }
            return;
        }

        let Ok(seq) = event.id.parse::<usize>() else {
            return;
        };
        let delay = self.config.redelivery_delay(event.attempt);
        let shared = Arc::clone(self);
        let stream = stream.to_string();
        let group = group.to_string();
        let attempt = event.attempt + 1;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut streams = shared.lock();
            if let Some(group_state) = streams
                .get_mut(&stream)
                .and_then(|s| s.groups.get_mut(&group))
            {
                group_state.redeliveries.push_back(Redelivery { seq, attempt });
                group_state.notify();
            }
        });
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    stream: String,
    group: String,
    consumer: String,
    handler: Arc<dyn EventHandler>,
    mut stop: StopSignal,
    mut wake: watch::Receiver<u64>,
) {
    debug!(consumer = %consumer, group = %group, "in-memory consumer started");
    loop {
        if stop.is_stopped() {
            break;
        }
        wake.borrow_and_update();

        match shared.next_delivery(&stream, &group) {
            Some(event) => {
                if let Outcome::Nack(reason) = dispatch(handler.as_ref(), &event, &consumer).await {
                    shared.nack(&stream, &group, event, reason);
                }
            }
            None => {
                tokio::select! {
                    changed = wake.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop.stopped() => break,
                }
            }
        }
    }
    debug!(consumer = %consumer, group = %group, "in-memory consumer stopped");
}

/// In-process [`EventBus`].
pub struct InMemoryBus {
    shared: Arc<Shared>,
    shutdown: ShutdownGroup,
    exclusive_seq: AtomicU64,
}

impl InMemoryBus {
    pub fn new(config: BusConfig) -> Self {
        let streams = config
            .streams
            .iter()
            .map(|s| (s.name.clone(), StreamState::default()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                config,
                streams: Mutex::new(streams),
            }),
            shutdown: ShutdownGroup::new(),
            exclusive_seq: AtomicU64::new(0),
        }
    }

    /// Events that exhausted their deliveries on `stream`.
    pub fn dead_letters(&self, stream: &str) -> Vec<Event> {
        self.shared
            .lock()
            .get(stream)
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Number of events appended to `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.shared
            .lock()
            .get(stream)
            .map(|s| s.log.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    async fn subscribe(
        &self,
        group: String,
        filter: &str,
        exclusive: bool,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        if self.shutdown.is_closed() {
            return Err(BusError::Closed);
        }
        subject::validate_pattern(filter)?;
        let stream = self.shared.config.stream_for(filter)?.name.clone();
        let workers = self.shared.config.workers_for(exclusive);

        let (stop_tx, _) = watch::channel(false);
        let stops = (0..workers)
            .map(|_| self.shutdown.worker_signal(&stop_tx))
            .collect::<BusResult<Vec<_>>>()?;
        let mut receivers = Vec::with_capacity(workers);
        {
            let mut streams = self.shared.lock();
            let state = streams.entry(stream.clone()).or_default();
            let cursor = state.log.len();
            let group_state = state
                .groups
                .entry(group.clone())
                .or_insert_with(|| GroupState::new(filter, cursor));
            if group_state.filter != filter {
                return Err(BusError::InvalidConfig(format!(
                    "group {group} is bound to {} not {filter}",
                    group_state.filter
                )));
            }
            group_state.members += 1;
            for _ in 0..workers {
                receivers.push(group_state.wake.subscribe());
            }
        }

        let mut handles = Vec::with_capacity(workers);
        for (i, (wake, stop)) in receivers.into_iter().zip(stops).enumerate() {
            handles.push(tokio::spawn(run_worker(
                Arc::clone(&self.shared),
                stream.clone(),
                group.clone(),
                format!("{group}/{i}"),
                Arc::clone(&handler),
                stop,
                wake,
            )));
        }

        let shared = Arc::clone(&self.shared);
        let teardown_stream = stream.clone();
        let teardown_group = group.clone();
        let teardown: Teardown = Box::new(move || {
            async move {
                let mut streams = shared.lock();
                if let Some(state) = streams.get_mut(&teardown_stream) {
                    let remove = match state.groups.get_mut(&teardown_group) {
                        Some(g) => {
                            g.members = g.members.saturating_sub(1);
                            exclusive
                        }
                        None => false,
                    };
                    if remove {
                        state.groups.remove(&teardown_group);
                    }
                }
                Ok(())
            }
            .boxed()
        });

        info!(stream = %stream, group = %group, subject = %filter, exclusive, "subscribed");
        Ok(Subscription::new(group, stop_tx, handles, Some(teardown)))
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<String> {
        if subject.split('.').any(|t| t == "*" || t == ">") {
            return Err(BusError::InvalidConfig(format!(
                "cannot publish to wildcard subject {subject}"
            )));
        }
        let stream = self.shared.config.stream_for(subject)?.name.clone();

        let mut streams = self.shared.lock();
        let state = streams.entry(stream).or_default();
        let seq = state.log.len();
        state.log.push(LogEntry {
            subject: subject.to_string(),
            payload,
        });
        for group in state.groups.values() {
            group.notify();
        }
        Ok(seq.to_string())
    }

    async fn subscribe_exclusive(
        &self,
        durable: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        let n = self.exclusive_seq.fetch_add(1, Ordering::Relaxed);
        self.subscribe(format!("{durable}#{n}"), subject, true, handler)
            .await
    }

    async fn subscribe_competing(
        &self,
        group: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        self.subscribe(group.to_string(), subject, false, handler)
            .await
    }

    async fn drain(&self) -> BusResult<()> {
        self.shutdown.drain().await;
        info!("in-memory bus drained");
        Ok(())
    }
}
