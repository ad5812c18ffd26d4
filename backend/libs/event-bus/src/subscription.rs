//! Subscription handles, cooperative shutdown and the handler boundary.

use crate::{BusError, BusResult, Event, EventHandler};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Broker-side cleanup run after an unsubscribe has drained the workers.
pub(crate) type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, BusResult<()>> + Send>;

/// Handle to a running subscription.
///
/// Dropping the handle stops its workers at the next event boundary; call
/// [`Subscription::drain`] to wait for them.
pub struct Subscription {
    name: String,
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    teardown: Option<Teardown>,
}

impl Subscription {
    pub(crate) fn new(
        name: String,
        stop: watch::Sender<bool>,
        workers: Vec<JoinHandle<()>>,
        teardown: Option<Teardown>,
    ) -> Self {
        Self {
            name,
            stop,
            workers,
            teardown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting deliveries and wait for in-flight handlers to finish.
    /// Broker-side state is kept so unacknowledged events are redelivered.
    pub async fn drain(mut self) -> BusResult<()> {
        self.stop_workers().await;
        info!(subscription = %self.name, "subscription drained");
        Ok(())
    }

    /// Drain, then release the broker-side consumer resources.
    pub async fn unsubscribe(mut self) -> BusResult<()> {
        self.stop_workers().await;
        if let Some(teardown) = self.teardown.take() {
            teardown().await?;
        }
        info!(subscription = %self.name, "unsubscribed");
        Ok(())
    }

    async fn stop_workers(&mut self) {
        self.stop.send_replace(true);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!(subscription = %self.name, error = %e, "subscription worker aborted");
            }
        }
    }
}

/// Combined stop signal for a worker: its own subscription and the whole bus.
pub(crate) struct StopSignal {
    subscription: watch::Receiver<bool>,
    bus: watch::Receiver<bool>,
    _in_flight: mpsc::Sender<()>,
}

impl StopSignal {
    pub(crate) fn is_stopped(&self) -> bool {
        *self.subscription.borrow()
            || *self.bus.borrow()
            || self.subscription.has_changed().is_err()
    }

    /// Resolves once either signal fires (or its sender is gone).
    pub(crate) async fn stopped(&mut self) {
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            _ = self.subscription.changed() => {}
            _ = self.bus.changed() => {}
        }
    }
}

/// Tracks every worker spawned by a bus so `drain` can wait for all of them.
///
/// Each worker holds a clone of `in_flight`; once the bus drops its own sender
/// the receiver yields `None` when the last worker exits.
pub(crate) struct ShutdownGroup {
    signal: watch::Sender<bool>,
    in_flight: Mutex<Option<mpsc::Sender<()>>>,
    done: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl ShutdownGroup {
    pub(crate) fn new() -> Self {
        let (signal, _) = watch::channel(false);
        let (tx, rx) = mpsc::channel(1);
        Self {
            signal,
            in_flight: Mutex::new(Some(tx)),
            done: tokio::sync::Mutex::new(rx),
        }
    }

    /// Stop signal for one worker of the subscription owning `subscription`.
    pub(crate) fn worker_signal(
        &self,
        subscription: &watch::Sender<bool>,
    ) -> BusResult<StopSignal> {
        let guard = self
            .in_flight
            .lock()
            .map_err(|_| BusError::Closed)?;
        let in_flight = guard.as_ref().ok_or(BusError::Closed)?.clone();
        Ok(StopSignal {
            subscription: subscription.subscribe(),
            bus: self.signal.subscribe(),
            _in_flight: in_flight,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.in_flight
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    pub(crate) async fn drain(&self) {
        self.signal.send_replace(true);
        if let Ok(mut guard) = self.in_flight.lock() {
            guard.take();
        }
        let mut done = self.done.lock().await;
        while done.recv().await.is_some() {}
        debug!("all bus workers stopped");
    }
}

/// Outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ack,
    Nack(String),
}

/// Run `handler` for one delivery. Errors and panics are contained here and
/// turned into a nack; they never reach the worker loop.
pub(crate) async fn dispatch(handler: &dyn EventHandler, event: &Event, consumer: &str) -> Outcome {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => Outcome::Ack,
        Ok(Err(e)) => {
            warn!(
                consumer = %consumer,
                event_id = %event.id,
                subject = %event.subject,
                attempt = event.attempt,
                error = %e,
                "event handler failed, scheduling redelivery"
            );
            Outcome::Nack(e.to_string())
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                consumer = %consumer,
                event_id = %event.id,
                subject = %event.subject,
                attempt = event.attempt,
                panic = %reason,
                "event handler panicked, scheduling redelivery"
            );
            Outcome::Nack(format!("handler panicked: {reason}"))
        }
    }
}
