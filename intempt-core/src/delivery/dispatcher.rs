//! Background delivery worker
//!
//! One worker per client drains the [`EventQueue`] strictly in order. A batch
//! that fails transiently goes back to the head of the queue and is retried
//! after a backoff; nothing behind it is sent until it is delivered, rejected
//! or out of retries.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::context::ClientContext;
use crate::error::{Error, NetworkErrorKind, Result};
use crate::queue::{EventQueue, QueueEntry};
use crate::types::Event;

use super::payload::BatchRequest;
use super::transport::{Transport, TransportError};

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// The ceiling doubles per retry up to `max`; the delay is drawn from
    /// the upper half of it.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let ceiling = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }
        let half = ceiling_ms / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
    }
}

/// Handle to a running worker; used to stop it on teardown
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Ask the worker to stop. A send already on the wire is allowed to
    /// finish; no further sends or retries are scheduled.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum Drain {
    Empty,
    Stopped,
}

/// Drains the queue and submits batches to the transport
pub struct DeliveryDispatcher {
    context: Arc<ClientContext>,
    queue: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    max_retries: u32,
    timeout: Duration,
    flush_interval: Duration,
    backoff: Backoff,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryDispatcher {
    /// Start the worker on `runtime`
    pub fn spawn(
        context: Arc<ClientContext>,
        queue: Arc<EventQueue>,
        transport: Arc<dyn Transport>,
        config: &DeliveryConfig,
        runtime: &Handle,
    ) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Self {
            context,
            queue,
            transport,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            timeout: config.timeout(),
            flush_interval: config.flush_interval(),
            backoff: Backoff::from_config(config),
            shutdown: shutdown_rx,
        };
        let task = runtime.spawn(dispatcher.run());
        DispatcherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Run until shutdown is requested
    pub async fn run(mut self) {
        info!(tracker_id = %self.context.tracker_id(), "Delivery worker started");

        loop {
            if self.is_shutting_down() {
                break;
            }
            if let Drain::Stopped = self.drain().await {
                break;
            }

            let flush_interval = self.flush_interval;
            let queue = self.queue.clone();
            tokio::select! {
                _ = queue.notified() => {}
                _ = tokio::time::sleep(flush_interval) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        info!(
            tracker_id = %self.context.tracker_id(),
            pending = self.queue.len(),
            "Delivery worker stopped"
        );
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Send batches until the queue is empty or shutdown is requested
    async fn drain(&mut self) -> Drain {
        // Size of a batch that was put back for retry; the same entries are
        // taken again so later events do not ride along.
        let mut retry_len: Option<usize> = None;

        loop {
            if self.is_shutting_down() {
                return Drain::Stopped;
            }

            let mut batch = self.queue.take_batch(retry_len.unwrap_or(self.batch_size));
            if batch.is_empty() {
                return Drain::Empty;
            }
            retry_len = None;

            for entry in batch.iter_mut() {
                entry.attempt_count += 1;
            }
            let attempts = batch.iter().map(|e| e.attempt_count).max().unwrap_or(1);

            let request = self.build_request(&batch);
            match self.send_batch(request).await {
                Ok(()) => {
                    debug!(events = batch.len(), attempts, "Delivered batch");
                    self.queue.stats().record_delivered(batch.len());
                    for entry in batch {
                        entry.resolve(Ok(()));
                    }
                }
                Err(Error::Network {
                    kind: NetworkErrorKind::Transient,
                    message,
                }) if attempts <= self.max_retries => {
                    let delay = self.backoff.delay(attempts);
                    warn!(
                        events = batch.len(),
                        attempt = attempts,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient delivery failure, will retry"
                    );
                    let surviving = self.queue.requeue_front(batch);
                    retry_len = (surviving > 0).then_some(surviving);
                    if !self.wait(delay).await {
                        return Drain::Stopped;
                    }
                }
                Err(Error::Network { kind, message }) => {
                    let message = match kind {
                        NetworkErrorKind::Transient => {
                            format!("gave up after {} attempts: {}", attempts, message)
                        }
                        NetworkErrorKind::Permanent => message,
                    };
                    warn!(
                        events = batch.len(),
                        kind = %kind,
                        error = %message,
                        "Dropping undeliverable batch"
                    );
                    self.queue.stats().record_failed(batch.len());
                    for entry in batch {
                        entry.resolve(Err(Error::Network {
                            kind,
                            message: message.clone(),
                        }));
                    }
                }
                Err(other) => {
                    warn!(events = batch.len(), error = %other, "Dropping undeliverable batch");
                    self.queue.stats().record_failed(batch.len());
                    let message = other.to_string();
                    for entry in batch {
                        entry.resolve(Err(Error::permanent(message.clone())));
                    }
                }
            }
        }
    }

    /// Sleep for `delay`; false if shutdown arrived first
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_shutting_down(),
            _ = self.shutdown.changed() => false,
        }
    }

    fn build_request(&self, batch: &[QueueEntry]) -> BatchRequest {
        let events: Vec<&Event> = batch.iter().map(|entry| &entry.event).collect();
        let visitor_id = events[0].visitor_id;
        BatchRequest::new(&self.context, visitor_id, &events)
    }

    /// One submission of one batch, classified into success or a network error
    async fn send_batch(&self, request: BatchRequest) -> Result<()> {
        let transport = self.transport.clone();
        let timeout = self.timeout;
        // Separate task so a panicking transport surfaces as a JoinError
        let sent = tokio::spawn(async move {
            tokio::time::timeout(timeout, async { transport.send(&request).await }).await
        })
        .await;

        match sent {
            Err(join_error) => Err(Error::transient(format!(
                "transport task failed: {}",
                join_error
            ))),
            Ok(Err(_elapsed)) => Err(Error::transient(format!(
                "request timed out after {:?}",
                timeout
            ))),
            Ok(Ok(Err(TransportError::InvalidRequest(message)))) => {
                Err(Error::permanent(format!("invalid request: {}", message)))
            }
            Ok(Ok(Err(e))) => Err(Error::transient(e.to_string())),
            Ok(Ok(Ok(response))) if response.is_success() => Ok(()),
            Ok(Ok(Ok(response))) => {
                let message = format!("API error ({}): {}", response.status, response.body);
                match response.failure_kind() {
                    NetworkErrorKind::Transient => Err(Error::transient(message)),
                    NetworkErrorKind::Permanent => Err(Error::permanent(message)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        let first = backoff.delay(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

        let third = backoff.delay(3);
        assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));

        for retry in 5..40 {
            assert!(backoff.delay(retry) <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_backoff_zero_base() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::ZERO);
    }
}
