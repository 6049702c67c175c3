// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The log-shipping device: buffer engine plus connection manager.
//!
//! A `Forwarder` accepts individual events, buffers them per group, and
//! ships batches through its transport when a size threshold, the age
//! interval, an explicit flush, or shutdown says so. Delivery failures
//! either drop the batch or return it to the buffer for the next trigger,
//! per configuration.

use crate::buffer::{EventBuffer, ReceiveOutcome};
use crate::config::ForwarderConfig;
use crate::connection::{ConnectionManager, ConnectionState, Transport};
use crate::errors::ForwarderError;
use crate::event::{GroupKey, LogEvent};
use crate::flusher::Flusher;
use crate::shutdown::ShutdownRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Notification invoked once per event shed on a full buffer. Observational
/// only; a panicking hook is caught and logged, never propagated.
pub type FullBufferHook = Arc<dyn Fn(&LogEvent) + Send + Sync>;

// How long a backpressured writer waits before re-attempting to free space
const RECEIVE_BACKOFF: Duration = Duration::from_millis(100);

pub struct Forwarder<T: Transport> {
    config: Arc<ForwarderConfig>,
    buffer: Arc<Mutex<EventBuffer>>,
    connection: Arc<Mutex<ConnectionManager<T>>>,
    flusher: Flusher<T>,
    flush_tx: mpsc::UnboundedSender<GroupKey>,
    cancel: CancellationToken,
    on_full_buffer: Option<FullBufferHook>,
}

impl<T: Transport> Clone for Forwarder<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            buffer: Arc::clone(&self.buffer),
            connection: Arc::clone(&self.connection),
            flusher: self.flusher.clone(),
            flush_tx: self.flush_tx.clone(),
            cancel: self.cancel.clone(),
            on_full_buffer: self.on_full_buffer.clone(),
        }
    }
}

impl<T: Transport> Forwarder<T> {
    /// Create the device and spawn its background flush loop.
    ///
    /// Must be called from within a tokio runtime. The connection is lazy:
    /// nothing is established until the first flush needs it.
    pub fn new(config: ForwarderConfig, transport: T) -> Result<Self, ForwarderError> {
        config.validate()?;
        let buffer = Arc::new(Mutex::new(EventBuffer::new(
            config.max_items,
            config.max_interval,
        )));
        let connection = Arc::new(Mutex::new(ConnectionManager::new(transport)));
        let cancel = CancellationToken::new();
        let flusher = Flusher::new(
            Arc::clone(&buffer),
            Arc::clone(&connection),
            config.drop_on_flush_error,
            config.max_interval,
            cancel.clone(),
        );
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        tokio::spawn(flusher.clone().run(flush_rx));

        Ok(Self {
            config: Arc::new(config),
            buffer,
            connection,
            flusher,
            flush_tx,
            cancel,
            on_full_buffer: None,
        })
    }

    /// Caller-supplied notification for shed events.
    pub fn set_full_buffer_hook(&mut self, hook: FullBufferHook) {
        self.on_full_buffer = Some(hook);
    }

    /// Accept one event into the default group.
    pub async fn write(&self, event: LogEvent) -> Result<(), ForwarderError> {
        self.enqueue(event, None).await
    }

    /// Accept one event routed to a named group.
    pub async fn write_grouped(
        &self,
        event: LogEvent,
        group: impl Into<String>,
    ) -> Result<(), ForwarderError> {
        self.enqueue(event, Some(group.into())).await
    }

    async fn enqueue(&self, event: LogEvent, group: GroupKey) -> Result<(), ForwarderError> {
        let mut event = event;
        loop {
            let outcome = { self.buffer.lock().await.receive(event, &group) };
            match outcome {
                ReceiveOutcome::Buffered { flush_due } => {
                    if self.config.autoflush {
                        return self.flusher.flush_group(&group).await;
                    }
                    if flush_due {
                        // Hand off to the background loop; the swap happens there
                        let _ = self.flush_tx.send(group.clone());
                    }
                    return Ok(());
                }
                ReceiveOutcome::Full(rejected) => {
                    if self.config.drop_on_full_buffer {
                        warn!("Buffer full - dropping event for group {:?}", group);
                        self.notify_full_buffer(&rejected);
                        return Ok(());
                    }
                    // Backpressure: free space by flushing the saturated
                    // group, then offer the event again
                    event = rejected;
                    if let Err(e) = self.flusher.flush_group(&group).await {
                        warn!("Flush under backpressure failed, retrying: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                            _ = self.cancel.cancelled() => {
                                return Err(ForwarderError::Transport(
                                    "device closed while backpressured".to_string(),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    fn notify_full_buffer(&self, event: &LogEvent) {
        if let Some(hook) = &self.on_full_buffer {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(event)));
            if outcome.is_err() {
                error!("Full-buffer hook panicked; notification dropped");
            }
        }
    }

    /// Drain every group now.
    pub async fn flush(&self) -> Result<(), ForwarderError> {
        self.flusher.flush_all(false).await
    }

    /// Stop the background loop, optionally drain all groups synchronously,
    /// then tear down the connection. Safe to call more than once.
    pub async fn close(&self, flush: bool) -> Result<(), ForwarderError> {
        // Stop the timer first so it cannot fire after the final flush
        self.cancel.cancel();
        let result = if flush {
            self.flusher.flush_all(true).await
        } else {
            Ok(())
        };
        self.connection.lock().await.close().await;
        result
    }

    /// Drop the current connection and establish a fresh one. Never flushes.
    pub async fn reconnect(&self) -> Result<(), ForwarderError> {
        self.connection.lock().await.reconnect().await
    }

    pub async fn connected(&self) -> bool {
        self.connection.lock().await.is_connected()
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.lock().await.state()
    }

    /// Total events currently buffered across all groups.
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.total_pending()
    }

    /// Register this device's teardown with the hosting process's shutdown
    /// sequence; the final flush follows `flush_at_exit`.
    pub fn register_at_exit(&self, registry: &ShutdownRegistry) {
        let forwarder = self.clone();
        registry.register(move || async move {
            if let Err(e) = forwarder.close(forwarder.config.flush_at_exit).await {
                error!("Flush at exit failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Transport;
    use crate::event::Batch;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        batches: Arc<StdMutex<Vec<Vec<u64>>>>,
    }

    impl RecordingTransport {
        fn batches(&self) -> Vec<Vec<u64>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        type Conn = ();

        async fn connect(&self) -> Result<(), ForwarderError> {
            Ok(())
        }

        async fn write_batch(&self, _conn: &mut (), batch: &Batch) -> Result<(), ForwarderError> {
            let values = batch
                .events()
                .iter()
                .map(|e| e.record().as_u64().unwrap())
                .collect();
            self.batches.lock().unwrap().push(values);
            Ok(())
        }

        async fn close(&self, _conn: ()) {}
    }

    fn event(value: u64) -> LogEvent {
        LogEvent::new(json!(value))
    }

    fn config(max_items: usize) -> ForwarderConfig {
        ForwarderConfig {
            max_items,
            max_interval: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_threshold_triggers_one_flush() {
        let transport = RecordingTransport::default();
        let forwarder = Forwarder::new(config(3), transport.clone()).unwrap();

        for i in 1..=3 {
            forwarder.write(event(i)).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(forwarder.pending().await, 0);
    }

    #[tokio::test]
    async fn test_below_threshold_stays_pending() {
        let transport = RecordingTransport::default();
        let forwarder = Forwarder::new(config(3), transport.clone()).unwrap();

        forwarder.write(event(1)).await.unwrap();
        forwarder.write(event(2)).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert!(transport.batches().is_empty());
        assert_eq!(forwarder.pending().await, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_buffer_drops_with_notification() {
        // maxItems=3, write 5: one flush of 3, one shed, one left pending
        let transport = RecordingTransport::default();
        let mut forwarder = Forwarder::new(config(3), transport.clone()).unwrap();

        let drops = Arc::new(AtomicUsize::new(0));
        let drop_count = Arc::clone(&drops);
        forwarder.set_full_buffer_hook(Arc::new(move |_event| {
            drop_count.fetch_add(1, Ordering::SeqCst);
        }));

        // No await points in between, so the background flush cannot run
        // until the sleep below: the fourth write sees a saturated group
        for i in 1..=4 {
            forwarder.write(event(i)).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        forwarder.write(event(5)).await.unwrap();

        assert_eq!(transport.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(forwarder.pending().await, 1);
        assert!(logs_contain("Buffer full"));
    }

    #[tokio::test]
    async fn test_full_buffer_hook_panic_is_contained() {
        let transport = RecordingTransport::default();
        let mut forwarder = Forwarder::new(config(2), transport.clone()).unwrap();
        forwarder.set_full_buffer_hook(Arc::new(|_event| panic!("misbehaving hook")));

        forwarder.write(event(1)).await.unwrap();
        forwarder.write(event(2)).await.unwrap();
        // Shed path runs the panicking hook; the write must still succeed
        forwarder.write(event(3)).await.unwrap();

        assert_eq!(forwarder.pending().await, 2);
    }

    #[tokio::test]
    async fn test_autoflush_ships_every_write() {
        let transport = RecordingTransport::default();
        let forwarder = Forwarder::new(
            ForwarderConfig {
                max_items: 100,
                max_interval: None,
                autoflush: true,
                ..Default::default()
            },
            transport.clone(),
        )
        .unwrap();

        forwarder.write(event(1)).await.unwrap();
        forwarder.write(event(2)).await.unwrap();

        assert_eq!(transport.batches(), vec![vec![1], vec![2]]);
        assert_eq!(forwarder.pending().await, 0);
    }

    #[tokio::test]
    async fn test_groups_flush_independently() {
        let transport = RecordingTransport::default();
        let forwarder = Forwarder::new(config(2), transport.clone()).unwrap();

        forwarder.write_grouped(event(1), "a").await.unwrap();
        forwarder.write_grouped(event(10), "b").await.unwrap();
        forwarder.write_grouped(event(2), "a").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        // Group "a" hit its threshold; "b" is still pending
        assert_eq!(transport.batches(), vec![vec![1, 2]]);
        assert_eq!(forwarder.pending().await, 1);
    }
}
