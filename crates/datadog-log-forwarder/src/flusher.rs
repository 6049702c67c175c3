// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::EventBuffer;
use crate::connection::{ConnectionManager, Transport};
use crate::errors::ForwarderError;
use crate::event::{Batch, GroupKey};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// Placeholder period when no interval trigger is configured; the tick
// branch is disabled in that case and the value never matters.
const DISABLED_TICK: Duration = Duration::from_secs(3600);

/// Drives flushes for the device: the background size/interval loop and the
/// synchronous flush entry points share this one send path.
///
/// Lock hierarchy: the connection mutex is taken before any buffer mutex
/// access, and the buffer mutex is never held across an await on the
/// connection. Swapping a batch out under the connection lock keeps
/// concurrent flush entry points from reordering batches within a group.
pub(crate) struct Flusher<T: Transport> {
    buffer: Arc<Mutex<EventBuffer>>,
    connection: Arc<Mutex<ConnectionManager<T>>>,
    drop_on_flush_error: bool,
    max_interval: Option<Duration>,
    cancel: CancellationToken,
}

impl<T: Transport> Clone for Flusher<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            connection: Arc::clone(&self.connection),
            drop_on_flush_error: self.drop_on_flush_error,
            max_interval: self.max_interval,
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Transport> Flusher<T> {
    pub(crate) fn new(
        buffer: Arc<Mutex<EventBuffer>>,
        connection: Arc<Mutex<ConnectionManager<T>>>,
        drop_on_flush_error: bool,
        max_interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            connection,
            drop_on_flush_error,
            max_interval,
            cancel,
        }
    }

    /// Flush whatever is pending for one group, now.
    pub(crate) async fn flush_group(&self, group: &GroupKey) -> Result<(), ForwarderError> {
        let mut connection = self.connection.lock().await;
        let batch = { self.buffer.lock().await.take_batch(group) };
        match batch {
            Some(batch) => self.send_batch(&mut connection, batch, true).await,
            None => Ok(()),
        }
    }

    /// Flush every group whose oldest pending event has aged past the
    /// configured interval.
    async fn flush_aged(&self) {
        let mut connection = self.connection.lock().await;
        let batches = { self.buffer.lock().await.take_due_batches(Instant::now()) };
        for batch in batches {
            if let Err(e) = self.send_batch(&mut connection, batch, true).await {
                error!("Interval flush failed: {e}");
            }
        }
    }

    /// Drain every group. `finale` marks the shutdown flush, which must not
    /// be interrupted by the cancellation token.
    pub(crate) async fn flush_all(&self, finale: bool) -> Result<(), ForwarderError> {
        let mut connection = self.connection.lock().await;
        let batches = { self.buffer.lock().await.take_all_batches() };
        let mut first_err = None;
        for batch in batches {
            if let Err(e) = self.send_batch(&mut connection, batch, !finale).await {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    error!("Flush failed: {e}");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send_batch(
        &self,
        connection: &mut ConnectionManager<T>,
        batch: Batch,
        interruptible: bool,
    ) -> Result<(), ForwarderError> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!(
            "Flushing {} events for group {:?} (buffered for {:?})",
            batch.len(),
            batch.group(),
            batch.buffered_for()
        );

        // Save a copy for the failure path
        let retry_copy = batch.clone();

        // The connection manager tears the handle down if the token fires
        // mid-operation; here a cancelled send is just a failed one
        let cancel = interruptible.then_some(&self.cancel);
        let result = connection
            .with_connection(cancel, move |transport, conn| {
                Box::pin(async move { transport.write_batch(conn, &batch).await })
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.drop_on_flush_error {
                    error!(
                        "Dropping {} events for group {:?} after failed flush: {e}",
                        retry_copy.len(),
                        retry_copy.group()
                    );
                } else {
                    warn!(
                        "Returning {} events for group {:?} to the buffer after failed flush: {e}",
                        retry_copy.len(),
                        retry_copy.group()
                    );
                    self.buffer.lock().await.requeue(retry_copy);
                }
                Err(e)
            }
        }
    }

    /// Size-trigger and interval loop. Runs until the token is cancelled or
    /// the signal channel closes; a final flush is the device's job, not
    /// this loop's.
    pub(crate) async fn run(self, mut flush_rx: mpsc::UnboundedReceiver<GroupKey>) {
        debug!("Flush loop started");
        let mut tick = tokio::time::interval(self.max_interval.unwrap_or(DISABLED_TICK));
        tick.tick().await; // discard first tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = flush_rx.recv() => match signal {
                    Some(group) => {
                        if let Err(e) = self.flush_group(&group).await {
                            error!("Size-triggered flush failed: {e}");
                        }
                    }
                    None => break,
                },
                _ = tick.tick(), if self.max_interval.is_some() => self.flush_aged().await,
            }
        }
        debug!("Flush loop stopped");
    }
}
