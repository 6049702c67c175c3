// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lazy connect/reconnect state machine around a pluggable transport.

use crate::errors::ForwarderError;
use crate::event::Batch;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Boxed future returned by a [`ConnectionManager::with_connection`] action.
pub type ConnectionOp<'a, R> =
    Pin<Box<dyn Future<Output = Result<R, ForwarderError>> + Send + 'a>>;

/// Wire-level collaborator the forwarder ships batches through.
///
/// Every concrete transport must supply `connect`; there is no default
/// body, so an output type that cannot connect does not compile.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Live transport resource produced by a successful `connect`.
    type Conn: Send + 'static;

    /// Establish the transport resource.
    async fn connect(&self) -> Result<Self::Conn, ForwarderError>;

    /// Write one batch over an established connection.
    async fn write_batch(
        &self,
        conn: &mut Self::Conn,
        batch: &Batch,
    ) -> Result<(), ForwarderError>;

    /// Tear down the transport resource.
    async fn close(&self, conn: Self::Conn);
}

/// Connection lifecycle of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport resource exists.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// A live transport resource is held.
    Connected,
}

/// Owns the single transport handle and the connect/teardown state machine.
///
/// The handle never leaves the manager; callers run against it through
/// [`Self::with_connection`].
pub struct ConnectionManager<T: Transport> {
    transport: T,
    conn: Option<T::Conn>,
    state: ConnectionState,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            conn: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Establish the transport resource if none is held.
    pub async fn connect(&mut self) -> Result<(), ForwarderError> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        debug!("Establishing transport connection");
        match self.transport.connect().await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Tear down the transport resource. Closing an already-closed
    /// connection is a no-op.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("Closing transport connection");
            self.transport.close(conn).await;
        }
        self.state = ConnectionState::Disconnected;
    }

    /// `close` followed by `connect`. Never flushes.
    pub async fn reconnect(&mut self) -> Result<(), ForwarderError> {
        self.close().await;
        self.connect().await
    }

    /// Run `op` with a guaranteed-live connection.
    ///
    /// Connects first when disconnected, propagating the failure. Any error
    /// out of `connect` or `op` is logged, force-closes the connection
    /// without flushing, and is returned to the caller, so no half-dead
    /// handle survives a failure. When `cancel` is supplied, the connect
    /// attempt and `op` both race the token; a cancelled operation tears
    /// the checked-out handle down through `Transport::close` like any
    /// other failure. There is no retry loop here; the next flush trigger
    /// is the retry.
    pub async fn with_connection<R, F>(
        &mut self,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> Result<R, ForwarderError>
    where
        F: for<'a> FnOnce(&'a T, &'a mut T::Conn) -> ConnectionOp<'a, R>,
    {
        let connected = match cancel {
            Some(cancel) => tokio::select! {
                result = self.connect() => result,
                _ = cancel.cancelled() => Err(ForwarderError::Connection(
                    "device closed during connect".to_string(),
                )),
            },
            None => self.connect().await,
        };
        if let Err(e) = connected {
            error!("Failed to establish connection: {e}");
            self.close().await;
            return Err(e);
        }
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                return Err(ForwarderError::Connection(
                    "connection handle lost".to_string(),
                ))
            }
        };
        // Checked out: the manager reads as disconnected until the handle
        // is returned on success
        self.state = ConnectionState::Disconnected;
        let result = match cancel {
            Some(cancel) => tokio::select! {
                result = op(&self.transport, &mut conn) => result,
                _ = cancel.cancelled() => Err(ForwarderError::Transport(
                    "device closed during transport operation".to_string(),
                )),
            },
            None => op(&self.transport, &mut conn).await,
        };
        match result {
            Ok(result) => {
                self.conn = Some(conn);
                self.state = ConnectionState::Connected;
                Ok(result)
            }
            Err(e) => {
                error!("Transport operation failed: {e}");
                self.transport.close(conn).await;
                Err(e)
            }
        }
    }
}
