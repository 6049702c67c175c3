// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection-aware, buffering log-shipping device.
//!
//! Accepts discrete log events from a producer, accumulates them into
//! per-group batches under size/time policy, and delivers batches through a
//! pluggable [`Transport`], transparently re-establishing the connection on
//! failure. Three lifecycles compose without corrupting each other: the
//! buffer (size/interval/shutdown flush triggers), the connection
//! (lazy-establish, teardown on failure, reconnect on next use), and the
//! error/backpressure policy (drop vs retry on flush error, shed vs block
//! on a full buffer).

pub mod buffer;
pub mod config;
pub mod connection;
pub mod errors;
pub mod event;
mod flusher;
pub mod forwarder;
pub mod shutdown;

pub use config::ForwarderConfig;
pub use connection::{ConnectionManager, ConnectionOp, ConnectionState, Transport};
pub use errors::ForwarderError;
pub use event::{Batch, GroupKey, LogEvent};
pub use forwarder::{Forwarder, FullBufferHook};
pub use shutdown::ShutdownRegistry;
