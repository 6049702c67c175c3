// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pure per-group accumulation engine.
//!
//! Holds pending events and decides when a flush is due; it performs no
//! I/O, never sleeps, and never applies policy. Shedding, backpressure,
//! and delivery live one layer up in the forwarder.

use crate::event::{Batch, GroupKey, LogEvent};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Outcome of offering an event to the buffer.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Event enqueued. `flush_due` is true when the group just reached the
    /// size threshold.
    Buffered { flush_due: bool },
    /// The group is at capacity; the event is handed back untouched so the
    /// caller can apply the full-buffer policy.
    Full(LogEvent),
}

struct GroupBuffer {
    pending: VecDeque<LogEvent>,
    first_pending_at: Instant,
}

pub struct EventBuffer {
    max_items: usize,
    max_interval: Option<Duration>,
    groups: HashMap<GroupKey, GroupBuffer>,
}

impl EventBuffer {
    pub fn new(max_items: usize, max_interval: Option<Duration>) -> Self {
        Self {
            max_items,
            max_interval,
            groups: HashMap::new(),
        }
    }

    /// Offer one event to the group's pending sequence.
    pub fn receive(&mut self, event: LogEvent, group: &GroupKey) -> ReceiveOutcome {
        if let Some(buffer) = self.groups.get(group) {
            if buffer.pending.len() >= self.max_items {
                return ReceiveOutcome::Full(event);
            }
        }

        let buffer = self
            .groups
            .entry(group.clone())
            .or_insert_with(|| GroupBuffer {
                pending: VecDeque::new(),
                first_pending_at: Instant::now(),
            });
        buffer.pending.push_back(event);

        ReceiveOutcome::Buffered {
            flush_due: buffer.pending.len() >= self.max_items,
        }
    }

    /// Atomically swap out a group's pending sequence into a batch.
    pub fn take_batch(&mut self, group: &GroupKey) -> Option<Batch> {
        let buffer = self.groups.remove(group)?;
        Some(Batch::new(
            group.clone(),
            buffer.pending.into(),
            buffer.first_pending_at,
        ))
    }

    /// Batches for every group whose oldest pending event has aged past
    /// `max_interval`. Empty when no interval is configured.
    pub fn take_due_batches(&mut self, now: Instant) -> Vec<Batch> {
        let Some(max_interval) = self.max_interval else {
            return Vec::new();
        };
        let due: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, buffer)| {
                now.saturating_duration_since(buffer.first_pending_at) >= max_interval
            })
            .map(|(group, _)| group.clone())
            .collect();
        due.iter().filter_map(|group| self.take_batch(group)).collect()
    }

    /// Drain every group.
    pub fn take_all_batches(&mut self) -> Vec<Batch> {
        let groups: Vec<GroupKey> = self.groups.keys().cloned().collect();
        groups
            .iter()
            .filter_map(|group| self.take_batch(group))
            .collect()
    }

    /// Return a failed batch's events to the front of its group, ahead of
    /// anything that arrived while the flush attempt was in flight.
    pub fn requeue(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let first_pending_at = batch.first_pending_at();
        let group = batch.group().clone();
        let buffer = self.groups.entry(group).or_insert_with(|| GroupBuffer {
            pending: VecDeque::new(),
            first_pending_at,
        });
        // Requeued events predate everything currently pending
        buffer.first_pending_at = first_pending_at;
        for event in batch.into_events().into_iter().rev() {
            buffer.pending.push_front(event);
        }
    }

    pub fn pending_in_group(&self, group: &GroupKey) -> usize {
        self.groups
            .get(group)
            .map(|buffer| buffer.pending.len())
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.groups.values().map(|buffer| buffer.pending.len()).sum()
    }

    pub fn has_pending(&self) -> bool {
        self.total_pending() > 0
    }
}
