// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending-operation queue.
//!
//! Entries are ordered by priority (highest first) and then by admission
//! sequence, so each tier is FIFO. An entry is only handed out once its
//! `not_before` time has passed; backoff and breaker deferrals just move
//! that time forward.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::types::{OperationOutcome, Priority, SyncOperation};
use crate::error::Result;

pub(crate) type Responder = oneshot::Sender<Result<OperationOutcome>>;

pub(crate) struct QueuedOperation {
    pub op: SyncOperation,
    pub seq: u64,
    pub not_before: Instant,
    /// Times an open breaker pushed this entry back
    pub deferrals: u32,
    pub responder: Responder,
}

/// What the dependency check says about a queued entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DependencyState {
    Satisfied,
    Waiting,
    Failed(String),
}

pub(crate) enum Dequeued {
    Ready(QueuedOperation),
    DependencyFailed(QueuedOperation, String),
}

type QueueKey = (Reverse<Priority>, u64);

#[derive(Default)]
pub(crate) struct PendingQueue {
    entries: BTreeMap<QueueKey, QueuedOperation>,
}

impl PendingQueue {
    pub fn push(&mut self, entry: QueuedOperation) {
        self.entries.insert((Reverse(entry.op.priority), entry.seq), entry);
    }

    /// Highest-priority entry that is due and not waiting on a dependency.
    /// An entry whose dependency failed is removed and returned as such.
    pub fn pop_ready<F>(&mut self, now: Instant, mut dependencies: F) -> Option<Dequeued>
    where
        F: FnMut(&SyncOperation) -> DependencyState,
    {
        let mut chosen = None;
        for (key, entry) in &self.entries {
            if entry.not_before > now {
                continue;
            }
            match dependencies(&entry.op) {
                DependencyState::Satisfied => {
                    chosen = Some((*key, None));
                    break;
                }
                DependencyState::Failed(dep) => {
                    chosen = Some((*key, Some(dep)));
                    break;
                }
                DependencyState::Waiting => {}
            }
        }
        let (key, failed_dep) = chosen?;
        let entry = self.entries.remove(&key)?;
        Some(match failed_dep {
            None => Dequeued::Ready(entry),
            Some(dep) => Dequeued::DependencyFailed(entry, dep),
        })
    }

    /// Earliest future `not_before`, for the dispatcher's sleep.
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.entries.values().map(|e| e.not_before).filter(|t| *t > now).min()
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.entries.values().any(|e| e.op.id == operation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<QueuedOperation> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Whether any queued entry lists `operation_id` as a dependency.
    pub fn awaits(&self, operation_id: &str) -> bool {
        self.entries.values().any(|e| e.op.dependencies.iter().any(|d| d == operation_id))
    }
}

/// Finished operations and whether they succeeded, oldest first.
///
/// Holds at most `capacity` ids plus the ones a queued entry still depends
/// on; those stay pinned until their dependents have been dispatched.
pub(crate) struct FinishedLog {
    outcomes: HashMap<String, bool>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FinishedLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn get(&self, operation_id: &str) -> Option<bool> {
        self.outcomes.get(operation_id).copied()
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.outcomes.contains_key(operation_id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Record an outcome, then forget the oldest unpinned ids past capacity.
    pub fn record<P>(&mut self, operation_id: &str, succeeded: bool, pinned: P)
    where
        P: Fn(&str) -> bool,
    {
        if self.outcomes.insert(operation_id.to_string(), succeeded).is_none() {
            self.order.push_back(operation_id.to_string());
        }
        let mut kept = Vec::new();
        while self.outcomes.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            if pinned(&oldest) {
                kept.push(oldest);
            } else {
                self.outcomes.remove(&oldest);
            }
        }
        for id in kept.into_iter().rev() {
            self.order.push_front(id);
        }
    }
}
