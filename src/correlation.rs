//! Correlation store: pending commands, unclaimed results and waiting callers.
//!
//! Every operation here is synchronous and runs inside the broker's single
//! critical section, so one call observes and mutates all three maps
//! atomically.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::types::{Command, CommandId, CommandResult};

/// What an awaiting caller eventually receives.
pub type Settlement = Result<Value, BrokerError>;

/// Convert a stored result into what its awaiting caller sees.
pub fn settlement_of(result: CommandResult) -> Settlement {
    match result.error {
        Some(error) => Err(BrokerError::CommandFailed(error)),
        None => Ok(result.result),
    }
}

struct PendingCommand {
    seq: u64,
    command: Command,
}

struct Waiter {
    sender: oneshot::Sender<Settlement>,
    deadline: Instant,
}

impl Waiter {
    fn settle(self, id: &CommandId, settlement: Settlement) -> bool {
        let delivered = self.sender.send(settlement).is_ok();
        if !delivered {
            debug!("waiter for {id} went away before settlement");
        }
        delivered
    }
}

/// How a submitted result was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    /// Handed straight to the awaiting caller.
    Delivered,
    /// Stored for a later await on a known command.
    Stored,
    /// No pending command or waiter knew the id; stored anyway.
    Orphaned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_commands: usize,
    pub purged_results: usize,
    pub expired_waiters: usize,
    pub abandoned_waiters: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub pending: usize,
    pub resolved: usize,
    pub waiters: usize,
}

pub struct CorrelationStore {
    pending: HashMap<CommandId, PendingCommand>,
    resolved: HashMap<CommandId, CommandResult>,
    waiters: HashMap<CommandId, Waiter>,
    next_seq: u64,
    max_active_lifetime: Duration,
    max_result_retention: Duration,
}

impl CorrelationStore {
    pub fn new(max_active_lifetime: Duration, max_result_retention: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            resolved: HashMap::new(),
            waiters: HashMap::new(),
            next_seq: 0,
            max_active_lifetime,
            max_result_retention,
        }
    }

    /// True when `id` is held as either a pending command or a result.
    pub fn contains(&self, id: &CommandId) -> bool {
        self.pending.contains_key(id) || self.resolved.contains_key(id)
    }

    pub fn put(&mut self, command: Command) -> Result<(), BrokerError> {
        if self.contains(&command.id) {
            return Err(BrokerError::DuplicateId(command.id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .insert(command.id.clone(), PendingCommand { seq, command });
        Ok(())
    }

    pub fn take_result(&mut self, id: &CommandId) -> Option<CommandResult> {
        self.resolved.remove(id)
    }

    pub fn is_pending(&self, id: &CommandId) -> bool {
        self.pending.contains_key(id)
    }

    /// Register the single waiter for `id`.
    ///
    /// A previous waiter whose receiver has been dropped no longer counts and
    /// is replaced.
    pub fn register_waiter(
        &mut self,
        id: &CommandId,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Settlement>, BrokerError> {
        if self
            .waiters
            .get(id)
            .is_some_and(|waiter| !waiter.sender.is_closed())
        {
            return Err(BrokerError::AlreadyAwaiting(id.clone()));
        }
        let (sender, receiver) = oneshot::channel();
        self.waiters.insert(id.clone(), Waiter { sender, deadline });
        Ok(receiver)
    }

    /// Remove a waiter without settling it. Returns false when something
    /// else already settled or removed it.
    pub fn release_waiter(&mut self, id: &CommandId) -> bool {
        self.waiters.remove(id).is_some()
    }

    pub fn submit_result(&mut self, result: CommandResult) -> SubmitDisposition {
        let id = result.id.clone();
        let was_pending = self.pending.remove(&id).is_some();

        if let Some(waiter) = self.waiters.remove(&id) {
            if waiter.settle(&id, settlement_of(result.clone())) {
                return SubmitDisposition::Delivered;
            }
        }

        let orphaned = !was_pending && !self.resolved.contains_key(&id);
        if self.resolved.insert(id.clone(), result).is_some() {
            debug!("result for {id} replaced an unclaimed earlier result");
        }
        if orphaned {
            warn!("stored result for unknown command id {id}");
            SubmitDisposition::Orphaned
        } else {
            SubmitDisposition::Stored
        }
    }

    pub fn cancel(&mut self, id: &CommandId) -> bool {
        let removed_pending = self.pending.remove(id).is_some();
        let removed_result = self.resolved.remove(id).is_some();
        let removed_waiter = match self.waiters.remove(id) {
            Some(waiter) => {
                waiter.settle(id, Err(BrokerError::Canceled(id.clone())));
                true
            }
            None => false,
        };
        removed_pending || removed_result || removed_waiter
    }

    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let max_active = self.max_active_lifetime;
        let max_retention = self.max_result_retention;

        let mut expired = Vec::new();
        self.pending.retain(|id, entry| {
            let age = now.saturating_duration_since(entry.command.created_at);
            if age > max_active {
                warn!(
                    "expiring command {id} ({}) after {}ms without a result",
                    entry.command.name,
                    age.as_millis()
                );
                expired.push(id.clone());
                false
            } else {
                true
            }
        });
        report.expired_commands = expired.len();
        for id in expired {
            if let Some(waiter) = self.waiters.remove(&id) {
                waiter.settle(&id, Err(BrokerError::Timeout(id.clone())));
                report.expired_waiters += 1;
            }
        }

        self.resolved.retain(|id, result| {
            let age = now.saturating_duration_since(result.produced_at);
            if age > max_retention {
                debug!("purging unclaimed result {id}");
                report.purged_results += 1;
                false
            } else {
                true
            }
        });

        self.waiters.retain(|id, waiter| {
            if waiter.sender.is_closed() {
                debug!("dropping abandoned waiter for {id}");
                report.abandoned_waiters += 1;
                false
            } else {
                true
            }
        });
        let overdue = self
            .waiters
            .iter()
            .filter(|(_, waiter)| now >= waiter.deadline)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in overdue {
            if let Some(waiter) = self.waiters.remove(&id) {
                waiter.settle(&id, Err(BrokerError::Timeout(id.clone())));
                report.expired_waiters += 1;
            }
        }

        report
    }

    /// Pending commands in the order they were issued.
    pub fn pending_snapshot(&self) -> Vec<Command> {
        let mut rows = self.pending.values().collect::<Vec<_>>();
        rows.sort_by_key(|entry| entry.seq);
        rows.into_iter().map(|entry| entry.command.clone()).collect()
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            pending: self.pending.len(),
            resolved: self.resolved.len(),
            waiters: self.waiters.len(),
        }
    }
}
