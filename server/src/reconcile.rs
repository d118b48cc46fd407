//! Reference client timeline. Any client of the sync API has to behave like
//! this: provisional entries are matched by idempotency key only, polled
//! deltas merge by sequence, and failed sends are surfaced, never retried.

use std::{collections::BTreeMap, future::Future, time::Duration};

use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    sync::MessageDelta,
    types::{new_id, Message},
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("message could not be sent: {cause}")]
    SendFailed {
        idempotency_key: String,
        /// Handed back so the user can resend it.
        content: String,
        cause: String,
    },
    #[error("no pending message with key {0}")]
    UnknownKey(String),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Provisional {
    pub placeholder_id: String,
    pub idempotency_key: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry<'a> {
    Confirmed(&'a Message),
    Pending(&'a Provisional),
}

#[derive(Debug, Default)]
pub struct Timeline {
    confirmed: BTreeMap<i64, Message>,
    pending: Vec<Provisional>,
    cursor: i64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence to pass as `after` on the next poll. Only deltas move it.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn pending(&self) -> &[Provisional] {
        &self.pending
    }

    /// Stages an outgoing message under a fresh idempotency key.
    pub fn stage(&mut self, content: impl Into<String>) -> Provisional {
        let provisional = Provisional {
            placeholder_id: format!("local-{}", new_id()),
            idempotency_key: new_id(),
            content: content.into(),
        };
        self.pending.push(provisional.clone());
        provisional
    }

    /// Applies the server's echo of a send. Returns false if the key was not pending.
    pub fn confirm(&mut self, message: Message) -> bool {
        let replaced = self.take_pending(message.idempotency_key.as_deref());
        self.confirmed.entry(message.sequence).or_insert(message);
        replaced
    }

    /// Drops the provisional entry for a failed send.
    pub fn fail(&mut self, idempotency_key: &str, cause: impl ToString) -> ReconcileError {
        match self
            .pending
            .iter()
            .position(|p| p.idempotency_key == idempotency_key)
        {
            Some(index) => {
                let provisional = self.pending.remove(index);
                ReconcileError::SendFailed {
                    idempotency_key: provisional.idempotency_key,
                    content: provisional.content,
                    cause: cause.to_string(),
                }
            }
            None => ReconcileError::UnknownKey(idempotency_key.to_string()),
        }
    }

    /// Merges a polled delta. Returns how many messages were new.
    pub fn apply_delta(&mut self, delta: MessageDelta) -> usize {
        let mut added = 0;
        for message in delta.messages {
            self.cursor = self.cursor.max(message.sequence);
            self.take_pending(message.idempotency_key.as_deref());
            if let std::collections::btree_map::Entry::Vacant(slot) =
                self.confirmed.entry(message.sequence)
            {
                slot.insert(message);
                added += 1;
            }
        }
        self.cursor = self.cursor.max(delta.last_sequence);
        added
    }

    /// Confirmed messages in sequence order, then unsent ones in send order.
    pub fn entries(&self) -> Vec<TimelineEntry<'_>> {
        self.confirmed
            .values()
            .map(TimelineEntry::Confirmed)
            .chain(self.pending.iter().map(TimelineEntry::Pending))
            .collect()
    }

    fn take_pending(&mut self, key: Option<&str>) -> bool {
        let Some(key) = key else {
            return false;
        };
        let before = self.pending.len();
        self.pending.retain(|p| p.idempotency_key != key);
        self.pending.len() != before
    }
}

/// Periodic poll task. Dropping or cancelling the handle stops the timer.
pub struct Poller {
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
