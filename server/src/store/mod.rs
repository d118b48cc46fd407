//! Persistence seam for conversations, messages and tickets.
//!
//! Every invariant that has to hold under concurrent writers is pushed down
//! into a single repository call so that each engine can enforce it with its
//! own primitive:
//!
//! - `append_message`: per-conversation serialization point (gapless sequence,
//!   idempotency-key dedup).
//! - `insert_ticket_if_none_active`: conditional insert keyed by conversation.
//! - `update_ticket_versioned`: compare-and-set on `version`.
//! - `claim_ticket`: compare-and-set on a null `agent_id`.
//! - `set_offer_pending`: compare-and-set on the offer flag.

mod memory;
mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::{StoreError, StoreResult},
    types::{
        Conversation, ConversationStatus, Message, MessageDraft, PageRequest, Ticket,
        TicketFilter, TicketPage, Workload,
    },
};

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub message: Message,
    /// False when an earlier message with the same idempotency key was returned.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TicketInsert {
    Created(Ticket),
    /// Another active ticket already existed; nothing was written.
    Existing(Ticket),
}

impl TicketInsert {
    pub fn ticket(&self) -> &Ticket {
        match self {
            Self::Created(ticket) | Self::Existing(ticket) => ticket,
        }
    }

    pub fn into_parts(self) -> (Ticket, bool) {
        match self {
            Self::Created(ticket) => (ticket, true),
            Self::Existing(ticket) => (ticket, false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimOutcome {
    pub ticket: Ticket,
    /// This call set `agent_id`.
    pub claimed: bool,
    /// This call moved the ticket from open to in_progress.
    pub started: bool,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()>;

    async fn conversation(&self, id: &str) -> StoreResult<Conversation>;

    /// Newest first. `None` lists every conversation.
    async fn list_conversations(&self, customer_id: Option<&str>) -> StoreResult<Vec<Conversation>>;

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StoreResult<Conversation>;

    async fn set_title_if_missing(&self, id: &str, title: &str) -> StoreResult<()>;

    /// Sets the offer flag to `pending` only if it currently equals `!pending`.
    /// Returns whether this call changed it.
    async fn set_offer_pending(&self, id: &str, pending: bool) -> StoreResult<bool>;

    async fn append_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> StoreResult<Appended>;

    async fn messages_since(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Message>>;

    async fn insert_ticket_if_none_active(&self, ticket: &Ticket) -> StoreResult<TicketInsert>;

    async fn ticket(&self, id: &str) -> StoreResult<Ticket>;

    async fn active_ticket(&self, conversation_id: &str) -> StoreResult<Option<Ticket>>;

    /// Writes `ticket` only if the stored version still equals `expected_version`.
    /// `None` means someone else got there first.
    async fn update_ticket_versioned(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> StoreResult<Option<Ticket>>;

    /// Sets `agent_id` if unset and moves `open` to `in_progress`, atomically.
    /// Finished tickets are returned untouched.
    async fn claim_ticket(&self, id: &str, agent_id: &str) -> StoreResult<ClaimOutcome>;

    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        page: PageRequest,
    ) -> StoreResult<TicketPage>;

    async fn workload(&self, agent_id: &str) -> StoreResult<Workload>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
/// Only `StoreError::Unavailable` is retried.
pub async fn with_retry<T, F, Fut>(label: &'static str, policy: RetryPolicy, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(op = label, attempt, error = %err, "transient storage failure, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Wraps another repository with bounded retries on transient failures.
///
/// Appends without an idempotency key go through exactly once: a lost
/// response may hide a committed row, and retrying would duplicate it.
pub struct RetryingRepository {
    inner: Arc<dyn Repository>,
    policy: RetryPolicy,
}

impl RetryingRepository {
    pub fn new(inner: Arc<dyn Repository>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Repository for RetryingRepository {
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        with_retry("insert_conversation", self.policy, || {
            self.inner.insert_conversation(conversation)
        })
        .await
    }

    async fn conversation(&self, id: &str) -> StoreResult<Conversation> {
        with_retry("conversation", self.policy, || self.inner.conversation(id)).await
    }

    async fn list_conversations(&self, customer_id: Option<&str>) -> StoreResult<Vec<Conversation>> {
        with_retry("list_conversations", self.policy, || {
            self.inner.list_conversations(customer_id)
        })
        .await
    }

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StoreResult<Conversation> {
        with_retry("set_conversation_status", self.policy, || {
            self.inner.set_conversation_status(id, status)
        })
        .await
    }

    async fn set_title_if_missing(&self, id: &str, title: &str) -> StoreResult<()> {
        with_retry("set_title_if_missing", self.policy, || {
            self.inner.set_title_if_missing(id, title)
        })
        .await
    }

    async fn set_offer_pending(&self, id: &str, pending: bool) -> StoreResult<bool> {
        with_retry("set_offer_pending", self.policy, || {
            self.inner.set_offer_pending(id, pending)
        })
        .await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> StoreResult<Appended> {
        if draft.idempotency_key.is_none() {
            return self.inner.append_message(conversation_id, draft).await;
        }
        with_retry("append_message", self.policy, || {
            self.inner.append_message(conversation_id, draft)
        })
        .await
    }

    async fn messages_since(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        with_retry("messages_since", self.policy, || {
            self.inner.messages_since(conversation_id, after_sequence, limit)
        })
        .await
    }

    async fn insert_ticket_if_none_active(&self, ticket: &Ticket) -> StoreResult<TicketInsert> {
        with_retry("insert_ticket_if_none_active", self.policy, || {
            self.inner.insert_ticket_if_none_active(ticket)
        })
        .await
    }

    async fn ticket(&self, id: &str) -> StoreResult<Ticket> {
        with_retry("ticket", self.policy, || self.inner.ticket(id)).await
    }

    async fn active_ticket(&self, conversation_id: &str) -> StoreResult<Option<Ticket>> {
        with_retry("active_ticket", self.policy, || {
            self.inner.active_ticket(conversation_id)
        })
        .await
    }

    async fn update_ticket_versioned(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> StoreResult<Option<Ticket>> {
        with_retry("update_ticket_versioned", self.policy, || {
            self.inner.update_ticket_versioned(ticket, expected_version)
        })
        .await
    }

    async fn claim_ticket(&self, id: &str, agent_id: &str) -> StoreResult<ClaimOutcome> {
        with_retry("claim_ticket", self.policy, || {
            self.inner.claim_ticket(id, agent_id)
        })
        .await
    }

    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        page: PageRequest,
    ) -> StoreResult<TicketPage> {
        with_retry("list_tickets", self.policy, || {
            self.inner.list_tickets(filter, page)
        })
        .await
    }

    async fn workload(&self, agent_id: &str) -> StoreResult<Workload> {
        with_retry("workload", self.policy, || self.inner.workload(agent_id)).await
    }
}
