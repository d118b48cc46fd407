//! Repository wrapper for tests that need a write to fail part-way through
//! an operation.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{Appended, ClaimOutcome, MemoryRepository, Repository, TicketInsert};
use crate::{
    error::{StoreError, StoreResult},
    types::{
        Conversation, ConversationStatus, Message, MessageDraft, PageRequest, Ticket,
        TicketFilter, TicketPage, Workload,
    },
};

/// Delegates to a `MemoryRepository`, failing the named operations a set
/// number of times with `StoreError::Unavailable`.
#[derive(Default)]
pub struct FlakyRepository {
    inner: MemoryRepository,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(op, times);
    }

    fn check(&self, op: &'static str) -> StoreResult<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Unavailable(format!("{op} failed")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.check("insert_conversation")?;
        self.inner.insert_conversation(conversation).await
    }

    async fn conversation(&self, id: &str) -> StoreResult<Conversation> {
        self.check("conversation")?;
        self.inner.conversation(id).await
    }

    async fn list_conversations(&self, customer_id: Option<&str>) -> StoreResult<Vec<Conversation>> {
        self.check("list_conversations")?;
        self.inner.list_conversations(customer_id).await
    }

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StoreResult<Conversation> {
        self.check("set_conversation_status")?;
        self.inner.set_conversation_status(id, status).await
    }

    async fn set_title_if_missing(&self, id: &str, title: &str) -> StoreResult<()> {
        self.check("set_title_if_missing")?;
        self.inner.set_title_if_missing(id, title).await
    }

    async fn set_offer_pending(&self, id: &str, pending: bool) -> StoreResult<bool> {
        self.check("set_offer_pending")?;
        self.inner.set_offer_pending(id, pending).await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> StoreResult<Appended> {
        self.check("append_message")?;
        self.inner.append_message(conversation_id, draft).await
    }

    async fn messages_since(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        self.check("messages_since")?;
        self.inner
            .messages_since(conversation_id, after_sequence, limit)
            .await
    }

    async fn insert_ticket_if_none_active(&self, ticket: &Ticket) -> StoreResult<TicketInsert> {
        self.check("insert_ticket_if_none_active")?;
        self.inner.insert_ticket_if_none_active(ticket).await
    }

    async fn ticket(&self, id: &str) -> StoreResult<Ticket> {
        self.check("ticket")?;
        self.inner.ticket(id).await
    }

    async fn active_ticket(&self, conversation_id: &str) -> StoreResult<Option<Ticket>> {
        self.check("active_ticket")?;
        self.inner.active_ticket(conversation_id).await
    }

    async fn update_ticket_versioned(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> StoreResult<Option<Ticket>> {
        self.check("update_ticket_versioned")?;
        self.inner.update_ticket_versioned(ticket, expected_version).await
    }

    async fn claim_ticket(&self, id: &str, agent_id: &str) -> StoreResult<ClaimOutcome> {
        self.check("claim_ticket")?;
        self.inner.claim_ticket(id, agent_id).await
    }

    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        page: PageRequest,
    ) -> StoreResult<TicketPage> {
        self.check("list_tickets")?;
        self.inner.list_tickets(filter, page).await
    }

    async fn workload(&self, agent_id: &str) -> StoreResult<Workload> {
        self.check("workload")?;
        self.inner.workload(agent_id).await
    }
}
