//! Read side for polling clients: ticket lists, conversation snapshots and
//! message deltas, plus the ETag helpers that make unchanged polls cheap.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{
    conversation::ConversationStore,
    error::{CoreError, CoreResult},
    types::{Actor, Conversation, Message, PageRequest, Ticket, TicketFilter, TicketPage, TicketStatus},
};

/// How often each kind of view should poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Chat window and ticket detail.
    pub interactive: Duration,
    /// Dashboard badges and counters.
    pub passive: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interactive: Duration::from_secs(5),
            passive: Duration::from_secs(10),
        }
    }
}

impl PollPolicy {
    pub fn to_json(&self) -> Value {
        json!({
            "interactiveMs": self.interactive.as_millis() as u64,
            "passiveMs": self.passive.as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation: Conversation,
    pub ticket: Option<Ticket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelta {
    pub messages: Vec<Message>,
    /// Cursor to send as `after` on the next poll.
    pub last_sequence: i64,
}

/// Strong ETag over a serialized response body.
pub fn etag_for(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(body)))
}

/// `If-None-Match` semantics: any listed tag (or `*`) matching means 304.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == "*" || tag == etag)
}

#[derive(Clone)]
pub struct SyncGateway {
    conversations: ConversationStore,
    policy: PollPolicy,
}

impl SyncGateway {
    pub fn new(conversations: ConversationStore, policy: PollPolicy) -> Self {
        Self {
            conversations,
            policy,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub async fn list_tickets(
        &self,
        actor: &Actor,
        filter: &TicketFilter,
        page: PageRequest,
    ) -> CoreResult<TicketPage> {
        actor.require_staff()?;
        Ok(self
            .conversations
            .repository()
            .list_tickets(filter, page)
            .await?)
    }

    /// Badge count for the agent dashboard.
    pub async fn open_ticket_count(&self, actor: &Actor) -> CoreResult<u64> {
        let filter = TicketFilter {
            status: Some(TicketStatus::Open),
            ..TicketFilter::default()
        };
        let page = self
            .list_tickets(actor, &filter, PageRequest { page: 1, limit: 1 })
            .await?;
        Ok(page.total)
    }

    pub async fn get_ticket(&self, actor: &Actor, id: &str) -> CoreResult<Ticket> {
        let ticket = self
            .conversations
            .repository()
            .ticket(id)
            .await
            .map_err(CoreError::from_store("ticket"))?;
        ticket.ensure_visible_to(actor)?;
        Ok(ticket)
    }

    pub async fn get_conversation(&self, actor: &Actor, id: &str) -> CoreResult<ConversationView> {
        let repo = self.conversations.repository();
        let (conversation, ticket) = futures_util::try_join!(
            self.conversations.get(id),
            async { repo.active_ticket(id).await.map_err(CoreError::from) },
        )?;
        conversation.ensure_visible_to(actor)?;
        Ok(ConversationView {
            conversation,
            ticket,
        })
    }

    pub async fn messages_since(
        &self,
        actor: &Actor,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> CoreResult<MessageDelta> {
        let conversation = self.conversations.get(conversation_id).await?;
        conversation.ensure_visible_to(actor)?;

        let messages = self
            .conversations
            .since(conversation_id, after_sequence, limit)
            .await?;
        let last_sequence = messages
            .last()
            .map(|m| m.sequence)
            .unwrap_or(after_sequence.max(0));
        Ok(MessageDelta {
            messages,
            last_sequence,
        })
    }

    pub async fn list_conversations(&self, actor: &Actor) -> CoreResult<Vec<Conversation>> {
        self.conversations.list(actor).await
    }
}
