use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{Appended, ClaimOutcome, Repository, TicketInsert};
use crate::{
    error::{StoreError, StoreResult},
    types::{
        now_utc, new_id, Conversation, ConversationStatus, Message, MessageDraft, PageRequest,
        Ticket, TicketFilter, TicketPage, TicketStatus, Workload,
    },
};

struct ConversationLog {
    conversation: Conversation,
    messages: Vec<Message>,
    keys: HashMap<String, usize>,
}

#[derive(Default)]
struct TicketTable {
    by_id: HashMap<String, Ticket>,
    active_by_conversation: HashMap<String, String>,
}

/// Process-local repository. Each conversation log sits behind its own
/// mutex, which is the single writer that hands out sequence numbers.
#[derive(Default)]
pub struct MemoryRepository {
    conversations: RwLock<HashMap<String, Arc<Mutex<ConversationLog>>>>,
    tickets: RwLock<TicketTable>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn log(&self, id: &str) -> StoreResult<Arc<Mutex<ConversationLog>>> {
        self.conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(&conversation.id) {
            return Err(StoreError::Constraint(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        conversations.insert(
            conversation.id.clone(),
            Arc::new(Mutex::new(ConversationLog {
                conversation: conversation.clone(),
                messages: Vec::new(),
                keys: HashMap::new(),
            })),
        );
        Ok(())
    }

    async fn conversation(&self, id: &str) -> StoreResult<Conversation> {
        let log = self.log(id).await?;
        let log = log.lock().await;
        Ok(log.conversation.clone())
    }

    async fn list_conversations(&self, customer_id: Option<&str>) -> StoreResult<Vec<Conversation>> {
        let logs = {
            let conversations = self.conversations.read().await;
            conversations.values().cloned().collect::<Vec<_>>()
        };

        let mut list = Vec::with_capacity(logs.len());
        for log in logs {
            let log = log.lock().await;
            if customer_id.map_or(true, |c| log.conversation.customer_id == c) {
                list.push(log.conversation.clone());
            }
        }
        list.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(list)
    }

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StoreResult<Conversation> {
        let log = self.log(id).await?;
        let mut log = log.lock().await;
        if log.conversation.status != status {
            log.conversation.status = status;
            log.conversation.updated_at = now_utc();
        }
        Ok(log.conversation.clone())
    }

    async fn set_title_if_missing(&self, id: &str, title: &str) -> StoreResult<()> {
        let log = self.log(id).await?;
        let mut log = log.lock().await;
        if log.conversation.title.is_none() {
            log.conversation.title = Some(title.to_string());
        }
        Ok(())
    }

    async fn set_offer_pending(&self, id: &str, pending: bool) -> StoreResult<bool> {
        let log = self.log(id).await?;
        let mut log = log.lock().await;
        if log.conversation.offer_pending == pending {
            return Ok(false);
        }
        log.conversation.offer_pending = pending;
        Ok(true)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> StoreResult<Appended> {
        let log = self.log(conversation_id).await?;
        let mut log = log.lock().await;

        if let Some(key) = draft.idempotency_key.as_deref() {
            if let Some(&index) = log.keys.get(key) {
                return Ok(Appended {
                    message: log.messages[index].clone(),
                    created: false,
                });
            }
        }

        let sequence = log.conversation.last_sequence + 1;
        let message = Message {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            sequence,
            sender: draft.sender.clone(),
            content: draft.content.clone(),
            created_at: now_utc(),
            idempotency_key: draft.idempotency_key.clone(),
        };

        if let Some(key) = &message.idempotency_key {
            let index = log.messages.len();
            log.keys.insert(key.clone(), index);
        }
        log.messages.push(message.clone());
        log.conversation.last_sequence = sequence;
        log.conversation.updated_at = message.created_at;

        Ok(Appended {
            message,
            created: true,
        })
    }

    async fn messages_since(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        let log = self.log(conversation_id).await?;
        let log = log.lock().await;
        // Sequence n lives at index n - 1.
        let skip = usize::try_from(after_sequence.max(0)).unwrap_or(usize::MAX);
        let take = limit.map_or(usize::MAX, |l| l as usize);
        Ok(log
            .messages
            .iter()
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn insert_ticket_if_none_active(&self, ticket: &Ticket) -> StoreResult<TicketInsert> {
        let mut table = self.tickets.write().await;
        if let Some(existing) = table
            .active_by_conversation
            .get(&ticket.conversation_id)
            .and_then(|id| table.by_id.get(id))
        {
            return Ok(TicketInsert::Existing(existing.clone()));
        }

        table
            .active_by_conversation
            .insert(ticket.conversation_id.clone(), ticket.id.clone());
        table.by_id.insert(ticket.id.clone(), ticket.clone());
        Ok(TicketInsert::Created(ticket.clone()))
    }

    async fn ticket(&self, id: &str) -> StoreResult<Ticket> {
        self.tickets
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn active_ticket(&self, conversation_id: &str) -> StoreResult<Option<Ticket>> {
        let table = self.tickets.read().await;
        Ok(table
            .active_by_conversation
            .get(conversation_id)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    async fn update_ticket_versioned(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> StoreResult<Option<Ticket>> {
        let mut table = self.tickets.write().await;
        let current = table.by_id.get(&ticket.id).ok_or(StoreError::NotFound)?;
        if current.version != expected_version {
            return Ok(None);
        }

        let mut next = ticket.clone();
        next.version = expected_version + 1;
        if !next.status.is_active() {
            table.active_by_conversation.remove(&next.conversation_id);
        }
        table.by_id.insert(next.id.clone(), next.clone());
        Ok(Some(next))
    }

    async fn claim_ticket(&self, id: &str, agent_id: &str) -> StoreResult<ClaimOutcome> {
        let mut table = self.tickets.write().await;
        let ticket = table.by_id.get_mut(id).ok_or(StoreError::NotFound)?;
        if ticket.status.is_finished() {
            return Ok(ClaimOutcome {
                ticket: ticket.clone(),
                claimed: false,
                started: false,
            });
        }

        let claimed = ticket.agent_id.is_none();
        if claimed {
            ticket.agent_id = Some(agent_id.to_string());
        }
        let started = ticket.status == TicketStatus::Open;
        if started {
            ticket.status = TicketStatus::InProgress;
        }
        if claimed || started {
            ticket.version += 1;
            ticket.updated_at = now_utc();
        }

        Ok(ClaimOutcome {
            ticket: ticket.clone(),
            claimed,
            started,
        })
    }

    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        page: PageRequest,
    ) -> StoreResult<TicketPage> {
        let table = self.tickets.read().await;
        let mut matching = table
            .by_id
            .values()
            .filter(|t| filter.matches(t))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(TicketPage { items, total })
    }

    async fn workload(&self, agent_id: &str) -> StoreResult<Workload> {
        let table = self.tickets.read().await;
        let mut workload = Workload::default();
        for ticket in table
            .by_id
            .values()
            .filter(|t| t.agent_id.as_deref() == Some(agent_id))
        {
            match ticket.status {
                TicketStatus::Open => workload.open += 1,
                TicketStatus::InProgress => workload.in_progress += 1,
                TicketStatus::Resolved => workload.resolved += 1,
                TicketStatus::Closed => continue,
            }
            workload.total += 1;
        }
        Ok(workload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TicketPriority;

    async fn seeded() -> (MemoryRepository, Conversation) {
        let repo = MemoryRepository::new();
        let conversation = Conversation::new("cust-1", None);
        repo.insert_conversation(&conversation).await.unwrap();
        (repo, conversation)
    }

    #[tokio::test]
    async fn duplicate_key_does_not_consume_a_sequence_number() {
        let (repo, conversation) = seeded().await;
        let draft = MessageDraft::customer("hello").with_key(Some("k-1".into()));

        let first = repo.append_message(&conversation.id, &draft).await.unwrap();
        let again = repo.append_message(&conversation.id, &draft).await.unwrap();
        let next = repo
            .append_message(&conversation.id, &MessageDraft::customer("second"))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.message, again.message);
        assert_eq!(next.message.sequence, 2);
    }

    #[tokio::test]
    async fn since_skips_already_seen_sequences() {
        let (repo, conversation) = seeded().await;
        for n in 0..5 {
            repo.append_message(&conversation.id, &MessageDraft::customer(format!("m{n}")))
                .await
                .unwrap();
        }

        let tail = repo.messages_since(&conversation.id, 3, None).await.unwrap();
        assert_eq!(
            tail.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![4, 5]
        );
        let limited = repo.messages_since(&conversation.id, 0, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert!(repo
            .messages_since(&conversation.id, 9, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn closing_a_ticket_frees_the_conversation_slot() {
        let (repo, conversation) = seeded().await;
        let first = Ticket::open(&conversation, TicketPriority::Medium, None);
        repo.insert_ticket_if_none_active(&first).await.unwrap();

        let second = Ticket::open(&conversation, TicketPriority::High, None);
        let outcome = repo.insert_ticket_if_none_active(&second).await.unwrap();
        assert_eq!(outcome, TicketInsert::Existing(first.clone()));

        let mut closed = first.clone();
        closed.status = TicketStatus::Closed;
        let stored = repo
            .update_ticket_versioned(&closed, first.version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, first.version + 1);

        let outcome = repo.insert_ticket_if_none_active(&second).await.unwrap();
        assert!(matches!(outcome, TicketInsert::Created(_)));
    }

    #[tokio::test]
    async fn stale_version_write_is_refused() {
        let (repo, conversation) = seeded().await;
        let ticket = Ticket::open(&conversation, TicketPriority::Low, None);
        repo.insert_ticket_if_none_active(&ticket).await.unwrap();

        let mut update = ticket.clone();
        update.priority = TicketPriority::High;
        assert!(repo
            .update_ticket_versioned(&update, ticket.version + 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let (repo, conversation) = seeded().await;
        let ticket = Ticket::open(&conversation, TicketPriority::Low, None);
        repo.insert_ticket_if_none_active(&ticket).await.unwrap();

        let first = repo.claim_ticket(&ticket.id, "agent-a").await.unwrap();
        let second = repo.claim_ticket(&ticket.id, "agent-b").await.unwrap();

        assert!(first.claimed && first.started);
        assert!(!second.claimed && !second.started);
        assert_eq!(second.ticket.agent_id.as_deref(), Some("agent-a"));
        assert_eq!(second.ticket.status, TicketStatus::InProgress);
        assert_eq!(second.ticket.version, ticket.version + 1);
    }
}
