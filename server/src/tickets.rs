use std::sync::Arc;

use serde::Serialize;

use crate::{
    conversation::ConversationStore,
    error::{ConflictReason, CoreError, CoreResult},
    store::Repository,
    types::{
        now_utc, Actor, ConversationStatus, Message, MessageDraft, SystemEvent, Ticket,
        TicketPriority, TicketStatus, Workload,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub message: Message,
    pub ticket: Ticket,
    /// This response is what assigned the ticket to the agent.
    pub claimed: bool,
}

/// Owns ticket status changes and first-responder assignment. Every write is
/// a compare-and-set, so concurrent agents either win or get a conflict.
#[derive(Clone)]
pub struct TicketStateMachine {
    conversations: ConversationStore,
}

fn stale(ticket: &Ticket, expected_version: i64) -> CoreError {
    CoreError::conflict(
        ConflictReason::StaleVersion,
        format!(
            "ticket {} is at version {}, expected {}",
            ticket.id, ticket.version, expected_version
        ),
    )
}

impl TicketStateMachine {
    pub fn new(conversations: ConversationStore) -> Self {
        Self { conversations }
    }

    fn repo(&self) -> &Arc<dyn Repository> {
        self.conversations.repository()
    }

    async fn load(&self, ticket_id: &str) -> CoreResult<Ticket> {
        self.repo()
            .ticket(ticket_id)
            .await
            .map_err(CoreError::from_store("ticket"))
    }

    pub async fn transition(
        &self,
        ticket_id: &str,
        new_status: TicketStatus,
        actor: &Actor,
        expected_version: i64,
    ) -> CoreResult<Ticket> {
        actor.require_staff()?;
        let current = self.load(ticket_id).await?;
        if current.version != expected_version {
            return Err(stale(&current, expected_version));
        }
        if !current.status.can_transition_to(new_status) {
            return Err(CoreError::conflict(
                ConflictReason::IllegalTransition,
                format!("cannot move ticket from {} to {}", current.status, new_status),
            ));
        }

        let now = now_utc();
        let mut next = current.clone();
        next.status = new_status;
        next.updated_at = now;
        if new_status == TicketStatus::Resolved {
            next.resolved_at = Some(now);
        }

        let Some(updated) = self
            .repo()
            .update_ticket_versioned(&next, expected_version)
            .await
            .map_err(CoreError::from_store("ticket"))?
        else {
            let latest = self.load(ticket_id).await?;
            return Err(stale(&latest, expected_version));
        };

        tracing::info!(
            ticket_id,
            actor_id = %actor.id,
            from = current.status.as_str(),
            to = new_status.as_str(),
            version = updated.version,
            "ticket transitioned"
        );

        if new_status.is_finished() {
            self.conversations
                .set_status(&updated.conversation_id, ConversationStatus::Closed)
                .await?;
            self.conversations
                .append(
                    &updated.conversation_id,
                    MessageDraft::system(
                        SystemEvent::TicketStatusChanged {
                            ticket_id: updated.id.clone(),
                            status: new_status,
                        },
                        format!("This ticket has been marked as {}.", new_status.as_str().replace('_', " ")),
                    )
                    .with_key(Some(format!("ticket-status:{}:{}", updated.id, updated.version))),
                )
                .await?;
        }
        Ok(updated)
    }

    pub async fn update_priority(
        &self,
        ticket_id: &str,
        priority: TicketPriority,
        actor: &Actor,
        expected_version: i64,
    ) -> CoreResult<Ticket> {
        actor.require_staff()?;
        let current = self.load(ticket_id).await?;
        if current.version != expected_version {
            return Err(stale(&current, expected_version));
        }
        if current.status == TicketStatus::Closed {
            return Err(CoreError::conflict(
                ConflictReason::TicketClosed,
                "ticket is closed",
            ));
        }

        let mut next = current;
        next.priority = priority;
        next.updated_at = now_utc();
        match self
            .repo()
            .update_ticket_versioned(&next, expected_version)
            .await
            .map_err(CoreError::from_store("ticket"))?
        {
            Some(updated) => Ok(updated),
            None => {
                let latest = self.load(ticket_id).await?;
                Err(stale(&latest, expected_version))
            }
        }
    }

    /// Records an agent reply. The first responder is assigned the ticket and
    /// moves it to in_progress; later responders still get their message stored.
    pub async fn respond(
        &self,
        ticket_id: &str,
        content: &str,
        agent: &Actor,
        idempotency_key: Option<String>,
    ) -> CoreResult<AgentReply> {
        agent.require_staff()?;
        // Nothing may claim the ticket unless the reply itself is storable.
        let draft = ConversationStore::prepare(
            MessageDraft::agent(agent.id.clone(), content).with_key(idempotency_key),
        )?;
        let ticket = self.load(ticket_id).await?;
        if ticket.status.is_finished() {
            return Err(CoreError::conflict(
                ConflictReason::TicketClosed,
                format!("ticket is {}", ticket.status),
            ));
        }

        let claim = self
            .repo()
            .claim_ticket(ticket_id, &agent.id)
            .await
            .map_err(CoreError::from_store("ticket"))?;
        if claim.ticket.status.is_finished() {
            return Err(CoreError::conflict(
                ConflictReason::TicketClosed,
                format!("ticket is {}", claim.ticket.status),
            ));
        }
        if claim.claimed {
            tracing::info!(ticket_id, agent_id = %agent.id, "ticket claimed");
        } else if claim.ticket.agent_id.as_deref() != Some(agent.id.as_str()) {
            tracing::info!(
                ticket_id,
                agent_id = %agent.id,
                owner = ?claim.ticket.agent_id,
                "responded to a ticket claimed by another agent"
            );
        }

        let appended = self
            .conversations
            .append(&claim.ticket.conversation_id, draft)
            .await?;

        Ok(AgentReply {
            message: appended.message,
            ticket: claim.ticket,
            claimed: claim.claimed,
        })
    }

    pub async fn workload(&self, actor: &Actor, agent_id: &str) -> CoreResult<Workload> {
        actor.require_staff()?;
        Ok(self.repo().workload(agent_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        escalation::EscalationController,
        store::MemoryRepository,
        types::{Sender, Thresholds},
    };

    async fn setup() -> (TicketStateMachine, ConversationStore, Ticket) {
        let store = ConversationStore::new(Arc::new(MemoryRepository::new()));
        let controller = EscalationController::new(store.clone(), Thresholds::default());
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();
        let escalation = controller
            .escalate_now(&conversation.id, &customer, None, None)
            .await
            .unwrap();
        (TicketStateMachine::new(store.clone()), store, escalation.ticket)
    }

    #[tokio::test]
    async fn customers_cannot_transition() {
        let (machine, _, ticket) = setup().await;
        let err = machine
            .transition(&ticket.id, TicketStatus::Closed, &Actor::customer("c-1"), 1)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "forbidden");
    }

    #[tokio::test]
    async fn version_is_checked_before_the_edge() {
        let (machine, _, ticket) = setup().await;
        let agent = Actor::agent("a-1");
        let err = machine
            .transition(&ticket.id, TicketStatus::Resolved, &agent, 7)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "stale_version");

        let err = machine
            .transition(&ticket.id, TicketStatus::Resolved, &agent, ticket.version)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "illegal_transition");
    }

    #[tokio::test]
    async fn resolving_stamps_and_closes_the_conversation() {
        let (machine, store, ticket) = setup().await;
        let agent = Actor::agent("a-1");
        let started = machine
            .transition(&ticket.id, TicketStatus::InProgress, &agent, 1)
            .await
            .unwrap();
        assert_eq!(started.version, 2);

        let resolved = machine
            .transition(&ticket.id, TicketStatus::Resolved, &agent, 2)
            .await
            .unwrap();
        assert!(resolved.resolved_at.is_some());

        let conversation = store.get(&ticket.conversation_id).await.unwrap();
        assert_eq!(conversation.status, ConversationStatus::Closed);
        let last = store
            .since(&ticket.conversation_id, 0, None)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(
            last.sender,
            Sender::System {
                event: SystemEvent::TicketStatusChanged {
                    ticket_id: ticket.id.clone(),
                    status: TicketStatus::Resolved,
                }
            }
        );

        let err = machine
            .respond(&ticket.id, "one more thing", &agent, None)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ticket_closed");
    }

    #[tokio::test]
    async fn first_response_claims_and_starts() {
        let (machine, _, ticket) = setup().await;
        let first = machine
            .respond(&ticket.id, "Hi, I'm here", &Actor::agent("a-1"), None)
            .await
            .unwrap();
        assert!(first.claimed);
        assert_eq!(first.ticket.status, TicketStatus::InProgress);
        assert_eq!(first.ticket.agent_id.as_deref(), Some("a-1"));

        let second = machine
            .respond(&ticket.id, "Me too", &Actor::admin("boss"), None)
            .await
            .unwrap();
        assert!(!second.claimed);
        assert_eq!(second.ticket.agent_id.as_deref(), Some("a-1"));
        assert_eq!(second.message.sequence, first.message.sequence + 1);
    }

    #[tokio::test]
    async fn rejected_replies_leave_the_ticket_unclaimed() {
        let (machine, store, ticket) = setup().await;
        let agent = Actor::agent("a-1");

        let err = machine
            .respond(&ticket.id, "hello", &agent, Some("bad key".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_idempotency_key");
        let err = machine.respond(&ticket.id, "   ", &agent, None).await.unwrap_err();
        assert_eq!(err.reason(), "empty_content");

        let stored = store.repository().ticket(&ticket.id).await.unwrap();
        assert_eq!(stored.agent_id, None);
        assert_eq!(stored.status, TicketStatus::Open);
        assert_eq!(stored.version, 1);
        let agent_messages = store
            .since(&ticket.conversation_id, 0, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| matches!(m.sender, Sender::Agent { .. }))
            .count();
        assert_eq!(agent_messages, 0);
    }

    #[tokio::test]
    async fn priority_changes_are_versioned() {
        let (machine, _, ticket) = setup().await;
        let agent = Actor::agent("a-1");
        let updated = machine
            .update_priority(&ticket.id, TicketPriority::High, &agent, 1)
            .await
            .unwrap();
        assert_eq!(updated.priority, TicketPriority::High);
        assert_eq!(updated.version, 2);

        let err = machine
            .update_priority(&ticket.id, TicketPriority::Low, &agent, 1)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn workload_counts_claimed_tickets() {
        let (machine, _, ticket) = setup().await;
        let agent = Actor::agent("a-1");
        machine.respond(&ticket.id, "on it", &agent, None).await.unwrap();

        let workload = machine.workload(&agent, "a-1").await.unwrap();
        assert_eq!(workload.in_progress, 1);
        assert_eq!(workload.total, 1);
        assert_eq!(machine.workload(&agent, "a-2").await.unwrap(), Workload::default());
    }
}
