use std::sync::Arc;

use serde::Serialize;

use crate::{
    conversation::ConversationStore,
    error::{ConflictReason, CoreError, CoreResult},
    store::Repository,
    types::{
        Actor, ConfidenceAssessment, Conversation, ConversationStatus, EscalationAction,
        MessageDraft, SystemEvent, Thresholds, Ticket, TicketPriority, TicketStatus,
    },
    upstream::UpstreamError,
};

pub const HANDOVER_REASON: &str = "Customer requested a human agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Confident,
    OfferShown,
    OfferAlreadyPending,
    LowConfidence,
    AlreadyEscalated,
    ConversationClosed,
    EvaluatorUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDecision {
    pub conversation_id: String,
    pub message_id: String,
    pub action: EscalationAction,
    pub reason: DecisionReason,
    pub score: Option<f64>,
    pub ticket: Option<Ticket>,
    /// The evaluator could not be consulted; `action` is a safe default.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub ticket: Ticket,
    /// This call inserted the ticket. Racers that lost get the winner's.
    pub created: bool,
}

/// Decides when a conversation hands off to a human and makes sure at most
/// one ticket is active for it at any time.
#[derive(Clone)]
pub struct EscalationController {
    conversations: ConversationStore,
    thresholds: Thresholds,
}

impl EscalationController {
    pub fn new(conversations: ConversationStore, thresholds: Thresholds) -> Self {
        Self {
            conversations,
            thresholds,
        }
    }

    fn repo(&self) -> &Arc<dyn Repository> {
        self.conversations.repository()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Acts on the assessment of an AI reply. Evaluator failures never reach
    /// the caller: they degrade to "no escalation".
    pub async fn evaluate(
        &self,
        conversation_id: &str,
        message_id: &str,
        assessment: Result<ConfidenceAssessment, UpstreamError>,
    ) -> CoreResult<EscalationDecision> {
        let decision = |action, reason, score, ticket, degraded| EscalationDecision {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            action,
            reason,
            score,
            ticket,
            degraded,
        };

        let score = match assessment {
            Ok(assessment) if assessment.score.is_finite() => assessment.score.clamp(0.0, 1.0),
            Ok(assessment) => {
                tracing::warn!(conversation_id, score = assessment.score, "evaluator returned a non-finite score");
                return Ok(decision(
                    EscalationAction::None,
                    DecisionReason::EvaluatorUnavailable,
                    None,
                    None,
                    true,
                ));
            }
            Err(err) => {
                tracing::warn!(conversation_id, error = %err, "confidence evaluator unavailable, not escalating");
                return Ok(decision(
                    EscalationAction::None,
                    DecisionReason::EvaluatorUnavailable,
                    None,
                    None,
                    true,
                ));
            }
        };

        let conversation = self.conversations.get(conversation_id).await?;
        if conversation.status == ConversationStatus::Closed {
            return Ok(decision(
                EscalationAction::None,
                DecisionReason::ConversationClosed,
                Some(score),
                None,
                false,
            ));
        }

        match self.thresholds.action_for(score) {
            EscalationAction::None => Ok(decision(
                EscalationAction::None,
                DecisionReason::Confident,
                Some(score),
                None,
                false,
            )),
            EscalationAction::Offer => {
                if let Some(ticket) = self.repo().active_ticket(conversation_id).await? {
                    return Ok(decision(
                        EscalationAction::Offer,
                        DecisionReason::AlreadyEscalated,
                        Some(score),
                        Some(ticket),
                        false,
                    ));
                }
                if !self.repo().set_offer_pending(conversation_id, true).await? {
                    return Ok(decision(
                        EscalationAction::None,
                        DecisionReason::OfferAlreadyPending,
                        Some(score),
                        None,
                        false,
                    ));
                }
                // A ticket opened since the check above wins over the offer.
                if let Some(ticket) = self.repo().active_ticket(conversation_id).await? {
                    self.repo().set_offer_pending(conversation_id, false).await?;
                    return Ok(decision(
                        EscalationAction::Offer,
                        DecisionReason::AlreadyEscalated,
                        Some(score),
                        Some(ticket),
                        false,
                    ));
                }
                self.conversations
                    .append(
                        conversation_id,
                        MessageDraft::system(
                            SystemEvent::EscalationOffered,
                            "Would you like to talk to a human agent?",
                        )
                        .with_key(Some(format!("escalation-offered:{message_id}"))),
                    )
                    .await?;
                tracing::info!(conversation_id, score, "escalation offered");
                Ok(decision(
                    EscalationAction::Offer,
                    DecisionReason::OfferShown,
                    Some(score),
                    None,
                    false,
                ))
            }
            EscalationAction::Auto => {
                let reason = format!("Low confidence score ({score:.2})");
                let escalation = self
                    .open_ticket(&conversation, TicketPriority::from_confidence(score), reason)
                    .await?;
                let reason = if escalation.created {
                    DecisionReason::LowConfidence
                } else {
                    DecisionReason::AlreadyEscalated
                };
                Ok(decision(
                    EscalationAction::Auto,
                    reason,
                    Some(score),
                    Some(escalation.ticket),
                    false,
                ))
            }
        }
    }

    /// Explicit handoff. Idempotent: returns the active ticket when one exists.
    pub async fn escalate_now(
        &self,
        conversation_id: &str,
        requested_by: &Actor,
        reason: Option<String>,
        priority: Option<TicketPriority>,
    ) -> CoreResult<Escalation> {
        let conversation = self.conversations.get_for(requested_by, conversation_id).await?;
        if conversation.status == ConversationStatus::Closed {
            return Err(CoreError::conflict(
                ConflictReason::ConversationClosed,
                "conversation is closed",
            ));
        }
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "Customer requested escalation".to_string());
        self.open_ticket(
            &conversation,
            priority.unwrap_or(TicketPriority::Medium),
            reason,
        )
        .await
    }

    /// The customer declined the offer. Returns whether one was pending.
    pub async fn dismiss_offer(&self, conversation_id: &str, actor: &Actor) -> CoreResult<bool> {
        let conversation = self.conversations.get(conversation_id).await?;
        if !conversation.is_owned_by(actor) {
            return Err(CoreError::Authorization(
                "only the customer can dismiss an offer".to_string(),
            ));
        }
        let cleared = self.repo().set_offer_pending(conversation_id, false).await?;
        if cleared {
            tracing::info!(conversation_id, "escalation offer dismissed");
        }
        Ok(cleared)
    }

    async fn open_ticket(
        &self,
        conversation: &Conversation,
        priority: TicketPriority,
        reason: String,
    ) -> CoreResult<Escalation> {
        let candidate = Ticket::open(conversation, priority, Some(reason));
        let (ticket, created) = self
            .repo()
            .insert_ticket_if_none_active(&candidate)
            .await?
            .into_parts();

        if !created {
            // The creator may have failed after the insert. Its side effects
            // are keyed and idempotent, so any caller can finish them.
            let settled = conversation.status == ConversationStatus::Escalated
                || !matches!(ticket.status, TicketStatus::Open | TicketStatus::InProgress);
            if settled {
                tracing::debug!(conversation_id = %conversation.id, ticket_id = %ticket.id, "ticket already active");
                return Ok(Escalation { ticket, created });
            }
            tracing::debug!(
                conversation_id = %conversation.id,
                ticket_id = %ticket.id,
                "completing escalation for an existing ticket"
            );
        }

        self.conversations
            .append(
                &conversation.id,
                MessageDraft::system(
                    SystemEvent::TicketCreated {
                        ticket_id: ticket.id.clone(),
                    },
                    "A support ticket has been created. A human agent will join shortly.",
                )
                .with_key(Some(format!("ticket-created:{}", ticket.id))),
            )
            .await?;
        self.conversations
            .set_status(&conversation.id, ConversationStatus::Escalated)
            .await?;
        self.repo().set_offer_pending(&conversation.id, false).await?;

        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                ticket_id = %ticket.id,
                priority = ticket.priority.as_str(),
                "ticket created"
            );
        }
        Ok(Escalation { ticket, created })
    }
}
