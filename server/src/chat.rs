use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    conversation::ConversationStore,
    error::{CoreError, CoreResult},
    escalation::{Escalation, EscalationController, EscalationDecision, HANDOVER_REASON},
    types::{Actor, ConfidenceAssessment, ConversationStatus, Message, MessageDraft, Sender},
    upstream::{ai_sender, AiAnswer, AnswerEngine, ConfidenceEvaluator},
};

/// Messages before the current one that are sent along as history.
const HISTORY_WINDOW: i64 = 12;

static HANDOVER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(human|real person|representative|live agent|live person|handover|hand over|transfer me|(talk|speak|chat)\s+(to|with)\s+(an?\s+|the\s+)?(agent|person|someone|support))\b",
    )
    .ok()
});

pub fn has_handover_intent(text: &str) -> bool {
    HANDOVER_RE.as_ref().is_some_and(|re| re.is_match(text))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedMessage {
    pub message: Message,
    pub created: bool,
    pub escalation: Option<Escalation>,
    /// Background AI turn, if one was started.
    #[serde(skip)]
    pub reply_task: Option<JoinHandle<()>>,
}

/// Customer send path: store the message, then either hand over right away
/// or let the AI answer in the background.
#[derive(Clone)]
pub struct ChatService {
    conversations: ConversationStore,
    escalation: EscalationController,
    answers: Option<Arc<dyn AnswerEngine>>,
    evaluator: Arc<dyn ConfidenceEvaluator>,
}

impl ChatService {
    pub fn new(
        conversations: ConversationStore,
        escalation: EscalationController,
        answers: Option<Arc<dyn AnswerEngine>>,
        evaluator: Arc<dyn ConfidenceEvaluator>,
    ) -> Self {
        Self {
            conversations,
            escalation,
            answers,
            evaluator,
        }
    }

    pub async fn post_customer_message(
        &self,
        conversation_id: &str,
        actor: &Actor,
        content: &str,
        idempotency_key: Option<String>,
    ) -> CoreResult<PostedMessage> {
        let conversation = self.conversations.get(conversation_id).await?;
        if !conversation.is_owned_by(actor) {
            return Err(CoreError::Authorization(
                "only the customer can post here".to_string(),
            ));
        }

        let appended = self
            .conversations
            .append(
                conversation_id,
                MessageDraft::customer(content).with_key(idempotency_key),
            )
            .await?;
        let mut posted = PostedMessage {
            message: appended.message,
            created: appended.created,
            escalation: None,
            reply_task: None,
        };
        if !posted.created {
            return Ok(posted);
        }

        if conversation.title.is_none() {
            if let Err(err) = self
                .conversations
                .set_title_if_missing(conversation_id, &posted.message.content)
                .await
            {
                tracing::warn!(conversation_id, error = %err, "could not set conversation title");
            }
        }

        if has_handover_intent(&posted.message.content) {
            match self
                .escalation
                .escalate_now(conversation_id, actor, Some(HANDOVER_REASON.to_string()), None)
                .await
            {
                Ok(escalation) => posted.escalation = Some(escalation),
                Err(err) => {
                    tracing::error!(conversation_id, error = %err, "handover escalation failed");
                }
            }
            return Ok(posted);
        }

        if self.bot_enabled(&conversation.status) {
            let service = self.clone();
            let conversation_id = conversation_id.to_string();
            let message = posted.message.clone();
            posted.reply_task = Some(tokio::spawn(async move {
                if let Err(err) = service.respond_to_customer(&conversation_id, &message).await {
                    tracing::error!(conversation_id = %conversation_id, error = %err, "AI turn failed");
                }
            }));
        }
        Ok(posted)
    }

    fn bot_enabled(&self, status: &ConversationStatus) -> bool {
        self.answers.is_some() && *status == ConversationStatus::Active
    }

    /// Runs one AI turn for a stored customer message and feeds the result to
    /// the escalation controller. Returns `None` when the bot stays silent.
    pub async fn respond_to_customer(
        &self,
        conversation_id: &str,
        customer_message: &Message,
    ) -> CoreResult<Option<EscalationDecision>> {
        let Some(engine) = self.answers.as_ref() else {
            return Ok(None);
        };
        // A human may have taken over while this turn was queued.
        let conversation = self.conversations.get(conversation_id).await?;
        if conversation.status != ConversationStatus::Active {
            tracing::debug!(conversation_id, status = conversation.status.as_str(), "bot suppressed");
            return Ok(None);
        }

        let history = self
            .conversations
            .since(
                conversation_id,
                (customer_message.sequence - 1 - HISTORY_WINDOW).max(0),
                None,
            )
            .await?
            .into_iter()
            .filter(|m| m.sequence < customer_message.sequence)
            .filter(|m| !matches!(m.sender, Sender::System { .. }))
            .collect::<Vec<_>>();

        let (answer, assessment) = match engine.answer(&customer_message.content, &history).await {
            Ok(answer) => {
                let assessment = self.evaluator.assess(&customer_message.content, &answer).await;
                (answer, assessment)
            }
            Err(err) => {
                tracing::error!(conversation_id, error = %err, "answer engine failed, sending fallback");
                (AiAnswer::fallback(), Ok(ConfidenceAssessment::scored(0.0)))
            }
        };

        let confidence = assessment.as_ref().ok().map(|a| a.score);
        let appended = self
            .conversations
            .append(
                conversation_id,
                MessageDraft::new(ai_sender(&answer, confidence), answer.content.clone())
                    .with_key(Some(format!("ai-reply:{}", customer_message.id))),
            )
            .await?;
        if !appended.created {
            return Ok(None);
        }

        let decision = self
            .escalation
            .evaluate(conversation_id, &appended.message.id, assessment)
            .await?;
        tracing::info!(
            conversation_id,
            score = ?decision.score,
            action = ?decision.action,
            reason = ?decision.reason,
            degraded = decision.degraded,
            "AI turn evaluated"
        );
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        store::MemoryRepository,
        store::testing::FlakyRepository,
        types::{EscalationAction, SystemEvent, Thresholds},
        upstream::{DisabledEvaluator, UpstreamError, FALLBACK_REPLY},
    };

    struct FixedEngine(Result<&'static str, ()>);

    #[async_trait]
    impl AnswerEngine for FixedEngine {
        async fn answer(&self, _query: &str, _history: &[Message]) -> Result<AiAnswer, UpstreamError> {
            match self.0 {
                Ok(text) => Ok(AiAnswer {
                    content: text.to_string(),
                    sources: Vec::new(),
                    evidence: None,
                }),
                Err(()) => Err(UpstreamError::InvalidResponse("boom".to_string())),
            }
        }
    }

    struct FixedScore(f64);

    #[async_trait]
    impl ConfidenceEvaluator for FixedScore {
        async fn assess(&self, _query: &str, _answer: &AiAnswer) -> Result<ConfidenceAssessment, UpstreamError> {
            Ok(ConfidenceAssessment::scored(self.0))
        }
    }

    fn service(
        engine: Option<Arc<dyn AnswerEngine>>,
        evaluator: Arc<dyn ConfidenceEvaluator>,
    ) -> (ChatService, ConversationStore) {
        let store = ConversationStore::new(Arc::new(MemoryRepository::new()));
        let controller = EscalationController::new(store.clone(), Thresholds::default());
        (
            ChatService::new(store.clone(), controller, engine, evaluator),
            store,
        )
    }

    #[test]
    fn handover_phrases_are_detected() {
        assert!(has_handover_intent("Can I talk to a person please"));
        assert!(has_handover_intent("I want a HUMAN"));
        assert!(has_handover_intent("speak with an agent"));
        assert!(!has_handover_intent("my printer is humming"));
        assert!(!has_handover_intent("how do I transfer files?"));
    }

    #[tokio::test]
    async fn handover_request_escalates_without_an_ai_turn() {
        let engine: Arc<dyn AnswerEngine> = Arc::new(FixedEngine(Ok("hi")));
        let (chat, store) = service(Some(engine), Arc::new(FixedScore(0.9)));
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();

        let posted = chat
            .post_customer_message(&conversation.id, &customer, "get me a real person", None)
            .await
            .unwrap();
        let escalation = posted.escalation.unwrap();
        assert!(escalation.created);
        assert_eq!(escalation.ticket.reason.as_deref(), Some(HANDOVER_REASON));
        assert!(posted.reply_task.is_none());

        let conversation = store.get(&conversation.id).await.unwrap();
        assert_eq!(conversation.status, ConversationStatus::Escalated);
        assert_eq!(conversation.title.as_deref(), Some("get me a real person"));
    }

    #[tokio::test]
    async fn engine_failure_stores_the_apology_and_escalates() {
        let engine: Arc<dyn AnswerEngine> = Arc::new(FixedEngine(Err(())));
        let (chat, store) = service(Some(engine), Arc::new(DisabledEvaluator));
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();

        let posted = chat
            .post_customer_message(&conversation.id, &customer, "my order is late", None)
            .await
            .unwrap();
        posted.reply_task.unwrap().await.unwrap();

        let messages = store.since(&conversation.id, 0, None).await.unwrap();
        assert_eq!(messages[1].content, FALLBACK_REPLY);
        assert!(matches!(messages[1].sender, Sender::Ai { confidence: Some(c), .. } if c == 0.0));
        assert!(matches!(
            messages[2].sender,
            Sender::System {
                event: SystemEvent::TicketCreated { .. }
            }
        ));
    }

    #[tokio::test]
    async fn confident_reply_does_not_escalate_and_is_not_repeated() {
        let engine: Arc<dyn AnswerEngine> = Arc::new(FixedEngine(Ok("Restart the app.")));
        let (chat, store) = service(Some(engine), Arc::new(FixedScore(0.92)));
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();

        let posted = chat
            .post_customer_message(&conversation.id, &customer, "app froze", None)
            .await
            .unwrap();
        posted.reply_task.unwrap().await.unwrap();

        let again = chat
            .respond_to_customer(&conversation.id, &posted.message)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.since(&conversation.id, 0, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn evaluator_outage_keeps_the_reply_and_skips_escalation() {
        let engine: Arc<dyn AnswerEngine> = Arc::new(FixedEngine(Ok("Try this.")));
        let (chat, store) = service(Some(engine), Arc::new(DisabledEvaluator));
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();
        let message = store
            .append(&conversation.id, MessageDraft::customer("help"))
            .await
            .unwrap()
            .message;

        let decision = chat
            .respond_to_customer(&conversation.id, &message)
            .await
            .unwrap()
            .unwrap();
        assert!(decision.degraded);
        assert_eq!(decision.action, EscalationAction::None);
    }

    #[tokio::test]
    async fn no_engine_means_humans_only() {
        let (chat, store) = service(None, Arc::new(DisabledEvaluator));
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();
        let posted = chat
            .post_customer_message(&conversation.id, &customer, "hello", Some("k-1".into()))
            .await
            .unwrap();
        assert!(posted.reply_task.is_none());

        let err = chat
            .post_customer_message(&conversation.id, &Actor::agent("a-1"), "hello", None)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "forbidden");
    }

    #[tokio::test]
    async fn title_failure_does_not_fail_the_send() {
        let repo = Arc::new(FlakyRepository::new());
        let store = ConversationStore::new(repo.clone());
        let controller = EscalationController::new(store.clone(), Thresholds::default());
        let chat = ChatService::new(store.clone(), controller, None, Arc::new(DisabledEvaluator));
        let customer = Actor::customer("c-1");
        let conversation = store.create(&customer, None).await.unwrap();

        repo.fail("set_title_if_missing", 1);
        let posted = chat
            .post_customer_message(&conversation.id, &customer, "I need a human", Some("k-1".into()))
            .await
            .unwrap();
        assert!(posted.created);
        assert!(posted.escalation.unwrap().created);

        let conversation = store.get(&conversation.id).await.unwrap();
        assert_eq!(conversation.title, None);
        assert_eq!(conversation.status, ConversationStatus::Escalated);
    }
}
