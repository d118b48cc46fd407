use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::{
    error::{ConflictReason, CoreError, CoreResult},
    store::{Appended, Repository},
    types::{Actor, Conversation, ConversationStatus, Message, MessageDraft, Role, Sender},
};

const TITLE_CHARS: usize = 80;

static IDEMPOTENCY_KEY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:-]{1,128}$").ok());

pub fn validate_idempotency_key(key: &str) -> CoreResult<()> {
    let valid = IDEMPOTENCY_KEY_RE
        .as_ref()
        .is_some_and(|re| re.is_match(key));
    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(
            "invalid_idempotency_key",
            "idempotency key must be 1-128 characters of [A-Za-z0-9._:-]",
        ))
    }
}

/// Title derived from the first customer message.
pub fn title_from(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= TITLE_CHARS {
        return trimmed.to_string();
    }
    let mut title = trimmed.chars().take(TITLE_CHARS).collect::<String>();
    title.push('\u{2026}');
    title
}

/// Append-only, per-conversation message log. Sequencing itself happens in
/// the repository; this layer validates drafts and gates customer writes.
#[derive(Clone)]
pub struct ConversationStore {
    repo: Arc<dyn Repository>,
}

impl ConversationStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub async fn create(&self, actor: &Actor, title: Option<String>) -> CoreResult<Conversation> {
        if actor.role != Role::Customer {
            return Err(CoreError::Authorization(
                "only customers open conversations".to_string(),
            ));
        }
        let conversation = Conversation::new(actor.id.clone(), title);
        self.repo.insert_conversation(&conversation).await?;
        tracing::info!(conversation_id = %conversation.id, customer_id = %actor.id, "conversation created");
        Ok(conversation)
    }

    pub async fn get(&self, id: &str) -> CoreResult<Conversation> {
        self.repo
            .conversation(id)
            .await
            .map_err(CoreError::from_store("conversation"))
    }

    /// Fetches a conversation the actor is allowed to read.
    pub async fn get_for(&self, actor: &Actor, id: &str) -> CoreResult<Conversation> {
        let conversation = self.get(id).await?;
        conversation.ensure_visible_to(actor)?;
        Ok(conversation)
    }

    /// Customers see their own conversations, staff see all of them.
    pub async fn list(&self, actor: &Actor) -> CoreResult<Vec<Conversation>> {
        let owner = (!actor.is_staff()).then_some(actor.id.as_str());
        Ok(self.repo.list_conversations(owner).await?)
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> CoreResult<Conversation> {
        self.repo
            .set_conversation_status(id, status)
            .await
            .map_err(CoreError::from_store("conversation"))
    }

    pub async fn set_title_if_missing(&self, id: &str, content: &str) -> CoreResult<()> {
        self.repo
            .set_title_if_missing(id, &title_from(content))
            .await
            .map_err(CoreError::from_store("conversation"))
    }

    /// Trims the content and checks the draft without touching storage.
    pub fn prepare(mut draft: MessageDraft) -> CoreResult<MessageDraft> {
        let content = draft.content.trim();
        if content.is_empty() {
            return Err(CoreError::validation("empty_content", "message cannot be empty"));
        }
        if content.len() != draft.content.len() {
            draft.content = content.to_string();
        }
        if let Some(key) = draft.idempotency_key.as_deref() {
            validate_idempotency_key(key)?;
        }
        Ok(draft)
    }

    /// Appends a message. A repeated idempotency key returns the stored
    /// message with `created == false`.
    pub async fn append(&self, conversation_id: &str, draft: MessageDraft) -> CoreResult<Appended> {
        let draft = Self::prepare(draft)?;

        if matches!(draft.sender, Sender::Customer) {
            let conversation = self.get(conversation_id).await?;
            if conversation.status == ConversationStatus::Closed {
                return Err(CoreError::conflict(
                    ConflictReason::ConversationClosed,
                    "conversation is closed",
                ));
            }
        }

        let appended = self
            .repo
            .append_message(conversation_id, &draft)
            .await
            .map_err(CoreError::from_store("conversation"))?;
        if appended.created {
            tracing::debug!(
                conversation_id,
                sequence = appended.message.sequence,
                sender = appended.message.sender.kind(),
                "message appended"
            );
        } else {
            tracing::debug!(conversation_id, key = ?draft.idempotency_key, "duplicate append collapsed");
        }
        Ok(appended)
    }

    /// Messages with `sequence > after_sequence`, oldest first.
    pub async fn since(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> CoreResult<Vec<Message>> {
        self.repo
            .messages_since(conversation_id, after_sequence.max(0), limit)
            .await
            .map_err(CoreError::from_store("conversation"))
    }
}
