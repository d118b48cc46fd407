use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Identity ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Agent,
    Admin,
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            "admin" => Ok(Self::Admin),
            other => Err(CoreError::validation(
                "invalid_role",
                format!("unknown role: {other}"),
            )),
        }
    }
}

/// Identity claims of whoever is making a call. Supplied per request by the
/// upstream identity provider and trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn customer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Customer)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(id, Role::Agent)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Agent | Role::Admin)
    }

    pub fn require_staff(&self) -> Result<(), CoreError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(CoreError::Authorization(
                "agent or admin role required".to_string(),
            ))
        }
    }
}

// ── Conversations ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Escalated,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Escalated => "escalated",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "escalated" => Ok(Self::Escalated),
            "closed" => Ok(Self::Closed),
            other => Err(CoreError::validation(
                "invalid_status",
                format!("unknown conversation status: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub customer_id: String,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sequence: i64,
    /// An escalation offer was shown and the customer has not acted on it yet.
    pub offer_pending: bool,
}

impl Conversation {
    pub fn new(customer_id: impl Into<String>, title: Option<String>) -> Self {
        let now = now_utc();
        Self {
            id: new_id(),
            customer_id: customer_id.into(),
            title: title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
            last_sequence: 0,
            offer_pending: false,
        }
    }

    pub fn is_owned_by(&self, actor: &Actor) -> bool {
        actor.role == Role::Customer && actor.id == self.customer_id
    }

    pub fn ensure_visible_to(&self, actor: &Actor) -> Result<(), CoreError> {
        if actor.is_staff() || self.is_owned_by(actor) {
            Ok(())
        } else {
            Err(CoreError::Authorization("not your conversation".to_string()))
        }
    }
}

// ── Messages ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    pub title: String,
    #[serde(default, alias = "page_number")]
    pub page_number: Option<i32>,
    #[serde(default, alias = "chunk_text")]
    pub chunk_text: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default, alias = "document_id")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceQuality {
    Strong,
    Moderate,
    Weak,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    #[serde(alias = "has_sufficient_evidence")]
    pub has_sufficient_evidence: bool,
    #[serde(alias = "evidence_quality")]
    pub quality: EvidenceQuality,
    #[serde(default)]
    pub disclaimer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    TicketCreated {
        #[serde(rename = "ticketId")]
        ticket_id: String,
    },
    EscalationOffered,
    TicketStatusChanged {
        #[serde(rename = "ticketId")]
        ticket_id: String,
        status: TicketStatus,
    },
}

/// Who wrote a message. Fields that only make sense for one kind of sender
/// live on that variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Sender {
    Customer,
    Agent {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    Ai {
        confidence: Option<f64>,
        #[serde(default)]
        sources: Vec<SourceReference>,
        #[serde(default)]
        evidence: Option<Evidence>,
    },
    System {
        event: SystemEvent,
    },
}

impl Sender {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent { .. } => "agent",
            Self::Ai { .. } => "ai",
            Self::System { .. } => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence: i64,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// A message that has not been sequenced yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub sender: Sender,
    pub content: String,
    pub idempotency_key: Option<String>,
}

impl MessageDraft {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
            idempotency_key: None,
        }
    }

    pub fn customer(content: impl Into<String>) -> Self {
        Self::new(Sender::Customer, content)
    }

    pub fn agent(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Sender::Agent {
                agent_id: agent_id.into(),
            },
            content,
        )
    }

    pub fn system(event: SystemEvent, content: impl Into<String>) -> Self {
        Self::new(Sender::System { event }, content)
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }
}

// ── Confidence ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    #[default]
    None,
    Offer,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    #[serde(alias = "confidence_score")]
    pub score: f64,
    #[serde(default)]
    pub has_sufficient_evidence: bool,
    #[serde(default)]
    pub escalation_action: EscalationAction,
}

/// Score bands. `score < auto_below` escalates on its own, `score < offer_below`
/// offers a human, anything else is left alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub auto_below: f64,
    pub offer_below: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_below: 0.4,
            offer_below: 0.7,
        }
    }
}

impl Thresholds {
    pub fn action_for(&self, score: f64) -> EscalationAction {
        if score < self.auto_below {
            EscalationAction::Auto
        } else if score < self.offer_below {
            EscalationAction::Offer
        } else {
            EscalationAction::None
        }
    }
}

impl ConfidenceAssessment {
    pub fn scored(score: f64) -> Self {
        let action = Thresholds::default().action_for(score);
        Self {
            score,
            has_sufficient_evidence: action != EscalationAction::Auto,
            escalation_action: action,
        }
    }
}

// ── Tickets ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    /// Edges of the lifecycle graph. Nothing ever moves back to an earlier state.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, Closed)
                | (InProgress, Resolved)
                | (InProgress, Closed)
                | (Resolved, Closed)
        )
    }

    /// Counts against the one-ticket-per-conversation rule.
    pub fn is_active(self) -> bool {
        self != Self::Closed
    }

    /// Agents can no longer reply and the customer's chat is read-only.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            other => Err(CoreError::validation(
                "invalid_status",
                format!("invalid status: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn from_confidence(score: f64) -> Self {
        if score < 0.2 {
            Self::High
        } else if score < 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl FromStr for TicketPriority {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(CoreError::validation(
                "invalid_priority",
                format!("invalid priority: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub conversation_id: String,
    pub customer_id: String,
    pub agent_id: Option<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn open(
        conversation: &Conversation,
        priority: TicketPriority,
        reason: Option<String>,
    ) -> Self {
        let now = now_utc();
        Self {
            id: new_id(),
            conversation_id: conversation.id.clone(),
            customer_id: conversation.customer_id.clone(),
            agent_id: None,
            status: TicketStatus::Open,
            priority,
            reason,
            version: 1,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub fn ensure_visible_to(&self, actor: &Actor) -> Result<(), CoreError> {
        if actor.is_staff() || (actor.role == Role::Customer && actor.id == self.customer_id) {
            Ok(())
        } else {
            Err(CoreError::Authorization("not your ticket".to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub agent_id: Option<String>,
}

impl TicketFilter {
    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.status.map_or(true, |s| ticket.status == s)
            && self.priority.map_or(true, |p| ticket.priority == p)
            && self
                .agent_id
                .as_deref()
                .map_or(true, |a| ticket.agent_id.as_deref() == Some(a))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Result<Self, CoreError> {
        if page == 0 {
            return Err(CoreError::validation("invalid_page", "page must be >= 1"));
        }
        if limit == 0 || limit > Self::MAX_LIMIT {
            return Err(CoreError::validation(
                "invalid_limit",
                format!("limit must be between 1 and {}", Self::MAX_LIMIT),
            ));
        }
        Ok(Self { page, limit })
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketPage {
    pub items: Vec<Ticket>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub open: u64,
    pub in_progress: u64,
    pub resolved: u64,
    pub total: u64,
}

// ── Request bodies ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub content: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalateBody {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTicketBody {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    pub expected_version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondBody {
    pub content: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    #[serde(default)]
    pub after: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_graph_only_moves_forward() {
        use TicketStatus::*;
        let all = [Open, InProgress, Resolved, Closed];
        for next in all {
            assert!(!Closed.can_transition_to(next), "closed -> {next}");
        }
        assert!(!Resolved.can_transition_to(Open));
        assert!(!Resolved.can_transition_to(InProgress));
        assert!(Resolved.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));
        assert!(InProgress.can_transition_to(Closed));
        for status in all {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn sender_serializes_as_tagged_variant() {
        let sender = Sender::Agent {
            agent_id: "agent-7".to_string(),
        };
        let value = serde_json::to_value(&sender).unwrap();
        assert_eq!(value["role"], "agent");
        assert_eq!(value["agentId"], "agent-7");

        let customer = serde_json::to_value(Sender::Customer).unwrap();
        assert!(customer.get("confidence").is_none());
    }

    #[test]
    fn priority_follows_confidence_bands() {
        assert_eq!(TicketPriority::from_confidence(0.1), TicketPriority::High);
        assert_eq!(TicketPriority::from_confidence(0.3), TicketPriority::Medium);
        assert_eq!(TicketPriority::from_confidence(0.5), TicketPriority::Low);
    }

    #[test]
    fn page_request_rejects_out_of_range_values() {
        assert!(PageRequest::new(0, 10).is_err());
        assert!(PageRequest::new(1, 0).is_err());
        assert!(PageRequest::new(1, 101).is_err());
        assert_eq!(PageRequest::new(3, 20).unwrap().offset(), 40);
    }

    #[test]
    fn status_parsing_rejects_unknown_values() {
        let err = "reopened".parse::<TicketStatus>().unwrap_err();
        assert_eq!(err.reason(), "invalid_status");
        assert_eq!(
            "in_progress".parse::<TicketStatus>().unwrap(),
            TicketStatus::InProgress
        );
    }
}
