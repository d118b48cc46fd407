use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::{
    chat::ChatService,
    config::{ServerConfig, StoreKind},
    conversation::ConversationStore,
    error::CoreError,
    escalation::EscalationController,
    store::{MemoryRepository, PgRepository, Repository, RetryingRepository},
    sync::{etag_for, etag_matches, PollPolicy, SyncGateway},
    tickets::TicketStateMachine,
    types::*,
    upstream::{AnswerEngine, ConfidenceEvaluator, DisabledEvaluator, HttpAnswerEngine, HttpConfidenceEvaluator},
};

const MAX_MESSAGE_PAGE: u32 = 500;

pub struct AppState {
    pub conversations: ConversationStore,
    pub escalation: EscalationController,
    pub tickets: TicketStateMachine,
    pub sync: SyncGateway,
    pub chat: ChatService,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn Repository>,
        thresholds: Thresholds,
        poll: PollPolicy,
        answers: Option<Arc<dyn AnswerEngine>>,
        evaluator: Arc<dyn ConfidenceEvaluator>,
    ) -> Self {
        let conversations = ConversationStore::new(repo);
        let escalation = EscalationController::new(conversations.clone(), thresholds);
        Self {
            tickets: TicketStateMachine::new(conversations.clone()),
            sync: SyncGateway::new(conversations.clone(), poll),
            chat: ChatService::new(conversations.clone(), escalation.clone(), answers, evaluator),
            escalation,
            conversations,
        }
    }

    /// Memory store, no answer engine, no evaluator.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRepository::new()),
            Thresholds::default(),
            PollPolicy::default(),
            None,
            Arc::new(DisabledEvaluator),
        )
    }
}

fn json_status(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// JSON body with a strong ETag; answers 304 when the client already has it.
fn cached_json(headers: &HeaderMap, body: impl Serialize) -> Response {
    let bytes = match serde_json::to_vec(&body) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize response");
            return json_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "serialization failed", "reason": "internal", "retryable": false }),
            );
        }
    };
    let etag = etag_for(&bytes);
    let fresh = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| etag_matches(value, &etag));
    if fresh {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }
    (
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::ETAG, etag),
        ],
        bytes,
    )
        .into_response()
}

/// Decodes a JSON body, reporting any failure in the usual error envelope.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, CoreError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(CoreError::validation("invalid_body", "request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|err| CoreError::validation("invalid_body", format!("invalid JSON body: {err}")))
}

fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, CoreError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_utc() }))
}

async fn sync_policy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "poll": state.sync.policy().to_json() }))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    body: Bytes,
) -> impl IntoResponse {
    let body = match parse_optional_body::<CreateConversationBody>(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match state.conversations.create(&actor, body.title).await {
        Ok(conversation) => json_status(StatusCode::CREATED, json!({ "conversation": conversation })),
        Err(err) => err.into_response(),
    }
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    headers: HeaderMap,
) -> impl IntoResponse {
    match state.sync.list_conversations(&actor).await {
        Ok(conversations) => cached_json(&headers, json!({ "conversations": conversations })),
        Err(err) => err.into_response(),
    }
}

async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    headers: HeaderMap,
) -> impl IntoResponse {
    match state.sync.get_conversation(&actor, &conversation_id).await {
        Ok(view) => cached_json(&headers, view),
        Err(err) => err.into_response(),
    }
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    Query(query): Query<MessagesQuery>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(limit) = query.limit {
        if limit == 0 || limit > MAX_MESSAGE_PAGE {
            return CoreError::validation(
                "invalid_limit",
                format!("limit must be between 1 and {MAX_MESSAGE_PAGE}"),
            )
            .into_response();
        }
    }
    let after = query.after.unwrap_or(0);
    match state
        .sync
        .messages_since(&actor, &conversation_id, after, query.limit)
        .await
    {
        Ok(delta) => cached_json(&headers, delta),
        Err(err) => err.into_response(),
    }
}

async fn post_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    body: Bytes,
) -> impl IntoResponse {
    let body = match parse_body::<SendMessageBody>(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match state
        .chat
        .post_customer_message(&conversation_id, &actor, &body.content, body.idempotency_key)
        .await
    {
        Ok(posted) => {
            let status = if posted.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            json_status(
                status,
                json!({
                    "message": posted.message,
                    "created": posted.created,
                    "escalation": posted.escalation,
                }),
            )
        }
        Err(err) => err.into_response(),
    }
}

async fn escalate_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    body: Bytes,
) -> impl IntoResponse {
    let body = match parse_optional_body::<EscalateBody>(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let priority = match body.priority.as_deref().map(str::parse::<TicketPriority>).transpose() {
        Ok(priority) => priority,
        Err(err) => return err.into_response(),
    };
    match state
        .escalation
        .escalate_now(&conversation_id, &actor, body.reason, priority)
        .await
    {
        Ok(escalation) => {
            let status = if escalation.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            json_status(
                status,
                json!({ "ticket": escalation.ticket, "created": escalation.created }),
            )
        }
        Err(err) => err.into_response(),
    }
}

async fn dismiss_offer(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> impl IntoResponse {
    match state.escalation.dismiss_offer(&conversation_id, &actor).await {
        Ok(dismissed) => Json(json!({ "dismissed": dismissed })).into_response(),
        Err(err) => err.into_response(),
    }
}

fn ticket_filter(query: &TicketsQuery) -> Result<(TicketFilter, PageRequest), CoreError> {
    let filter = TicketFilter {
        status: query.status.as_deref().map(str::parse).transpose()?,
        priority: query.priority.as_deref().map(str::parse).transpose()?,
        agent_id: query
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    };
    let defaults = PageRequest::default();
    let page = PageRequest::new(
        query.page.unwrap_or(defaults.page),
        query.limit.unwrap_or(defaults.limit),
    )?;
    Ok((filter, page))
}

async fn list_tickets(
    Query(query): Query<TicketsQuery>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    headers: HeaderMap,
) -> impl IntoResponse {
    let (filter, page) = match ticket_filter(&query) {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };
    match state.sync.list_tickets(&actor, &filter, page).await {
        Ok(result) => cached_json(
            &headers,
            json!({
                "items": result.items,
                "total": result.total,
                "page": page.page,
                "limit": page.limit,
            }),
        ),
        Err(err) => err.into_response(),
    }
}

async fn get_ticket(
    Path(ticket_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    headers: HeaderMap,
) -> impl IntoResponse {
    match state.sync.get_ticket(&actor, &ticket_id).await {
        Ok(ticket) => cached_json(&headers, json!({ "ticket": ticket })),
        Err(err) => err.into_response(),
    }
}

async fn patch_ticket(
    Path(ticket_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    body: Bytes,
) -> impl IntoResponse {
    let body = match parse_body::<UpdateTicketBody>(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let status = match body.status.as_deref().map(str::parse::<TicketStatus>).transpose() {
        Ok(status) => status,
        Err(err) => return err.into_response(),
    };
    let priority = match body.priority.as_deref().map(str::parse::<TicketPriority>).transpose() {
        Ok(priority) => priority,
        Err(err) => return err.into_response(),
    };
    if status.is_none() && priority.is_none() {
        return CoreError::validation("empty_update", "status or priority is required").into_response();
    }

    // Priority first: a status change may close the ticket.
    let mut version = body.expected_version;
    let mut ticket = None;
    if let Some(priority) = priority {
        match state
            .tickets
            .update_priority(&ticket_id, priority, &actor, version)
            .await
        {
            Ok(updated) => {
                version = updated.version;
                ticket = Some(updated);
            }
            Err(err) => return err.into_response(),
        }
    }
    if let Some(status) = status {
        match state.tickets.transition(&ticket_id, status, &actor, version).await {
            Ok(updated) => ticket = Some(updated),
            Err(err) => return err.into_response(),
        }
    }
    Json(json!({ "ticket": ticket })).into_response()
}

async fn respond_to_ticket(
    Path(ticket_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
    body: Bytes,
) -> impl IntoResponse {
    let body = match parse_body::<RespondBody>(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match state
        .tickets
        .respond(&ticket_id, &body.content, &actor, body.idempotency_key)
        .await
    {
        Ok(response) => json_status(StatusCode::CREATED, json!(response)),
        Err(err) => err.into_response(),
    }
}

async fn agent_workload(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> impl IntoResponse {
    match state.tickets.workload(&actor, &agent_id).await {
        Ok(workload) => Json(json!({ "agentId": agent_id, "workload": workload })).into_response(),
        Err(err) => err.into_response(),
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sync/policy", get(sync_policy))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route(
            "/api/conversations/{conversation_id}/escalate",
            post(escalate_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/offer/dismiss",
            post(dismiss_offer),
        )
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{ticket_id}", get(get_ticket).patch(patch_ticket))
        .route("/api/tickets/{ticket_id}/respond", post(respond_to_ticket))
        .route("/api/agents/{agent_id}/workload", get(agent_workload))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    let repo: Arc<dyn Repository> = match config.store {
        StoreKind::Postgres => Arc::new(
            PgRepository::connect(&config.database_url, config.max_connections)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?,
        ),
        StoreKind::Memory => {
            tracing::warn!("using the in-memory store; nothing survives a restart");
            Arc::new(MemoryRepository::new())
        }
    };
    let repo: Arc<dyn Repository> = Arc::new(RetryingRepository::new(repo, config.retry));

    let answers: Option<Arc<dyn AnswerEngine>> = match &config.answer_engine_url {
        Some(url) => Some(Arc::new(
            HttpAnswerEngine::new(url.clone(), config.upstream_timeout)
                .context("failed to build answer engine client")?,
        )),
        None => {
            tracing::info!("ANSWER_ENGINE_URL not set; conversations go straight to humans");
            None
        }
    };
    let evaluator: Arc<dyn ConfidenceEvaluator> = match &config.evaluator_url {
        Some(url) => Arc::new(
            HttpConfidenceEvaluator::new(url.clone(), config.upstream_timeout)
                .context("failed to build confidence evaluator client")?,
        ),
        None => {
            tracing::warn!("CONFIDENCE_EVALUATOR_URL not set; AI replies never escalate on their own");
            Arc::new(DisabledEvaluator)
        }
    };

    let state = Arc::new(AppState::new(
        repo,
        config.thresholds,
        config.poll,
        answers,
        evaluator,
    ));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(port = config.port, store = ?config.store, "handoff server listening");
    axum::serve(listener, app).await.context("server runtime failure")?;
    Ok(())
}
