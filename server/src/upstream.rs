//! Clients for the two external services the chat path depends on: the answer
//! engine (retrieval + generation) and the confidence evaluator. Both are
//! optional; when a URL is not configured the corresponding trait object
//! reports `NotConfigured` and callers fall back.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::types::{ConfidenceAssessment, Evidence, EvidenceQuality, Message, Sender, SourceReference};

/// Reply used when the answer engine fails. Stored with confidence 0.
pub const FALLBACK_REPLY: &str = "I'm sorry, I encountered an error while processing your question. \
Please try again or ask to speak with a human agent.";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream not configured")]
    NotConfigured,
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream response invalid: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnswer {
    #[serde(alias = "response")]
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceReference>,
    #[serde(default)]
    pub evidence: Option<Evidence>,
}

impl AiAnswer {
    pub fn fallback() -> Self {
        Self {
            content: FALLBACK_REPLY.to_string(),
            sources: Vec::new(),
            evidence: Some(Evidence {
                has_sufficient_evidence: false,
                quality: EvidenceQuality::None,
                disclaimer: Some("An error occurred.".to_string()),
            }),
        }
    }
}

#[async_trait]
pub trait AnswerEngine: Send + Sync {
    async fn answer(&self, query: &str, history: &[Message]) -> Result<AiAnswer, UpstreamError>;
}

#[async_trait]
pub trait ConfidenceEvaluator: Send + Sync {
    async fn assess(&self, query: &str, answer: &AiAnswer) -> Result<ConfidenceAssessment, UpstreamError>;
}

/// Stands in for an evaluator that was never configured.
pub struct DisabledEvaluator;

#[async_trait]
impl ConfidenceEvaluator for DisabledEvaluator {
    async fn assess(&self, _query: &str, _answer: &AiAnswer) -> Result<ConfidenceAssessment, UpstreamError> {
        Err(UpstreamError::NotConfigured)
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, UpstreamError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

async fn post_json<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    url: &str,
    body: serde_json::Value,
) -> Result<T, UpstreamError> {
    let response = client.post(url).json(&body).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Status { status, body });
    }
    response
        .json::<T>()
        .await
        .map_err(|err| UpstreamError::InvalidResponse(err.to_string()))
}

pub struct HttpAnswerEngine {
    client: reqwest::Client,
    url: String,
}

impl HttpAnswerEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AnswerEngine for HttpAnswerEngine {
    async fn answer(&self, query: &str, history: &[Message]) -> Result<AiAnswer, UpstreamError> {
        let history = history
            .iter()
            .map(|m| json!({ "role": m.sender.kind(), "content": m.content }))
            .collect::<Vec<_>>();
        let answer: AiAnswer = post_json(
            &self.client,
            &self.url,
            json!({ "query": query, "history": history }),
        )
        .await?;
        if answer.content.trim().is_empty() {
            return Err(UpstreamError::InvalidResponse("empty answer".to_string()));
        }
        Ok(answer)
    }
}

pub struct HttpConfidenceEvaluator {
    client: reqwest::Client,
    url: String,
}

impl HttpConfidenceEvaluator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConfidenceEvaluator for HttpConfidenceEvaluator {
    async fn assess(&self, query: &str, answer: &AiAnswer) -> Result<ConfidenceAssessment, UpstreamError> {
        post_json(
            &self.client,
            &self.url,
            json!({
                "query": query,
                "answer": answer.content,
                "sources": answer.sources,
            }),
        )
        .await
    }
}

/// Sender for an AI reply carrying its confidence and provenance.
pub fn ai_sender(answer: &AiAnswer, confidence: Option<f64>) -> Sender {
    Sender::Ai {
        confidence,
        sources: answer.sources.clone(),
        evidence: answer.evidence.clone(),
    }
}
