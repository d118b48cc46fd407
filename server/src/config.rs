use std::{env, str::FromStr, time::Duration};

use crate::{store::RetryPolicy, sync::PollPolicy, types::Thresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub store: StoreKind,
    pub database_url: String,
    pub max_connections: u32,
    pub evaluator_url: Option<String>,
    pub answer_engine_url: Option<String>,
    pub upstream_timeout: Duration,
    pub retry: RetryPolicy,
    pub thresholds: Thresholds,
    pub poll: PollPolicy,
}

impl ServerConfig {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let store = match get("STORE").as_deref() {
            Some("postgres") | Some("pg") => StoreKind::Postgres,
            Some("memory") | None => StoreKind::Memory,
            Some(other) => {
                tracing::warn!(store = other, "unknown STORE value, using memory");
                StoreKind::Memory
            }
        };

        let defaults = Thresholds::default();
        let mut thresholds = Thresholds {
            auto_below: parsed(&get, "ESCALATION_AUTO_BELOW").unwrap_or(defaults.auto_below),
            offer_below: parsed(&get, "ESCALATION_OFFER_BELOW").unwrap_or(defaults.offer_below),
        };
        if !(0.0..=1.0).contains(&thresholds.auto_below)
            || !(0.0..=1.0).contains(&thresholds.offer_below)
            || thresholds.auto_below > thresholds.offer_below
        {
            tracing::warn!(?thresholds, "inconsistent escalation thresholds, using defaults");
            thresholds = defaults;
        }

        let poll_defaults = PollPolicy::default();
        let retry_defaults = RetryPolicy::default();

        Self {
            port: parsed(&get, "PORT").unwrap_or(4000),
            store,
            database_url: resolve_database_url(&get),
            max_connections: parsed(&get, "DATABASE_MAX_CONNECTIONS").unwrap_or(10),
            evaluator_url: get("CONFIDENCE_EVALUATOR_URL"),
            answer_engine_url: get("ANSWER_ENGINE_URL"),
            upstream_timeout: parsed(&get, "UPSTREAM_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(20)),
            retry: RetryPolicy {
                attempts: parsed(&get, "STORE_RETRY_ATTEMPTS").unwrap_or(retry_defaults.attempts),
                backoff: parsed(&get, "STORE_RETRY_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.backoff),
            },
            thresholds,
            poll: PollPolicy {
                interactive: parsed(&get, "POLL_INTERACTIVE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(poll_defaults.interactive),
                passive: parsed(&get, "POLL_PASSIVE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(poll_defaults.passive),
            },
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = get(key)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparsable setting");
            None
        }
    }
}

fn resolve_database_url(get: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let either = |primary: &str, fallback: &str, default: &str| {
        get(primary)
            .or_else(|| get(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = either("POSTGRES_HOST", "PGHOST", "localhost");
    let port = either("POSTGRES_PORT", "PGPORT", "5432");
    let user = either("POSTGRES_USER", "PGUSER", "postgres");
    let password = either("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = either("POSTGRES_DB", "PGDATABASE", "handoff");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
