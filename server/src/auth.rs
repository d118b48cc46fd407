use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};

use crate::{
    error::CoreError,
    types::{Actor, Role},
};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads the identity claims forwarded by the auth gateway.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, CoreError> {
    let id = header_text(headers, ACTOR_ID_HEADER).ok_or(CoreError::Unauthenticated)?;
    let role = header_text(headers, ACTOR_ROLE_HEADER)
        .ok_or(CoreError::Unauthenticated)?
        .parse::<Role>()
        .map_err(|_| CoreError::Unauthenticated)?;
    Ok(Actor::new(id, role))
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
    }
}
