//! Operator authentication.
//!
//! Operator routes require `Authorization: Bearer <ADMIN_TOKEN>`. A missing or
//! malformed header is rejected with 401, a wrong token with 403. When no
//! token is configured every operator request is forbidden.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Proof that the request carried the operator token.
#[derive(Debug, Clone, Copy)]
pub struct Operator;

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        let Some(expected) = state.config.admin_token.as_deref() else {
            warn!(path = %parts.uri.path(), "Operator request rejected: ADMIN_TOKEN is not configured");
            return Err(ApiError::forbidden("Operator access is not configured"));
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!(path = %parts.uri.path(), "Operator request rejected: invalid token");
            return Err(ApiError::forbidden("Operator access required"));
        }

        Ok(Operator)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
