//! Bearer token authentication for the HTTP API.
//!
//! When tokens are configured every protected route requires
//! `Authorization: Bearer <token>`. Tokens are compared in constant time. The
//! accepted token is attached to the request as a [`Caller`] so handlers can
//! attribute statements without ever logging the token itself.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Accepted bearer tokens. Empty means authentication is off.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    tokens: Vec<String>,
}

impl AuthConfig {
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self, String> {
        let mut accepted: Vec<String> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let token = token.trim();
            if token.is_empty() {
                return Err("Empty token value in configuration".to_string());
            }
            if !accepted.iter().any(|t| t == token) {
                accepted.push(token.to_string());
            }
        }
        Ok(Self { tokens: accepted })
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Every configured token is compared so timing does not reveal which matched.
    fn accepts(&self, provided: &str) -> bool {
        self.tokens.iter().fold(false, |found, expected| {
            let equal: bool = provided.len() == expected.len()
                && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()));
            found | equal
        })
    }
}

/// Identity of an authenticated caller: a masked token prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    fn from_token(token: &str) -> Self {
        Self(mask_token(token))
    }
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reject requests without a valid bearer token.
pub async fn require_bearer(
    State(auth): State<Arc<AuthConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let token = match extract_bearer_token(&request) {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!(path = %request.uri().path(), "Authentication failed: missing Authorization header");
            return unauthorized(
                "Missing Bearer token in Authorization header",
                "Include a valid token: 'Authorization: Bearer <token>'",
            );
        }
        Err(msg) => {
            warn!(path = %request.uri().path(), "Authentication failed: invalid header format");
            return unauthorized(msg, "Use the format: 'Authorization: Bearer <your-token>'");
        }
    };

    if !auth.accepts(token) {
        warn!(token_prefix = %mask_token(token), "Authentication failed: invalid token");
        return unauthorized(
            "Invalid Bearer token",
            "Check that you are using a token configured on the gateway",
        );
    }

    let caller = Caller::from_token(token);
    request.extensions_mut().insert(caller);
    next.run(request).await
}

fn extract_bearer_token(request: &Request<Body>) -> Result<Option<&str>, &'static str> {
    let Some(value) = request.headers().get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| "Authorization header contains invalid characters")?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or("Invalid Authorization header format. Expected 'Bearer <token>'")?
        .trim();
    if token.is_empty() {
        return Err("Bearer token is empty");
    }
    Ok(Some(token))
}

fn mask_token(token: &str) -> String {
    match token.char_indices().nth(3) {
        Some((idx, _)) => format!("{}***", &token[..idx]),
        None => "***".to_string(),
    }
}

fn unauthorized(message: impl Into<String>, suggestion: impl Into<String>) -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": message.into(),
        "code": "UNAUTHORIZED",
        "suggestion": suggestion.into(),
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tokens() {
        let auth = AuthConfig::from_tokens(vec!["abc".into(), " abc ".into(), "def".into()]).unwrap();
        assert!(auth.is_enabled());
        assert_eq!(auth.token_count(), 2);
        assert!(AuthConfig::from_tokens(vec!["  ".into()]).is_err());
        assert!(!AuthConfig::disabled().is_enabled());
    }

    #[test]
    fn test_accepts() {
        let auth = AuthConfig::from_tokens(vec!["secret-one".into(), "secret-two".into()]).unwrap();
        assert!(auth.accepts("secret-two"));
        assert!(!auth.accepts("secret-three"));
        assert!(!auth.accepts("secret"));
        assert!(!auth.accepts(""));
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("ab"), "***");
        assert_eq!(mask_token("abcdef"), "abc***");
        assert_eq!(mask_token("äöüß"), "äöü***");
    }

    #[test]
    fn test_extract_bearer_token() {
        let request = |value: &str| {
            Request::builder()
                .header(header::AUTHORIZATION, value)
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(extract_bearer_token(&request("Bearer tok")), Ok(Some("tok")));
        assert!(extract_bearer_token(&request("Basic tok")).is_err());
        assert!(extract_bearer_token(&request("Bearer ")).is_err());
        let bare = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(extract_bearer_token(&bare), Ok(None));
    }
}
