//! Authorization gate for session endpoints.
//!
//! Every session route asks an [`AccessReview`] whether the bearer token may
//! perform a verb on a session before touching the runner or the event log.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::SessionRef;

/// Authorization errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing authorization header.
    #[error("missing authorization header")]
    MissingAuthHeader,

    /// Invalid authorization header format.
    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    /// Token not recognised.
    #[error("invalid token")]
    InvalidToken,

    /// Token recognised but not allowed.
    #[error("insufficient permissions: {0}")]
    InsufficientPermissions(String),

    /// Review backend failed.
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Action being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Update,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Get => f.write_str("get"),
            Verb::Update => f.write_str("update"),
        }
    }
}

/// Yes/no access decision for a token, verb and session.
#[async_trait]
pub trait AccessReview: Send + Sync {
    /// `Err` for unknown tokens, `Ok(false)` for a known token lacking access.
    async fn review(&self, token: &str, verb: Verb, resource: &SessionRef) -> Result<bool, AuthError>;

    /// Skip token checks entirely.
    fn allows_anonymous(&self) -> bool {
        false
    }
}

/// A statically configured token and what it may do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenGrant {
    pub token: String,
    pub subject: String,
    pub verbs: Vec<Verb>,
    /// Projects the token may access; empty means all.
    pub projects: Vec<String>,
}

impl TokenGrant {
    fn permits(&self, verb: Verb, resource: &SessionRef) -> bool {
        self.verbs.contains(&verb)
            && (self.projects.is_empty() || self.projects.iter().any(|p| *p == resource.project))
    }
}

/// Authorization configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Allow every request without a token.
    pub dev_mode: bool,
    pub tokens: Vec<TokenGrant>,
    /// CORS origins; empty allows any origin.
    pub allowed_origins: Vec<String>,
}

/// [`AccessReview`] backed by [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct StaticAccessReview {
    dev_mode: bool,
    grants: Vec<TokenGrant>,
}

impl StaticAccessReview {
    pub fn new(config: &AuthConfig) -> Self {
        if config.dev_mode {
            log::warn!("Authorization dev mode enabled: all requests are allowed");
        }
        Self {
            dev_mode: config.dev_mode,
            grants: config
                .tokens
                .iter()
                .filter(|g| !g.token.is_empty())
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl AccessReview for StaticAccessReview {
    async fn review(&self, token: &str, verb: Verb, resource: &SessionRef) -> Result<bool, AuthError> {
        if self.dev_mode {
            return Ok(true);
        }
        let grant = self
            .grants
            .iter()
            .find(|g| g.token == token)
            .ok_or(AuthError::InvalidToken)?;
        let allowed = grant.permits(verb, resource);
        if !allowed {
            tracing::debug!(
                subject = %grant.subject,
                verb = %verb,
                project = %resource.project,
                "Access denied"
            );
        }
        Ok(allowed)
    }

    fn allows_anonymous(&self) -> bool {
        self.dev_mode
    }
}

/// Extract a Bearer token from an Authorization header value.
pub fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

/// Check an Authorization header against the review.
pub async fn authorize(
    review: &dyn AccessReview,
    header: Option<&str>,
    verb: Verb,
    resource: &SessionRef,
) -> Result<(), AuthError> {
    if review.allows_anonymous() {
        return Ok(());
    }
    let header = header.ok_or(AuthError::MissingAuthHeader)?;
    let token = bearer_token_from_header(header)?;
    if review.review(token, verb, resource).await? {
        Ok(())
    } else {
        Err(AuthError::InsufficientPermissions(format!(
            "cannot {} sessions in project {}",
            verb, resource.project
        )))
    }
}
