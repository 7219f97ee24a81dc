//! Closed error-kind taxonomy (spec §7) shared by every component seam.
//!
//! Internal task-local code still uses `anyhow::Result` with `.context(...)`,
//! the way the rest of this codebase does. `CoreError` exists at the
//! boundaries that a caller (the HTTP façade, the orchestrator, the algo
//! engine) must branch on by *kind*, not message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict or duplicate: {0}")]
    ConflictOrDuplicate(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream permanent error: {0}")]
    UpstreamPermanent(String),

    #[error("upstream auth error: {0}")]
    UpstreamAuth(String),

    #[error("malformed upstream response: {0}")]
    MalformedUpstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The `error_reason` string persisted on StrategyDecision/AlgoOrder rows.
    pub fn error_reason(&self) -> String {
        self.to_string()
    }

    /// Whether the originating component should retry with backoff (§7 policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::UpstreamTransient(_))
    }

    /// HTTP status family the façade maps this kind to (§7 "user-visible behavior").
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::ValidationFailed(_) => 400,
            CoreError::UpstreamAuth(_) => 401,
            CoreError::NotFound(_) => 404,
            CoreError::ConflictOrDuplicate(_) => 409,
            CoreError::PreconditionFailed(_) => 412,
            CoreError::UpstreamPermanent(_) => 502,
            CoreError::UpstreamTransient(_) => 503,
            CoreError::MalformedUpstream(_) => 502,
            CoreError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ValidationFailed(_) => "validation_failed",
            CoreError::NotFound(_) => "not_found",
            CoreError::ConflictOrDuplicate(_) => "conflict_or_duplicate",
            CoreError::PreconditionFailed(_) => "precondition_failed",
            CoreError::UpstreamTransient(_) => "upstream_transient",
            CoreError::UpstreamPermanent(_) => "upstream_permanent",
            CoreError::UpstreamAuth(_) => "upstream_auth",
            CoreError::MalformedUpstream(_) => "malformed_upstream",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Internal(format!("sqlite: {e}"))
    }
}

impl From<crate::exchange::ExchangeError> for CoreError {
    fn from(e: crate::exchange::ExchangeError) -> Self {
        use crate::exchange::ExchangeError as E;
        match e {
            E::Timeout(m) => CoreError::UpstreamTransient(m),
            E::ConnectError(m) => CoreError::UpstreamTransient(m),
            E::RateLimited(m, _) => CoreError::UpstreamTransient(m),
            E::ServerError(m) => CoreError::UpstreamTransient(m),
            E::AuthError(m) => CoreError::UpstreamAuth(m),
            E::PermanentApiError(m) => CoreError::UpstreamPermanent(m),
            E::MalformedResponse(m) => CoreError::MalformedUpstream(m),
        }
    }
}

impl From<crate::llm::LlmError> for CoreError {
    fn from(e: crate::llm::LlmError) -> Self {
        use crate::llm::LlmError as E;
        match e {
            E::Timeout(m) => CoreError::UpstreamTransient(m),
            E::ConnectError(m) => CoreError::UpstreamTransient(m),
            E::RateLimited(m, _) => CoreError::UpstreamTransient(m),
            E::ServerError(m) => CoreError::UpstreamTransient(m),
            E::AuthError(m) => CoreError::UpstreamAuth(m),
            E::PermanentApiError(m) => CoreError::UpstreamPermanent(m),
            E::MalformedResponse(m) => CoreError::MalformedUpstream(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_transient_is_retryable() {
        let e = CoreError::UpstreamTransient("timeout".into());
        assert!(e.is_retryable());
        assert_eq!(e.http_status(), 503);
    }

    #[test]
    fn validation_is_not_retryable_and_maps_to_400() {
        let e = CoreError::ValidationFailed("bad leverage".into());
        assert!(!e.is_retryable());
        assert_eq!(e.http_status(), 400);
    }
}
