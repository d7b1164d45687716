//! Error taxonomy (§7). Kinds, not type names: every variant here is one
//! recoverable error kind, recovered locally everywhere except `Fatal`,
//! which ends the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("dead url: {0}")]
    DeadUrl(String),

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("identity failure: {0}")]
    IdentityFailure(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Fatal(format!("sqlite: {e}"))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CoreError::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            if status.as_u16() == 403 || status.as_u16() == 429 {
                CoreError::Blocked(e.to_string())
            } else if status.as_u16() == 404 || status.as_u16() == 410 {
                CoreError::DeadUrl(e.to_string())
            } else {
                CoreError::Transient(e.to_string())
            }
        } else {
            CoreError::Transient(e.to_string())
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Fatal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::SchemaViolation(format!("json: {e}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
