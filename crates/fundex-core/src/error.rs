//! Error taxonomy shared by every stage of an ingestion run.
//!
//! Per-identifier errors are `Clone + Serialize` so they can travel inside
//! run outcomes and be written to run reports verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MAX_TICKER_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier `{0}` contains whitespace")]
    EmbeddedWhitespace(String),
    #[error("identifier `{0}` is longer than {max} characters", max = MAX_TICKER_LEN)]
    TooLong(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited by remote service")]
    RateLimited,
    #[error("request rejected as unauthorized (http {0})")]
    Unauthorized(u16),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("response could not be decoded: {0}")]
    Decode(String),
    #[error("identifier absent from batch response")]
    MissingFromResponse,
    #[error("identifier not found by remote service")]
    NotFound,
}

impl FetchError {
    /// Failures that say nothing about the identifier and everything about reaching the service.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Network(_) | FetchError::Unauthorized(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NormalizeError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(IdentifierError),
    #[error("attribute bag is empty")]
    EmptyBag,
    #[error("attribute bag is malformed: {0}")]
    MalformedBag(String),
    #[error("attribute bag belongs to `{found}`, expected `{expected}`")]
    IdentifierMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PersistError {
    #[error("store rejected record: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("batch size must be positive, got {0}")]
    InvalidBatchSize(usize),
    #[error("hours window must be a finite, non-negative number, got {0}")]
    InvalidWindow(f64),
    #[error("request timeout must be positive")]
    InvalidTimeout,
    #[error("maximum magnitude must be positive, got {0}")]
    InvalidMagnitude(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_classification() {
        assert!(FetchError::Timeout(5_000).is_connectivity());
        assert!(FetchError::Network("dns".into()).is_connectivity());
        assert!(FetchError::Unauthorized(401).is_connectivity());
        assert!(!FetchError::NotFound.is_connectivity());
        assert!(!FetchError::MissingFromResponse.is_connectivity());
        assert!(!FetchError::Decode("eof".into()).is_connectivity());
    }

    #[test]
    fn fetch_errors_serialize_with_kind_tag() {
        let json = serde_json::to_value(FetchError::Timeout(250)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "timeout", "detail": 250}));
        let json = serde_json::to_value(FetchError::NotFound).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "not_found"}));
    }
}
