//! Typed error taxonomy.
//!
//! Internal modules return `Result<T, OvsError>`; only the HTTP boundary
//! renders these into the shared wire envelope. The `kind` discriminant is
//! wire-stable — handlers, the engine's retry policy, and the external
//! envelope all key off it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Wire-stable error discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Policy,
    NotFound,
    Duplicate,
    Conflict,
    Timeout,
    CircuitOpen,
    RateLimited,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Policy => "POLICY",
            Self::NotFound => "NOT_FOUND",
            Self::Duplicate => "DUPLICATE",
            Self::Conflict => "CONFLICT",
            Self::Timeout => "TIMEOUT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::Transient => "TRANSIENT",
            Self::Internal => "INTERNAL",
        }
    }

    /// Step handlers retry only TRANSIENT failures; everything else bubbles.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALIDATION" => Ok(Self::Validation),
            "POLICY" => Ok(Self::Policy),
            "NOT_FOUND" => Ok(Self::NotFound),
            "DUPLICATE" => Ok(Self::Duplicate),
            "CONFLICT" => Ok(Self::Conflict),
            "TIMEOUT" => Ok(Self::Timeout),
            "CIRCUIT_OPEN" => Ok(Self::CircuitOpen),
            "RATE_LIMITED" => Ok(Self::RateLimited),
            "TRANSIENT" => Ok(Self::Transient),
            "INTERNAL" => Ok(Self::Internal),
            other => Err(format!("unknown error kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// OvsError
// ---------------------------------------------------------------------------

/// The single fallible-operation error type used across crate boundaries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OvsError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured context surfaced in the wire envelope. Must already be
    /// masked — this value travels to clients verbatim.
    pub details: Option<Value>,
}

impl OvsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// The shared HTTP error envelope: `{"error": {"kind", "message", "details"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub error: WireErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<OvsError> for WireError {
    fn from(e: OvsError) -> Self {
        Self {
            error: WireErrorBody {
                kind: e.kind,
                message: e.message,
                details: e.details,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        for k in [
            ErrorKind::Validation,
            ErrorKind::Policy,
            ErrorKind::NotFound,
            ErrorKind::Duplicate,
            ErrorKind::Conflict,
            ErrorKind::Timeout,
            ErrorKind::CircuitOpen,
            ErrorKind::RateLimited,
            ErrorKind::Internal,
        ] {
            assert!(!k.is_retryable(), "{k} must not be retryable");
        }
        assert!(ErrorKind::Transient.is_retryable());
    }

    #[test]
    fn envelope_shape_matches_contract() {
        let e = OvsError::circuit_open("inventory service unavailable")
            .with_details(serde_json::json!({"retry_after_secs": 30}));
        let wire: WireError = e.into();
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["error"]["kind"], "CIRCUIT_OPEN");
        assert_eq!(v["error"]["details"]["retry_after_secs"], 30);
    }

    #[test]
    fn details_omitted_when_absent() {
        let wire: WireError = OvsError::not_found("no such execution").into();
        let s = serde_json::to_string(&wire).unwrap();
        assert!(!s.contains("details"));
    }
}
