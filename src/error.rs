use http::StatusCode;
use std::fmt;

/// The error taxonomy shared by transformers, trippers and the engine.
///
/// Display strings are wire sentinels: transformers recognize the errors
/// they can handle by matching on these, and the engine's fallback table
/// maps them to HTTP statuses. Anything outside the table surfaces as 500
/// and bumps the internal-errors counter.
#[derive(Debug)]
pub enum GatewayError {
    /// No rule bound to the request when the transport ran.
    NoMapping,
    /// The bound rule restricts methods and this one is not listed.
    MethodNotAllowed,
    /// Missing or rejected credentials (basic auth, bearer lookup).
    NoAuth,
    /// A JWT was presented but its signature did not verify.
    SignatureInvalid,
    /// A barrage rule matched a header or body.
    Barraged,
    /// A script ran to completion and voted the request down.
    ScriptRejected,
    /// The rate limiter counted past its window limit.
    RateLimit,
    /// OpenAPI validation failure; carries the validator detail.
    Validation(String),
    /// A tripper took ownership of the connection (websocket upgrade).
    /// Never user-visible: the error handler swallows it.
    ConnectionHijacked,
    /// Origin round-trip failure (connect, timeout, protocol).
    Upstream(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoMapping => write!(f, "no_mapping"),
            GatewayError::MethodNotAllowed => write!(f, "method_not_allowed"),
            GatewayError::NoAuth => write!(f, "no_auth"),
            GatewayError::SignatureInvalid => write!(f, "signature is invalid"),
            GatewayError::Barraged => write!(f, "barraged"),
            GatewayError::ScriptRejected => write!(f, "script_rejected"),
            GatewayError::RateLimit => write!(f, "rate_limit"),
            GatewayError::Validation(detail) => write!(f, "validation_error: {}", detail),
            GatewayError::ConnectionHijacked => write!(f, "connection_hijacked"),
            GatewayError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// The built-in sentinel → status table. `None` means the failure is
    /// unmapped: the engine answers 500 and counts it as an internal error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::NoMapping => Some(StatusCode::NOT_FOUND),
            GatewayError::MethodNotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
            GatewayError::NoAuth | GatewayError::SignatureInvalid => Some(StatusCode::UNAUTHORIZED),
            GatewayError::Barraged | GatewayError::ScriptRejected => Some(StatusCode::FORBIDDEN),
            GatewayError::RateLimit => Some(StatusCode::TOO_MANY_REQUESTS),
            GatewayError::Validation(_) => Some(StatusCode::BAD_REQUEST),
            GatewayError::ConnectionHijacked => None,
            GatewayError::Upstream(_) | GatewayError::Internal(_) => None,
        }
    }

    pub fn is_hijack(&self) -> bool {
        matches!(self, GatewayError::ConnectionHijacked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_display() {
        assert_eq!(GatewayError::NoMapping.to_string(), "no_mapping");
        assert_eq!(GatewayError::NoAuth.to_string(), "no_auth");
        assert_eq!(
            GatewayError::SignatureInvalid.to_string(),
            "signature is invalid"
        );
        assert_eq!(
            GatewayError::Validation("missing parameter id".into()).to_string(),
            "validation_error: missing parameter id"
        );
    }

    #[test]
    fn test_status_table() {
        assert_eq!(GatewayError::NoMapping.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(
            GatewayError::MethodNotAllowed.status(),
            Some(StatusCode::METHOD_NOT_ALLOWED)
        );
        assert_eq!(
            GatewayError::RateLimit.status(),
            Some(StatusCode::TOO_MANY_REQUESTS)
        );
        assert_eq!(GatewayError::Barraged.status(), Some(StatusCode::FORBIDDEN));
        assert!(GatewayError::Internal("boom".into()).status().is_none());
        assert!(GatewayError::ConnectionHijacked.status().is_none());
    }
}
