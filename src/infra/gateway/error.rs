use libris_api_types::ApiErrorBody;
use thiserror::Error;

/// Classified failure of a backend call.
///
/// Cloneable so a single in-flight result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Timeout, connection refused, DNS failure.
    #[error("network error: {message}")]
    Network { message: String },
    /// 401: the session is no longer valid.
    #[error("session expired")]
    Unauthorized,
    /// 403.
    #[error("access denied: {message}")]
    Forbidden { message: String },
    /// 404. Some call sites look up optional resources, so this is never toasted globally.
    #[error("not found: {message}")]
    NotFound { message: String },
    /// 5xx.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// 400 with a structured message a view can map onto a form field.
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
    #[error("failed to decode response: {message}")]
    Decode { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

const GENERIC_SERVER_MESSAGE: &str = "the server failed to handle the request";

impl GatewayError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn server(status: u16) -> Self {
        Self::Server {
            status,
            message: GENERIC_SERVER_MESSAGE.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status and its (possibly empty) body onto the taxonomy.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let parsed: ApiErrorBody = serde_json::from_slice(body).unwrap_or_default();
        let message = parsed
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());

        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden { message },
            404 => Self::NotFound { message },
            400 | 422 => Self::Validation {
                message,
                field: parsed.field,
            },
            500..=599 => Self::server(status),
            _ => Self::Server { status, message },
        }
    }

    /// Transient failures that a retry may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Server { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Short machine-readable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Server { .. } => "server",
            Self::Validation { .. } => "validation",
            Self::Decode { .. } => "decode",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::decode(error.to_string());
        }
        if let Some(status) = error.status() {
            return Self::from_status(status.as_u16(), &[]);
        }
        Self::network(error.to_string())
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(error: url::ParseError) -> Self {
        Self::invalid_request(format!("invalid URL: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(GatewayError::from_status(401, b""), GatewayError::Unauthorized);
        assert!(matches!(
            GatewayError::from_status(403, b"{}"),
            GatewayError::Forbidden { .. }
        ));
        assert!(GatewayError::from_status(404, b"").is_not_found());
        assert!(matches!(
            GatewayError::from_status(503, b"upstream down"),
            GatewayError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn validation_keeps_message_and_field_verbatim() {
        let body = br#"{"message":"ISBN already exists","field":"isbn"}"#;
        let err = GatewayError::from_status(400, body);
        assert_eq!(
            err,
            GatewayError::Validation {
                message: "ISBN already exists".to_string(),
                field: Some("isbn".to_string()),
            }
        );
        assert_eq!(err.to_string(), "ISBN already exists");
    }

    #[test]
    fn server_errors_use_generic_message() {
        let err = GatewayError::from_status(500, br#"{"message":"NullPointerException at ..."}"#);
        assert_eq!(err.to_string(), format!("server error (500): {GENERIC_SERVER_MESSAGE}"));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(GatewayError::network("timeout").is_retryable());
        assert!(GatewayError::server(502).is_retryable());
        assert!(!GatewayError::Unauthorized.is_retryable());
        assert!(!GatewayError::not_found("book").is_retryable());
        assert!(!GatewayError::validation("bad", None).is_retryable());
    }
}
