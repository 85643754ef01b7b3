use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

/// Relay-level error taxonomy. Every variant renders as the OpenAI error
/// envelope `{"error": {"message", "type", "code"}}` with a fixed status.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Request body did not parse into the chat-completion shape.
    #[error("{0}")]
    MalformedRequest(String),

    /// A field parsed but its value is semantically invalid.
    #[error("{0}")]
    InvalidParameter(String),

    /// The first system message carries non-text content.
    #[error("{0}")]
    UnsupportedContentType(String),

    /// No configured channel serves the requested model.
    #[error("no channel serves model '{0}'")]
    ModelNotFound(String),

    /// The bound channel's backend lacks the requested capability.
    #[error("{0}")]
    ChannelError(String),

    /// The backend itself failed; the upstream status is preserved.
    #[error("{message}")]
    Provider { status: u16, message: String },

    /// Failure writing to the caller; terminal, never retried.
    #[error("{0}")]
    Transport(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::MalformedRequest(_) => "malformed_request",
            RelayError::InvalidParameter(_) => "invalid_parameter",
            RelayError::UnsupportedContentType(_) => "unsupported_content_type",
            RelayError::ModelNotFound(_) => "model_not_found",
            RelayError::ChannelError(_) => "channel_error",
            RelayError::Provider { .. } => "provider_error",
            RelayError::Transport(_) => "transport_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::MalformedRequest(_)
            | RelayError::InvalidParameter(_)
            | RelayError::UnsupportedContentType(_) => StatusCode::BAD_REQUEST,
            RelayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::ChannelError(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Provider { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

fn status_to_type(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad_request",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::TOO_MANY_REQUESTS => "too_many_requests",
        StatusCode::INTERNAL_SERVER_ERROR => "internal_server_error",
        StatusCode::BAD_GATEWAY => "bad_gateway",
        StatusCode::SERVICE_UNAVAILABLE => "service_unavailable",
        StatusCode::GATEWAY_TIMEOUT => "gateway_timeout",
        s if s.is_client_error() => "invalid_request_error",
        _ => "upstream_error",
    }
}

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(json!({
            "error": {
                "message": self.to_string(),
                "type": status_to_type(self.status()),
                "code": self.code(),
            }
        }))
    }
}
