//! Rendering gateway errors in the client's requested dialect.

use serde_json::{Value as JsonValue, json};

use llmux_common::error::{GatewayError, ProviderError};
use llmux_pool::record::WireDialect;

/// Map an error onto the HTTP status and the body shape the client's
/// dialect expects. Provider identity never leaks into the message.
pub fn render_error(dialect: WireDialect, err: &GatewayError) -> (u16, JsonValue) {
    let status = err.http_status();
    let message = client_message(err);
    let body = match dialect {
        WireDialect::Claude => json!({
            "type": "error",
            "error": { "type": claude_error_type(status), "message": message },
        }),
        WireDialect::OpenAi => json!({
            "error": {
                "message": message,
                "type": openai_error_type(status),
                "code": JsonValue::Null,
            },
        }),
        WireDialect::Gemini => json!({
            "error": {
                "code": status,
                "message": message,
                "status": gemini_status(status),
            },
        }),
    };
    (status, body)
}

fn client_message(err: &GatewayError) -> String {
    match err {
        GatewayError::Unauthorized => "missing or invalid api key".to_string(),
        GatewayError::BadRequest(msg) => msg.clone(),
        GatewayError::NoProviderAvailable { .. } => {
            "no upstream is currently able to serve this request".to_string()
        }
        GatewayError::Provider(provider_err) => match provider_err {
            ProviderError::UpstreamStatus { status, .. } => {
                format!("upstream rejected the request with status {status}")
            }
            ProviderError::NotSupported(what) => format!("not supported: {what}"),
            // Credential/refresh/network details stay server-side.
            _ => "upstream request failed".to_string(),
        },
    }
}

fn claude_error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        500..=599 => "api_error",
        _ => "invalid_request_error",
    }
}

fn openai_error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "invalid_api_key",
        429 => "rate_limit_exceeded",
        _ => "server_error",
    }
}

fn gemini_status(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 | 403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_errors_use_anthropic_envelope() {
        let (status, body) = render_error(WireDialect::Claude, &GatewayError::Unauthorized);
        assert_eq!(status, 401);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[test]
    fn provider_identity_does_not_leak() {
        let err = GatewayError::Provider(ProviderError::RefreshFailed {
            status: 400,
            provider_uuid: "secret-uuid".to_string(),
        });
        for dialect in [WireDialect::OpenAi, WireDialect::Claude, WireDialect::Gemini] {
            let (_, body) = render_error(dialect, &err);
            assert!(!body.to_string().contains("secret-uuid"));
        }
    }
}
