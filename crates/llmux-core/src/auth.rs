//! Inbound request authentication.

use http::HeaderMap;

use llmux_common::error::GatewayError;

use crate::config::GatewayConfig;

/// Pull the client key from any of the accepted locations:
/// `Authorization: Bearer`, `x-api-key`, `x-goog-api-key`, or `?key=`.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && !token.trim().is_empty()
    {
        return Some(token.trim().to_string());
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(value) = value.to_str()
            && !value.trim().is_empty()
        {
            return Some(value.trim().to_string());
        }
    }
    let query = query?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=")
            && !value.is_empty()
        {
            return Some(value.to_string());
        }
    }
    None
}

pub fn authorize(config: &GatewayConfig, provided: Option<&str>) -> Result<(), GatewayError> {
    let Some(required) = config.required_api_key.as_deref() else {
        return Ok(());
    };
    match provided {
        Some(key) if key == required => Ok(()),
        _ => Err(GatewayError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn all_key_locations_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-1"),
        );
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("sk-1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-2"));
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("sk-2"));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("sk-3"));
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("sk-3"));

        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, Some("alt=sse&key=sk-4")).as_deref(),
            Some("sk-4")
        );
        assert_eq!(extract_api_key(&headers, Some("alt=sse")), None);
    }

    #[test]
    fn authorization_requires_exact_match_when_configured() {
        let mut config = GatewayConfig::default();
        assert!(authorize(&config, None).is_ok());
        config.required_api_key = Some("secret".to_string());
        assert!(authorize(&config, Some("secret")).is_ok());
        assert!(matches!(
            authorize(&config, Some("wrong")),
            Err(GatewayError::Unauthorized)
        ));
        assert!(matches!(
            authorize(&config, None),
            Err(GatewayError::Unauthorized)
        ));
    }
}
