//! API key check for the tool endpoints
//!
//! The key may be sent bare in `Authorization` or with a `Bearer`/`Token`
//! scheme. With no key configured every request passes.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::error::ApiError;
use crate::server::AppState;

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    if extract_key(req.headers()).as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        debug!("Rejected {} {}: bad or missing key", req.method(), req.uri().path());
        Err(ApiError::unauthorized())
    }
}

pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    if let Some((scheme, rest)) = value.split_once(' ') {
        match scheme.to_ascii_lowercase().as_str() {
            "bearer" | "token" => return Some(rest.trim().to_string()),
            _ => {}
        }
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bare_key() {
        assert_eq!(extract_key(&headers("secret")).as_deref(), Some("secret"));
    }

    #[test]
    fn test_bearer_and_token_schemes() {
        assert_eq!(extract_key(&headers("Bearer secret")).as_deref(), Some("secret"));
        assert_eq!(extract_key(&headers("token  secret ")).as_deref(), Some("secret"));
    }

    #[test]
    fn test_missing_or_blank() {
        assert!(extract_key(&HeaderMap::new()).is_none());
        assert!(extract_key(&headers("  ")).is_none());
    }
}
