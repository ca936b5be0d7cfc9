//! Cross-origin policy for the realtime handshake.

use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::ApiError;

/// Allow-list of browser origins that may open a realtime connection.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<HeaderValue>,
}

impl OriginPolicy {
    pub fn new(origins: &[String]) -> Self {
        let allowed = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "ignoring malformed allowed origin");
                    None
                }
            })
            .collect();
        Self { allowed }
    }

    pub fn allows(&self, origin: &HeaderValue) -> bool {
        self.allowed.iter().any(|allowed| allowed == origin)
    }

    /// Reject handshakes from browser origins outside the allow-list.
    /// Requests without an `Origin` header (non-browser clients) pass.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        match headers.get(ORIGIN) {
            Some(origin) if !self.allows(origin) => {
                tracing::warn!(origin = ?origin, "realtime handshake from disallowed origin");
                Err(ApiError::forbidden("Origin not allowed"))
            }
            _ => Ok(()),
        }
    }

    /// Credentialed CORS for the polling transport.
    pub fn cors_layer(&self) -> CorsLayer {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(self.allowed.clone()))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([CONTENT_TYPE])
            .allow_credentials(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEV_ORIGINS;
    use axum::http::StatusCode;

    fn dev_policy() -> OriginPolicy {
        let origins: Vec<String> = DEV_ORIGINS.iter().map(|o| o.to_string()).collect();
        OriginPolicy::new(&origins)
    }

    fn with_origin(origin: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(origin));
        headers
    }

    #[test]
    fn accepts_listed_origins() {
        let policy = dev_policy();
        assert!(policy.check(&with_origin("http://localhost:3000")).is_ok());
        assert!(policy.check(&with_origin("http://127.0.0.1:3000")).is_ok());
    }

    #[test]
    fn rejects_unlisted_origin() {
        let policy = dev_policy();
        let err = policy.check(&with_origin("https://evil.example")).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn missing_origin_is_allowed() {
        assert!(dev_policy().check(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn production_policy_is_exact() {
        let policy = OriginPolicy::new(&["https://memecoin.example".to_string()]);
        assert!(policy.allows(&HeaderValue::from_static("https://memecoin.example")));
        assert!(!policy.allows(&HeaderValue::from_static("http://localhost:3000")));
        assert!(!policy.allows(&HeaderValue::from_static("https://memecoin.example.evil")));
    }
}
