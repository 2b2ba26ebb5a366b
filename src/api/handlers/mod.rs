pub mod auth;
pub mod health;
pub mod users;

// common functions for the handlers
use crate::{engine::AuthEngine, error::AuthError};
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error};

static EMAIL_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$"));

#[must_use]
pub fn valid_email(email: &str) -> bool {
    EMAIL_RE
        .as_ref()
        .map_or(false, |re| re.is_match(email))
}

/// An [`AuthError`] on its way out as an HTTP response.
///
/// Only [`AuthError::public_message`] reaches the client.
#[derive(Debug)]
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.0 {
            AuthError::InvalidCredentials
            | AuthError::UnknownUser
            | AuthError::ChallengeAbsent
            | AuthError::ChallengeExpired
            | AuthError::ChallengeMismatch
            | AuthError::AssertionRejected(_)
            | AuthError::SessionNotFound
            | AuthError::SessionExpired
            | AuthError::SessionBindingViolation => StatusCode::UNAUTHORIZED,
            AuthError::AccountLocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::OriginBlocked | AuthError::PermissionDenied => StatusCode::FORBIDDEN,
            AuthError::HoneypotTriggered => StatusCode::NOT_FOUND,
            AuthError::UserExists => StatusCode::CONFLICT,
            AuthError::WeakSecret { .. } => StatusCode::BAD_REQUEST,
            AuthError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        } else {
            debug!("request rejected: {}", self.0);
        }

        let mut response = (status, Json(json!({ "error": self.0.public_message() }))).into_response();
        if let AuthError::AccountLocked { remaining_seconds } = self.0 {
            if let Ok(value) = HeaderValue::from_str(&remaining_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Response for a request without a usable JSON body.
pub fn missing_payload() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Missing payload" })),
    )
        .into_response()
}

/// Token from `Authorization: Bearer <token>`.
///
/// # Errors
/// [`AuthError::SessionNotFound`] when the header is absent or malformed.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .ok_or(ApiError(AuthError::SessionNotFound))
}

/// Run an engine call off the async workers; key derivation is CPU bound.
///
/// # Errors
/// The engine error, or [`AuthError::Internal`] if the task panicked.
pub async fn blocking<T, F>(engine: Arc<AuthEngine>, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AuthEngine) -> Result<T, AuthError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(engine.as_ref()))
        .await
        .map_err(|e| ApiError(AuthError::Internal(e.to_string())))?
        .map_err(ApiError)
}

// axum fallback for unknown routes
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{
        api::router,
        challenge::RecordingDelivery,
        clock::ManualClock,
        config::AuthConfig,
        engine::AuthEngine,
    };
    use anyhow::{anyhow, Result};
    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use std::{net::SocketAddr, sync::Arc};
    use tower::ServiceExt;

    pub(crate) const PASSWORD: &str = "Correct#Horse42";
    pub(crate) const PIN: &str = "2468";
    pub(crate) const FORWARDED: &str = "203.0.113.20";

    /// Socket peer of test requests: the local reverse proxy.
    pub(crate) fn proxy_peer() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000)))
    }

    pub(crate) struct TestApp {
        pub(crate) router: Router,
        pub(crate) engine: Arc<AuthEngine>,
        pub(crate) delivery: Arc<RecordingDelivery>,
    }

    pub(crate) fn app() -> Result<TestApp> {
        let delivery = Arc::new(RecordingDelivery::new());
        let config = AuthConfig::new().with_escalate_on_anomaly(false);
        let engine = Arc::new(
            AuthEngine::builder(config)
                .with_clock(Arc::new(ManualClock::at_noon()))
                .with_delivery(delivery.clone())
                .build()?,
        );
        Ok(TestApp {
            router: router(engine.clone()),
            engine,
            delivery,
        })
    }

    /// One request from the default test client; returns status and JSON body.
    pub(crate) async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
        token: Option<&str>,
    ) -> Result<(StatusCode, serde_json::Value)> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(proxy_peer())
            .header("x-forwarded-for", FORWARDED)
            .header(header::USER_AGENT, "authguard-tests");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, json))
    }

    /// Six digit code of the last delivered message.
    pub(crate) fn code_from(delivery: &RecordingDelivery) -> Result<String> {
        let body = delivery
            .last()
            .map(|m| m.body)
            .ok_or_else(|| anyhow!("nothing delivered"))?;
        body.split(|c: char| !c.is_ascii_digit())
            .find(|part| part.len() == 6)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("no code in body"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn statuses_follow_error_kind() {
        assert_eq!(
            ApiError(AuthError::ChallengeMismatch).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError(AuthError::UserExists).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError(AuthError::HoneypotTriggered).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(AuthError::PersistenceUnavailable("disk".to_string())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn locked_account_sets_retry_after() -> anyhow::Result<()> {
        let response = ApiError(AuthError::AccountLocked {
            remaining_seconds: 120,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("120")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(body["error"], "Too many attempts, try again later");
        Ok(())
    }

    #[tokio::test]
    async fn details_never_reach_the_client() -> anyhow::Result<()> {
        let response = ApiError(AuthError::Internal("db password=hunter2".to_string())).into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body = String::from_utf8(body.to_vec())?;
        assert!(!body.contains("hunter2"));
        assert!(body.contains("Service unavailable"));
        Ok(())
    }

    #[test]
    fn email_shape() {
        assert!(valid_email("alice@example.com"));
        assert!(!valid_email("alice@example"));
        assert!(!valid_email("al ice@example.com"));
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).ok().as_deref(), Some("abc123"));
    }
}
