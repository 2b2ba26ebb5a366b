//! HTTP adapter over [`AuthEngine`].

use crate::engine::AuthEngine;
use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header, HeaderName, HeaderValue, Request},
    middleware,
    routing::{get, post, put},
    Extension, Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer,
    set_header::{SetRequestHeaderLayer, SetResponseHeaderLayer},
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

pub mod handlers;
mod guard;

pub use guard::client_context;

const REQUEST_ID: &str = "x-request-id";

/// Build the application router with every layer attached.
#[must_use]
pub fn router(engine: Arc<AuthEngine>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/v1/auth/login", post(handlers::auth::login))
        .route("/v1/auth/mfa/verify", post(handlers::auth::mfa_verify))
        .route("/v1/auth/mfa/resend", post(handlers::auth::mfa_resend))
        .route(
            "/v1/auth/webauthn/challenge",
            post(handlers::auth::webauthn_challenge),
        )
        .route("/v1/auth/session", get(handlers::auth::session))
        .route("/v1/auth/logout", post(handlers::auth::logout))
        .route("/v1/auth/password", post(handlers::auth::change_password))
        .route("/v1/auth/pin", post(handlers::auth::change_pin))
        .route("/v1/auth/mfa", put(handlers::auth::set_mfa))
        .route("/v1/auth/mfa/totp", post(handlers::auth::enroll_totp))
        .route("/v1/users", post(handlers::users::create_user))
        .route("/v1/users/:username/role", put(handlers::users::set_role))
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID,
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::REFERRER_POLICY,
                    HeaderValue::from_static("strict-origin-when-cross-origin"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::STRICT_TRANSPORT_SECURITY,
                    HeaderValue::from_static("max-age=31536000; includeSubDomains"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::CONTENT_SECURITY_POLICY,
                    HeaderValue::from_static("default-src 'self'"),
                ))
                .layer(middleware::from_fn_with_state(
                    engine.clone(),
                    guard::guard_requests,
                ))
                .layer(Extension(engine)),
        )
}

/// Serve the API on `port` until `shutdown` resolves.
///
/// # Errors
/// Return error if failed to start the server
pub async fn serve(
    port: u16,
    engine: Arc<AuthEngine>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(engine);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

#[cfg(test)]
mod tests {
    use super::{
        handlers::testing::{app, proxy_peer, send, FORWARDED},
        REQUEST_ID,
    };
    use anyhow::Result;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn responses_carry_security_headers_and_request_id() -> Result<()> {
        let t = app()?;
        let request = Request::builder()
            .uri("/health")
            .extension(proxy_peer())
            .header("x-forwarded-for", FORWARDED)
            .body(Body::empty())?;
        let response = t.router.clone().oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get("x-content-type-options").and_then(|v| v.to_str().ok()),
            Some("nosniff")
        );
        assert_eq!(
            headers.get("x-frame-options").and_then(|v| v.to_str().ok()),
            Some("DENY")
        );
        assert!(headers.contains_key("strict-transport-security"));
        assert!(headers.contains_key("content-security-policy"));
        assert!(headers.contains_key(REQUEST_ID));
        assert!(headers.contains_key("x-app"));
        Ok(())
    }

    #[tokio::test]
    async fn honeypot_blocks_the_origin() -> Result<()> {
        let t = app()?;
        let (status, body) = send(&t.router, Method::GET, "/wp-admin/setup.php?x=1", None, None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");

        let (status, body) = send(&t.router, Method::GET, "/health", None, None).await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Too many attempts, try again later");
        assert!(t.engine.check_origin(FORWARDED).is_blocked());

        t.engine.clear_origin(FORWARDED);
        let (status, _) = send(&t.router, Method::GET, "/health", None, None).await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn spoofed_forwarding_cannot_frame_another_client() -> Result<()> {
        let t = app()?;
        let request = Request::builder()
            .uri("/admin")
            .extension(axum::extract::ConnectInfo(std::net::SocketAddr::from((
                [192, 0, 2, 50],
                50_000,
            ))))
            .header("x-forwarded-for", FORWARDED)
            .body(Body::empty())?;
        let response = t.router.clone().oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(t.engine.check_origin("192.0.2.50").is_blocked());
        assert!(!t.engine.check_origin(FORWARDED).is_blocked());
        let (status, _) = send(&t.router, Method::GET, "/health", None, None).await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() -> Result<()> {
        let t = app()?;
        let (status, body) = send(&t.router, Method::GET, "/v1/nothing", None, None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
        assert!(!t.engine.check_origin(FORWARDED).is_blocked());
        Ok(())
    }
}
