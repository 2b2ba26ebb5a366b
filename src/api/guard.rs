//! Request guard middleware and client context extraction.

use super::handlers::ApiError;
use crate::{config::AuthConfig, context::RequestContext, engine::AuthEngine};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};

const UNKNOWN_ORIGIN: &str = "unknown";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Source address of the client. Proxy headers count only when the socket
/// peer is a trusted proxy; without a peer the origin is unknown.
fn client_origin(headers: &HeaderMap, peer: Option<SocketAddr>, config: &AuthConfig) -> String {
    let Some(peer) = peer else {
        return UNKNOWN_ORIGIN.to_string();
    };
    if !config.is_trusted_proxy(peer.ip()) {
        return peer.ip().to_string();
    }

    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(origin) = forwarded.or_else(|| header_str(headers, "x-real-ip")) {
        return origin.to_string();
    }
    peer.ip().to_string()
}

/// Build the request context of one HTTP request.
#[must_use]
pub fn client_context(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    config: &AuthConfig,
) -> RequestContext {
    RequestContext::from_client(
        client_origin(headers, peer, config),
        header_str(headers, header::USER_AGENT.as_str()),
        header_str(headers, header::ACCEPT_LANGUAGE.as_str()),
        header_str(headers, header::ACCEPT_ENCODING.as_str()),
    )
}

/// Run the request guard pipeline and hand the context to the handlers.
pub async fn guard_requests(
    State(engine): State<Arc<AuthEngine>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ctx = client_context(request.headers(), peer, engine.config());

    if let Err(e) = engine.guard_request(&ctx, request.uri().path()) {
        return ApiError::from(e).into_response();
    }

    request.extensions_mut().insert(ctx);
    next.run(request).await
}
