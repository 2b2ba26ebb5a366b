//! Login, second factor and session handlers.

use super::{bearer_token, blocking, missing_payload, ApiError};
use crate::{
    context::RequestContext,
    engine::{AuthEngine, LoginCredentials, LoginOutcome, Proof},
    threat::Anomaly,
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub ticket: Uuid,
    #[serde(flatten)]
    pub proof: Proof,
}

#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub ticket: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChange {
    pub current_password: SecretString,
    pub pin: SecretString,
    pub new_password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct PinChange {
    pub password: SecretString,
    pub current_pin: SecretString,
    pub new_pin: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct MfaToggle {
    pub enabled: bool,
}

fn authenticated(username: &str, token: &str, anomalies: &[Anomaly]) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "authenticated",
            "username": username,
            "token": token,
            "anomalies": anomalies,
        })),
    )
        .into_response()
}

#[instrument(skip_all, fields(origin = %ctx.origin()))]
pub async fn login(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    payload: Option<Json<LoginCredentials>>,
) -> Result<Response, ApiError> {
    let Some(Json(credentials)) = payload else {
        return Ok(missing_payload());
    };

    let outcome = blocking(engine, move |engine| engine.login(&credentials, &ctx)).await?;

    match outcome {
        LoginOutcome::Authenticated {
            username,
            token,
            anomalies,
        } => Ok(authenticated(&username, &token, &anomalies)),
        challenge @ LoginOutcome::ChallengeRequired { .. } => {
            Ok((StatusCode::ACCEPTED, Json(challenge)).into_response())
        }
    }
}

#[instrument(skip_all, fields(origin = %ctx.origin()))]
pub async fn mfa_verify(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    payload: Option<Json<VerifyRequest>>,
) -> Result<Response, ApiError> {
    let Some(Json(request)) = payload else {
        return Ok(missing_payload());
    };

    let (username, token) = blocking(engine, move |engine| {
        let token = engine.complete_login(request.ticket, &request.proof, &ctx)?;
        let session = engine.validate_session(&token, Some(&ctx))?;
        Ok((session.username, token))
    })
    .await?;

    Ok(authenticated(&username, &token, &[]))
}

pub async fn mfa_resend(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    payload: Option<Json<TicketRequest>>,
) -> Result<Response, ApiError> {
    let Some(Json(request)) = payload else {
        return Ok(missing_payload());
    };

    let delivered = blocking(engine, move |engine| {
        engine.resend_challenge(request.ticket, &ctx)
    })
    .await?;

    Ok(Json(json!({ "delivered": delivered })).into_response())
}

pub async fn webauthn_challenge(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    payload: Option<Json<TicketRequest>>,
) -> Result<Response, ApiError> {
    let Some(Json(request)) = payload else {
        return Ok(missing_payload());
    };

    let challenge = engine.begin_webauthn(request.ticket, &ctx)?;
    Ok(Json(json!({
        "challenge": challenge,
        "rp_id": engine.config().webauthn_rp_id(),
    }))
    .into_response())
}

pub async fn session(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let principal = engine.authorize(&token, None, &ctx)?;
    Ok(Json(principal).into_response())
}

pub async fn logout(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers)?;
    let principal = engine.authorize(&token, None, &ctx)?;
    engine.revoke_session(&token, &principal.username);
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(origin = %ctx.origin()))]
pub async fn change_password(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    payload: Option<Json<PasswordChange>>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let Some(Json(change)) = payload else {
        return Ok(missing_payload());
    };

    let revoked = blocking(engine, move |engine| {
        engine.change_password(
            &token,
            change.current_password.expose_secret(),
            change.pin.expose_secret(),
            change.new_password.expose_secret(),
            &ctx,
        )
    })
    .await?;

    Ok(Json(json!({ "revoked_sessions": revoked })).into_response())
}

#[instrument(skip_all, fields(origin = %ctx.origin()))]
pub async fn change_pin(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    payload: Option<Json<PinChange>>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let Some(Json(change)) = payload else {
        return Ok(missing_payload());
    };

    let revoked = blocking(engine, move |engine| {
        engine.change_pin(
            &token,
            change.password.expose_secret(),
            change.current_pin.expose_secret(),
            change.new_pin.expose_secret(),
            &ctx,
        )
    })
    .await?;

    Ok(Json(json!({ "revoked_sessions": revoked })).into_response())
}

pub async fn set_mfa(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    payload: Option<Json<MfaToggle>>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let Some(Json(toggle)) = payload else {
        return Ok(missing_payload());
    };

    blocking(engine, move |engine| {
        engine.set_mfa_enabled(&token, toggle.enabled, &ctx)
    })
    .await?;

    Ok(Json(json!({ "mfa_enabled": toggle.enabled })).into_response())
}

pub async fn enroll_totp(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let enrollment = engine.enroll_totp(&token, &ctx)?;
    Ok((StatusCode::CREATED, Json(enrollment)).into_response())
}
