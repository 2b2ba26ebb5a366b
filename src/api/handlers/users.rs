use super::{bearer_token, blocking, missing_payload, valid_email, ApiError};
use crate::{
    context::RequestContext,
    credentials::NewUser,
    engine::AuthEngine,
    rbac::Role,
};
use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub email: String,
    pub password: SecretString,
    pub pin: SecretString,
    pub role: Option<Role>,
    #[serde(default)]
    pub mfa_enabled: bool,
}

impl From<CreateUser> for NewUser {
    fn from(user: CreateUser) -> Self {
        Self {
            username: user.username,
            email: user.email,
            password: user.password,
            pin: user.pin,
            role: user.role.unwrap_or(Role::User),
            mfa_enabled: user.mfa_enabled,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoleChange {
    pub role: Role,
}

#[instrument(skip_all, fields(origin = %ctx.origin()))]
pub async fn create_user(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    payload: Option<Json<CreateUser>>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let Some(Json(user)) = payload else {
        return Ok(missing_payload());
    };

    if !valid_email(&user.email) {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid email" })),
        )
            .into_response());
    }

    let new_user = NewUser::from(user);
    let profile = blocking(engine, move |engine| {
        engine.create_user(&token, &new_user, &ctx)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(profile)).into_response())
}

pub async fn set_role(
    Extension(engine): Extension<Arc<AuthEngine>>,
    Extension(ctx): Extension<RequestContext>,
    Path(username): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<RoleChange>>,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let Some(Json(change)) = payload else {
        return Ok(missing_payload());
    };

    blocking(engine, move |engine| {
        engine.set_role(&token, &username, change.role, &ctx)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{app, send, PASSWORD, PIN};
    use crate::{credentials::NewUser, rbac::Role};
    use anyhow::Result;
    use axum::http::{Method, StatusCode};
    use secrecy::SecretString;
    use serde_json::json;

    fn seeded(username: &str, role: Role) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: SecretString::from(PASSWORD),
            pin: SecretString::from(PIN),
            role,
            mfa_enabled: false,
        }
    }

    fn new_user_body(username: &str) -> serde_json::Value {
        json!({
            "username": username,
            "email": format!("{username}@example.com"),
            "password": "Fresh#Start99",
            "pin": "8642",
        })
    }

    #[tokio::test]
    async fn super_admin_creates_users() -> Result<()> {
        let t = app()?;
        t.engine.credentials().create_user(&seeded("root", Role::SuperAdmin))?;
        let token = t.engine.create_session("root", None)?;

        let (status, body) = send(
            &t.router,
            Method::POST,
            "/v1/users",
            Some(new_user_body("frank")),
            Some(&token),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["username"], "frank");
        assert_eq!(body["role"], "user");
        assert!(body.get("password_hash").is_none());

        let (status, body) = send(
            &t.router,
            Method::POST,
            "/v1/users",
            Some(new_user_body("frank")),
            Some(&token),
        )
        .await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "User already exists");

        let (status, _) = send(
            &t.router,
            Method::PUT,
            "/v1/users/frank/role",
            Some(json!({"role": "admin"})),
            Some(&token),
        )
        .await?;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(t.engine.credentials().role_of("frank"), Some(Role::Admin));
        Ok(())
    }

    #[tokio::test]
    async fn plain_users_are_denied() -> Result<()> {
        let t = app()?;
        t.engine.credentials().create_user(&seeded("gina", Role::User))?;
        let token = t.engine.create_session("gina", None)?;

        let (status, body) = send(
            &t.router,
            Method::POST,
            "/v1/users",
            Some(new_user_body("henry")),
            Some(&token),
        )
        .await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Access denied");

        let (status, _) = send(&t.router, Method::POST, "/v1/users", Some(new_user_body("henry")), None).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_email_is_rejected() -> Result<()> {
        let t = app()?;
        t.engine.credentials().create_user(&seeded("root", Role::SuperAdmin))?;
        let token = t.engine.create_session("root", None)?;
        let mut body = new_user_body("ivan");
        body["email"] = json!("not-an-email");

        let (status, body) = send(&t.router, Method::POST, "/v1/users", Some(body), Some(&token)).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid email");
        Ok(())
    }
}
