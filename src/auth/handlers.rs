use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest,
            MessageResponse, ProfileResponse, ResetPasswordRequest, SignupRequest,
        },
        extractors::AuthUser,
    },
    error::{AuthError, AuthResult},
    profile::{images::MAX_IMAGE_BYTES, ImageUpload},
    state::AppState,
    users::{normalize_email, User},
};

pub const FORGOT_PASSWORD_REPLY: &str = "If that email exists, a reset link has been sent.";

/// Multipart envelope allowance on top of the image cap.
const PROFILE_BODY_LIMIT: usize = MAX_IMAGE_BYTES + 1024 * 1024;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_me))
        .route("/auth/password", put(change_password))
        .route(
            "/auth/profile",
            put(update_profile).layer(DefaultBodyLimit::max(PROFILE_BODY_LIMIT)),
        )
}

async fn current_user(state: &AppState, email: &str) -> AuthResult<User> {
    state.users.find_by_email(email).await?.ok_or_else(|| {
        warn!(email = %email, "token subject has no account");
        AuthError::InvalidToken
    })
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> AuthResult<(StatusCode, Json<AuthResponse>)> {
    let user = state
        .credentials
        .register(&payload.email, payload.name.as_deref(), &payload.password)
        .await?;
    let token = state.tokens.issue(&user.email)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token })))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AuthResult<Json<AuthResponse>> {
    let user = state
        .credentials
        .authenticate(&payload.email, &payload.password)
        .await?;
    let token = state.tokens.issue(&user.email)?;
    Ok(Json(AuthResponse { token }))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(email): AuthUser,
) -> AuthResult<Json<ProfileResponse>> {
    let user = current_user(&state, &email).await?;
    Ok(Json(ProfileResponse::from(&user)))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(email): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> AuthResult<Json<MessageResponse>> {
    let user = current_user(&state, &email).await?;
    let current = payload
        .current_password
        .as_deref()
        .filter(|p| !p.is_empty());
    state
        .credentials
        .change_password(&user, current, &payload.new_password)
        .await?;
    Ok(Json(MessageResponse::new("Password updated successfully")))
}

/// Always answers with the same message so callers cannot probe for accounts.
#[instrument(skip_all)]
pub async fn forgot_password(
    State(state): State<AppState>,
    Query(query): Query<ForgotPasswordRequest>,
    body: Option<Json<ForgotPasswordRequest>>,
) -> AuthResult<Json<MessageResponse>> {
    let email = body
        .and_then(|Json(b)| b.email)
        .or(query.email)
        .map(|e| normalize_email(&e))
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AuthError::Validation("Email is required".into()))?;

    if let Err(e) = state.reset.issue(&email).await {
        error!(error = %e, "password reset issue failed");
    }
    Ok(Json(MessageResponse::new(FORGOT_PASSWORD_REPLY)))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AuthResult<Json<MessageResponse>> {
    state
        .reset
        .consume(&payload.token, &payload.new_password)
        .await?;
    Ok(Json(MessageResponse::new(
        "Password has been reset successfully.",
    )))
}

fn multipart_error(e: MultipartError) -> AuthError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AuthError::PayloadTooLarge
    } else {
        AuthError::Validation(e.body_text())
    }
}

/// Multipart fields: `name`, optional `imageUrl`, optional `file`.
#[instrument(skip(state, multipart))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthUser(email): AuthUser,
    mut multipart: Multipart,
) -> AuthResult<Json<ProfileResponse>> {
    let user = current_user(&state, &email).await?;

    let mut name = String::new();
    let mut image_url: Option<String> = None;
    let mut file: Option<ImageUpload> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => name = field.text().await.map_err(multipart_error)?,
            "imageUrl" => image_url = Some(field.text().await.map_err(multipart_error)?),
            "file" => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some(ImageUpload {
                    bytes,
                    content_type,
                });
            }
            other => warn!(field = %other, "ignoring unknown profile field"),
        }
    }

    let updated = state
        .profiles
        .update_profile(user.id, &name, image_url.as_deref(), file)
        .await?;
    info!(user_id = %updated.id, "profile update served");
    Ok(Json(ProfileResponse::from(&updated)))
}
