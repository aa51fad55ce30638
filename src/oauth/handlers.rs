use axum::{
    extract::{Path, Query, State},
    response::Redirect,
};
use serde::Deserialize;
use tracing::{error, instrument, warn};

use crate::{
    error::{AuthError, AuthResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[instrument(skip(state))]
pub async fn authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> AuthResult<Redirect> {
    let url = state.oauth.authorization_url(&provider)?;
    Ok(Redirect::to(&url))
}

/// Provider callback. Failures send the browser back to the UI login page.
#[instrument(skip_all, fields(provider = %provider))]
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    match complete_login(&state, &provider, params).await {
        Ok(token) => Redirect::to(&state.linker.callback_redirect(&token)),
        Err(e) => {
            match &e {
                AuthError::Internal(inner) => error!(error = ?inner, "oauth2 login failed"),
                other => warn!(error = %other, "oauth2 login rejected"),
            }
            Redirect::to(&format!("{}/login?error=oauth2", state.config.ui_url))
        }
    }
}

async fn complete_login(
    state: &AppState,
    provider: &str,
    params: CallbackParams,
) -> AuthResult<String> {
    if let Some(err) = params.error {
        return Err(AuthError::Validation(format!("provider returned {err}")));
    }
    let (Some(code), Some(csrf)) = (params.code, params.state) else {
        return Err(AuthError::Validation("missing code or state".into()));
    };
    state.oauth.verify_state(provider, &csrf)?;

    let attributes = state.oauth.fetch_attributes(provider, &code).await?;
    let (_, token) = state.linker.resolve(provider, &attributes).await?;
    Ok(token)
}
