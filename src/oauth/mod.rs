use axum::{routing::get, Router};

use crate::state::AppState;

pub mod client;
pub mod handlers;
pub mod linker;
pub mod providers;

pub use client::OAuthClient;
pub use linker::IdentityLinker;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/oauth2/authorization/:provider", get(handlers::authorize))
        .route("/login/oauth2/code/:provider", get(handlers::callback))
}
