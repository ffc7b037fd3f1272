use axum::extract::State;
use axum::Json;
use diesel::prelude::*;
use serde::Deserialize;
use std::sync::Arc;

use ripple_shared::types::api::ApiResponse;
use ripple_shared::types::auth::AuthSession;
use ripple_shared::{AppError, AppResult};

use crate::models::NewMessagingToken;
use crate::schema::messaging_token;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SaveTokenRequest {
    pub token: String,
    pub platform: String,
    #[serde(default)]
    pub platform_version: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub is_voip: bool,
    #[serde(default)]
    pub debug: bool,
}

/// POST /chat/tokens — register a push recipient for the caller.
pub async fn save_token(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveTokenRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    if req.token.trim().is_empty() {
        return Err(AppError::invalid("token must not be empty"));
    }

    let mut conn = state.db.get().map_err(|e| AppError::Internal(e.into()))?;

    diesel::insert_into(messaging_token::table)
        .values(&NewMessagingToken {
            user_id: session.user_id,
            token: req.token,
            platform: req.platform,
            platform_version: req.platform_version,
            device: req.device,
            lang: req.lang,
            is_voip: req.is_voip,
            debug: req.debug,
        })
        .execute(&mut conn)?;

    tracing::info!(user_id = %session.user_id, "messaging token saved");
    Ok(Json(ApiResponse::ok(true)))
}
