use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::auth::require_auth_user;
use crate::error::AppResult;
use crate::state::AppState;
use crate::tenancy::{ensure_app_user, list_user_portfolios};

/// Resolve the caller's identity from the token, upsert their app_users
/// row, and return it with their portfolio memberships.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    let app_user = ensure_app_user(&state, &user).await?;
    let portfolios = list_user_portfolios(&state, &user.id).await?;

    Ok(Json(json!({
        "user": app_user,
        "portfolios": portfolios,
    })))
}
