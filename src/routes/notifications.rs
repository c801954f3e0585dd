use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows, update_row},
    schemas::{clamp_limit_in_range, NotificationPath, NotificationsQuery},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/notifications", axum::routing::get(list_notifications))
        .route(
            "/notifications/{notification_id}/read",
            axum::routing::post(mark_read),
        )
        .route(
            "/notifications/read-all",
            axum::routing::post(mark_all_read),
        )
}

/// A user only ever sees their own notifications; no portfolio guard
/// needed beyond the rows being addressed to them.
async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("user_id".to_string(), Value::String(user_id));
    if query.unread_only == Some(true) {
        filters.insert("is_read".to_string(), Value::Bool(false));
    }
    if let Some(portfolio_id) = query
        .portfolio_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert(
            "portfolio_id".to_string(),
            Value::String(portfolio_id.to_string()),
        );
    }

    let rows = list_rows(
        pool,
        "notifications",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(path): Path<NotificationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "notifications", &path.notification_id, "id").await?;
    let owner = record
        .as_object()
        .and_then(|obj| obj.get("user_id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if owner != user_id {
        return Err(AppError::Forbidden(
            "Forbidden: not your notification.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert("is_read".to_string(), Value::Bool(true));
    patch.insert(
        "read_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    let updated = update_row(pool, "notifications", &path.notification_id, &patch, "id").await?;

    Ok(Json(updated))
}

async fn mark_all_read(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let result = sqlx::query(
        "UPDATE notifications
         SET is_read = true, read_at = now()
         WHERE user_id = $1::uuid AND is_read = false",
    )
    .bind(&user_id)
    .execute(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("mark-all-read: {error}")))?;

    Ok(Json(json!({ "updated": result.rows_affected() })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
