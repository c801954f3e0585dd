use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows},
    schemas::{clamp_limit_in_range, AuditLogPath, AuditLogsQuery},
    state::AppState,
    tenancy::assert_portfolio_role,
};

const AUDIT_READ_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/audit-logs", axum::routing::get(list_audit_logs))
        .route("/audit-logs/{audit_log_id}", axum::routing::get(get_audit_log))
}

async fn list_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &query.portfolio_id, AUDIT_READ_ROLES).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "portfolio_id".to_string(),
        Value::String(query.portfolio_id.clone()),
    );
    if let Some(entity_type) = non_empty_opt(query.entity_type.as_deref()) {
        filters.insert("entity_type".to_string(), Value::String(entity_type));
    }
    if let Some(entity_id) = non_empty_opt(query.entity_id.as_deref()) {
        filters.insert("entity_id".to_string(), Value::String(entity_id));
    }
    if let Some(actor) = non_empty_opt(query.actor_user_id.as_deref()) {
        filters.insert("actor_user_id".to_string(), Value::String(actor));
    }
    if let Some(action) = non_empty_opt(query.action.as_deref()) {
        filters.insert("action".to_string(), Value::String(action));
    }

    let rows = list_rows(
        pool,
        "audit_logs",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn get_audit_log(
    State(state): State<AppState>,
    Path(path): Path<AuditLogPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "audit_logs", &path.audit_log_id, "id").await?;
    let portfolio_id = record
        .as_object()
        .and_then(|obj| obj.get("portfolio_id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if portfolio_id.is_empty() {
        return Err(AppError::Forbidden(
            "Audit entry is not scoped to a portfolio.".to_string(),
        ));
    }
    assert_portfolio_role(&state, &user_id, portfolio_id, AUDIT_READ_ROLES).await?;

    Ok(Json(record))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
