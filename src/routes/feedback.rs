use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateFeedbackInput,
        FeedbackPath, FeedbackQuery, UpdateFeedbackInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role, ROLE_OWNER_ADMIN},
};

const FEEDBACK_STATUSES: &[&str] = &["new", "reviewed", "resolved"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/feedback",
            axum::routing::get(list_feedback).post(create_feedback),
        )
        .route(
            "/feedback/{feedback_id}",
            axum::routing::get(get_feedback).patch(update_feedback),
        )
}

/// Portfolio admins triage their portfolio's feedback; everyone else sees
/// only what they submitted themselves.
async fn list_feedback(
    State(state): State<AppState>,
    Query(query): Query<FeedbackQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    match query
        .portfolio_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(portfolio_id) => {
            assert_portfolio_role(&state, &user_id, portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
            filters.insert(
                "portfolio_id".to_string(),
                Value::String(portfolio_id.to_string()),
            );
        }
        None => {
            filters.insert("user_id".to_string(), Value::String(user_id.clone()));
        }
    }
    if let Some(status) = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert("status".to_string(), Value::String(status.to_string()));
    }

    let rows = list_rows(
        pool,
        "feedback",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateFeedbackInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    // Feedback may reference a portfolio, but only one the caller is in.
    if let Some(portfolio_id) = payload.portfolio_id.as_deref() {
        assert_portfolio_member(&state, &user_id, portfolio_id).await?;
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("user_id".to_string(), Value::String(user_id.clone()));
    record.insert("status".to_string(), Value::String("new".to_string()));

    let created = create_row(pool, "feedback", &record).await?;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_feedback(
    State(state): State<AppState>,
    Path(path): Path<FeedbackPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "feedback", &path.feedback_id, "id").await?;
    authorize_feedback_access(&state, &user_id, &record).await?;

    Ok(Json(record))
}

async fn update_feedback(
    State(state): State<AppState>,
    Path(path): Path<FeedbackPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateFeedbackInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "feedback", &path.feedback_id, "id").await?;

    // Triage is an admin action on the named portfolio.
    let portfolio_id = value_str(&before, "portfolio_id");
    if portfolio_id.is_empty() {
        return Err(AppError::Forbidden(
            "Feedback without a portfolio cannot be triaged over the API.".to_string(),
        ));
    }
    assert_portfolio_role(&state, &user_id, &portfolio_id, &[ROLE_OWNER_ADMIN]).await?;

    if let Some(status) = payload.status.as_deref() {
        if !FEEDBACK_STATUSES.contains(&status) {
            return Err(AppError::BadRequest(format!(
                "Unknown feedback status '{status}'."
            )));
        }
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "feedback", &path.feedback_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "update",
        "feedback",
        Some(&path.feedback_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn authorize_feedback_access(
    state: &AppState,
    user_id: &str,
    record: &Value,
) -> AppResult<()> {
    if value_str(record, "user_id") == user_id {
        return Ok(());
    }
    let portfolio_id = value_str(record, "portfolio_id");
    if portfolio_id.is_empty() {
        return Err(AppError::Forbidden(
            "Forbidden: not your feedback entry.".to_string(),
        ));
    }
    assert_portfolio_role(state, user_id, &portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    Ok(())
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}
