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
    repository::table_service::{
        count_rows, create_row, get_live_row, list_rows, soft_delete_row, update_row,
    },
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreatePropertyInput,
        PropertiesQuery, PropertyPath, UpdatePropertyInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role},
};

const PROPERTY_EDIT_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/properties",
            axum::routing::get(list_properties).post(create_property),
        )
        .route(
            "/properties/{property_id}",
            axum::routing::get(get_property)
                .patch(update_property)
                .delete(delete_property),
        )
}

async fn list_properties(
    State(state): State<AppState>,
    Query(query): Query<PropertiesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_member(&state, &user_id, &query.portfolio_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "portfolio_id".to_string(),
        Value::String(query.portfolio_id.clone()),
    );
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        pool,
        "properties",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePropertyInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &payload.portfolio_id, PROPERTY_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "properties", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.portfolio_id),
        Some(&user_id),
        "create",
        "properties",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "properties", &path.property_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_member(&state, &user_id, &portfolio_id).await?;

    Ok(Json(record))
}

async fn update_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePropertyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "properties", &path.property_id).await?;
    let portfolio_id = value_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, PROPERTY_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "properties", &path.property_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "update",
        "properties",
        Some(&path.property_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "properties", &path.property_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, PROPERTY_EDIT_ROLES).await?;

    // A property with live units cannot go away; retire the units first.
    let mut unit_filters = Map::new();
    unit_filters.insert(
        "property_id".to_string(),
        Value::String(path.property_id.clone()),
    );
    unit_filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    let live_units = count_rows(pool, "units", Some(&unit_filters)).await?;
    if live_units > 0 {
        return Err(AppError::Conflict(format!(
            "Property still has {live_units} unit(s); delete them first."
        )));
    }

    let deleted = soft_delete_row(pool, "properties", &path.property_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "delete",
        "properties",
        Some(&path.property_id),
        Some(deleted),
        None,
    )
    .await;

    Ok(Json(json!({ "deleted": true })))
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

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
