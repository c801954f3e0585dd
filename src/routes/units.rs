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
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateUnitInput,
        UnitPath, UnitsQuery, UpdateUnitInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role},
};

const UNIT_EDIT_ROLES: &[&str] = &["owner_admin", "manager"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/units", axum::routing::get(list_units).post(create_unit))
        .route(
            "/units/{unit_id}",
            axum::routing::get(get_unit).patch(update_unit).delete(delete_unit),
        )
}

async fn list_units(
    State(state): State<AppState>,
    Query(query): Query<UnitsQuery>,
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
    if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }

    let rows = list_rows(
        pool,
        "units",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUnitInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &payload.portfolio_id, UNIT_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    // The property must exist, be live, and belong to the same portfolio.
    let property = get_live_row(pool, "properties", &payload.property_id).await?;
    if value_str(&property, "portfolio_id") != payload.portfolio_id {
        return Err(AppError::Conflict(
            "Property belongs to a different portfolio.".to_string(),
        ));
    }

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "units", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.portfolio_id),
        Some(&user_id),
        "create",
        "units",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "units", &path.unit_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_member(&state, &user_id, &portfolio_id).await?;

    Ok(Json(record))
}

async fn update_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUnitInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "units", &path.unit_id).await?;
    let portfolio_id = value_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, UNIT_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "units", &path.unit_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "update",
        "units",
        Some(&path.unit_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "units", &path.unit_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, UNIT_EDIT_ROLES).await?;

    let mut lease_filters = Map::new();
    lease_filters.insert("unit_id".to_string(), Value::String(path.unit_id.clone()));
    lease_filters.insert("status".to_string(), Value::String("active".to_string()));
    lease_filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    let active_leases = count_rows(pool, "leases", Some(&lease_filters)).await?;
    if active_leases > 0 {
        return Err(AppError::Conflict(
            "Unit has an active lease; end it before deleting the unit.".to_string(),
        ));
    }

    let deleted = soft_delete_row(pool, "units", &path.unit_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "delete",
        "units",
        Some(&path.unit_id),
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
