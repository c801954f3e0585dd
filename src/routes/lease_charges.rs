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
    repository::table_service::{create_row, get_live_row, list_rows, soft_delete_row, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        CreateLeaseChargeInput, LeaseChargePath, LeaseChargesQuery, UpdateLeaseChargeInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role},
};

const CHARGE_EDIT_ROLES: &[&str] = &["owner_admin", "manager", "accountant"];
const CHARGE_CADENCES: &[&str] = &["monthly", "quarterly", "yearly"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/lease-charges",
            axum::routing::get(list_lease_charges).post(create_lease_charge),
        )
        .route(
            "/lease-charges/{charge_id}",
            axum::routing::get(get_lease_charge)
                .patch(update_lease_charge)
                .delete(delete_lease_charge),
        )
}

async fn list_lease_charges(
    State(state): State<AppState>,
    Query(query): Query<LeaseChargesQuery>,
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
    if let Some(lease_id) = non_empty_opt(query.lease_id.as_deref()) {
        filters.insert("lease_id".to_string(), Value::String(lease_id));
    }
    if let Some(cadence) = non_empty_opt(query.cadence.as_deref()) {
        filters.insert("cadence".to_string(), Value::String(cadence));
    }
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }

    let rows = list_rows(
        pool,
        "lease_charges",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn create_lease_charge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateLeaseChargeInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &payload.portfolio_id, CHARGE_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    if !CHARGE_CADENCES.contains(&payload.cadence.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unknown cadence '{}'. Expected monthly, quarterly or yearly.",
            payload.cadence
        )));
    }
    if payload.amount <= 0.0 {
        return Err(AppError::UnprocessableEntity(
            "amount must be positive.".to_string(),
        ));
    }
    if let (Some(starts_on), Some(ends_on)) = (&payload.starts_on, &payload.ends_on) {
        if ends_on < starts_on {
            return Err(AppError::UnprocessableEntity(
                "ends_on must be on or after starts_on.".to_string(),
            ));
        }
    }

    let lease = get_live_row(pool, "leases", &payload.lease_id).await?;
    if value_str(&lease, "portfolio_id") != payload.portfolio_id {
        return Err(AppError::Conflict(
            "Lease belongs to a different portfolio.".to_string(),
        ));
    }

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "lease_charges", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.portfolio_id),
        Some(&user_id),
        "create",
        "lease_charges",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_lease_charge(
    State(state): State<AppState>,
    Path(path): Path<LeaseChargePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "lease_charges", &path.charge_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_member(&state, &user_id, &portfolio_id).await?;

    Ok(Json(record))
}

async fn update_lease_charge(
    State(state): State<AppState>,
    Path(path): Path<LeaseChargePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateLeaseChargeInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "lease_charges", &path.charge_id).await?;
    let portfolio_id = value_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, CHARGE_EDIT_ROLES).await?;

    if let Some(cadence) = payload.cadence.as_deref() {
        if !CHARGE_CADENCES.contains(&cadence) {
            return Err(AppError::BadRequest(format!("Unknown cadence '{cadence}'.")));
        }
    }
    if let Some(amount) = payload.amount {
        if amount <= 0.0 {
            return Err(AppError::UnprocessableEntity(
                "amount must be positive.".to_string(),
            ));
        }
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "lease_charges", &path.charge_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "update",
        "lease_charges",
        Some(&path.charge_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_lease_charge(
    State(state): State<AppState>,
    Path(path): Path<LeaseChargePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "lease_charges", &path.charge_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, CHARGE_EDIT_ROLES).await?;

    let deleted = soft_delete_row(pool, "lease_charges", &path.charge_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "delete",
        "lease_charges",
        Some(&path.charge_id),
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
