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
        create_row, delete_row, get_live_row, list_rows, soft_delete_row, update_row,
    },
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        AttachLeaseTenantInput, CreateLeaseInput, LeasePath, LeaseTenantPath, LeasesQuery,
        UpdateLeaseInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role},
};

const LEASE_EDIT_ROLES: &[&str] = &["owner_admin", "manager", "accountant"];
const LEASE_STATUSES: &[&str] = &["draft", "active", "ended", "evicted", "broken"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/leases", axum::routing::get(list_leases).post(create_lease))
        .route(
            "/leases/{lease_id}",
            axum::routing::get(get_lease)
                .patch(update_lease)
                .delete(delete_lease),
        )
        .route(
            "/leases/{lease_id}/tenants",
            axum::routing::post(attach_tenant),
        )
        .route(
            "/leases/{lease_id}/tenants/{tenant_id}",
            axum::routing::delete(detach_tenant),
        )
}

/// Valid lease lifecycle moves. Draft leases activate; active leases can
/// only terminate (ended, evicted, broken). Terminal states stay put.
fn lease_transition_allowed(from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        ("draft", "active") | ("active", "ended") | ("active", "evicted") | ("active", "broken")
    )
}

async fn list_leases(
    State(state): State<AppState>,
    Query(query): Query<LeasesQuery>,
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
    if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }
    if let Some(unit_id) = non_empty_opt(query.unit_id.as_deref()) {
        filters.insert("unit_id".to_string(), Value::String(unit_id));
    }

    let mut rows = list_rows(
        pool,
        "leases",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    // Narrowing by tenant goes through the join table.
    if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
        let mut join_filters = Map::new();
        join_filters.insert("tenant_id".to_string(), Value::String(tenant_id));
        let joins = list_rows(
            pool,
            "lease_tenants",
            Some(&join_filters),
            500,
            0,
            "created_at",
            true,
        )
        .await?;
        let lease_ids = joins
            .iter()
            .map(|row| value_str(row, "lease_id"))
            .collect::<std::collections::HashSet<_>>();
        rows.retain(|row| lease_ids.contains(&value_str(row, "id")));
    }

    Ok(Json(json!({ "data": rows })))
}

async fn create_lease(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateLeaseInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &payload.portfolio_id, LEASE_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    if !LEASE_STATUSES.contains(&payload.status.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unknown lease status '{}'.",
            payload.status
        )));
    }
    if payload.rent_amount <= 0.0 {
        return Err(AppError::UnprocessableEntity(
            "rent_amount must be positive.".to_string(),
        ));
    }
    if !(1..=31).contains(&payload.billing_day) {
        return Err(AppError::UnprocessableEntity(
            "billing_day must be between 1 and 31.".to_string(),
        ));
    }

    let unit = get_live_row(pool, "units", &payload.unit_id).await?;
    if value_str(&unit, "portfolio_id") != payload.portfolio_id
        || value_str(&unit, "property_id") != payload.property_id
    {
        return Err(AppError::Conflict(
            "Unit does not belong to the given property and portfolio.".to_string(),
        ));
    }

    if let Some(primary) = payload.primary_tenant_id.as_deref() {
        if !payload.tenant_ids.iter().any(|id| id == primary) {
            return Err(AppError::BadRequest(
                "primary_tenant_id must be listed in tenant_ids.".to_string(),
            ));
        }
    }
    if payload.charges.iter().any(|charge| charge.amount <= 0.0) {
        return Err(AppError::UnprocessableEntity(
            "Lease charge amounts must be positive.".to_string(),
        ));
    }

    let mut lease_payload = remove_nulls(serialize_to_map(&payload));
    lease_payload.remove("tenant_ids");
    lease_payload.remove("primary_tenant_id");
    lease_payload.remove("charges");
    lease_payload.insert(
        "created_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let lease = create_row(pool, "leases", &lease_payload).await?;
    let lease_id = value_str(&lease, "id");

    for tenant_id in &payload.tenant_ids {
        let is_primary = payload.primary_tenant_id.as_deref() == Some(tenant_id.as_str());
        let mut join = Map::new();
        join.insert("lease_id".to_string(), Value::String(lease_id.clone()));
        join.insert("tenant_id".to_string(), Value::String(tenant_id.clone()));
        join.insert("is_primary".to_string(), Value::Bool(is_primary));
        create_row(pool, "lease_tenants", &join).await?;
    }

    for charge in &payload.charges {
        let mut charge_payload = remove_nulls(serialize_to_map(charge));
        charge_payload.insert(
            "portfolio_id".to_string(),
            Value::String(payload.portfolio_id.clone()),
        );
        charge_payload.insert("lease_id".to_string(), Value::String(lease_id.clone()));
        charge_payload.insert("is_active".to_string(), Value::Bool(true));
        create_row(pool, "lease_charges", &charge_payload).await?;
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.portfolio_id),
        Some(&user_id),
        "create",
        "leases",
        Some(&lease_id),
        None,
        Some(lease.clone()),
    )
    .await;

    let enriched = enrich_lease(pool, lease).await?;
    Ok((axum::http::StatusCode::CREATED, Json(enriched)))
}

async fn get_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "leases", &path.lease_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_member(&state, &user_id, &portfolio_id).await?;

    let enriched = enrich_lease(pool, record).await?;
    Ok(Json(enriched))
}

async fn update_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateLeaseInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "leases", &path.lease_id).await?;
    let portfolio_id = value_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, LEASE_EDIT_ROLES).await?;

    if let Some(next_status) = payload.status.as_deref() {
        if !LEASE_STATUSES.contains(&next_status) {
            return Err(AppError::BadRequest(format!(
                "Unknown lease status '{next_status}'."
            )));
        }
        let current = value_str(&before, "status");
        if !lease_transition_allowed(&current, next_status) {
            return Err(AppError::Conflict(format!(
                "Lease cannot move from '{current}' to '{next_status}'."
            )));
        }
    }
    if let Some(day) = payload.billing_day {
        if !(1..=31).contains(&day) {
            return Err(AppError::UnprocessableEntity(
                "billing_day must be between 1 and 31.".to_string(),
            ));
        }
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "leases", &path.lease_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "update",
        "leases",
        Some(&path.lease_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "leases", &path.lease_id).await?;
    let portfolio_id = value_str(&record, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, LEASE_EDIT_ROLES).await?;

    if value_str(&record, "status") == "active" {
        return Err(AppError::Conflict(
            "Active leases cannot be deleted; end the lease first.".to_string(),
        ));
    }

    let deleted = soft_delete_row(pool, "leases", &path.lease_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "delete",
        "leases",
        Some(&path.lease_id),
        Some(deleted),
        None,
    )
    .await;

    Ok(Json(json!({ "deleted": true })))
}

async fn attach_tenant(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<AttachLeaseTenantInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let lease = get_live_row(pool, "leases", &path.lease_id).await?;
    let portfolio_id = value_str(&lease, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, LEASE_EDIT_ROLES).await?;

    let tenant = get_live_row(pool, "tenants", &payload.tenant_id).await?;
    if value_str(&tenant, "portfolio_id") != portfolio_id {
        return Err(AppError::Conflict(
            "Tenant belongs to a different portfolio.".to_string(),
        ));
    }

    // A lease carries at most one primary tenant; promoting a new one
    // demotes the rest in the same statement.
    if payload.is_primary {
        sqlx::query("UPDATE lease_tenants SET is_primary = false WHERE lease_id = $1::uuid")
            .bind(&path.lease_id)
            .execute(pool)
            .await
            .map_err(|error| AppError::Dependency(format!("primary demotion: {error}")))?;
    }

    let mut join = Map::new();
    join.insert("lease_id".to_string(), Value::String(path.lease_id.clone()));
    join.insert(
        "tenant_id".to_string(),
        Value::String(payload.tenant_id.clone()),
    );
    join.insert("is_primary".to_string(), Value::Bool(payload.is_primary));
    let created = create_row(pool, "lease_tenants", &join).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "create",
        "lease_tenants",
        Some(&value_str(&created, "id")),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn detach_tenant(
    State(state): State<AppState>,
    Path(path): Path<LeaseTenantPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let lease = get_live_row(pool, "leases", &path.lease_id).await?;
    let portfolio_id = value_str(&lease, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, LEASE_EDIT_ROLES).await?;

    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), Value::String(path.lease_id.clone()));
    filters.insert(
        "tenant_id".to_string(),
        Value::String(path.tenant_id.clone()),
    );
    let joins = list_rows(pool, "lease_tenants", Some(&filters), 1, 0, "created_at", true).await?;
    let join = joins
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound("Tenant is not attached to this lease.".to_string()))?;

    delete_row(pool, "lease_tenants", &value_str(&join, "id"), "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "delete",
        "lease_tenants",
        Some(&value_str(&join, "id")),
        Some(join),
        None,
    )
    .await;

    Ok(Json(json!({ "deleted": true })))
}

/// Fold the lease's tenants (with join metadata) and charges into the row.
async fn enrich_lease(pool: &sqlx::PgPool, lease: Value) -> AppResult<Value> {
    let lease_id = value_str(&lease, "id");

    let mut join_filters = Map::new();
    join_filters.insert("lease_id".to_string(), Value::String(lease_id.clone()));
    let joins = list_rows(
        pool,
        "lease_tenants",
        Some(&join_filters),
        100,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut tenants = Vec::new();
    for join in &joins {
        let tenant_id = value_str(join, "tenant_id");
        if tenant_id.is_empty() {
            continue;
        }
        if let Ok(tenant) = crate::repository::table_service::get_row(pool, "tenants", &tenant_id, "id").await {
            let mut entry = tenant.as_object().cloned().unwrap_or_default();
            entry.insert(
                "is_primary".to_string(),
                join.get("is_primary").cloned().unwrap_or(Value::Bool(false)),
            );
            tenants.push(Value::Object(entry));
        }
    }

    let mut charge_filters = Map::new();
    charge_filters.insert("lease_id".to_string(), Value::String(lease_id));
    charge_filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    let charges = list_rows(
        pool,
        "lease_charges",
        Some(&charge_filters),
        500,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut merged = lease.as_object().cloned().unwrap_or_default();
    merged.insert("tenants".to_string(), Value::Array(tenants));
    merged.insert("charges".to_string(), Value::Array(charges));
    Ok(Value::Object(merged))
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

#[cfg(test)]
mod tests {
    use super::lease_transition_allowed;

    #[test]
    fn lease_lifecycle_moves() {
        assert!(lease_transition_allowed("draft", "active"));
        assert!(lease_transition_allowed("active", "ended"));
        assert!(lease_transition_allowed("active", "evicted"));
        assert!(lease_transition_allowed("active", "broken"));
        assert!(lease_transition_allowed("active", "active"));

        assert!(!lease_transition_allowed("draft", "ended"));
        assert!(!lease_transition_allowed("ended", "active"));
        assert!(!lease_transition_allowed("evicted", "draft"));
        assert!(!lease_transition_allowed("broken", "ended"));
    }
}
