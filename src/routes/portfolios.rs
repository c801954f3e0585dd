use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_auth_user,
    error::{AppError, AppResult},
    repository::table_service::{
        count_rows, create_row_tx, delete_row, get_live_row, list_rows, soft_delete_row,
        update_row,
    },
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        CreatePortfolioInput, CreatePortfolioMemberInput, ListPortfoliosQuery,
        PortfolioMemberPath, PortfolioPath, UpdatePortfolioInput, UpdatePortfolioMemberInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{
        assert_portfolio_member, assert_portfolio_role, ensure_app_user, invalidate_membership,
        list_user_portfolios, ROLE_OWNER_ADMIN,
    },
};

const MEMBER_ROLES: &[&str] = &["owner_admin", "manager", "accountant", "viewer"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/portfolios",
            axum::routing::get(list_portfolios).post(create_portfolio),
        )
        .route(
            "/portfolios/{portfolio_id}",
            axum::routing::get(get_portfolio)
                .patch(update_portfolio)
                .delete(delete_portfolio),
        )
        .route(
            "/portfolios/{portfolio_id}/members",
            axum::routing::get(list_members).post(add_member),
        )
        .route(
            "/portfolios/{portfolio_id}/members/{member_user_id}",
            axum::routing::patch(update_member).delete(remove_member),
        )
}

async fn list_portfolios(
    State(state): State<AppState>,
    Query(query): Query<ListPortfoliosQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;

    if let Some(portfolio_id) = query.portfolio_id.as_deref() {
        assert_portfolio_member(&state, &user.id, portfolio_id).await?;
        let pool = db_pool(&state)?;
        let row = get_live_row(pool, "portfolios", portfolio_id).await?;
        return Ok(Json(json!({ "data": [row] })));
    }

    let portfolios = list_user_portfolios(&state, &user.id).await?;
    let limit = clamp_limit_in_range(query.limit, 1, 500) as usize;
    Ok(Json(
        json!({ "data": portfolios.into_iter().take(limit).collect::<Vec<_>>() }),
    ))
}

async fn create_portfolio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePortfolioInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user = require_auth_user(&state, &headers).await?;
    let _app_user = ensure_app_user(&state, &user).await?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));

    // One transaction so the portfolio and its first membership are created
    // atomically; no orphaned portfolios without an owner.
    let mut tx = pool
        .begin()
        .await
        .map_err(|error| AppError::Dependency(format!("txn begin: {error}")))?;

    let portfolio = create_row_tx(&mut tx, "portfolios", &record).await?;
    let portfolio_id = value_str(&portfolio, "id");

    sqlx::query(
        "INSERT INTO portfolio_members (portfolio_id, user_id, role, is_primary)
         VALUES ($1::uuid, $2::uuid, $3::member_role, $4)
         ON CONFLICT (portfolio_id, user_id)
         DO UPDATE SET role = EXCLUDED.role, is_primary = EXCLUDED.is_primary",
    )
    .bind(&portfolio_id)
    .bind(&user.id)
    .bind(ROLE_OWNER_ADMIN)
    .bind(true)
    .execute(&mut *tx)
    .await
    .map_err(|error| AppError::Dependency(format!("membership insert: {error}")))?;

    tx.commit()
        .await
        .map_err(|error| AppError::Dependency(format!("txn commit: {error}")))?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user.id),
        "create",
        "portfolios",
        Some(&portfolio_id),
        None,
        Some(portfolio.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(portfolio)))
}

async fn get_portfolio(
    State(state): State<AppState>,
    Path(path): Path<PortfolioPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_member(&state, &user.id, &path.portfolio_id).await?;
    let pool = db_pool(&state)?;
    let row = get_live_row(pool, "portfolios", &path.portfolio_id).await?;
    Ok(Json(row))
}

async fn update_portfolio(
    State(state): State<AppState>,
    Path(path): Path<PortfolioPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePortfolioInput>,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_role(&state, &user.id, &path.portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "portfolios", &path.portfolio_id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "portfolios", &path.portfolio_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.portfolio_id),
        Some(&user.id),
        "update",
        "portfolios",
        Some(&path.portfolio_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_portfolio(
    State(state): State<AppState>,
    Path(path): Path<PortfolioPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_role(&state, &user.id, &path.portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    let pool = db_pool(&state)?;

    let deleted = soft_delete_row(pool, "portfolios", &path.portfolio_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.portfolio_id),
        Some(&user.id),
        "delete",
        "portfolios",
        Some(&path.portfolio_id),
        Some(deleted),
        None,
    )
    .await;

    Ok(Json(json!({ "deleted": true })))
}

async fn list_members(
    State(state): State<AppState>,
    Path(path): Path<PortfolioPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_member(&state, &user.id, &path.portfolio_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "portfolio_id".to_string(),
        Value::String(path.portfolio_id.clone()),
    );
    let rows = list_rows(
        pool,
        "portfolio_members",
        Some(&filters),
        200,
        0,
        "created_at",
        true,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn add_member(
    State(state): State<AppState>,
    Path(path): Path<PortfolioPath>,
    headers: HeaderMap,
    Json(payload): Json<CreatePortfolioMemberInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_role(&state, &user.id, &path.portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    let pool = db_pool(&state)?;

    if !MEMBER_ROLES.contains(&payload.role.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unknown member role '{}'.",
            payload.role
        )));
    }

    sqlx::query(
        "INSERT INTO portfolio_members (portfolio_id, user_id, role, is_primary)
         VALUES ($1::uuid, $2::uuid, $3::member_role, $4)
         ON CONFLICT (portfolio_id, user_id)
         DO UPDATE SET role = EXCLUDED.role, is_primary = EXCLUDED.is_primary",
    )
    .bind(&path.portfolio_id)
    .bind(&payload.user_id)
    .bind(&payload.role)
    .bind(payload.is_primary)
    .execute(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("membership insert: {error}")))?;

    invalidate_membership(&state, &path.portfolio_id, &payload.user_id).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.portfolio_id),
        Some(&user.id),
        "create",
        "portfolio_members",
        Some(&payload.user_id),
        None,
        Some(json!({ "user_id": payload.user_id, "role": payload.role })),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "user_id": payload.user_id, "role": payload.role })),
    ))
}

async fn update_member(
    State(state): State<AppState>,
    Path(path): Path<PortfolioMemberPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePortfolioMemberInput>,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_role(&state, &user.id, &path.portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    let pool = db_pool(&state)?;

    if let Some(role) = payload.role.as_deref() {
        if !MEMBER_ROLES.contains(&role) {
            return Err(AppError::BadRequest(format!("Unknown member role '{role}'.")));
        }
        if role != ROLE_OWNER_ADMIN {
            ensure_not_last_owner_admin(pool, &path.portfolio_id, &path.member_user_id).await?;
        }
    }

    let membership = find_member(pool, &path.portfolio_id, &path.member_user_id).await?;
    let member_row_id = value_str(&membership, "id");

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "portfolio_members", &member_row_id, &patch, "id").await?;

    invalidate_membership(&state, &path.portfolio_id, &path.member_user_id).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.portfolio_id),
        Some(&user.id),
        "update",
        "portfolio_members",
        Some(&path.member_user_id),
        Some(membership),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn remove_member(
    State(state): State<AppState>,
    Path(path): Path<PortfolioMemberPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_auth_user(&state, &headers).await?;
    assert_portfolio_role(&state, &user.id, &path.portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    let pool = db_pool(&state)?;

    ensure_not_last_owner_admin(pool, &path.portfolio_id, &path.member_user_id).await?;

    let membership = find_member(pool, &path.portfolio_id, &path.member_user_id).await?;
    let member_row_id = value_str(&membership, "id");
    delete_row(pool, "portfolio_members", &member_row_id, "id").await?;

    invalidate_membership(&state, &path.portfolio_id, &path.member_user_id).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.portfolio_id),
        Some(&user.id),
        "delete",
        "portfolio_members",
        Some(&path.member_user_id),
        Some(membership),
        None,
    )
    .await;

    Ok(Json(json!({ "deleted": true })))
}

/// A portfolio must always keep at least one owner_admin; demoting or
/// removing the last one would lock everyone out.
async fn ensure_not_last_owner_admin(
    pool: &sqlx::PgPool,
    portfolio_id: &str,
    member_user_id: &str,
) -> AppResult<()> {
    let target = find_member(pool, portfolio_id, member_user_id).await?;
    if value_str(&target, "role") != ROLE_OWNER_ADMIN {
        return Ok(());
    }

    let mut filters = Map::new();
    filters.insert(
        "portfolio_id".to_string(),
        Value::String(portfolio_id.to_string()),
    );
    filters.insert(
        "role".to_string(),
        Value::String(ROLE_OWNER_ADMIN.to_string()),
    );
    let admins = count_rows(pool, "portfolio_members", Some(&filters)).await?;
    if admins <= 1 {
        return Err(AppError::Conflict(
            "Cannot remove or demote the last owner_admin of a portfolio.".to_string(),
        ));
    }
    Ok(())
}

async fn find_member(
    pool: &sqlx::PgPool,
    portfolio_id: &str,
    member_user_id: &str,
) -> AppResult<Value> {
    let mut filters = Map::new();
    filters.insert(
        "portfolio_id".to_string(),
        Value::String(portfolio_id.to_string()),
    );
    filters.insert(
        "user_id".to_string(),
        Value::String(member_user_id.to_string()),
    );
    let rows = list_rows(
        pool,
        "portfolio_members",
        Some(&filters),
        1,
        0,
        "created_at",
        true,
    )
    .await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound("portfolio_members record not found.".to_string()))
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
