use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_live_row, list_rows, soft_delete_row},
    schemas::{
        clamp_limit_in_range, validate_input, ApplyPaymentInput, CreatePaymentInput, PaymentPath,
        PaymentsQuery, UnapplyPaymentInput,
    },
    services::audit::write_audit_log,
    services::billing::{self, round_cents, val_f64},
    services::notify::notify_portfolio_members,
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role},
};

const PAYMENT_EDIT_ROLES: &[&str] = &["owner_admin", "manager", "accountant"];
const PAYMENT_METHODS: &[&str] = &["cash", "bank_transfer", "card", "check", "other"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/payments",
            axum::routing::get(list_payments).post(create_payment),
        )
        .route(
            "/payments/{payment_id}",
            axum::routing::get(get_payment).delete(delete_payment),
        )
        .route(
            "/payments/{payment_id}/apply",
            axum::routing::post(apply_payment),
        )
        .route(
            "/payments/{payment_id}/unapply",
            axum::routing::post(unapply_payment),
        )
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
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
    if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
        filters.insert("tenant_id".to_string(), Value::String(tenant_id));
    }
    if let Some(method) = non_empty_opt(query.method.as_deref()) {
        filters.insert("method".to_string(), Value::String(method));
    }
    if query.unapplied_only == Some(true) {
        filters.insert("unapplied_amount__gt".to_string(), json!(0.0));
    }

    let rows = list_rows(
        pool,
        "payments",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "received_on",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

/// Record a payment. The whole amount starts unapplied; inline applications
/// are allocated immediately afterwards through the same path as
/// `POST /payments/{id}/apply`.
async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePaymentInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &payload.portfolio_id, PAYMENT_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    if payload.amount <= 0.0 {
        return Err(AppError::UnprocessableEntity(
            "amount must be positive.".to_string(),
        ));
    }
    if !PAYMENT_METHODS.contains(&payload.method.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unknown payment method '{}'.",
            payload.method
        )));
    }

    let lease = get_live_row(pool, "leases", &payload.lease_id).await?;
    if billing::val_str(&lease, "portfolio_id") != payload.portfolio_id {
        return Err(AppError::Conflict(
            "Lease belongs to a different portfolio.".to_string(),
        ));
    }

    let amount = round_cents(payload.amount);
    let inline_total = round_cents(
        payload
            .applications
            .iter()
            .map(|application| application.amount)
            .sum(),
    );
    if inline_total > amount + 0.005 {
        return Err(AppError::UnprocessableEntity(
            "Inline applications exceed the payment amount.".to_string(),
        ));
    }

    let mut record = Map::new();
    record.insert(
        "portfolio_id".to_string(),
        Value::String(payload.portfolio_id.clone()),
    );
    record.insert(
        "lease_id".to_string(),
        Value::String(payload.lease_id.clone()),
    );
    if let Some(tenant_id) = payload.tenant_id.as_deref() {
        record.insert("tenant_id".to_string(), Value::String(tenant_id.to_string()));
    }
    record.insert("amount".to_string(), json!(amount));
    record.insert("unapplied_amount".to_string(), json!(amount));
    record.insert("currency".to_string(), Value::String(payload.currency.clone()));
    record.insert("method".to_string(), Value::String(payload.method.clone()));
    record.insert(
        "received_on".to_string(),
        Value::String(
            payload
                .received_on
                .clone()
                .unwrap_or_else(|| Utc::now().date_naive().format("%Y-%m-%d").to_string()),
        ),
    );
    if let Some(reference) = payload.reference.as_deref() {
        record.insert("reference".to_string(), Value::String(reference.to_string()));
    }
    if let Some(notes) = payload.notes.as_deref() {
        record.insert("notes".to_string(), Value::String(notes.to_string()));
    }
    record.insert(
        "recorded_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "payments", &record).await?;
    let payment_id = billing::val_str(&created, "id");

    let mut applied = Vec::new();
    for application in &payload.applications {
        let result = billing::apply_payment(
            pool,
            &payment_id,
            &application.invoice_id,
            application.amount,
        )
        .await?;
        applied.push(result);
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.portfolio_id),
        Some(&user_id),
        "create",
        "payments",
        Some(&payment_id),
        None,
        Some(created.clone()),
    )
    .await;

    notify_portfolio_members(
        pool,
        &payload.portfolio_id,
        "payment_received",
        "Payment received",
        &format!("Payment of {amount:.2} {} recorded.", payload.currency),
        Some("payment"),
        Some(&payment_id),
    )
    .await;

    // Re-read so inline applications are reflected in the response.
    let current = get_live_row(pool, "payments", &payment_id).await?;
    let enriched = with_applications(pool, current).await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "payment": enriched, "applications": applied })),
    ))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "payments", &path.payment_id).await?;
    let portfolio_id = billing::val_str(&record, "portfolio_id");
    assert_portfolio_member(&state, &user_id, &portfolio_id).await?;

    let enriched = with_applications(pool, record).await?;
    Ok(Json(enriched))
}

async fn apply_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
    Json(payload): Json<ApplyPaymentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let payment = get_live_row(pool, "payments", &path.payment_id).await?;
    let portfolio_id = billing::val_str(&payment, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, PAYMENT_EDIT_ROLES).await?;

    let result =
        billing::apply_payment(pool, &path.payment_id, &payload.invoice_id, payload.amount)
            .await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "apply",
        "payments",
        Some(&path.payment_id),
        None,
        Some(result.clone()),
    )
    .await;

    Ok(Json(result))
}

async fn unapply_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
    Json(payload): Json<UnapplyPaymentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let payment = get_live_row(pool, "payments", &path.payment_id).await?;
    let portfolio_id = billing::val_str(&payment, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, PAYMENT_EDIT_ROLES).await?;

    let result = billing::unapply_payment(pool, &path.payment_id, &payload.invoice_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "unapply",
        "payments",
        Some(&path.payment_id),
        None,
        Some(result.clone()),
    )
    .await;

    Ok(Json(result))
}

async fn delete_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "payments", &path.payment_id).await?;
    let portfolio_id = billing::val_str(&record, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, PAYMENT_EDIT_ROLES).await?;

    let amount = val_f64(&record, "amount");
    let unapplied = val_f64(&record, "unapplied_amount");
    if amount - unapplied > 0.005 {
        return Err(AppError::Conflict(
            "Payment has applied amounts; unapply them before deleting.".to_string(),
        ));
    }

    let deleted = soft_delete_row(pool, "payments", &path.payment_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "delete",
        "payments",
        Some(&path.payment_id),
        Some(deleted),
        None,
    )
    .await;

    Ok(Json(json!({ "deleted": true })))
}

async fn with_applications(pool: &sqlx::PgPool, payment: Value) -> AppResult<Value> {
    let payment_id = billing::val_str(&payment, "id");
    let mut filters = Map::new();
    filters.insert("payment_id".to_string(), Value::String(payment_id));
    let applications = list_rows(
        pool,
        "payment_applications",
        Some(&filters),
        200,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut merged = payment.as_object().cloned().unwrap_or_default();
    merged.insert("applications".to_string(), Value::Array(applications));
    Ok(Value::Object(merged))
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
