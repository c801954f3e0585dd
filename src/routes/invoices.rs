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
    repository::table_service::{create_row_tx, get_live_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateInvoiceInput,
        InvoicePath, InvoicesQuery, RunInvoiceGenerationInput, UpdateInvoiceInput,
    },
    services::audit::write_audit_log,
    services::billing::{
        self, billing_month_key, due_date_for, month_bounds, parse_billing_month, round_cents,
        val_f64, INVOICE_STATUS_DRAFT, INVOICE_STATUS_OPEN, INVOICE_STATUS_VOID,
    },
    state::AppState,
    tenancy::{assert_portfolio_member, assert_portfolio_role, ROLE_OWNER_ADMIN},
};

const INVOICE_EDIT_ROLES: &[&str] = &["owner_admin", "manager", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/invoices",
            axum::routing::get(list_invoices).post(create_invoice),
        )
        .route(
            "/invoices/{invoice_id}",
            axum::routing::get(get_invoice).patch(update_invoice),
        )
        .route(
            "/invoices/{invoice_id}/issue",
            axum::routing::post(issue_invoice),
        )
        .route(
            "/invoices/{invoice_id}/void",
            axum::routing::post(void_invoice),
        )
        .route(
            "/internal/run-invoice-generation",
            axum::routing::post(run_invoice_generation),
        )
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoicesQuery>,
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
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(billing_month) = non_empty_opt(query.billing_month.as_deref()) {
        filters.insert("billing_month".to_string(), Value::String(billing_month));
    }
    if let Some(due_from) = non_empty_opt(query.due_from.as_deref()) {
        filters.insert("due_date__gte".to_string(), Value::String(due_from));
    }
    if let Some(due_to) = non_empty_opt(query.due_to.as_deref()) {
        filters.insert("due_date__lte".to_string(), Value::String(due_to));
    }

    let rows = list_rows(
        pool,
        "invoices",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "due_date",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

/// Manual invoice entry. Starts as a draft; issue it to make it payable.
async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateInvoiceInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    assert_portfolio_role(&state, &user_id, &payload.portfolio_id, INVOICE_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    let month_start = parse_billing_month(&payload.billing_month).ok_or_else(|| {
        AppError::BadRequest("Invalid billing_month. Expected YYYY-MM.".to_string())
    })?;
    let (month_start, month_end) = month_bounds(month_start);
    let month_key = billing_month_key(month_start);

    let lease = get_live_row(pool, "leases", &payload.lease_id).await?;
    if billing::val_str(&lease, "portfolio_id") != payload.portfolio_id {
        return Err(AppError::Conflict(
            "Lease belongs to a different portfolio.".to_string(),
        ));
    }

    for item in &payload.items {
        if item.unit_amount <= 0.0 || item.quantity <= 0.0 {
            return Err(AppError::UnprocessableEntity(
                "Invoice items need positive quantity and unit_amount.".to_string(),
            ));
        }
    }

    let subtotal = round_cents(
        payload
            .items
            .iter()
            .map(|item| item.quantity * item.unit_amount)
            .sum(),
    );
    let tax_amount = round_cents(payload.tax_amount.unwrap_or(0.0).max(0.0));
    let total = round_cents(subtotal + tax_amount);

    let billing_day = lease
        .as_object()
        .and_then(|obj| obj.get("billing_day"))
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let due_date = payload
        .due_date
        .clone()
        .unwrap_or_else(|| {
            due_date_for(month_start, billing_day, state.config.invoice_due_day_cap)
                .format("%Y-%m-%d")
                .to_string()
        });

    let currency = {
        let value = billing::val_str(&lease, "currency");
        if value.is_empty() {
            "USD".to_string()
        } else {
            value
        }
    };

    let mut tx = pool
        .begin()
        .await
        .map_err(|error| AppError::Dependency(format!("txn begin: {error}")))?;

    let mut invoice = Map::new();
    invoice.insert(
        "portfolio_id".to_string(),
        Value::String(payload.portfolio_id.clone()),
    );
    invoice.insert(
        "lease_id".to_string(),
        Value::String(payload.lease_id.clone()),
    );
    invoice.insert("billing_month".to_string(), Value::String(month_key));
    invoice.insert(
        "period_start".to_string(),
        Value::String(month_start.format("%Y-%m-%d").to_string()),
    );
    invoice.insert(
        "period_end".to_string(),
        Value::String(month_end.format("%Y-%m-%d").to_string()),
    );
    invoice.insert("due_date".to_string(), Value::String(due_date));
    invoice.insert(
        "status".to_string(),
        Value::String(INVOICE_STATUS_DRAFT.to_string()),
    );
    invoice.insert("subtotal".to_string(), json!(subtotal));
    invoice.insert("tax_amount".to_string(), json!(tax_amount));
    invoice.insert("total_amount".to_string(), json!(total));
    invoice.insert("balance_due".to_string(), json!(total));
    invoice.insert("currency".to_string(), Value::String(currency));
    if let Some(notes) = payload.notes.as_deref() {
        invoice.insert("notes".to_string(), Value::String(notes.to_string()));
    }

    let created = create_row_tx(&mut tx, "invoices", &invoice).await?;
    let invoice_id = billing::val_str(&created, "id");

    for (index, item) in payload.items.iter().enumerate() {
        let amount = round_cents(item.quantity * item.unit_amount);
        let mut row = Map::new();
        row.insert("invoice_id".to_string(), Value::String(invoice_id.clone()));
        row.insert(
            "description".to_string(),
            Value::String(item.description.clone()),
        );
        row.insert("quantity".to_string(), json!(item.quantity));
        row.insert("unit_amount".to_string(), json!(round_cents(item.unit_amount)));
        row.insert("amount".to_string(), json!(amount));
        row.insert("sort_order".to_string(), json!(index as i64));
        create_row_tx(&mut tx, "invoice_items", &row).await?;
    }

    tx.commit()
        .await
        .map_err(|error| AppError::Dependency(format!("txn commit: {error}")))?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.portfolio_id),
        Some(&user_id),
        "create",
        "invoices",
        Some(&invoice_id),
        None,
        Some(created.clone()),
    )
    .await;

    let enriched = with_items(pool, created).await?;
    Ok((axum::http::StatusCode::CREATED, Json(enriched)))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_live_row(pool, "invoices", &path.invoice_id).await?;
    let portfolio_id = billing::val_str(&record, "portfolio_id");
    assert_portfolio_member(&state, &user_id, &portfolio_id).await?;

    let enriched = with_items(pool, record).await?;
    Ok(Json(enriched))
}

/// Draft-only edits. Issued invoices are immutable apart from the status
/// moves exposed as issue/void and the payment path.
async fn update_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateInvoiceInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "invoices", &path.invoice_id).await?;
    let portfolio_id = billing::val_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, INVOICE_EDIT_ROLES).await?;

    if billing::val_str(&before, "status") != INVOICE_STATUS_DRAFT {
        return Err(AppError::Conflict(
            "Only draft invoices can be edited.".to_string(),
        ));
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "invoices", &path.invoice_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "update",
        "invoices",
        Some(&path.invoice_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn issue_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "invoices", &path.invoice_id).await?;
    let portfolio_id = billing::val_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, INVOICE_EDIT_ROLES).await?;

    if billing::val_str(&before, "status") != INVOICE_STATUS_DRAFT {
        return Err(AppError::Conflict(
            "Only draft invoices can be issued.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(INVOICE_STATUS_OPEN.to_string()),
    );
    patch.insert(
        "issued_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    let updated = update_row(pool, "invoices", &path.invoice_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "issue",
        "invoices",
        Some(&path.invoice_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn void_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let before = get_live_row(pool, "invoices", &path.invoice_id).await?;
    let portfolio_id = billing::val_str(&before, "portfolio_id");
    assert_portfolio_role(&state, &user_id, &portfolio_id, INVOICE_EDIT_ROLES).await?;

    let status = billing::val_str(&before, "status");
    if status == INVOICE_STATUS_VOID {
        return Err(AppError::Conflict("Invoice is already void.".to_string()));
    }

    // Applied money must be unapplied before the invoice can disappear from
    // the books, or balances would stop adding up.
    let total = val_f64(&before, "total_amount");
    let balance = val_f64(&before, "balance_due");
    if total - balance > 0.005 {
        return Err(AppError::Conflict(
            "Invoice has applied payments; unapply them before voiding.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(INVOICE_STATUS_VOID.to_string()),
    );
    patch.insert(
        "voided_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    let updated = update_row(pool, "invoices", &path.invoice_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&portfolio_id),
        Some(&user_id),
        "void",
        "invoices",
        Some(&path.invoice_id),
        Some(before),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Manual trigger for the generation job. Authorized by the internal API
/// key, or by owner_admin of the targeted portfolio.
async fn run_invoice_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RunInvoiceGenerationInput>,
) -> AppResult<Json<Value>> {
    let internal_ok = state
        .config
        .internal_api_key
        .as_deref()
        .is_some_and(|expected| {
            headers
                .get("x-internal-api-key")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|provided| provided == expected)
        });

    if !internal_ok {
        let user_id = require_user_id(&state, &headers).await?;
        let Some(portfolio_id) = payload.portfolio_id.as_deref() else {
            return Err(AppError::Forbidden(
                "A portfolio_id is required without the internal API key.".to_string(),
            ));
        };
        assert_portfolio_role(&state, &user_id, portfolio_id, &[ROLE_OWNER_ADMIN]).await?;
    }

    let pool = db_pool(&state)?;
    let month_start = match payload.billing_month.as_deref() {
        Some(raw) => parse_billing_month(raw).ok_or_else(|| {
            AppError::BadRequest("Invalid billing_month. Expected YYYY-MM.".to_string())
        })?,
        None => Utc::now().date_naive(),
    };

    let summary = billing::run_invoice_generation(
        pool,
        payload.portfolio_id.as_deref(),
        month_start,
        state.config.invoice_due_day_cap,
    )
    .await;

    Ok(Json(json!({ "summary": summary })))
}

async fn with_items(pool: &sqlx::PgPool, invoice: Value) -> AppResult<Value> {
    let invoice_id = billing::val_str(&invoice, "id");
    let mut filters = Map::new();
    filters.insert("invoice_id".to_string(), Value::String(invoice_id));
    let items = list_rows(
        pool,
        "invoice_items",
        Some(&filters),
        500,
        0,
        "sort_order",
        true,
    )
    .await?;

    let mut merged = invoice.as_object().cloned().unwrap_or_default();
    merged.insert("items".to_string(), Value::Array(items));
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
