use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{info, warn};

use crate::error::AppError;
use crate::metrics;
use crate::repository::table_service::{create_row_tx, list_rows, update_row, update_row_tx};
use crate::services::notify::notify_portfolio_members;

pub const INVOICE_STATUS_DRAFT: &str = "draft";
pub const INVOICE_STATUS_OPEN: &str = "open";
pub const INVOICE_STATUS_PARTIALLY_PAID: &str = "partially_paid";
pub const INVOICE_STATUS_PAID: &str = "paid";
pub const INVOICE_STATUS_VOID: &str = "void";
pub const INVOICE_STATUS_OVERDUE: &str = "overdue";

/// Statuses that count toward the one-invoice-per-lease-per-month rule.
pub const NON_VOID_STATUSES: &[&str] = &[
    INVOICE_STATUS_DRAFT,
    INVOICE_STATUS_OPEN,
    INVOICE_STATUS_PARTIALLY_PAID,
    INVOICE_STATUS_PAID,
    INVOICE_STATUS_OVERDUE,
];

/// Cent tolerance for f64 balance comparisons.
const CENT_EPSILON: f64 = 0.005;

// ---------------------------------------------------------------------------
// Pure date / money arithmetic
// ---------------------------------------------------------------------------

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Parse a `YYYY-MM` billing key into the first day of that month.
pub fn parse_billing_month(raw: &str) -> Option<NaiveDate> {
    let (year, month) = raw.trim().split_once('-')?;
    let year = year.parse::<i32>().ok()?;
    let month = month.parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn billing_month_key(month_start: NaiveDate) -> String {
    format!("{:04}-{:02}", month_start.year(), month_start.month())
}

/// First and last day of the month containing `date`.
pub fn month_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
    let next = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    };
    let end = next
        .map(|day| day - Duration::days(1))
        .unwrap_or(start);
    (start, end)
}

/// Whole months from `from`'s month to `to`'s month (day-of-month ignored).
pub fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}

/// A cadence fires in the billing month when the month distance from the
/// anchor is a non-negative multiple of the cadence length. A missing anchor
/// is treated as always-aligned so legacy charges keep billing monthly.
pub fn cadence_matches(cadence: &str, anchor: Option<NaiveDate>, month_start: NaiveDate) -> bool {
    let step = match cadence {
        "monthly" => 1,
        "quarterly" => 3,
        "yearly" => 12,
        _ => return false,
    };
    let Some(anchor) = anchor else {
        return true;
    };
    let elapsed = months_between(anchor, month_start);
    elapsed >= 0 && elapsed % step == 0
}

/// Advance the month start to the lease's billing day, capped so short
/// months always resolve (day 29-31 collapse to the cap).
pub fn due_date_for(month_start: NaiveDate, billing_day: i64, day_cap: u32) -> NaiveDate {
    let day = billing_day.clamp(1, i64::from(day_cap.clamp(1, 28))) as u32;
    NaiveDate::from_ymd_opt(month_start.year(), month_start.month(), day).unwrap_or(month_start)
}

/// Invoice status implied by its balance. Overdue takes precedence over
/// partially_paid/open once the due date has passed.
pub fn status_for_balance(
    total: f64,
    balance: f64,
    due_date: Option<NaiveDate>,
    today: NaiveDate,
) -> &'static str {
    if balance <= CENT_EPSILON {
        return INVOICE_STATUS_PAID;
    }
    if due_date.is_some_and(|due| due < today) {
        return INVOICE_STATUS_OVERDUE;
    }
    if balance + CENT_EPSILON < total {
        return INVOICE_STATUS_PARTIALLY_PAID;
    }
    INVOICE_STATUS_OPEN
}

/// A charge is billable in the month when it is active, its window touches
/// the month, and its cadence lands on the month.
pub fn charge_billable_in_month(
    charge: &Value,
    lease_starts_on: Option<NaiveDate>,
    month_start: NaiveDate,
    month_end: NaiveDate,
) -> bool {
    if !val_bool_or(charge, "is_active", true) {
        return false;
    }

    let starts_on = val_date(charge, "starts_on");
    let ends_on = val_date(charge, "ends_on");

    if let Some(starts_on) = starts_on {
        if starts_on > month_end {
            return false;
        }
    }
    if let Some(ends_on) = ends_on {
        if ends_on < month_start {
            return false;
        }
    }

    let cadence = val_str(charge, "cadence");
    let anchor = starts_on.or(lease_starts_on);
    cadence_matches(&cadence, anchor, month_start)
}

// ---------------------------------------------------------------------------
// Invoice generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GenerationSummary {
    pub leases_scanned: u32,
    pub generated: u32,
    pub skipped_existing: u32,
    pub errors: u32,
}

/// Turn active lease charges into invoices for one billing month.
///
/// Idempotent per (lease, billing month): a lease that already has a
/// non-void invoice for the month is skipped, so re-running the job on any
/// later day of the month creates nothing new. The partial unique index on
/// invoices backstops the check against concurrent runs.
pub async fn run_invoice_generation(
    pool: &PgPool,
    portfolio_id: Option<&str>,
    month_start: NaiveDate,
    due_day_cap: u32,
) -> GenerationSummary {
    let (month_start, month_end) = month_bounds(month_start);
    let month_key = billing_month_key(month_start);
    let mut summary = GenerationSummary::default();

    let mut filters = Map::new();
    filters.insert("is_active".to_string(), Value::Bool(true));
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    if let Some(portfolio_id) = portfolio_id {
        filters.insert(
            "portfolio_id".to_string(),
            Value::String(portfolio_id.to_string()),
        );
    }

    let charges = match list_rows(pool, "lease_charges", Some(&filters), 1000, 0, "created_at", true)
        .await
    {
        Ok(rows) => rows,
        Err(error) => {
            warn!(error = %error, "Invoice generation: failed to fetch lease charges");
            summary.errors += 1;
            return summary;
        }
    };

    // Group candidate charges by lease before touching any lease row.
    let mut by_lease: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for charge in charges {
        let lease_id = val_str(&charge, "lease_id");
        if lease_id.is_empty() {
            continue;
        }
        by_lease.entry(lease_id).or_default().push(charge);
    }

    for (lease_id, charges) in by_lease {
        summary.leases_scanned += 1;

        let lease = match fetch_row(pool, "leases", &lease_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => continue,
            Err(error) => {
                warn!(lease_id, error = %error, "Invoice generation: lease fetch failed");
                summary.errors += 1;
                continue;
            }
        };

        if val_str(&lease, "status") != "active" || !value_is_null(&lease, "deleted_at") {
            continue;
        }

        let lease_starts_on = val_date(&lease, "starts_on");
        let lease_ends_on = val_date(&lease, "ends_on");
        if let Some(starts_on) = lease_starts_on {
            if starts_on > month_end {
                continue;
            }
        }
        if let Some(ends_on) = lease_ends_on {
            if ends_on < month_start {
                continue;
            }
        }

        let billable = charges
            .into_iter()
            .filter(|charge| {
                charge_billable_in_month(charge, lease_starts_on, month_start, month_end)
            })
            .collect::<Vec<_>>();
        if billable.is_empty() {
            continue;
        }

        // Idempotence gate: one non-void invoice per lease per billing month.
        match invoice_exists_for_month(pool, &lease_id, &month_key).await {
            Ok(true) => {
                summary.skipped_existing += 1;
                metrics::INVOICES_SKIPPED_TOTAL.inc();
                continue;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(lease_id, error = %error, "Invoice generation: existence check failed");
                summary.errors += 1;
                continue;
            }
        }

        match create_invoice_for_lease(
            pool,
            &lease,
            &billable,
            month_start,
            month_end,
            &month_key,
            due_day_cap,
        )
        .await
        {
            Ok(invoice) => {
                summary.generated += 1;
                metrics::INVOICES_GENERATED_TOTAL.inc();

                let portfolio_id = val_str(&lease, "portfolio_id");
                let invoice_id = val_str(&invoice, "id");
                let total = val_f64(&invoice, "total_amount");
                let currency = val_str(&invoice, "currency");
                notify_portfolio_members(
                    pool,
                    &portfolio_id,
                    "invoice_issued",
                    "Invoice issued",
                    &format!("Invoice for {month_key} issued: {total:.2} {currency}."),
                    Some("invoice"),
                    Some(&invoice_id),
                )
                .await;
            }
            // A concurrent run beat us to the unique index; that is a skip.
            Err(AppError::Conflict(_)) => {
                summary.skipped_existing += 1;
                metrics::INVOICES_SKIPPED_TOTAL.inc();
            }
            Err(error) => {
                warn!(lease_id, error = %error, "Invoice generation: create failed");
                summary.errors += 1;
            }
        }
    }

    info!(
        month = %month_key,
        scanned = summary.leases_scanned,
        generated = summary.generated,
        skipped = summary.skipped_existing,
        errors = summary.errors,
        "Invoice generation completed"
    );
    summary
}

async fn invoice_exists_for_month(
    pool: &PgPool,
    lease_id: &str,
    month_key: &str,
) -> Result<bool, AppError> {
    let mut filters = Map::new();
    filters.insert("lease_id".to_string(), Value::String(lease_id.to_string()));
    filters.insert(
        "billing_month".to_string(),
        Value::String(month_key.to_string()),
    );
    filters.insert(
        "status".to_string(),
        Value::Array(
            NON_VOID_STATUSES
                .iter()
                .map(|status| Value::String((*status).to_string()))
                .collect(),
        ),
    );
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));

    let count = crate::repository::table_service::count_rows(pool, "invoices", Some(&filters)).await?;
    Ok(count > 0)
}

async fn create_invoice_for_lease(
    pool: &PgPool,
    lease: &Value,
    charges: &[Value],
    month_start: NaiveDate,
    month_end: NaiveDate,
    month_key: &str,
    due_day_cap: u32,
) -> Result<Value, AppError> {
    let lease_id = val_str(lease, "id");
    let portfolio_id = val_str(lease, "portfolio_id");
    let currency = {
        let value = val_str(lease, "currency");
        if value.is_empty() {
            "USD".to_string()
        } else {
            value
        }
    };
    let billing_day = val_i64_or(lease, "billing_day", 1);
    let due_date = due_date_for(month_start, billing_day, due_day_cap);

    let subtotal = round_cents(charges.iter().map(|charge| val_f64(charge, "amount")).sum());
    let total = subtotal;

    let mut tx = pool
        .begin()
        .await
        .map_err(|error| AppError::Dependency(format!("txn begin: {error}")))?;

    let mut invoice = Map::new();
    invoice.insert("portfolio_id".to_string(), Value::String(portfolio_id));
    invoice.insert("lease_id".to_string(), Value::String(lease_id));
    invoice.insert(
        "billing_month".to_string(),
        Value::String(month_key.to_string()),
    );
    invoice.insert(
        "period_start".to_string(),
        Value::String(month_start.format("%Y-%m-%d").to_string()),
    );
    invoice.insert(
        "period_end".to_string(),
        Value::String(month_end.format("%Y-%m-%d").to_string()),
    );
    invoice.insert(
        "due_date".to_string(),
        Value::String(due_date.format("%Y-%m-%d").to_string()),
    );
    invoice.insert(
        "status".to_string(),
        Value::String(INVOICE_STATUS_OPEN.to_string()),
    );
    invoice.insert("subtotal".to_string(), json!(subtotal));
    invoice.insert("tax_amount".to_string(), json!(0.0));
    invoice.insert("total_amount".to_string(), json!(total));
    invoice.insert("balance_due".to_string(), json!(total));
    invoice.insert("currency".to_string(), Value::String(currency));
    invoice.insert(
        "issued_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );

    let created = create_row_tx(&mut tx, "invoices", &invoice).await?;
    let invoice_id = val_str(&created, "id");

    for (index, charge) in charges.iter().enumerate() {
        let amount = round_cents(val_f64(charge, "amount"));
        let mut item = Map::new();
        item.insert("invoice_id".to_string(), Value::String(invoice_id.clone()));
        item.insert(
            "lease_charge_id".to_string(),
            Value::String(val_str(charge, "id")),
        );
        item.insert(
            "description".to_string(),
            Value::String(val_str(charge, "name")),
        );
        item.insert("quantity".to_string(), json!(1.0));
        item.insert("unit_amount".to_string(), json!(amount));
        item.insert("amount".to_string(), json!(amount));
        item.insert("sort_order".to_string(), json!(index as i64));
        create_row_tx(&mut tx, "invoice_items", &item).await?;
    }

    tx.commit()
        .await
        .map_err(|error| AppError::Dependency(format!("txn commit: {error}")))?;

    Ok(created)
}

// ---------------------------------------------------------------------------
// Overdue scan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OverdueSummary {
    pub marked_overdue: u32,
    pub errors: u32,
}

/// Flip open / partially-paid invoices past their due date to overdue.
pub async fn run_overdue_scan(pool: &PgPool, today: NaiveDate) -> OverdueSummary {
    let mut summary = OverdueSummary::default();

    let mut filters = Map::new();
    filters.insert(
        "status".to_string(),
        Value::Array(vec![
            Value::String(INVOICE_STATUS_OPEN.to_string()),
            Value::String(INVOICE_STATUS_PARTIALLY_PAID.to_string()),
        ]),
    );
    filters.insert(
        "due_date__lt".to_string(),
        Value::String(today.format("%Y-%m-%d").to_string()),
    );
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));

    let invoices = match list_rows(pool, "invoices", Some(&filters), 1000, 0, "due_date", true).await
    {
        Ok(rows) => rows,
        Err(error) => {
            warn!(error = %error, "Overdue scan: failed to fetch invoices");
            summary.errors += 1;
            return summary;
        }
    };

    for invoice in invoices {
        let invoice_id = val_str(&invoice, "id");
        if invoice_id.is_empty() {
            continue;
        }

        let mut patch = Map::new();
        patch.insert(
            "status".to_string(),
            Value::String(INVOICE_STATUS_OVERDUE.to_string()),
        );
        if let Err(error) = update_row(pool, "invoices", &invoice_id, &patch, "id").await {
            warn!(invoice_id, error = %error, "Overdue scan: update failed");
            summary.errors += 1;
            continue;
        }

        summary.marked_overdue += 1;
        metrics::INVOICES_MARKED_OVERDUE_TOTAL.inc();

        let portfolio_id = val_str(&invoice, "portfolio_id");
        let due_date = val_str(&invoice, "due_date");
        let balance = val_f64(&invoice, "balance_due");
        let currency = val_str(&invoice, "currency");
        notify_portfolio_members(
            pool,
            &portfolio_id,
            "invoice_overdue",
            "Invoice overdue",
            &format!("Invoice due {due_date} is overdue with {balance:.2} {currency} outstanding."),
            Some("invoice"),
            Some(&invoice_id),
        )
        .await;
    }

    if summary.marked_overdue > 0 || summary.errors > 0 {
        info!(
            marked = summary.marked_overdue,
            errors = summary.errors,
            "Overdue scan completed"
        );
    }
    summary
}

// ---------------------------------------------------------------------------
// Payment application
// ---------------------------------------------------------------------------

/// Allocate part of a payment's unapplied amount to an invoice.
///
/// All effects are committed in one transaction: the application row is
/// inserted (or accumulated), the payment's unapplied amount shrinks, and
/// the invoice's balance and status are recomputed.
pub async fn apply_payment(
    pool: &PgPool,
    payment_id: &str,
    invoice_id: &str,
    amount: f64,
) -> Result<Value, AppError> {
    let amount = round_cents(amount);
    if amount <= 0.0 {
        return Err(AppError::UnprocessableEntity(
            "Application amount must be positive.".to_string(),
        ));
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|error| AppError::Dependency(format!("txn begin: {error}")))?;

    let payment = fetch_row_tx(&mut tx, "payments", payment_id)
        .await?
        .ok_or_else(|| AppError::NotFound("payments record not found.".to_string()))?;
    let invoice = fetch_row_tx(&mut tx, "invoices", invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound("invoices record not found.".to_string()))?;

    if !value_is_null(&payment, "deleted_at") || !value_is_null(&invoice, "deleted_at") {
        return Err(AppError::Gone(
            "Payment or invoice is no longer available.".to_string(),
        ));
    }
    if val_str(&payment, "portfolio_id") != val_str(&invoice, "portfolio_id") {
        return Err(AppError::Conflict(
            "Payment and invoice belong to different portfolios.".to_string(),
        ));
    }

    let invoice_status = val_str(&invoice, "status");
    if invoice_status == INVOICE_STATUS_VOID || invoice_status == INVOICE_STATUS_DRAFT {
        return Err(AppError::Conflict(format!(
            "Cannot apply a payment to a {invoice_status} invoice."
        )));
    }

    let unapplied = round_cents(val_f64(&payment, "unapplied_amount"));
    if amount > unapplied + CENT_EPSILON {
        return Err(AppError::UnprocessableEntity(format!(
            "Application amount {amount:.2} exceeds the payment's unapplied {unapplied:.2}."
        )));
    }

    let total = val_f64(&invoice, "total_amount");
    let balance = round_cents(val_f64(&invoice, "balance_due"));
    if amount > balance + CENT_EPSILON {
        return Err(AppError::UnprocessableEntity(format!(
            "Application amount {amount:.2} exceeds the invoice balance {balance:.2}."
        )));
    }

    // Accumulate into the (payment, invoice) application row.
    sqlx::query(
        "INSERT INTO payment_applications (payment_id, invoice_id, amount)
         VALUES ($1::uuid, $2::uuid, $3)
         ON CONFLICT (payment_id, invoice_id)
         DO UPDATE SET amount = payment_applications.amount + EXCLUDED.amount",
    )
    .bind(payment_id)
    .bind(invoice_id)
    .bind(amount)
    .execute(&mut *tx)
    .await
    .map_err(|error| AppError::Dependency(format!("application insert: {error}")))?;

    let mut payment_patch = Map::new();
    payment_patch.insert(
        "unapplied_amount".to_string(),
        json!(round_cents(unapplied - amount)),
    );
    let updated_payment = update_row_tx(&mut tx, "payments", payment_id, &payment_patch).await?;

    let new_balance = round_cents(balance - amount);
    let today = Utc::now().date_naive();
    let new_status = status_for_balance(total, new_balance, val_date(&invoice, "due_date"), today);

    let mut invoice_patch = Map::new();
    invoice_patch.insert("balance_due".to_string(), json!(new_balance));
    invoice_patch.insert("status".to_string(), Value::String(new_status.to_string()));
    let updated_invoice = update_row_tx(&mut tx, "invoices", invoice_id, &invoice_patch).await?;

    tx.commit()
        .await
        .map_err(|error| AppError::Dependency(format!("txn commit: {error}")))?;

    metrics::PAYMENT_APPLICATIONS_TOTAL.inc();

    Ok(json!({
        "payment": updated_payment,
        "invoice": updated_invoice,
        "applied_amount": amount,
    }))
}

/// Reverse an application entirely: the invoice balance grows back, the
/// payment's unapplied amount is restored, and the invoice status is
/// recomputed from the restored balance and its due date.
pub async fn unapply_payment(
    pool: &PgPool,
    payment_id: &str,
    invoice_id: &str,
) -> Result<Value, AppError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|error| AppError::Dependency(format!("txn begin: {error}")))?;

    let application = sqlx::query(
        "SELECT row_to_json(t) AS row FROM payment_applications t
         WHERE payment_id = $1::uuid AND invoice_id = $2::uuid
         LIMIT 1",
    )
    .bind(payment_id)
    .bind(invoice_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|error| AppError::Dependency(format!("application fetch: {error}")))?
    .and_then(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
    .ok_or_else(|| {
        AppError::NotFound("No application exists for this payment and invoice.".to_string())
    })?;

    let applied = round_cents(val_f64(&application, "amount"));

    let payment = fetch_row_tx(&mut tx, "payments", payment_id)
        .await?
        .ok_or_else(|| AppError::NotFound("payments record not found.".to_string()))?;
    let invoice = fetch_row_tx(&mut tx, "invoices", invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound("invoices record not found.".to_string()))?;

    sqlx::query(
        "DELETE FROM payment_applications
         WHERE payment_id = $1::uuid AND invoice_id = $2::uuid",
    )
    .bind(payment_id)
    .bind(invoice_id)
    .execute(&mut *tx)
    .await
    .map_err(|error| AppError::Dependency(format!("application delete: {error}")))?;

    let unapplied = round_cents(val_f64(&payment, "unapplied_amount"));
    let mut payment_patch = Map::new();
    payment_patch.insert(
        "unapplied_amount".to_string(),
        json!(round_cents(unapplied + applied)),
    );
    let updated_payment = update_row_tx(&mut tx, "payments", payment_id, &payment_patch).await?;

    let total = val_f64(&invoice, "total_amount");
    let balance = round_cents(val_f64(&invoice, "balance_due"));
    let new_balance = round_cents((balance + applied).min(total));
    let today = Utc::now().date_naive();
    let new_status = status_for_balance(total, new_balance, val_date(&invoice, "due_date"), today);

    let mut invoice_patch = Map::new();
    invoice_patch.insert("balance_due".to_string(), json!(new_balance));
    invoice_patch.insert("status".to_string(), Value::String(new_status.to_string()));
    let updated_invoice = update_row_tx(&mut tx, "invoices", invoice_id, &invoice_patch).await?;

    tx.commit()
        .await
        .map_err(|error| AppError::Dependency(format!("txn commit: {error}")))?;

    Ok(json!({
        "payment": updated_payment,
        "invoice": updated_invoice,
        "unapplied_amount": applied,
    }))
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

async fn fetch_row(pool: &PgPool, table: &str, row_id: &str) -> Result<Option<Value>, AppError> {
    crate::repository::table_service::get_row(pool, table, row_id, "id")
        .await
        .map(Some)
        .or_else(|error| match error {
            AppError::NotFound(_) => Ok(None),
            other => Err(other),
        })
}

async fn fetch_row_tx(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
) -> Result<Option<Value>, AppError> {
    // Bound tables only; callers pass literals from this module.
    let query = format!(
        "SELECT row_to_json(t) AS row FROM {table} t WHERE id = $1::uuid LIMIT 1"
    );
    let row = sqlx::query(&query)
        .bind(row_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| AppError::Dependency(format!("row fetch: {error}")))?;
    Ok(row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten()))
}

pub fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

pub fn val_f64(row: &Value, key: &str) -> f64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(|value| {
            value
                .as_f64()
                .or_else(|| value.as_str().and_then(|text| text.parse::<f64>().ok()))
        })
        .unwrap_or(0.0)
}

pub fn val_i64_or(row: &Value, key: &str, default: i64) -> i64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

pub fn val_bool_or(row: &Value, key: &str, default: bool) -> bool {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

pub fn val_date(row: &Value, key: &str) -> Option<NaiveDate> {
    let raw = val_str(row, key);
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(&raw[..raw.len().min(10)], "%Y-%m-%d").ok()
}

pub fn value_is_null(row: &Value, key: &str) -> bool {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .map(Value::is_null)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn billing_month_round_trip() {
        let month = parse_billing_month("2026-02").expect("parses");
        assert_eq!(month, date(2026, 2, 1));
        assert_eq!(billing_month_key(month), "2026-02");
        assert!(parse_billing_month("2026-13").is_none());
        assert!(parse_billing_month("garbage").is_none());
    }

    #[test]
    fn month_bounds_handle_year_end_and_leap() {
        assert_eq!(
            month_bounds(date(2026, 12, 15)),
            (date(2026, 12, 1), date(2026, 12, 31))
        );
        assert_eq!(
            month_bounds(date(2028, 2, 10)),
            (date(2028, 2, 1), date(2028, 2, 29))
        );
    }

    #[test]
    fn cadence_arithmetic() {
        let anchor = Some(date(2026, 1, 10));
        assert!(cadence_matches("monthly", anchor, date(2026, 5, 1)));
        assert!(cadence_matches("quarterly", anchor, date(2026, 4, 1)));
        assert!(!cadence_matches("quarterly", anchor, date(2026, 5, 1)));
        assert!(cadence_matches("yearly", anchor, date(2027, 1, 1)));
        assert!(!cadence_matches("yearly", anchor, date(2027, 2, 1)));
        // Before the anchor nothing fires.
        assert!(!cadence_matches("quarterly", anchor, date(2025, 10, 1)));
        // Unknown cadence never fires; missing anchor always aligns.
        assert!(!cadence_matches("weekly", anchor, date(2026, 1, 1)));
        assert!(cadence_matches("quarterly", None, date(2026, 5, 1)));
    }

    #[test]
    fn due_date_respects_billing_day_and_cap() {
        assert_eq!(due_date_for(date(2026, 2, 1), 15, 28), date(2026, 2, 15));
        assert_eq!(due_date_for(date(2026, 2, 1), 31, 28), date(2026, 2, 28));
        assert_eq!(due_date_for(date(2026, 2, 1), 0, 28), date(2026, 2, 1));
    }

    #[test]
    fn charge_window_and_cadence_gate_billability() {
        let month_start = date(2026, 3, 1);
        let month_end = date(2026, 3, 31);

        let monthly = json!({
            "is_active": true,
            "cadence": "monthly",
            "starts_on": "2026-01-01",
            "ends_on": null,
            "amount": 1200.0
        });
        assert!(charge_billable_in_month(
            &monthly, None, month_start, month_end
        ));

        let ended = json!({
            "is_active": true,
            "cadence": "monthly",
            "starts_on": "2025-01-01",
            "ends_on": "2026-02-28",
        });
        assert!(!charge_billable_in_month(&ended, None, month_start, month_end));

        let future = json!({
            "is_active": true,
            "cadence": "monthly",
            "starts_on": "2026-04-01",
        });
        assert!(!charge_billable_in_month(
            &future, None, month_start, month_end
        ));

        let inactive = json!({
            "is_active": false,
            "cadence": "monthly",
            "starts_on": "2026-01-01",
        });
        assert!(!charge_billable_in_month(
            &inactive, None, month_start, month_end
        ));

        // Quarterly anchored in January does not fire in March.
        let quarterly = json!({
            "is_active": true,
            "cadence": "quarterly",
            "starts_on": "2026-01-01",
        });
        assert!(!charge_billable_in_month(
            &quarterly, None, month_start, month_end
        ));
        assert!(charge_billable_in_month(
            &quarterly,
            None,
            date(2026, 4, 1),
            date(2026, 4, 30)
        ));

        // No charge window: the lease start anchors the cadence.
        let anchorless = json!({
            "is_active": true,
            "cadence": "quarterly",
        });
        assert!(charge_billable_in_month(
            &anchorless,
            Some(date(2026, 1, 5)),
            date(2026, 4, 1),
            date(2026, 4, 30)
        ));
        assert!(!charge_billable_in_month(
            &anchorless,
            Some(date(2026, 1, 5)),
            month_start,
            month_end
        ));
    }

    #[test]
    fn status_math_for_applications() {
        let today = date(2026, 6, 10);
        let due_future = Some(date(2026, 6, 20));
        let due_past = Some(date(2026, 6, 1));

        assert_eq!(status_for_balance(100.0, 0.0, due_future, today), "paid");
        assert_eq!(
            status_for_balance(100.0, 0.004, due_past, today),
            "paid",
            "sub-cent residue counts as settled"
        );
        assert_eq!(
            status_for_balance(100.0, 40.0, due_future, today),
            "partially_paid"
        );
        assert_eq!(status_for_balance(100.0, 100.0, due_future, today), "open");
        assert_eq!(status_for_balance(100.0, 40.0, due_past, today), "overdue");
        assert_eq!(status_for_balance(100.0, 100.0, None, today), "open");
    }

    #[test]
    fn rounding_is_cent_stable() {
        assert_eq!(round_cents(10.004), 10.0);
        assert_eq!(round_cents(10.006), 10.01);
        assert_eq!(round_cents(0.1 + 0.2), 0.3);
    }

    #[test]
    fn dedup_statuses_exclude_only_void() {
        assert!(!NON_VOID_STATUSES.contains(&INVOICE_STATUS_VOID));
        for status in ["draft", "open", "partially_paid", "paid", "overdue"] {
            assert!(NON_VOID_STATUSES.contains(&status), "missing {status}");
        }
    }

    #[test]
    fn months_between_spans_years() {
        assert_eq!(months_between(date(2025, 11, 1), date(2026, 2, 1)), 3);
        assert_eq!(months_between(date(2026, 2, 1), date(2025, 11, 1)), -3);
        assert_eq!(months_between(date(2026, 2, 28), date(2026, 2, 1)), 0);
    }
}
