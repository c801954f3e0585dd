use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::time::sleep;

use crate::state::AppState;

/// Spawn the background scheduler that runs the daily billing jobs.
///
/// Each job runs in its own `tokio::spawn` so a failure in one job never
/// crashes the scheduler loop or other jobs. Jobs run once per calendar day
/// at or after 05:00 UTC; the invoice generator is idempotent per lease and
/// billing month, so re-running after a restart is harmless.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    let pool = match state.db_pool.as_ref() {
        Some(pool) => pool.clone(),
        None => {
            tracing::warn!("Scheduler: no database pool configured, exiting");
            return;
        }
    };

    let due_day_cap = state.config.invoice_due_day_cap;
    let mut last_daily_run: Option<u32> = None;

    loop {
        sleep(Duration::from_secs(15)).await;

        let now_utc = Utc::now();
        let today = now_utc.date_naive();

        let today_ordinal = today.ordinal();
        if last_daily_run == Some(today_ordinal) {
            continue;
        }
        if now_utc.hour() < 5 {
            continue;
        }

        last_daily_run = Some(today_ordinal);
        tracing::info!("Scheduler: running daily jobs for {today}");

        // 05:00 — invoice generation for the current billing month
        {
            let pool = pool.clone();
            tokio::spawn(async move {
                let summary = crate::services::billing::run_invoice_generation(
                    &pool, None, today, due_day_cap,
                )
                .await;
                tracing::info!(
                    generated = summary.generated,
                    skipped = summary.skipped_existing,
                    errors = summary.errors,
                    "Scheduler: invoice generation completed"
                );
            });
        }

        // 05:00 — overdue scan
        {
            let pool = pool.clone();
            tokio::spawn(async move {
                let summary = crate::services::billing::run_overdue_scan(&pool, today).await;
                if summary.marked_overdue > 0 || summary.errors > 0 {
                    tracing::info!(
                        marked = summary.marked_overdue,
                        errors = summary.errors,
                        "Scheduler: overdue scan completed"
                    );
                }
            });
        }
    }
}
