use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::{create_row, list_rows};

/// Create one in-app notification row. Best effort, same posture as the
/// audit trail: a lost notification must never fail the surrounding job.
pub async fn notify_user(
    pool: &PgPool,
    portfolio_id: &str,
    user_id: &str,
    kind: &str,
    title: &str,
    body: &str,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
) -> bool {
    let mut record = Map::new();
    record.insert(
        "portfolio_id".to_string(),
        Value::String(portfolio_id.to_string()),
    );
    record.insert("user_id".to_string(), Value::String(user_id.to_string()));
    record.insert("kind".to_string(), Value::String(kind.to_string()));
    record.insert("title".to_string(), Value::String(title.to_string()));
    record.insert("body".to_string(), Value::String(body.to_string()));
    if let Some(entity_type) = entity_type {
        record.insert(
            "entity_type".to_string(),
            Value::String(entity_type.to_string()),
        );
    }
    if let Some(entity_id) = entity_id {
        record.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
    }

    match create_row(pool, "notifications", &record).await {
        Ok(_) => true,
        Err(error) => {
            tracing::warn!(kind, user_id, error = %error, "Failed to queue notification");
            false
        }
    }
}

/// Fan a notification out to every member of a portfolio.
pub async fn notify_portfolio_members(
    pool: &PgPool,
    portfolio_id: &str,
    kind: &str,
    title: &str,
    body: &str,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
) -> u32 {
    let mut filters = Map::new();
    filters.insert(
        "portfolio_id".to_string(),
        Value::String(portfolio_id.to_string()),
    );

    let members = match list_rows(
        pool,
        "portfolio_members",
        Some(&filters),
        100,
        0,
        "created_at",
        true,
    )
    .await
    {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(portfolio_id, error = %error, "Failed to list members for notification");
            return 0;
        }
    };

    let mut queued = 0u32;
    for member in members {
        let user_id = member
            .as_object()
            .and_then(|obj| obj.get("user_id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if user_id.is_empty() {
            continue;
        }
        if notify_user(
            pool,
            portfolio_id,
            user_id,
            kind,
            title,
            body,
            entity_type,
            entity_id,
        )
        .await
        {
            queued += 1;
        }
    }
    queued
}
