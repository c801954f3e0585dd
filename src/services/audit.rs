use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

/// Append an audit-log row for a mutation. Best effort: audit failures are
/// logged and never bubble into the request that triggered them.
#[allow(clippy::too_many_arguments)]
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    portfolio_id: Option<&str>,
    actor_user_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    before_state: Option<Value>,
    after_state: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut record = Map::new();
    if let Some(portfolio_id) = portfolio_id.filter(|value| !value.is_empty()) {
        record.insert(
            "portfolio_id".to_string(),
            Value::String(portfolio_id.to_string()),
        );
    }
    if let Some(actor) = actor_user_id.filter(|value| !value.is_empty()) {
        record.insert(
            "actor_user_id".to_string(),
            Value::String(actor.to_string()),
        );
    }
    record.insert("action".to_string(), Value::String(action.to_string()));
    record.insert(
        "entity_type".to_string(),
        Value::String(entity_type.to_string()),
    );
    if let Some(entity_id) = entity_id.filter(|value| !value.is_empty()) {
        record.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
    }
    if let Some(before) = before_state {
        record.insert("before_state".to_string(), before);
    }
    if let Some(after) = after_state {
        record.insert("after_state".to_string(), after);
    }

    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(
            action,
            entity_type,
            error = %error,
            "Failed to write audit log entry"
        );
    }
}
