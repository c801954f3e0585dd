use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use crate::{auth::AuthUser, error::AppError, state::AppState};

pub const ROLE_OWNER_ADMIN: &str = "owner_admin";
pub const ROLE_MANAGER: &str = "manager";
pub const ROLE_ACCOUNTANT: &str = "accountant";
pub const ROLE_VIEWER: &str = "viewer";

fn db_pool(state: &AppState) -> Result<&PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

/// Fetch the caller's membership row for a portfolio, going through the
/// short-lived cache so repeated guards in one burst hit the DB once.
pub async fn get_portfolio_membership(
    state: &AppState,
    user_id: &str,
    portfolio_id: &str,
) -> Result<Option<Value>, AppError> {
    let key = (portfolio_id.to_string(), user_id.to_string());
    if let Some(cached) = state.membership_cache.get(&key).await {
        return Ok(cached);
    }

    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM portfolio_members t
         WHERE portfolio_id = $1::uuid AND user_id = $2::uuid
         LIMIT 1",
    )
    .bind(portfolio_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Database request failed: {error}")))?;

    let membership = row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten());
    state.membership_cache.insert(key, membership.clone()).await;
    Ok(membership)
}

pub async fn assert_portfolio_member(
    state: &AppState,
    user_id: &str,
    portfolio_id: &str,
) -> Result<Value, AppError> {
    get_portfolio_membership(state, user_id, portfolio_id)
        .await?
        .ok_or_else(|| {
            AppError::Forbidden("Forbidden: not a member of this portfolio.".to_string())
        })
}

pub async fn assert_portfolio_role(
    state: &AppState,
    user_id: &str,
    portfolio_id: &str,
    allowed_roles: &[&str],
) -> Result<Value, AppError> {
    let membership = assert_portfolio_member(state, user_id, portfolio_id).await?;
    let role = membership
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if allowed_roles.contains(&role) {
        return Ok(membership);
    }

    Err(AppError::Forbidden(format!(
        "Forbidden: role '{role}' is not allowed for this action."
    )))
}

/// Upsert the caller into app_users from their token claims.
pub async fn ensure_app_user(state: &AppState, user: &AuthUser) -> Result<Value, AppError> {
    if user.id.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: missing user.".to_string(),
        ));
    }
    let Some(email) = user.email.as_deref() else {
        return Err(AppError::BadRequest(
            "Access token is missing an email claim.".to_string(),
        ));
    };

    let full_name = resolve_full_name(user, email);
    let pool = db_pool(state)?;

    sqlx::query(
        "INSERT INTO app_users (id, email, full_name)
         VALUES ($1::uuid, $2, $3)
         ON CONFLICT (id)
         DO UPDATE SET email = EXCLUDED.email, full_name = EXCLUDED.full_name",
    )
    .bind(&user.id)
    .bind(email)
    .bind(&full_name)
    .execute(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Database request failed: {error}")))?;

    Ok(json!({
        "id": user.id,
        "email": email,
        "full_name": full_name
    }))
}

pub async fn list_user_portfolio_ids(
    state: &AppState,
    user_id: &str,
) -> Result<Vec<String>, AppError> {
    let pool = db_pool(state)?;
    let rows = sqlx::query(
        "SELECT portfolio_id::text AS portfolio_id
         FROM portfolio_members
         WHERE user_id = $1::uuid
         LIMIT 500",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Database request failed: {error}")))?;

    let mut portfolio_ids = Vec::new();
    for row in rows {
        if let Ok(value) = row.try_get::<String, _>("portfolio_id") {
            if !value.is_empty() {
                portfolio_ids.push(value);
            }
        }
    }
    Ok(portfolio_ids)
}

pub async fn list_user_portfolios(
    state: &AppState,
    user_id: &str,
) -> Result<Vec<Value>, AppError> {
    let pool = db_pool(state)?;
    let portfolio_ids = list_user_portfolio_ids(state, user_id).await?;
    if portfolio_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM portfolios t
         WHERE id = ANY($1::uuid[]) AND deleted_at IS NULL
         LIMIT 500",
    )
    .bind(&portfolio_ids)
    .fetch_all(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Database request failed: {error}")))?;

    let mut portfolios = Vec::new();
    for row in rows {
        if let Ok(Some(item)) = row.try_get::<Option<Value>, _>("row") {
            portfolios.push(item);
        }
    }
    Ok(portfolios)
}

/// Drop cached membership rows for a portfolio/user pair after a role change.
pub async fn invalidate_membership(state: &AppState, portfolio_id: &str, user_id: &str) {
    state
        .membership_cache
        .invalidate(&(portfolio_id.to_string(), user_id.to_string()))
        .await;
}

fn resolve_full_name(user: &AuthUser, email: &str) -> String {
    if let Some(name) = user
        .full_name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return name.to_string();
    }

    email
        .split('@')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "User".to_string())
}

#[cfg(test)]
mod tests {
    use super::resolve_full_name;
    use crate::auth::AuthUser;

    #[test]
    fn full_name_prefers_claim_then_email_local_part() {
        let named = AuthUser {
            id: "u1".to_string(),
            email: Some("jo@example.com".to_string()),
            full_name: Some("Jo Doe".to_string()),
        };
        assert_eq!(resolve_full_name(&named, "jo@example.com"), "Jo Doe");

        let unnamed = AuthUser {
            id: "u2".to_string(),
            email: Some("sam@example.com".to_string()),
            full_name: None,
        };
        assert_eq!(resolve_full_name(&unnamed, "sam@example.com"), "sam");
    }
}
