use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// Claims carried by the access token. `sub` is the app_users UUID.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

/// Resolve the calling user from the request headers.
///
/// Order: dev `x-user-id` override (never in production), `Authorization:
/// Bearer <jwt>`, then the `access_token` cookie.
pub async fn require_auth_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(AuthUser {
                id: user_id,
                email: None,
                full_name: None,
            });
        }
    }

    let token = bearer_token(headers)
        .or_else(|| cookie_value(headers, "access_token"))
        .ok_or_else(|| AppError::Unauthorized("Unauthorized: missing access token.".to_string()))?;

    let secret = state.config.auth_jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("Auth is not configured. Set AUTH_JWT_SECRET.".to_string())
    })?;

    let claims = decode_claims(&token, secret)?;
    if claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }

    Ok(AuthUser {
        id: claims.sub,
        email: claims.email,
        full_name: claims.name,
    })
}

pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    Ok(require_auth_user(state, headers).await?.id)
}

fn decode_claims(token: &str, secret: &str) -> Result<AccessClaims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|error| AppError::Unauthorized(format!("Unauthorized: invalid token ({error}).")))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let rest = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let trimmed = rest.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use axum::http::header::{AUTHORIZATION, COOKIE};
    use axum::http::HeaderMap;
    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::{bearer_token, cookie_value, decode_claims};

    const SECRET: &str = "test-secret";

    fn token_for(sub: &str, exp: usize) -> String {
        let claims = serde_json::json!({ "sub": sub, "exp": exp });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("token encodes")
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        let mut empty = HeaderMap::new();
        empty.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&empty).is_none());
    }

    #[test]
    fn extracts_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            "theme=dark; access_token=tok123; lang=en".parse().unwrap(),
        );
        assert_eq!(
            cookie_value(&headers, "access_token").as_deref(),
            Some("tok123")
        );
        assert!(cookie_value(&headers, "missing").is_none());
    }

    #[test]
    fn decodes_valid_token_and_rejects_expired() {
        let future = (chrono::Utc::now().timestamp() + 3600) as usize;
        let claims = decode_claims(&token_for("user-1", future), SECRET).expect("valid token");
        assert_eq!(claims.sub, "user-1");

        let past = (chrono::Utc::now().timestamp() - 3600) as usize;
        assert!(decode_claims(&token_for("user-1", past), SECRET).is_err());
        assert!(decode_claims(&token_for("user-1", future), "wrong").is_err());
    }
}
