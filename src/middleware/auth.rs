use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::AppState;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub role: Option<String>,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case(ADMIN_ROLE))
            .unwrap_or(false)
    }
}

/// HS256 token for `subject`, used by operators and tests.
pub fn issue_token(
    secret: &str,
    subject: &str,
    role: Option<&str>,
    ttl: chrono::Duration,
) -> Result<String> {
    let claims = Claims {
        sub: subject.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
        role: role.map(str::to_string),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::Internal(format!("could not sign token: {}", e)))
}

pub fn decode_bearer(header_value: Option<&str>, secret: &str) -> Result<Claims> {
    let Some(auth_str) = header_value else {
        return Err(Error::Auth("Missing Authorization header".to_string()));
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return Err(Error::Auth("Unsupported authorization scheme".to_string()));
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    decode::<Claims>(
        token.trim(),
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| Error::Auth("Invalid or expired token".to_string()))
}

pub async fn require_bearer_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_value = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match decode_bearer(header_value, &state.config.jwt_secret) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!(path = %req.uri().path(), "Rejected request: {}", e);
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips_with_role() {
        let token = issue_token("secret", "ops", Some("Admin"), chrono::Duration::minutes(5)).unwrap();
        let claims = decode_bearer(Some(&format!("Bearer {}", token)), "secret").unwrap();
        assert_eq!(claims.sub, "ops");
        assert!(claims.is_admin());
    }

    #[test]
    fn rejects_missing_wrong_scheme_bad_secret_and_expired() {
        assert!(decode_bearer(None, "secret").is_err());

        let token = issue_token("secret", "ops", None, chrono::Duration::minutes(5)).unwrap();
        assert!(decode_bearer(Some(&format!("Token {}", token)), "secret").is_err());
        assert!(decode_bearer(Some(&format!("Bearer {}", token)), "other").is_err());

        let expired = issue_token("secret", "ops", None, chrono::Duration::hours(-2)).unwrap();
        assert!(decode_bearer(Some(&format!("Bearer {}", expired)), "secret").is_err());
    }
}
