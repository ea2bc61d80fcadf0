//! Auth Verifier (component H, §4.8). Token *issuance* is an external Auth
//! Service's concern (§1); this module only verifies bearer tokens handed
//! to the Push Bus handshake and to REST control operations, and extracts
//! the acting identity from the token payload -- never from a client-
//! supplied body field.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use jsonwebtoken::{DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Role, UserId};

/// HMAC keypair derived from the shared signing secret (§6.4). Unlike a
/// self-issuing service, the core never holds an encoding key in
/// production; it is kept here only so tests can mint tokens the same way
/// the external Auth Service would.
pub struct Keys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
}

impl Keys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: u64,
    pub active: bool,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId(self.sub.clone())
    }

    pub fn require_role(&self, allowed: &[Role]) -> Result<(), CoreError> {
        if allowed.iter().any(|r| std::mem::discriminant(r) == std::mem::discriminant(&self.role)) {
            Ok(())
        } else {
            Err(CoreError::Forbidden)
        }
    }
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
    std::sync::Arc<Keys>: FromRef<S>,
{
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| CoreError::Unauthenticated)?;

        let keys = std::sync::Arc::<Keys>::from_ref(state);
        let data = jsonwebtoken::decode::<Claims>(
            bearer.token(),
            &keys.decoding,
            &Validation::default(),
        )
        .map_err(|_| CoreError::Unauthenticated)?;

        if !data.claims.active {
            return Err(CoreError::Unauthenticated);
        }
        Ok(data.claims)
    }
}

/// Verifies a raw token string outside the axum extractor path, for the
/// Push Bus handshake (§4.6) which authenticates over a websocket frame
/// rather than an HTTP header.
pub fn verify_token(token: &str, keys: &Keys) -> Result<Claims, CoreError> {
    let data = jsonwebtoken::decode::<Claims>(token, &keys.decoding, &Validation::default())
        .map_err(|_| CoreError::Unauthenticated)?;
    if !data.claims.active {
        return Err(CoreError::Unauthenticated);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod test {
    use super::*;
    use jsonwebtoken::Header;

    fn mint(role: Role, active: bool, exp_secs_from_now: i64, keys: &Keys) -> String {
        let claims = Claims {
            sub: "user-1".into(),
            role,
            exp: (chrono::Utc::now().timestamp() + exp_secs_from_now) as u64,
            active,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &keys.encoding).unwrap()
    }

    #[test]
    fn verify_token_accepts_valid_active_token() {
        let keys = Keys::from_secret("test-secret");
        let token = mint(Role::Customer, true, 3600, &keys);
        let claims = verify_token(&token, &keys).unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn verify_token_rejects_expired_token() {
        let keys = Keys::from_secret("test-secret");
        let token = mint(Role::Customer, true, -10, &keys);
        assert!(verify_token(&token, &keys).is_err());
    }

    #[test]
    fn verify_token_rejects_inactive_account() {
        let keys = Keys::from_secret("test-secret");
        let token = mint(Role::Customer, false, 3600, &keys);
        assert!(verify_token(&token, &keys).is_err());
    }

    #[test]
    fn verify_token_rejects_wrong_secret() {
        let keys = Keys::from_secret("test-secret");
        let other = Keys::from_secret("other-secret");
        let token = mint(Role::Customer, true, 3600, &keys);
        assert!(verify_token(&token, &other).is_err());
    }

    #[test]
    fn require_role_rejects_disallowed_role() {
        let claims = Claims {
            sub: "user-1".into(),
            role: Role::Customer,
            exp: 0,
            active: true,
        };
        assert!(claims.require_role(&[Role::Admin]).is_err());
        assert!(claims.require_role(&[Role::Customer]).is_ok());
    }
}
