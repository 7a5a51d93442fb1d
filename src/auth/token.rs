//! Bearer-token (JWT) verification for app clients.
//!
//! Mirrors `app/auth.py`'s `create_access_token`/`decode_token` pair: an
//! HS-family MAC over a JSON payload carrying `sub` (the user id) and `exp`,
//! optionally `email`. Per spec.md §4.5, any failure — expired, malformed,
//! bad signature — collapses to "no payload" rather than a distinguishable
//! error, since the caller only ever needs to know auth succeeded or not.

use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Claims carried by a bearer token.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Claims {
    /// Subject: the user id this token authenticates as.
    pub sub: String,

    /// Expiry, as Unix seconds (the `jsonwebtoken` crate's expected shape).
    pub exp: i64,

    /// Optional email, carried through unchanged from the Python payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Claims {
    /// The subject claim as a typed [`UserId`].
    #[must_use]
    pub fn user_id(&self) -> UserId {
        UserId(self.sub.clone())
    }
}

/// Mints a signed bearer token for `user_id`, expiring `expire_minutes`
/// from now.
///
/// # Panics
///
/// If the system clock is before the Unix epoch.
#[must_use]
pub fn create_token(
    user_id: &UserId,
    email: Option<&str>,
    secret: &str,
    expire_minutes: i64,
) -> String {
    let exp = chrono::Utc::now() + chrono::Duration::minutes(expire_minutes);
    let claims = Claims {
        sub: user_id.as_str().to_owned(),
        exp: exp.timestamp(),
        email: email.map(ToOwned::to_owned),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("encoding with an HS256 key never fails")
}

/// Decodes and validates `token`. Returns `None` on any failure: expired,
/// malformed, or a bad signature all collapse to the same outcome
/// (spec.md §4.5).
#[must_use]
pub fn decode_token(token: &str, secret: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .ok()
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn round_trips_a_valid_token() {
        let user = UserId("user_000001".to_owned());
        let token = create_token(&user, Some("a@b.com"), SECRET, 60);
        let claims = decode_token(&token, SECRET).expect("should decode");
        assert_eq!(claims.user_id(), user);
        assert_eq!(claims.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn rejects_expired_token() {
        let user = UserId("user_000001".to_owned());
        let token = create_token(&user, None, SECRET, -1);
        assert!(decode_token(&token, SECRET).is_none());
    }

    #[test]
    fn rejects_bad_signature() {
        let user = UserId("user_000001".to_owned());
        let token = create_token(&user, None, SECRET, 60);
        assert!(decode_token(&token, "wrong-secret").is_none());
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(decode_token("not-a-jwt", SECRET).is_none());
    }
}
