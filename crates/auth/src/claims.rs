use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use genforge_core::UserId;
use genforge_generation::PlanTier;

/// JWT claims model (transport-agnostic).
///
/// This is the minimal set of claims GenForge expects once a token has been
/// decoded/verified by whatever transport/security layer is in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject: the user the request acts for.
    pub sub: UserId,

    /// Subscription tier; drives the concurrency limit.
    #[serde(default)]
    pub plan: PlanTier,

    /// Issued-at timestamp.
    pub issued_at: DateTime<Utc>,

    /// Expiration timestamp.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Deterministically validate JWT claims.
///
/// Note: this validates the *claims* only; signature verification happens in
/// [`crate::JwtValidator`] implementations.
pub fn validate_claims(claims: &JwtClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.expires_at <= claims.issued_at {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn claims(issued_at: DateTime<Utc>, ttl: Duration) -> JwtClaims {
        JwtClaims {
            sub: UserId::new(),
            plan: PlanTier::Free,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    #[test]
    fn accepts_claims_inside_window() {
        let now = Utc::now();
        assert_eq!(validate_claims(&claims(now, Duration::minutes(5)), now), Ok(()));
    }

    #[test]
    fn rejects_expired_and_future_tokens() {
        let now = Utc::now();
        let expired = claims(now - Duration::minutes(10), Duration::minutes(5));
        assert_eq!(validate_claims(&expired, now), Err(TokenValidationError::Expired));

        let future = claims(now + Duration::minutes(1), Duration::minutes(5));
        assert_eq!(validate_claims(&future, now), Err(TokenValidationError::NotYetValid));

        let inverted = claims(now, Duration::minutes(-1));
        assert_eq!(
            validate_claims(&inverted, now),
            Err(TokenValidationError::InvalidTimeWindow)
        );
    }

    #[test]
    fn plan_defaults_to_free_when_absent() {
        let now = Utc::now();
        let value = serde_json::json!({
            "sub": UserId::new(),
            "issued_at": now,
            "expires_at": now + Duration::minutes(1),
        });
        let parsed: JwtClaims = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.plan, PlanTier::Free);
    }
}
