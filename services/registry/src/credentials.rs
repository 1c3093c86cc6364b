//! Stateless bearer credentials.
//!
//! Tokens are compact JWS strings signed with HS256 over a shared secret.
//! Nothing is stored server side, so a token stays valid until it expires.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use jaws::algorithms::hmac::{Hmac, HmacKey};
use jaws::crypto::sha2::Sha256;
use jaws::token::{Token, Unverified};
use jaws::{Compact, SignatureBytes};
use metadata::{MetadataError, MetadataStore};
use secret::Secret;
use serde::{Deserialize, Serialize};

/// Default token lifetime in hours.
pub const TOKEN_LIFETIME_HOURS: u32 = 24;

/// Longest lifetime a configuration may ask for, one year.
pub const MAX_TOKEN_LIFETIME_HOURS: u32 = 24 * 365;

type Algorithm = Hmac<Sha256>;
type Presented = Token<Claims, Unverified<()>, Compact>;

/// The identity a token asserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject of the token.
    pub username: String,
    /// Role at the time the token was issued.
    pub role: String,
    /// Expiry as Unix seconds.
    pub exp: i64,
}

impl Claims {
    /// When the token stops being accepted.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Credential failures.
///
/// Every way a presented token can be wrong collapses into
/// [CredentialError::InvalidToken].
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Malformed, forged or expired token.
    #[error("invalid token")]
    InvalidToken,

    /// The token was valid but its subject no longer exists or is inactive.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Claims could not be signed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The user lookup during refresh failed.
    #[error(transparent)]
    Store(#[from] MetadataError),
}

/// Issues, verifies and refreshes bearer tokens.
///
/// Holds only the signing key and lifetime, so one instance is shared by
/// every request.
#[derive(Clone)]
pub struct CredentialManager {
    algorithm: Algorithm,
    lifetime: TimeDelta,
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("algorithm", &"HS256")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl CredentialManager {
    /// A manager issuing tokens that live for [TOKEN_LIFETIME_HOURS].
    pub fn new(secret: Secret) -> Self {
        Self {
            algorithm: Hmac::new(HmacKey::from(secret.as_bytes())),
            lifetime: TimeDelta::hours(i64::from(TOKEN_LIFETIME_HOURS)),
        }
    }

    /// Override the token lifetime.
    pub fn with_lifetime(mut self, lifetime: TimeDelta) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// How long issued tokens stay valid.
    pub fn lifetime(&self) -> TimeDelta {
        self.lifetime
    }

    /// Issue a token for `username` with `role`, expiring one lifetime from now.
    pub fn issue(&self, username: &str, role: &str) -> Result<String, CredentialError> {
        self.issue_at(username, role, Utc::now())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(
        &self,
        username: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<String, CredentialError> {
        if self.lifetime <= TimeDelta::zero() {
            return Err(CredentialError::Signing(format!(
                "token lifetime must be positive, got {}",
                self.lifetime
            )));
        }
        let expires = now.checked_add_signed(self.lifetime).ok_or_else(|| {
            CredentialError::Signing(format!("token lifetime {} is out of range", self.lifetime))
        })?;

        let claims = Claims {
            username: username.to_string(),
            role: role.to_string(),
            exp: expires.timestamp(),
        };
        let exp = claims.exp;

        let mut token = Token::compact((), claims);
        *token.header_mut().r#type() = Some("JWT".to_string());
        let token = token
            .sign::<Algorithm, SignatureBytes>(&self.algorithm)
            .map_err(|err| CredentialError::Signing(err.to_string()))?;

        tracing::debug!(%username, %role, exp, "issued token");
        token
            .rendered()
            .map_err(|err| CredentialError::Signing(err.to_string()))
    }

    /// Check a token's signature and expiry, returning its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, CredentialError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify as if the current time were `now`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, CredentialError> {
        let presented: Presented = token.parse().map_err(|_| CredentialError::InvalidToken)?;
        let verified = presented
            .verify::<Algorithm, SignatureBytes>(&self.algorithm)
            .map_err(|err| {
                tracing::trace!(error = %err, "token rejected");
                CredentialError::InvalidToken
            })?;
        let claims = verified
            .payload()
            .cloned()
            .ok_or(CredentialError::InvalidToken)?;

        if claims.username.is_empty() || claims.role.is_empty() {
            return Err(CredentialError::InvalidToken);
        }
        match claims.expires_at() {
            Some(expires) if expires > now => Ok(claims),
            _ => {
                tracing::trace!(username = %claims.username, "token expired");
                Err(CredentialError::InvalidToken)
            }
        }
    }

    /// Exchange a valid token for a fresh one carrying the user's current role.
    ///
    /// Expired tokens are never extended: verification fails first.
    pub async fn refresh(
        &self,
        token: &str,
        store: &dyn MetadataStore,
    ) -> Result<String, CredentialError> {
        let claims = self.verify(token)?;
        let user = match store.find_user(&claims.username).await {
            Ok(user) => user,
            Err(err) if err.is_not_found() => {
                return Err(CredentialError::UnknownUser(claims.username));
            }
            Err(err) => return Err(err.into()),
        };
        if !user.active {
            return Err(CredentialError::UnknownUser(claims.username));
        }

        if user.role != claims.role {
            tracing::debug!(
                username = %user.username,
                from = %claims.role,
                to = %user.role,
                "role changed since issue"
            );
        }
        self.issue(&user.username, &user.role)
    }
}

#[cfg(test)]
mod tests {
    use jaws::algorithms::AlgorithmIdentifier;
    use metadata::{MemoryMetadataStore, NewUser, UserUpdate};
    use secret::PasswordHash;

    use super::*;

    fn manager() -> CredentialManager {
        CredentialManager::new(Secret::from("test-signing-key"))
    }

    #[test]
    fn issue_then_verify_round_trips_identity() {
        let credentials = manager();
        let token = credentials.issue("alice", "admin").unwrap();
        let claims = credentials.verify(&token).unwrap();
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn token_is_a_standard_hs256_jws() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let token = manager().issue_at("alice", "admin", now).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let presented: Presented = token.parse().unwrap();
        assert_eq!(*presented.header().algorithm(), AlgorithmIdentifier::HS256);
        assert_eq!(presented.header().r#type(), Some("JWT"));
        assert!(presented.header().key().is_none());

        let claims = manager().verify_at(&token, now).unwrap();
        assert_eq!(claims.exp, 1_700_000_000 + 24 * 60 * 60);
        assert_eq!(claims.expires_at(), Some(now + TimeDelta::hours(24)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let credentials = manager();
        let issued = Utc::now() - TimeDelta::hours(25);
        let token = credentials.issue_at("alice", "admin", issued).unwrap();
        assert!(matches!(
            credentials.verify(&token),
            Err(CredentialError::InvalidToken)
        ));

        let at_expiry = issued + credentials.lifetime();
        assert!(credentials.verify_at(&token, at_expiry).is_err());
        assert!(credentials
            .verify_at(&token, at_expiry - TimeDelta::seconds(1))
            .is_ok());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let token = manager().issue("alice", "admin").unwrap();
        let other = CredentialManager::new(Secret::from("another-key"));
        assert!(matches!(
            other.verify(&token),
            Err(CredentialError::InvalidToken)
        ));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let credentials = manager();
        let token = credentials.issue("alice", "user").unwrap();
        let elevated = CredentialManager::new(Secret::from("attacker-key"))
            .issue("alice", "admin")
            .unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = elevated.split('.').nth(1).unwrap();
        assert!(matches!(
            credentials.verify(&parts.join(".")),
            Err(CredentialError::InvalidToken)
        ));
    }

    #[test]
    fn lifetime_must_be_positive() {
        for hours in [0, -1] {
            let credentials = manager().with_lifetime(TimeDelta::hours(hours));
            assert!(
                matches!(
                    credentials.issue("alice", "admin"),
                    Err(CredentialError::Signing(_))
                ),
                "{hours}"
            );
        }
    }

    #[test]
    fn lifetime_past_the_calendar_is_an_error() {
        let credentials = manager().with_lifetime(TimeDelta::hours(1_000_000_000_000));
        assert!(matches!(
            credentials.issue("alice", "admin"),
            Err(CredentialError::Signing(_))
        ));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let credentials = manager();
        assert!(!format!("{credentials:?}").contains("test-signing-key"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let credentials = manager();
        for token in ["", "abc", "a.b", "a.b.c.d", "!!.??.##"] {
            assert!(
                matches!(credentials.verify(token), Err(CredentialError::InvalidToken)),
                "{token:?}"
            );
        }
    }

    async fn store_with(username: &str, role: &str) -> MemoryMetadataStore {
        let store = MemoryMetadataStore::new();
        let hash = PasswordHash::new(&Secret::from("s3cr3t")).unwrap();
        store
            .create_user(NewUser::new(username, hash, "alice@example.com", role).unwrap())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn refresh_picks_up_role_change() {
        let credentials = manager();
        let store = store_with("alice", "user").await;
        let token = credentials.issue("alice", "user").unwrap();

        store
            .update_user(
                "alice",
                UserUpdate::new("alice@example.com", "admin", None).unwrap(),
            )
            .await
            .unwrap();

        let refreshed = credentials.refresh(&token, &store).await.unwrap();
        let claims = credentials.verify(&refreshed).unwrap();
        assert_eq!(claims.role, "admin");
    }

    #[tokio::test]
    async fn refresh_never_extends_expired_tokens() {
        let credentials = manager();
        let store = store_with("alice", "admin").await;
        let token = credentials
            .issue_at("alice", "admin", Utc::now() - TimeDelta::days(2))
            .unwrap();
        assert!(matches!(
            credentials.refresh(&token, &store).await,
            Err(CredentialError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn refresh_for_deleted_user_fails() {
        let credentials = manager();
        let store = store_with("alice", "admin").await;
        let token = credentials.issue("alice", "admin").unwrap();
        store.delete_user("alice").await.unwrap();
        assert!(matches!(
            credentials.refresh(&token, &store).await,
            Err(CredentialError::UnknownUser(_))
        ));
    }
}
