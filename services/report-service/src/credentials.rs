use crate::error::{AuthError, ServiceError, ServiceResult};
use crate::record_store::{RecordStore, StoreError};
use crate::token::{TokenClaims, TokenSigner};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Authenticated staff member behind a valid token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffIdentity {
    pub id: i64,
    pub username: String,
}

/// Staff login, token issuance and token authentication
pub struct CredentialService {
    store: Arc<dyn RecordStore>,
    signer: TokenSigner,
    token_ttl: Duration,
    /// Verified against when the username is unknown so both failure paths cost the same
    dummy_hash: String,
}

impl CredentialService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        token_secret: &str,
        token_ttl: Duration,
    ) -> ServiceResult<Self> {
        Ok(Self {
            store,
            signer: TokenSigner::new(token_secret),
            token_ttl,
            dummy_hash: hash_password("not-a-real-password")?,
        })
    }

    /// Check a username/password pair and issue a session token
    #[instrument(skip(self, password))]
    pub async fn verify_login(&self, username: &str, password: &str) -> ServiceResult<String> {
        if username.is_empty() || password.is_empty() {
            return Err(ServiceError::Validation("missing credentials".to_string()));
        }

        let staff = self.store.find_staff_by_username(username).await?;
        let hash = staff
            .as_ref()
            .map_or(&self.dummy_hash, |s| &s.password_hash)
            .clone();
        let password_ok = verify_password_blocking(hash, password.to_string()).await?;

        let staff = match staff {
            Some(staff) if password_ok => staff,
            _ => {
                metrics::counter!("auth.login.failed").increment(1);
                warn!("Staff login rejected");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        let issued_at = Utc::now().timestamp();
        let ttl_secs = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            sub: staff.id,
            username: staff.username,
            iat: issued_at,
            exp: issued_at.saturating_add(ttl_secs),
        };

        metrics::counter!("auth.login.succeeded").increment(1);
        info!(staff_id = claims.sub, "Staff login succeeded");

        Ok(self.signer.sign(&claims))
    }

    /// Resolve a bearer token to the staff member it was issued for
    pub async fn authenticate(&self, token: &str) -> ServiceResult<StaffIdentity> {
        let claims = self
            .signer
            .verify(token, Utc::now().timestamp())
            .map_err(|e| {
                debug!(reason = %e, "Token rejected");
                AuthError::InvalidOrExpiredToken
            })?;

        let staff = self
            .store
            .find_staff_by_id(claims.sub)
            .await?
            .ok_or(AuthError::StaffNotFound)?;

        Ok(StaffIdentity {
            id: staff.id,
            username: staff.username,
        })
    }

    /// Create the bootstrap credential if no staff credential exists yet.
    ///
    /// Returns whether a credential was created.
    pub async fn ensure_seed_credential(
        &self,
        username: &str,
        password: &str,
    ) -> ServiceResult<bool> {
        if self.store.has_staff().await? {
            debug!("Staff credentials present, skipping seed");
            return Ok(false);
        }

        let password_hash = hash_password_blocking(password.to_string()).await?;
        match self.store.insert_staff(username, &password_hash).await {
            Ok(staff) => {
                info!(staff_id = staff.id, username = %staff.username, "Default staff credential created");
                Ok(true)
            }
            // Another instance seeded between the check and the insert
            Err(StoreError::Duplicate(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Salted argon2 hash in PHC string format
pub fn hash_password(password: &str) -> ServiceResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing failed: {}", e)))
}

/// Argon2 is CPU-bound, keep it off the async workers
async fn hash_password_blocking(password: String) -> ServiceResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing task failed: {}", e)))?
}

async fn verify_password_blocking(hash: String, password: String) -> ServiceResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&hash, &password))
        .await
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password check task failed: {}", e)))
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Stored password hash is unreadable");
            false
        }
    }
}
