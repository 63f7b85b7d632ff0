//! Auth verifier
//!
//! Two token flavors: short-lived signed access tokens and opaque
//! single-use refresh tokens stored only as digests. Refreshing consumes
//! the presented token and issues a fresh pair (rotation). The verify
//! path used by the terminal gateway is project-bound: a valid token for
//! one user never opens a session on another user's project.

use std::sync::Arc;

use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::db::Store;
use crate::error::{ApiError, ApiResult};

pub const ACCESS_TOKEN_EXPIRY_MINUTES: i64 = 15;
pub const REFRESH_TOKEN_BYTES: usize = 32;
pub const REFRESH_TOKEN_EXPIRY_DAYS: i64 = 30;

/// Access token claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signing and verification keys, derived once from the configured secret.
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Issue a signed access token for a user.
pub fn create_access_token(keys: &AuthKeys, user_id: Uuid) -> ApiResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + ChronoDuration::minutes(ACCESS_TOKEN_EXPIRY_MINUTES)).timestamp(),
    };

    jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &keys.encoding)
        .map_err(|e| ApiError::External(format!("token signing failed: {}", e)))
}

/// Decode and validate an access token. `None` on any signature or
/// expiry failure.
pub fn decode_access_token(keys: &AuthKeys, token: &str) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    jsonwebtoken::decode::<Claims>(token, &keys.decoding, &validation)
        .map(|data| data.claims)
        .ok()
}

/// Generate an opaque refresh token: random bytes, URL-safe encoded.
pub fn create_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest of a refresh token. Only this is stored.
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A freshly issued token pair.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Auth verifier
pub struct AuthVerifier {
    keys: AuthKeys,
    store: Arc<dyn Store>,
}

impl AuthVerifier {
    pub fn new(secret: &str, store: Arc<dyn Store>) -> Self {
        Self {
            keys: AuthKeys::new(secret),
            store,
        }
    }

    /// Register a new user. Conflict when the email is taken.
    pub async fn register(&self, email: &str, password: &str) -> ApiResult<Uuid> {
        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || {
            bcrypt::hash(password, bcrypt::DEFAULT_COST)
        })
        .await
        .map_err(|e| ApiError::External(e.to_string()))?
        .map_err(|e| ApiError::External(format!("password hashing failed: {}", e)))?;

        let user = self.store.create_user(email, &password_hash).await?;
        Ok(user.id)
    }

    /// Verify credentials and issue a token pair.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<TokenPair> {
        let user = self
            .store
            .user_by_email(email)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".into()))?;

        let password = password.to_string();
        let password_hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || {
            bcrypt::verify(password, &password_hash).unwrap_or(false)
        })
        .await
        .map_err(|e| ApiError::External(e.to_string()))?;

        if !valid {
            return Err(ApiError::Unauthorized("Invalid credentials".into()));
        }

        self.issue_pair(user.id).await
    }

    /// Exchange a refresh token for a fresh pair. The presented token is
    /// consumed: reusing it afterwards fails.
    pub async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        let token_hash = hash_refresh_token(refresh_token);
        let record = self
            .store
            .refresh_token_by_hash(&token_hash)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".into()))?;

        if record.expires_at < Utc::now() {
            self.store.delete_refresh_token(record.id).await?;
            return Err(ApiError::Unauthorized("Refresh token expired".into()));
        }

        // Rotation: the consumed row goes away before the new pair exists
        self.store.delete_refresh_token(record.id).await?;
        self.issue_pair(record.user_id).await
    }

    async fn issue_pair(&self, user_id: Uuid) -> ApiResult<TokenPair> {
        let access_token = create_access_token(&self.keys, user_id)?;
        let refresh_token = create_refresh_token();

        self.store
            .insert_refresh_token(
                user_id,
                &hash_refresh_token(&refresh_token),
                Utc::now() + ChronoDuration::days(REFRESH_TOKEN_EXPIRY_DAYS),
            )
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Decode a bearer token into its subject. Used by the HTTP surface.
    pub fn authenticate(&self, token: &str) -> ApiResult<Uuid> {
        let claims = decode_access_token(&self.keys, token)
            .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".into()))?;
        Uuid::parse_str(&claims.sub)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))
    }

    /// Project-bound verification for the terminal gateway: the token's
    /// subject must own the project. A successful check records the
    /// terminal connection instant.
    pub async fn verify(&self, token: &str, project_id: Uuid) -> ApiResult<Uuid> {
        let user_id = self.authenticate(token)?;

        let project = self
            .store
            .project_owned(project_id, user_id)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Unauthorized".into()))?;

        self.store.touch_connection(project.id, Utc::now()).await?;
        debug!("Validated terminal access: user={} project={}", user_id, project_id);
        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, NewProject};

    fn verifier() -> (Arc<MemoryStore>, AuthVerifier) {
        let store = Arc::new(MemoryStore::new());
        let verifier = AuthVerifier::new("test-secret", store.clone() as Arc<dyn Store>);
        (store, verifier)
    }

    #[test]
    fn access_token_round_trips() {
        let keys = AuthKeys::new("s3cret");
        let user_id = Uuid::new_v4();

        let token = create_access_token(&keys, user_id).unwrap();
        // Compact JWS: three dot-separated segments
        assert_eq!(token.matches('.').count(), 2);

        let claims = decode_access_token(&keys, &token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.exp - claims.iat, ACCESS_TOKEN_EXPIRY_MINUTES * 60);
    }

    #[test]
    fn expired_access_token_is_rejected() {
        let keys = AuthKeys::new("s3cret");
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            iat: (now - ChronoDuration::minutes(16)).timestamp(),
            exp: (now - ChronoDuration::minutes(1)).timestamp(),
        };
        let token =
            jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &keys.encoding)
                .unwrap();

        assert!(decode_access_token(&keys, &token).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let keys = AuthKeys::new("s3cret");
        let token = create_access_token(&keys, Uuid::new_v4()).unwrap();
        let other = AuthKeys::new("different");
        assert!(decode_access_token(&other, &token).is_none());
    }

    #[test]
    fn refresh_tokens_are_opaque_and_url_safe() {
        let token = create_refresh_token();
        assert!(token.len() >= 32);
        assert_eq!(token.matches('.').count(), 0);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, create_refresh_token());
    }

    #[tokio::test]
    async fn refresh_rotation_is_single_use() {
        let (_store, verifier) = verifier();
        verifier.register("a@ex.com", "P@ss1234!").await.unwrap();
        let pair = verifier.login("a@ex.com", "P@ss1234!").await.unwrap();

        let rotated = verifier.refresh(&pair.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);

        // The consumed token is gone
        let err = verifier.refresh(&pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        // The rotated one still works
        verifier.refresh(&rotated.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn expired_refresh_token_is_deleted_on_use() {
        let (store, verifier) = verifier();
        let user = store.create_user("a@ex.com", "digest").await.unwrap();

        let token = create_refresh_token();
        store
            .insert_refresh_token(
                user.id,
                &hash_refresh_token(&token),
                Utc::now() - ChronoDuration::days(1),
            )
            .await
            .unwrap();

        let err = verifier.refresh(&token).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert!(store
            .refresh_token_by_hash(&hash_refresh_token(&token))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn verify_is_project_bound() {
        let (store, verifier) = verifier();
        let owner_id = verifier.register("a@ex.com", "P@ss1234!").await.unwrap();
        let other_id = verifier.register("b@ex.com", "P@ss1234!").await.unwrap();

        let project = NewProject {
            id: Uuid::new_v4(),
            user_id: owner_id,
            name: "x".into(),
            ssh_public_key: "pub".into(),
            ssh_private_key: "priv".into(),
            storage_prefix: "p/workspace".into(),
        };
        store.insert_project(&project).await.unwrap();

        let keys = AuthKeys::new("test-secret");
        let owner_token = create_access_token(&keys, owner_id).unwrap();
        let other_token = create_access_token(&keys, other_id).unwrap();

        let verified = verifier.verify(&owner_token, project.id).await.unwrap();
        assert_eq!(verified, owner_id);
        assert!(store
            .get_project(project.id)
            .unwrap()
            .last_connection_at
            .is_some());

        let err = verifier.verify(&other_token, project.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}
