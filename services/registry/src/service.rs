//! The access service: authentication, authorization and resource operations
//! over the metadata store and counter cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use counters::{ArcCounters, IMAGE_COUNT, TAG_COUNT};
use metadata::{
    ArcStore, Image, MetadataError, NewImage, NewUser, Published, Tag, TagReport, User,
    UserUpdate,
};
use secret::{PasswordHash, Secret};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::credentials::{Claims, CredentialManager};
use crate::error::{RegistryError, RegistryResult};
use crate::policy::{AccessPolicy, AllowAuthenticated, Operation};

/// Version reported by [AccessService::info].
pub const API_VERSION: &str = "2.0";

/// Login credentials.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Account name.
    pub username: String,
    /// Plain password, compared against the stored hash.
    pub password: Secret,
}

/// A fresh token and the user it was issued to.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// Signed bearer token.
    pub token: String,
    /// The authenticated user, without the password hash.
    pub user: User,
}

/// A token on its own.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// Signed bearer token.
    pub token: String,
}

/// Result of inspecting a token.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    /// Always true; invalid tokens are reported as errors.
    pub valid: bool,
    /// Decoded claims of the token.
    pub claims: Claims,
}

/// Fields of a new user.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    /// Login name.
    pub username: String,
    /// Plain password, hashed before storage.
    pub password: Secret,
    /// Contact address, `local@domain`.
    pub email: String,
    /// Role name.
    pub role: String,
}

/// Replacement email and role, with an optional new password.
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    /// Replacement contact address.
    pub email: String,
    /// Replacement role name.
    pub role: String,
    /// New plain password; the stored hash is kept when absent.
    #[serde(default)]
    pub password: Option<Secret>,
}

/// Fields of a new image. The owner is the caller.
#[derive(Debug, Deserialize)]
pub struct CreateImageRequest {
    /// Repository name.
    pub name: String,
    /// Free text, empty by default.
    #[serde(default)]
    pub description: String,
    /// Private by default.
    #[serde(default)]
    pub public: bool,
}

/// What the blob-transfer endpoint reports after a push.
#[derive(Debug, Deserialize)]
pub struct PublishTagRequest {
    /// Manifest digest.
    pub digest: String,
    /// Manifest size in bytes.
    pub size: i64,
}

/// Approximate registry usage.
#[derive(Debug, Serialize)]
pub struct Metrics {
    /// Live image count.
    pub images: i64,
    /// Live tag count.
    pub tags: i64,
    /// When the counters were read.
    pub timestamp: DateTime<Utc>,
}

/// Liveness report.
#[derive(Debug, Serialize)]
pub struct Health {
    /// Always `UP` when the store answers.
    pub status: &'static str,
    /// Time of the check.
    pub timestamp: DateTime<Utc>,
}

/// Where the blob-transfer endpoint lives.
#[derive(Debug, Serialize)]
pub struct Info {
    /// API version.
    pub version: &'static str,
    /// `host:port` of the blob-transfer endpoint.
    pub url: String,
    /// Reported endpoint status.
    pub status: &'static str,
}

/// A human-readable acknowledgement.
#[derive(Debug, Serialize)]
pub struct Message {
    /// Text of the acknowledgement.
    pub message: String,
}

impl Message {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    store: ArcStore,
    counters: ArcCounters,
    credentials: CredentialManager,
    policy: Arc<dyn AccessPolicy>,
    registry_url: String,
    unknown_user_hash: OnceCell<PasswordHash>,
}

/// Entry point for every registry operation.
///
/// Cheap to clone; all clones share the same store, cache and credentials.
#[derive(Debug, Clone)]
pub struct AccessService {
    inner: Arc<Inner>,
}

/// Builder for [AccessService].
#[derive(Debug)]
pub struct AccessServiceBuilder {
    store: ArcStore,
    counters: ArcCounters,
    credentials: CredentialManager,
    policy: Arc<dyn AccessPolicy>,
    registry_url: String,
}

impl AccessServiceBuilder {
    /// Set the authorization policy. Defaults to [AllowAuthenticated].
    pub fn policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Set the `host:port` of the blob-transfer endpoint reported by `info`.
    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    /// Build the service
    pub fn build(self) -> AccessService {
        AccessService {
            inner: Arc::new(Inner {
                store: self.store,
                counters: self.counters,
                credentials: self.credentials,
                policy: self.policy,
                registry_url: self.registry_url,
                unknown_user_hash: OnceCell::new(),
            }),
        }
    }
}

impl AccessService {
    /// Start building a service from its three collaborators.
    pub fn builder(
        store: ArcStore,
        counters: ArcCounters,
        credentials: CredentialManager,
    ) -> AccessServiceBuilder {
        AccessServiceBuilder {
            store,
            counters,
            credentials,
            policy: Arc::new(AllowAuthenticated),
            registry_url: "localhost:5000".to_string(),
        }
    }

    /// The metadata store.
    pub fn store(&self) -> &ArcStore {
        &self.inner.store
    }

    /// The credential manager.
    pub fn credentials(&self) -> &CredentialManager {
        &self.inner.credentials
    }

    /// Verify a bearer token and check that its holder may perform `operation`.
    pub fn authorize(&self, token: &str, operation: Operation) -> RegistryResult<Claims> {
        let claims = self.inner.credentials.verify(token)?;
        self.inner.policy.authorize(&claims, operation)?;
        Ok(claims)
    }

    /// Apply a counter change without failing the surrounding operation.
    async fn bump(&self, key: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Err(error) = self.inner.counters.increment(key, delta).await {
            tracing::warn!(%key, delta, %error, "counter update failed");
        }
    }

    // Identity

    /// Exchange a username and password for a token.
    ///
    /// Unknown users, inactive users and wrong passwords are indistinguishable.
    #[tracing::instrument(skip(self, request), fields(username = %request.username))]
    pub async fn login(&self, request: LoginRequest) -> RegistryResult<LoginResponse> {
        let user = match self.inner.store.find_user(&request.username).await {
            Ok(user) => Some(user),
            Err(err) if err.is_not_found() => {
                tracing::debug!("login for unknown user");
                None
            }
            Err(err) => return Err(err.into()),
        };

        // Unknown users still pay for one argon2 verification.
        let hash = match &user {
            Some(user) => user.password.clone(),
            None => self.unknown_user_hash().await?.clone(),
        };
        let password = request.password;
        let matches = tokio::task::spawn_blocking(move || hash.verify(&password))
            .await
            .map_err(|err| RegistryError::Internal(err.to_string()))?;
        let user = match user {
            Some(user) if matches && user.active => user,
            _ => {
                tracing::debug!("login refused");
                return Err(RegistryError::Unauthorized);
            }
        };

        let token = self.inner.credentials.issue(&user.username, &user.role)?;
        tracing::info!(role = %user.role, "user logged in");
        Ok(LoginResponse { token, user })
    }

    /// A hash no password is expected to match, computed on first use.
    async fn unknown_user_hash(&self) -> RegistryResult<&PasswordHash> {
        self.inner
            .unknown_user_hash
            .get_or_try_init(|| hash_password(Secret::from("unknown-user-placeholder")))
            .await
    }

    /// Report the claims of a valid token.
    pub fn verify(&self, token: &str) -> RegistryResult<VerifyResponse> {
        let claims = self.authorize(token, Operation::VerifyToken)?;
        Ok(VerifyResponse {
            valid: true,
            claims,
        })
    }

    /// Issue a new token with the user's current role.
    pub async fn refresh(&self, token: &str) -> RegistryResult<TokenResponse> {
        self.authorize(token, Operation::RefreshToken)?;
        let token = self
            .inner
            .credentials
            .refresh(token, self.inner.store.as_ref())
            .await?;
        Ok(TokenResponse { token })
    }

    // Users

    /// All live users.
    pub async fn list_users(&self, claims: &Claims) -> RegistryResult<Vec<User>> {
        self.inner.policy.authorize(claims, Operation::ListUsers)?;
        Ok(self.inner.store.list_users().await?)
    }

    /// Create a user, storing only a salted hash of the password.
    #[tracing::instrument(skip(self, claims, request), fields(username = %request.username))]
    pub async fn create_user(
        &self,
        claims: &Claims,
        request: CreateUserRequest,
    ) -> RegistryResult<User> {
        self.inner.policy.authorize(claims, Operation::CreateUser)?;
        NewUser::validate(&request.username, &request.email, &request.role)?;
        let password = hash_password(request.password).await?;
        let user = NewUser::new(request.username, password, request.email, request.role)?;
        let user = self.inner.store.create_user(user).await?;
        tracing::info!(role = %user.role, by = %claims.username, "created user");
        Ok(user)
    }

    /// Replace a user's email and role, and their password when one is given.
    #[tracing::instrument(skip(self, claims, request))]
    pub async fn update_user(
        &self,
        claims: &Claims,
        username: &str,
        request: UpdateUserRequest,
    ) -> RegistryResult<User> {
        self.inner.policy.authorize(claims, Operation::UpdateUser)?;
        UserUpdate::validate(&request.email, &request.role)?;
        let password = match request.password {
            Some(password) => Some(hash_password(password).await?),
            None => None,
        };
        let update = UserUpdate::new(request.email, request.role, password)?;
        Ok(self.inner.store.update_user(username, update).await?)
    }

    /// Soft-delete a user. Their images stay.
    #[tracing::instrument(skip(self, claims))]
    pub async fn delete_user(&self, claims: &Claims, username: &str) -> RegistryResult<Message> {
        self.inner.policy.authorize(claims, Operation::DeleteUser)?;
        self.inner.store.delete_user(username).await?;
        tracing::info!(by = %claims.username, "deleted user");
        Ok(Message::new("User deleted successfully"))
    }

    // Images and tags

    /// All live images with their tags.
    pub async fn list_images(&self, claims: &Claims) -> RegistryResult<Vec<Image>> {
        self.inner.policy.authorize(claims, Operation::ListImages)?;
        Ok(self.inner.store.list_images().await?)
    }

    /// One image with its tags.
    pub async fn get_image(&self, claims: &Claims, name: &str) -> RegistryResult<Image> {
        self.inner.policy.authorize(claims, Operation::GetImage)?;
        Ok(self.inner.store.get_image(name).await?)
    }

    /// Create an image owned by the caller.
    #[tracing::instrument(skip(self, claims, request), fields(image = %request.name))]
    pub async fn create_image(
        &self,
        claims: &Claims,
        request: CreateImageRequest,
    ) -> RegistryResult<Image> {
        self.inner.policy.authorize(claims, Operation::CreateImage)?;
        let image = NewImage::new(
            request.name,
            request.description,
            claims.username.as_str(),
            request.public,
        )?;
        let image = self.inner.store.create_image(image).await?;
        self.bump(IMAGE_COUNT, 1).await;
        Ok(image)
    }

    /// Delete an image and all of its tags.
    #[tracing::instrument(skip(self, claims))]
    pub async fn delete_image(&self, claims: &Claims, name: &str) -> RegistryResult<Message> {
        self.inner.policy.authorize(claims, Operation::DeleteImage)?;
        let removed = self.inner.store.delete_image(name).await?;
        let removed = i64::try_from(removed).unwrap_or(i64::MAX);
        self.bump(IMAGE_COUNT, -1).await;
        self.bump(TAG_COUNT, -removed).await;
        tracing::info!(tags = removed, by = %claims.username, "deleted image");
        Ok(Message::new("Image deleted successfully"))
    }

    /// Live tags of an image.
    pub async fn list_tags(&self, claims: &Claims, image: &str) -> RegistryResult<Vec<Tag>> {
        self.inner.policy.authorize(claims, Operation::ListTags)?;
        Ok(self.inner.store.list_tags(image).await?)
    }

    /// Record a pushed tag reported by the blob-transfer endpoint.
    #[tracing::instrument(skip(self, claims, request))]
    pub async fn publish_tag(
        &self,
        claims: &Claims,
        image: &str,
        tag: &str,
        request: PublishTagRequest,
    ) -> RegistryResult<Published> {
        self.inner.policy.authorize(claims, Operation::PublishTag)?;
        let report = TagReport::new(tag, request.digest, request.size)?;
        let published = self.inner.store.put_tag(image, report).await?;
        if published.created {
            self.bump(TAG_COUNT, 1).await;
        }
        Ok(published)
    }

    /// Count a pull of a tag.
    pub async fn record_pull(&self, claims: &Claims, image: &str, tag: &str) -> RegistryResult<Tag> {
        self.inner.policy.authorize(claims, Operation::RecordPull)?;
        Ok(self.inner.store.record_pull(image, tag).await?)
    }

    /// Delete one tag, leaving the image.
    #[tracing::instrument(skip(self, claims))]
    pub async fn delete_tag(
        &self,
        claims: &Claims,
        image: &str,
        tag: &str,
    ) -> RegistryResult<Message> {
        self.inner.policy.authorize(claims, Operation::DeleteTag)?;
        self.inner.store.delete_tag(image, tag).await?;
        self.bump(TAG_COUNT, -1).await;
        Ok(Message::new("Tag deleted successfully"))
    }

    // Observability

    /// Image and tag counts from the counter cache. Unset counters read as 0.
    pub async fn metrics(&self, claims: &Claims) -> RegistryResult<Metrics> {
        self.inner.policy.authorize(claims, Operation::ReadMetrics)?;
        let (images, tags) = futures::try_join!(
            self.inner.counters.get(IMAGE_COUNT),
            self.inner.counters.get(TAG_COUNT)
        )?;
        Ok(Metrics {
            images,
            tags,
            timestamp: Utc::now(),
        })
    }

    /// Liveness, including a round trip to the metadata store.
    pub async fn health(&self) -> RegistryResult<Health> {
        self.inner.store.health_check().await?;
        Ok(Health {
            status: "UP",
            timestamp: Utc::now(),
        })
    }

    /// The configured blob-transfer endpoint.
    pub fn info(&self) -> Info {
        Info {
            version: API_VERSION,
            url: self.inner.registry_url.clone(),
            status: "running",
        }
    }

    /// Create `username` as an administrator unless a live user already
    /// holds the name.
    #[tracing::instrument(skip(self, password, email))]
    pub async fn ensure_admin(
        &self,
        username: &str,
        password: Secret,
        email: &str,
    ) -> RegistryResult<()> {
        match self.inner.store.find_user(username).await {
            Ok(_) => {
                tracing::debug!("admin user already exists");
                return Ok(());
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        NewUser::validate(username, email, "admin")?;
        let password = hash_password(password).await?;
        let user = NewUser::new(username, password, email, "admin")?;
        match self.inner.store.create_user(user).await {
            Ok(_) => tracing::info!("created admin user"),
            // Another replica bootstrapped first.
            Err(MetadataError::Conflict(_)) => tracing::debug!("admin user already exists"),
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

async fn hash_password(password: Secret) -> RegistryResult<PasswordHash> {
    if password.is_empty() {
        return Err(RegistryError::Validation("password must not be empty".into()));
    }
    tokio::task::spawn_blocking(move || PasswordHash::new(&password))
        .await
        .map_err(|err| RegistryError::Internal(err.to_string()))?
        .map_err(|err| RegistryError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use counters::MemoryCounters;
    use metadata::MemoryMetadataStore;

    use super::*;
    use crate::policy::RolePolicy;

    fn service() -> AccessService {
        AccessService::builder(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryCounters::new(None)),
            CredentialManager::new(Secret::from("service-test-key")),
        )
        .registry_url("registry.internal:5000")
        .build()
    }

    fn admin() -> Claims {
        Claims {
            username: "root".into(),
            role: "admin".into(),
            exp: i64::MAX,
        }
    }

    async fn with_alice(service: &AccessService) {
        service
            .create_user(
                &admin(),
                CreateUserRequest {
                    username: "alice".into(),
                    password: Secret::from("s3cr3t"),
                    email: "alice@example.com".into(),
                    role: "admin".into(),
                },
            )
            .await
            .unwrap();
    }

    fn login(username: &str, password: &'static str) -> LoginRequest {
        LoginRequest {
            username: username.into(),
            password: Secret::from(password),
        }
    }

    #[tokio::test]
    async fn login_verify_scenario() {
        let service = service();
        with_alice(&service).await;

        let response = service.login(login("alice", "s3cr3t")).await.unwrap();
        assert_eq!(response.user.username, "alice");

        let verified = service.verify(&response.token).unwrap();
        assert!(verified.valid);
        assert_eq!(verified.claims.username, "alice");
        assert_eq!(verified.claims.role, "admin");

        let err = service.login(login("alice", "wrong")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized));
        let err = service.login(login("mallory", "s3cr3t")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized));
    }

    #[tokio::test]
    async fn unknown_user_login_verifies_a_hash() {
        let service = service();
        assert!(!service.inner.unknown_user_hash.initialized());

        let err = service.login(login("mallory", "s3cr3t")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized));
        assert!(service.inner.unknown_user_hash.initialized());

        let err = service
            .login(login("mallory", "unknown-user-placeholder"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized));
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected_before_hashing() {
        let service = service();
        // An empty password would fail hashing; field validation reports first.
        let err = service
            .create_user(
                &admin(),
                CreateUserRequest {
                    username: "bob".into(),
                    password: Secret::from(""),
                    email: "not-an-email".into(),
                    role: "user".into(),
                },
            )
            .await
            .unwrap_err();
        let RegistryError::Validation(message) = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert!(message.contains("email"), "{message}");

        let err = service
            .update_user(
                &admin(),
                "bob",
                UpdateUserRequest {
                    email: "bob@example.com".into(),
                    role: String::new(),
                    password: Some(Secret::from("")),
                },
            )
            .await
            .unwrap_err();
        let RegistryError::Validation(message) = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert!(message.contains("role"), "{message}");
    }

    #[tokio::test]
    async fn stored_password_is_hashed() {
        let service = service();
        with_alice(&service).await;
        let user = service.store().find_user("alice").await.unwrap();
        assert_ne!(user.password.as_str(), "s3cr3t");
        assert!(user.password.as_str().starts_with("$argon2id$"));
    }

    #[tokio::test]
    async fn update_without_password_keeps_login_working() {
        let service = service();
        with_alice(&service).await;
        let user = service
            .update_user(
                &admin(),
                "alice",
                UpdateUserRequest {
                    email: "alice@corp.example".into(),
                    role: "user".into(),
                    password: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(user.role, "user");

        let response = service.login(login("alice", "s3cr3t")).await.unwrap();
        assert_eq!(service.verify(&response.token).unwrap().claims.role, "user");
    }

    #[tokio::test]
    async fn refresh_carries_new_role() {
        let service = service();
        with_alice(&service).await;
        let token = service.login(login("alice", "s3cr3t")).await.unwrap().token;

        service
            .update_user(
                &admin(),
                "alice",
                UpdateUserRequest {
                    email: "alice@example.com".into(),
                    role: "auditor".into(),
                    password: None,
                },
            )
            .await
            .unwrap();

        let refreshed = service.refresh(&token).await.unwrap().token;
        assert_eq!(service.verify(&refreshed).unwrap().claims.role, "auditor");
    }

    #[tokio::test]
    async fn expired_token_is_unauthorized() {
        let service = service();
        let token = service
            .credentials()
            .issue_at("alice", "admin", Utc::now() - TimeDelta::days(2))
            .unwrap();
        assert!(matches!(
            service.verify(&token),
            Err(RegistryError::Unauthorized)
        ));
        assert!(matches!(
            service.refresh(&token).await,
            Err(RegistryError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn counters_follow_image_lifecycle() {
        let service = service();
        let claims = admin();
        service
            .create_image(
                &claims,
                CreateImageRequest {
                    name: "app/web".into(),
                    description: String::new(),
                    public: true,
                },
            )
            .await
            .unwrap();
        for tag in ["v1", "v2"] {
            let request = PublishTagRequest {
                digest: "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                    .into(),
                size: 512,
            };
            service
                .publish_tag(&claims, "app/web", tag, request)
                .await
                .unwrap();
        }

        let metrics = service.metrics(&claims).await.unwrap();
        assert_eq!((metrics.images, metrics.tags), (1, 2));

        service.delete_image(&claims, "app/web").await.unwrap();
        let metrics = service.metrics(&claims).await.unwrap();
        assert_eq!((metrics.images, metrics.tags), (0, 0));
        assert!(matches!(
            service.list_tags(&claims, "app/web").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn metrics_default_to_zero() {
        let metrics = service().metrics(&admin()).await.unwrap();
        assert_eq!(metrics.images, 0);
        assert_eq!(metrics.tags, 0);
    }

    #[tokio::test]
    async fn policy_is_consulted() {
        let service = AccessService::builder(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryCounters::new(None)),
            CredentialManager::new(Secret::from("service-test-key")),
        )
        .policy(RolePolicy::admin_only([Operation::ListUsers]))
        .build();

        let user = Claims {
            username: "bob".into(),
            role: "user".into(),
            exp: i64::MAX,
        };
        assert!(matches!(
            service.list_users(&user).await,
            Err(RegistryError::Forbidden(_))
        ));
        service.list_users(&admin()).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_admin_is_idempotent() {
        let service = service();
        for _ in 0..2 {
            service
                .ensure_admin("root", Secret::from("bootstrap"), "root@example.com")
                .await
                .unwrap();
        }
        let users = service.list_users(&admin()).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, "admin");
    }

    #[test]
    fn info_reports_registry_url() {
        let info = service().info();
        assert_eq!(info.version, "2.0");
        assert_eq!(info.url, "registry.internal:5000");
    }
}
