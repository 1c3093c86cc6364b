//! Typed service configuration

use chrono::TimeDelta;
use counters::CounterConfig;
use metadata::MetadataConfig;
use secret::Secret;
use serde::Deserialize;

use crate::credentials::{CredentialManager, MAX_TOKEN_LIFETIME_HOURS, TOKEN_LIFETIME_HOURS};
use crate::error::{RegistryError, RegistryResult};
use crate::policy::{Operation, RolePolicy};
use crate::service::AccessService;

/// Signing secret used when none is configured. Never suitable for production.
pub const DEFAULT_JWT_SECRET: &str = "your-secret-key";

fn default_token_lifetime_hours() -> u32 {
    TOKEN_LIFETIME_HOURS
}

/// Administrator created at start-up when missing.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Login name of the administrator.
    pub username: String,
    /// Plaintext password, hashed before it is stored.
    pub password: Secret,
    /// Contact address.
    pub email: String,
}

/// Everything needed to assemble an [AccessService].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Metadata store backend.
    pub metadata: MetadataConfig,
    /// Counter cache backend.
    pub counters: CounterConfig,
    /// Token signing secret.
    pub jwt_secret: Secret,
    /// Hours an issued token stays valid, between 1 and
    /// [MAX_TOKEN_LIFETIME_HOURS].
    #[serde(default = "default_token_lifetime_hours")]
    pub token_lifetime_hours: u32,
    /// `host:port` of the blob-transfer endpoint.
    pub registry_url: String,
    /// Administrator to bootstrap.
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    /// Operations only the `admin` role may perform.
    #[serde(default)]
    pub admin_only: Vec<Operation>,
}

impl RegistryConfig {
    /// Connect the store and cache, then bootstrap the administrator if one
    /// is configured.
    #[tracing::instrument(skip(self))]
    pub async fn build(self) -> RegistryResult<AccessService> {
        if self.jwt_secret.revealed() == DEFAULT_JWT_SECRET {
            tracing::warn!("JWT_SECRET is not set; tokens are signed with the default secret");
        }
        let lifetime = token_lifetime(self.token_lifetime_hours)?;

        let store = self.metadata.build().await?;
        let counters = self.counters.build().await?;
        tracing::info!(
            metadata = store.name(),
            counters = counters.name(),
            "backends ready"
        );

        let credentials = CredentialManager::new(self.jwt_secret).with_lifetime(lifetime);
        let mut builder = AccessService::builder(store, counters, credentials)
            .registry_url(self.registry_url);
        let policy = RolePolicy::admin_only(self.admin_only);
        if !policy.is_empty() {
            tracing::info!(?policy, "restricting operations to admin");
            builder = builder.policy(policy);
        }
        let service = builder.build();

        if let Some(admin) = self.admin {
            service
                .ensure_admin(&admin.username, admin.password, &admin.email)
                .await?;
        }
        Ok(service)
    }
}

fn token_lifetime(hours: u32) -> RegistryResult<TimeDelta> {
    if !(1..=MAX_TOKEN_LIFETIME_HOURS).contains(&hours) {
        return Err(RegistryError::Validation(format!(
            "token lifetime must be between 1 and {MAX_TOKEN_LIFETIME_HOURS} hours, got {hours}"
        )));
    }
    TimeDelta::try_hours(i64::from(hours)).ok_or_else(|| {
        RegistryError::Validation(format!("token lifetime of {hours} hours is out of range"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{
                "metadata": "memory",
                "counters": {"memory": {}},
                "jwt-secret": "hunter2",
                "registry-url": "localhost:5000",
                "admin-only": ["delete-user", "create-user"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.token_lifetime_hours, 24);
        assert!(config.admin.is_none());
        assert_eq!(
            config.admin_only,
            vec![Operation::DeleteUser, Operation::CreateUser]
        );
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn build_bootstraps_admin() {
        let config = RegistryConfig {
            metadata: MetadataConfig::Memory,
            counters: CounterConfig::Memory { ttl_secs: None },
            jwt_secret: Secret::from("test"),
            token_lifetime_hours: 1,
            registry_url: "localhost:5000".into(),
            admin: Some(AdminConfig {
                username: "root".into(),
                password: Secret::from("changeme"),
                email: "root@example.com".into(),
            }),
            admin_only: vec![Operation::DeleteUser],
        };
        let service = config.build().await.unwrap();
        let user = service.store().find_user("root").await.unwrap();
        assert_eq!(user.role, "admin");
        assert_eq!(service.credentials().lifetime(), TimeDelta::hours(1));
    }

    fn with_lifetime(hours: u32) -> RegistryConfig {
        RegistryConfig {
            metadata: MetadataConfig::Memory,
            counters: CounterConfig::Memory { ttl_secs: None },
            jwt_secret: Secret::from("test"),
            token_lifetime_hours: hours,
            registry_url: "localhost:5000".into(),
            admin: None,
            admin_only: Vec::new(),
        }
    }

    #[tokio::test]
    async fn build_rejects_out_of_range_lifetimes() {
        for hours in [0, MAX_TOKEN_LIFETIME_HOURS + 1, u32::MAX] {
            let err = with_lifetime(hours).build().await.unwrap_err();
            assert!(matches!(err, RegistryError::Validation(_)), "{hours}: {err}");
        }
    }

    #[tokio::test]
    async fn longest_lifetime_still_issues() {
        let service = with_lifetime(MAX_TOKEN_LIFETIME_HOURS).build().await.unwrap();
        let token = service.credentials().issue("root", "admin").unwrap();
        assert!(service.credentials().verify(&token).is_ok());
    }

    #[test]
    fn negative_lifetime_does_not_deserialize() {
        let result: Result<RegistryConfig, _> = serde_json::from_str(
            r#"{
                "metadata": "memory",
                "counters": {"memory": {}},
                "jwt-secret": "hunter2",
                "token-lifetime-hours": -5,
                "registry-url": "localhost:5000"
            }"#,
        );
        assert!(result.is_err());
    }
}
