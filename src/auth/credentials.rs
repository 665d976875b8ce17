//! Credential verification boundary.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::StaticTenantConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

/// External credential store consulted during the handshake.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Verify a device credential for `tenant_id`/`device_id`.
    async fn verify_device(
        &self,
        tenant_id: &str,
        device_id: &str,
        credential: &str,
    ) -> Result<(), AuthError>;

    /// Verify an admin credential, returning the admin principal.
    async fn verify_admin(&self, tenant_id: &str, credential: &str) -> Result<String, AuthError>;
}

/// Per-tenant shared secrets from configuration.
///
/// Every device of a tenant presents the tenant's device secret; admins
/// present the admin secret and are identified as `admin`.
pub struct StaticCredentialStore {
    tenants: HashMap<String, StaticTenantConfig>,
}

impl StaticCredentialStore {
    pub fn new(tenants: &[StaticTenantConfig]) -> Self {
        Self {
            tenants: tenants
                .iter()
                .map(|t| (t.tenant_id.clone(), t.clone()))
                .collect(),
        }
    }

    fn tenant(&self, tenant_id: &str) -> Result<&StaticTenantConfig, AuthError> {
        self.tenants
            .get(tenant_id)
            .ok_or_else(|| AuthError::UnknownTenant(tenant_id.to_string()))
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    fn backend_name(&self) -> &'static str {
        "static"
    }

    async fn verify_device(
        &self,
        tenant_id: &str,
        _device_id: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let tenant = self.tenant(tenant_id)?;
        if tenant.device_secret == credential {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    async fn verify_admin(&self, tenant_id: &str, credential: &str) -> Result<String, AuthError> {
        let tenant = self.tenant(tenant_id)?;
        if tenant.admin_secret == credential {
            Ok("admin".to_string())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StaticCredentialStore {
        StaticCredentialStore::new(&[StaticTenantConfig {
            tenant_id: "t1".to_string(),
            device_secret: "dev-secret".to_string(),
            admin_secret: "admin-secret".to_string(),
        }])
    }

    #[tokio::test]
    async fn test_device_secret() {
        let store = store();
        assert!(store.verify_device("t1", "d1", "dev-secret").await.is_ok());
        assert_eq!(
            store.verify_device("t1", "d1", "nope").await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_admin_secret_is_not_device_secret() {
        let store = store();
        assert_eq!(store.verify_admin("t1", "admin-secret").await.unwrap(), "admin");
        assert!(store.verify_admin("t1", "dev-secret").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        assert_eq!(
            store().verify_device("t9", "d1", "dev-secret").await,
            Err(AuthError::UnknownTenant("t9".to_string()))
        );
    }
}
