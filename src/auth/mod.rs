//! Handshake authentication for both namespaces.

mod authenticator;
mod claims;
mod credentials;
mod jwt;

use std::sync::Arc;

pub use authenticator::Authenticator;
pub use claims::{Claims, TokenScope};
pub use credentials::{AuthError, CredentialStore, StaticCredentialStore};
pub use jwt::JwtCredentialStore;

use crate::config::{AuthBackend, AuthConfig};

/// Build the configured credential store.
pub fn create_credential_store(config: &AuthConfig) -> Arc<dyn CredentialStore> {
    match config.backend {
        AuthBackend::Jwt => {
            if config.jwt.secret.is_empty() {
                tracing::warn!("JWT secret is empty");
            }
            tracing::info!("Using JWT credential store");
            Arc::new(JwtCredentialStore::new(&config.jwt))
        }
        AuthBackend::Static => {
            tracing::info!(tenants = config.tenants.len(), "Using static credential store");
            Arc::new(StaticCredentialStore::new(&config.tenants))
        }
    }
}
