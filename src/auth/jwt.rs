use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;

use super::claims::{Claims, TokenScope};
use super::credentials::{AuthError, CredentialStore};

/// Credentials are HS256 tokens minted by the product backend.
///
/// A device token must carry `scope = device`, the presented tenant and the
/// presented device id as `sub`. An admin token must carry `scope = admin` and
/// the tenant; its `sub` becomes the admin principal.
pub struct JwtCredentialStore {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialStore {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected token");
                AuthError::InvalidCredentials
            })?;

        Ok(token_data.claims)
    }
}

#[async_trait]
impl CredentialStore for JwtCredentialStore {
    fn backend_name(&self) -> &'static str {
        "jwt"
    }

    async fn verify_device(
        &self,
        tenant_id: &str,
        device_id: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let claims = self.validate(credential)?;
        if !claims.grants(TokenScope::Device, tenant_id) || claims.sub != device_id {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    async fn verify_admin(&self, tenant_id: &str, credential: &str) -> Result<String, AuthError> {
        let claims = self.validate(credential)?;
        if !claims.grants(TokenScope::Admin, tenant_id) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-for-testing";

    fn store() -> JwtCredentialStore {
        JwtCredentialStore::new(&JwtConfig {
            secret: SECRET.to_string(),
            issuer: None,
            audience: None,
        })
    }

    fn token(sub: &str, tenant_id: &str, scope: TokenScope, secret: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
            iat: chrono::Utc::now().timestamp(),
            tenant_id: tenant_id.to_string(),
            scope,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_device_token() {
        let token = token("device-1", "t1", TokenScope::Device, SECRET);
        assert!(store().verify_device("t1", "device-1", &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_token_bound_to_tenant_and_device() {
        let token = token("device-1", "t1", TokenScope::Device, SECRET);
        let store = store();
        assert_eq!(
            store.verify_device("t2", "device-1", &token).await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            store.verify_device("t1", "device-2", &token).await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_admin_token_returns_principal() {
        let token = token("ops@example.com", "t1", TokenScope::Admin, SECRET);
        assert_eq!(
            store().verify_admin("t1", &token).await.unwrap(),
            "ops@example.com"
        );
    }

    #[tokio::test]
    async fn test_device_token_is_not_admin() {
        let token = token("device-1", "t1", TokenScope::Device, SECRET);
        assert!(store().verify_admin("t1", &token).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_secret_and_garbage() {
        let token = token("device-1", "t1", TokenScope::Device, "other-secret");
        let store = store();
        assert!(store.verify_device("t1", "device-1", &token).await.is_err());
        assert!(store.verify_device("t1", "device-1", "invalid-token").await.is_err());
    }
}
