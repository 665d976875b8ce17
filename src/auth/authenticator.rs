use std::sync::Arc;

use serde_json::Value;

use crate::connection_manager::{ConnectionIdentity, Namespace};
use crate::protocol::{ConnectErrorCode, ConnectErrorPayload, HandshakeAuth};

use super::credentials::{AuthError, CredentialStore};

/// Turns a CONNECT packet into a connection identity or a CONNECT_ERROR payload.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    #[tracing::instrument(skip(self, payload))]
    pub async fn authenticate(
        &self,
        namespace_path: &str,
        payload: Option<&Value>,
    ) -> Result<ConnectionIdentity, ConnectErrorPayload> {
        let namespace = Namespace::from_path(namespace_path).ok_or_else(|| {
            ConnectErrorPayload::new(
                ConnectErrorCode::AuthError,
                format!("Unknown namespace {}", namespace_path),
            )
        })?;

        let auth = HandshakeAuth::from_payload(namespace.path(), payload).ok_or_else(|| {
            let expected = match namespace {
                Namespace::Client => "tenantId, deviceId and credential are required",
                Namespace::Admin => "tenantId and adminCredential are required",
            };
            ConnectErrorPayload::new(ConnectErrorCode::MissingParams, expected)
        })?;

        let result = match &auth {
            HandshakeAuth::Device {
                tenant_id,
                device_id,
                credential,
            } => self
                .store
                .verify_device(tenant_id, device_id, credential)
                .await
                .map(|()| ConnectionIdentity::device(tenant_id, device_id)),
            HandshakeAuth::Admin {
                tenant_id,
                admin_credential,
            } => self
                .store
                .verify_admin(tenant_id, admin_credential)
                .await
                .map(|principal| ConnectionIdentity::admin(tenant_id, principal)),
        };

        result.map_err(|e| {
            tracing::info!(
                tenant_id = %auth.tenant_id(),
                namespace = %namespace.path(),
                error = %e,
                "Handshake rejected"
            );
            match e {
                AuthError::InvalidCredentials | AuthError::UnknownTenant(_) => {
                    ConnectErrorPayload::new(
                        ConnectErrorCode::InvalidCredentials,
                        "Invalid credentials",
                    )
                }
                AuthError::Unavailable(_) => ConnectErrorPayload::new(
                    ConnectErrorCode::AuthError,
                    "Authentication temporarily unavailable",
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentialStore;
    use crate::config::StaticTenantConfig;
    use serde_json::json;

    fn authenticator() -> Authenticator {
        Authenticator::new(Arc::new(StaticCredentialStore::new(&[StaticTenantConfig {
            tenant_id: "t1".to_string(),
            device_secret: "dev".to_string(),
            admin_secret: "adm".to_string(),
        }])))
    }

    #[tokio::test]
    async fn test_device_handshake() {
        let payload = json!({"tenantId": "t1", "deviceId": "d1", "credential": "dev"});
        let identity = authenticator()
            .authenticate("/", Some(&payload))
            .await
            .unwrap();
        assert_eq!(identity, ConnectionIdentity::device("t1", "d1"));
    }

    #[tokio::test]
    async fn test_admin_handshake() {
        let payload = json!({"tenantId": "t1", "adminCredential": "adm"});
        let identity = authenticator()
            .authenticate("/admin", Some(&payload))
            .await
            .unwrap();
        assert_eq!(identity.namespace, Namespace::Admin);
    }

    #[tokio::test]
    async fn test_missing_params() {
        let payload = json!({"tenantId": "t1"});
        let err = authenticator()
            .authenticate("/", Some(&payload))
            .await
            .unwrap_err();
        assert_eq!(err.code, ConnectErrorCode::MissingParams);

        let err = authenticator().authenticate("/", None).await.unwrap_err();
        assert_eq!(err.code, ConnectErrorCode::MissingParams);
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let payload = json!({"tenantId": "t1", "deviceId": "d1", "credential": "wrong"});
        let err = authenticator()
            .authenticate("/", Some(&payload))
            .await
            .unwrap_err();
        assert_eq!(err.code, ConnectErrorCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let payload = json!({"tenantId": "t1", "deviceId": "d1", "credential": "dev"});
        let err = authenticator()
            .authenticate("/billing", Some(&payload))
            .await
            .unwrap_err();
        assert_eq!(err.code, ConnectErrorCode::AuthError);
    }
}
