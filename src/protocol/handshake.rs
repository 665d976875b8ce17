use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reason codes carried by a CONNECT_ERROR packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectErrorCode {
    MissingParams,
    InvalidCredentials,
    AuthError,
}

impl ConnectErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectErrorCode::MissingParams => "MISSING_PARAMS",
            ConnectErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ConnectErrorCode::AuthError => "AUTH_ERROR",
        }
    }
}

impl std::fmt::Display for ConnectErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CONNECT_ERROR payload `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectErrorPayload {
    pub code: ConnectErrorCode,
    pub message: String,
}

impl ConnectErrorPayload {
    pub fn new(code: ConnectErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Credentials a client presents in its CONNECT packet.
///
/// The namespace decides the payload shape:
/// `/` takes `{tenantId, deviceId, credential}` and `/admin` takes
/// `{tenantId, adminCredential}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAuth {
    Device {
        tenant_id: String,
        device_id: String,
        credential: String,
    },
    Admin {
        tenant_id: String,
        admin_credential: String,
    },
}

impl HandshakeAuth {
    pub fn tenant_id(&self) -> &str {
        match self {
            HandshakeAuth::Device { tenant_id, .. } | HandshakeAuth::Admin { tenant_id, .. } => {
                tenant_id
            }
        }
    }

    /// Namespace path the CONNECT packet is addressed to.
    pub fn namespace_path(&self) -> &'static str {
        match self {
            HandshakeAuth::Device { .. } => "/",
            HandshakeAuth::Admin { .. } => "/admin",
        }
    }

    pub fn to_payload(&self) -> Value {
        match self {
            HandshakeAuth::Device {
                tenant_id,
                device_id,
                credential,
            } => json!({
                "tenantId": tenant_id,
                "deviceId": device_id,
                "credential": credential,
            }),
            HandshakeAuth::Admin {
                tenant_id,
                admin_credential,
            } => json!({
                "tenantId": tenant_id,
                "adminCredential": admin_credential,
            }),
        }
    }

    /// Parse the CONNECT payload for a namespace path.
    ///
    /// Returns `None` when a required field is missing, empty, or not a string.
    pub fn from_payload(namespace_path: &str, payload: Option<&Value>) -> Option<Self> {
        let payload = payload?;
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match namespace_path {
            "/admin" => Some(HandshakeAuth::Admin {
                tenant_id: field("tenantId")?,
                admin_credential: field("adminCredential")?,
            }),
            _ => Some(HandshakeAuth::Device {
                tenant_id: field("tenantId")?,
                device_id: field("deviceId")?,
                credential: field("credential")?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_code_wire_names() {
        let payload = ConnectErrorPayload::new(ConnectErrorCode::MissingParams, "missing tenantId");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], "MISSING_PARAMS");
        assert_eq!(ConnectErrorCode::AuthError.to_string(), "AUTH_ERROR");
    }

    #[test]
    fn test_device_payload_round_trip() {
        let auth = HandshakeAuth::Device {
            tenant_id: "t1".to_string(),
            device_id: "d1".to_string(),
            credential: "secret".to_string(),
        };
        let payload = auth.to_payload();
        assert_eq!(HandshakeAuth::from_payload("/", Some(&payload)), Some(auth));
    }

    #[test]
    fn test_admin_payload_requires_admin_credential() {
        let payload = json!({"tenantId": "t1", "credential": "x"});
        assert_eq!(HandshakeAuth::from_payload("/admin", Some(&payload)), None);
    }

    #[test]
    fn test_missing_or_empty_fields() {
        assert_eq!(HandshakeAuth::from_payload("/", None), None);
        let payload = json!({"tenantId": "t1", "deviceId": "", "credential": "x"});
        assert_eq!(HandshakeAuth::from_payload("/", Some(&payload)), None);
        let payload = json!({"tenantId": "t1", "deviceId": 5, "credential": "x"});
        assert_eq!(HandshakeAuth::from_payload("/", Some(&payload)), None);
    }
}
