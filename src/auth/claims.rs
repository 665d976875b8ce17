use serde::{Deserialize, Serialize};

/// Which namespace a token grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    Device,
    Admin,
}

/// Token body. `exp` is enforced by the decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Device id for device tokens, admin principal for admin tokens
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub tenant_id: String,
    pub scope: TokenScope,
}

impl Claims {
    /// Token was minted for `scope` within `tenant_id`.
    pub fn grants(&self, scope: TokenScope, tenant_id: &str) -> bool {
        self.scope == scope && self.tenant_id == tenant_id
    }
}
