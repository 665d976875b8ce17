//! Connection statistics

use serde::Serialize;
use std::collections::HashMap;

/// Node-wide connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub client_connections: usize,
    pub admin_connections: usize,
    pub unique_devices: usize,
    /// Bytes queued but not yet written, across all connections
    pub queued_bytes: usize,
    pub tenants: HashMap<String, usize>,
}

/// Tenant-specific connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct TenantConnectionStats {
    pub tenant_id: String,
    pub total_connections: usize,
    pub unique_devices: usize,
    pub admin_connections: usize,
}
