use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed to open the realtime socket. Empty allows all.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_delay_ms: u64,
    /// Attempts per shared-store operation before degrading to local-only.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

/// Socket-level tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Queued outbound bytes per connection before it is closed for backpressure.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_violations")]
    pub max_protocol_violations: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_device")]
    pub max_connections_per_device: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_presence_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_presence_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Bus backend. `redis` fans out across nodes; `memory` is single-node.
    #[serde(default = "default_bus_backend")]
    pub bus_backend: BackendKind,
    /// Unique node id; generated when empty.
    #[serde(default)]
    pub server_id: String,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    /// Envelope ids remembered for duplicate suppression.
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace")]
    pub grace_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on waiting for sessions to finish cleanup after the close.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthBackend {
    Jwt,
    Static,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_backend")]
    pub backend: AuthBackend,
    #[serde(default)]
    pub jwt: JwtConfig,
    /// Shared secrets per tenant, used by the `static` backend.
    #[serde(default)]
    pub tenants: Vec<StaticTenantConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticTenantConfig {
    pub tenant_id: String,
    pub device_secret: String,
    pub admin_secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    60_000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_ack_timeout() -> u64 {
    10_000
}

fn default_max_buffered_bytes() -> usize {
    1024 * 1024
}

fn default_max_frame_bytes() -> usize {
    crate::protocol::DEFAULT_MAX_FRAME_BYTES
}

fn default_max_violations() -> u32 {
    crate::protocol::DEFAULT_VIOLATION_BUDGET
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_device() -> usize {
    8
}

fn default_presence_backend() -> BackendKind {
    BackendKind::Memory
}

fn default_presence_ttl() -> u64 {
    120
}

fn default_presence_prefix() -> String {
    "ara:presence".to_string()
}

fn default_bus_backend() -> BackendKind {
    BackendKind::Memory
}

fn default_channel_prefix() -> String {
    "ara:rt".to_string()
}

fn default_dedupe_capacity() -> usize {
    4096
}

fn default_grace() -> u64 {
    1_000
}

fn default_reconnect_delay() -> u64 {
    5_000
}

fn default_close_timeout() -> u64 {
    5_000
}

fn default_auth_backend() -> AuthBackend {
    AuthBackend::Jwt
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-realtime-gateway".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("redis.url", default_redis_url())?
            .set_default("transport.ping_interval_ms", default_ping_interval() as i64)?
            .set_default("transport.ping_timeout_ms", default_ping_timeout() as i64)?
            .set_default("shutdown.reconnect_delay_ms", default_reconnect_delay() as i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA_TRANSPORT__PING_INTERVAL_MS, ARA_REDIS__URL, ARA_SERVER__ALLOWED_ORIGINS=a,b ...
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn uses_redis(&self) -> bool {
        self.presence.backend == BackendKind::Redis || self.cluster.bus_backend == BackendKind::Redis
    }
}

impl TransportConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl ClusterConfig {
    /// Configured server id, or a generated `ara-{uuid}` one.
    pub fn resolve_server_id(&self) -> String {
        if self.server_id.is_empty() {
            format!("ara-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.server_id.clone()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
            backoff_initial_delay_ms: default_backoff_initial(),
            backoff_max_delay_ms: default_backoff_max(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            ping_timeout_ms: default_ping_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            max_buffered_bytes: default_max_buffered_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            max_protocol_violations: default_max_violations(),
            max_connections: default_max_connections(),
            max_connections_per_device: default_max_connections_per_device(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: default_presence_backend(),
            ttl_seconds: default_presence_ttl(),
            key_prefix: default_presence_prefix(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bus_backend: default_bus_backend(),
            server_id: String::new(),
            channel_prefix: default_channel_prefix(),
            dedupe_capacity: default_dedupe_capacity(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace(),
            reconnect_delay_ms: default_reconnect_delay(),
            close_timeout_ms: default_close_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: default_auth_backend(),
            jwt: JwtConfig::default(),
            tenants: vec![],
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8081);
        assert!(settings.server.allowed_origins.is_empty());
        assert_eq!(settings.redis.retry_attempts, 3);
    }

    #[test]
    fn test_transport_defaults() {
        let transport = TransportConfig::default();
        assert_eq!(transport.ping_interval(), Duration::from_millis(25_000));
        assert_eq!(transport.ping_timeout(), Duration::from_millis(60_000));
        assert_eq!(transport.ack_timeout(), Duration::from_millis(10_000));
        assert_eq!(transport.handshake_timeout(), Duration::from_millis(10_000));
        assert_eq!(transport.max_buffered_bytes, 1024 * 1024);
        assert_eq!(transport.max_protocol_violations, 10);
    }

    #[test]
    fn test_presence_and_shutdown_defaults() {
        assert_eq!(PresenceConfig::default().ttl(), Duration::from_secs(120));
        let shutdown = ShutdownConfig::default();
        assert_eq!(shutdown.grace(), Duration::from_millis(1000));
        assert_eq!(shutdown.reconnect_delay_ms, 5000);
    }

    #[test]
    fn test_generated_server_id() {
        let cluster = ClusterConfig::default();
        let id = cluster.resolve_server_id();
        assert!(id.starts_with("ara-"));
        assert_ne!(id, cluster.resolve_server_id());

        let fixed = ClusterConfig {
            server_id: "node-a".to_string(),
            ..ClusterConfig::default()
        };
        assert_eq!(fixed.resolve_server_id(), "node-a");
    }

    #[test]
    fn test_memory_backends_by_default() {
        let settings = Settings::default();
        assert!(!settings.uses_redis());
    }
}
