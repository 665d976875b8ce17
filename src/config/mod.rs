mod settings;

pub use settings::{
    ApiConfig, AuthBackend, AuthConfig, BackendKind, ClusterConfig, JwtConfig, OtelConfig,
    PresenceConfig, RedisConfig, ServerConfig, Settings, ShutdownConfig, StaticTenantConfig,
    TransportConfig,
};
