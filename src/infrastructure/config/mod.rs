mod settings;

pub use settings::{
    ApiConfig, ClusterConfig, DatabaseConfig, MemoryBackendConfig, OtelConfig, PushConfig,
    RedisConfig, RescheduleConfig, ServerConfig, Settings,
};
