use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use uuid::Uuid;

use crate::push::PushUser;
use crate::reschedule::ReschedulePolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub reschedule: RescheduleConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Required in the `X-API-Key` header of admin requests when set
    #[serde(default)]
    pub key: Option<String>,
}

/// Registry behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Whether permanent listeners may be registered at all
    #[serde(default = "default_true")]
    pub permanent_push_allowed: bool,
    /// Hand new registrations to the cluster rescheduler instead of starting
    /// the listener right away
    #[serde(default)]
    pub reschedule_on_registration: bool,
    /// Per-context overrides of `reschedule_on_registration` (key: context id)
    #[serde(default)]
    pub reschedule_on_registration_contexts: HashMap<String, bool>,
    /// Client identifiers allowed to use push. `*` matches any client, a
    /// trailing `*` matches by prefix.
    #[serde(default = "default_allowed_clients")]
    pub allowed_clients: Vec<String>,
    #[serde(default)]
    pub memory_backend: MemoryBackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBackendConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_backend_id")]
    pub id: String,
    #[serde(default = "default_true")]
    pub listeners_require_resources: bool,
}

/// Cluster rescheduling behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub policy: ReschedulePolicy,
    /// Quiet period after the last trigger before a plan runs
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Timer tick frequency while a plan is pending
    #[serde(default = "default_frequency_ms")]
    pub frequency_ms: u64,
    /// Timeout of a single remote call attempt
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// Attempts per remote call before the member is skipped for the round
    #[serde(default = "default_remote_attempts")]
    pub remote_attempts: u32,
    /// Pause after the cluster-wide stop so external resources get released
    #[serde(default = "default_handoff_park_ms")]
    pub handoff_park_ms: u64,
    /// Pause between stopping and starting listeners of one local share
    #[serde(default = "default_apply_park_ms")]
    pub apply_park_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Use the Redis transport; otherwise this node runs standalone
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Address other members use to identify this node (`ip:port`)
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Members whose heartbeat is older than this are considered gone
    #[serde(default = "default_member_ttl")]
    pub member_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Registrations are kept in memory when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
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

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8085
}

fn default_allowed_clients() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_memory_backend_id() -> String {
    "memory".to_string()
}

fn default_delay_ms() -> u64 {
    5_000
}

fn default_frequency_ms() -> u64 {
    2_000
}

fn default_remote_timeout_ms() -> u64 {
    10_000
}

fn default_remote_attempts() -> u32 {
    3
}

fn default_handoff_park_ms() -> u64 {
    2_000
}

fn default_apply_park_ms() -> u64 {
    500
}

fn default_node_name() -> String {
    format!("push-{}", Uuid::new_v4().simple())
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_member_ttl() -> u64 {
    15
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ara:push".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-permanent-push".to_string()
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
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA_RESCHEDULE__POLICY, ARA_PUSH__ALLOWED_CLIENTS=a,b, ...
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("push.allowed_clients"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl PushConfig {
    /// Whether a new registration of this user goes through the rescheduler
    pub fn reschedule_on_registration_for(&self, push_user: &PushUser) -> bool {
        self.reschedule_on_registration_contexts
            .get(&push_user.context_id.to_string())
            .copied()
            .unwrap_or(self.reschedule_on_registration)
    }

    pub fn is_client_allowed(&self, client: &str) -> bool {
        self.allowed_clients.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => client.starts_with(prefix),
                None => pattern == client,
            }
        })
    }
}

impl RescheduleConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms.max(1))
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn handoff_park(&self) -> Duration {
        Duration::from_millis(self.handoff_park_ms)
    }

    pub fn apply_park(&self) -> Duration {
        Duration::from_millis(self.apply_park_ms)
    }
}

impl ClusterConfig {
    /// Parsed advertise address; invalid values are ignored with a warning
    pub fn advertise_socket_addr(&self) -> Option<SocketAddr> {
        let raw = self.advertise_address.as_deref()?;
        match raw.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!(address = %raw, error = %e, "Ignoring invalid advertise address");
                None
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            permanent_push_allowed: true,
            reschedule_on_registration: false,
            reschedule_on_registration_contexts: HashMap::new(),
            allowed_clients: default_allowed_clients(),
            memory_backend: MemoryBackendConfig::default(),
        }
    }
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            id: default_memory_backend_id(),
            listeners_require_resources: true,
        }
    }
}

impl Default for RescheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: ReschedulePolicy::default(),
            delay_ms: default_delay_ms(),
            frequency_ms: default_frequency_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            remote_attempts: default_remote_attempts(),
            handoff_park_ms: default_handoff_park_ms(),
            apply_park_ms: default_apply_park_ms(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_name: default_node_name(),
            advertise_address: None,
            heartbeat_interval_seconds: default_heartbeat_interval(),
            member_ttl_seconds: default_member_ttl(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
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
        assert_eq!(settings.server.port, 8085);
        assert!(settings.push.permanent_push_allowed);
        assert_eq!(settings.reschedule.delay(), Duration::from_secs(5));
        assert_eq!(settings.reschedule.frequency(), Duration::from_secs(2));
        assert_eq!(settings.reschedule.remote_attempts, 3);
        assert_eq!(settings.reschedule.policy, ReschedulePolicy::Master);
        assert!(settings.cluster.node_name.starts_with("push-"));
    }

    #[test]
    fn test_client_patterns() {
        let config = PushConfig {
            allowed_clients: vec!["web".to_string(), "mobile-*".to_string()],
            ..Default::default()
        };
        assert!(config.is_client_allowed("web"));
        assert!(config.is_client_allowed("mobile-ios"));
        assert!(!config.is_client_allowed("webdav"));
        assert!(!config.is_client_allowed("desktop"));

        assert!(PushConfig::default().is_client_allowed("anything"));
    }

    #[test]
    fn test_reschedule_on_registration_override() {
        let mut config = PushConfig::default();
        config
            .reschedule_on_registration_contexts
            .insert("7".to_string(), true);

        assert!(config.reschedule_on_registration_for(&PushUser::new(1, 7)));
        assert!(!config.reschedule_on_registration_for(&PushUser::new(1, 8)));
    }

    #[test]
    fn test_advertise_address_parsing() {
        let mut config = ClusterConfig {
            advertise_address: Some("10.0.0.5:8085".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.advertise_socket_addr(),
            Some("10.0.0.5:8085".parse().unwrap())
        );

        config.advertise_address = Some("not-an-address".to_string());
        assert!(config.advertise_socket_addr().is_none());
    }
}
