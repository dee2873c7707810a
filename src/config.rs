//! Configuration tree (spec.md §6). Every section is optional and
//! defaulted; `Config::load` reads a YAML file and then applies
//! environment-variable overrides, matching the teacher's pattern of
//! typed, `serde`-deserialized config structs with explicit defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {}", path, source))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("failed to parse config file {}: {}", path, source))]
    Parse { path: String, source: serde_yaml::Error },
}

fn default_true() -> bool {
    true
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub log_level: String,
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "logbeam".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            environment: "production".into(),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".into(),
            port: 8686,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9598,
            path: "/metrics".into(),
            namespace: "logbeam".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_size: usize,
    pub worker_count: usize,
    pub batch_size: usize,
    #[serde(with = "duration_millis")]
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub dlq_enabled: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            worker_count: 4,
            batch_size: 100,
            batch_timeout: secs(5),
            max_retries: 3,
            retry_base_delay_ms: 500,
            dlq_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub low_threshold: f64,
    pub medium_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub stabilize_time: Duration,
    #[serde(with = "duration_millis")]
    pub cooldown_time: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_threshold: 0.25,
            medium_threshold: 0.5,
            high_threshold: 0.75,
            critical_threshold: 0.9,
            check_interval: secs(1),
            stabilize_time: secs(5),
            cooldown_time: secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub max_cache_size: usize,
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
    pub include_timestamp: bool,
    pub include_source_id: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: 100_000,
            ttl: secs(300),
            cleanup_interval: secs(60),
            include_timestamp: false,
            include_source_id: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskBufferSectionConfig {
    pub enabled: bool,
    pub directory: String,
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub compression_enabled: bool,
    #[serde(with = "duration_millis")]
    pub retention_period: Duration,
}

impl Default for DiskBufferSectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "/var/lib/logbeam/buffer".into(),
            max_file_size: 128 * 1024 * 1024,
            max_total_size: 2 * 1024 * 1024 * 1024,
            compression_enabled: false,
            retention_period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqReprocessingConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    pub max_retries: u32,
}

impl Default for DlqReprocessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: secs(30),
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqAlertConfig {
    pub enabled: bool,
    pub threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqSectionConfig {
    pub enabled: bool,
    pub directory: String,
    pub max_file_size: u64,
    #[serde(with = "duration_millis")]
    pub retention_period: Duration,
    pub reprocessing: DlqReprocessingConfig,
    pub alert: DlqAlertConfig,
}

impl Default for DlqSectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "/var/lib/logbeam/dlq".into(),
            max_file_size: 64 * 1024 * 1024,
            retention_period: Duration::from_secs(14 * 24 * 3600),
            reprocessing: DlqReprocessingConfig::default(),
            alert: DlqAlertConfig {
                enabled: true,
                threshold: 1000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    pub enabled: bool,
    pub directory: String,
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    pub max_memory_buffer: usize,
    pub force_flush_on_exit: bool,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_position_age: Duration,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "/var/lib/logbeam/positions".into(),
            flush_interval: secs(15),
            max_memory_buffer: 100_000,
            force_flush_on_exit: true,
            cleanup_interval: secs(300),
            max_position_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTimestampActionConfig {
    Clamp,
    Reject,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampValidationConfig {
    pub enabled: bool,
    pub max_past_age_seconds: i64,
    pub max_future_age_seconds: i64,
    pub invalid_action: InvalidTimestampActionConfig,
}

impl Default for TimestampValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_past_age_seconds: 7 * 24 * 3600,
            max_future_age_seconds: 300,
            invalid_action: InvalidTimestampActionConfig::Clamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfLogActionConfig {
    Drop,
    Tag,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfGuardConfig {
    pub enabled: bool,
    pub self_container_name: Option<String>,
    pub self_id_short: Option<String>,
    pub exclude_path_patterns: Vec<String>,
    pub exclude_container_patterns: Vec<String>,
    pub exclude_message_patterns: Vec<String>,
    pub self_log_action: SelfLogActionConfig,
}

impl Default for SelfGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            self_container_name: None,
            self_id_short: None,
            exclude_path_patterns: Vec::new(),
            exclude_container_patterns: Vec::new(),
            exclude_message_patterns: Vec::new(),
            self_log_action: SelfLogActionConfig::Drop,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_lines_per_second: u32,
    #[serde(with = "duration_millis")]
    pub quiet_period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_lines_per_second: 0,
            quiet_period: secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMonitorConfig {
    pub enabled: bool,
    pub paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            exclude_paths: Vec::new(),
            poll_interval: secs(5),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerPoolConfig {
    pub size: usize,
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for ContainerPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            health_check_interval: secs(30),
            max_retries: 5,
            retry_delay: secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerMonitorConfig {
    pub enabled: bool,
    pub socket_path: String,
    pub include_labels: BTreeMap<String, String>,
    pub exclude_labels: BTreeMap<String, String>,
    pub include_names: Vec<String>,
    pub exclude_names: Vec<String>,
    pub pool: ContainerPoolConfig,
}

impl Default for ContainerMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: "/var/run/docker.sock".into(),
            include_labels: BTreeMap::new(),
            exclude_labels: BTreeMap::new(),
            include_names: Vec::new(),
            exclude_names: Vec::new(),
            pool: ContainerPoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub enabled: bool,
    pub pipelines_file: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pipelines_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkCompressionConfig {
    pub enabled: bool,
    pub algorithm: String,
    pub level: i32,
}

impl Default for SinkCompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: "gzip".into(),
            level: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBatchingConfig {
    pub enabled: bool,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    #[serde(with = "duration_millis")]
    pub min_flush_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_flush_delay: Duration,
    #[serde(with = "duration_millis")]
    pub latency_threshold: Duration,
    pub throughput_target: f64,
    #[serde(with = "duration_millis")]
    pub adaptation_interval: Duration,
}

impl Default for AdaptiveBatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_batch_size: 10,
            max_batch_size: 1000,
            initial_batch_size: 100,
            min_flush_delay: Duration::from_millis(100),
            max_flush_delay: secs(10),
            latency_threshold: secs(1),
            throughput_target: 100.0,
            adaptation_interval: secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LokiSinkConfig {
    pub enabled: bool,
    pub url: String,
    pub tenant_id: Option<String>,
    pub auth: AuthConfig,
    pub headers: BTreeMap<String, String>,
    pub default_labels: BTreeMap<String, String>,
    pub batch_size: usize,
    #[serde(with = "duration_millis")]
    pub batch_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub compression: SinkCompressionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub adaptive_batching: AdaptiveBatchingConfig,
}

impl Default for LokiSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:3100/loki/api/v1/push".into(),
            tenant_id: None,
            auth: AuthConfig::default(),
            headers: BTreeMap::new(),
            default_labels: BTreeMap::new(),
            batch_size: 100,
            batch_timeout: secs(5),
            timeout: secs(10),
            compression: SinkCompressionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            adaptive_batching: AdaptiveBatchingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub max_size_mb: u64,
    pub max_files: u32,
    pub compress: bool,
    pub retention_hours: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 128,
            max_files: 10,
            compress: false,
            retention_hours: 7 * 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalFileSinkConfig {
    pub enabled: bool,
    pub directory: String,
    pub filename_pattern: String,
    pub output_format: OutputFormat,
    pub rotation: RotationConfig,
    pub max_open_files: usize,
    pub max_total_disk_gb: u64,
}

impl Default for LocalFileSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "/var/log/logbeam/sinks".into(),
            filename_pattern: "%Y-%m-%d-%N.log".into(),
            output_format: OutputFormat::Json,
            rotation: RotationConfig::default(),
            max_open_files: 100,
            max_total_disk_gb: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub loki: LokiSinkConfig,
    pub local_file: LocalFileSinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub default_algorithm: String,
    pub adaptive_enabled: bool,
    pub min_bytes: usize,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_algorithm: "gzip".into(),
            adaptive_enabled: true,
            min_bytes: 512,
            level: 6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub dispatcher: DispatcherConfig,
    pub backpressure: BackpressureConfig,
    pub deduplication: DeduplicationConfig,
    pub disk_buffer: DiskBufferSectionConfig,
    pub dlq: DlqSectionConfig,
    pub positions: PositionsConfig,
    pub timestamp_validation: TimestampValidationConfig,
    pub selfguard: SelfGuardConfig,
    pub file_monitor_service: FileMonitorConfig,
    pub container_monitor: ContainerMonitorConfig,
    pub processing: ProcessingConfig,
    pub sinks: SinksConfig,
    pub compression: CompressionConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        let mut config: Config = serde_yaml::from_str(&text).context(ParseSnafu {
            path: path.display().to_string(),
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies recognized `SSW_*` environment variable overrides after
    /// file defaults, per spec.md §6 ("env overrides applied after file
    /// defaults; env wins").
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SSW_APP_NAME") {
            self.app.name = v;
        }
        if let Ok(v) = std::env::var("SSW_LOG_LEVEL") {
            self.app.log_level = v;
        }
        if let Ok(v) = std::env::var("SSW_LOKI_ENABLED") {
            self.sinks.loki.enabled = parse_bool(&v, self.sinks.loki.enabled);
        }
        if let Ok(v) = std::env::var("SSW_LOKI_URL") {
            self.sinks.loki.url = v;
        }
        if let Ok(v) = std::env::var("SSW_LOKI_USER") {
            self.sinks.loki.auth.username = Some(v);
        }
        if let Ok(v) = std::env::var("SSW_LOKI_PASSWORD") {
            self.sinks.loki.auth.password = Some(v);
        }
        if let Ok(v) = std::env::var("SSW_LOKI_TOKEN") {
            self.sinks.loki.auth.token = Some(v);
        }
        if let Ok(v) = std::env::var("SSW_LOKI_HEADERS") {
            self.sinks.loki.headers.extend(parse_kv_list(&v));
        }
        if let Ok(v) = std::env::var("SSW_LOKI_LABELS") {
            self.sinks.loki.default_labels.extend(parse_kv_list(&v));
        }
        if let Ok(v) = std::env::var("SSW_FILE_MONITOR_ENABLED") {
            self.file_monitor_service.enabled = parse_bool(&v, self.file_monitor_service.enabled);
        }
        if let Ok(v) = std::env::var("SSW_CONTAINER_MONITOR_ENABLED") {
            self.container_monitor.enabled = parse_bool(&v, self.container_monitor.enabled);
        }
        if let Ok(v) = std::env::var("SSW_DOCKER_SOCKET") {
            self.container_monitor.socket_path = v;
        }
        if let Ok(v) = std::env::var("SSW_SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("SSW_METRICS_PORT") {
            if let Ok(port) = v.parse() {
                self.metrics.port = port;
            }
        }
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_kv_list(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_dispatcher_worker_count() {
        let config = Config::default();
        assert_eq!(config.dispatcher.worker_count, 4);
        assert!(config.deduplication.enabled);
    }

    #[test]
    fn parses_minimal_yaml_with_defaults() {
        let yaml = "app:\n  name: test-agent\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.app.name, "test-agent");
        assert_eq!(config.app.log_level, "info");
    }

    #[test]
    fn env_override_wins_over_file_default() {
        std::env::set_var("SSW_LOKI_URL", "http://example.test/push");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.sinks.loki.url, "http://example.test/push");
        std::env::remove_var("SSW_LOKI_URL");
    }

    #[test]
    fn parses_kv_list_for_headers() {
        let parsed = parse_kv_list("A=1,B=2");
        assert_eq!(parsed.get("A").unwrap(), "1");
        assert_eq!(parsed.get("B").unwrap(), "2");
    }
}
