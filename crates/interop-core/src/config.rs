//! Engine configuration: loaded from YAML, with an `environments` overlay merged onto the base
//! section-by-section (§6). The teacher toolkit has no config file of its own (its binaries take
//! everything from `clap` flags); this shape instead follows how `estuary-flow`-style pipeline
//! configs are structured, using `serde_yaml` since the wire format here is explicitly YAML.

use crate::error::{EngineError, EngineResult};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: String,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default = "default_maxlen")]
    pub maxlen: usize,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default)]
    pub reject_when_full: bool,
}

fn default_queue_backend() -> String {
    "memory".to_string()
}

fn default_maxlen() -> usize {
    100_000
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

impl Default for QueuesConfig {
    fn default() -> Self {
        QueuesConfig {
            backend: default_queue_backend(),
            max_size: None,
            maxlen: default_maxlen(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            reject_when_full: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MllpListenerConfig {
    pub bind: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Read buffer size per connection, bytes.
    #[serde(default = "default_mllp_buffer_size")]
    pub buffer_size: usize,
    /// Maximum concurrent MLLP connections this listener will accept.
    #[serde(default = "default_mllp_max_connections")]
    pub max_connections: usize,
    /// Framing mode for the wire protocol. Only `"mllp"` (VT ... FS CR) is implemented.
    #[serde(default = "default_mllp_framing")]
    pub framing: String,
}

fn default_mllp_buffer_size() -> usize {
    4096
}

fn default_mllp_max_connections() -> usize {
    10
}

fn default_mllp_framing() -> String {
    "mllp".to_string()
}

impl Default for MllpListenerConfig {
    fn default() -> Self {
        MllpListenerConfig {
            bind: String::new(),
            name: None,
            buffer_size: default_mllp_buffer_size(),
            max_connections: default_mllp_max_connections(),
            framing: default_mllp_framing(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileWatcherConfig {
    pub directory: String,
    #[serde(default = "default_glob")]
    pub glob: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_glob() -> String {
    "*".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpIngestConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InboundConfig {
    #[serde(default)]
    pub mllp: Vec<MllpListenerConfig>,
    #[serde(default)]
    pub file_watchers: Vec<FileWatcherConfig>,
    #[serde(default)]
    pub http: Option<HttpIngestConfig>,
}

/// Common `{enabled, input_queue, output_queue, error_queue}` shape shared by the validation,
/// transformation and routing stages (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct StageIoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub input_queue: String,
    #[serde(default)]
    pub output_queue: Option<String>,
    pub error_queue: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

impl Default for StageIoConfig {
    fn default() -> Self {
        StageIoConfig {
            enabled: true,
            input_queue: String::new(),
            output_queue: None,
            error_queue: String::new(),
            max_retries: default_max_retries(),
        }
    }
}

/// One `processing.routing.routes[]` entry (§3 `RouteRule`, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConditionConfig {
    pub field_path: String,
    pub operator: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteActionConfig {
    Forward { target_queue: String },
    Transform { rule_name: String },
    Drop,
    Log { level: String, message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRuleConfig {
    pub name: String,
    #[serde(default = "default_route_priority")]
    pub priority: u32,
    #[serde(default)]
    pub conditions: Vec<RouteConditionConfig>,
    pub actions: Vec<RouteActionConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_route_priority() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingStageConfig {
    #[serde(flatten)]
    pub io: StageIoConfig,
    #[serde(default)]
    pub routes: Vec<RouteRuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub validation: Option<StageIoConfig>,
    #[serde(default)]
    pub transformation: Option<StageIoConfig>,
    #[serde(default)]
    pub routing: Option<RoutingStageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MllpSenderConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub input_queue: String,
    pub error_queue: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirSenderConfig {
    pub name: String,
    pub base_url: String,
    pub input_queue: String,
    pub error_queue: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSenderConfig {
    pub name: String,
    pub directory: String,
    pub input_queue: String,
    pub error_queue: String,
    #[serde(default)]
    pub create_subdirs: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutboundConfig {
    #[serde(default)]
    pub mllp: Vec<MllpSenderConfig>,
    #[serde(default)]
    pub fhir: Vec<FhirSenderConfig>,
    #[serde(default)]
    pub file: Vec<FileSenderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub facility_id: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            log_level: default_log_level(),
            environment: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            facility_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub environments: HashMap<String, Value>,
}

impl EngineConfig {
    /// Loads the base config from `path`, then merges the named environment overlay (if any) on
    /// top of it, replacing each top-level section the overlay names.
    pub fn load(path: &Path, environment: Option<&str>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::internal(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw, environment)
    }

    pub fn from_yaml_str(raw: &str, environment: Option<&str>) -> EngineResult<Self> {
        let mut base: Value = serde_yaml::from_str(raw)?;
        if let (Some(env_name), Value::Mapping(ref mut map)) = (environment, &mut base) {
            let overlay = map
                .get("environments")
                .and_then(|envs| envs.get(env_name))
                .cloned();
            if let Some(Value::Mapping(overlay_map)) = overlay {
                for (section, value) in overlay_map {
                    map.insert(section, value);
                }
            }
        }
        let config: EngineConfig = serde_yaml::from_value(base)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let yaml = r#"
inbound:
  mllp:
    - bind: "0.0.0.0:2575"
"#;
        let cfg = EngineConfig::from_yaml_str(yaml, None).unwrap();
        assert_eq!(cfg.queues.backend, "memory");
        assert_eq!(cfg.inbound.mllp.len(), 1);
        assert_eq!(cfg.inbound.mllp[0].bind, "0.0.0.0:2575");
    }

    #[test]
    fn environment_overlay_replaces_section() {
        let yaml = r#"
global:
  log_level: info
environments:
  production:
    global:
      log_level: warn
"#;
        let cfg = EngineConfig::from_yaml_str(yaml, Some("production")).unwrap();
        assert_eq!(cfg.global.log_level, "warn");

        let cfg_default = EngineConfig::from_yaml_str(yaml, None).unwrap();
        assert_eq!(cfg_default.global.log_level, "info");
    }

    #[test]
    fn unknown_environment_is_ignored() {
        let yaml = r#"
global:
  log_level: info
"#;
        let cfg = EngineConfig::from_yaml_str(yaml, Some("staging")).unwrap();
        assert_eq!(cfg.global.log_level, "info");
    }
}
