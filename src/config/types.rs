use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration, loaded once at startup and immutable
/// afterwards. There is no live reload: every field is compiled into
/// runtime structures by `rules::compile` before the listener starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Free-form variables available to every template. Values may
    /// themselves be templates over environment variables; they are
    /// expanded once at load time.
    pub variables: HashMap<String, String>,

    pub network: NetworkConfig,

    /// Pipeline halves merged around every rule's own pipelines as
    /// `before + rule + after`.
    pub before: PipelinePairConfig,
    pub after: PipelinePairConfig,

    /// host → pattern → rule. Patterns may carry a `[method]` prefix.
    pub rules: HashMap<String, HashMap<String, RuleConfig>>,

    /// host → OpenAPI binding, translated into rules and merged into
    /// `rules` (explicit rules win on pattern collision).
    #[serde(rename = "openAPI")]
    pub open_api: HashMap<String, OpenApiConfig>,

    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub downstream: DownstreamConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownstreamConfig {
    pub port: u16,

    /// TLS material per SNI hostname. Empty means plain HTTP.
    pub tls: Vec<TlsEntry>,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            port: default_downstream_port(),
            tls: Vec::new(),
        }
    }
}

fn default_downstream_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsEntry {
    pub host: String,
    pub cert: String,
    pub key: String,
}

/// Knobs for the single shared upstream transport. Durations are
/// humantime strings (`30s`, `500ms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    pub timeout: String,
    pub keep_alive: String,
    pub max_idle_connections: usize,
    pub idle_connection_timeout: String,
    pub expect_continue_timeout: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: "30s".to_string(),
            keep_alive: "30s".to_string(),
            max_idle_connections: 100,
            idle_connection_timeout: "90s".to_string(),
            expect_continue_timeout: "1s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelinePairConfig {
    pub request: PipelineConfig,
    pub response: PipelineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub transformers: Vec<TransformerConfig>,
    pub sidecars: Vec<SidecarConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfig {
    pub origin: String,

    /// Path prefix removed before the origin path is prepended.
    pub strip_prefix: String,

    /// Methods accepted by this rule. Empty means all. Any listed method
    /// is accepted — the whole list is scanned.
    pub allowed_methods: Vec<String>,

    pub request: PipelineConfig,
    pub response: PipelineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformerConfig {
    pub id: String,
    pub activate_on_tags: Vec<String>,
    pub params: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarConfig {
    pub id: String,
    pub workers: usize,
    pub queue: usize,
    pub block: bool,
    pub drop_on_overflow: bool,
    pub activate_on_tags: Vec<String>,
    pub params: serde_yaml::Value,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            workers: default_sidecar_workers(),
            queue: default_sidecar_queue(),
            block: false,
            drop_on_overflow: false,
            activate_on_tags: Vec::new(),
            params: serde_yaml::Value::Null,
        }
    }
}

fn default_sidecar_workers() -> usize {
    1
}

fn default_sidecar_queue() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiConfig {
    pub file: String,
    #[serde(default)]
    pub server_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    /// Port for the metrics listener. 0 disables the listener; the
    /// registry itself is always installed.
    pub port: u16,
    pub path: String,
    pub namespace: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            port: 0,
            path: default_prometheus_path(),
            namespace: String::new(),
        }
    }
}

fn default_prometheus_path() -> String {
    "/metrics".to_string()
}

/// Separate logger configuration file (`-l`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    pub level: String,
    /// `JSON` or `simple`.
    pub format: String,
    /// Empty means stdout.
    pub path: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "JSON".to_string(),
            path: String::new(),
        }
    }
}
