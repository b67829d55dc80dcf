use std::collections::BTreeMap;

use bollard::container::Stats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

use super::state::Status;

/// Where the source tree came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    RemoteRepo,
    UploadedArchive,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[default]
    Python,
    Nodejs,
    Java,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    Static,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDomain {
    pub domain: String,
    pub status: String,
}

/// Recognized deployment options. Anything the client sends beyond these is
/// dropped at the door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "port_lenient")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<String>,
    pub use_dev_mode: bool,
    pub persistent_storage: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    pub environment_variables: Vec<EnvVar>,
}

fn default_true() -> bool {
    true
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            entry_file: None,
            port: None,
            build_command: None,
            start_command: None,
            publish_dir: None,
            use_dev_mode: false,
            persistent_storage: false,
            volume_name: None,
            health_check_path: None,
            auto_restart: true,
            environment_variables: Vec::new(),
        }
    }
}

/// Frontends send ports both as numbers and as strings.
fn port_lenient<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u16),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
    })
}

impl DeployConfig {
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.environment_variables
            .iter()
            .filter(|var| !var.key.is_empty())
            .map(|var| (var.key.clone(), var.value.clone()))
            .collect()
    }

    pub fn has_env(&self, key: &str) -> bool {
        self.environment_variables.iter().any(|var| var.key == key)
    }
}

/// The root record: a submitted project plus its running container and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub project_name: String,
    pub deployment_type: DeploymentKind,
    pub status: Status,
    pub url: String,
    pub direct_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub container_id: Option<String>,
    #[serde(rename = "port")]
    pub host_port: Option<u16>,
    pub source: Source,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub filename: Option<String>,
    pub config: DeployConfig,
    pub environment_variables: Vec<EnvVar>,
    pub version: i64,
    pub custom_domain: Option<CustomDomain>,
    pub volume_path: Option<String>,
}

/// A prior rollout, retained for rollback. At most ten per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    pub deployment_id: String,
    pub version: i64,
    pub container_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub config: DeployConfig,
    pub status: String,
}

pub const MAX_RETAINED_VERSIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "memory")]
    pub memory_mb: f64,
    #[serde(rename = "networkRx")]
    pub network_rx_mb: f64,
    #[serde(rename = "networkTx")]
    pub network_tx_mb: f64,
}

impl MetricSample {
    /// Converts one engine-native stats snapshot into a sample. The first
    /// interface reported by the engine counts as the primary one.
    pub fn derive(stats: &Stats) -> Self {
        let (rx_bytes, tx_bytes) = stats
            .networks
            .as_ref()
            .and_then(|networks| {
                networks
                    .get("eth0")
                    .or_else(|| networks.values().next())
                    .map(|iface| (iface.rx_bytes, iface.tx_bytes))
            })
            .unwrap_or((0, 0));

        Self::compute(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage,
            stats.memory_stats.usage,
            rx_bytes,
            tx_bytes,
        )
    }

    fn compute(
        cpu_total: u64,
        system_cpu: Option<u64>,
        memory_usage: Option<u64>,
        rx_bytes: u64,
        tx_bytes: u64,
    ) -> Self {
        const MIB: f64 = 1024.0 * 1024.0;

        let cpu_percent = match system_cpu {
            Some(system) if system > 0 => cpu_total as f64 / system as f64 * 100.0,
            _ => 0.0,
        };

        Self {
            timestamp: Utc::now(),
            cpu_percent,
            memory_mb: memory_usage.unwrap_or(0) as f64 / MIB,
            network_rx_mb: rx_bytes as f64 / MIB,
            network_tx_mb: tx_bytes as f64 / MIB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_accepts_string_ports() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"port": "5000", "runtime": "python"}"#).unwrap();
        assert_eq!(config.port, Some(5000));
        assert_eq!(config.runtime, Some(Runtime::Python));
        assert!(config.auto_restart, "autoRestart defaults on");

        let config: DeployConfig = serde_json::from_str(r#"{"port": 3000}"#).unwrap();
        assert_eq!(config.port, Some(3000));
    }

    #[test]
    fn metric_derivation() {
        let sample = MetricSample::compute(
            50_000_000,
            Some(1_000_000_000),
            Some(256 * 1024 * 1024),
            1024 * 1024,
            2 * 1024 * 1024,
        );
        assert!((sample.cpu_percent - 5.0).abs() < f64::EPSILON);
        assert!((sample.memory_mb - 256.0).abs() < f64::EPSILON);
        assert!((sample.network_rx_mb - 1.0).abs() < f64::EPSILON);
        assert!((sample.network_tx_mb - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metric_derivation_handles_missing_counters() {
        let sample = MetricSample::compute(10, None, None, 0, 0);
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_mb, 0.0);
    }
}
