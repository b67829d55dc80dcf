//! Turns a project tree plus its deployment options into a container image
//! recipe: the Dockerfile text, auxiliary files to drop into the build
//! context, the ignore manifest, and the run-time settings (port, env,
//! labels, volume, restart policy). Synthesis only reads the tree; the
//! executor is the one that writes files and talks to the engine.

mod java;
mod node;
mod python;
mod static_site;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::error::Result;
use crate::persistence::{DeployConfig, DeploymentKind, Runtime};

pub const VOLUME_BIND_PATH: &str = "/app/data";
pub const PLATFORM_LABEL: (&str, &str) = ("app", "deployment-platform");

/// A synthesized image recipe plus everything needed to run the result.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub dockerfile: String,
    pub build_ignore: String,
    /// (path relative to the build context, contents)
    pub aux_files: Vec<(String, String)>,
    pub image_tag: String,
    pub container_name: String,
    pub container_port: u16,
    pub env: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    pub volume: Option<VolumeMount>,
    pub auto_restart: bool,
    /// How long the container gets to come up before the probe decides.
    pub startup_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub bind: String,
}

impl Recipe {
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    pub fn ignore_patterns(&self) -> Vec<String> {
        self.build_ignore
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }
}

pub fn synthesize(
    root: &Path,
    kind: DeploymentKind,
    runtime: Runtime,
    config: &DeployConfig,
    deployment_id: &str,
    version: i64,
) -> Result<Recipe> {
    match kind {
        DeploymentKind::Static => static_site::synthesize(root, config, deployment_id, version),
        DeploymentKind::Service => match runtime {
            Runtime::Java => java::synthesize(root, config, deployment_id, version),
            Runtime::Nodejs if config.use_dev_mode => {
                node::synthesize_dev(root, config, deployment_id, version)
            }
            Runtime::Nodejs => node::synthesize(root, config, deployment_id, version),
            // A service without a recognizable runtime gets the python path,
            // which degrades to `python <entry>`.
            Runtime::Python | Runtime::Static => {
                python::synthesize(root, config, deployment_id, version)
            }
        },
    }
}

/// Image tags and container names are deterministic per (deployment, version)
/// so stale resources can be cleaned up before a rebuild while earlier
/// rollouts stay around for rollback.
pub(crate) fn derive_name(prefix: &str, deployment_id: &str, version: i64) -> String {
    format!("{prefix}-{deployment_id}-v{version}")
}

pub(crate) fn labels_for(
    container_type: &str,
    runtime: Option<Runtime>,
    deployment_id: &str,
) -> HashMap<String, String> {
    let mut labels = HashMap::from([
        (PLATFORM_LABEL.0.to_string(), PLATFORM_LABEL.1.to_string()),
        ("type".to_string(), container_type.to_string()),
        ("deployment_id".to_string(), deployment_id.to_string()),
    ]);
    if let Some(runtime) = runtime {
        labels.insert("runtime".to_string(), runtime.to_string());
    }
    labels
}

pub(crate) fn volume_for(config: &DeployConfig, deployment_id: &str) -> Option<VolumeMount> {
    if !config.persistent_storage {
        return None;
    }

    let name = config
        .volume_name
        .clone()
        .unwrap_or_else(|| format!("persistent_data_{deployment_id}"));

    Some(VolumeMount {
        name,
        bind: VOLUME_BIND_PATH.to_string(),
    })
}

/// `npm install` alone trips over peer dependency conflicts often enough that
/// the platform opts every build into `--legacy-peer-deps`, unless the user
/// already took a side.
pub(crate) fn rewrite_npm_install(build_command: &str) -> String {
    if build_command.contains("npm install")
        && !build_command.contains("--legacy-peer-deps")
        && !build_command.contains("--force")
    {
        build_command.replace("npm install", "npm install --legacy-peer-deps")
    } else {
        build_command.to_string()
    }
}

/// Each `&&`-separated segment of the user's build command becomes one image
/// build step.
pub(crate) fn build_steps(build_command: &str) -> String {
    build_command
        .split("&&")
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(" && \\\n    ")
}

/// Minimal quote-aware splitter for turning a shell command line into an exec
/// form array. Quotes group words; there is no escape handling beyond that.
pub(crate) fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match (ch, quote) {
            (c, Some(q)) if c == q => quote = None,
            ('"', None) | ('\'', None) => quote = Some(ch),
            (c, None) if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
}

pub(crate) fn command_json_array(command: &str) -> String {
    let words = shell_words(command);
    let quoted: Vec<String> = words
        .iter()
        .map(|word| serde_json::to_string(word).expect("a plain string always encodes"))
        .collect();
    format!("[{}]", quoted.join(", "))
}

pub(crate) fn sh_command_json(script: &str) -> String {
    format!(
        "[\"sh\", \"-c\", {}]",
        serde_json::to_string(script).expect("a plain string always encodes")
    )
}

/// Shell prefix that loads a `.env` file before the real command, ignoring
/// comment lines.
pub(crate) const ENV_FILE_PREFIX: &str =
    "if [ -f .env ]; then export $(grep -v \"^#\" .env | xargs); fi; ";

/// Parses `engines.node` from package.json, strips comparator prefixes, takes
/// the first integer and snaps it onto a supported major.
pub(crate) fn node_version(root: &Path, default: u32) -> u32 {
    let Ok(text) = std::fs::read_to_string(root.join("package.json")) else {
        return default;
    };
    let Ok(package) = serde_json::from_str::<Value>(&text) else {
        return default;
    };
    let Some(requirement) = package
        .get("engines")
        .and_then(|engines| engines.get("node"))
        .and_then(Value::as_str)
    else {
        return default;
    };

    snap_node_version(requirement).unwrap_or(default)
}

pub(crate) fn snap_node_version(requirement: &str) -> Option<u32> {
    let cleaned: String = requirement
        .chars()
        .filter(|c| !matches!(c, '^' | '~' | '>' | '<' | '='))
        .collect();
    let digits: String = cleaned
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let major: u32 = digits.parse().ok()?;

    Some(match major {
        22.. => 22,
        20 | 21 => 20,
        18 | 19 => 18,
        16 | 17 => 16,
        _ => 18,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn npm_install_rewriting() {
        assert_eq!(
            rewrite_npm_install("npm install && npm run build"),
            "npm install --legacy-peer-deps && npm run build"
        );
        // The user already chose a conflict strategy.
        assert_eq!(
            rewrite_npm_install("npm install --force"),
            "npm install --force"
        );
        assert_eq!(
            rewrite_npm_install("npm install --legacy-peer-deps"),
            "npm install --legacy-peer-deps"
        );
        assert_eq!(rewrite_npm_install("yarn build"), "yarn build");
    }

    #[test]
    fn build_command_becomes_steps() {
        assert_eq!(
            build_steps("npm install && npm run build"),
            "npm install && \\\n    npm run build"
        );
        assert_eq!(build_steps("make"), "make");
    }

    #[test]
    fn shell_word_splitting() {
        assert_eq!(
            shell_words("gunicorn app:app --bind 0.0.0.0:5000"),
            vec!["gunicorn", "app:app", "--bind", "0.0.0.0:5000"]
        );
        assert_eq!(
            shell_words("echo \"hello world\" done"),
            vec!["echo", "hello world", "done"]
        );
    }

    #[test]
    fn command_arrays_are_valid_json() {
        let array = command_json_array("python manage.py runserver 0.0.0.0:8000");
        let parsed: Vec<String> = serde_json::from_str(&array).unwrap();
        assert_eq!(parsed[0], "python");
        assert_eq!(parsed.len(), 4);
    }

    #[test]
    fn node_version_snapping() {
        assert_eq!(snap_node_version(">=22"), Some(22));
        assert_eq!(snap_node_version("^20.10.0"), Some(20));
        assert_eq!(snap_node_version("~18.17"), Some(18));
        assert_eq!(snap_node_version("16"), Some(16));
        assert_eq!(snap_node_version("21"), Some(20));
        assert_eq!(snap_node_version("14"), Some(18));
        assert_eq!(snap_node_version("lts"), None);
    }

    #[test]
    fn volume_only_when_requested() {
        let config = DeployConfig::default();
        assert_eq!(volume_for(&config, "abc"), None);

        let config = DeployConfig {
            persistent_storage: true,
            ..Default::default()
        };
        let mount = volume_for(&config, "abc").unwrap();
        assert_eq!(mount.name, "persistent_data_abc");
        assert_eq!(mount.bind, "/app/data");

        let config = DeployConfig {
            persistent_storage: true,
            volume_name: Some("named".to_string()),
            ..Default::default()
        };
        assert_eq!(volume_for(&config, "abc").unwrap().name, "named");
    }

    #[test]
    fn derived_names_embed_the_version() {
        assert_eq!(derive_name("web", "abc123", 2), "web-abc123-v2");
    }
}
