//! Thin capability layer over the local Docker daemon: build an image from a
//! build context, run a container with ports/env/volumes/labels/limits,
//! inspect, read logs and stats, stop, remove, and manage named volumes.
//! Everything above this module speaks in recipes and container ids, never in
//! raw daemon types (stats excepted, which go out verbatim).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{ContainerSummary, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::recipe::Recipe;

const CPU_PERIOD: i64 = 100_000;

#[derive(Clone)]
pub struct Engine {
    docker: Docker,
    settings: EngineSettings,
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub memory_limit_bytes: i64,
    pub cpu_quota: i64,
}

impl EngineSettings {
    pub fn new(memory_limit: &str, cpu_limit: f64) -> Self {
        Self {
            memory_limit_bytes: parse_memory_limit(memory_limit),
            cpu_quota: (cpu_limit * CPU_PERIOD as f64) as i64,
        }
    }
}

/// "512m"-style limits into bytes; an unparsable limit falls back to 512 MiB.
fn parse_memory_limit(limit: &str) -> i64 {
    const DEFAULT: i64 = 512 * 1024 * 1024;

    let limit = limit.trim().to_lowercase();
    let (digits, unit) = limit.split_at(
        limit
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(limit.len()),
    );
    let Ok(value) = digits.parse::<i64>() else {
        return DEFAULT;
    };

    match unit {
        "k" | "kb" => value * 1024,
        "m" | "mb" => value * 1024 * 1024,
        "g" | "gb" => value * 1024 * 1024 * 1024,
        "" | "b" => value,
        _ => DEFAULT,
    }
}

impl Engine {
    /// Connects over the unix socket, falling back to the environment
    /// defaults the way the docker CLI does. Fails hard when neither answers;
    /// a control plane without an engine is useless.
    pub async fn connect(socket: &str, settings: EngineSettings) -> Result<Self> {
        let via_socket = match Docker::connect_with_unix(socket, 60, API_DEFAULT_VERSION) {
            Ok(docker) => match docker.ping().await {
                Ok(_) => Some(docker),
                Err(error) => {
                    warn!(%error, "socket connection failed, trying environment");
                    None
                }
            },
            Err(error) => {
                warn!(%error, "socket connection failed, trying environment");
                None
            }
        };

        let docker = match via_socket {
            Some(docker) => docker,
            None => {
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|error| Error::EngineUnavailable(error.to_string()))?;
                docker
                    .ping()
                    .await
                    .map_err(|error| Error::EngineUnavailable(error.to_string()))?;
                docker
            }
        };

        info!("connected to the container engine");
        Ok(Self { docker, settings })
    }

    pub async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Pre-build cleanup: a stale container with the derived name or a stale
    /// image with the tag would make the build or run step fail, so both go.
    /// Missing or in-use resources are not an error here.
    pub async fn prepare_build(&self, container_name: &str, tag: &str) {
        if let Err(error) = self
            .docker
            .stop_container(container_name, Some(StopContainerOptions { t: 5 }))
            .await
        {
            debug!(%error, container_name, "no old container to stop");
        }
        if let Err(error) = self
            .docker
            .remove_container(
                container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(%error, container_name, "no old container to remove");
        }
        if let Err(error) = self
            .docker
            .remove_image(
                tag,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
        {
            debug!(%error, tag, "no old image to remove");
        }
    }

    /// Builds the context directory into an image tagged `tag`, forwarding
    /// each build output line over `lines`. An error record in the stream is
    /// fatal.
    pub async fn build(
        &self,
        context: &Path,
        ignore: &[String],
        tag: &str,
        lines: UnboundedSender<String>,
    ) -> Result<()> {
        let dir = context.to_path_buf();
        let patterns = ignore.to_vec();
        let tarball = tokio::task::spawn_blocking(move || tar_context(&dir, &patterns))
            .await
            .map_err(|error| Error::Build(error.to_string()))??;

        let options = BuildImageOptions::<String> {
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(hyper::Body::from(tarball)));

        while let Some(item) = stream.next().await {
            let record = item.map_err(|error| Error::Build(error.to_string()))?;

            if let Some(error) = record.error {
                let _ = lines.send(error.clone());
                return Err(Error::Build(error));
            }
            if let Some(line) = record.stream {
                let line = line.trim();
                if !line.is_empty() {
                    let _ = lines.send(line.to_string());
                }
            }
        }

        Ok(())
    }

    /// Creates and starts a container for the recipe. The host port is left
    /// to the engine: an empty binding publishes onto an ephemeral port.
    pub async fn run(&self, recipe: &Recipe) -> Result<String> {
        let port_key = format!("{}/tcp", recipe.container_port);

        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(String::new()),
            }]),
        )]);

        let restart_policy = recipe.auto_restart.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        });

        let binds = recipe
            .volume
            .as_ref()
            .map(|mount| vec![format!("{}:{}", mount.name, mount.bind)]);

        let config = Config {
            image: Some(recipe.image_tag.clone()),
            env: Some(recipe.env_list()),
            labels: Some(recipe.labels.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                restart_policy,
                binds,
                memory: Some(self.settings.memory_limit_bytes),
                cpu_period: Some(CPU_PERIOD),
                cpu_quota: Some(self.settings.cpu_quota),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: recipe.container_name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(created.id)
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Engine-reported state string (`running`, `exited`, ...), or None when
    /// the container no longer exists.
    pub async fn status(&self, container_id: &str) -> Result<Option<String>> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(inspection) => Ok(inspection
                .state
                .and_then(|state| state.status)
                .map(|status| status.to_string())),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn is_running(&self, container_id: &str) -> Result<bool> {
        Ok(self.status(container_id).await?.as_deref() == Some("running"))
    }

    /// The host port the engine mapped the container port onto.
    pub async fn host_port(&self, container_id: &str, container_port: u16) -> Result<Option<u16>> {
        let inspection = self.docker.inspect_container(container_id, None).await?;

        let port = inspection
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&format!("{container_port}/tcp")).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|host_port| host_port.parse().ok());

        Ok(port)
    }

    /// First published host port, whatever the container-side port is. Used
    /// where the original container port is not at hand, e.g. reactivating a
    /// rolled-back container.
    pub async fn first_host_port(&self, container_id: &str) -> Result<Option<u16>> {
        let inspection = self.docker.inspect_container(container_id, None).await?;

        let port = inspection
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| {
                ports
                    .into_values()
                    .flatten()
                    .flatten()
                    .find_map(|binding| binding.host_port)
            })
            .and_then(|host_port| host_port.parse().ok());

        Ok(port)
    }

    pub async fn logs(&self, container_id: &str, tail: u32) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }

        Ok(output)
    }

    pub async fn stats(&self, container_id: &str) -> Result<Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        self.docker
            .stats(container_id, Some(options))
            .next()
            .await
            .ok_or_else(|| Error::EngineUnavailable("engine returned no stats".to_string()))?
            .map_err(Into::into)
    }

    pub async fn stop(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    pub async fn restart(&self, container_id: &str, timeout_secs: isize) -> Result<()> {
        self.docker
            .restart_container(
                container_id,
                Some(RestartContainerOptions { t: timeout_secs }),
            )
            .await?;
        Ok(())
    }

    pub async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Stop-then-remove; a vanished container counts as done. Used by delete
    /// and version eviction, where leftovers matter more than errors.
    pub async fn stop_and_remove(&self, container_id: &str) -> bool {
        if let Err(error) = self.stop(container_id, 10).await {
            debug!(%error, container_id, "stop failed, removing anyway");
        }
        match self.remove(container_id).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, container_id, "failed to remove container");
                false
            }
        }
    }

    pub async fn ensure_volume(&self, name: &str) -> Result<()> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => {
                self.docker
                    .create_volume(CreateVolumeOptions {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    /// All containers carrying `label`, running or not.
    pub async fn list(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };

        Ok(self.docker.list_containers(Some(options)).await?)
    }

    /// Removes exited containers carrying `label`; returns how many went.
    pub async fn prune_exited(&self, label: &str) -> Result<usize> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([
                ("status".to_string(), vec!["exited".to_string()]),
                ("label".to_string(), vec![label.to_string()]),
            ]),
            ..Default::default()
        };

        let mut removed = 0;
        for container in self.docker.list_containers(Some(options)).await? {
            if let Some(id) = container.id {
                if self.remove(&id).await.is_ok() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

fn is_not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Packs the build context into an in-memory tar, leaving out everything the
/// ignore manifest names. The daemon receives exactly this archive; there is
/// no client-side dockerignore pass beyond it.
fn tar_context(dir: &Path, ignore: &[String]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, dir, Path::new(""), ignore)?;
    builder.into_inner().map_err(Error::from)
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    rel: &Path,
    ignore: &[String],
) -> io::Result<()> {
    for entry in fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let rel_path = rel.join(entry.file_name());
        let path = entry.path();

        if is_ignored(&rel_path, ignore) {
            continue;
        }

        if path.is_dir() {
            builder.append_dir(&rel_path, &path)?;
            append_dir(builder, root, &rel_path, ignore)?;
        } else if path.is_file() {
            builder.append_path_with_name(&path, &rel_path)?;
        }
    }

    Ok(())
}

fn is_ignored(rel: &Path, patterns: &[String]) -> bool {
    let first_component = rel
        .components()
        .next()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = rel
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    patterns.iter().any(|pattern| {
        if let Some(dir) = pattern.strip_suffix('/') {
            first_component == dir
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            file_name.ends_with(suffix)
        } else {
            first_component == *pattern || file_name == *pattern
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn memory_limits_parse() {
        assert_eq!(parse_memory_limit("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256MB"), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024"), 1024);
        assert_eq!(parse_memory_limit("garbage"), 512 * 1024 * 1024);
    }

    #[test]
    fn ignore_patterns_match() {
        let patterns: Vec<String> = ["node_modules/", "*.log", ".env", ".git/"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert!(is_ignored(Path::new("node_modules"), &patterns));
        assert!(is_ignored(Path::new("node_modules/lodash/index.js"), &patterns));
        assert!(is_ignored(Path::new("debug.log"), &patterns));
        assert!(is_ignored(Path::new("logs/app.log"), &patterns));
        assert!(is_ignored(Path::new(".env"), &patterns));
        assert!(!is_ignored(Path::new("src/main.js"), &patterns));
        assert!(!is_ignored(Path::new("environment.js"), &patterns));
    }

    #[test]
    fn tar_context_excludes_ignored_trees() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/lodash")).unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("src/index.js"), "console.log(1)").unwrap();
        fs::write(dir.path().join("node_modules/lodash/index.js"), "x").unwrap();

        let tarball = tar_context(dir.path(), &["node_modules/".to_string()]).unwrap();

        let mut archive = tar::Archive::new(tarball.as_slice());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
            let mut content = String::new();
            // Entries must be readable end to end.
            let _ = entry.take(1024).read_to_string(&mut content);
        }

        assert!(names.contains(&"package.json".to_string()));
        assert!(names.contains(&"src/index.js".to_string()));
        assert!(!names.iter().any(|name| name.contains("node_modules")));
    }
}
