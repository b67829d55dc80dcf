//! The worker-side routine that turns a queued deployment into a running
//! container: synthesize the recipe, write the build context, build the
//! image, start the container, watch it through its probe window, then record
//! the final state. Every failure ends as an `error` plus a terminal
//! `done success=false` on the log bus and a `failed` record; nothing
//! propagates past [`Executor::execute`].

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{instrument, warn};

use crate::detector::ProjectDetector;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::logbus::{LogBus, LogEvent};
use crate::persistence::{
    DeploymentKind, DeploymentVersion, Persistence, Status, MAX_RETAINED_VERSIONS,
};
use crate::queue::{DeployJob, JobQueue, JobResult};
use crate::recipe::{self, Recipe};

#[derive(Clone)]
pub struct Executor {
    pub engine: Engine,
    pub persistence: Persistence,
    pub bus: LogBus,
    pub queue: JobQueue,
    pub public_ip: String,
}

struct Rollout {
    container_id: String,
    host_port: u16,
}

impl Executor {
    #[instrument(skip_all, fields(deployment_id = %job.deployment_id, version = job.version))]
    pub async fn execute(&self, job: DeployJob) {
        let id = job.deployment_id.clone();

        let _ = self
            .bus
            .info(&id, format!("Worker picked up job for {id}"))
            .await;
        self.mark(&id, Status::Building).await;

        match self.rollout(&job).await {
            Ok(outcome) => self.succeed(&job, outcome).await,
            Err(error) => self.fail(&id, error.to_string()).await,
        }
    }

    /// Emitted by the pool when a job blows through its timeout; the future
    /// was cancelled, so the bus and record are settled from here.
    pub async fn job_timed_out(&self, deployment_id: &str) {
        warn!(deployment_id, "job timed out");
        self.fail(
            deployment_id,
            "Deployment timed out after 15 minutes".to_string(),
        )
        .await;
    }

    async fn rollout(&self, job: &DeployJob) -> Result<Rollout> {
        let id = &job.deployment_id;

        // Recipe synthesis only reads the tree, so it runs off the async
        // threads wholesale.
        let recipe = {
            let root = job.project_dir.clone();
            let config = job.config.clone();
            let kind = job.deployment_type;
            let deployment_id = id.clone();
            let version = job.version;

            tokio::task::spawn_blocking(move || -> Result<Recipe> {
                let detection = ProjectDetector::new(&root).detect();
                let runtime = config.runtime.unwrap_or(detection.runtime);
                recipe::synthesize(&root, kind, runtime, &config, &deployment_id, version)
            })
            .await
            .map_err(|error| Error::Build(error.to_string()))??
        };

        write_build_context(&job.project_dir, &recipe).await?;

        self.engine
            .prepare_build(&recipe.container_name, &recipe.image_tag)
            .await;

        self.bus.info(id, "Building Docker image...").await?;

        let (lines, mut sink) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn({
            let bus = self.bus.clone();
            let id = id.clone();
            async move {
                while let Some(line) = sink.recv().await {
                    let _ = bus.log(&id, line).await;
                }
            }
        });

        let built = self
            .engine
            .build(
                &job.project_dir,
                &recipe.ignore_patterns(),
                &recipe.image_tag,
                lines,
            )
            .await;
        let _ = forwarder.await;
        built?;

        self.bus.info(id, "Image built successfully").await?;

        if let Some(volume) = &recipe.volume {
            self.engine.ensure_volume(&volume.name).await?;
            self.bus
                .info(
                    id,
                    format!("Mounting named volume: {} -> {}", volume.name, volume.bind),
                )
                .await?;
        }

        self.bus.info(id, "Starting container...").await?;
        let container_id = self.engine.run(&recipe).await?;

        self.watch_startup(id, &container_id, recipe.startup_grace)
            .await?;

        let host_port = self
            .engine
            .host_port(&container_id, recipe.container_port)
            .await?
            .ok_or_else(|| Error::Run("engine reported no host port mapping".to_string()))?;

        if job.deployment_type == DeploymentKind::Service {
            if let Ok(tail) = self.engine.logs(&container_id, 10).await {
                self.bus.info(id, "Service startup logs:").await?;
                for line in tail.lines().filter(|line| !line.trim().is_empty()) {
                    self.bus.log(id, line).await?;
                }
            }
        }

        Ok(Rollout {
            container_id,
            host_port,
        })
    }

    /// Waits out the probe window. A container observed exited ends the wait
    /// early; one not running at the end of the window fails the rollout.
    /// Either way the last 100 log lines are drained to the bus and the
    /// container is removed on failure.
    async fn watch_startup(
        &self,
        deployment_id: &str,
        container_id: &str,
        grace: Duration,
    ) -> Result<()> {
        let seconds = grace.as_secs();
        self.bus
            .info(
                deployment_id,
                format!("Waiting for service to start ({seconds} seconds)..."),
            )
            .await?;

        let mut waited = Duration::ZERO;
        let status = loop {
            sleep(Duration::from_secs(1)).await;
            waited += Duration::from_secs(1);

            let status = self
                .engine
                .status(container_id)
                .await?
                .unwrap_or_else(|| "removed".to_string());

            if matches!(status.as_str(), "exited" | "dead" | "removed") || waited >= grace {
                break status;
            }
        };

        if status == "running" {
            return Ok(());
        }

        self.bus
            .error(deployment_id, format!("Container failed. Status: {status}"))
            .await?;
        if let Ok(tail) = self.engine.logs(container_id, 100).await {
            self.bus.info(deployment_id, "Container logs:").await?;
            for line in tail.lines().filter(|line| !line.trim().is_empty()) {
                self.bus.log(deployment_id, line).await?;
            }
        }
        let _ = self.engine.remove(container_id).await;

        Err(Error::Run(format!("Container exited with status: {status}")))
    }

    async fn succeed(&self, job: &DeployJob, outcome: Rollout) {
        let id = &job.deployment_id;
        let direct_url = format!("http://{}:{}", self.public_ip, outcome.host_port);

        if let Err(error) = self.record_success(job, &outcome, &direct_url).await {
            // The rollout itself is done; a bookkeeping failure is still a
            // failed deployment from the user's point of view.
            self.fail(id, error.to_string()).await;
            return;
        }

        let _ = self
            .bus
            .success(id, format!("Deployment successful! Live at: {direct_url}"))
            .await;
        let _ = self
            .bus
            .append(
                id,
                &LogEvent::done_success(json!({
                    "id": id,
                    "containerId": outcome.container_id,
                    "port": outcome.host_port,
                    "directUrl": direct_url,
                    "status": "active",
                })),
            )
            .await;
        let _ = self
            .queue
            .record_result(
                id,
                &JobResult {
                    success: true,
                    container_id: Some(outcome.container_id),
                    host_port: Some(outcome.host_port),
                    error: None,
                },
            )
            .await;
    }

    async fn record_success(
        &self,
        job: &DeployJob,
        outcome: &Rollout,
        direct_url: &str,
    ) -> Result<()> {
        let id = &job.deployment_id;
        let now = Utc::now();

        // The record can be gone when a delete raced the worker; that makes
        // the final update a no-op.
        let Some(mut deployment) = self.persistence.get_deployment(id).await? else {
            warn!(deployment_id = %id, "deployment record missing, skipping final update");
            return Ok(());
        };

        // On a redeploy the previous rollout's container stays around for
        // rollback, stopped.
        if let Some(previous) = deployment.container_id.clone() {
            if previous != outcome.container_id {
                if let Err(error) = self.engine.stop(&previous, 10).await {
                    warn!(%error, container_id = %previous, "failed to stop the previous rollout");
                }
            }
        }

        deployment.status = Status::Active;
        deployment.container_id = Some(outcome.container_id.clone());
        deployment.host_port = Some(outcome.host_port);
        deployment.direct_url = Some(direct_url.to_string());
        deployment.version = job.version;
        deployment.timestamp = now;
        self.persistence.save_deployment(&deployment).await?;

        self.persistence
            .insert_version(&DeploymentVersion {
                deployment_id: id.clone(),
                version: job.version,
                container_id: Some(outcome.container_id.clone()),
                timestamp: now,
                config: job.config.clone(),
                status: "previous".to_string(),
            })
            .await?;
        self.evict_old_versions(id).await?;

        Ok(())
    }

    /// Keeps the ten most recent versions; anything older loses its row and,
    /// best effort, its container.
    async fn evict_old_versions(&self, deployment_id: &str) -> Result<()> {
        let versions = self.persistence.get_versions(deployment_id).await?;

        for version in versions.iter().skip(MAX_RETAINED_VERSIONS) {
            if let Some(container_id) = &version.container_id {
                self.engine.stop_and_remove(container_id).await;
            }
            self.persistence
                .delete_version(deployment_id, version.version)
                .await?;
        }

        Ok(())
    }

    async fn fail(&self, deployment_id: &str, message: String) {
        let _ = self
            .bus
            .error(deployment_id, format!("Deployment failed: {message}"))
            .await;
        let _ = self
            .bus
            .append(deployment_id, &LogEvent::done_failure(&message))
            .await;
        self.mark(deployment_id, Status::Failed).await;
        let _ = self
            .queue
            .record_result(
                deployment_id,
                &JobResult {
                    success: false,
                    container_id: None,
                    host_port: None,
                    error: Some(message),
                },
            )
            .await;
    }

    async fn mark(&self, deployment_id: &str, status: Status) {
        match self.persistence.get_deployment(deployment_id).await {
            Ok(Some(mut deployment)) => {
                deployment.status = status;
                if let Err(error) = self.persistence.save_deployment(&deployment).await {
                    warn!(%error, deployment_id, "failed to update deployment status");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, deployment_id, "failed to load deployment"),
        }
    }
}

pub(crate) async fn write_build_context(root: &Path, recipe: &Recipe) -> Result<()> {
    tokio::fs::write(root.join("Dockerfile"), &recipe.dockerfile).await?;
    tokio::fs::write(root.join(".dockerignore"), &recipe.build_ignore).await?;

    for (rel_path, content) in &recipe.aux_files {
        let path = root.join(rel_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::persistence::DeployConfig;
    use crate::recipe::synthesize;

    use super::*;

    #[tokio::test]
    async fn build_context_is_materialized() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "django\ngunicorn\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("manage.py"),
            "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'myproj.settings')\n",
        )
        .unwrap();

        let recipe = synthesize(
            dir.path(),
            DeploymentKind::Service,
            crate::persistence::Runtime::Python,
            &DeployConfig::default(),
            "dep1",
            1,
        )
        .unwrap();

        write_build_context(dir.path(), &recipe).await.unwrap();

        assert!(dir.path().join("Dockerfile").exists());
        assert!(dir.path().join(".dockerignore").exists());
        assert!(dir.path().join("myproj/settings_local.py").exists());

        let dockerfile = std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap();
        assert!(dockerfile.starts_with("FROM python:3.11-slim"));
    }
}
