//! Durable FIFO of deployment jobs over a redis list. The control plane only
//! enqueues; worker processes pop at the log bus cadence. Job results are
//! kept for a day, and each job runs under a hard timeout enforced by the
//! worker pool.

use std::path::PathBuf;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::persistence::{DeployConfig, DeploymentKind};

pub const JOB_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const RESULT_TTL_SECONDS: u64 = 86400;
const QUEUE_KEY: &str = "jobs:deployments";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployJob {
    pub deployment_id: String,
    pub project_dir: PathBuf,
    pub deployment_type: DeploymentKind,
    pub config: DeployConfig,
    /// Version number this rollout gets when it succeeds.
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct JobQueue {
    redis: ConnectionManager,
}

impl JobQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Pushes the job and reports its position in the queue.
    pub async fn enqueue(&self, job: &DeployJob) -> Result<i64> {
        let payload = serde_json::to_string(job)?;
        let mut redis = self.redis.clone();
        let position: i64 = redis.lpush(QUEUE_KEY, payload).await?;
        debug!(deployment_id = %job.deployment_id, position, "job enqueued");
        Ok(position)
    }

    /// Pops the oldest job, if any. A payload that no longer parses is
    /// dropped rather than wedging the queue.
    pub async fn dequeue(&self) -> Result<Option<DeployJob>> {
        let mut redis = self.redis.clone();
        let payload: Option<String> = redis.rpop(QUEUE_KEY, None).await?;

        match payload {
            None => Ok(None),
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(job) => Ok(Some(job)),
                Err(error) => {
                    tracing::warn!(%error, "discarding unparsable job payload");
                    Ok(None)
                }
            },
        }
    }

    pub async fn len(&self) -> Result<i64> {
        let mut redis = self.redis.clone();
        Ok(redis.llen(QUEUE_KEY).await?)
    }

    pub async fn record_result(&self, deployment_id: &str, result: &JobResult) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .set_ex(
                format!("job:{deployment_id}:result"),
                serde_json::to_string(result)?,
                RESULT_TTL_SECONDS,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_round_trip_through_json() {
        let job = DeployJob {
            deployment_id: "abc123".to_string(),
            project_dir: PathBuf::from("./deployments/abc123"),
            deployment_type: DeploymentKind::Service,
            config: DeployConfig {
                persistent_storage: true,
                ..Default::default()
            },
            version: 2,
        };

        let payload = serde_json::to_string(&job).unwrap();
        let parsed: DeployJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.deployment_id, "abc123");
        assert_eq!(parsed.version, 2);
        assert!(parsed.config.persistent_storage);
    }
}
