// Handles all store interactions for both supported dialects. PostgreSQL gets
// JSON columns and a sized connection pool; SQLite gets JSON strings in a
// file-backed database. Every write is a single-statement upsert keyed by id.

pub mod deployment;
pub mod state;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::info;

use crate::args::{Args, DatabaseType};
use crate::error::{Error, Result};
pub use deployment::{
    CustomDomain, DeployConfig, Deployment, DeploymentKind, DeploymentVersion, EnvVar,
    MetricSample, Runtime, Source, MAX_RETAINED_VERSIONS,
};
pub use state::Status;

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

#[derive(Clone)]
enum Db {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl Persistence {
    /// Connects to the configured store and creates all tables and indexes.
    /// New connections should be made by cloning [`Persistence`] rather than
    /// calling this again.
    pub async fn init(args: &Args) -> Result<Self> {
        let db = match args.database_type {
            DatabaseType::Postgresql => {
                let url = args.database_url.as_deref().ok_or_else(|| {
                    Error::Database(sqlx::Error::Configuration(
                        "DATABASE_URL is required for the postgresql dialect".into(),
                    ))
                })?;
                let pool = PgPoolOptions::new()
                    .min_connections(args.db_pool_min)
                    .max_connections(args.db_pool_max)
                    .connect(url)
                    .await?;
                info!(
                    min = args.db_pool_min,
                    max = args.db_pool_max,
                    "postgresql connection pool initialized"
                );
                Db::Postgres(pool)
            }
            DatabaseType::Sqlite => {
                if let Some(parent) = args.database_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(&args.database_path)
                    .create_if_missing(true);
                let pool = SqlitePool::connect_with(options).await?;
                info!(path = %args.database_path.display(), "sqlite database initialized");
                Db::Sqlite(pool)
            }
        };

        let me = Self { db };
        me.create_tables().await?;
        Ok(me)
    }

    #[cfg(test)]
    async fn new_in_memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let me = Self {
            db: Db::Sqlite(pool),
        };
        me.create_tables().await.unwrap();
        me
    }

    pub fn dialect(&self) -> &'static str {
        match self.db {
            Db::Sqlite(_) => "sqlite",
            Db::Postgres(_) => "postgresql",
        }
    }

    async fn create_tables(&self) -> Result<()> {
        let statements: &[&str] = match &self.db {
            Db::Sqlite(_) => &[
                "CREATE TABLE IF NOT EXISTS deployments (
                    id TEXT PRIMARY KEY,
                    project_name TEXT,
                    deployment_type TEXT,
                    status TEXT,
                    url TEXT,
                    direct_url TEXT,
                    timestamp TEXT,
                    container_id TEXT,
                    host_port INTEGER,
                    source TEXT,
                    repo TEXT,
                    branch TEXT,
                    filename TEXT,
                    config TEXT,
                    env_vars TEXT,
                    version INTEGER,
                    custom_domain TEXT,
                    volume_path TEXT
                )",
                "CREATE TABLE IF NOT EXISTS deployment_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deployment_id TEXT,
                    version INTEGER,
                    container_id TEXT,
                    timestamp TEXT,
                    config TEXT,
                    status TEXT,
                    FOREIGN KEY(deployment_id) REFERENCES deployments(id)
                )",
                "CREATE TABLE IF NOT EXISTS custom_domains (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deployment_id TEXT,
                    domain TEXT UNIQUE,
                    cloudflare_zone_id TEXT,
                    status TEXT,
                    created_at TEXT,
                    FOREIGN KEY(deployment_id) REFERENCES deployments(id)
                )",
                "CREATE TABLE IF NOT EXISTS metrics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deployment_id TEXT,
                    timestamp TEXT,
                    cpu_percent REAL,
                    memory_mb REAL,
                    network_rx_mb REAL,
                    network_tx_mb REAL,
                    FOREIGN KEY(deployment_id) REFERENCES deployments(id)
                )",
                "CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status)",
                "CREATE INDEX IF NOT EXISTS idx_deployments_container ON deployments(container_id)",
                "CREATE INDEX IF NOT EXISTS idx_metrics_deployment ON metrics(deployment_id)",
                "CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp)",
            ],
            Db::Postgres(_) => &[
                "CREATE TABLE IF NOT EXISTS deployments (
                    id VARCHAR(255) PRIMARY KEY,
                    project_name TEXT,
                    deployment_type TEXT,
                    status TEXT,
                    url TEXT,
                    direct_url TEXT,
                    timestamp TIMESTAMPTZ,
                    container_id TEXT,
                    host_port BIGINT,
                    source TEXT,
                    repo TEXT,
                    branch TEXT,
                    filename TEXT,
                    config JSONB,
                    env_vars JSONB,
                    version BIGINT,
                    custom_domain JSONB,
                    volume_path TEXT
                )",
                "CREATE TABLE IF NOT EXISTS deployment_versions (
                    id SERIAL PRIMARY KEY,
                    deployment_id VARCHAR(255),
                    version BIGINT,
                    container_id TEXT,
                    timestamp TIMESTAMPTZ,
                    config JSONB,
                    status TEXT
                )",
                "CREATE TABLE IF NOT EXISTS custom_domains (
                    id SERIAL PRIMARY KEY,
                    deployment_id VARCHAR(255),
                    domain VARCHAR(255) UNIQUE,
                    cloudflare_zone_id TEXT,
                    status TEXT,
                    created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
                )",
                "CREATE TABLE IF NOT EXISTS metrics (
                    id SERIAL PRIMARY KEY,
                    deployment_id VARCHAR(255),
                    timestamp TIMESTAMPTZ,
                    cpu_percent DOUBLE PRECISION,
                    memory_mb DOUBLE PRECISION,
                    network_rx_mb DOUBLE PRECISION,
                    network_tx_mb DOUBLE PRECISION
                )",
                "CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status)",
                "CREATE INDEX IF NOT EXISTS idx_deployments_container ON deployments(container_id)",
                "CREATE INDEX IF NOT EXISTS idx_metrics_deployment ON metrics(deployment_id)",
                "CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp)",
            ],
        };

        for statement in statements {
            match &self.db {
                Db::Sqlite(pool) => {
                    sqlx::query(statement).execute(pool).await?;
                }
                Db::Postgres(pool) => {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO deployments
                     (id, project_name, deployment_type, status, url, direct_url, timestamp,
                      container_id, host_port, source, repo, branch, filename, config, env_vars,
                      version, custom_domain, volume_path)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&deployment.id)
                .bind(&deployment.project_name)
                .bind(deployment.deployment_type.to_string())
                .bind(deployment.status.to_string())
                .bind(&deployment.url)
                .bind(&deployment.direct_url)
                .bind(deployment.timestamp)
                .bind(&deployment.container_id)
                .bind(deployment.host_port.map(i64::from))
                .bind(deployment.source.to_string())
                .bind(&deployment.repo)
                .bind(&deployment.branch)
                .bind(&deployment.filename)
                .bind(Json(&deployment.config))
                .bind(Json(&deployment.environment_variables))
                .bind(deployment.version)
                .bind(deployment.custom_domain.as_ref().map(Json))
                .bind(&deployment.volume_path)
                .execute(pool)
                .await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO deployments
                     (id, project_name, deployment_type, status, url, direct_url, timestamp,
                      container_id, host_port, source, repo, branch, filename, config, env_vars,
                      version, custom_domain, volume_path)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                             $16, $17, $18)
                     ON CONFLICT (id) DO UPDATE SET
                        status = EXCLUDED.status,
                        url = EXCLUDED.url,
                        direct_url = EXCLUDED.direct_url,
                        timestamp = EXCLUDED.timestamp,
                        container_id = EXCLUDED.container_id,
                        host_port = EXCLUDED.host_port,
                        config = EXCLUDED.config,
                        env_vars = EXCLUDED.env_vars,
                        version = EXCLUDED.version,
                        custom_domain = EXCLUDED.custom_domain,
                        volume_path = EXCLUDED.volume_path",
                )
                .bind(&deployment.id)
                .bind(&deployment.project_name)
                .bind(deployment.deployment_type.to_string())
                .bind(deployment.status.to_string())
                .bind(&deployment.url)
                .bind(&deployment.direct_url)
                .bind(deployment.timestamp)
                .bind(&deployment.container_id)
                .bind(deployment.host_port.map(i64::from))
                .bind(deployment.source.to_string())
                .bind(&deployment.repo)
                .bind(&deployment.branch)
                .bind(&deployment.filename)
                .bind(Json(&deployment.config))
                .bind(Json(&deployment.environment_variables))
                .bind(deployment.version)
                .bind(deployment.custom_domain.as_ref().map(Json))
                .bind(&deployment.volume_path)
                .execute(pool)
                .await?;
            }
        }

        Ok(())
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let row: Option<DeploymentRow> = match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
            Db::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM deployments WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
        };

        Ok(row.map(Into::into))
    }

    pub async fn get_all_deployments(&self) -> Result<Vec<Deployment>> {
        let rows: Vec<DeploymentRow> = match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM deployments ORDER BY timestamp DESC")
                    .fetch_all(pool)
                    .await?
            }
            Db::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM deployments ORDER BY timestamp DESC")
                    .fetch_all(pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Removes the deployment and every dependent row. Container and volume
    /// teardown is the caller's business.
    pub async fn delete_deployment(&self, id: &str) -> Result<()> {
        let statements = [
            ("DELETE FROM metrics WHERE deployment_id = ?", "DELETE FROM metrics WHERE deployment_id = $1"),
            ("DELETE FROM deployment_versions WHERE deployment_id = ?", "DELETE FROM deployment_versions WHERE deployment_id = $1"),
            ("DELETE FROM custom_domains WHERE deployment_id = ?", "DELETE FROM custom_domains WHERE deployment_id = $1"),
            ("DELETE FROM deployments WHERE id = ?", "DELETE FROM deployments WHERE id = $1"),
        ];

        for (sqlite_sql, pg_sql) in statements {
            match &self.db {
                Db::Sqlite(pool) => {
                    sqlx::query(sqlite_sql).bind(id).execute(pool).await?;
                }
                Db::Postgres(pool) => {
                    sqlx::query(pg_sql).bind(id).execute(pool).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn insert_version(&self, version: &DeploymentVersion) -> Result<()> {
        match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO deployment_versions
                     (deployment_id, version, container_id, timestamp, config, status)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&version.deployment_id)
                .bind(version.version)
                .bind(&version.container_id)
                .bind(version.timestamp)
                .bind(Json(&version.config))
                .bind(&version.status)
                .execute(pool)
                .await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO deployment_versions
                     (deployment_id, version, container_id, timestamp, config, status)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&version.deployment_id)
                .bind(version.version)
                .bind(&version.container_id)
                .bind(version.timestamp)
                .bind(Json(&version.config))
                .bind(&version.status)
                .execute(pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Versions, most recent first.
    pub async fn get_versions(&self, deployment_id: &str) -> Result<Vec<DeploymentVersion>> {
        let rows: Vec<VersionRow> = match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT * FROM deployment_versions WHERE deployment_id = ?
                     ORDER BY version DESC",
                )
                .bind(deployment_id)
                .fetch_all(pool)
                .await?
            }
            Db::Postgres(pool) => {
                sqlx::query_as(
                    "SELECT * FROM deployment_versions WHERE deployment_id = $1
                     ORDER BY version DESC",
                )
                .bind(deployment_id)
                .fetch_all(pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn delete_version(&self, deployment_id: &str, version: i64) -> Result<()> {
        match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query(
                    "DELETE FROM deployment_versions WHERE deployment_id = ? AND version = ?",
                )
                .bind(deployment_id)
                .bind(version)
                .execute(pool)
                .await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(
                    "DELETE FROM deployment_versions WHERE deployment_id = $1 AND version = $2",
                )
                .bind(deployment_id)
                .bind(version)
                .execute(pool)
                .await?;
            }
        }

        Ok(())
    }

    /// The version number the next successful rollout should get.
    pub async fn next_version(&self, deployment_id: &str) -> Result<i64> {
        let max: Option<i64> = match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query_scalar(
                    "SELECT MAX(version) FROM deployment_versions WHERE deployment_id = ?",
                )
                .bind(deployment_id)
                .fetch_one(pool)
                .await?
            }
            Db::Postgres(pool) => {
                sqlx::query_scalar(
                    "SELECT MAX(version) FROM deployment_versions WHERE deployment_id = $1",
                )
                .bind(deployment_id)
                .fetch_one(pool)
                .await?
            }
        };

        Ok(max.unwrap_or(0) + 1)
    }

    pub async fn insert_metric(&self, deployment_id: &str, sample: &MetricSample) -> Result<()> {
        match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO metrics
                     (deployment_id, timestamp, cpu_percent, memory_mb, network_rx_mb, network_tx_mb)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(deployment_id)
                .bind(sample.timestamp)
                .bind(sample.cpu_percent)
                .bind(sample.memory_mb)
                .bind(sample.network_rx_mb)
                .bind(sample.network_tx_mb)
                .execute(pool)
                .await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO metrics
                     (deployment_id, timestamp, cpu_percent, memory_mb, network_rx_mb, network_tx_mb)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(deployment_id)
                .bind(sample.timestamp)
                .bind(sample.cpu_percent)
                .bind(sample.memory_mb)
                .bind(sample.network_rx_mb)
                .bind(sample.network_tx_mb)
                .execute(pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Most-recent samples, capped at one per minute of the requested window.
    pub async fn get_metrics(&self, deployment_id: &str, hours: i64) -> Result<Vec<MetricSample>> {
        let limit = hours * 60;
        let rows: Vec<MetricRow> = match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT timestamp, cpu_percent, memory_mb, network_rx_mb, network_tx_mb
                     FROM metrics WHERE deployment_id = ?
                     ORDER BY timestamp DESC LIMIT ?",
                )
                .bind(deployment_id)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
            Db::Postgres(pool) => {
                sqlx::query_as(
                    "SELECT timestamp, cpu_percent, memory_mb, network_rx_mb, network_tx_mb
                     FROM metrics WHERE deployment_id = $1
                     AND timestamp >= NOW() - ($2::double precision * INTERVAL '1 hour')
                     ORDER BY timestamp DESC LIMIT $3",
                )
                .bind(deployment_id)
                .bind(hours)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn insert_custom_domain(
        &self,
        deployment_id: &str,
        domain: &str,
        zone_id: &str,
    ) -> Result<()> {
        match &self.db {
            Db::Sqlite(pool) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO custom_domains
                     (deployment_id, domain, cloudflare_zone_id, status, created_at)
                     VALUES (?, ?, ?, 'active', ?)",
                )
                .bind(deployment_id)
                .bind(domain)
                .bind(zone_id)
                .bind(Utc::now())
                .execute(pool)
                .await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO custom_domains
                     (deployment_id, domain, cloudflare_zone_id, status)
                     VALUES ($1, $2, $3, 'active')
                     ON CONFLICT (domain) DO UPDATE SET
                        deployment_id = EXCLUDED.deployment_id,
                        cloudflare_zone_id = EXCLUDED.cloudflare_zone_id,
                        status = EXCLUDED.status",
                )
                .bind(deployment_id)
                .bind(domain)
                .bind(zone_id)
                .execute(pool)
                .await?;
            }
        }

        Ok(())
    }
}

#[derive(FromRow)]
struct DeploymentRow {
    id: String,
    project_name: String,
    deployment_type: String,
    status: String,
    url: String,
    direct_url: Option<String>,
    timestamp: DateTime<Utc>,
    container_id: Option<String>,
    host_port: Option<i64>,
    source: String,
    repo: Option<String>,
    branch: Option<String>,
    filename: Option<String>,
    config: Json<DeployConfig>,
    env_vars: Json<Vec<EnvVar>>,
    version: i64,
    custom_domain: Option<Json<CustomDomain>>,
    volume_path: Option<String>,
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Self {
            id: row.id,
            project_name: row.project_name,
            deployment_type: row.deployment_type.parse().unwrap_or(DeploymentKind::Service),
            status: row.status.parse().unwrap_or_default(),
            url: row.url,
            direct_url: row.direct_url,
            timestamp: row.timestamp,
            container_id: row.container_id,
            host_port: row.host_port.and_then(|port| u16::try_from(port).ok()),
            source: row.source.parse().unwrap_or(Source::UploadedArchive),
            repo: row.repo,
            branch: row.branch,
            filename: row.filename,
            config: row.config.0,
            environment_variables: row.env_vars.0,
            version: row.version,
            custom_domain: row.custom_domain.map(|domain| domain.0),
            volume_path: row.volume_path,
        }
    }
}

#[derive(FromRow)]
struct VersionRow {
    deployment_id: String,
    version: i64,
    container_id: Option<String>,
    timestamp: DateTime<Utc>,
    config: Json<DeployConfig>,
    status: String,
}

impl From<VersionRow> for DeploymentVersion {
    fn from(row: VersionRow) -> Self {
        Self {
            deployment_id: row.deployment_id,
            version: row.version,
            container_id: row.container_id,
            timestamp: row.timestamp,
            config: row.config.0,
            status: row.status,
        }
    }
}

#[derive(FromRow)]
struct MetricRow {
    timestamp: DateTime<Utc>,
    cpu_percent: f64,
    memory_mb: f64,
    network_rx_mb: f64,
    network_tx_mb: f64,
}

impl From<MetricRow> for MetricSample {
    fn from(row: MetricRow) -> Self {
        Self {
            timestamp: row.timestamp,
            cpu_percent: row.cpu_percent,
            memory_mb: row.memory_mb,
            network_rx_mb: row.network_rx_mb,
            network_tx_mb: row.network_tx_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_deployment(id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            project_name: "demo".to_string(),
            deployment_type: DeploymentKind::Service,
            status: Status::Queued,
            url: format!("/deploy/{id}/"),
            direct_url: None,
            timestamp: Utc::now(),
            container_id: None,
            host_port: None,
            source: Source::RemoteRepo,
            repo: Some("https://github.com/example/demo".to_string()),
            branch: Some("main".to_string()),
            filename: None,
            config: DeployConfig {
                runtime: Some(Runtime::Python),
                port: Some(5000),
                ..Default::default()
            },
            environment_variables: vec![EnvVar {
                key: "SECRET".to_string(),
                value: "value".to_string(),
            }],
            version: 1,
            custom_domain: None,
            volume_path: None,
        }
    }

    #[tokio::test]
    async fn deployment_round_trip() {
        let p = Persistence::new_in_memory().await;
        let mut deployment = sample_deployment("abc12345");

        p.save_deployment(&deployment).await.unwrap();
        let fetched = p.get_deployment("abc12345").await.unwrap().unwrap();
        assert_eq!(fetched.config.runtime, Some(Runtime::Python));
        assert_eq!(fetched.environment_variables, deployment.environment_variables);
        assert_eq!(fetched.status, Status::Queued);

        deployment.status = Status::Active;
        deployment.container_id = Some("c0ffee".to_string());
        deployment.host_port = Some(32768);
        p.save_deployment(&deployment).await.unwrap();

        let fetched = p.get_deployment("abc12345").await.unwrap().unwrap();
        assert_eq!(fetched.status, Status::Active);
        assert_eq!(fetched.host_port, Some(32768));

        assert!(p.get_deployment("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn versions_are_ordered_and_counted() {
        let p = Persistence::new_in_memory().await;
        p.save_deployment(&sample_deployment("dep1")).await.unwrap();

        assert_eq!(p.next_version("dep1").await.unwrap(), 1);

        for n in 1..=3 {
            p.insert_version(&DeploymentVersion {
                deployment_id: "dep1".to_string(),
                version: n,
                container_id: Some(format!("container-{n}")),
                timestamp: Utc::now(),
                config: DeployConfig::default(),
                status: "previous".to_string(),
            })
            .await
            .unwrap();
        }

        let versions = p.get_versions("dep1").await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
        assert_eq!(p.next_version("dep1").await.unwrap(), 4);

        p.delete_version("dep1", 1).await.unwrap();
        assert_eq!(p.get_versions("dep1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_cascades() {
        let p = Persistence::new_in_memory().await;
        p.save_deployment(&sample_deployment("gone")).await.unwrap();
        p.insert_version(&DeploymentVersion {
            deployment_id: "gone".to_string(),
            version: 1,
            container_id: None,
            timestamp: Utc::now(),
            config: DeployConfig::default(),
            status: "previous".to_string(),
        })
        .await
        .unwrap();
        p.insert_metric(
            "gone",
            &MetricSample {
                timestamp: Utc::now(),
                cpu_percent: 1.0,
                memory_mb: 2.0,
                network_rx_mb: 0.0,
                network_tx_mb: 0.0,
            },
        )
        .await
        .unwrap();

        p.delete_deployment("gone").await.unwrap();
        assert!(p.get_deployment("gone").await.unwrap().is_none());
        assert!(p.get_versions("gone").await.unwrap().is_empty());
        assert!(p.get_metrics("gone", 24).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metrics_limit_applies() {
        let p = Persistence::new_in_memory().await;
        for _ in 0..70 {
            p.insert_metric(
                "busy",
                &MetricSample {
                    timestamp: Utc::now(),
                    cpu_percent: 10.0,
                    memory_mb: 100.0,
                    network_rx_mb: 0.5,
                    network_tx_mb: 0.25,
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(p.get_metrics("busy", 1).await.unwrap().len(), 60);
    }
}
