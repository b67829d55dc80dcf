use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(name = "slipway", version)]
pub struct Args {
    /// Address to bind the control plane to
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub address: SocketAddr,

    /// Redis instance backing the log bus and the job queue
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Store dialect
    #[arg(long, env = "DATABASE_TYPE", value_enum, default_value = "sqlite")]
    pub database_type: DatabaseType,

    /// PostgreSQL connection string (postgresql dialect only)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Path to the sqlite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "./db/deployments.db")]
    pub database_path: PathBuf,

    #[arg(long, env = "DB_POOL_MIN", default_value_t = 2)]
    pub db_pool_min: u32,

    #[arg(long, env = "DB_POOL_MAX", default_value_t = 10)]
    pub db_pool_max: u32,

    /// Docker daemon socket
    #[arg(long, default_value = "/var/run/docker.sock")]
    pub docker_socket: String,

    /// Allowed CORS origins, comma separated
    #[arg(long, env = "CORS_ORIGINS", default_value = "http://localhost:5173")]
    pub cors_origins: String,

    /// Memory limit applied to deployment containers
    #[arg(long, env = "CONTAINER_MEMORY_LIMIT", default_value = "512m")]
    pub container_memory_limit: String,

    /// CPU limit applied to deployment containers, in cores
    #[arg(long, env = "CONTAINER_CPU_LIMIT", default_value_t = 0.5)]
    pub container_cpu_limit: f64,

    /// Public address used when building direct URLs
    #[arg(long, env = "PUBLIC_IP", default_value = "localhost")]
    pub public_ip: String,

    /// Host at which mapped container ports are reachable from the proxy
    #[arg(long, env = "ENGINE_HOST", default_value = "localhost")]
    pub engine_host: String,

    /// Number of jobs a worker process runs concurrently
    #[arg(long, env = "WORKER_COUNT", default_value_t = 4)]
    pub workers: usize,

    /// Directory holding per-deployment build contexts
    #[arg(long, default_value = "./deployments")]
    pub deployments_dir: PathBuf,

    /// Directory holding in-flight uploaded archives
    #[arg(long, default_value = "./uploads")]
    pub uploads_dir: PathBuf,

    /// Secret used to derive session cookie values
    #[arg(long, env = "SESSION_SECRET", default_value = "change_this_secret_in_production")]
    pub session_secret: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    Sqlite,
    Postgresql,
}
