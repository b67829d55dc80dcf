use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Log bus error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
    #[error("Cannot reach the container engine: {0}")]
    EngineUnavailable(String),
    #[error("Internal I/O error: {0}")]
    InputOutput(#[from] io::Error),
    #[error("Failed to fetch source: {0}")]
    SourceFetch(String),
    #[error("Bad archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Build failed: {0}")]
    Build(String),
    #[error("Run failed: {0}")]
    Run(String),
    #[error("Rollback failed: {0}")]
    Rollback(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Error {
    /// Stable tag used when surfacing errors over the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Redis(_) => "log_bus",
            Error::Engine(_) => "engine",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::InputOutput(_) => "io",
            Error::SourceFetch(_) => "source_fetch_failed",
            Error::Archive(_) => "bad_archive",
            Error::Build(_) => "build_failed",
            Error::Run(_) => "run_failed",
            Error::Rollback(_) => "rollback_failed",
            Error::Encoding(_) => "encoding",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
