pub mod args;
pub mod deployment;
pub mod detector;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod logbus;
pub mod persistence;
pub mod queue;
pub mod recipe;
pub mod source;

pub use error::{Error, Result};

use std::net::SocketAddr;

use tracing::info;

use args::Args;
use deployment::Executor;
use engine::{Engine, EngineSettings};
use handlers::ApiSettings;
use logbus::LogBus;
use persistence::Persistence;
use queue::JobQueue;

/// Connects the three external collaborators every process needs: the
/// container engine, the store, and redis (log bus + job queue). Failing any
/// of them aborts start-up.
async fn assemble(args: &Args) -> anyhow::Result<(Engine, Persistence, LogBus, JobQueue)> {
    for dir in [&args.deployments_dir, &args.uploads_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let engine = Engine::connect(
        &args.docker_socket,
        EngineSettings::new(&args.container_memory_limit, args.container_cpu_limit),
    )
    .await?;

    let persistence = Persistence::init(args).await?;

    let client = redis::Client::open(args.redis_url.as_str())?;
    let redis = client.get_connection_manager().await?;
    info!(redis = %args.redis_url, "connected to redis");

    Ok((
        engine,
        persistence,
        LogBus::new(redis.clone()),
        JobQueue::new(redis),
    ))
}

/// Control plane: the HTTP surface, SSE streaming, and the reverse proxy.
/// Only enqueues work; the containers are built and started by the worker
/// processes.
pub async fn start(args: Args) -> anyhow::Result<()> {
    let (engine, persistence, bus, queue) = assemble(&args).await?;

    let settings = ApiSettings {
        public_ip: args.public_ip.clone(),
        engine_host: args.engine_host.clone(),
        deployments_dir: args.deployments_dir.clone(),
        uploads_dir: args.uploads_dir.clone(),
    };

    let router = handlers::make_router(
        persistence,
        engine,
        bus,
        queue,
        settings,
        &args.cors_origins,
    );

    info!(address = %args.address, "control plane listening");
    axum::Server::bind(&args.address)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}

/// Worker pool: consumes deployment jobs until the process is killed.
pub async fn start_workers(args: Args) -> anyhow::Result<()> {
    let (engine, persistence, bus, queue) = assemble(&args).await?;

    let executor = Executor {
        engine,
        persistence,
        bus,
        queue,
        public_ip: args.public_ip.clone(),
    };

    deployment::worker_pool(args.workers, executor).await;

    Ok(())
}
