use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bio_dispatch::config::{RemoteConfig, ServiceConfig, WorkerConfig, DEFAULT_MAX_RETRIES};
use bio_dispatch::executor::slurm::{worker_batch_script, write_new};
use bio_dispatch::scheduler::service::run_service;
use bio_dispatch::shutdown::install_shutdown_handler;
use bio_dispatch::worker::WorkerLoop;

#[derive(Parser, Debug)]
#[command(name = "bio-dispatch")]
#[command(version)]
#[command(about = "Dispatch shell-command jobs to local, Slurm, or remote workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler service that remote workers poll
    Serve(ServeArgs),

    /// Poll a scheduler service and run its jobs locally
    Worker(WorkerArgs),

    /// Write a Slurm batch script that launches workers under srun
    WorkerScript(WorkerScriptArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Shared secret expected in the X-API-KEY header
    #[arg(long, env = "BIO_DISPATCH_API_KEY")]
    api_key: String,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Scheduler service URI, e.g. http://10.0.0.1:5000
    connect_uri: String,

    /// Shared secret sent in the X-API-KEY header
    #[arg(long, env = "BIO_DISPATCH_API_KEY")]
    api_key: String,

    /// Consecutive failed cycles before the worker exits
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct WorkerScriptArgs {
    /// Scheduler service URI the workers connect to
    connect_uri: String,

    /// Shared secret embedded in the script
    #[arg(long, env = "BIO_DISPATCH_API_KEY")]
    api_key: String,

    /// Slurm job name
    #[arg(long)]
    job_name: Option<String>,

    /// Where to write the script; must not exist. Prints to stdout if omitted.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let shutdown = install_shutdown_handler();
    run_service(ServiceConfig::new(listen_addr, args.api_key), shutdown).await?;
    tracing::info!("Scheduler service stopped");
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let remote = RemoteConfig::new(args.connect_uri, args.api_key)
        .with_timeout(Duration::from_secs(args.timeout_secs));
    let config = WorkerConfig::new(remote).with_max_retries(args.max_retries);

    tracing::info!(
        scheduler = %config.remote.connect_uri,
        max_retries = config.max_retries,
        "Starting worker"
    );

    let shutdown = install_shutdown_handler();
    let completed = WorkerLoop::from_config(&config, shutdown)?.run().await?;
    tracing::info!(completed, "Worker finished");
    Ok(())
}

async fn run_worker_script(args: WorkerScriptArgs) -> Result<(), Box<dyn std::error::Error>> {
    let script = worker_batch_script(&args.connect_uri, &args.api_key, args.job_name.as_deref());
    match args.output {
        Some(path) => {
            write_new(&path, &script).await?;
            tracing::info!(path = %path.display(), "Wrote worker batch script");
        }
        None => print!("{}", script),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::WorkerScript(script_args) => run_worker_script(script_args).await?,
    }

    Ok(())
}
