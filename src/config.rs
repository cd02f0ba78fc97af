use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::ExecutorKind;

/// Default timeout for every request to the scheduler service.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failed cycles after which a worker gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for running jobs as local child processes.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Maximum number of jobs running at once
    pub max_workers: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl LocalConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }
}

/// Configuration for the Slurm batch-array generator.
#[derive(Debug, Clone)]
pub struct SlurmConfig {
    /// Value of `--job-name`
    pub batch_name: String,
    /// Where the `sbatch` script is written
    pub batch_script_path: PathBuf,
    /// Where the newline-delimited command list is written
    pub cmd_list_path: PathBuf,
    /// Submit the array held (`#SBATCH --hold`)
    pub hold: bool,
}

impl SlurmConfig {
    pub fn new(
        batch_name: impl Into<String>,
        batch_script_path: impl Into<PathBuf>,
        cmd_list_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            batch_name: batch_name.into(),
            batch_script_path: batch_script_path.into(),
            cmd_list_path: cmd_list_path.into(),
            hold: false,
        }
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }
}

/// Configuration for running commands inside one persistent Slurm allocation.
///
/// The generated runner stripes the command list over `ntasks` ranks.
#[derive(Debug, Clone)]
pub struct PreallocatedSlurmConfig {
    pub slurm: SlurmConfig,
    /// Where the executable runner script is written
    pub runner_script_path: PathBuf,
    /// Number of parallel ranks in the allocation
    pub ntasks: usize,
}

impl PreallocatedSlurmConfig {
    pub fn new(slurm: SlurmConfig, runner_script_path: impl Into<PathBuf>, ntasks: usize) -> Self {
        Self {
            slurm,
            runner_script_path: runner_script_path.into(),
            ntasks: ntasks.max(1),
        }
    }
}

/// Configuration for pushing jobs to a remote scheduler service.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the scheduler service, e.g. `http://10.0.0.5:5000`
    pub connect_uri: String,
    /// Shared secret sent in the `X-API-KEY` header
    pub api_key: String,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(connect_uri: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            connect_uri: connect_uri.into(),
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Configuration for dumping submitted jobs as JSON lines.
#[derive(Debug, Clone)]
pub struct JsonLinesConfig {
    /// Output file; must not exist yet
    pub output_path: PathBuf,
}

impl JsonLinesConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

/// Backend selection. Each variant carries only what its executor needs.
#[derive(Debug, Clone)]
pub enum ExecutorConfig {
    Local(LocalConfig),
    Slurm(SlurmConfig),
    PreallocatedSlurm(PreallocatedSlurmConfig),
    Remote(RemoteConfig),
    Noop,
    JsonLines(JsonLinesConfig),
}

impl ExecutorConfig {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutorConfig::Local(_) => ExecutorKind::Local,
            ExecutorConfig::Slurm(_) => ExecutorKind::Slurm,
            ExecutorConfig::PreallocatedSlurm(_) => ExecutorKind::PreallocatedSlurm,
            ExecutorConfig::Remote(_) => ExecutorKind::Remote,
            ExecutorConfig::Noop => ExecutorKind::Noop,
            ExecutorConfig::JsonLines(_) => ExecutorKind::JsonLines,
        }
    }
}

/// Configuration for the scheduler HTTP service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub api_key: String,
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr, api_key: impl Into<String>) -> Self {
        Self {
            listen_addr,
            api_key: api_key.into(),
        }
    }
}

/// Configuration for a worker polling a scheduler service.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub remote: RemoteConfig,
    pub max_retries: u32,
}

impl WorkerConfig {
    pub fn new(remote: RemoteConfig) -> Self {
        Self {
            remote,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
