//! Deferred execution through Slurm.
//!
//! Neither executor here runs anything. Submitted commands are collected in
//! order and, when a session ends cleanly, written out as a command list plus
//! the scripts `sbatch` needs to run them:
//!
//! - [`SlurmExecutor`]: a job array, one array task per command line.
//! - [`PreallocatedSlurmExecutor`]: one allocation of `ntasks` ranks, each
//!   working through every `ntasks`-th command via a generated runner.
//!
//! Artifacts are never written after a failed session, and an existing file
//! is never overwritten.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::{ExecutorConfig, PreallocatedSlurmConfig, SlurmConfig};
use crate::error::{DispatchError, Result};
use crate::events::EventBus;
use crate::executor::{mismatch, Executor, ExecutorCore, ExecutorKind};
use crate::scheduler::{Job, JobStatus};

const ARRAY_LOG: &str = "slurm-log/slurm-%A_%a.out";
const ALLOCATION_LOG: &str = "slurm-log/slurm-%A.out";

/// Runner executed on every rank of a pre-allocated job.
///
/// Usage: `runner CMD_LIST [START] [END]`. Rank `r` of `N` runs the lines at
/// zero-based indices `START+r, START+r+N, ...` below `END`. An `END` past
/// the last line is clamped to the list length.
pub const RUNNER_SCRIPT: &str = r#"#!/bin/bash
set -u
cmd_list="$1"
mapfile -t commands < "$cmd_list"
start="${2:-0}"
end="${3:-${#commands[@]}}"
if (( end > ${#commands[@]} )); then
    end=${#commands[@]}
fi
rank="${SLURM_PROCID:-0}"
ntasks="${SLURM_NTASKS:-1}"
for ((i = start + rank; i < end; i += ntasks)); do
    eval "${commands[$i]}"
done
"#;

/// Quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

fn header(script: &mut String, batch_name: &str, hold: bool) {
    script.push_str("#!/bin/bash\n");
    if hold {
        script.push_str("#SBATCH --hold\n");
    }
    script.push_str(&format!("#SBATCH --job-name={}\n", batch_name));
}

/// Batch array script: task `i` evaluates line `i` of the command list.
pub fn array_script(config: &SlurmConfig, count: usize) -> String {
    let mut script = String::new();
    header(&mut script, &config.batch_name, config.hold);
    script.push_str("#SBATCH --ntasks=1\n");
    script.push_str("#SBATCH --cpus-per-task=1\n");
    script.push_str(&format!("#SBATCH --array=1-{}\n", count));
    script.push_str(&format!("#SBATCH --output={}\n", ARRAY_LOG));
    script.push_str(&format!(
        "command=$(sed \"${{SLURM_ARRAY_TASK_ID}}q;d\" {})\n",
        quote_path(&config.cmd_list_path)
    ));
    script.push_str("eval \"$command\"\n");
    script
}

/// Batch script launching the runner once across all ranks of the allocation.
pub fn allocation_script(config: &PreallocatedSlurmConfig) -> String {
    let mut script = String::new();
    header(&mut script, &config.slurm.batch_name, config.slurm.hold);
    script.push_str(&format!("#SBATCH --ntasks={}\n", config.ntasks));
    script.push_str("#SBATCH --cpus-per-task=1\n");
    script.push_str(&format!("#SBATCH --output={}\n", ALLOCATION_LOG));
    script.push_str(&format!(
        "srun --ntasks={} {} {}\n",
        config.ntasks,
        quote_path(&config.runner_script_path),
        quote_path(&config.slurm.cmd_list_path)
    ));
    script
}

/// Batch script that runs a worker loop against a scheduler service.
pub fn worker_batch_script(connect_uri: &str, api_key: &str, job_name: Option<&str>) -> String {
    let mut script = String::from("#!/bin/bash\n");
    if let Some(name) = job_name {
        script.push_str(&format!("#SBATCH --job-name={}\n", name));
    }
    script.push_str(&format!("#SBATCH --output={}\n", ALLOCATION_LOG));
    script.push_str(&format!(
        "srun bio-dispatch worker {} --api-key {}\n",
        shell_quote(connect_uri),
        shell_quote(api_key)
    ));
    script
}

/// Indices rank `rank` of `ntasks` runs within `[start, end)`.
pub fn stripe(start: usize, end: usize, rank: usize, ntasks: usize) -> impl Iterator<Item = usize> {
    (start + rank..end).step_by(ntasks.max(1))
}

fn ensure_absent(paths: &[&Path]) -> Result<()> {
    for path in paths {
        if path.exists() {
            return Err(DispatchError::ArtifactExists(path.to_path_buf()));
        }
    }
    Ok(())
}

/// Create `path` with `contents`, failing if it already exists. A file that
/// was created but could not be filled is removed again.
pub async fn write_new(path: &Path, contents: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => DispatchError::ArtifactExists(path.to_path_buf()),
            _ => DispatchError::Io(e),
        })?;
    let filled = async {
        file.write_all(contents.as_bytes()).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = filled {
        drop(file);
        remove_artifact(path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove partial artifact");
    }
}

/// One file of a session's output.
struct Artifact<'a> {
    path: &'a Path,
    contents: String,
    executable: bool,
}

impl<'a> Artifact<'a> {
    fn new(path: &'a Path, contents: impl Into<String>) -> Self {
        Self {
            path,
            contents: contents.into(),
            executable: false,
        }
    }

    fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    async fn write(&self) -> Result<()> {
        write_new(self.path, &self.contents).await?;
        if self.executable {
            let mode = std::fs::Permissions::from_mode(0o755);
            if let Err(e) = tokio::fs::set_permissions(self.path, mode).await {
                remove_artifact(self.path).await;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Write `artifacts` in order. If any write fails, the ones already written
/// are removed so a session leaves either every file or none.
async fn write_all(artifacts: &[Artifact<'_>]) -> Result<()> {
    for (i, artifact) in artifacts.iter().enumerate() {
        if let Err(e) = artifact.write().await {
            for written in artifacts[..i].iter().rev() {
                remove_artifact(written.path).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Ordered command lines collected during a session.
#[derive(Debug, Default)]
struct CommandList {
    lines: Vec<String>,
}

impl CommandList {
    fn push(&mut self, job: &Job) -> Result<()> {
        let line = job.command_line();
        if line.contains('\n') {
            return Err(DispatchError::InvalidCommand {
                job: job.name.clone(),
                reason: "command list entries must be a single line".to_string(),
            });
        }
        self.lines.push(line);
        Ok(())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

async fn accept(core: &ExecutorCore, commands: &mut CommandList, mut job: Job) -> Result<()> {
    core.ensure_running()?;
    commands.push(&job)?;
    job.mark_submitted()?;
    tracing::debug!(job = %job.name, index = commands.lines.len() - 1, "Command recorded");
    core.publish(JobStatus::Submitted, &job);
    Ok(())
}

pub struct SlurmExecutor {
    config: SlurmConfig,
    core: ExecutorCore,
    commands: CommandList,
}

pub(crate) fn factory(config: ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::Slurm(config) => Ok(Box::new(SlurmExecutor::new(config))),
        other => Err(mismatch(ExecutorKind::Slurm, other.kind())),
    }
}

impl SlurmExecutor {
    pub fn new(config: SlurmConfig) -> Self {
        Self {
            config,
            core: ExecutorCore::new(),
            commands: CommandList::default(),
        }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands.lines
    }

    async fn write_artifacts(&self) -> Result<()> {
        if self.commands.lines.is_empty() {
            tracing::warn!(batch = %self.config.batch_name, "No commands submitted, nothing written");
            return Ok(());
        }
        ensure_absent(&[
            self.config.cmd_list_path.as_path(),
            self.config.batch_script_path.as_path(),
        ])?;
        write_all(&[
            Artifact::new(&self.config.cmd_list_path, self.commands.render()),
            Artifact::new(
                &self.config.batch_script_path,
                array_script(&self.config, self.commands.lines.len()),
            ),
        ])
        .await?;
        tracing::info!(
            batch = %self.config.batch_name,
            commands = self.commands.lines.len(),
            script = %self.config.batch_script_path.display(),
            "Slurm array script written"
        );
        Ok(())
    }
}

#[async_trait]
impl Executor for SlurmExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Slurm
    }

    fn events(&self) -> &EventBus {
        self.core.events()
    }

    async fn start(&mut self) -> Result<()> {
        if self.core.start()? {
            self.commands = CommandList::default();
        }
        Ok(())
    }

    async fn submit(&mut self, job: Job) -> Result<()> {
        accept(&self.core, &mut self.commands, job).await
    }

    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()> {
        let cleanup = if error.is_some() {
            tracing::warn!(batch = %self.config.batch_name, "Session failed, Slurm artifacts not written");
            Ok(())
        } else if self.core.is_running() {
            self.write_artifacts().await
        } else {
            Ok(())
        };
        self.core.finish(error, cleanup).await
    }
}

pub struct PreallocatedSlurmExecutor {
    config: PreallocatedSlurmConfig,
    core: ExecutorCore,
    commands: CommandList,
}

pub(crate) fn preallocated_factory(config: ExecutorConfig) -> Result<Box<dyn Executor>> {
    match config {
        ExecutorConfig::PreallocatedSlurm(config) => {
            Ok(Box::new(PreallocatedSlurmExecutor::new(config)))
        }
        other => Err(mismatch(ExecutorKind::PreallocatedSlurm, other.kind())),
    }
}

impl PreallocatedSlurmExecutor {
    pub fn new(config: PreallocatedSlurmConfig) -> Self {
        Self {
            config,
            core: ExecutorCore::new(),
            commands: CommandList::default(),
        }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands.lines
    }

    async fn write_artifacts(&self) -> Result<()> {
        let slurm = &self.config.slurm;
        if self.commands.lines.is_empty() {
            tracing::warn!(batch = %slurm.batch_name, "No commands submitted, nothing written");
            return Ok(());
        }
        let runner = self.config.runner_script_path.as_path();
        ensure_absent(&[
            slurm.cmd_list_path.as_path(),
            runner,
            slurm.batch_script_path.as_path(),
        ])?;

        write_all(&[
            Artifact::new(&slurm.cmd_list_path, self.commands.render()),
            Artifact::new(runner, RUNNER_SCRIPT).executable(),
            Artifact::new(&slurm.batch_script_path, allocation_script(&self.config)),
        ])
        .await?;

        tracing::info!(
            batch = %slurm.batch_name,
            commands = self.commands.lines.len(),
            ntasks = self.config.ntasks,
            script = %slurm.batch_script_path.display(),
            "Slurm allocation script written"
        );
        Ok(())
    }
}

#[async_trait]
impl Executor for PreallocatedSlurmExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::PreallocatedSlurm
    }

    fn events(&self) -> &EventBus {
        self.core.events()
    }

    async fn start(&mut self) -> Result<()> {
        if self.core.start()? {
            self.commands = CommandList::default();
        }
        Ok(())
    }

    async fn submit(&mut self, job: Job) -> Result<()> {
        accept(&self.core, &mut self.commands, job).await
    }

    async fn stop(&mut self, error: Option<DispatchError>) -> Result<()> {
        let cleanup = if error.is_some() {
            tracing::warn!(batch = %self.config.slurm.batch_name, "Session failed, Slurm artifacts not written");
            Ok(())
        } else if self.core.is_running() {
            self.write_artifacts().await
        } else {
            Ok(())
        };
        self.core.finish(error, cleanup).await
    }
}
