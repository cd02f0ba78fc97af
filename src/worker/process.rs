use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::error::{DispatchError, Result};
use crate::scheduler::{CommandSpec, Job, StderrTarget};

/// Build the child process described by `job`.
///
/// Redirection rules:
/// - stdin: a `stdin` path wins; otherwise `stdin_str` is attached as a pipe;
///   otherwise stdin is closed.
/// - stdout/stderr: paths are created or truncated; a missing path discards
///   the stream. `StderrTarget::Stdout` shares stdout's destination.
fn build_command(job: &Job) -> Result<Command> {
    let invalid = |reason: &str| DispatchError::InvalidCommand {
        job: job.name.clone(),
        reason: reason.to_string(),
    };

    let mut cmd = match (&job.cmd, job.shell) {
        (CommandSpec::Line(line), _) if line.trim().is_empty() => {
            return Err(invalid("empty command line"));
        }
        (CommandSpec::Argv(argv), _) if argv.is_empty() => {
            return Err(invalid("empty argument vector"));
        }
        (spec, true) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(spec.to_line());
            cmd
        }
        (CommandSpec::Line(program), false) => Command::new(program),
        (CommandSpec::Argv(argv), false) => {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
    };

    if let Some(cwd) = &job.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &job.env {
        cmd.envs(env);
    }

    let spawn_err = |source| DispatchError::Spawn {
        job: job.name.clone(),
        source,
    };

    if let Some(path) = &job.stdin {
        cmd.stdin(Stdio::from(File::open(path).map_err(spawn_err)?));
    } else if job.stdin_str.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    let stdout = match &job.stdout {
        Some(path) => Some(File::create(path).map_err(spawn_err)?),
        None => None,
    };
    let stderr = match &job.stderr {
        Some(StderrTarget::File(path)) => Some(File::create(path).map_err(spawn_err)?),
        Some(StderrTarget::Stdout) => match &stdout {
            Some(file) => Some(file.try_clone().map_err(spawn_err)?),
            None => None,
        },
        None => None,
    };
    cmd.stdout(stdout.map_or_else(Stdio::null, Stdio::from));
    cmd.stderr(stderr.map_or_else(Stdio::null, Stdio::from));

    // Own process group: a Ctrl-C aimed at the dispatcher does not reach jobs.
    cmd.process_group(0);

    Ok(cmd)
}

/// Launch the job's process and move the job to `Started`.
pub fn launch(job: &mut Job) -> Result<Child> {
    let child = build_command(job)?.spawn().map_err(|source| DispatchError::Spawn {
        job: job.name.clone(),
        source,
    })?;
    job.mark_started(child.id())?;
    tracing::info!(job = %job.name, pid = ?job.pid, command = %job.cmd, "Job started");
    Ok(child)
}

/// Feed `stdin_str` if requested, wait for exit, and move the job to
/// `Completed` with its exit code. A process killed by signal `N` reports
/// exit code `-N`. If the exit status cannot be collected the job is still
/// completed, with no exit code, and the error is returned.
pub async fn wait(job: &mut Job, mut child: Child) -> Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        if let Some(text) = &job.stdin_str {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                // The process may exit without reading its input.
                tracing::warn!(job = %job.name, error = %e, "Failed to write stdin");
            }
        }
        drop(stdin);
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(source) => return Err(abandon(job, source)),
    };
    let exit_code = status.code().or_else(|| status.signal().map(|s| -s));
    job.mark_completed(exit_code)?;

    tracing::info!(job = %job.name, exit_code = ?exit_code, "Job completed");
    Ok(())
}

/// Close out a started job whose exit status was lost.
fn abandon(job: &mut Job, source: std::io::Error) -> DispatchError {
    tracing::error!(job = %job.name, pid = ?job.pid, error = %source, "Lost track of job process");
    if let Err(e) = job.mark_completed(None) {
        tracing::warn!(job = %job.name, error = %e, "Job left in {}", job.status);
    }
    DispatchError::Wait {
        job: job.name.clone(),
        source,
    }
}

/// Launch and wait in one step.
pub async fn run(job: &mut Job) -> Result<()> {
    let child = launch(job)?;
    wait(job, child).await
}
