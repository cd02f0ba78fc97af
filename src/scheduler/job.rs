use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Lifecycle of a job.
///
/// The common path is `Pending -> Submitted -> Queued -> Started -> Completed`.
/// `Cancelled` is an alternate terminal state reachable from `Submitted` or
/// `Queued`. Backends differ in how far along the path they drive a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Submitted,
    Queued,
    Started,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Submitted, Queued)
                | (Submitted, Cancelled)
                | (Queued, Started)
                | (Queued, Cancelled)
                | (Started, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What to run: a single shell line or an argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Render as one shell line. Argument vectors are joined with spaces.
    pub fn to_line(&self) -> String {
        match self {
            CommandSpec::Line(line) => line.clone(),
            CommandSpec::Argv(args) => args.join(" "),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Marker that sends stderr to wherever stdout goes.
pub const STDERR_TO_STDOUT: &str = "STDOUT";

/// Where a job's stderr is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StderrTarget {
    Stdout,
    File(PathBuf),
}

impl From<String> for StderrTarget {
    fn from(value: String) -> Self {
        if value == STDERR_TO_STDOUT {
            StderrTarget::Stdout
        } else {
            StderrTarget::File(PathBuf::from(value))
        }
    }
}

impl From<StderrTarget> for String {
    fn from(value: StderrTarget) -> Self {
        match value {
            StderrTarget::Stdout => STDERR_TO_STDOUT.to_string(),
            StderrTarget::File(path) => path.to_string_lossy().into_owned(),
        }
    }
}

/// One command invocation plus its mutable lifecycle state.
///
/// `name` is a human-readable key; keeping it unique is up to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub cmd: CommandSpec,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<StderrTarget>,
    #[serde(default)]
    pub stdin_str: Option<String>,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub submitted_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub queued_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub end_time: Option<DateTime<Utc>>,
    /// Process id, set by backends that launch the job themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

fn default_status() -> JobStatus {
    JobStatus::Pending
}

/// Timestamps are written as RFC 3339 in UTC. On input a naive ISO 8601
/// date-time, without an offset, is read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        parse(&raw)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        raw.parse::<NaiveDateTime>()
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl Job {
    fn with_command(name: impl Into<String>, cmd: CommandSpec, shell: bool) -> Self {
        Self {
            name: name.into(),
            cmd,
            env: None,
            cwd: None,
            shell,
            stdin: None,
            stdout: None,
            stderr: None,
            stdin_str: None,
            status: JobStatus::Pending,
            exit_code: None,
            submitted_time: None,
            queued_time: None,
            start_time: None,
            end_time: None,
            pid: None,
        }
    }

    /// A job whose command line is interpreted by `sh -c`.
    pub fn shell(name: impl Into<String>, line: impl Into<String>) -> Self {
        Self::with_command(name, CommandSpec::Line(line.into()), true)
    }

    /// A job executed directly, without a shell.
    pub fn exec<I, S>(name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = argv.into_iter().map(Into::into).collect();
        Self::with_command(name, CommandSpec::Argv(argv), false)
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn with_stdin_str(mut self, text: impl Into<String>) -> Self {
        self.stdin_str = Some(text.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, target: StderrTarget) -> Self {
        self.stderr = Some(target);
        self
    }

    pub fn command_line(&self) -> String {
        self.cmd.to_line()
    }

    fn transition(&mut self, next: JobStatus) -> Result<DateTime<Utc>> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidTransition {
                job: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(Utc::now())
    }

    pub fn mark_submitted(&mut self) -> Result<()> {
        let now = self.transition(JobStatus::Submitted)?;
        self.submitted_time = Some(now);
        Ok(())
    }

    pub fn mark_queued(&mut self) -> Result<()> {
        let now = self.transition(JobStatus::Queued)?;
        self.queued_time = Some(now);
        Ok(())
    }

    pub fn mark_started(&mut self, pid: Option<u32>) -> Result<()> {
        let now = self.transition(JobStatus::Started)?;
        self.start_time = Some(now);
        self.pid = pid;
        Ok(())
    }

    pub fn mark_completed(&mut self, exit_code: Option<i32>) -> Result<()> {
        let now = self.transition(JobStatus::Completed)?;
        self.end_time = Some(now);
        self.exit_code = exit_code;
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<()> {
        let now = self.transition(JobStatus::Cancelled)?;
        self.end_time = Some(now);
        Ok(())
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
