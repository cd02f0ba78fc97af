use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use futures::FutureExt;
use tempfile::{tempdir, TempDir};

use bio_dispatch::config::{ExecutorConfig, PreallocatedSlurmConfig, SlurmConfig};
use bio_dispatch::executor::{
    run_session, Executor, ExecutorRegistry, PreallocatedSlurmExecutor, SlurmExecutor,
};
use bio_dispatch::scheduler::{Job, JobStatus};
use bio_dispatch::DispatchError;

fn slurm_config(dir: &TempDir) -> SlurmConfig {
    SlurmConfig::new(
        "assembly",
        dir.path().join("batch.sh"),
        dir.path().join("commands.txt"),
    )
}

fn prealloc_config(dir: &TempDir, ntasks: usize) -> PreallocatedSlurmConfig {
    PreallocatedSlurmConfig::new(slurm_config(dir), dir.path().join("runner.sh"), ntasks)
}

async fn submit_all(executor: &mut dyn Executor, jobs: Vec<Job>) -> bio_dispatch::Result<()> {
    run_session(executor, |ex| {
        async move {
            for job in jobs {
                ex.submit(job).await?;
            }
            Ok(())
        }
        .boxed()
    })
    .await
}

fn numbered(count: usize) -> Vec<Job> {
    (0..count)
        .map(|i| Job::shell(format!("cmd{i}"), format!("echo {i}")))
        .collect()
}

#[tokio::test]
async fn test_array_script_matches_command_count() {
    let dir = tempdir().unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir));

    let jobs = vec![
        Job::shell("one", "cmd1 --in a"),
        Job::exec("two", ["cmd2", "--in", "b"]),
        Job::shell("three", "cmd3 | gzip > c.gz"),
    ];
    submit_all(&mut executor, jobs).await.unwrap();

    let commands = std::fs::read_to_string(dir.path().join("commands.txt")).unwrap();
    assert_eq!(
        commands.lines().collect::<Vec<_>>(),
        vec!["cmd1 --in a", "cmd2 --in b", "cmd3 | gzip > c.gz"]
    );

    let script = std::fs::read_to_string(dir.path().join("batch.sh")).unwrap();
    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains("#SBATCH --job-name=assembly\n"));
    assert!(script.contains("#SBATCH --array=1-3\n"));
    assert!(script.contains("#SBATCH --ntasks=1\n"));
    assert!(script.contains("#SBATCH --cpus-per-task=1\n"));
    assert!(script.contains("#SBATCH --output=slurm-log/slurm-%A_%a.out\n"));
    assert!(script.contains("SLURM_ARRAY_TASK_ID"));
    assert!(!script.contains("--hold"));
}

#[tokio::test]
async fn test_slurm_events_stop_at_submitted() {
    let dir = tempdir().unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir));

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    for status in [JobStatus::Submitted, JobStatus::Queued, JobStatus::Completed] {
        let seen = seen.clone();
        executor.events().subscribe(status, move |job| {
            seen.lock().unwrap().push((status, job.name.clone()));
            Ok(())
        });
    }

    submit_all(&mut executor, numbered(2)).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (JobStatus::Submitted, "cmd0".to_string()),
            (JobStatus::Submitted, "cmd1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_hold_flag_is_first_directive() {
    let dir = tempdir().unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir).with_hold(true));
    submit_all(&mut executor, numbered(1)).await.unwrap();

    let script = std::fs::read_to_string(dir.path().join("batch.sh")).unwrap();
    let first_directive = script.lines().find(|l| l.starts_with("#SBATCH")).unwrap();
    assert_eq!(first_directive, "#SBATCH --hold");
}

#[tokio::test]
async fn test_session_error_writes_nothing() {
    let dir = tempdir().unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir));

    let err = run_session(&mut executor, |ex| {
        async move {
            ex.submit(Job::shell("a", "echo a")).await?;
            ex.submit(Job::shell("b", "echo b")).await?;
            Err::<(), _>(DispatchError::Internal("pipeline broke".to_string()))
        }
        .boxed()
    })
    .await
    .unwrap_err();

    assert_eq!(err.to_string(), "pipeline broke");
    assert!(!dir.path().join("commands.txt").exists());
    assert!(!dir.path().join("batch.sh").exists());
}

#[tokio::test]
async fn test_existing_artifact_is_not_overwritten() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("batch.sh"), "previous run\n").unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir));

    let err = submit_all(&mut executor, numbered(2)).await.unwrap_err();
    match err {
        DispatchError::ArtifactExists(path) => assert_eq!(path, dir.path().join("batch.sh")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        std::fs::read_to_string(dir.path().join("batch.sh")).unwrap(),
        "previous run\n"
    );
    assert!(!dir.path().join("commands.txt").exists());
}

#[tokio::test]
async fn test_failed_batch_write_removes_command_list() {
    let dir = tempdir().unwrap();
    let config = SlurmConfig::new(
        "assembly",
        dir.path().join("missing").join("batch.sh"),
        dir.path().join("commands.txt"),
    );
    let mut executor = SlurmExecutor::new(config);

    let err = submit_all(&mut executor, numbered(2)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Io(_)), "{err}");
    assert!(!dir.path().join("commands.txt").exists());
}

#[tokio::test]
async fn test_failed_allocation_write_removes_earlier_artifacts() {
    let dir = tempdir().unwrap();
    let slurm = SlurmConfig::new(
        "assembly",
        dir.path().join("missing").join("batch.sh"),
        dir.path().join("commands.txt"),
    );
    let config = PreallocatedSlurmConfig::new(slurm, dir.path().join("runner.sh"), 2);
    let mut executor = PreallocatedSlurmExecutor::new(config);

    let err = submit_all(&mut executor, numbered(3)).await.unwrap_err();
    assert!(matches!(err, DispatchError::Io(_)), "{err}");
    assert!(!dir.path().join("commands.txt").exists());
    assert!(!dir.path().join("runner.sh").exists());
}

#[tokio::test]
async fn test_empty_session_writes_nothing() {
    let dir = tempdir().unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir));
    submit_all(&mut executor, Vec::new()).await.unwrap();
    assert!(!dir.path().join("batch.sh").exists());
}

#[tokio::test]
async fn test_multiline_command_is_rejected() {
    let dir = tempdir().unwrap();
    let mut executor = SlurmExecutor::new(slurm_config(&dir));
    let err = submit_all(&mut executor, vec![Job::shell("multi", "echo a\necho b")])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidCommand { .. }));
    assert!(!dir.path().join("commands.txt").exists());
}

#[tokio::test]
async fn test_preallocated_artifacts() {
    let dir = tempdir().unwrap();
    let mut executor = PreallocatedSlurmExecutor::new(prealloc_config(&dir, 2));
    submit_all(&mut executor, numbered(5)).await.unwrap();

    let runner = dir.path().join("runner.sh");
    let mode = std::fs::metadata(&runner).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "runner must be executable");

    let script = std::fs::read_to_string(dir.path().join("batch.sh")).unwrap();
    assert!(script.contains("#SBATCH --ntasks=2\n"));
    assert!(script.contains("#SBATCH --output=slurm-log/slurm-%A.out\n"));
    assert!(script.contains("srun --ntasks=2"));
    assert!(!script.contains("--array"));

    let commands = std::fs::read_to_string(dir.path().join("commands.txt")).unwrap();
    assert_eq!(commands.lines().count(), 5);
}

async fn run_rank(runner: &Path, commands: &Path, rank: usize, ntasks: usize, range: &[&str]) -> String {
    let output = tokio::process::Command::new("bash")
        .arg(runner)
        .arg(commands)
        .args(range)
        .env("SLURM_PROCID", rank.to_string())
        .env("SLURM_NTASKS", ntasks.to_string())
        .output()
        .await
        .unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap()
}

#[tokio::test]
async fn test_runner_stripes_commands_across_ranks() {
    let dir = tempdir().unwrap();
    let mut executor = PreallocatedSlurmExecutor::new(prealloc_config(&dir, 2));
    submit_all(&mut executor, numbered(5)).await.unwrap();

    let runner = dir.path().join("runner.sh");
    let commands = dir.path().join("commands.txt");

    assert_eq!(run_rank(&runner, &commands, 0, 2, &[]).await, "0\n2\n4\n");
    assert_eq!(run_rank(&runner, &commands, 1, 2, &[]).await, "1\n3\n");

    // a [start, end) slice offsets every rank
    assert_eq!(run_rank(&runner, &commands, 0, 2, &["1", "4"]).await, "1\n3\n");
    assert_eq!(run_rank(&runner, &commands, 1, 2, &["1", "4"]).await, "2\n");

    // an end past the last line is clamped instead of failing on an unset index
    assert_eq!(run_rank(&runner, &commands, 0, 2, &["0", "9"]).await, "0\n2\n4\n");
    assert_eq!(run_rank(&runner, &commands, 1, 2, &["0", "9"]).await, "1\n3\n");
}

#[tokio::test]
async fn test_registry_builds_slurm_executors() {
    let dir = tempdir().unwrap();
    let registry = ExecutorRegistry::with_defaults();

    let mut plain = registry
        .create(ExecutorConfig::Slurm(slurm_config(&dir)))
        .unwrap();
    submit_all(plain.as_mut(), numbered(1)).await.unwrap();
    assert!(dir.path().join("batch.sh").exists());

    let other = tempdir().unwrap();
    let prealloc = registry
        .create(ExecutorConfig::PreallocatedSlurm(prealloc_config(&other, 3)))
        .unwrap();
    assert_eq!(prealloc.kind().to_string(), "preallocated-slurm");
}
