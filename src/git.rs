use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::GitSettings;
use crate::github::RemoteRepo;

/// What a sync task does to its repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    /// Already present locally: `git pull` in place
    Update,
    /// Missing locally: `git clone` into the root
    Acquire,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKind::Update => write!(f, "pull"),
            SyncKind::Acquire => write!(f, "clone"),
        }
    }
}

/// One repository's unit of work, bounded by its own deadline
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub kind: SyncKind,
    pub repo: RemoteRepo,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// The per-repository deadline expired and the command was killed
    DeadlineExceeded,
    /// git ran and exited unsuccessfully
    Command { status: Option<i32>, stderr: String },
    /// git could not be started
    Spawn(String),
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncFailure::DeadlineExceeded => write!(f, "deadline exceeded"),
            SyncFailure::Command {
                status: Some(code),
                stderr,
            } => write!(f, "exit status {}: {}", code, stderr),
            SyncFailure::Command {
                status: None,
                stderr,
            } => write!(f, "terminated by signal: {}", stderr),
            SyncFailure::Spawn(msg) => write!(f, "failed to start git: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated,
    Acquired,
    Failed(SyncFailure),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::Failed(_))
    }
}

/// Result of a single sync task
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub name: String,
    pub kind: SyncKind,
    pub outcome: SyncOutcome,
    pub elapsed: Duration,
}

/// Performs the synchronization for a single repository
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn execute(&self, task: SyncTask) -> SyncReport;
}

/// Runs git as an external process against the local root
#[derive(Debug, Clone)]
pub struct GitExecutor {
    root: PathBuf,
    program: String,
    extra_args: Vec<String>,
}

impl GitExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_settings(root, &GitSettings::default())
    }

    pub fn with_settings(root: impl Into<PathBuf>, settings: &GitSettings) -> Self {
        Self {
            root: root.into(),
            program: settings.program.clone(),
            extra_args: settings.extra_args.clone(),
        }
    }

    /// Arguments passed to the git program for `task`
    pub fn command_args(&self, task: &SyncTask) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.extra_args.iter().map(OsString::from).collect();

        match task.kind {
            SyncKind::Update => {
                args.push("-C".into());
                args.push(self.root.join(&task.repo.name).into_os_string());
                args.push("pull".into());
            }
            SyncKind::Acquire => {
                args.push("-C".into());
                args.push(self.root.clone().into_os_string());
                args.push("clone".into());
                args.push(task.repo.ssh_url.clone().into());
            }
        }

        args
    }

    fn command(&self, task: &SyncTask) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(self.command_args(task))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SyncExecutor for GitExecutor {
    async fn execute(&self, task: SyncTask) -> SyncReport {
        let started = Instant::now();
        let name = task.repo.name.clone();

        debug!("Running git {} for {}", task.kind, name);

        // Dropping the timed-out future kills the child process
        let outcome = match timeout_at(task.deadline, self.command(&task).output()).await {
            Err(_) => {
                warn!("Deadline exceeded for repo {} during git {}", name, task.kind);
                SyncOutcome::Failed(SyncFailure::DeadlineExceeded)
            }
            Ok(Err(e)) => {
                error!("Failed to start git {} for {}: {}", task.kind, name, e);
                SyncOutcome::Failed(SyncFailure::Spawn(e.to_string()))
            }
            Ok(Ok(output)) if output.status.success() => {
                info!("{} successful for {}", task.kind, name);
                match task.kind {
                    SyncKind::Update => SyncOutcome::Updated,
                    SyncKind::Acquire => SyncOutcome::Acquired,
                }
            }
            Ok(Ok(output)) => {
                let failure = SyncFailure::Command {
                    status: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                };
                error!("git {} failed for {}: {}", task.kind, name, failure);
                SyncOutcome::Failed(failure)
            }
        };

        SyncReport {
            name,
            kind: task.kind,
            outcome,
            elapsed: started.elapsed(),
        }
    }
}
