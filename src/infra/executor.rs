//! Sandbox executor interface
//!
//! The build core never talks to a container engine directly. Everything it
//! needs from the sandbox goes through [`SandboxExecutor`], which keeps the
//! pipeline testable against an in-memory sandbox.

use std::path::{Path, PathBuf};

use crate::error::ExecutorError;

/// Kind of engine resource a filter or removal targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A container (the sandbox itself)
    Container,
    /// An image a sandbox is created from
    Image,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Image => write!(f, "image"),
        }
    }
}

/// Name filter for [`SandboxExecutor::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    /// What to list
    pub kind: ResourceKind,
    /// Exact name to match
    pub name: String,
}

impl ListFilter {
    /// Filter containers by exact name
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Container,
            name: name.into(),
        }
    }

    /// Filter images by exact name (including tag)
    pub fn image(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Image,
            name: name.into(),
        }
    }
}

/// Mount configuration for sandbox volumes
#[derive(Debug, Clone, PartialEq)]
pub struct MountConfig {
    /// Host path to mount
    pub host_path: PathBuf,
    /// Container path to mount to
    pub container_path: PathBuf,
    /// Whether the mount is read-only
    pub read_only: bool,
}

impl MountConfig {
    /// Create a new read-only mount
    pub fn read_only(host_path: PathBuf, container_path: PathBuf) -> Self {
        Self {
            host_path,
            container_path,
            read_only: true,
        }
    }

    /// Create a new read-write mount
    pub fn read_write(host_path: PathBuf, container_path: PathBuf) -> Self {
        Self {
            host_path,
            container_path,
            read_only: false,
        }
    }
}

/// Everything needed to build an image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    /// Dockerfile contents
    pub dockerfile: String,
}

/// Result of running a command inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code of the command
    pub exit_code: i32,
}

impl ExecOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Live facts about an existing sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    /// Full sandbox id
    pub id: String,
    /// Creation timestamp as reported by the engine
    pub created_at: String,
    /// Whether the sandbox is currently running
    pub running: bool,
}

/// Operations the build core consumes from a container engine.
///
/// Every call may fail; implementations surface the failure and never retry.
/// Calls block until the engine answers.
pub trait SandboxExecutor {
    /// Create (but do not start) a sandbox from `image`
    fn create(&mut self, image: &str, name: &str, binds: &[MountConfig])
        -> Result<String, ExecutorError>;

    /// Start a stopped sandbox
    fn start(&mut self, id: &str) -> Result<(), ExecutorError>;

    /// Stop a running sandbox
    fn stop(&mut self, id: &str) -> Result<(), ExecutorError>;

    /// Run `argv` inside a running sandbox
    fn exec(
        &mut self,
        id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput, ExecutorError>;

    /// Copy a path out of the sandbox onto the host
    fn copy_out(&mut self, id: &str, remote_path: &str, local_path: &Path)
        -> Result<(), ExecutorError>;

    /// Build an image and return its id
    fn build_image(&mut self, name: &str, spec: &ImageSpec) -> Result<String, ExecutorError>;

    /// List ids of resources matching `filter`
    fn list(&mut self, filter: &ListFilter) -> Result<Vec<String>, ExecutorError>;

    /// Inspect an existing sandbox
    fn inspect(&mut self, id: &str) -> Result<SandboxInfo, ExecutorError>;

    /// Remove a container or image
    fn remove(&mut self, kind: ResourceKind, id: &str) -> Result<(), ExecutorError>;
}

/// A running sandbox bound to the executor that drives it.
///
/// Commands issued through a session are logged with the sandbox id so a
/// failing build can be reproduced by hand.
pub struct SandboxSession<'e> {
    executor: &'e mut dyn SandboxExecutor,
    id: String,
}

impl<'e> SandboxSession<'e> {
    /// Bind a session to a running sandbox
    pub fn new(executor: &'e mut dyn SandboxExecutor, id: impl Into<String>) -> Self {
        Self {
            executor,
            id: id.into(),
        }
    }

    /// The sandbox id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run a command and return its raw output, whatever the exit code
    pub fn probe(&mut self, argv: &[&str]) -> Result<ExecOutput, ExecutorError> {
        self.probe_with_env(argv, &[])
    }

    /// Run a command with extra environment, whatever the exit code
    pub fn probe_with_env(
        &mut self,
        argv: &[&str],
        env: &[(String, String)],
    ) -> Result<ExecOutput, ExecutorError> {
        let argv = to_owned_args(argv);
        tracing::debug!("[{}] probe {:?}", self.id, argv);
        self.executor.exec(&self.id, &argv, env)
    }

    /// Run a command, failing on a non-zero exit
    pub fn run(&mut self, argv: &[&str]) -> Result<String, ExecutorError> {
        self.run_with_env(argv, &[])
    }

    /// Run a command with extra environment, failing on a non-zero exit
    pub fn run_with_env(
        &mut self,
        argv: &[&str],
        env: &[(String, String)],
    ) -> Result<String, ExecutorError> {
        let argv = to_owned_args(argv);
        tracing::info!("[{}] {}", self.id, argv.join(" "));

        let output = self.executor.exec(&self.id, &argv, env)?;
        if output.success() {
            return Ok(output.stdout);
        }

        tracing::error!(
            "Command {:?} failed in sandbox {} with exit code {}",
            argv,
            self.id,
            output.exit_code
        );
        Err(ExecutorError::CommandFailed {
            sandbox: self.id.clone(),
            command: argv,
            exit_code: output.exit_code,
            output: format!("{}{}", output.stdout, output.stderr),
        })
    }

    /// Copy a path out of the sandbox
    pub fn copy_out(&mut self, remote_path: &str, local_path: &Path) -> Result<(), ExecutorError> {
        tracing::info!(
            "[{}] copy {} -> {}",
            self.id,
            remote_path,
            local_path.display()
        );
        self.executor.copy_out(&self.id, remote_path, local_path)
    }
}

fn to_owned_args(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|s| (*s).to_string()).collect()
}
