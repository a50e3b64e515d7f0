//! Docker/Podman sandbox executor
//!
//! Implements [`SandboxExecutor`] by shelling out to the container runtime
//! found on `PATH`. Failures of the runtime CLI are reported as
//! [`ExecutorError::Engine`]; a command inside the sandbox exiting non-zero is
//! returned as a normal [`ExecOutput`] so the caller decides.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::ExecutorError;
use crate::infra::executor::{
    ExecOutput, ImageSpec, ListFilter, MountConfig, ResourceKind, SandboxExecutor, SandboxInfo,
};

/// Container runtime type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Docker container runtime
    Docker,
    /// Podman container runtime
    Podman,
}

impl ContainerRuntime {
    /// Get the command name for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Detect available container runtime, preferring Docker
    pub fn detect() -> Option<Self> {
        [ContainerRuntime::Docker, ContainerRuntime::Podman]
            .into_iter()
            .find(|runtime| which::which(runtime.command()).is_ok())
    }
}

/// Executor backed by the `docker` (or `podman`) CLI
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    runtime: ContainerRuntime,
}

impl DockerExecutor {
    /// Use an explicit runtime
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Detect the runtime from `PATH`
    pub fn detect() -> Result<Self, ExecutorError> {
        ContainerRuntime::detect()
            .map(Self::new)
            .ok_or(ExecutorError::RuntimeNotFound)
    }

    /// Run the runtime CLI and return stdout, mapping failures to engine errors
    fn engine(&self, operation: &str, args: &[String]) -> Result<String, ExecutorError> {
        tracing::debug!("{} {}", self.runtime.command(), args.join(" "));

        let output = Command::new(self.runtime.command())
            .args(args)
            .output()
            .map_err(|e| ExecutorError::Engine {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ExecutorError::Engine {
                operation: operation.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Build the `create` argument list
pub fn build_create_args(image: &str, name: &str, binds: &[MountConfig]) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--tty".to_string(),
        format!("--name={name}"),
    ];

    for mount in binds {
        let mount_opt = if mount.read_only {
            format!(
                "-v={}:{}:ro",
                mount.host_path.display(),
                mount.container_path.display()
            )
        } else {
            format!(
                "-v={}:{}",
                mount.host_path.display(),
                mount.container_path.display()
            )
        };
        args.push(mount_opt);
    }

    args.push(image.to_string());
    args.push("/bin/bash".to_string());
    args
}

/// Build the `exec` argument list
pub fn build_exec_args(id: &str, argv: &[String], env: &[(String, String)]) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    for (key, value) in env {
        args.push(format!("-e={key}={value}"));
    }
    args.push(id.to_string());
    args.extend(argv.iter().cloned());
    args
}

/// Build the `list` argument list
pub fn build_list_args(filter: &ListFilter) -> Vec<String> {
    match filter.kind {
        ResourceKind::Container => vec![
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
            format!("--filter=name=^/?{}$", filter.name),
        ],
        ResourceKind::Image => vec![
            "images".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
            filter.name.clone(),
        ],
    }
}

/// Parse the output of `inspect --format '{{.Id}}|{{.Created}}|{{.State.Running}}'`
pub fn parse_inspect(output: &str) -> Option<SandboxInfo> {
    let mut parts = output.trim().splitn(3, '|');
    let id = parts.next()?.to_string();
    let created_at = parts.next()?.to_string();
    let running = parts.next()? == "true";
    if id.is_empty() || created_at.is_empty() {
        return None;
    }
    Some(SandboxInfo {
        id,
        created_at,
        running,
    })
}

impl SandboxExecutor for DockerExecutor {
    fn create(
        &mut self,
        image: &str,
        name: &str,
        binds: &[MountConfig],
    ) -> Result<String, ExecutorError> {
        let id = self.engine("create", &build_create_args(image, name, binds))?;
        Ok(id.trim().to_string())
    }

    fn start(&mut self, id: &str) -> Result<(), ExecutorError> {
        self.engine("start", &["start".to_string(), id.to_string()])
            .map(|_| ())
    }

    fn stop(&mut self, id: &str) -> Result<(), ExecutorError> {
        self.engine("stop", &["stop".to_string(), id.to_string()])
            .map(|_| ())
    }

    fn exec(
        &mut self,
        id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput, ExecutorError> {
        let output = Command::new(self.runtime.command())
            .args(build_exec_args(id, argv, env))
            .output()
            .map_err(|e| ExecutorError::Engine {
                operation: "exec".to_string(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        for line in stdout.lines() {
            tracing::debug!("\t{}", line);
        }

        Ok(ExecOutput {
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            // Killed by a signal: no exit code, treat as failure
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn copy_out(
        &mut self,
        id: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), ExecutorError> {
        self.engine(
            "cp",
            &[
                "cp".to_string(),
                format!("{id}:{remote_path}"),
                local_path.display().to_string(),
            ],
        )
        .map(|_| ())
    }

    fn build_image(&mut self, name: &str, spec: &ImageSpec) -> Result<String, ExecutorError> {
        tracing::info!("Building image: {}", name);

        let mut child = Command::new(self.runtime.command())
            .args(["build", "--rm", "--tag", name, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Engine {
                operation: "build".to_string(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(spec.dockerfile.as_bytes())
                .map_err(|e| ExecutorError::Engine {
                    operation: "build".to_string(),
                    message: e.to_string(),
                })?;
        }

        let output = child.wait_with_output().map_err(|e| ExecutorError::Engine {
            operation: "build".to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(ExecutorError::Engine {
                operation: format!("build {name}"),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let id = self.engine(
            "image inspect",
            &[
                "image".to_string(),
                "inspect".to_string(),
                "--format={{.Id}}".to_string(),
                name.to_string(),
            ],
        )?;
        tracing::info!("Build completed successfully: {}", id.trim());
        Ok(id.trim().to_string())
    }

    fn list(&mut self, filter: &ListFilter) -> Result<Vec<String>, ExecutorError> {
        let output = self.engine("list", &build_list_args(filter))?;
        let mut ids: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        // `images` repeats an id once per matching tag
        ids.dedup();
        Ok(ids)
    }

    fn inspect(&mut self, id: &str) -> Result<SandboxInfo, ExecutorError> {
        let output = self.engine(
            "inspect",
            &[
                "inspect".to_string(),
                "--format={{.Id}}|{{.Created}}|{{.State.Running}}".to_string(),
                id.to_string(),
            ],
        )?;
        parse_inspect(&output).ok_or_else(|| ExecutorError::Engine {
            operation: "inspect".to_string(),
            message: format!("unexpected inspect output for {id}: {output:?}"),
        })
    }

    fn remove(&mut self, kind: ResourceKind, id: &str) -> Result<(), ExecutorError> {
        let command = match kind {
            ResourceKind::Container => "rm",
            ResourceKind::Image => "rmi",
        };
        tracing::info!("Remove {}: {}", kind, id);
        self.engine(command, &[command.to_string(), id.to_string()])
            .map(|_| ())
    }
}
