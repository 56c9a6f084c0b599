//! Container runtime — the Docker CLI behind a trait
//!
//! Every call that targets a missing container or network fails with
//! `RunboxError::NotFound` so callers can tell "gone" from "broken".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{ResourceKind, Result, RunboxError};

/// Everything needed to start a sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub id: String,
    pub image: String,
    pub workspace: PathBuf,
    pub workdir: String,
    pub env: Vec<(String, String)>,
}

/// A running container that belongs to this service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningContainer {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Result of probing a port inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Listening,
    LoopbackOnly,
    NotListening,
}

/// The container runtime collaborator
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start_container(&self, spec: &ContainerSpec) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn resume_container(&self, id: &str) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn inspect_running(&self, id: &str) -> Result<bool>;
    async fn internal_address(&self, id: &str) -> Result<IpAddr>;
    async fn network_exists(&self, id: &str) -> Result<bool>;
    async fn create_network(&self, id: &str) -> Result<()>;
    async fn remove_network(&self, id: &str) -> Result<()>;
    /// Running containers carrying this service's label
    async fn list_running(&self) -> Result<Vec<RunningContainer>>;
    async fn port_state(&self, id: &str, port: u16) -> Result<ListenState>;
    /// argv that attaches an interactive shell to the container
    fn attach_command(&self, id: &str) -> Vec<String>;
}

/// Drives the `docker` CLI
pub struct DockerCli {
    config: RuntimeConfig,
}

impl DockerCli {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn network_name(&self, id: &str) -> String {
        format!("{}{}", id, self.config.network_suffix)
    }

    fn base_command(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if self.config.use_sudo {
            argv.push("sudo".to_string());
        }
        argv.push(self.config.binary.clone());
        argv
    }

    /// Check if the runtime daemon answers
    pub async fn is_available(&self) -> bool {
        let argv = self.base_command();
        Command::new(&argv[0])
            .args(&argv[1..])
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the CLI and return trimmed stdout
    async fn run(&self, args: &[String], kind: ResourceKind, target: &str) -> Result<String> {
        let argv = self.base_command();
        let operation = format!("{} {}", self.config.binary, args.first().map_or("", |s| s.as_str()));
        debug!("Runtime: {} {}", argv.join(" "), args.join(" "));

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RunboxError::runtime(&operation, e.to_string()))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found_message(&stderr) {
            return Err(RunboxError::not_found(kind, target));
        }
        Err(RunboxError::runtime(operation, stderr))
    }

    fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.id.clone(),
            "--label".to_string(),
            self.config.label.clone(),
            "--network".to_string(),
            self.network_name(&spec.id),
            "-v".to_string(),
            format!("{}:{}", spec.workspace.display(), spec.workdir),
            "-w".to_string(),
            spec.workdir.clone(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());
        args
    }
}

fn is_not_found_message(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("no such object")
        || (lower.contains("network") && lower.contains("not found"))
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// `args -- target`, so a target can never be parsed as an option
fn with_target(args: &[&str], target: &str) -> Vec<String> {
    let mut argv = strings(args);
    argv.push("--".to_string());
    argv.push(target.to_string());
    argv
}

/// `docker ps` prints e.g. `2024-05-01 10:11:12 +0000 UTC`
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed: Vec<&str> = raw.split_whitespace().take(3).collect();
    if trimmed.len() < 3 {
        return None;
    }
    DateTime::parse_from_str(&trimmed.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_ps_line(line: &str) -> Option<RunningContainer> {
    let mut parts = line.splitn(2, '\t');
    let id = parts.next()?.trim();
    if id.is_empty() {
        return None;
    }
    Some(RunningContainer {
        id: id.to_string(),
        created_at: parts.next().and_then(parse_created_at),
    })
}

/// Classify `netstat -tln` output for one port
fn parse_listen_state(netstat: &str, port: u16) -> ListenState {
    let suffix = format!(":{}", port);
    let mut loopback = false;
    for line in netstat.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(local) = fields.get(3) else {
            continue;
        };
        if !local.ends_with(&suffix) {
            continue;
        }
        if local.starts_with("127.") || local.starts_with("::1:") || local.starts_with("[::1]") {
            loopback = true;
        } else {
            return ListenState::Listening;
        }
    }
    if loopback {
        ListenState::LoopbackOnly
    } else {
        ListenState::NotListening
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start_container(&self, spec: &ContainerSpec) -> Result<()> {
        let args = self.run_args(spec);
        self.run(&args, ResourceKind::Container, &spec.id).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.run(&with_target(&["stop"], id), ResourceKind::Container, id)
            .await?;
        Ok(())
    }

    async fn resume_container(&self, id: &str) -> Result<()> {
        self.run(&with_target(&["start"], id), ResourceKind::Container, id)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.run(&with_target(&["rm", "-f"], id), ResourceKind::Container, id)
            .await?;
        Ok(())
    }

    async fn inspect_running(&self, id: &str) -> Result<bool> {
        let out = self
            .run(
                &with_target(&["container", "inspect", "-f", "{{.State.Running}}"], id),
                ResourceKind::Container,
                id,
            )
            .await?;
        Ok(out == "true")
    }

    async fn internal_address(&self, id: &str) -> Result<IpAddr> {
        let out = self
            .run(
                &with_target(
                    &[
                        "inspect",
                        "-f",
                        "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                    ],
                    id,
                ),
                ResourceKind::Container,
                id,
            )
            .await?;
        let first = out.split_whitespace().next().ok_or_else(|| {
            RunboxError::runtime("docker inspect", format!("container {} has no address", id))
        })?;
        first.parse().map_err(|_| {
            RunboxError::runtime("docker inspect", format!("unparseable address '{}'", first))
        })
    }

    async fn network_exists(&self, id: &str) -> Result<bool> {
        let network = self.network_name(id);
        match self
            .run(
                &with_target(&["network", "inspect"], &network),
                ResourceKind::Network,
                &network,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_network(&self, id: &str) -> Result<()> {
        let network = self.network_name(id);
        self.run(
            &with_target(&["network", "create"], &network),
            ResourceKind::Network,
            &network,
        )
        .await?;
        Ok(())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let network = self.network_name(id);
        self.run(
            &with_target(&["network", "rm"], &network),
            ResourceKind::Network,
            &network,
        )
        .await?;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let filter = format!("label={}", self.config.label);
        let out = self
            .run(
                &strings(&["ps", "--filter", &filter, "--format", "{{.Names}}\t{{.CreatedAt}}"]),
                ResourceKind::Container,
                "*",
            )
            .await?;
        Ok(out.lines().filter_map(parse_ps_line).collect())
    }

    async fn port_state(&self, id: &str, port: u16) -> Result<ListenState> {
        match self
            .run(
                &strings(&["exec", id, "netstat", "-tln"]),
                ResourceKind::Container,
                id,
            )
            .await
        {
            Ok(out) => Ok(parse_listen_state(&out, port)),
            Err(RunboxError::RuntimeInvocation { message, .. }) => {
                warn!("netstat failed in {}: {}", id, message);
                Ok(ListenState::NotListening)
            }
            Err(e) => Err(e),
        }
    }

    fn attach_command(&self, id: &str) -> Vec<String> {
        let mut argv = self.base_command();
        argv.extend(strings(&["exec", "-it", id, &self.config.shell]));
        argv
    }
}
