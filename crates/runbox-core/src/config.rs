//! Configuration — TOML file with defaults for every field

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunboxConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    #[serde(default = "default_max_live")]
    pub max_live_sandboxes: usize,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ports: PortRange,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/data/workspaces")
}

fn default_container_workdir() -> String {
    "/home".to_string()
}

fn default_max_live() -> usize {
    3
}

impl Default for RunboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            container_workdir: default_container_workdir(),
            max_live_sandboxes: default_max_live(),
            runtime: RuntimeConfig::default(),
            ports: PortRange::default(),
            proxy: ProxyConfig::default(),
            sessions: SessionConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// How the container runtime CLI is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_binary")]
    pub binary: String,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_network_suffix")]
    pub network_suffix: String,
    /// Label put on every container so eviction only sees ours
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "runbox".to_string()
}

fn default_network_suffix() -> String {
    "-network".to_string()
}

fn default_label() -> String {
    "runbox.managed=true".to_string()
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            use_sudo: false,
            image: default_image(),
            network_suffix: default_network_suffix(),
            label: default_label(),
            shell: default_shell(),
        }
    }
}

/// Host port range handed out by the allocator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    #[serde(default = "default_port_floor")]
    pub floor: u16,
    #[serde(default = "default_port_ceiling")]
    pub ceiling: u16,
    #[serde(default)]
    pub excluded: Vec<u16>,
}

fn default_port_floor() -> u16 {
    2001
}

fn default_port_ceiling() -> u16 {
    65535
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            floor: default_port_floor(),
            ceiling: default_port_ceiling(),
            excluded: Vec::new(),
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_descriptor_dir")]
    pub descriptor_dir: PathBuf,
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
    /// In-container port the primary route points at (the editor)
    #[serde(default = "default_editor_port")]
    pub editor_port: u16,
}

fn default_domain() -> String {
    "runbox.ai".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_descriptor_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/runbox.d")
}

fn default_reload_command() -> Vec<String> {
    vec![
        "sudo".to_string(),
        "nginx".to_string(),
        "-s".to_string(),
        "reload".to_string(),
    ]
}

fn default_editor_port() -> u16 {
    9999
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            scheme: default_scheme(),
            descriptor_dir: default_descriptor_dir(),
            reload_command: default_reload_command(),
            editor_port: default_editor_port(),
        }
    }
}

/// Interactive session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_pty_rows")]
    pub pty_rows: u16,
    /// Wide enough that the echoed command line is not wrapped
    #[serde(default = "default_pty_cols")]
    pub pty_cols: u16,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// When set, a session is ready once this marker appears instead of a prompt
    #[serde(default)]
    pub ready_marker: Option<String>,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_idle_ttl_secs() -> u64 {
    30 * 60
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_pty_rows() -> u16 {
    30
}

fn default_pty_cols() -> u16 {
    400
}

fn default_max_output_bytes() -> usize {
    1024 * 1024 // 1MB
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            idle_ttl_secs: default_idle_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            pty_rows: default_pty_rows(),
            pty_cols: default_pty_cols(),
            max_output_bytes: default_max_output_bytes(),
            ready_marker: None,
        }
    }
}

impl SessionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// HTTP surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8888".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
        }
    }
}

impl RunboxConfig {
    /// Default location: `<config dir>/runbox/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("runbox").join("config.toml"))
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RunboxConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides();
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => {
                debug!("No config file found, using defaults");
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// `RUNBOX_BASE_IMAGE` and `RUNBOX_API_KEY` win over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(image) = std::env::var("RUNBOX_BASE_IMAGE")
            && !image.trim().is_empty()
        {
            self.runtime.image = image;
        }
        if let Ok(key) = std::env::var("RUNBOX_API_KEY")
            && !key.trim().is_empty()
        {
            self.gateway.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.floor > self.ports.ceiling {
            anyhow::bail!(
                "ports.floor ({}) is above ports.ceiling ({})",
                self.ports.floor,
                self.ports.ceiling
            );
        }
        if self.ports.floor < 1024 {
            anyhow::bail!("ports.floor must not include well-known ports (< 1024)");
        }
        if self.max_live_sandboxes == 0 {
            anyhow::bail!("max_live_sandboxes must be at least 1");
        }
        if self.proxy.reload_command.is_empty() {
            anyhow::bail!("proxy.reload_command cannot be empty");
        }
        if self.runtime.image.trim().is_empty() {
            anyhow::bail!("runtime.image cannot be empty");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
