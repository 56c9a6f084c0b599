//! Proxy router — public hostnames to sandbox network addresses
//!
//! Every change durably writes a route descriptor and then reloads the
//! external reverse proxy. A failed reload is reported as `ProxyReload` but
//! the descriptor stays in place: the next successful reload picks it up.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{Result, RunboxError};

/// The reverse-proxy collaborator
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Create or overwrite the descriptor for `hostname`
    async fn write_route_descriptor(&self, hostname: &str, target: SocketAddr) -> Result<()>;
    /// Remove the descriptor, returning whether one existed
    async fn remove_route_descriptor(&self, hostname: &str) -> Result<bool>;
    async fn reload(&self) -> Result<()>;
}

/// nginx backend: one `server {}` block per hostname in a drop-in directory
pub struct NginxProxy {
    descriptor_dir: PathBuf,
    reload_command: Vec<String>,
}

impl NginxProxy {
    pub fn new(descriptor_dir: impl Into<PathBuf>, reload_command: Vec<String>) -> Self {
        Self {
            descriptor_dir: descriptor_dir.into(),
            reload_command,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(&config.descriptor_dir, config.reload_command.clone())
    }

    fn descriptor_path(&self, hostname: &str) -> PathBuf {
        self.descriptor_dir.join(format!("{}.conf", hostname))
    }
}

/// nginx server block proxying HTTP/1.1 (with websocket upgrade) to `target`
pub fn render_server_block(hostname: &str, target: SocketAddr) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {hostname};

    location / {{
        proxy_pass http://{target}/;
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_cache_bypass $http_upgrade;
    }}
}}
"#
    )
}

async fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("conf.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl ProxyBackend for NginxProxy {
    async fn write_route_descriptor(&self, hostname: &str, target: SocketAddr) -> Result<()> {
        tokio::fs::create_dir_all(&self.descriptor_dir).await?;
        let path = self.descriptor_path(hostname);
        write_atomically(&path, &render_server_block(hostname, target)).await?;
        debug!("Wrote route descriptor {}", path.display());
        Ok(())
    }

    async fn remove_route_descriptor(&self, hostname: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.descriptor_path(hostname)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self) -> Result<()> {
        let (program, args) = self
            .reload_command
            .split_first()
            .ok_or_else(|| RunboxError::ProxyReload("reload command is empty".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| RunboxError::ProxyReload(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RunboxError::ProxyReload(format!(
                "{} exited with {}: {}",
                program, output.status, stderr
            )));
        }
        Ok(())
    }
}

/// A published route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hostname: String,
    pub target: SocketAddr,
}

/// Owns the route table and drives the proxy backend
pub struct ProxyRouter {
    backend: Arc<dyn ProxyBackend>,
    domain: String,
    scheme: String,
    routes: RwLock<HashMap<String, SocketAddr>>,
}

impl ProxyRouter {
    pub fn new(backend: Arc<dyn ProxyBackend>, config: &ProxyConfig) -> Self {
        Self {
            backend,
            domain: config.domain.clone(),
            scheme: config.scheme.clone(),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Primary hostname of a sandbox: `<id>.<domain>`
    pub fn sandbox_hostname(&self, sandbox_id: &str) -> String {
        format!("{}.{}", sandbox_id, self.domain)
    }

    /// Hostname of a secondary exposed service: `<id>-<port>.<domain>`.
    /// Valid sandbox IDs never end in `-<digits>`, so this never names
    /// another sandbox's primary hostname.
    pub fn service_hostname(&self, sandbox_id: &str, port: u16) -> String {
        format!("{}-{}.{}", sandbox_id, port, self.domain)
    }

    pub fn public_url(&self, hostname: &str) -> String {
        format!("{}://{}", self.scheme, hostname)
    }

    /// Route `hostname` to `target`, overwriting any previous target
    pub async fn publish(&self, hostname: &str, target: SocketAddr) -> Result<()> {
        self.backend.write_route_descriptor(hostname, target).await?;
        let previous = self.routes.write().insert(hostname.to_string(), target);
        match previous {
            Some(old) if old != target => info!("Route {} moved {} -> {}", hostname, old, target),
            Some(_) => debug!("Route {} republished to {}", hostname, target),
            None => info!("Published route {} -> {}", hostname, target),
        }
        self.reload().await
    }

    /// Remove the route for `hostname`. Returns whether anything was removed.
    pub async fn unpublish(&self, hostname: &str) -> Result<bool> {
        let removed = self.remove_one(hostname).await?;
        if removed {
            self.reload().await?;
        }
        Ok(removed)
    }

    /// Remove several routes with a single reload
    pub async fn unpublish_all(&self, hostnames: &[String]) -> Result<usize> {
        let mut removed = 0;
        for hostname in hostnames {
            if self.remove_one(hostname).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.reload().await?;
        }
        Ok(removed)
    }

    async fn remove_one(&self, hostname: &str) -> Result<bool> {
        let on_disk = self.backend.remove_route_descriptor(hostname).await?;
        let in_table = self.routes.write().remove(hostname).is_some();
        if on_disk || in_table {
            info!("Unpublished route {}", hostname);
        }
        Ok(on_disk || in_table)
    }

    async fn reload(&self) -> Result<()> {
        self.backend.reload().await.inspect_err(|e| {
            warn!("Proxy reload failed, descriptor kept for next reload: {}", e);
        })
    }

    pub fn lookup(&self, hostname: &str) -> Option<SocketAddr> {
        self.routes.read().get(hostname).copied()
    }

    /// All routes, sorted by hostname
    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .routes
            .read()
            .iter()
            .map(|(hostname, target)| Route {
                hostname: hostname.clone(),
                target: *target,
            })
            .collect();
        routes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        routes
    }
}
