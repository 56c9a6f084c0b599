//! The control plane — one `Runbox` per process, shared as `Arc<Runbox>`
//!
//! Owns the registry, the session manager and their collaborators. All
//! process-wide state lives here; nothing is persisted, so a restart starts
//! from an empty registry and heals running containers on first use.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RunboxConfig;
use crate::error::{ResourceKind, Result, RunboxError};
use crate::files::{self, DirEntry};
use crate::ids::validate_id;
use crate::ports::{HostPortProbe, PortAllocator, ProcNetProbe};
use crate::proxy::{NginxProxy, ProxyBackend, ProxyRouter, Route};
use crate::registry::{ExposedService, Sandbox, SandboxRegistry};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::session::pty::{PtySpawner, TerminalSpawner};
use crate::session::{ExecOutcome, SessionInfo, SessionManager};
use crate::storage::{LocalWorkspaceStorage, WorkspaceStorage};

pub struct Runbox {
    config: RunboxConfig,
    registry: Arc<SandboxRegistry>,
    sessions: Arc<SessionManager>,
    ports: Arc<PortAllocator>,
    router: Arc<ProxyRouter>,
    shutdown: CancellationToken,
}

impl Runbox {
    pub fn new(
        config: RunboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn ProxyBackend>,
        storage: Arc<dyn WorkspaceStorage>,
        probe: Arc<dyn HostPortProbe>,
        spawner: Arc<dyn TerminalSpawner>,
    ) -> Self {
        let ports = Arc::new(PortAllocator::new(config.ports.clone(), probe));
        let router = Arc::new(ProxyRouter::new(proxy, &config.proxy));
        let registry = Arc::new(SandboxRegistry::new(
            &config,
            runtime,
            storage,
            ports.clone(),
            router.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            &config.sessions,
            registry.clone(),
            spawner,
        ));
        // Weak: the session manager already holds the registry
        let pool = Arc::downgrade(&sessions);
        registry.set_stop_hook(Arc::new(move |id: &str| {
            if let Some(sessions) = pool.upgrade() {
                sessions.close_sandbox(id);
            }
        }));
        Self {
            config,
            registry,
            sessions,
            ports,
            router,
            shutdown: CancellationToken::new(),
        }
    }

    /// Docker, nginx, `/proc/net` and real PTYs
    pub fn from_config(config: RunboxConfig) -> Self {
        let runtime = Arc::new(DockerCli::new(config.runtime.clone()));
        let proxy = Arc::new(NginxProxy::from_config(&config.proxy));
        let storage = Arc::new(LocalWorkspaceStorage::new(&config.workspace_root));
        Self::new(
            config,
            runtime,
            proxy,
            storage,
            Arc::new(ProcNetProbe::new()),
            Arc::new(PtySpawner),
        )
    }

    pub fn config(&self) -> &RunboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start the idle-session reaper; stops on [`Runbox::shutdown`]
    pub fn spawn_background_tasks(&self) -> JoinHandle<()> {
        let sessions = &self.config.sessions;
        info!(
            "Session reaper every {}s (idle ttl {}s)",
            sessions.reap_interval_secs, sessions.idle_ttl_secs
        );
        self.sessions.spawn_reaper(
            sessions.reap_interval(),
            sessions.idle_ttl(),
            self.shutdown.child_token(),
        )
    }

    /// Stop background tasks and close every session. Containers keep running.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.sessions.close_all();
        info!("Control plane shut down ({} session(s) closed)", closed);
    }

    // ── Sandboxes ──

    pub async fn create_sandbox(&self, existing_id: Option<&str>) -> Result<Sandbox> {
        self.registry.create(existing_id).await
    }

    pub async fn resume_sandbox(&self, id: &str) -> Result<Sandbox> {
        self.registry.ensure_running(id).await
    }

    /// Stop the sandbox; its sessions are closed by the registry's stop hook
    pub async fn stop_sandbox(&self, id: &str) -> Result<()> {
        self.registry.stop(id).await
    }

    pub async fn destroy_sandbox(&self, id: &str) -> Result<Sandbox> {
        self.registry.destroy(id).await
    }

    pub fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        self.registry.get(id)
    }

    pub fn list_sandboxes(&self) -> Vec<Sandbox> {
        self.registry.list()
    }

    pub fn editor_url(&self, id: &str) -> String {
        self.registry.editor_url(id)
    }

    // ── Ports and routes ──

    /// Bring the sandbox up if needed, then publish a service route
    pub async fn expose_port(&self, id: &str, requested: Option<u16>) -> Result<ExposedService> {
        self.registry.ensure_running(id).await?;
        self.registry.expose_port(id, requested).await
    }

    pub async fn release_port(&self, id: &str) -> Result<Option<u16>> {
        self.registry.release_port(id).await
    }

    pub async fn port_reservations(&self) -> Vec<(String, u16)> {
        self.ports.reservations().await
    }

    pub fn routes(&self) -> Vec<Route> {
        self.router.routes()
    }

    // ── Commands ──

    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome> {
        self.sessions.execute(id, command, timeout).await
    }

    pub async fn poll(&self, session_id: &str, timeout: Option<Duration>) -> Result<ExecOutcome> {
        self.sessions.poll(session_id, timeout).await
    }

    pub fn list_sessions(&self, sandbox_id: Option<&str>) -> Vec<SessionInfo> {
        self.sessions.list(sandbox_id)
    }

    pub fn kill_session(&self, session_id: &str) -> Result<()> {
        self.sessions.kill_session(session_id)
    }

    // ── Workspace files ──

    /// Workspaces outlive stopped containers, so only the directory must exist
    async fn workspace_of(&self, id: &str) -> Result<std::path::PathBuf> {
        validate_id(id)?;
        let root = self.registry.workspace_path(id);
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Err(RunboxError::not_found(ResourceKind::Sandbox, id));
        }
        self.registry.touch(id);
        Ok(root)
    }

    pub async fn read_file(&self, id: &str, path: &str) -> Result<String> {
        let root = self.workspace_of(id).await?;
        files::read_file(&root, path).await
    }

    pub async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<()> {
        let root = self.workspace_of(id).await?;
        files::write_file(&root, path, content).await?;
        debug!("Wrote {} in sandbox {}", path, id);
        Ok(())
    }

    pub async fn list_directory(&self, id: &str, path: &str) -> Result<Vec<DirEntry>> {
        let root = self.workspace_of(id).await?;
        files::list_directory(&root, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SandboxState;
    use crate::testing::{FakeRuntime, FakeSpawner, MemoryProxy, StaticProbe, test_config};
    use std::collections::HashSet;

    struct Fixture {
        runbox: Runbox,
        runtime: Arc<FakeRuntime>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 3);
        let runtime = Arc::new(FakeRuntime::default());
        let storage = Arc::new(LocalWorkspaceStorage::new(&config.workspace_root));
        let runbox = Runbox::new(
            config,
            runtime.clone(),
            Arc::new(MemoryProxy::default()),
            storage,
            Arc::new(StaticProbe(HashSet::new())),
            Arc::new(FakeSpawner::new()),
        );
        Fixture {
            runbox,
            runtime,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let f = fixture();
        let sandbox = f.runbox.create_sandbox(None).await.unwrap();
        assert_eq!(
            f.runbox.editor_url(&sandbox.id),
            format!("http://{}.runbox.ai/?folder=/home", sandbox.id)
        );

        f.runbox
            .write_file(&sandbox.id, "/app/index.html", "<h1>hi</h1>")
            .await
            .unwrap();
        let out = f
            .runbox
            .execute(&sandbox.id, "echo built", None)
            .await
            .unwrap();
        assert!(out.is_completed());

        let service = f.runbox.expose_port(&sandbox.id, None).await.unwrap();
        assert_eq!(f.runbox.port_reservations().await, vec![(sandbox.id.clone(), service.port)]);
        assert_eq!(f.runbox.routes().len(), 2);

        f.runbox.stop_sandbox(&sandbox.id).await.unwrap();
        assert!(f.runbox.list_sessions(Some(&sandbox.id)).is_empty());
        assert!(f.runbox.routes().is_empty());
        assert_eq!(
            f.runbox.get_sandbox(&sandbox.id).unwrap().state,
            SandboxState::Stopped
        );

        // Files stay readable while stopped
        assert_eq!(
            f.runbox.read_file(&sandbox.id, "app/index.html").await.unwrap(),
            "<h1>hi</h1>"
        );

        let resumed = f.runbox.resume_sandbox(&sandbox.id).await.unwrap();
        assert!(resumed.is_running());

        f.runbox.destroy_sandbox(&sandbox.id).await.unwrap();
        assert!(f.runbox.list_sandboxes().is_empty());
        assert!(!f.runtime.exists(&sandbox.id));
        assert!(f.runbox.read_file(&sandbox.id, "app/index.html").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_file_ops_touch_sandbox() {
        let f = fixture();
        let sandbox = f.runbox.create_sandbox(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.runbox.write_file(&sandbox.id, "a.txt", "a").await.unwrap();
        let touched = f.runbox.get_sandbox(&sandbox.id).unwrap();
        assert!(touched.last_used_at > sandbox.last_used_at);

        let entries = f.runbox.list_directory(&sandbox.id, "/").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sandbox_files_not_found() {
        let f = fixture();
        let err = f.runbox.list_directory("nope", "/").await.unwrap_err();
        assert!(err.is_not_found());
        let err = f.runbox.read_file("../x", "a").await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_eviction_closes_pooled_sessions() {
        let f = fixture();
        let a = f.runbox.create_sandbox(None).await.unwrap();
        f.runbox.execute(&a.id, "echo a", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = f.runbox.create_sandbox(None).await.unwrap();
        f.runbox.execute(&b.id, "echo b", None).await.unwrap();
        assert_eq!(f.runbox.list_sessions(Some(&a.id)).len(), 1);

        let evicted = f.runbox.registry().evict_if_over_capacity(1).await.unwrap();
        assert_eq!(evicted.as_deref(), Some(a.id.as_str()));
        assert!(f.runbox.list_sessions(Some(&a.id)).is_empty());
        assert_eq!(f.runbox.list_sessions(Some(&b.id)).len(), 1);

        // The next command starts a fresh session on a resumed sandbox
        let out = f.runbox.execute(&a.id, "echo again", None).await.unwrap();
        assert!(out.is_completed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let f = fixture();
        let sandbox = f.runbox.create_sandbox(None).await.unwrap();
        f.runbox.execute(&sandbox.id, "echo x", None).await.unwrap();
        let reaper = f.runbox.spawn_background_tasks();

        f.runbox.shutdown();
        reaper.await.unwrap();
        assert!(f.runbox.list_sessions(None).is_empty());
        assert!(f.runtime.is_running(&sandbox.id));
    }
}
