//! Sandbox registry — lifecycle, self-healing, and LRU eviction
//!
//! State machine: `provisioning -> running <-> stopped -> destroyed`.
//! Every mutating operation takes the sandbox's key lock first, so two
//! requests against the same ID never interleave; different IDs run in
//! parallel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunboxConfig;
use crate::error::{ResourceKind, Result, RunboxError};
use crate::ids::{generate_sandbox_id, validate_id};
use crate::locks::KeyedLocks;
use crate::ports::PortAllocator;
use crate::proxy::ProxyRouter;
use crate::runtime::{ContainerRuntime, ContainerSpec, ListenState};
use crate::storage::WorkspaceStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Provisioning => write!(f, "provisioning"),
            SandboxState::Running => write!(f, "running"),
            SandboxState::Stopped => write!(f, "stopped"),
            SandboxState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Snapshot of a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: SandboxState,
    /// Internal address; changes on every resume
    pub address: Option<IpAddr>,
    pub exposed_port: Option<u16>,
    pub hostnames: Vec<String>,
}

impl Sandbox {
    pub fn is_running(&self) -> bool {
        self.state == SandboxState::Running
    }
}

/// A secondary route published for a service inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedService {
    pub port: u16,
    pub hostname: String,
    pub url: String,
}

struct SandboxRecord {
    sandbox: Sandbox,
    in_flight: Arc<AtomicUsize>,
}

/// Held while a command is being awaited; eviction skips leased sandboxes
pub struct CommandLease {
    counter: Arc<AtomicUsize>,
}

impl Drop for CommandLease {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Called with the sandbox ID whenever a sandbox is stopped, under its key lock
pub type StopHook = Arc<dyn Fn(&str) + Send + Sync>;

/// How many times a sweep re-picks when its candidate becomes active
const EVICTION_ATTEMPTS: usize = 3;

struct RegistrySettings {
    image: String,
    workdir: String,
    editor_port: u16,
    max_live: usize,
}

pub struct SandboxRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn WorkspaceStorage>,
    ports: Arc<PortAllocator>,
    router: Arc<ProxyRouter>,
    records: DashMap<String, SandboxRecord>,
    locks: KeyedLocks,
    eviction: tokio::sync::Mutex<()>,
    on_stop: RwLock<Option<StopHook>>,
    settings: RegistrySettings,
}

impl SandboxRegistry {
    pub fn new(
        config: &RunboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn WorkspaceStorage>,
        ports: Arc<PortAllocator>,
        router: Arc<ProxyRouter>,
    ) -> Self {
        Self {
            runtime,
            storage,
            ports,
            router,
            records: DashMap::new(),
            locks: KeyedLocks::new(),
            eviction: tokio::sync::Mutex::new(()),
            on_stop: RwLock::new(None),
            settings: RegistrySettings {
                image: config.runtime.image.clone(),
                workdir: config.container_workdir.clone(),
                editor_port: config.proxy.editor_port,
                max_live: config.max_live_sandboxes,
            },
        }
    }

    /// Install the hook run on every stop, eviction included
    pub fn set_stop_hook(&self, hook: StopHook) {
        *self.on_stop.write() = Some(hook);
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.router
    }

    pub fn max_live(&self) -> usize {
        self.settings.max_live
    }

    pub fn workspace_path(&self, id: &str) -> PathBuf {
        self.storage.workspace_path(id)
    }

    pub fn editor_url(&self, id: &str) -> String {
        format!(
            "{}/?folder={}",
            self.router.public_url(&self.router.sandbox_hostname(id)),
            self.settings.workdir
        )
    }

    pub fn get(&self, id: &str) -> Result<Sandbox> {
        self.records
            .get(id)
            .map(|r| r.sandbox.clone())
            .ok_or_else(|| RunboxError::not_found(ResourceKind::Sandbox, id))
    }

    /// All known sandboxes, oldest first
    pub fn list(&self) -> Vec<Sandbox> {
        let mut all: Vec<Sandbox> = self.records.iter().map(|r| r.sandbox.clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Record activity; the only input to eviction ordering
    pub fn touch(&self, id: &str) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.sandbox.last_used_at = Utc::now();
        }
    }

    /// Mark a command in flight until the lease is dropped
    pub fn lease(&self, id: &str) -> Option<CommandLease> {
        let record = self.records.get(id)?;
        record.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(CommandLease {
            counter: record.in_flight.clone(),
        })
    }

    fn in_flight(&self, id: &str) -> usize {
        self.records
            .get(id)
            .map_or(0, |r| r.in_flight.load(Ordering::SeqCst))
    }

    fn last_used(&self, id: &str) -> Option<DateTime<Utc>> {
        self.records.get(id).map(|r| r.sandbox.last_used_at)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Sandbox)) -> Option<Sandbox> {
        let mut record = self.records.get_mut(id)?;
        f(&mut record.sandbox);
        Some(record.sandbox.clone())
    }

    /// Insert a record if missing; otherwise mark it provisioning
    fn upsert_provisioning(&self, id: &str) {
        let now = Utc::now();
        let workspace = self.storage.workspace_path(id);
        self.records
            .entry(id.to_string())
            .and_modify(|r| {
                r.sandbox.state = SandboxState::Provisioning;
                r.sandbox.last_used_at = now;
            })
            .or_insert_with(|| SandboxRecord {
                sandbox: Sandbox {
                    id: id.to_string(),
                    workspace,
                    created_at: now,
                    last_used_at: now,
                    state: SandboxState::Provisioning,
                    address: None,
                    exposed_port: None,
                    hostnames: Vec::new(),
                },
                in_flight: Arc::new(AtomicUsize::new(0)),
            });
    }

    /// Provision a new sandbox, or recreate one under `existing_id`.
    ///
    /// Retrying with the same ID after a partial failure converges. An
    /// eviction sweep is launched in the background and never awaited.
    pub async fn create(self: &Arc<Self>, existing_id: Option<&str>) -> Result<Sandbox> {
        let id = match existing_id {
            Some(id) => {
                validate_id(id)?;
                id.to_string()
            }
            None => generate_sandbox_id(),
        };

        let sandbox = {
            let _guard = self.locks.lock(&id).await;
            self.provision(&id).await?
        };
        self.spawn_eviction();
        Ok(sandbox)
    }

    /// Caller must hold the key lock
    async fn provision(&self, id: &str) -> Result<Sandbox> {
        let started = Instant::now();
        info!("Creating sandbox {}", id);
        self.upsert_provisioning(id);

        let workspace = self.storage.workspace_path(id);
        self.storage.ensure_directory(&workspace).await?;
        self.ensure_network(id).await?;

        match self.runtime.inspect_running(id).await {
            Ok(true) => debug!("Container {} already running", id),
            Ok(false) => self.runtime.resume_container(id).await?,
            Err(e) if e.is_not_found() => {
                let spec = ContainerSpec {
                    id: id.to_string(),
                    image: self.settings.image.clone(),
                    workspace,
                    workdir: self.settings.workdir.clone(),
                    env: vec![("RUNBOX_SANDBOX_ID".to_string(), id.to_string())],
                };
                self.runtime.start_container(&spec).await?;
            }
            Err(e) => return Err(e),
        }

        let sandbox = self.go_live(id).await?;
        info!(
            "Sandbox {} created in {:.2}s",
            id,
            started.elapsed().as_secs_f64()
        );
        Ok(sandbox)
    }

    /// Probe before create: a leftover network with our name is reused
    async fn ensure_network(&self, id: &str) -> Result<()> {
        if self.runtime.network_exists(id).await? {
            debug!("Network for {} already exists", id);
        } else {
            self.runtime.create_network(id).await?;
            debug!("Created network for {}", id);
        }
        Ok(())
    }

    /// Resolve the (new) address, mark running, then republish the primary route
    async fn go_live(&self, id: &str) -> Result<Sandbox> {
        let address = self.runtime.internal_address(id).await?;
        let hostname = self.router.sandbox_hostname(id);
        let sandbox = self
            .update(id, |s| {
                s.state = SandboxState::Running;
                s.address = Some(address);
                if !s.hostnames.contains(&hostname) {
                    s.hostnames.push(hostname.clone());
                }
            })
            .ok_or_else(|| RunboxError::not_found(ResourceKind::Sandbox, id))?;

        let target = SocketAddr::new(address, self.settings.editor_port);
        self.router.publish(&hostname, target).await?;
        Ok(sandbox)
    }

    /// Make sure the sandbox's container is running, healing if it vanished.
    ///
    /// A container the runtime no longer knows is recreated under the same
    /// ID. A failed resume is retried once as a full recreate.
    pub async fn ensure_running(self: &Arc<Self>, id: &str) -> Result<Sandbox> {
        validate_id(id)?;
        let (sandbox, provisioned) = {
            let _guard = self.locks.lock(id).await;
            match self.runtime.inspect_running(id).await {
                Ok(true) => (self.adopt_running(id).await?, false),
                Ok(false) => {
                    info!("Container {} is not running, resuming", id);
                    match self.resume_locked(id).await {
                        Ok(sandbox) => (sandbox, true),
                        Err(e) => {
                            warn!("Resume of {} failed ({}), recreating container", id, e);
                            (self.recreate(id).await?, true)
                        }
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!("Container {} not found, provisioning a new one", id);
                    (self.provision(id).await?, true)
                }
                Err(e) => return Err(e),
            }
        };
        if provisioned {
            self.spawn_eviction();
        }
        Ok(sandbox)
    }

    /// A running container we may not have a current record for
    async fn adopt_running(&self, id: &str) -> Result<Sandbox> {
        if let Ok(sandbox) = self.get(id)
            && sandbox.is_running()
            && sandbox.address.is_some()
        {
            self.touch(id);
            return self.get(id);
        }
        debug!("Adopting running container {}", id);
        self.upsert_provisioning(id);
        self.go_live(id).await
    }

    async fn recreate(&self, id: &str) -> Result<Sandbox> {
        match self.runtime.remove_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.provision(id).await
    }

    /// Restart a stopped sandbox. The internal address is expected to change.
    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<Sandbox> {
        validate_id(id)?;
        let sandbox = {
            let _guard = self.locks.lock(id).await;
            self.resume_locked(id).await?
        };
        self.spawn_eviction();
        Ok(sandbox)
    }

    async fn resume_locked(&self, id: &str) -> Result<Sandbox> {
        let started = Instant::now();
        let known = self.records.contains_key(id);
        self.ensure_network(id).await?;
        if let Err(e) = self.runtime.resume_container(id).await {
            if !known
                && e.is_not_found()
                && let Err(cleanup) = self.runtime.remove_network(id).await
            {
                debug!("Failed to remove network for {}: {}", id, cleanup);
            }
            return Err(e);
        }
        self.upsert_provisioning(id);
        let sandbox = self.go_live(id).await?;
        info!(
            "Resumed sandbox {} in {:.2}s",
            id,
            started.elapsed().as_secs_f64()
        );
        Ok(sandbox)
    }

    /// Stop the container, tear down its network, release its port and routes.
    /// The workspace is kept.
    pub async fn stop(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<()> {
        let hook = self.on_stop.read().clone();
        if let Some(hook) = hook {
            hook(id);
        }
        match self.runtime.stop_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Container {} already gone", id),
            Err(e) => return Err(e),
        }
        if let Err(e) = self.runtime.remove_network(id).await {
            debug!("Failed to remove network for {}: {}", id, e);
        }
        let released = self.ports.release(id).await;

        let mut hostnames = self
            .records
            .get(id)
            .map(|r| r.sandbox.hostnames.clone())
            .unwrap_or_default();
        let mut owned = vec![self.router.sandbox_hostname(id)];
        owned.extend(released.map(|port| self.router.service_hostname(id, port)));
        for hostname in owned {
            if !hostnames.contains(&hostname) {
                hostnames.push(hostname);
            }
        }
        if let Err(e) = self.router.unpublish_all(&hostnames).await {
            warn!("Route cleanup for {} incomplete: {}", id, e);
        }

        self.update(id, |s| {
            s.state = SandboxState::Stopped;
            s.address = None;
            s.exposed_port = None;
            s.hostnames.clear();
        });
        info!("Stopped sandbox {}", id);
        Ok(())
    }

    /// Stop, then delete the container, the workspace and the record
    pub async fn destroy(&self, id: &str) -> Result<Sandbox> {
        validate_id(id)?;
        {
            let _guard = self.locks.lock(id).await;
            let known = self.records.contains_key(id);
            let container_known = match self.runtime.inspect_running(id).await {
                Ok(_) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if !known && !container_known {
                return Err(RunboxError::not_found(ResourceKind::Sandbox, id));
            }

            self.stop_locked(id).await?;
            match self.runtime.remove_container(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            let workspace = self.storage.workspace_path(id);
            self.storage.remove_directory(&workspace).await?;
        }
        self.locks.forget(id);

        let mut sandbox = match self.records.remove(id) {
            Some((_, record)) => record.sandbox,
            None => Sandbox {
                id: id.to_string(),
                workspace: self.storage.workspace_path(id),
                created_at: Utc::now(),
                last_used_at: Utc::now(),
                state: SandboxState::Destroyed,
                address: None,
                exposed_port: None,
                hostnames: Vec::new(),
            },
        };
        sandbox.state = SandboxState::Destroyed;
        info!("Destroyed sandbox {}", id);
        Ok(sandbox)
    }

    /// Publish a secondary route for a service inside the sandbox.
    ///
    /// With no `requested` port a host-unique port is allocated for the
    /// service to bind. With a `requested` port, something must already be
    /// listening on it inside the container on a non-loopback address.
    pub async fn expose_port(&self, id: &str, requested: Option<u16>) -> Result<ExposedService> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        let sandbox = self.get(id)?;
        let address = match (sandbox.state, sandbox.address) {
            (SandboxState::Running, Some(address)) => address,
            _ => {
                return Err(RunboxError::InvalidInput(format!(
                    "sandbox {} is not running",
                    id
                )));
            }
        };

        let port = match requested {
            Some(port) => {
                match self.runtime.port_state(id, port).await? {
                    ListenState::Listening => {}
                    ListenState::LoopbackOnly => {
                        return Err(RunboxError::InvalidInput(format!(
                            "service on port {} is bound to localhost only; bind it to 0.0.0.0",
                            port
                        )));
                    }
                    ListenState::NotListening => {
                        return Err(RunboxError::InvalidInput(format!(
                            "no service found listening on port {}; start your server on {} first",
                            port, port
                        )));
                    }
                }
                port
            }
            None => {
                let port = self.ports.allocate(id).await?;
                self.update(id, |s| s.exposed_port = Some(port));
                port
            }
        };

        let hostname = self.router.service_hostname(id, port);
        self.update(id, |s| {
            if !s.hostnames.contains(&hostname) {
                s.hostnames.push(hostname.clone());
            }
        });
        self.router
            .publish(&hostname, SocketAddr::new(address, port))
            .await?;
        self.touch(id);

        Ok(ExposedService {
            port,
            url: self.router.public_url(&hostname),
            hostname,
        })
    }

    /// Release the allocated service port and its route
    pub async fn release_port(&self, id: &str) -> Result<Option<u16>> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        let Some(port) = self.ports.release(id).await else {
            return Ok(None);
        };
        let hostname = self.router.service_hostname(id, port);
        self.update(id, |s| {
            s.exposed_port = None;
            s.hostnames.retain(|h| h != &hostname);
        });
        self.router.unpublish(&hostname).await?;
        Ok(Some(port))
    }

    /// Stop the least-recently-used running sandbox if more than `max_live`
    /// are running. Sandboxes with a command in flight are not candidates.
    ///
    /// The candidate is re-checked once its key lock is held: if it was used
    /// or leased in the meantime, another candidate is picked.
    pub async fn evict_if_over_capacity(&self, max_live: usize) -> Result<Option<String>> {
        let _sweep = self.eviction.lock().await;
        for _ in 0..EVICTION_ATTEMPTS {
            let Some((last_used, id)) = self.pick_victim(max_live).await? else {
                return Ok(None);
            };

            let _guard = self.locks.lock(&id).await;
            if self.in_flight(&id) > 0 || self.last_used(&id) != last_used {
                debug!("Eviction candidate {} became active, picking again", id);
                continue;
            }
            let running = self.runtime.list_running().await?;
            if running.len() <= max_live {
                return Ok(None);
            }
            if !running.iter().any(|c| c.id == id) {
                continue;
            }

            info!(
                "Evicting sandbox {} (last used {})",
                id,
                last_used.map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
            );
            self.stop_locked(&id).await?;
            return Ok(Some(id));
        }
        warn!("Eviction sweep gave up, candidates kept becoming active");
        Ok(None)
    }

    /// LRU candidate among idle running containers, with its last use as seen now
    async fn pick_victim(&self, max_live: usize) -> Result<Option<(Option<DateTime<Utc>>, String)>> {
        let running = self.runtime.list_running().await?;
        debug!("Eviction sweep: {} running, capacity {}", running.len(), max_live);
        if running.len() <= max_live {
            return Ok(None);
        }

        // Containers we have no record of sort first: their last use is unknown
        let victim = running
            .iter()
            .filter(|c| self.in_flight(&c.id) == 0)
            .map(|c| {
                let last_used = self.last_used(&c.id);
                let created = match self.records.get(&c.id) {
                    Some(r) => r.sandbox.created_at,
                    None => c.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
                };
                (
                    last_used.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    created,
                    last_used,
                    c.id.clone(),
                )
            })
            .min();

        match victim {
            Some((_, _, last_used, id)) => Ok(Some((last_used, id))),
            None => {
                warn!("Over capacity but every running sandbox is busy");
                Ok(None)
            }
        }
    }

    /// Run an eviction sweep in the background. Failures are only logged.
    pub fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let max_live = registry.settings.max_live;
            match registry.evict_if_over_capacity(max_live).await {
                Ok(Some(id)) => info!("Evicted sandbox {}", id),
                Ok(None) => {}
                Err(e) => warn!("Eviction sweep failed: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_create_provisions_everything() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();

        assert_eq!(sandbox.state, SandboxState::Running);
        assert!(sandbox.address.is_some());
        assert!(sandbox.workspace.is_dir());
        assert_eq!(sandbox.workspace, h.registry.workspace_path(&sandbox.id));
        assert!(h.runtime.is_running(&sandbox.id));
        assert!(h.runtime.has_network(&sandbox.id));

        let hostname = h.router.sandbox_hostname(&sandbox.id);
        let target = h.router.lookup(&hostname).unwrap();
        assert_eq!(target.ip(), sandbox.address.unwrap());
        assert_eq!(target.port(), 9999);
    }

    #[tokio::test]
    async fn test_create_with_existing_id_converges_after_partial_failure() {
        let h = Harness::new(3);
        h.runtime.fail_next_start();
        assert!(h.registry.create(Some("retry-me")).await.is_err());
        assert_eq!(h.registry.get("retry-me").unwrap().state, SandboxState::Provisioning);

        let sandbox = h.registry.create(Some("retry-me")).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::Running);
        assert_eq!(h.runtime.network_creates("retry-me"), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_id() {
        let h = Harness::new(3);
        let err = h.registry.create(Some("../etc")).await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_resume_gets_new_address_and_route() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let first = sandbox.address.unwrap();

        h.registry.stop(&sandbox.id).await.unwrap();
        assert!(!h.runtime.has_network(&sandbox.id));
        let stopped = h.registry.get(&sandbox.id).unwrap();
        assert_eq!(stopped.state, SandboxState::Stopped);
        assert!(stopped.workspace.is_dir());
        assert!(h.router.lookup(&h.router.sandbox_hostname(&sandbox.id)).is_none());

        let resumed = h.registry.resume(&sandbox.id).await.unwrap();
        let second = resumed.address.unwrap();
        assert_ne!(first, second);
        assert!(h.runtime.has_network(&sandbox.id));
        assert_eq!(
            h.router.lookup(&h.router.sandbox_hostname(&sandbox.id)).unwrap().ip(),
            second
        );
    }

    #[tokio::test]
    async fn test_resume_reuses_existing_network() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.runtime.stop_only_container(&sandbox.id);

        h.registry.resume(&sandbox.id).await.unwrap();
        assert_eq!(h.runtime.network_creates(&sandbox.id), 1);
    }

    #[tokio::test]
    async fn test_ensure_running_is_noop_when_running() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let starts = h.runtime.starts();

        let again = h.registry.ensure_running(&sandbox.id).await.unwrap();
        assert_eq!(again.address, sandbox.address);
        assert_eq!(h.runtime.starts(), starts);
    }

    #[tokio::test]
    async fn test_ensure_running_resumes_stopped() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.registry.stop(&sandbox.id).await.unwrap();

        let resumed = h.registry.ensure_running(&sandbox.id).await.unwrap();
        assert!(resumed.is_running());
        assert_ne!(resumed.address, sandbox.address);
    }

    #[tokio::test]
    async fn test_ensure_running_heals_unknown_container() {
        let h = Harness::new(3);
        let sandbox = h.registry.ensure_running("ghost123").await.unwrap();
        assert!(sandbox.is_running());
        assert!(h.runtime.is_running("ghost123"));
        assert!(h.router.lookup(&h.router.sandbox_hostname("ghost123")).is_some());
    }

    #[tokio::test]
    async fn test_ensure_running_falls_back_to_recreate_once() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.registry.stop(&sandbox.id).await.unwrap();
        h.runtime.fail_next_resume();

        let healed = h.registry.ensure_running(&sandbox.id).await.unwrap();
        assert!(healed.is_running());
        assert_eq!(h.runtime.removals(&sandbox.id), 1);
    }

    #[tokio::test]
    async fn test_ensure_running_surfaces_second_failure() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.registry.stop(&sandbox.id).await.unwrap();
        h.runtime.fail_next_resume();
        h.runtime.fail_next_start();

        let err = h.registry.ensure_running(&sandbox.id).await.unwrap_err();
        assert!(matches!(err, RunboxError::RuntimeInvocation { .. }));
    }

    #[tokio::test]
    async fn test_adopts_container_after_registry_restart() {
        let h = Harness::new(3);
        h.runtime.seed_running("survivor");
        let sandbox = h.registry.ensure_running("survivor").await.unwrap();
        assert!(sandbox.is_running());
        assert!(sandbox.address.is_some());
        assert_eq!(h.runtime.starts(), 0);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.registry.expose_port(&sandbox.id, None).await.unwrap();

        let destroyed = h.registry.destroy(&sandbox.id).await.unwrap();
        assert_eq!(destroyed.state, SandboxState::Destroyed);
        assert!(!sandbox.workspace.exists());
        assert!(h.registry.get(&sandbox.id).is_err());
        assert!(!h.runtime.exists(&sandbox.id));
        assert!(h.ports.lookup(&sandbox.id).await.is_none());
        assert!(h.router.routes().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_unknown_is_not_found() {
        let h = Harness::new(3);
        let err = h.registry.destroy("nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_capacity_one_stops_first_sandbox() {
        let h = Harness::new(1);
        let first = h.registry.create(None).await.unwrap();
        h.registry.expose_port(&first.id, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = h.registry.create(None).await.unwrap();

        h.registry.evict_if_over_capacity(1).await.unwrap();

        let first = h.registry.get(&first.id).unwrap();
        assert_eq!(first.state, SandboxState::Stopped);
        assert!(!h.runtime.is_running(&first.id));
        assert!(h.ports.lookup(&first.id).await.is_none());
        assert!(h.registry.get(&second.id).unwrap().is_running());
        assert!(h.runtime.is_running(&second.id));
    }

    #[tokio::test]
    async fn test_eviction_never_fires_within_capacity() {
        let h = Harness::new(3);
        for _ in 0..3 {
            h.registry.create(None).await.unwrap();
        }
        assert_eq!(h.registry.evict_if_over_capacity(3).await.unwrap(), None);
        assert_eq!(h.runtime.list_running_now().len(), 3);
    }

    #[tokio::test]
    async fn test_eviction_is_strict_lru() {
        let h = Harness::new(10);
        let a = h.registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = h.registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let c = h.registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // a becomes the most recent, b is now least recently used
        h.registry.touch(&a.id);

        let evicted = h.registry.evict_if_over_capacity(2).await.unwrap();
        assert_eq!(evicted.as_deref(), Some(b.id.as_str()));
        assert!(h.registry.get(&a.id).unwrap().is_running());
        assert!(h.registry.get(&c.id).unwrap().is_running());
    }

    #[tokio::test]
    async fn test_eviction_prefers_unknown_containers() {
        let h = Harness::new(10);
        h.registry.create(None).await.unwrap();
        h.runtime.seed_running("orphan");
        let evicted = h.registry.evict_if_over_capacity(1).await.unwrap();
        assert_eq!(evicted.as_deref(), Some("orphan"));
    }

    #[tokio::test]
    async fn test_eviction_skips_leased_sandbox() {
        let h = Harness::new(10);
        let a = h.registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = h.registry.create(None).await.unwrap();

        let lease = h.registry.lease(&a.id).unwrap();
        let evicted = h.registry.evict_if_over_capacity(1).await.unwrap();
        assert_eq!(evicted.as_deref(), Some(b.id.as_str()));
        drop(lease);
        assert_eq!(h.registry.in_flight(&a.id), 0);
    }

    #[tokio::test]
    async fn test_eviction_rechecks_candidate_under_lock() {
        let h = Harness::new(10);
        let a = h.registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = h.registry.create(None).await.unwrap();

        // A command on `a` holds its lock while the sweep picks `a`
        let guard = h.registry.locks.lock(&a.id).await;
        let registry = h.registry.clone();
        let sweep = tokio::spawn(async move { registry.evict_if_over_capacity(1).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let lease = h.registry.lease(&a.id).unwrap();
        h.registry.touch(&a.id);
        drop(guard);

        let evicted = sweep.await.unwrap().unwrap();
        assert_eq!(evicted.as_deref(), Some(b.id.as_str()));
        assert!(h.runtime.is_running(&a.id));
        assert!(h.registry.get(&a.id).unwrap().is_running());
        drop(lease);
    }

    #[tokio::test]
    async fn test_eviction_runs_stop_hook() {
        let h = Harness::new(10);
        let stopped = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen = stopped.clone();
        h.registry
            .set_stop_hook(Arc::new(move |id: &str| seen.lock().push(id.to_string())));

        let a = h.registry.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        h.registry.create(None).await.unwrap();

        h.registry.evict_if_over_capacity(1).await.unwrap();
        assert_eq!(*stopped.lock(), vec![a.id.clone()]);
    }

    #[tokio::test]
    async fn test_resume_unknown_leaves_no_record() {
        let h = Harness::new(3);
        let err = h.registry.resume("unknown").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(h.registry.get("unknown").is_err());
        assert!(h.registry.list().is_empty());
        assert!(!h.runtime.has_network("unknown"));
    }

    #[tokio::test]
    async fn test_stop_leaves_other_sandbox_routes() {
        let h = Harness::new(10);
        let a = h.registry.create(Some("abc")).await.unwrap();
        let b = h.registry.create(Some("abcd")).await.unwrap();
        let service = h.registry.expose_port(&a.id, None).await.unwrap();
        h.registry.expose_port(&b.id, None).await.unwrap();

        h.registry.stop(&a.id).await.unwrap();
        assert!(h.router.lookup(&service.hostname).is_none());
        assert!(h.router.lookup(&h.router.sandbox_hostname(&a.id)).is_none());

        let remaining: Vec<String> = h.router.routes().into_iter().map(|r| r.hostname).collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|name| name.starts_with("abcd")));
        assert!(h.runtime.is_running(&b.id));
    }

    #[tokio::test]
    async fn test_service_hostname_cannot_shadow_sandbox() {
        let h = Harness::new(10);
        let err = h.registry.create(Some("abc-3000")).await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
        let err = h.registry.ensure_running("abc-3000").await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_eviction_failure_is_swallowed() {
        let h = Harness::new(1);
        h.registry.create(None).await.unwrap();
        h.runtime.fail_list();
        // Detached sweep must not panic or surface anything
        h.registry.spawn_eviction().await.unwrap();
        assert!(h.registry.create(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_expose_port_allocates_and_publishes() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let service = h.registry.expose_port(&sandbox.id, None).await.unwrap();

        assert_eq!(h.ports.lookup(&sandbox.id).await, Some(service.port));
        assert_eq!(service.hostname, h.router.service_hostname(&sandbox.id, service.port));
        assert_eq!(service.url, format!("http://{}", service.hostname));
        let target = h.router.lookup(&service.hostname).unwrap();
        assert_eq!(target.ip(), sandbox.address.unwrap());
        assert_eq!(target.port(), service.port);
        assert_eq!(
            h.registry.get(&sandbox.id).unwrap().exposed_port,
            Some(service.port)
        );

        let again = h.registry.expose_port(&sandbox.id, None).await.unwrap();
        assert_eq!(again.port, service.port);
    }

    #[tokio::test]
    async fn test_expose_requested_port_checks_listener() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();

        let err = h.registry.expose_port(&sandbox.id, Some(3000)).await.unwrap_err();
        assert!(err.to_string().contains("no service found"));

        h.runtime.set_port_state(&sandbox.id, 5000, ListenState::LoopbackOnly);
        let err = h.registry.expose_port(&sandbox.id, Some(5000)).await.unwrap_err();
        assert!(err.to_string().contains("localhost"));

        h.runtime.set_port_state(&sandbox.id, 3000, ListenState::Listening);
        let service = h.registry.expose_port(&sandbox.id, Some(3000)).await.unwrap();
        assert_eq!(service.port, 3000);
        assert!(h.ports.lookup(&sandbox.id).await.is_none());
    }

    #[tokio::test]
    async fn test_expose_on_stopped_sandbox_fails() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.registry.stop(&sandbox.id).await.unwrap();
        let err = h.registry.expose_port(&sandbox.id, None).await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_release_port() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let service = h.registry.expose_port(&sandbox.id, None).await.unwrap();

        assert_eq!(
            h.registry.release_port(&sandbox.id).await.unwrap(),
            Some(service.port)
        );
        assert!(h.router.lookup(&service.hostname).is_none());
        assert_eq!(h.registry.release_port(&sandbox.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_proxy_reload_failure_surfaces_but_sandbox_runs() {
        let h = Harness::new(3);
        h.proxy.fail_reloads(true);
        let err = h.registry.create(Some("noreload")).await.unwrap_err();
        assert!(matches!(err, RunboxError::ProxyReload(_)));
        assert!(h.registry.get("noreload").unwrap().is_running());
        assert!(h.proxy.descriptor(&h.router.sandbox_hostname("noreload")).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_running_starts_one_container() {
        let h = Harness::new(3);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = h.registry.clone();
            handles.push(tokio::spawn(async move {
                registry.ensure_running("shared").await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_running());
        }
        assert_eq!(h.runtime.starts(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&SandboxState::Stopped).unwrap(),
            "\"stopped\""
        );
    }

    #[tokio::test]
    async fn test_editor_url() {
        let h = Harness::new(3);
        assert_eq!(h.registry.editor_url("abc"), "http://abc.runbox.ai/?folder=/home");
    }
}
