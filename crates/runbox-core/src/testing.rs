//! In-memory collaborators for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::config::RunboxConfig;
use crate::error::{ResourceKind, Result, RunboxError};
use crate::ports::{HostPortProbe, PortAllocator};
use crate::proxy::{ProxyBackend, ProxyRouter};
use crate::registry::SandboxRegistry;
use crate::runtime::{ContainerRuntime, ContainerSpec, ListenState, RunningContainer};
use crate::session::SessionManager;
use crate::session::pty::{Terminal, TerminalIo, TerminalSize, TerminalSpawner};
use crate::storage::LocalWorkspaceStorage;

/// Probe reporting a fixed set of bound ports
pub struct StaticProbe(pub HashSet<u16>);

#[async_trait]
impl HostPortProbe for StaticProbe {
    async fn bound_ports(&self) -> Result<HashSet<u16>> {
        Ok(self.0.clone())
    }
}

/// Proxy backend that keeps descriptors in memory
#[derive(Default)]
pub struct MemoryProxy {
    descriptors: Mutex<HashMap<String, SocketAddr>>,
    reloads: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryProxy {
    pub fn descriptor(&self, hostname: &str) -> Option<SocketAddr> {
        self.descriptors.lock().get(hostname).copied()
    }

    /// Successful reloads so far
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn fail_reloads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyBackend for MemoryProxy {
    async fn write_route_descriptor(&self, hostname: &str, target: SocketAddr) -> Result<()> {
        self.descriptors.lock().insert(hostname.to_string(), target);
        Ok(())
    }

    async fn remove_route_descriptor(&self, hostname: &str) -> Result<bool> {
        Ok(self.descriptors.lock().remove(hostname).is_some())
    }

    async fn reload(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RunboxError::ProxyReload("nginx: [emerg] test failure".to_string()));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeContainer {
    running: bool,
    address: IpAddr,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RuntimeState {
    containers: HashMap<String, FakeContainer>,
    networks: HashSet<String>,
    network_creates: HashMap<String, usize>,
    removals: HashMap<String, usize>,
    port_states: HashMap<(String, u16), ListenState>,
    starts: usize,
    addresses_issued: u32,
    fail_next_start: bool,
    fail_next_resume: bool,
    fail_list: bool,
}

impl RuntimeState {
    /// Every start hands out a new address, like a fresh network attachment
    fn next_address(&mut self) -> IpAddr {
        self.addresses_issued += 1;
        let n = self.addresses_issued;
        IpAddr::V4(Ipv4Addr::new(172, 18, (n / 250) as u8, (n % 250 + 2) as u8))
    }
}

/// Container runtime that behaves like Docker for the calls we make
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .containers
            .get(id)
            .is_some_and(|c| c.running)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state.lock().containers.contains_key(id)
    }

    pub fn has_network(&self, id: &str) -> bool {
        self.state.lock().networks.contains(id)
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn network_creates(&self, id: &str) -> usize {
        self.state.lock().network_creates.get(id).copied().unwrap_or(0)
    }

    pub fn removals(&self, id: &str) -> usize {
        self.state.lock().removals.get(id).copied().unwrap_or(0)
    }

    pub fn fail_next_start(&self) {
        self.state.lock().fail_next_start = true;
    }

    pub fn fail_next_resume(&self) {
        self.state.lock().fail_next_resume = true;
    }

    pub fn fail_list(&self) {
        self.state.lock().fail_list = true;
    }

    /// A container that survived a control-plane restart
    pub fn seed_running(&self, id: &str) {
        let mut state = self.state.lock();
        let address = state.next_address();
        state.networks.insert(id.to_string());
        state.containers.insert(
            id.to_string(),
            FakeContainer {
                running: true,
                address,
                created_at: Utc::now(),
            },
        );
    }

    /// Stop the container but leave its network behind
    pub fn stop_only_container(&self, id: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.running = false;
        }
    }

    pub fn set_port_state(&self, id: &str, port: u16, listen: ListenState) {
        self.state
            .lock()
            .port_states
            .insert((id.to_string(), port), listen);
    }

    pub fn list_running_now(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn missing_container(id: &str) -> RunboxError {
    RunboxError::not_found(ResourceKind::Container, id)
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start_container(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_start) {
            return Err(RunboxError::runtime("docker run", "image pull failed"));
        }
        if state.containers.contains_key(&spec.id) {
            return Err(RunboxError::runtime(
                "docker run",
                format!("container name \"/{}\" is already in use", spec.id),
            ));
        }
        if !state.networks.contains(&spec.id) {
            return Err(RunboxError::not_found(
                ResourceKind::Network,
                format!("{}-network", spec.id),
            ));
        }
        let address = state.next_address();
        state.starts += 1;
        state.containers.insert(
            spec.id.clone(),
            FakeContainer {
                running: true,
                address,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| missing_container(id))?;
        container.running = false;
        Ok(())
    }

    async fn resume_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_resume) {
            return Err(RunboxError::runtime("docker start", "network not attachable"));
        }
        if !state.containers.contains_key(id) {
            return Err(missing_container(id));
        }
        if !state.networks.contains(id) {
            return Err(RunboxError::runtime("docker start", "network is missing"));
        }
        let address = state.next_address();
        if let Some(container) = state.containers.get_mut(id) {
            container.running = true;
            container.address = address;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.containers.remove(id).ok_or_else(|| missing_container(id))?;
        *state.removals.entry(id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn inspect_running(&self, id: &str) -> Result<bool> {
        let state = self.state.lock();
        state
            .containers
            .get(id)
            .map(|c| c.running)
            .ok_or_else(|| missing_container(id))
    }

    async fn internal_address(&self, id: &str) -> Result<IpAddr> {
        let state = self.state.lock();
        let container = state.containers.get(id).ok_or_else(|| missing_container(id))?;
        if !container.running {
            return Err(RunboxError::runtime(
                "docker inspect",
                format!("container {} has no address", id),
            ));
        }
        Ok(container.address)
    }

    async fn network_exists(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().networks.contains(id))
    }

    async fn create_network(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.networks.insert(id.to_string()) {
            return Err(RunboxError::runtime(
                "docker network",
                format!("network with name {}-network already exists", id),
            ));
        }
        *state.network_creates.entry(id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        if self.state.lock().networks.remove(id) {
            Ok(())
        } else {
            Err(RunboxError::not_found(
                ResourceKind::Network,
                format!("{}-network", id),
            ))
        }
    }

    async fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(RunboxError::runtime("docker ps", "daemon unavailable"));
        }
        let mut running: Vec<RunningContainer> = state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, c)| RunningContainer {
                id: id.clone(),
                created_at: Some(c.created_at),
            })
            .collect();
        running.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(running)
    }

    async fn port_state(&self, id: &str, port: u16) -> Result<ListenState> {
        let state = self.state.lock();
        if !state.containers.contains_key(id) {
            return Err(missing_container(id));
        }
        Ok(state
            .port_states
            .get(&(id.to_string(), port))
            .copied()
            .unwrap_or(ListenState::NotListening))
    }

    fn attach_command(&self, id: &str) -> Vec<String> {
        vec!["fake-shell".to_string(), id.to_string()]
    }
}

const PROMPT: &str = "\u{1b}[01;32mroot@sandbox\u{1b}[00m:/home# ";

#[derive(Default)]
struct ShellLog {
    argv: Vec<Vec<String>>,
    writes: Vec<String>,
    sentinels: Vec<String>,
    kills: usize,
    sleeping: Vec<(mpsc::UnboundedSender<Vec<u8>>, String)>,
}

/// Terminal spawner whose shells understand just enough of the wrapped
/// command line: `echo`, `sleep` (never finishes on its own) and `exit`
pub struct FakeSpawner {
    silent: bool,
    log: Arc<Mutex<ShellLog>>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            silent: false,
            log: Arc::default(),
        }
    }

    /// Shells that never print a prompt
    pub fn silent() -> Self {
        Self {
            silent: true,
            log: Arc::default(),
        }
    }

    pub fn spawned_argv(&self) -> Vec<Vec<String>> {
        self.log.lock().argv.clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.log.lock().writes.clone()
    }

    pub fn sentinels(&self) -> Vec<String> {
        self.log.lock().sentinels.clone()
    }

    pub fn kills(&self) -> usize {
        self.log.lock().kills
    }

    /// Let every sleeping command finish, printing `output`
    pub fn finish_sleeps(&self, output: &str) {
        let sleeping = std::mem::take(&mut self.log.lock().sleeping);
        for (tx, sentinel) in sleeping {
            emit(&tx, &format!("{}\r\n{}\r\n{}", output, sentinel, PROMPT));
        }
    }
}

/// Deliver in small chunks so sentinels straddle chunk boundaries
fn emit(tx: &mpsc::UnboundedSender<Vec<u8>>, text: &str) {
    for chunk in text.as_bytes().chunks(7) {
        let _ = tx.send(chunk.to_vec());
    }
}

/// `sh -c '<cmd>; echo <sentinel>'` back into `(cmd, sentinel)`
fn parse_wrapped(line: &str) -> Option<(String, String)> {
    let body = line.strip_prefix("sh -c '")?.strip_suffix('\'')?;
    let body = body.replace(r"'\''", "'");
    let (head, sentinel) = body.rsplit_once("echo ")?;
    let command = head.trim_end().trim_end_matches(';').trim().to_string();
    Some((command, sentinel.to_string()))
}

struct FakeShell {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    log: Arc<Mutex<ShellLog>>,
}

impl TerminalIo for FakeShell {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let raw = String::from_utf8_lossy(data).into_owned();
        self.log.lock().writes.push(raw.clone());
        let tx = self
            .tx
            .clone()
            .ok_or_else(|| RunboxError::runtime("pty write", "terminal closed"))?;

        let line = raw.trim_end_matches('\r');
        emit(&tx, &format!("{}\r\n", line));
        let Some((command, sentinel)) = parse_wrapped(line) else {
            emit(&tx, PROMPT);
            return Ok(());
        };
        self.log.lock().sentinels.push(sentinel.clone());

        if command == "exit" {
            self.tx = None;
            return Ok(());
        }
        if command.starts_with("sleep") {
            self.log.lock().sleeping.push((tx, sentinel));
            return Ok(());
        }
        let output = match command.strip_prefix("echo ") {
            Some(rest) => rest.to_string(),
            None => format!("ran: {}", command),
        };
        emit(&tx, &format!("{}\r\n{}\r\n{}", output, sentinel, PROMPT));
        Ok(())
    }

    fn kill(&mut self) {
        self.tx = None;
        self.log.lock().kills += 1;
    }

    fn has_exited(&mut self) -> bool {
        self.tx.is_none()
    }
}

impl TerminalSpawner for FakeSpawner {
    fn spawn(&self, argv: &[String], _size: TerminalSize) -> Result<Terminal> {
        self.log.lock().argv.push(argv.to_vec());
        let (tx, rx) = mpsc::unbounded_channel();
        emit(&tx, "Welcome to the sandbox\r\n");
        if !self.silent {
            emit(&tx, PROMPT);
        }
        Ok(Terminal {
            io: Box::new(FakeShell {
                tx: Some(tx),
                log: self.log.clone(),
            }),
            output: rx,
        })
    }
}

/// Registry and session manager wired to fakes over a scratch directory
pub struct Harness {
    pub config: RunboxConfig,
    pub registry: Arc<SandboxRegistry>,
    pub sessions: Arc<SessionManager>,
    pub runtime: Arc<FakeRuntime>,
    pub proxy: Arc<MemoryProxy>,
    pub router: Arc<ProxyRouter>,
    pub ports: Arc<PortAllocator>,
    pub spawner: Arc<FakeSpawner>,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir, max_live: usize) -> RunboxConfig {
    let mut config = RunboxConfig::default();
    config.workspace_root = dir.path().join("workspaces");
    config.max_live_sandboxes = max_live;
    config.ports.floor = 3000;
    config.ports.ceiling = 3100;
    config.sessions.default_timeout_secs = 5;
    config.sessions.ready_timeout_secs = 1;
    config
}

impl Harness {
    pub fn new(max_live: usize) -> Self {
        Self::build(max_live, FakeSpawner::new(), None)
    }

    pub fn with_spawner(max_live: usize, spawner: FakeSpawner) -> Self {
        Self::build(max_live, spawner, None)
    }

    pub fn with_output_cap(max_live: usize, max_output_bytes: usize) -> Self {
        Self::build(max_live, FakeSpawner::new(), Some(max_output_bytes))
    }

    fn build(max_live: usize, spawner: FakeSpawner, output_cap: Option<usize>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, max_live);
        if let Some(cap) = output_cap {
            config.sessions.max_output_bytes = cap;
        }

        let runtime = Arc::new(FakeRuntime::default());
        let proxy = Arc::new(MemoryProxy::default());
        let router = Arc::new(ProxyRouter::new(proxy.clone(), &config.proxy));
        let ports = Arc::new(PortAllocator::new(
            config.ports.clone(),
            Arc::new(StaticProbe(HashSet::new())),
        ));
        let storage = Arc::new(LocalWorkspaceStorage::new(&config.workspace_root));
        let registry = Arc::new(SandboxRegistry::new(
            &config,
            runtime.clone(),
            storage,
            ports.clone(),
            router.clone(),
        ));
        let spawner = Arc::new(spawner);
        let sessions = Arc::new(SessionManager::new(
            &config.sessions,
            registry.clone(),
            spawner.clone(),
        ));

        Self {
            config,
            registry,
            sessions,
            runtime,
            proxy,
            router,
            ports,
            spawner,
            dir,
        }
    }
}
