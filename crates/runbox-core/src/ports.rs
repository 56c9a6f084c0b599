//! Port allocator — host-unique ports for sandbox-exposed services
//!
//! A candidate port must be free both in our own reservation map and in the
//! host's listening-socket table. The host check is not atomic with whatever
//! later binds the port, so callers retry allocation when that bind fails.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PortRange;
use crate::error::{Result, RunboxError};

/// Source of truth for which ports are already bound on the host
#[async_trait]
pub trait HostPortProbe: Send + Sync {
    async fn bound_ports(&self) -> Result<HashSet<u16>>;
}

/// Reads the kernel socket tables under `/proc/net`
pub struct ProcNetProbe {
    root: PathBuf,
}

const TCP_LISTEN: &str = "0A";

impl ProcNetProbe {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc/net"),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract local ports from a `/proc/net/{tcp,udp}[6]` table.
/// TCP sockets count only in LISTEN state; any UDP socket counts as bound.
fn parse_socket_table(content: &str, tcp: bool) -> impl Iterator<Item = u16> + '_ {
    content.lines().skip(1).filter_map(move |line| {
        let mut fields = line.split_whitespace();
        let local = fields.nth(1)?;
        let state = fields.nth(1)?;
        if tcp && state != TCP_LISTEN {
            return None;
        }
        let (_, port_hex) = local.rsplit_once(':')?;
        u16::from_str_radix(port_hex, 16).ok()
    })
}

#[async_trait]
impl HostPortProbe for ProcNetProbe {
    async fn bound_ports(&self) -> Result<HashSet<u16>> {
        let mut ports = HashSet::new();
        for (table, tcp) in [("tcp", true), ("tcp6", true), ("udp", false), ("udp6", false)] {
            let path = self.root.join(table);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => ports.extend(parse_socket_table(&content, tcp)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Socket table {} not present", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ports)
    }
}

/// Hands out one port per sandbox from a fixed range
pub struct PortAllocator {
    range: PortRange,
    probe: Arc<dyn HostPortProbe>,
    reservations: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange, probe: Arc<dyn HostPortProbe>) -> Self {
        Self {
            range,
            probe,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a port for `sandbox_id`, or return the one it already holds.
    ///
    /// Scans upward from the range floor. Fails with `Exhausted` when every
    /// port in the range is reserved, excluded, or bound on the host.
    pub async fn allocate(&self, sandbox_id: &str) -> Result<u16> {
        let mut reservations = self.reservations.lock().await;
        if let Some(port) = reservations.get(sandbox_id) {
            debug!("Sandbox {} already holds port {}", sandbox_id, port);
            return Ok(*port);
        }

        let bound = self.probe.bound_ports().await?;
        let held: HashSet<u16> = reservations.values().copied().collect();

        for port in self.range.floor..=self.range.ceiling {
            if self.range.excluded.contains(&port) || held.contains(&port) || bound.contains(&port)
            {
                continue;
            }
            reservations.insert(sandbox_id.to_string(), port);
            info!("Allocated port {} to sandbox {}", port, sandbox_id);
            return Ok(port);
        }

        warn!(
            "Port range {}-{} exhausted ({} reservations)",
            self.range.floor,
            self.range.ceiling,
            reservations.len()
        );
        Err(RunboxError::Exhausted {
            floor: self.range.floor,
            ceiling: self.range.ceiling,
        })
    }

    /// Drop the reservation for `sandbox_id`, returning the freed port
    pub async fn release(&self, sandbox_id: &str) -> Option<u16> {
        let released = self.reservations.lock().await.remove(sandbox_id);
        if let Some(port) = released {
            info!("Released port {} from sandbox {}", port, sandbox_id);
        }
        released
    }

    pub async fn lookup(&self, sandbox_id: &str) -> Option<u16> {
        self.reservations.lock().await.get(sandbox_id).copied()
    }

    /// Snapshot of all live reservations, sorted by port
    pub async fn reservations(&self) -> Vec<(String, u16)> {
        let mut all: Vec<(String, u16)> = self
            .reservations
            .lock()
            .await
            .iter()
            .map(|(id, port)| (id.clone(), *port))
            .collect();
        all.sort_by_key(|(_, port)| *port);
        all
    }
}
