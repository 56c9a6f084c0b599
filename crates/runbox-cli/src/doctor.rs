//! Doctor — host checks before serving sandboxes

use runbox_core::RunboxConfig;
use runbox_core::runtime::DockerCli;
use std::path::Path;
use tracing::{info, warn};

/// Result of a single check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub fix_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn is_healthy(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} warnings, {} failed",
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Warn),
            self.count(CheckStatus::Fail)
        )
    }
}

pub async fn run_doctor(config: &RunboxConfig) -> DoctorReport {
    info!("Running doctor checks...");
    let checks = vec![
        check_runtime(config).await,
        check_writable("workspace_root", &config.workspace_root),
        check_writable("proxy_descriptors", &config.proxy.descriptor_dir),
        check_api_key(config),
    ];

    let report = DoctorReport { checks };
    if report.is_healthy() {
        info!("Doctor: {}", report.summary());
    } else {
        warn!("Doctor: issues found ({})", report.summary());
    }
    report
}

async fn check_runtime(config: &RunboxConfig) -> CheckResult {
    let runtime = DockerCli::new(config.runtime.clone());
    if runtime.is_available().await {
        CheckResult {
            name: "container_runtime",
            status: CheckStatus::Pass,
            message: format!("{} answers", config.runtime.binary),
            fix_hint: None,
        }
    } else {
        CheckResult {
            name: "container_runtime",
            status: CheckStatus::Fail,
            message: format!("`{} info` failed", config.runtime.binary),
            fix_hint: Some("Start the Docker daemon or set runtime.use_sudo".to_string()),
        }
    }
}

fn check_writable(name: &'static str, dir: &Path) -> CheckResult {
    if writable_dir(dir) {
        CheckResult {
            name,
            status: CheckStatus::Pass,
            message: format!("{} is writable", dir.display()),
            fix_hint: None,
        }
    } else {
        CheckResult {
            name,
            status: CheckStatus::Fail,
            message: format!("Cannot write to {}", dir.display()),
            fix_hint: Some(format!("mkdir -p {0} && chown $USER {0}", dir.display())),
        }
    }
}

fn check_api_key(config: &RunboxConfig) -> CheckResult {
    match config.gateway.api_key {
        Some(_) => CheckResult {
            name: "api_key",
            status: CheckStatus::Pass,
            message: "API key configured".to_string(),
            fix_hint: None,
        },
        None => CheckResult {
            name: "api_key",
            status: CheckStatus::Warn,
            message: "No API key; the gateway accepts every request".to_string(),
            fix_hint: Some("Set gateway.api_key or RUNBOX_API_KEY".to_string()),
        },
    }
}

/// Exists (or can be created) and accepts a new file
fn writable_dir(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".runbox-doctor");
    let ok = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}
