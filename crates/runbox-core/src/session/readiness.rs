//! Deciding when a freshly attached shell can take commands
//!
//! The default detector looks for a shell prompt at the end of the output.
//! It is a heuristic: a login banner ending in `$ ` fools it. Images that
//! print a known marker from their init script can opt into
//! [`MarkerReadiness`] instead.

use std::sync::Arc;

use crate::config::SessionConfig;

pub trait ReadinessDetector: Send + Sync {
    /// `output` is everything the shell has printed so far, ANSI-stripped
    fn is_ready(&self, output: &str) -> bool;
    fn name(&self) -> &'static str;
}

/// Ready once the last line ends in a `$ ` or `# ` prompt
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptHeuristic;

impl ReadinessDetector for PromptHeuristic {
    fn is_ready(&self, output: &str) -> bool {
        let last_line = output.rsplit('\n').next().unwrap_or(output);
        let last_line = last_line.trim_start_matches('\r');
        last_line.ends_with("$ ") || last_line.ends_with("# ")
    }

    fn name(&self) -> &'static str {
        "prompt"
    }
}

/// Ready once an explicit marker has been printed
#[derive(Debug, Clone)]
pub struct MarkerReadiness {
    marker: String,
}

impl MarkerReadiness {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl ReadinessDetector for MarkerReadiness {
    fn is_ready(&self, output: &str) -> bool {
        output.contains(&self.marker)
    }

    fn name(&self) -> &'static str {
        "marker"
    }
}

pub fn detector_for(config: &SessionConfig) -> Arc<dyn ReadinessDetector> {
    match config.ready_marker.as_deref() {
        Some(marker) if !marker.is_empty() => Arc::new(MarkerReadiness::new(marker)),
        _ => Arc::new(PromptHeuristic),
    }
}
