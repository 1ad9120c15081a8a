use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::progress::ProgressMode;

/// Connection to one environment. The secret never comes from the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: String,
    pub tenant_id: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: String,
}

impl ConnectionConfig {
    /// Copy of this connection pointing at another environment with the same
    /// service principal.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

/// Poll cadence and attempt budgets for async job tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub start_attempts: u32,
    pub start_interval_ms: u64,
    pub resolve_attempts: u32,
    pub resolve_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub publish_interval_ms: u64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            start_attempts: 10,
            start_interval_ms: 1500,
            resolve_attempts: 120,
            resolve_interval_ms: 5000,
            poll_interval_ms: 5000,
            publish_interval_ms: 5000,
        }
    }
}

impl TrackingSettings {
    /// Same budgets, no waiting. For tests and local fakes.
    pub fn immediate() -> Self {
        Self {
            start_interval_ms: 0,
            resolve_interval_ms: 0,
            poll_interval_ms: 0,
            publish_interval_ms: 0,
            ..Self::default()
        }
    }

    pub fn start_interval(&self) -> Duration {
        Duration::from_millis(self.start_interval_ms)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub tracking: TrackingSettings,
    pub progress: ProgressMode,
    /// Fail the command when any plan item failed to apply.
    pub strict: bool,
}

impl Config {
    pub fn trace_loaded(&self) {
        info!(
            url = %self.connection.url,
            progress = ?self.progress,
            strict = self.strict,
            "Loaded Config"
        );
        debug!(tracking = ?self.tracking, "Config loaded (tracking detail)");
    }
}
