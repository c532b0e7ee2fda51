//! Runtime configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{RecorderError, Result};

/// Tunables consumed by the controller, workers, and control server.
///
/// Loaded from a JSON file when one is given; any key left out keeps its
/// default, and unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Inlet buffer duration handed to the transport, in seconds.
    pub buffer_seconds: u32,
    /// Upper bound on samples per pull.
    pub max_samples_per_pull: usize,
    /// How long a single pull may block.
    pub pull_timeout_s: f64,
    /// Period between ClockOffset emissions per stream.
    pub clock_sync_interval_s: f64,
    /// How long stream discovery waits.
    pub discovery_timeout_s: f64,
    /// Bound on joining acquisition workers at stop.
    pub stop_timeout_s: f64,
    /// Control server bind address.
    pub bind_address: String,
    /// Control server port.
    pub port: u16,
    /// Whether to start the control server at all.
    pub enable_remote_control: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 360,
            max_samples_per_pull: 500,
            pull_timeout_s: 0.2,
            clock_sync_interval_s: 5.0,
            discovery_timeout_s: 2.0,
            stop_timeout_s: 5.0,
            bind_address: "127.0.0.1".to_string(),
            port: 22345,
            enable_remote_control: true,
        }
    }
}

impl RecorderConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|err| RecorderError::BadRequest(format!("invalid config file: {err}")))
    }
}
