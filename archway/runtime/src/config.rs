//! Runner configuration.

use std::path::PathBuf;

use archway_dagger::ProcessConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default guest export invoked once per event.
pub const DEFAULT_ENTRY_POINT: &str = "cwa_main";

/// Default control topic carrying handler creation requests.
pub const DEFAULT_CREATE_TOPIC: &str = "archway.internal.handler_create";

/// Default control topic carrying handler destruction requests.
pub const DEFAULT_DESTROY_TOPIC: &str = "archway.internal.handler_destroy";

/// Configuration for a [`Runner`](crate::Runner).
///
/// Every field has a default, so `{}` is a valid config:
///
/// ```ignore
/// let config = RunnerConfig::from_json(r#"{ "jail_root": "/srv/guests" }"#)?;
/// assert_eq!(config.entry_point, "cwa_main");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Guest export invoked per event. Takes no parameters.
    pub entry_point: String,

    pub create_topic: String,

    pub destroy_topic: String,

    /// Root directory for `file://` URLs. Without one, guests cannot open
    /// files.
    pub jail_root: Option<PathBuf>,

    /// Fuel granted to each invocation. `None` disables metering.
    pub fuel_per_invocation: Option<u64>,

    /// Upper bound on a guest's linear memory.
    pub max_memory_bytes: Option<usize>,

    /// Whether guests may open `fd://N`.
    pub allow_host_descriptors: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            create_topic: DEFAULT_CREATE_TOPIC.to_string(),
            destroy_topic: DEFAULT_DESTROY_TOPIC.to_string(),
            jail_root: None,
            fuel_per_invocation: None,
            max_memory_bytes: None,
            allow_host_descriptors: true,
        }
    }
}

impl RunnerConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The per-process slice of this config.
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            allow_host_descriptors: self.allow_host_descriptors,
        }
    }
}
