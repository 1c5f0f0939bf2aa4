// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hub configuration: the cluster layout and orchestrator settings,
//! loaded from a TOML file in the state directory.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::time::Duration;

use step_engine::SubstepStore;

/// Name of the substep status file within the state directory.
pub const SUBSTEP_FILE: &str = "substeps.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("config file {path} is malformed")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },

    #[error("failed to write config file {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// The coordinator node's directory layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub hostname: String,
    pub source_data_dir: Utf8PathBuf,
    pub target_data_dir: Utf8PathBuf,
    pub port: u16,
}

/// One primary segment and, optionally, its mirror.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentConfig {
    pub hostname: String,
    pub source_data_dir: Utf8PathBuf,
    pub target_data_dir: Utf8PathBuf,
    pub port: u16,
    #[serde(default)]
    pub mirror_hostname: Option<String>,
    #[serde(default)]
    pub mirror_data_dir: Option<Utf8PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// The orchestrator's working directory: substep status file, saved
    /// cluster configs, logs. One orchestrator instance per state
    /// directory; that exclusivity is what lets the substep store go
    /// unlocked.
    pub state_dir: Utf8PathBuf,

    pub agent_port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Minimum fraction of each data filesystem that must be free before
    /// initialize proceeds.
    #[serde(default = "default_disk_free_ratio")]
    pub disk_free_ratio: f64,

    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_disk_free_ratio() -> f64 {
    0.2
}

impl HubConfig {
    pub fn load(path: &Utf8Path) -> Result<HubConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Read { path: path.to_owned(), err }
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            err,
        })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).expect("config always serializes");
        std::fs::write(path, contents).map_err(|err| ConfigError::Write {
            path: path.to_owned(),
            err,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Every distinct segment host, primaries and mirrors alike, in
    /// stable order. The coordinator is not an agent host.
    pub fn segment_hosts(&self) -> Vec<String> {
        let mut hosts = BTreeSet::new();
        for segment in &self.segments {
            hosts.insert(segment.hostname.clone());
            if let Some(mirror) = &segment.mirror_hostname {
                hosts.insert(mirror.clone());
            }
        }
        hosts.into_iter().collect()
    }

    pub fn substep_store(&self) -> SubstepStore {
        SubstepStore::new(self.state_dir.join(SUBSTEP_FILE))
    }
}
