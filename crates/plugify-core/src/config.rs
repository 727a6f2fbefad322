// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! Read-only host configuration.
//!
//! The core consumes four paths supplied by the embedder and does not read
//! environment variables itself. `HostConfig` is handed to the
//! `Provider` (`crate::provider`) fully formed; parsing it from a file on
//! disk is the embedder's job, but the struct shape and its per-field
//! `#[serde(default = ...)]` defaults mean an embedder that *does* want to
//! load one from TOML/JSON can derive it directly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Read-only snapshot of the paths and toggles the orchestrator and
/// provider need. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Root directory the embedder considers the host's install location.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Directory holding module/plugin manifests and their configuration.
    #[serde(default = "default_configs_path")]
    pub configs_path: PathBuf,
    /// Directory holding plugin-writable data.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Directory holding log output.
    #[serde(default = "default_logs_path")]
    pub logs_path: PathBuf,

    /// Whether the resolve phase may proceed to initialize the loadable
    /// subset when the dependency report still has blocking issues,
    /// instead of aborting the whole host startup.
    #[serde(default)]
    pub allow_partial_load: bool,

    /// Whether the loader should prefer symbols already resolved within
    /// the host process over ones found by searching library search
    /// directories (affects `crate::loader`'s flag composition, queried
    /// through `Provider::prefer_own_symbols`).
    #[serde(default)]
    pub prefer_own_symbols: bool,

    #[serde(default)]
    pub logging: crate::logging::LoggingConfig,
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_configs_path() -> PathBuf {
    PathBuf::from("./configs")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_logs_path() -> PathBuf {
    PathBuf::from("./logs")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            configs_path: default_configs_path(),
            data_path: default_data_path(),
            logs_path: default_logs_path(),
            allow_partial_load: false,
            prefer_own_symbols: false,
            logging: crate::logging::LoggingConfig::default(),
        }
    }
}
