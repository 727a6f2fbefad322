// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! Structured logging configuration and initialization.
//!
//! A `LoggingConfig` (level, path, format, rotation, console/file toggles)
//! and an `init(&LoggingConfig)` entry point building a layered `tracing`
//! subscriber. The orchestrator (`crate::orchestrator`) emits phase and
//! lifecycle events through `tracing` rather than ad hoc printing; the
//! `Provider::log` capability (`crate::provider`) forwards into the same
//! subscriber so language-module log lines interleave with host lines.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn", or "error".
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory log files are written to.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// "text" or "json".
    #[serde(default = "default_format")]
    pub format: String,

    /// Enable console output in addition to file.
    #[serde(default = "default_console_enabled")]
    pub console_enabled: bool,

    /// Enable file output.
    #[serde(default = "default_file_enabled")]
    pub file_enabled: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_path() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_format() -> String {
    "text".to_string()
}

fn default_console_enabled() -> bool {
    true
}

fn default_file_enabled() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            path: default_path(),
            format: default_format(),
            console_enabled: default_console_enabled(),
            file_enabled: default_file_enabled(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to install global tracing subscriber: {0}")]
    AlreadyInitialized(String),
}

/// Initialize the process-wide `tracing` subscriber from `config`.
///
/// A second call against an already-initialized global subscriber returns
/// `LoggingError::AlreadyInitialized` rather than panicking (tests in this
/// crate and an embedder's own logging init may both race to call this).
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new(default_level()));

    let console_layer = config
        .console_enabled
        .then(|| fmt::layer().with_target(true));

    let file_layer = if config.file_enabled {
        let appender = rolling::daily(&config.path, "plugify.log");
        let layer = fmt::layer().with_writer(appender).with_ansi(false);
        Some(if config.format == "json" {
            layer.json().boxed()
        } else {
            layer.boxed()
        })
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter).with(console_layer).with(file_layer);

    match registry.try_init() {
        Ok(()) => Ok(()),
        Err(e) => Err(LoggingError::AlreadyInitialized(e.to_string())),
    }
}
