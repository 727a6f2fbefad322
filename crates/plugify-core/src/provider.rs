// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! The Provider / Services Facade: the only API surface a language
//! module, and indirectly its plugins, sees during initialization and
//! plugin loading.
//!
//! The trait boundary here is a handle-to-implementation shape (non-owning
//! references with a lifetime tied to the orchestrator's registry)
//! expressed as a struct of borrows plus two small traits (`FileSystem`,
//! `crate::orchestrator::PeerLookup`) for its two external collaborators.

use std::path::{Path, PathBuf};

use crate::config::HostConfig;
use crate::orchestrator::{PeerLookup, PluginHandle};

/// Log severities a language module may report through
/// [`Provider::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// The filesystem operations a language module may need during
/// initialization — resolving a manifest-relative path to an absolute
/// one, primarily.
/// A production embedder implements this against real `std::fs`; tests
/// substitute an in-memory or `tempfile`-backed fake.
pub trait FileSystem {
    fn absolute(&self, path: &Path) -> std::io::Result<PathBuf>;
    fn exists(&self, path: &Path) -> bool;
}

/// `std::fs`-backed [`FileSystem`] used outside of tests.
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn absolute(&self, path: &Path) -> std::io::Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// The capability facade handed to a language module's `initialize` call
/// and, through it, to plugins. Borrows rather than owns:
/// it is reconstructed fresh for each callback and never outlives it, so
/// it cannot be used to extend any registry entry's lifetime beyond the
/// call that received it: it holds weak references to the orchestrator
/// and never extends lifetimes.
pub struct Provider<'a> {
    config: &'a HostConfig,
    peers: &'a dyn PeerLookup,
    filesystem: Box<dyn FileSystem + 'a>,
}

impl<'a> Provider<'a> {
    pub fn new(config: &'a HostConfig, peers: &'a dyn PeerLookup) -> Self {
        Self { config, peers, filesystem: Box::new(RealFileSystem) }
    }

    /// Substitutes a test or embedder-supplied filesystem collaborator.
    pub fn with_filesystem(mut self, filesystem: impl FileSystem + 'a) -> Self {
        self.filesystem = Box::new(filesystem);
        self
    }

    /// Forwards to the host's `tracing` subscriber so language-module log
    /// lines interleave with host lines.
    pub fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Trace => tracing::trace!("{message}"),
            Severity::Debug => tracing::debug!("{message}"),
            Severity::Info => tracing::info!("{message}"),
            Severity::Warn => tracing::warn!("{message}"),
            Severity::Error => tracing::error!("{message}"),
        }
    }

    /// Read-only access to the immutable host configuration.
    pub fn config(&self) -> &HostConfig {
        self.config
    }

    pub fn filesystem(&self) -> &dyn FileSystem {
        self.filesystem.as_ref()
    }

    /// Looks up a peer plugin by name, yielding a non-owning handle.
    pub fn find_plugin(&self, name: &str) -> Option<PluginHandle<'_>> {
        self.peers.find_plugin(name)
    }

    /// Looks up a method on a peer plugin by name, yielding the native
    /// trampoline pointer produced by the JIT builder.
    pub fn find_method(&self, plugin: &str, method: &str) -> Option<*const ()> {
        self.peers.find_method(plugin, method)
    }

    /// Whether the loader should prefer symbols already resolved within
    /// the host process over ones found by searching library search
    /// directories — affects `crate::loader`'s flag composition (its
    /// `DeepBind` equivalent).
    pub fn prefer_own_symbols(&self) -> bool {
        self.config.prefer_own_symbols
    }
}
