// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! `plugify-core`: the engineering heart of a polyglot plugin host.
//!
//! This crate owns five collaborating subsystems, each a module below:
//!
//! 1. [`version`] / [`types`] / [`manifest`] — the immutable type and
//!    manifest model: semver versions and constraints, cross-language
//!    method signatures, and the `ModuleManifest`/`PluginManifest` union.
//! 2. [`resolver`] — a dependency resolver that turns a closed set of
//!    manifests into a validated load order or a structured report of
//!    blockers.
//! 3. [`orchestrator`] — the lifecycle state machines for modules and
//!    plugins, driving discover → validate → resolve → initialize →
//!    load → export → start → update → shutdown.
//! 4. [`jit`] — a just-in-time trampoline builder translating the host's
//!    generic `(method, user_data, args[], ret)` callback shape into a
//!    native function pointer of a declared calling convention.
//! 5. [`loader`] — the native shared-library loading abstraction
//!    (open/symbol/section/pattern-scan/unload).
//!
//! [`provider`] is the small capability facade ([`provider::Provider`])
//! these subsystems hand to language modules during initialization;
//! [`config`], [`logging`], and [`error`] are the ambient stack every
//! other module depends on.
//!
//! What this crate does *not* do, by design: embed any language runtime
//! itself, sandbox plugin code, fetch or verify package archives, or
//! hot-reload an individual plugin short of a full host teardown/restart.
//! The CLI front-end, manifest-file discovery off disk, and the JSON
//! deserializer populating manifests are external collaborators this
//! crate only defines interfaces for.

pub mod config;
pub mod error;
pub mod jit;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod provider;
pub mod resolver;
pub mod types;
pub mod version;

pub use config::HostConfig;
pub use error::{
    DependencyIssue, DependencyIssueKind, JitError, LifecycleError, LoaderError, PlugifyError,
    ValidationError,
};
pub use jit::{HostCallback, JitRuntime, Slot};
pub use loader::{Assembly, LoadFlag, LoadFlags, Section};
pub use manifest::{Conflict, Dependency, Manifest, ManifestCommon, ModuleManifest, PackageId, PluginManifest};
pub use orchestrator::{
    CapabilityTable, InitData, LanguageModule, LanguageModuleBinder, LoadData, LoadStatistics,
    ManifestSource, ModuleHandle, ModuleState, Orchestrator, PeerLookup, PluginHandle,
    PluginState, ValidationReport,
};
pub use provider::{FileSystem, Provider, Severity};
pub use resolver::{DependencyReport, DependencyResolver, PackageResolution};
pub use types::{CallingConvention, Enum, EnumValue, Method, Property, TypeModelError, ValueType, NOT_VARIADIC};
pub use version::{Comparison, Constraint, Version, VersionParseError};
