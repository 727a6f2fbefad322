// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! The manifest model: immutable declarative metadata for modules and
//! plugins.
//!
//! Deserialization follows a per-field `#[serde(default)]` convention
//! throughout, so a manifest with only its required fields present still
//! deserializes cleanly, and absent optional fields take their declared
//! defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Method;
use crate::version::{Constraint, Version};

/// A package name. Unique across the whole host.
pub type PackageId = String;

/// A required (or optional) dependency on another package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: PackageId,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    /// An empty constraint list means "Any".
    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        if self.constraints.is_empty() {
            return true;
        }
        self.constraints.iter().all(|c| c.satisfies(version))
    }
}

/// A forbidden coexistence with another package's versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub name: PackageId,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Conflict {
    pub fn forbids(&self, version: &Version) -> bool {
        if self.constraints.is_empty() {
            return true;
        }
        self.constraints.iter().all(|c| c.satisfies(version))
    }
}

/// Fields common to both manifest kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestCommon {
    pub name: PackageId,
    pub version: Version,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(skip)]
    pub source_path: PathBuf,
}

/// A language module: a native shared library embedding a language
/// runtime. File extension `.pmodule` distinguishes it from a plugin
/// manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    #[serde(flatten)]
    pub common: ManifestCommon,
    pub language: String,
    pub runtime_library_path: PathBuf,
    #[serde(default)]
    pub search_directories: Vec<PathBuf>,
    #[serde(default)]
    pub force_load: bool,
}

/// A plugin: an extension unit in some language, activated through the
/// language module that declares responsibility for that language. File
/// extension `.pplugin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(flatten)]
    pub common: ManifestCommon,
    pub language: String,
    /// Language-specific identifier of the plugin's entry point (e.g. a
    /// module path, a class name).
    pub entry: String,
    #[serde(default)]
    pub methods: Vec<Method>,
}

/// A discriminated union of the two manifest kinds; the resolver and
/// orchestrator both treat modules and plugins uniformly as "packages"
/// through this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Manifest {
    Module(ModuleManifest),
    Plugin(PluginManifest),
}

impl Manifest {
    pub fn common(&self) -> &ManifestCommon {
        match self {
            Manifest::Module(m) => &m.common,
            Manifest::Plugin(p) => &p.common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn version(&self) -> &Version {
        &self.common().version
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.common().dependencies
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.common().conflicts
    }

    /// Whether this package is eligible to load on `current_platform`: the
    /// current platform token must appear in the declared platform set, or
    /// the set must be empty.
    pub fn supports_platform(&self, current_platform: &str) -> bool {
        let platforms = &self.common().platforms;
        platforms.is_empty() || platforms.iter().any(|p| p == current_platform)
    }

    pub fn language(&self) -> &str {
        match self {
            Manifest::Module(m) => &m.language,
            Manifest::Plugin(p) => &p.language,
        }
    }

    /// Parses a manifest from its JSON wire form. Reading the file and
    /// picking `.pmodule`/`.pplugin` apart by extension is the embedder's
    /// job; this is only the schema-to-value step, gated behind the
    /// `json-manifests` feature so a consumer that builds manifests purely
    /// in Rust doesn't pull in `serde_json`.
    #[cfg(feature = "json-manifests")]
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    #[cfg(feature = "json-manifests")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// Two manifests are equal iff all fields are equal; derived
// `PartialEq` on `Manifest`/`ManifestCommon` already gives this. Ordering
// for stable reporting is by `name`.
impl PartialOrd for Manifest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Manifest {}

impl Ord for Manifest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name().cmp(other.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(name: &str) -> ManifestCommon {
        ManifestCommon {
            name: name.to_string(),
            version: Version::new(1, 0, 0),
            description: None,
            author: None,
            website: None,
            license: None,
            platforms: vec![],
            dependencies: vec![],
            conflicts: vec![],
            source_path: PathBuf::new(),
        }
    }

    #[test]
    fn manifests_order_by_name() {
        let a = Manifest::Module(ModuleManifest {
            common: common("a"),
            language: "lua".into(),
            runtime_library_path: "a.so".into(),
            search_directories: vec![],
            force_load: false,
        });
        let b = Manifest::Module(ModuleManifest {
            common: common("b"),
            language: "lua".into(),
            runtime_library_path: "b.so".into(),
            search_directories: vec![],
            force_load: false,
        });
        assert!(a < b);
    }

    #[test]
    fn empty_platform_set_supports_every_platform() {
        let m = Manifest::Plugin(PluginManifest {
            common: common("p"),
            language: "lua".into(),
            entry: "main".into(),
            methods: vec![],
        });
        assert!(m.supports_platform("linux-x86_64"));
        assert!(m.supports_platform("windows-x86_64"));
    }

    #[test]
    fn nonempty_platform_set_restricts() {
        let mut c = common("p");
        c.platforms = vec!["linux-x86_64".to_string()];
        let m = Manifest::Plugin(PluginManifest { common: c, language: "lua".into(), entry: "main".into(), methods: vec![] });
        assert!(m.supports_platform("linux-x86_64"));
        assert!(!m.supports_platform("windows-x86_64"));
    }

    #[test]
    fn empty_dependency_constraints_mean_any() {
        let dep = Dependency { name: "x".into(), constraints: vec![], optional: false };
        assert!(dep.is_satisfied_by(&Version::new(0, 0, 1)));
        assert!(dep.is_satisfied_by(&Version::new(99, 0, 0)));
    }

    #[test]
    fn manifest_json_round_trip() {
        let m = Manifest::Plugin(PluginManifest {
            common: common("p"),
            language: "lua".into(),
            entry: "main".into(),
            methods: vec![],
        });
        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[cfg(feature = "json-manifests")]
    #[test]
    fn from_json_to_json_round_trips() {
        let m = Manifest::Module(ModuleManifest {
            common: common("lang"),
            language: "lua".into(),
            runtime_library_path: "lua.so".into(),
            search_directories: vec![],
            force_load: false,
        });
        let text = m.to_json().unwrap();
        let back = Manifest::from_json(&text).unwrap();
        assert_eq!(m, back);
    }
}
