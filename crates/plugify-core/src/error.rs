// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! Crate-wide error types.
//!
//! One `thiserror`-derived enum per subsystem, with `#[from]` wiring where
//! one subsystem legitimately wraps another's error. [`PlugifyError`]
//! aggregates them for the handful of call sites (mainly in
//! `crate::orchestrator`) that must return a single error type.

use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::PackageId;
use crate::types::ValueType;

/// Errors raised by `crate::loader`.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("library not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to load library '{path}': {message}")]
    LoadFailed { path: PathBuf, message: String },

    #[error("symbol '{symbol}' not found in '{path}'")]
    SymbolNotFound { path: PathBuf, symbol: String },

    #[error("forbidden flag combination: {0}")]
    ForbiddenFlags(String),

    #[error("section '{0}' not found")]
    SectionNotFound(String),
}

/// Errors raised while validating a manifest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate package name '{0}'")]
    DuplicateName(PackageId),

    #[error("manifest '{0}' has an illegal property shape: {1}")]
    IllegalPropertyShape(PackageId, String),

    #[error("manifest '{0}' does not support the current platform")]
    PlatformMismatch(PackageId),

    #[error("manifest '{0}' is malformed: {1}")]
    Malformed(PackageId, String),
}

/// One blocker or warning attached to a package by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyIssue {
    pub kind: DependencyIssueKind,
    pub affected_package: PackageId,
    pub involved_package: Option<PackageId>,
    pub description: String,
    pub is_blocker: bool,
    pub suggested_fixes: Vec<String>,
}

/// Kind of dependency problem, used to decompose an unsatisfiable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyIssueKind {
    Missing,
    VersionConflict,
    MutualConflict,
    Circular,
    Obsoleted,
}

impl DependencyIssue {
    pub fn get_detailed_description(&self) -> String {
        if self.suggested_fixes.is_empty() {
            return self.description.clone();
        }
        let mut out = self.description.clone();
        out.push_str("\n  Suggestions:");
        for fix in &self.suggested_fixes {
            out.push_str("\n    - ");
            out.push_str(fix);
        }
        out
    }
}

/// Errors raised by `crate::jit`.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("unsupported calling convention '{0}' on this architecture")]
    UnsupportedCallingConvention(String),

    #[error("unsupported architecture for JIT trampoline generation")]
    UnsupportedArchitecture,

    #[error("parameter/return type {0:?} does not fit in a single call-frame slot and is not one of the supported wide aggregates")]
    UnsupportedParameterShape(ValueType),

    #[error("failed to allocate executable memory: {0}")]
    AllocationFailed(String),

    #[error("failed to make trampoline memory executable: {0}")]
    ProtectionFailed(String),
}

/// Failure returned by a language module's callback, wrapping its message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("lifecycle callback failed for '{package}': {message}")]
pub struct LifecycleError {
    pub package: PackageId,
    pub message: String,
}

impl LifecycleError {
    pub fn new(package: impl Into<PackageId>, message: impl Into<String>) -> Self {
        Self { package: package.into(), message: message.into() }
    }

    /// A host-side guard wraps every vtable call site; an escape (panic or,
    /// on platforms where it would otherwise unwind across the FFI
    /// boundary, an abort) is converted into this with a best-effort
    /// diagnostic rather than propagated.
    pub fn from_panic(package: impl Into<PackageId>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "language module callback panicked with a non-string payload".to_string()
        };
        Self::new(package, message)
    }
}

/// Aggregate error type for call sites that must return one error kind.
#[derive(Debug, Error)]
pub enum PlugifyError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Jit(#[from] JitError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("dependency resolution reported {0} blocking issue(s)")]
    DependenciesBlocked(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detailed_description_includes_suggestions() {
        let issue = DependencyIssue {
            kind: DependencyIssueKind::Missing,
            affected_package: "a".into(),
            involved_package: Some("b".into()),
            description: "missing dependency 'b'".into(),
            is_blocker: true,
            suggested_fixes: vec!["install b >= 1.0.0".into()],
        };
        let detailed = issue.get_detailed_description();
        assert!(detailed.contains("missing dependency"));
        assert!(detailed.contains("install b >= 1.0.0"));
    }

    #[test]
    fn lifecycle_error_from_panic_extracts_str_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let err = LifecycleError::from_panic("p", payload.as_ref());
        assert_eq!(err.message, "boom");
    }
}
