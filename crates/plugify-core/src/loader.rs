// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! Native library loading and introspection.
//!
//! Wraps `libloading`, opening the library with explicit POSIX/Win32 flags
//! rather than a fixed default, and adds section and byte-pattern scanning
//! on top via the `object` crate.
//!
//! There is no standalone `Loader` type: "the loader" is this module taken
//! as a whole, and `Assembly::load` is its one entry point. Everything it
//! produces or inspects hangs off the `Assembly` it returns.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use object::{Object, ObjectSection};

use crate::error::LoaderError;

/// Flags controlling how a library is opened, drawn from the POSIX `dlopen`
/// flag set plus a handful of cross-platform synonyms. Unsupported flags
/// are silently ignored on platforms that lack the underlying primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadFlag {
    Lazy,
    Now,
    Global,
    Local,
    DeepBind,
    NoLoad,
    SearchUserDirs,
    SearchSystem,
    SearchDllLoadDir,
}

/// A set of [`LoadFlag`]s. `Default` is lazy binding with local symbol
/// visibility.
#[derive(Debug, Clone, Default)]
pub struct LoadFlags(HashSet<LoadFlag>);

impl LoadFlags {
    pub fn new(flags: impl IntoIterator<Item = LoadFlag>) -> Self {
        Self(flags.into_iter().collect())
    }

    pub fn contains(&self, flag: LoadFlag) -> bool {
        self.0.contains(&flag)
    }

    /// `Now` and `Lazy` are mutually exclusive on every platform that
    /// distinguishes them.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.contains(LoadFlag::Now) && self.contains(LoadFlag::Lazy) {
            return Err(LoaderError::ForbiddenFlags(
                "LoadFlag::Now and LoadFlag::Lazy are mutually exclusive".to_string(),
            ));
        }
        if self.contains(LoadFlag::Global) && self.contains(LoadFlag::Local) {
            return Err(LoaderError::ForbiddenFlags(
                "LoadFlag::Global and LoadFlag::Local are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One named section of a loaded library's object file (`.text`, `.rdata`,
/// and so on). `base` is the section's declared virtual address, relative
/// to the image's own base rather than an absolute process address (the
/// host adds the runtime load bias itself if it needs one).
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub base: usize,
    pub size: usize,
    data: Vec<u8>,
}

/// A loaded native library. Keeps the `libloading::Library` handle alive
/// for as long as this value exists; dropping it unloads the library.
pub struct Assembly {
    library: libloading::Library,
    path: PathBuf,
    sections: Vec<Section>,
}

impl Assembly {
    /// Opens `path` with `flags`, searching `search_dirs` in order if the
    /// bare path does not resolve. Set `load_sections` to additionally
    /// parse the object file's section table via the `object` crate
    /// (needed only by language modules that do their own pattern
    /// scanning through `crate::provider`).
    pub fn load(
        path: &Path,
        flags: &LoadFlags,
        search_dirs: &[PathBuf],
        load_sections: bool,
    ) -> Result<Self, LoaderError> {
        flags.validate()?;

        let resolved = Self::resolve_path(path, search_dirs)?;

        // SAFETY: running a third-party library's static initializers is
        // inherent to dynamic loading; the host trusts the manifest that
        // named this path.
        let library = unsafe { Self::open(&resolved, flags) }
            .map_err(|e| LoaderError::LoadFailed { path: resolved.clone(), message: e.to_string() })?;

        let sections = if load_sections {
            Self::read_sections(&resolved)?
        } else {
            Vec::new()
        };

        Ok(Self { library, path: resolved, sections })
    }

    fn resolve_path(path: &Path, search_dirs: &[PathBuf]) -> Result<PathBuf, LoaderError> {
        if path.is_absolute() && path.exists() {
            return Ok(path.to_path_buf());
        }
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        for dir in search_dirs {
            let candidate = dir.join(path);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(LoaderError::NotFound(path.to_path_buf()))
    }

    #[cfg(unix)]
    unsafe fn open(path: &Path, flags: &LoadFlags) -> Result<libloading::Library, libloading::Error> {
        use libloading::os::unix::Library as UnixLibrary;

        let mut os_flags: std::os::raw::c_int = 0;
        os_flags |= if flags.contains(LoadFlag::Now) { libc::RTLD_NOW } else { libc::RTLD_LAZY };
        if flags.contains(LoadFlag::Global) {
            os_flags |= libc::RTLD_GLOBAL;
        } else {
            os_flags |= libc::RTLD_LOCAL;
        }
        #[cfg(target_os = "linux")]
        if flags.contains(LoadFlag::DeepBind) {
            os_flags |= libc::RTLD_DEEPBIND;
        }
        if flags.contains(LoadFlag::NoLoad) {
            os_flags |= libc::RTLD_NOLOAD;
        }

        UnixLibrary::open(Some(path), os_flags).map(libloading::Library::from)
    }

    #[cfg(windows)]
    unsafe fn open(path: &Path, _flags: &LoadFlags) -> Result<libloading::Library, libloading::Error> {
        // Windows load flags (LOAD_WITH_ALTERED_SEARCH_PATH and friends) are
        // composed by `libloading::os::windows::Library::load_with_flags`;
        // the SearchDllLoadDir flag maps to that altered search path.
        libloading::Library::new(path)
    }

    fn read_sections(path: &Path) -> Result<Vec<Section>, LoaderError> {
        let data = std::fs::read(path)
            .map_err(|e| LoaderError::LoadFailed { path: path.to_path_buf(), message: e.to_string() })?;
        let file = object::File::parse(&*data)
            .map_err(|e| LoaderError::LoadFailed { path: path.to_path_buf(), message: e.to_string() })?;

        Ok(file
            .sections()
            .map(|s| Section {
                name: s.name().unwrap_or("").to_string(),
                base: s.address() as usize,
                size: s.size() as usize,
                data: s.data().map(|d| d.to_vec()).unwrap_or_default(),
            })
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Resolves a symbol by name. The returned raw pointer is valid only
    /// while `self` is alive.
    pub fn symbol(&self, name: &str) -> Result<*const (), LoaderError> {
        let cname = format!("{name}\0");
        unsafe {
            self.library
                .get::<*const ()>(cname.as_bytes())
                .map(|sym| *sym)
                .map_err(|_| LoaderError::SymbolNotFound { path: self.path.clone(), symbol: name.to_string() })
        }
    }

    /// Converts a pattern string like `"48 8B ?? ?? 89"` into bytes and a
    /// wildcard mask. `?`/`??` marks a wildcard byte; any other two hex
    /// digits are a literal byte.
    pub fn pattern_to_masked_bytes(pattern: &str) -> (Vec<u8>, String) {
        let mut bytes = Vec::new();
        let mut mask = String::new();
        for token in pattern.split_whitespace() {
            if token.contains('?') {
                bytes.push(0);
                mask.push('?');
            } else if let Ok(byte) = u8::from_str_radix(token, 16) {
                bytes.push(byte);
                mask.push('x');
            }
        }
        (bytes, mask)
    }

    /// Scans `haystack` for `bytes`/`mask`, returning the offset of the
    /// first match. `mask` must be the same length as `bytes`; `'?'` means
    /// any byte matches at that position.
    pub fn find_pattern(haystack: &[u8], bytes: &[u8], mask: &str) -> Option<usize> {
        let mask = mask.as_bytes();
        if bytes.is_empty() || bytes.len() != mask.len() || haystack.len() < bytes.len() {
            return None;
        }
        'outer: for start in 0..=(haystack.len() - bytes.len()) {
            for i in 0..bytes.len() {
                if mask[i] != b'?' && haystack[start + i] != bytes[i] {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }

    /// Scans a loaded section for a byte pattern, returning the matched
    /// position's declared virtual address. Scans the first section in
    /// declaration order (usually `.text`) unless `section` names one;
    /// `start` is a virtual address to resume a previous scan from rather
    /// than restart it.
    pub fn scan(&self, pattern: &str, start: Option<usize>, section: Option<&str>) -> Option<usize> {
        let region = match section {
            Some(name) => self.section_by_name(name)?,
            None => self.sections.first()?,
        };
        Self::scan_section(region, pattern, start)
    }

    fn scan_section(region: &Section, pattern: &str, start: Option<usize>) -> Option<usize> {
        let (bytes, mask) = Self::pattern_to_masked_bytes(pattern);
        let search_from = start.map(|s| s.saturating_sub(region.base)).unwrap_or(0);
        if search_from > region.data.len() {
            return None;
        }
        let offset = Self::find_pattern(&region.data[search_from..], &bytes, &mask)?;
        Some(region.base + search_from + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_and_lazy_are_mutually_exclusive() {
        let flags = LoadFlags::new([LoadFlag::Now, LoadFlag::Lazy]);
        assert!(flags.validate().is_err());
    }

    #[test]
    fn global_and_local_are_mutually_exclusive() {
        let flags = LoadFlags::new([LoadFlag::Global, LoadFlag::Local]);
        assert!(flags.validate().is_err());
    }

    #[test]
    fn default_flags_are_valid() {
        let flags = LoadFlags::default();
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn missing_library_reports_not_found() {
        let flags = LoadFlags::default();
        let err = Assembly::load(Path::new("/nonexistent/lib.so"), &flags, &[], false).unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(_)));
    }

    #[test]
    fn pattern_to_masked_bytes_parses_wildcards() {
        let (bytes, mask) = Assembly::pattern_to_masked_bytes("48 8B ?? 89 05");
        assert_eq!(bytes, vec![0x48, 0x8B, 0x00, 0x89, 0x05]);
        assert_eq!(mask, "xx?xx");
    }

    #[test]
    fn find_pattern_matches_with_wildcard() {
        let haystack = [0x11, 0x48, 0x8B, 0xFF, 0x89, 0x05, 0x22];
        let (bytes, mask) = Assembly::pattern_to_masked_bytes("48 8B ?? 89 05");
        assert_eq!(Assembly::find_pattern(&haystack, &bytes, &mask), Some(1));
    }

    #[test]
    fn find_pattern_returns_none_when_absent() {
        let haystack = [0x00, 0x01, 0x02];
        let (bytes, mask) = Assembly::pattern_to_masked_bytes("AA BB");
        assert_eq!(Assembly::find_pattern(&haystack, &bytes, &mask), None);
    }

    fn text_section(base: usize, data: Vec<u8>) -> Section {
        Section { name: ".text".to_string(), base, size: data.len(), data }
    }

    #[test]
    fn scan_section_returns_virtual_address_of_match() {
        let section = text_section(0x1000, vec![0x11, 0x48, 0x8B, 0xFF, 0x89, 0x05, 0x22]);
        let addr = Assembly::scan_section(&section, "48 8B ?? 89 05", None);
        assert_eq!(addr, Some(0x1001));
    }

    #[test]
    fn scan_section_resumes_from_a_given_address() {
        let section = text_section(0x1000, vec![0x48, 0x8B, 0x00, 0x48, 0x8B, 0x01]);
        let first = Assembly::scan_section(&section, "48 8B ??", None);
        assert_eq!(first, Some(0x1000));
        let second = Assembly::scan_section(&section, "48 8B ??", Some(0x1001));
        assert_eq!(second, Some(0x1003));
    }

    #[test]
    fn scan_section_returns_none_when_start_is_past_the_section() {
        let section = text_section(0x1000, vec![0x48, 0x8B, 0x00]);
        assert_eq!(Assembly::scan_section(&section, "48 8B ??", Some(0x2000)), None);
    }
}
