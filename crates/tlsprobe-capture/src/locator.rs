//! Crypto library discovery
//!
//! Resolution order:
//! 1. Explicit library path from the module config
//! 2. `DT_NEEDED` of a hint binary (configured, or the profile's default
//!    when present on disk), resolved through its runpath, the configured
//!    search directories, the loader cache and the system directories
//! 3. Configured search directories, first match
//! 4. Loader cache and system directories; several different files for the
//!    preferred name is an ambiguity, not a coin toss

use crate::elf::ElfImage;
use crate::library::LibraryProfile;
use crate::resolver::fingerprint;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tlsprobe_core::{CaptureError, CaptureResult, ModuleConfig};
use tracing::{debug, info};

/// How a library was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateSource {
    Override,
    HintBinary(PathBuf),
    SearchPath,
    System,
}

/// A located shared object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Canonical path
    pub path: PathBuf,
    pub source: LocateSource,
}

/// Finds the shared object a module should instrument
pub struct LibraryLocator {
    search_dirs: Vec<PathBuf>,
    use_ld_cache: bool,
    ld_cache: OnceLock<Vec<(String, PathBuf)>>,
}

impl LibraryLocator {
    /// System directories plus the loader cache
    pub fn new() -> Self {
        Self {
            search_dirs: default_search_dirs(),
            use_ld_cache: true,
            ld_cache: OnceLock::new(),
        }
    }

    /// Only `dirs`, no loader cache
    pub fn with_search_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs: dirs,
            use_ld_cache: false,
            ld_cache: OnceLock::new(),
        }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Locate the library for `profile`.
    ///
    /// Fails with a configuration-class error: [`CaptureError::NotFound`],
    /// [`CaptureError::Ambiguous`], [`CaptureError::InvalidLibrary`] or
    /// [`CaptureError::Config`].
    pub fn locate(&self, profile: &LibraryProfile, config: &ModuleConfig) -> CaptureResult<Located> {
        let module = profile.name;

        if let Some(path) = &config.library {
            if !path.exists() {
                return Err(CaptureError::NotFound {
                    module: module.to_string(),
                    searched: vec![path.clone()],
                });
            }
            let path = check_library(path)?;
            info!("Module {} using configured library {}", module, path.display());
            return Ok(Located {
                path,
                source: LocateSource::Override,
            });
        }

        let hint = match &config.hint_binary {
            Some(path) => Some((path.clone(), true)),
            None => profile
                .default_hint
                .map(PathBuf::from)
                .filter(|p| p.exists())
                .map(|p| (p, false)),
        };
        if let Some((hint, explicit)) = hint {
            match self.from_hint(profile, &hint, &config.search_dirs) {
                Ok(Some(path)) => {
                    info!(
                        "Module {} using {} (needed by {})",
                        module,
                        path.display(),
                        hint.display()
                    );
                    return Ok(Located {
                        path,
                        source: LocateSource::HintBinary(hint),
                    });
                }
                Ok(None) if explicit => {
                    return Err(CaptureError::config(
                        module,
                        format!(
                            "hint binary {} does not link {}*",
                            hint.display(),
                            profile.soname_prefix
                        ),
                    ))
                }
                Ok(None) => debug!(
                    "{} does not link {}*",
                    hint.display(),
                    profile.soname_prefix
                ),
                Err(e) if explicit => return Err(e),
                Err(e) => debug!("Ignoring default hint {}: {}", hint.display(), e),
            }
        }

        let mut searched = Vec::new();

        for dir in &config.search_dirs {
            for name in profile.file_names {
                let candidate = dir.join(name);
                searched.push(candidate.clone());
                if let Some(path) = usable(&candidate) {
                    info!("Module {} using {}", module, path.display());
                    return Ok(Located {
                        path,
                        source: LocateSource::SearchPath,
                    });
                }
            }
        }

        for name in profile.file_names {
            let mut candidates = Vec::new();
            if self.use_ld_cache {
                candidates.extend(self.ld_cache_lookup(name));
            }
            candidates.extend(profile.extra_dirs.iter().map(|d| Path::new(d).join(name)));
            candidates.extend(self.search_dirs.iter().map(|d| d.join(name)));

            // Distinct by canonical path, then by content
            let mut found: Vec<(PathBuf, String)> = Vec::new();
            for candidate in candidates {
                searched.push(candidate.clone());
                let Some(path) = usable(&candidate) else {
                    continue;
                };
                if found.iter().any(|(p, _)| *p == path) {
                    continue;
                }
                let digest = match fingerprint(&path) {
                    Ok((fp, _)) => fp.digest,
                    Err(e) => {
                        debug!("Skipping {}: {}", path.display(), e);
                        continue;
                    }
                };
                if found.iter().any(|(_, d)| *d == digest) {
                    continue;
                }
                found.push((path, digest));
            }

            match found.len() {
                0 => continue,
                1 => {
                    let (path, _) = found.remove(0);
                    info!("Module {} using {}", module, path.display());
                    return Ok(Located {
                        path,
                        source: LocateSource::System,
                    });
                }
                _ => {
                    return Err(CaptureError::Ambiguous {
                        module: module.to_string(),
                        candidates: found.into_iter().map(|(p, _)| p).collect(),
                    })
                }
            }
        }

        searched.dedup();
        Err(CaptureError::NotFound {
            module: module.to_string(),
            searched,
        })
    }

    /// Resolve the profile's library the way the loader would for `binary`
    fn from_hint(
        &self,
        profile: &LibraryProfile,
        binary: &Path,
        extra_dirs: &[PathBuf],
    ) -> CaptureResult<Option<PathBuf>> {
        if !binary.exists() {
            return Err(CaptureError::config(
                profile.name,
                format!("hint binary {} does not exist", binary.display()),
            ));
        }
        let image = ElfImage::open(binary).map_err(|e| {
            CaptureError::config(
                profile.name,
                format!("cannot inspect hint binary {}: {}", binary.display(), e),
            )
        })?;
        let origin = std::fs::canonicalize(binary)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf));

        for needed in image.needed_matching(profile.soname_prefix) {
            debug!("{} needs {}", binary.display(), needed);
            if needed.contains('/') {
                if let Some(path) = usable(Path::new(needed)) {
                    return Ok(Some(path));
                }
                continue;
            }

            let mut dirs: Vec<PathBuf> = image
                .runpath
                .iter()
                .map(|entry| expand_origin(entry, origin.as_deref()))
                .collect();
            dirs.extend(extra_dirs.iter().cloned());
            for dir in dirs {
                if let Some(path) = usable(&dir.join(needed)) {
                    return Ok(Some(path));
                }
            }

            if self.use_ld_cache {
                if let Some(path) = self.ld_cache_lookup(needed).find_map(|p| usable(&p)) {
                    return Ok(Some(path));
                }
            }

            if let Some(path) = self
                .search_dirs
                .iter()
                .find_map(|dir| usable(&dir.join(needed)))
            {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    fn ld_cache_lookup<'a>(&'a self, name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
        self.ld_cache
            .get_or_init(load_ld_cache)
            .iter()
            .filter(move |(soname, _)| soname == name)
            .map(|(_, path)| path.clone())
    }
}

impl Default for LibraryLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical path of `path` if it is a shared object this host can load
pub fn check_library(path: &Path) -> CaptureResult<PathBuf> {
    let invalid = |reason: String| CaptureError::InvalidLibrary {
        path: path.to_path_buf(),
        reason,
    };
    let canonical = std::fs::canonicalize(path).map_err(|e| invalid(e.to_string()))?;
    let image = ElfImage::open(&canonical).map_err(|e| invalid(e.to_string()))?;
    if !image.is_shared_object() {
        return Err(invalid("not a shared object".to_string()));
    }
    if !image.matches_host() {
        return Err(invalid(format!(
            "built for ELF machine {} which this host cannot load",
            image.machine
        )));
    }
    Ok(canonical)
}

fn usable(candidate: &Path) -> Option<PathBuf> {
    if !candidate.is_file() {
        return None;
    }
    match check_library(candidate) {
        Ok(path) => Some(path),
        Err(e) => {
            debug!("Skipping candidate: {}", e);
            None
        }
    }
}

fn expand_origin(entry: &str, origin: Option<&Path>) -> PathBuf {
    match origin {
        Some(origin) => {
            let origin = origin.to_string_lossy();
            PathBuf::from(
                entry
                    .replace("${ORIGIN}", &origin)
                    .replace("$ORIGIN", &origin),
            )
        }
        None => PathBuf::from(entry),
    }
}

fn load_ld_cache() -> Vec<(String, PathBuf)> {
    for ldconfig in ["ldconfig", "/sbin/ldconfig", "/usr/sbin/ldconfig"] {
        if let Ok(output) = Command::new(ldconfig).arg("-p").output() {
            if output.status.success() {
                return parse_ld_cache(&String::from_utf8_lossy(&output.stdout));
            }
        }
    }
    debug!("ldconfig unavailable, loader cache not consulted");
    Vec::new()
}

/// Parse `ldconfig -p` output into (soname, path) pairs
pub fn parse_ld_cache(output: &str) -> Vec<(String, PathBuf)> {
    output
        .lines()
        .filter_map(|line| {
            let (lhs, path) = line.split_once("=>")?;
            let soname = lhs.split_whitespace().next()?;
            let path = path.trim();
            if path.is_empty() {
                return None;
            }
            Some((soname.to_string(), PathBuf::from(path)))
        })
        .collect()
}

/// Multiarch and conventional library directories for this host
pub fn default_search_dirs() -> Vec<PathBuf> {
    let triplet = if cfg!(target_arch = "x86_64") {
        Some("x86_64-linux-gnu")
    } else if cfg!(target_arch = "aarch64") {
        Some("aarch64-linux-gnu")
    } else if cfg!(target_arch = "x86") {
        Some("i386-linux-gnu")
    } else if cfg!(target_arch = "arm") {
        Some("arm-linux-gnueabihf")
    } else if cfg!(target_arch = "riscv64") {
        Some("riscv64-linux-gnu")
    } else {
        None
    };

    let mut dirs = Vec::new();
    if let Some(triplet) = triplet {
        dirs.push(PathBuf::from("/lib").join(triplet));
        dirs.push(PathBuf::from("/usr/lib").join(triplet));
    }
    for dir in ["/usr/lib64", "/lib64", "/usr/lib", "/lib", "/usr/local/lib"] {
        dirs.push(PathBuf::from(dir));
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::HookSpec;
    use tlsprobe_core::Direction;

    const FAKE: LibraryProfile = LibraryProfile {
        name: "fake",
        soname_prefix: "libfake.so",
        file_names: &["libfake.so.1", "libfake.so"],
        default_hint: None,
        extra_dirs: &[],
        hooks: &[HookSpec::required("write", Direction::Write)],
    };

    #[test]
    fn test_parse_ld_cache() {
        let output = "1234 libs found in cache `/etc/ld.so.cache'\n\
            \tlibssl.so.3 (libc6,x86-64) => /lib/x86_64-linux-gnu/libssl.so.3\n\
            \tlibssl.so (libc6,x86-64) => /lib/x86_64-linux-gnu/libssl.so\n\
            Cache generated by: ldconfig (GNU libc) stable release version 2.35\n";
        let entries = parse_ld_cache(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "libssl.so.3");
        assert_eq!(
            entries[0].1,
            PathBuf::from("/lib/x86_64-linux-gnu/libssl.so.3")
        );
    }

    #[test]
    fn test_expand_origin() {
        assert_eq!(
            expand_origin("$ORIGIN/../lib", Some(Path::new("/opt/app/bin"))),
            PathBuf::from("/opt/app/bin/../lib")
        );
        assert_eq!(
            expand_origin("${ORIGIN}", Some(Path::new("/opt/app"))),
            PathBuf::from("/opt/app")
        );
        assert_eq!(expand_origin("/usr/lib", None), PathBuf::from("/usr/lib"));
    }

    #[test]
    fn test_missing_library_everywhere() {
        let empty = tempfile::tempdir().unwrap();
        let locator = LibraryLocator::with_search_dirs(vec![empty.path().to_path_buf()]);
        let err = locator
            .locate(&FAKE, &ModuleConfig::new("fake"))
            .unwrap_err();
        assert!(err.is_config());
        match err {
            CaptureError::NotFound { module, searched } => {
                assert_eq!(module, "fake");
                assert!(searched.contains(&empty.path().join("libfake.so.1")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_override() {
        let locator = LibraryLocator::with_search_dirs(vec![]);
        let config = ModuleConfig::new("fake").with_library("/nonexistent/libfake.so.1");
        let err = locator.locate(&FAKE, &config).unwrap_err();
        assert!(matches!(err, CaptureError::NotFound { .. }));
        assert!(err.is_config());
    }

    #[test]
    fn test_override_must_be_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libfake.so.1");
        std::fs::write(&path, b"plain text").unwrap();

        let locator = LibraryLocator::with_search_dirs(vec![]);
        let err = locator
            .locate(&FAKE, &ModuleConfig::new("fake").with_library(&path))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidLibrary { .. }));
    }

    #[test]
    fn test_missing_explicit_hint() {
        let locator = LibraryLocator::with_search_dirs(vec![]);
        let config = ModuleConfig::new("fake").with_hint_binary("/nonexistent/bin/curl");
        let err = locator.locate(&FAKE, &config).unwrap_err();
        assert!(matches!(err, CaptureError::Config { .. }));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    mod libc {
        use super::*;
        use crate::elf::fixtures::libc_path;

        const LIBC: LibraryProfile = LibraryProfile {
            name: "libc",
            soname_prefix: "libc.so",
            file_names: &["libc.so.6"],
            default_hint: None,
            extra_dirs: &[],
            hooks: &[HookSpec::required("write", Direction::Write)],
        };

        fn stage(dir: &Path, name: &str, source: &Path, trailer: &[u8]) -> PathBuf {
            let target = dir.join(name);
            let mut data = std::fs::read(source).unwrap();
            data.extend_from_slice(trailer);
            std::fs::write(&target, data).unwrap();
            target
        }

        #[test]
        fn test_override_is_used() {
            let Some(libc) = libc_path() else {
                return;
            };
            let locator = LibraryLocator::with_search_dirs(vec![]);
            let located = locator
                .locate(&LIBC, &ModuleConfig::new("libc").with_library(&libc))
                .unwrap();
            assert_eq!(located.source, LocateSource::Override);
            assert_eq!(located.path, std::fs::canonicalize(&libc).unwrap());
        }

        #[test]
        fn test_configured_search_dir_first_match() {
            let Some(libc) = libc_path() else {
                return;
            };
            let dir = tempfile::tempdir().unwrap();
            let staged = stage(dir.path(), "libfake.so", &libc, b"");

            let config = ModuleConfig {
                search_dirs: vec![dir.path().to_path_buf()],
                ..ModuleConfig::new("fake")
            };
            let located = LibraryLocator::with_search_dirs(vec![])
                .locate(&FAKE, &config)
                .unwrap();
            assert_eq!(located.source, LocateSource::SearchPath);
            assert_eq!(located.path, std::fs::canonicalize(staged).unwrap());
        }

        #[test]
        fn test_identical_copies_are_not_ambiguous() {
            let Some(libc) = libc_path() else {
                return;
            };
            let a = tempfile::tempdir().unwrap();
            let b = tempfile::tempdir().unwrap();
            stage(a.path(), "libfake.so.1", &libc, b"");
            stage(b.path(), "libfake.so.1", &libc, b"");

            let locator =
                LibraryLocator::with_search_dirs(vec![a.path().to_path_buf(), b.path().to_path_buf()]);
            let first = locator.locate(&FAKE, &ModuleConfig::new("fake")).unwrap();
            let second = locator.locate(&FAKE, &ModuleConfig::new("fake")).unwrap();
            assert_eq!(first.source, LocateSource::System);
            assert_eq!(first, second);
        }

        #[test]
        fn test_different_copies_are_ambiguous() {
            let Some(libc) = libc_path() else {
                return;
            };
            let a = tempfile::tempdir().unwrap();
            let b = tempfile::tempdir().unwrap();
            stage(a.path(), "libfake.so.1", &libc, b"");
            stage(b.path(), "libfake.so.1", &libc, b"patched");

            let locator =
                LibraryLocator::with_search_dirs(vec![a.path().to_path_buf(), b.path().to_path_buf()]);
            match locator.locate(&FAKE, &ModuleConfig::new("fake")) {
                Err(CaptureError::Ambiguous { candidates, .. }) => assert_eq!(candidates.len(), 2),
                other => panic!("unexpected {:?}", other),
            }

            // An override settles it
            let config = ModuleConfig::new("fake").with_library(b.path().join("libfake.so.1"));
            assert_eq!(
                locator.locate(&FAKE, &config).unwrap().source,
                LocateSource::Override
            );
        }

        #[test]
        fn test_preferred_name_wins_over_fallback_name() {
            let Some(libc) = libc_path() else {
                return;
            };
            let a = tempfile::tempdir().unwrap();
            let preferred = stage(a.path(), "libfake.so.1", &libc, b"");
            stage(a.path(), "libfake.so", &libc, b"dev symlink stand-in");

            let located = LibraryLocator::with_search_dirs(vec![a.path().to_path_buf()])
                .locate(&FAKE, &ModuleConfig::new("fake"))
                .unwrap();
            assert_eq!(located.path, std::fs::canonicalize(preferred).unwrap());
        }

        #[test]
        fn test_hint_binary_dependencies() {
            let Some(libc) = libc_path() else {
                return;
            };
            let libc_dir = libc.parent().unwrap().to_path_buf();
            let locator = LibraryLocator::with_search_dirs(vec![libc_dir]);
            let config = ModuleConfig::new("libc").with_hint_binary("/proc/self/exe");

            let located = locator.locate(&LIBC, &config).unwrap();
            assert!(matches!(located.source, LocateSource::HintBinary(_)));
            assert_eq!(located.path, std::fs::canonicalize(&libc).unwrap());
        }

        #[test]
        fn test_hint_binary_without_library_is_config_error() {
            let Some(libc) = libc_path() else {
                return;
            };
            let dir = tempfile::tempdir().unwrap();
            stage(dir.path(), "libfake.so.1", &libc, b"");

            // The test binary links libc, not libfake, even though one is on the search path
            let config = ModuleConfig {
                search_dirs: vec![dir.path().to_path_buf()],
                ..ModuleConfig::new("fake").with_hint_binary("/proc/self/exe")
            };
            match LibraryLocator::with_search_dirs(vec![]).locate(&FAKE, &config) {
                Err(CaptureError::Config { module, message }) => {
                    assert_eq!(module, "fake");
                    assert!(message.contains("/proc/self/exe"));
                    assert!(message.contains("libfake.so"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
