//! Symbol resolution against a fingerprinted shared object
//!
//! Offsets are file-relative and only valid for the exact content they were
//! read from, so every parse is cached under the file's fingerprint (canonical
//! path plus SHA-256 of the content). A library upgraded in place produces a
//! new fingerprint and is parsed again.

use crate::elf::{ElfImage, FunctionSymbol, SymbolSource};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tlsprobe_core::{CaptureError, CaptureResult, Fingerprint};
use tracing::debug;

/// A function to resolve, optionally pinned to one version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolRequest {
    pub name: String,
    pub version: Option<String>,
    /// Skip instead of failing when absent
    pub optional: bool,
}

impl SymbolRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            optional: false,
        }
    }

    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Where a requested function lives in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    pub version: Option<String>,
    /// Link-time virtual address
    pub address: u64,
    /// Offset in the file, what instrumentation attaches to
    pub offset: u64,
    pub size: u64,
    pub source: SymbolSource,
}

/// Offsets for a set of symbols, bound to one file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub fingerprint: Fingerprint,
    pub symbols: BTreeMap<String, ResolvedSymbol>,
}

/// Read a file and compute its fingerprint
pub fn fingerprint(path: &Path) -> std::io::Result<(Fingerprint, Vec<u8>)> {
    let canonical = std::fs::canonicalize(path)?;
    let data = std::fs::read(&canonical)?;
    let digest = hex::encode(Sha256::digest(&data));
    Ok((
        Fingerprint {
            path: canonical,
            digest,
        },
        data,
    ))
}

/// Resolves entry points in shared objects, caching parses by fingerprint
#[derive(Default)]
pub struct SymbolResolver {
    cache: Mutex<HashMap<Fingerprint, Arc<ElfImage>>>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every request against `path`.
    ///
    /// Fails with [`CaptureError::SymbolNotFound`] on the first required
    /// request defined in neither the dynamic nor the static symbol table.
    /// Absent optional requests are left out of the result.
    pub fn resolve(&self, path: &Path, requests: &[SymbolRequest]) -> CaptureResult<Resolution> {
        let (fingerprint, image) = self.image(path)?;
        let mut symbols = BTreeMap::new();

        for request in requests {
            let Some(symbol) = select(&image, request) else {
                if request.optional {
                    debug!("Optional symbol {} not in {}", request.name, fingerprint);
                    continue;
                }
                return Err(CaptureError::SymbolNotFound {
                    path: fingerprint.path.clone(),
                    symbol: match &request.version {
                        Some(version) => format!("{}@{}", request.name, version),
                        None => request.name.clone(),
                    },
                });
            };
            let offset = image
                .file_offset(symbol.address)
                .ok_or_else(|| CaptureError::Elf {
                    path: fingerprint.path.clone(),
                    message: format!(
                        "{} at {:#x} is outside every loadable segment",
                        symbol.name, symbol.address
                    ),
                })?;

            debug!(
                "Resolved {}{} in {} at offset {:#x}",
                symbol.name,
                symbol
                    .version
                    .as_deref()
                    .map(|v| format!("@{}", v))
                    .unwrap_or_default(),
                fingerprint,
                offset
            );

            symbols.insert(
                request.name.clone(),
                ResolvedSymbol {
                    name: symbol.name.clone(),
                    version: symbol.version.clone(),
                    address: symbol.address,
                    offset,
                    size: symbol.size,
                    source: symbol.source,
                },
            );
        }

        Ok(Resolution {
            fingerprint,
            symbols,
        })
    }

    /// Number of distinct file contents parsed so far
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn image(&self, path: &Path) -> CaptureResult<(Fingerprint, Arc<ElfImage>)> {
        let (fingerprint, data) = fingerprint(path).map_err(|e| CaptureError::InvalidLibrary {
            path: PathBuf::from(path),
            reason: e.to_string(),
        })?;

        if let Some(image) = self.cache.lock().get(&fingerprint) {
            return Ok((fingerprint, image.clone()));
        }

        let image = ElfImage::parse(&data).map_err(|e| CaptureError::Elf {
            path: fingerprint.path.clone(),
            message: e.to_string(),
        })?;
        if !image.has_symtab {
            debug!("{} is stripped, using the dynamic symbol table only", fingerprint);
        }

        let image = Arc::new(image);
        self.cache.lock().insert(fingerprint.clone(), image.clone());
        Ok((fingerprint, image))
    }
}

/// Pick the definition to hook.
///
/// Dynamic entries win over static ones. A pinned version must match exactly;
/// otherwise the highest version is taken, default bindings first on ties.
fn select<'a>(image: &'a ElfImage, request: &SymbolRequest) -> Option<&'a FunctionSymbol> {
    let pick = |source: SymbolSource| {
        image
            .functions()
            .iter()
            .filter(|f| f.name == request.name && f.source == source)
            .filter(|f| match &request.version {
                Some(pinned) => f.version.as_deref() == Some(pinned.as_str()),
                None => true,
            })
            .max_by(|a, b| {
                compare_versions(a.version.as_deref(), b.version.as_deref())
                    .then_with(|| b.hidden.cmp(&a.hidden))
                    .then_with(|| b.address.cmp(&a.address))
            })
    };
    pick(SymbolSource::Dynamic).or_else(|| pick(SymbolSource::Static))
}

/// Order version names by their numeric components.
///
/// `OPENSSL_3.0.0` > `OPENSSL_1_1_0`, `GLIBC_2.14` > `GLIBC_2.2.5`;
/// unversioned sorts lowest.
pub fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => numeric_parts(a)
            .cmp(&numeric_parts(b))
            .then_with(|| a.cmp(b)),
    }
}

fn numeric_parts(version: &str) -> Vec<u64> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}
