//! ELF inspection for shared objects and the binaries that load them
//!
//! Only what discovery and symbol resolution need is extracted: file type and
//! machine, the dynamic section (`DT_SONAME`, `DT_NEEDED`, `DT_RUNPATH`),
//! defined function symbols with their versions, and the `PT_LOAD` layout
//! used to turn link-time addresses into file offsets.

use object::elf;
use object::read::elf::{
    Dyn as _, FileHeader, ProgramHeader as _, SectionHeader as _, Sym as _, SymbolTable,
    VersionTable,
};
use object::{Endianness, FileKind, SectionIndex, SymbolIndex};
use std::path::Path;
use thiserror::Error;

/// ELF parsing error
#[derive(Debug, Error)]
pub enum ElfError {
    #[error("not an ELF file")]
    NotElf,

    #[error("malformed ELF: {0}")]
    Malformed(#[from] object::read::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Table a symbol was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolSource {
    /// `.dynsym`, survives stripping
    Dynamic,
    /// `.symtab`, absent from stripped files
    Static,
}

/// A defined function symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    /// Version name (`OPENSSL_3.0.0`, `GLIBC_2.2.5`), if versioned
    pub version: Option<String>,
    /// Non-default version, only reachable through an explicit `name@VERSION` binding
    pub hidden: bool,
    /// Link-time virtual address
    pub address: u64,
    pub size: u64,
    pub source: SymbolSource,
}

#[derive(Debug, Clone, Copy)]
struct LoadSegment {
    vaddr: u64,
    offset: u64,
    filesz: u64,
}

/// Parsed view of one ELF file
#[derive(Debug, Clone)]
pub struct ElfImage {
    pub is_64: bool,
    pub machine: u16,
    pub file_type: u16,
    pub soname: Option<String>,
    /// `DT_NEEDED` entries in link order
    pub needed: Vec<String>,
    /// `DT_RUNPATH` entries, or `DT_RPATH` when no runpath is present
    pub runpath: Vec<String>,
    /// Whether a full `.symtab` is present
    pub has_symtab: bool,
    functions: Vec<FunctionSymbol>,
    segments: Vec<LoadSegment>,
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self, ElfError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        match FileKind::parse(data) {
            Ok(FileKind::Elf32) => parse_image::<elf::FileHeader32<Endianness>>(data),
            Ok(FileKind::Elf64) => parse_image::<elf::FileHeader64<Endianness>>(data),
            _ => Err(ElfError::NotElf),
        }
    }

    /// `ET_DYN`: shared objects, and position-independent executables
    pub fn is_shared_object(&self) -> bool {
        self.file_type == elf::ET_DYN
    }

    /// Whether the image can be mapped by a process on this host
    pub fn matches_host(&self) -> bool {
        match host_machine() {
            Some(machine) => self.machine == machine && self.is_64 == cfg!(target_pointer_width = "64"),
            None => true,
        }
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }

    /// Every definition of `name`, dynamic table entries first
    pub fn functions_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FunctionSymbol> + 'a {
        self.functions.iter().filter(move |f| f.name == name)
    }

    /// Translate a link-time address to an offset in the file
    pub fn file_offset(&self, address: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| address >= s.vaddr && address - s.vaddr < s.filesz)
            .map(|s| address - s.vaddr + s.offset)
    }

    /// `DT_NEEDED` entries whose name starts with `prefix`
    pub fn needed_matching<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.needed
            .iter()
            .map(String::as_str)
            .filter(move |n| n.starts_with(prefix))
    }
}

/// ELF machine of the running process
pub fn host_machine() -> Option<u16> {
    if cfg!(target_arch = "x86_64") {
        Some(elf::EM_X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(elf::EM_AARCH64)
    } else if cfg!(target_arch = "x86") {
        Some(elf::EM_386)
    } else if cfg!(target_arch = "arm") {
        Some(elf::EM_ARM)
    } else if cfg!(target_arch = "riscv64") {
        Some(elf::EM_RISCV)
    } else {
        None
    }
}

fn parse_image<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Result<ElfImage, ElfError> {
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let sections = header.sections(endian, data)?;

    let mut segments = Vec::new();
    for phdr in header.program_headers(endian, data)? {
        if phdr.p_type(endian) == elf::PT_LOAD {
            segments.push(LoadSegment {
                vaddr: phdr.p_vaddr(endian).into(),
                offset: phdr.p_offset(endian).into(),
                filesz: phdr.p_filesz(endian).into(),
            });
        }
    }

    let mut soname = None;
    let mut needed = Vec::new();
    let mut runpath = Vec::new();
    let mut rpath = Vec::new();
    if let Some((entries, index)) = sections.dynamic(endian, data)? {
        let link = sections.section(index)?.sh_link(endian);
        let strings = sections.strings(endian, data, SectionIndex(link as usize))?;
        for entry in entries {
            let Some(tag) = entry.tag32(endian) else {
                continue;
            };
            if tag == elf::DT_NULL {
                break;
            }
            let value = || {
                entry
                    .string(endian, strings)
                    .ok()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
            };
            match tag {
                elf::DT_NEEDED => needed.extend(value()),
                elf::DT_SONAME => soname = value(),
                elf::DT_RUNPATH => runpath.extend(value().map(split_search_path).unwrap_or_default()),
                elf::DT_RPATH => rpath.extend(value().map(split_search_path).unwrap_or_default()),
                _ => {}
            }
        }
    }
    if runpath.is_empty() {
        runpath = rpath;
    }

    let mut functions = Vec::new();
    let versions = sections.versions(endian, data)?;
    let dynsym = sections.symbols(endian, data, elf::SHT_DYNSYM)?;
    collect_functions(&mut functions, &dynsym, versions.as_ref(), endian, SymbolSource::Dynamic);
    let symtab = sections.symbols(endian, data, elf::SHT_SYMTAB)?;
    collect_functions(&mut functions, &symtab, None, endian, SymbolSource::Static);

    Ok(ElfImage {
        is_64: header.is_type_64(),
        machine: header.e_machine(endian),
        file_type: header.e_type(endian),
        soname,
        needed,
        runpath,
        has_symtab: !symtab.is_empty(),
        functions,
        segments,
    })
}

fn collect_functions<'data, Elf: FileHeader<Endian = Endianness>>(
    out: &mut Vec<FunctionSymbol>,
    table: &SymbolTable<'data, Elf>,
    versions: Option<&VersionTable<'data, Elf>>,
    endian: Endianness,
    source: SymbolSource,
) {
    for (index, sym) in table.iter().enumerate() {
        if sym.st_type() != elf::STT_FUNC || sym.is_undefined(endian) {
            continue;
        }
        let address: u64 = sym.st_value(endian).into();
        if address == 0 {
            continue;
        }
        let Ok(raw) = sym.name(endian, table.strings()) else {
            continue;
        };
        let raw = String::from_utf8_lossy(raw);
        let (name, mut version, mut hidden) = split_versioned(&raw);

        if let Some(versions) = versions {
            let version_index = versions.version_index(endian, SymbolIndex(index));
            if let Ok(Some(v)) = versions.version(version_index) {
                version = Some(String::from_utf8_lossy(v.name()).into_owned());
                hidden = version_index.is_hidden();
            }
        }

        out.push(FunctionSymbol {
            name: name.to_string(),
            version,
            hidden,
            address,
            size: sym.st_size(endian).into(),
            source,
        });
    }
}

/// Split `name@VER` / `name@@VER` as written in static symbol tables
fn split_versioned(raw: &str) -> (&str, Option<String>, bool) {
    if let Some((name, version)) = raw.split_once("@@") {
        (name, Some(version.to_string()), false)
    } else if let Some((name, version)) = raw.split_once('@') {
        (name, Some(version.to_string()), true)
    } else {
        (raw, None, false)
    }
}

fn split_search_path(value: String) -> Vec<String> {
    value
        .split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_versioned() {
        assert_eq!(
            split_versioned("memcpy@@GLIBC_2.14"),
            ("memcpy", Some("GLIBC_2.14".to_string()), false)
        );
        assert_eq!(
            split_versioned("memcpy@GLIBC_2.2.5"),
            ("memcpy", Some("GLIBC_2.2.5".to_string()), true)
        );
        assert_eq!(split_versioned("SSL_read"), ("SSL_read", None, false));
    }

    #[test]
    fn test_rejects_non_elf() {
        assert!(matches!(
            ElfImage::parse(b"#!/bin/sh\necho hi\n"),
            Err(ElfError::NotElf)
        ));
        assert!(ElfImage::parse(&[]).is_err());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_parse_libc() {
        let Some(path) = fixtures::libc_path() else {
            return;
        };
        let image = ElfImage::open(&path).unwrap();

        assert!(image.is_shared_object());
        assert!(image.matches_host());
        assert!(image
            .soname
            .as_deref()
            .is_some_and(|s| s.starts_with("libc.so")));

        let write = image
            .functions_named("write")
            .find(|f| f.source == SymbolSource::Dynamic)
            .expect("libc exports write");
        assert!(write.version.as_deref().is_some_and(|v| v.starts_with("GLIBC_")));

        let size = std::fs::metadata(&path).unwrap().len();
        let offset = image.file_offset(write.address).unwrap();
        assert!(offset < size);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_parse_executable_dependencies() {
        let image = ElfImage::open(Path::new("/proc/self/exe")).unwrap();
        assert!(image.needed_matching("libc.so").next().is_some());
    }
}
