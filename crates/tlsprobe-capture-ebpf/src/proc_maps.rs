//! Linux process mappings via /proc filesystem
//!
//! Resolved offsets are file-relative. Before attaching to one process the
//! backend checks here that the exact library file is mapped there and works
//! out where the offset lands at runtime.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

/// One line of /proc/{pid}/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    /// Offset into the mapped file
    pub offset: u64,
    pub inode: u64,
    pub path: Option<PathBuf>,
}

impl Mapping {
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    /// Does this mapping cover `file_offset` of its file?
    pub fn contains_file_offset(&self, file_offset: u64) -> bool {
        file_offset >= self.offset && file_offset < self.offset + (self.end - self.start)
    }
}

/// Parse the content of a maps file
pub fn parse_maps(content: &str) -> Vec<Mapping> {
    content.lines().filter_map(parse_line).collect()
}

/// Format: start-end perms offset dev inode [path]
fn parse_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let inode = fields.next()?;
    // Paths may contain spaces; everything after the inode belongs to it
    let path: Vec<&str> = fields.collect();

    let (start, end) = range.split_once('-')?;
    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: perms.to_string(),
        offset: u64::from_str_radix(offset, 16).ok()?,
        inode: inode.parse().ok()?,
        path: if path.is_empty() || !path[0].starts_with('/') {
            None
        } else {
            Some(PathBuf::from(path.join(" ")))
        },
    })
}

/// Read and parse /proc/{pid}/maps
pub fn read_maps(pid: u32) -> io::Result<Vec<Mapping>> {
    let content = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&content))
}

/// Mappings of `library` in a parsed maps table
///
/// Paths in maps are the ones the loader opened; they are compared after
/// canonicalization so symlinked names still match.
pub fn library_mappings<'a>(maps: &'a [Mapping], library: &Path) -> Vec<&'a Mapping> {
    let wanted = fs::canonicalize(library).unwrap_or_else(|_| library.to_path_buf());
    maps.iter()
        .filter(|m| {
            m.path.as_deref().is_some_and(|p| {
                p == wanted || fs::canonicalize(p).map(|c| c == wanted).unwrap_or(false)
            })
        })
        .collect()
}

/// Runtime address of `file_offset` inside `library` as mapped in `maps`
///
/// Only executable mappings are considered since the offset is a function entry.
pub fn runtime_address(maps: &[Mapping], library: &Path, file_offset: u64) -> Option<u64> {
    let address = library_mappings(maps, library)
        .into_iter()
        .filter(|m| m.is_executable())
        .find(|m| m.contains_file_offset(file_offset))
        .map(|m| m.start + (file_offset - m.offset));
    trace!(
        "Offset {:#x} of {} maps to {:?}",
        file_offset,
        library.display(),
        address
    );
    address
}

/// Process command name from /proc/{pid}/comm
pub fn process_comm(pid: u32) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|comm| comm.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0c8a00000-55d0c8a28000 r--p 00000000 fd:01 1835106                    /usr/bin/curl
7f3a1c000000-7f3a1c021000 rw-p 00000000 00:00 0
7f3a1d200000-7f3a1d25e000 r--p 00000000 fd:01 1838397                    /usr/lib/x86_64-linux-gnu/libssl.so.3
7f3a1d25e000-7f3a1d2ba000 r-xp 0005e000 fd:01 1838397                    /usr/lib/x86_64-linux-gnu/libssl.so.3
7f3a1d2ba000-7f3a1d2d7000 r--p 000ba000 fd:01 1838397                    /usr/lib/x86_64-linux-gnu/libssl.so.3
7ffd4b9e0000-7ffd4ba01000 rw-p 00000000 00:00 0                          [stack]
7f3a1e000000-7f3a1e001000 r-xp 00000000 fd:01 42                         /opt/My App/lib name.so
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(SAMPLE);
        assert_eq!(maps.len(), 7);

        let text = &maps[3];
        assert_eq!(text.start, 0x7f3a1d25e000);
        assert_eq!(text.offset, 0x5e000);
        assert_eq!(text.inode, 1838397);
        assert!(text.is_executable());
        assert!(!maps[2].is_executable());

        assert_eq!(maps[1].path, None);
        assert_eq!(maps[5].path, None);
        assert_eq!(
            maps[6].path.as_deref(),
            Some(Path::new("/opt/My App/lib name.so"))
        );
    }

    #[test]
    fn test_runtime_address() {
        let maps = parse_maps(SAMPLE);
        let lib = Path::new("/usr/lib/x86_64-linux-gnu/libssl.so.3");

        assert_eq!(library_mappings(&maps, lib).len(), 3);
        assert_eq!(
            runtime_address(&maps, lib, 0x60010),
            Some(0x7f3a1d25e000 + 0x2010)
        );
        // Read-only segment, not code
        assert_eq!(runtime_address(&maps, lib, 0x100), None);
        assert_eq!(runtime_address(&maps, Path::new("/usr/lib/libgnutls.so.30"), 0x60010), None);
    }

    #[test]
    fn test_own_process() {
        let maps = read_maps(std::process::id()).unwrap();
        let exe = fs::read_link("/proc/self/exe").unwrap();
        assert!(!library_mappings(&maps, &exe).is_empty());
        assert!(process_comm(std::process::id()).is_some());
    }
}
