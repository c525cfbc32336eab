//! Address-space oracle for the live worker.
//!
//! Parses `/proc/<pid>/maps` and classifies 64 bit values crossing the
//! interface: is this a pointer at all, does it point into code, into the
//! instrumented library, into the standard library? The instrumentation
//! engine rewrites the binary enough that mapping addresses are useless for
//! symbolization, but they are exactly what we need for provenance.

use std::{
    fs,
    path::{Path, PathBuf},
};

use regex::Regex;

use crate::error::Result;

/// Libraries considered "standard" for triage: a crash whose frames all live
/// here tells us nothing about which side of the boundary faulted.
const STDLIB_RANGE_PATTERN: &str =
    r"(libc(-[0-9.]*)?\.so)|(libgobject[^/]*\.so)|(libstdc\+\+)|(libgcc)|(libasan)|(libpthread)";

/// One executable mapping, keyed by the backing file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    pub begin: u64,
    pub end: u64,
}

impl Region {
    fn contains(&self, value: u64) -> bool {
        value >= self.begin && value < self.end
    }
}

/// The oracle. Rebuilt whenever the executable mapping set of the worker
/// changes; a failed rebuild keeps the previous view and reports not-ready.
#[derive(Debug)]
pub struct AddressSpace {
    copy_path: PathBuf,
    stdlib_pattern: Regex,
    lib_basenames: Vec<String>,
    last_exec_lines: Vec<String>,
    base: u64,
    heap: u64,
    stack: u64,
    text: Vec<Region>,
    lib: Vec<Region>,
    stdlib: Vec<Region>,
    ready: bool,
}

impl AddressSpace {
    /// `lib_paths` are the instrumented libraries; their executable ranges
    /// are matched by file basename. `copy_path` receives an atomic copy of
    /// every good maps snapshot, for the per-run artifacts.
    pub fn new(lib_paths: &[PathBuf], copy_path: PathBuf) -> Self {
        let lib_basenames = lib_paths
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        Self {
            copy_path,
            // the pattern is fixed, it cannot fail to compile
            stdlib_pattern: Regex::new(STDLIB_RANGE_PATTERN).unwrap(),
            lib_basenames,
            last_exec_lines: Vec::new(),
            base: 0,
            heap: 0,
            stack: 0,
            text: Vec::new(),
            lib: Vec::new(),
            stdlib: Vec::new(),
            ready: false,
        }
    }

    /// Re-read the worker's maps; rebuild only if the executable lines
    /// changed since the last good snapshot. Returns whether a rebuild
    /// happened. The worker dying mid-read is not an error, the previous
    /// view simply stays.
    pub fn refresh(&mut self, pid: i32) -> Result<bool> {
        let content = match fs::read_to_string(format!("/proc/{pid}/maps")) {
            Ok(content) if !content.is_empty() => content,
            _ => return Ok(false),
        };

        let exec_lines: Vec<String> = content
            .lines()
            .filter(|line| is_exec_line(line))
            .map(str::to_owned)
            .collect();

        if self.ready && exec_lines == self.last_exec_lines {
            return Ok(false);
        }

        // copy first, in case the worker dies while we parse
        fs::write(&self.copy_path, &content)?;

        if self.rebuild(&content) {
            self.last_exec_lines = exec_lines;
            self.ready = true;
            Ok(true)
        } else {
            log::debug!("worker {pid} maps incomplete, keeping previous view");
            Ok(false)
        }
    }

    fn rebuild(&mut self, content: &str) -> bool {
        let mut base = 0u64;
        let mut heap = 0u64;
        let mut stack = 0u64;
        let mut text = Vec::new();

        for line in content.lines() {
            let Some(mapping) = parse_line(line) else {
                continue;
            };

            if base == 0 && mapping.perms.starts_with("r--p") && mapping.offset == 0 {
                base = mapping.begin;
            }
            match mapping.path {
                Some("[heap]") => heap = mapping.begin,
                Some("[stack]") => stack = mapping.begin,
                _ => {}
            }
            if is_exec_perms(mapping.perms) {
                text.push(Region {
                    name: mapping.path.unwrap_or("").to_owned(),
                    begin: mapping.begin,
                    end: mapping.end,
                });
            }
        }

        if base == 0 || stack == 0 || text.is_empty() {
            return false;
        }

        text.sort_by_key(|r| r.begin);

        let lib: Vec<Region> = text
            .iter()
            .filter(|r| self.is_lib_path(&r.name))
            .cloned()
            .collect();

        // all instrumented libraries must be mapped before the view is usable
        let mut matched: Vec<&str> = lib
            .iter()
            .filter_map(|r| Path::new(&r.name).file_name())
            .filter_map(|n| n.to_str())
            .collect();
        matched.sort_unstable();
        matched.dedup();
        if matched.len() != self.lib_basenames.len() {
            return false;
        }

        let stdlib: Vec<Region> = text
            .iter()
            .filter(|r| self.stdlib_pattern.is_match(&r.name))
            .cloned()
            .collect();

        self.base = base;
        self.heap = heap;
        self.stack = stack;
        self.text = text;
        self.lib = lib;
        self.stdlib = stdlib;
        true
    }

    fn is_lib_path(&self, path: &str) -> bool {
        Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.lib_basenames.iter().any(|b| b == n))
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Candidate pool bases for interesting pointers: process base, lowest
    /// text mapping, stack, and heap when present.
    pub fn interesting_bases(&self) -> Vec<u64> {
        let mut bases = vec![self.base];
        if let Some(first_text) = self.text.first() {
            bases.push(first_text.begin);
        }
        bases.push(self.stack);
        if self.heap != 0 {
            bases.push(self.heap);
        }
        bases
    }

    /// Terribly simple heuristic, might not always hold.
    pub fn is_pointer(&self, value: u64) -> bool {
        self.ready && value >= self.base
    }

    pub fn is_code(&self, value: u64) -> bool {
        self.text.iter().any(|r| r.contains(value))
    }

    pub fn is_lib_code(&self, value: u64) -> bool {
        self.lib.iter().any(|r| r.contains(value))
    }

    pub fn is_stdlib_code(&self, value: u64) -> bool {
        self.stdlib.iter().any(|r| r.contains(value))
    }

    pub fn is_non_code_pointer(&self, value: u64) -> bool {
        self.is_pointer(value) && !self.is_code(value)
    }

    /// The backing file of the executable mapping containing `value`.
    pub fn owner_of(&self, value: u64) -> Option<&str> {
        self.text
            .iter()
            .find(|r| r.contains(value))
            .map(|r| r.name.as_str())
    }

    /// Executable regions, for the static endpoint estimate.
    pub fn text_regions(&self) -> &[Region] {
        &self.text
    }

    /// Build a ready oracle straight from a maps snapshot.
    #[cfg(test)]
    pub(crate) fn from_snapshot(lib_paths: &[PathBuf], content: &str) -> Option<Self> {
        let mut maps = Self::new(lib_paths, std::env::temp_dir().join("boxfuzz_maps_fixture"));
        if maps.rebuild(content) {
            maps.ready = true;
            Some(maps)
        } else {
            None
        }
    }

    pub fn instrumented_paths(&self) -> impl Iterator<Item = &str> {
        self.lib.iter().map(|r| r.name.as_str())
    }
}

struct MapsLine<'a> {
    begin: u64,
    end: u64,
    perms: &'a str,
    offset: u64,
    path: Option<&'a str>,
}

fn parse_line(line: &str) -> Option<MapsLine<'_>> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next();

    let (begin, end) = range.split_once('-')?;
    Some(MapsLine {
        begin: u64::from_str_radix(begin, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

fn is_exec_perms(perms: &str) -> bool {
    let bytes = perms.as_bytes();
    bytes.len() >= 4 && bytes[2] == b'x' && bytes[3] == b'p'
}

fn is_exec_line(line: &str) -> bool {
    parse_line(line).is_some_and(|m| is_exec_perms(m.perms))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
555555554000-555555556000 r--p 00000000 08:01 1001 /usr/bin/convert
555555556000-555555560000 r-xp 00002000 08:01 1001 /usr/bin/convert
7f0000000000-7f0000010000 r-xp 00000000 08:01 2002 /usr/lib/libgs.so.9.55
7f0000100000-7f0000180000 r-xp 00000000 08:01 3003 /usr/lib/libc-2.31.so
7f0000200000-7f0000280000 r-xp 00000000 08:01 4004 /usr/lib/libasan.so.6
7f0000300000-7f0000340000 rw-p 00000000 00:00 0
55555a000000-55555a100000 rw-p 00000000 00:00 0 [heap]
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]
";

    fn oracle() -> AddressSpace {
        AddressSpace::from_snapshot(&[PathBuf::from("/usr/lib/libgs.so.9.55")], MAPS).unwrap()
    }

    #[test]
    fn bases_and_pseudo_ranges() {
        let maps = oracle();
        assert_eq!(maps.base(), 0x555555554000);
        assert_eq!(maps.heap, 0x55555a000000);
        assert_eq!(maps.stack, 0x7ffffffde000);
    }

    #[test]
    fn classification_partitions_code() {
        let maps = oracle();
        let app_text = 0x555555556100;
        let lib_text = 0x7f0000000100;
        let libc_text = 0x7f0000100100;

        for addr in [app_text, lib_text, libc_text] {
            assert!(maps.is_code(addr));
            // lib and stdlib are disjoint subsets of code
            assert!(!(maps.is_lib_code(addr) && maps.is_stdlib_code(addr)));
        }
        assert!(maps.is_lib_code(lib_text));
        assert!(maps.is_stdlib_code(libc_text));
        assert!(!maps.is_lib_code(app_text) && !maps.is_stdlib_code(app_text));
    }

    #[test]
    fn pointer_heuristic() {
        let maps = oracle();
        assert!(maps.is_pointer(0x55555a000010));
        assert!(!maps.is_pointer(42));
        assert!(maps.is_non_code_pointer(0x55555a000010));
        assert!(!maps.is_non_code_pointer(0x7f0000000100));
    }

    #[test]
    fn owner_lookup() {
        let maps = oracle();
        assert_eq!(maps.owner_of(0x7f0000200010), Some("/usr/lib/libasan.so.6"));
        assert_eq!(maps.owner_of(0x1000), None);
    }

    #[test]
    fn rebuild_fails_without_instrumented_lib() {
        let copy = tempfile::NamedTempFile::new().unwrap();
        let mut maps = AddressSpace::new(
            &[PathBuf::from("/usr/lib/libpng16.so")],
            copy.path().to_path_buf(),
        );
        assert!(!maps.rebuild(MAPS));
        assert!(!maps.ready());
    }

    #[test]
    fn interesting_bases_cover_segments() {
        let maps = oracle();
        let bases = maps.interesting_bases();
        assert!(bases.contains(&0x555555554000));
        assert!(bases.contains(&0x7ffffffde000));
        assert!(bases.contains(&0x55555a000000));
    }
}
