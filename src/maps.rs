//! Parsing of the process memory map.
//!
//! Every decision about which image to patch, and which protection a patched
//! page must be restored to, is taken against one snapshot produced by
//! [`MapInfo::scan`].

use crate::{Result, io_error};
use bitflags::bitflags;
use core::ffi::c_int;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags of one mapping.
    pub struct ProtFlags: c_int {
        /// No access allowed.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

/// One line of `/proc/self/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapInfo {
    /// First address of the mapping.
    pub start: usize,
    /// One past the last address of the mapping.
    pub end: usize,
    pub perms: ProtFlags,
    /// `p` (copy-on-write) rather than `s` in the permission column.
    pub is_private: bool,
    /// Offset of the mapping into the backing file.
    pub offset: usize,
    pub dev: u64,
    pub inode: u64,
    /// Backing path; empty for anonymous mappings.
    pub path: String,
}

const MAPS_PATH: &str = "/proc/self/maps";

impl MapInfo {
    /// Reads the current memory map of this process.
    pub fn scan() -> Result<Vec<MapInfo>> {
        let content = std::fs::read_to_string(MAPS_PATH)
            .map_err(|err| io_error(format!("failed to read {MAPS_PATH}: {err}")))?;
        Ok(Self::parse_all(&content))
    }

    /// Parses a whole maps table, silently skipping malformed lines.
    pub fn parse_all(content: &str) -> Vec<MapInfo> {
        content.lines().filter_map(MapInfo::parse).collect()
    }

    /// Parses a single maps line such as
    /// `7f2c4e000000-7f2c4e022000 r--p 00000000 fd:01 1311 /usr/lib/libc.so.6`.
    pub fn parse(line: &str) -> Option<MapInfo> {
        let mut rest = line;
        let range = next_field(&mut rest)?;
        let perms = next_field(&mut rest)?;
        let offset = next_field(&mut rest)?;
        let dev = next_field(&mut rest)?;
        let inode = next_field(&mut rest)?;
        let path = rest.trim();

        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;

        let perm_bytes = perms.as_bytes();
        if perm_bytes.len() < 4 {
            return None;
        }
        let mut prot = ProtFlags::PROT_NONE;
        if perm_bytes[0] == b'r' {
            prot |= ProtFlags::PROT_READ;
        }
        if perm_bytes[1] == b'w' {
            prot |= ProtFlags::PROT_WRITE;
        }
        if perm_bytes[2] == b'x' {
            prot |= ProtFlags::PROT_EXEC;
        }

        let (major, minor) = dev.split_once(':')?;
        let major = u32::from_str_radix(major, 16).ok()?;
        let minor = u32::from_str_radix(minor, 16).ok()?;

        Some(MapInfo {
            start,
            end,
            perms: prot,
            is_private: perm_bytes[3] == b'p',
            offset: usize::from_str_radix(offset, 16).ok()?,
            dev: libc::makedev(major, minor) as u64,
            inode: inode.parse().ok()?,
            path: path.to_string(),
        })
    }

    /// Whether this mapping is the first load segment of a module: private,
    /// readable and starting at file offset zero.
    #[inline]
    pub fn is_image_head(&self) -> bool {
        self.offset == 0 && self.is_private && self.perms.contains(ProtFlags::PROT_READ)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(field)
}

/// Finds the head mapping of the first image whose path ends with `suffix`.
pub fn find_image<'a>(maps: &'a [MapInfo], suffix: &str) -> Option<&'a MapInfo> {
    maps.iter()
        .find(|map| map.is_image_head() && map.path.ends_with(suffix))
}
