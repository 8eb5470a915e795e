//! File-descriptor sanitation across the fork boundary.

use crate::{Result, io_error};
use std::os::fd::RawFd;

/// Size of the allow-list. Descriptors at or above it are never allowed.
pub const MAX_FD_SIZE: usize = 1024;

const WORDS: usize = MAX_FD_SIZE / 64;

/// A fixed-size descriptor bitset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FdSet {
    bits: [u64; WORDS],
}

impl FdSet {
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    #[inline]
    fn slot(fd: RawFd) -> Option<(usize, u64)> {
        let fd = usize::try_from(fd).ok().filter(|fd| *fd < MAX_FD_SIZE)?;
        Some((fd / 64, 1 << (fd % 64)))
    }

    /// Returns false if `fd` is outside the representable range.
    pub fn insert(&mut self, fd: RawFd) -> bool {
        match Self::slot(fd) {
            Some((word, mask)) => {
                self.bits[word] |= mask;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, fd: RawFd) {
        if let Some((word, mask)) = Self::slot(fd) {
            self.bits[word] &= !mask;
        }
    }

    #[inline]
    pub fn contains(&self, fd: RawFd) -> bool {
        Self::slot(fd).is_some_and(|(word, mask)| self.bits[word] & mask != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        (0..MAX_FD_SIZE as RawFd).filter(|fd| self.contains(*fd))
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }
}

/// The process descriptor table.
pub trait FdTable: Send + Sync {
    /// Lists the open descriptors, excluding the one used to list them.
    fn list(&self) -> Result<Vec<RawFd>>;

    fn close(&self, fd: RawFd);
}

/// [`FdTable`] over `/proc/self/fd`.
#[derive(Default)]
pub struct ProcFdTable;

impl FdTable for ProcFdTable {
    fn list(&self) -> Result<Vec<RawFd>> {
        let dir = unsafe { libc::opendir(c"/proc/self/fd".as_ptr()) };
        if dir.is_null() {
            return Err(io_error("failed to open /proc/self/fd"));
        }
        let dir_fd = unsafe { libc::dirfd(dir) };
        let mut fds = Vec::new();
        loop {
            let entry = unsafe { libc::readdir(dir) };
            if entry.is_null() {
                break;
            }
            let name = unsafe { core::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) };
            let Some(fd) = name.to_str().ok().and_then(|s| s.parse::<RawFd>().ok()) else {
                continue;
            };
            if fd != dir_fd {
                fds.push(fd);
            }
        }
        unsafe { libc::closedir(dir) };
        Ok(fds)
    }

    fn close(&self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }
}

/// The descriptor allow-list of one specialization event.
#[derive(Clone, Debug, Default)]
pub struct FdSanitizer {
    allowed: FdSet,
}

impl FdSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every descriptor open right now as allowed. Descriptors that
    /// do not fit in the allow-list are closed immediately.
    pub fn capture(table: &dyn FdTable) -> Result<Self> {
        let mut allowed = FdSet::new();
        for fd in table.list()? {
            if !allowed.insert(fd) {
                table.close(fd);
            }
        }
        Ok(Self { allowed })
    }

    #[inline]
    pub fn allow(&mut self, fd: RawFd) {
        self.allowed.insert(fd);
    }

    #[inline]
    pub fn deny(&mut self, fd: RawFd) {
        self.allowed.remove(fd);
    }

    pub fn allowed(&self) -> &FdSet {
        &self.allowed
    }

    /// Closes every open descriptor that is not allowed.
    ///
    /// Returns the descriptors that were closed.
    pub fn sanitize(&self, table: &dyn FdTable) -> Result<Vec<RawFd>> {
        let mut closed = Vec::new();
        for fd in table.list()? {
            if !self.allowed.contains(fd) {
                table.close(fd);
                closed.push(fd);
            }
        }
        #[cfg(feature = "log")]
        if !closed.is_empty() {
            log::debug!("closed fds {closed:?}");
        }
        Ok(closed)
    }
}
