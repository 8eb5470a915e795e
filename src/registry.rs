//! Pattern-based symbol hook registration.
//!
//! Registrations are queued, matched against one memory-map snapshot at
//! commit time and handed to a [`HookBackend`] as concrete
//! `(dev, inode, symbol)` patches.

use crate::{
    Result, argument_error,
    maps::MapInfo,
    pattern_error,
    plt::{HookBackend, PltBackend},
    restore_error,
};
use core::ffi::c_void;
use regex::Regex;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct HookRegistration {
    pattern: Regex,
    symbol: String,
    replacement: usize,
    backup: usize,
}

struct IgnoreRule {
    pattern: Regex,
    /// `None` suppresses every symbol of a matching module.
    symbol: Option<String>,
}

impl IgnoreRule {
    fn covers(&self, path: &str, symbol: &str) -> bool {
        self.pattern.is_match(path) && self.symbol.as_deref().is_none_or(|s| s == symbol)
    }
}

/// A hook placed by the loader itself, kept so that it can be reversed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledHook {
    pub dev: u64,
    pub inode: u64,
    pub symbol: String,
    /// The slot value before the hook was committed.
    pub original: usize,
}

struct RegistryInner {
    registrations: Vec<HookRegistration>,
    ignores: Vec<IgnoreRule>,
    backend: Box<dyn HookBackend>,
}

/// Queues of pending symbol hooks and the backend that applies them.
pub struct HookRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(Box::new(PltBackend::new()))
    }
}

impl HookRegistry {
    pub fn new(backend: Box<dyn HookBackend>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                registrations: Vec::new(),
                ignores: Vec::new(),
                backend,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a hook of `symbol` in every module whose path matches `pattern`.
    pub fn register(
        &self,
        pattern: &str,
        symbol: &str,
        replacement: *mut c_void,
        backup: *mut *mut c_void,
    ) -> Result<()> {
        if symbol.is_empty() || replacement.is_null() {
            return Err(argument_error(format!(
                "hook of [{symbol}] has no symbol or replacement"
            )));
        }
        let pattern = Regex::new(pattern)
            .map_err(|err| pattern_error(format!("invalid module pattern [{pattern}]: {err}")))?;
        self.lock().registrations.push(HookRegistration {
            pattern,
            symbol: symbol.to_owned(),
            replacement: replacement as usize,
            backup: backup as usize,
        });
        Ok(())
    }

    /// Suppresses queued hooks in modules matching `pattern`, for one symbol
    /// or for all of them.
    pub fn exclude(&self, pattern: &str, symbol: Option<&str>) -> Result<()> {
        let pattern = Regex::new(pattern)
            .map_err(|err| pattern_error(format!("invalid module pattern [{pattern}]: {err}")))?;
        self.lock().ignores.push(IgnoreRule {
            pattern,
            symbol: symbol.filter(|s| !s.is_empty()).map(str::to_owned),
        });
        Ok(())
    }

    /// Resolves the queued registrations against the current memory map and
    /// commits the resulting patches.
    pub fn commit(&self) -> Result<()> {
        let maps = MapInfo::scan()?;
        self.commit_snapshot(&maps)
    }

    /// Like [`commit`](Self::commit) with an explicit memory-map snapshot.
    ///
    /// Both queues are cleared whatever the outcome.
    pub fn commit_snapshot(&self, maps: &[MapInfo]) -> Result<()> {
        let mut inner = self.lock();
        let RegistryInner {
            registrations,
            ignores,
            backend,
        } = &mut *inner;

        for map in maps.iter().filter(|map| map.is_image_head()) {
            for reg in registrations.iter() {
                if !reg.pattern.is_match(&map.path) {
                    continue;
                }
                if ignores.iter().any(|rule| rule.covers(&map.path, &reg.symbol)) {
                    #[cfg(feature = "log")]
                    log::trace!("[{}] ignored in {}", reg.symbol, map.path);
                    continue;
                }
                if !backend.register(
                    map.dev,
                    map.inode,
                    &reg.symbol,
                    reg.replacement as *mut c_void,
                    reg.backup as *mut *mut c_void,
                ) {
                    #[cfg(feature = "log")]
                    log::warn!("[{}] rejected for {}", reg.symbol, map.path);
                }
            }
        }
        registrations.clear();
        ignores.clear();
        backend.commit(maps)
    }

    /// Queues a hook for one module identified by device and inode.
    pub fn register_image(
        &self,
        dev: u64,
        inode: u64,
        symbol: &str,
        replacement: *mut c_void,
        backup: *mut *mut c_void,
    ) -> Result<()> {
        if dev == 0 || inode == 0 || symbol.is_empty() || replacement.is_null() {
            return Err(argument_error(format!(
                "hook of [{symbol}] in {dev:x}:{inode} is incomplete"
            )));
        }
        if !self
            .lock()
            .backend
            .register(dev, inode, symbol, replacement, backup)
        {
            return Err(argument_error(format!("backend rejected hook of [{symbol}]")));
        }
        Ok(())
    }

    /// Commits only what was queued through
    /// [`register_image`](Self::register_image).
    pub fn commit_direct(&self) -> Result<()> {
        self.commit_direct_snapshot(&MapInfo::scan()?)
    }

    pub fn commit_direct_snapshot(&self, maps: &[MapInfo]) -> Result<()> {
        self.lock().backend.commit(maps)
    }

    /// Puts every hook in `installed` back to its original target.
    pub fn reverse(&self, installed: &[InstalledHook]) -> Result<()> {
        self.reverse_snapshot(installed, &MapInfo::scan()?)
    }

    pub fn reverse_snapshot(&self, installed: &[InstalledHook], maps: &[MapInfo]) -> Result<()> {
        let mut inner = self.lock();
        let mut rejected = 0;
        for hook in installed {
            if !inner.backend.register(
                hook.dev,
                hook.inode,
                &hook.symbol,
                hook.original as *mut c_void,
                core::ptr::null_mut(),
            ) {
                #[cfg(feature = "log")]
                log::error!("failed to register restore of [{}]", hook.symbol);
                rejected += 1;
            }
        }
        let committed = inner.backend.commit(maps);
        if rejected != 0 {
            return Err(restore_error(format!("{rejected} hooks could not be restored")));
        }
        committed.map_err(|err| restore_error(format!("failed to restore hooks: {err}")))
    }
}
