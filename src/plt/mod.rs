//! Import-slot patching.
//!
//! A [`HookBackend`] queues `(dev, inode, symbol)` patches and applies them
//! as one batch. The default [`PltBackend`] rewrites the `JUMP_SLOT`,
//! `GLOB_DAT` and absolute relocation targets of the named symbol inside
//! the running process; every unsafe assumption about memory layout stays
//! in this module.

mod defs;
mod ehdr;
mod image;

use crate::{
    Result,
    maps::{MapInfo, ProtFlags},
    patch_error,
};
use core::ffi::c_void;
use image::{LoadedImage, page_size};

/// A queued import-slot rewrite.
#[derive(Clone, Debug)]
pub struct PendingPatch {
    pub dev: u64,
    pub inode: u64,
    pub symbol: String,
    /// Address written into every matching slot.
    pub replacement: usize,
    /// Address of a pointer-sized cell that receives the previous slot value,
    /// or zero.
    pub backup: usize,
}

/// The "register then commit" capability over import tables.
pub trait HookBackend: Send {
    /// Queues a patch. Returns false when the request is unusable.
    fn register(
        &mut self,
        dev: u64,
        inode: u64,
        symbol: &str,
        replacement: *mut c_void,
        backup: *mut *mut c_void,
    ) -> bool;

    /// Applies every queued patch against the memory map `maps` and clears
    /// the queue. Fails if any single patch could not be applied.
    fn commit(&mut self, maps: &[MapInfo]) -> Result<()>;
}

/// Patches the global offset table of images mapped in this process.
#[derive(Default)]
pub struct PltBackend {
    pending: Vec<PendingPatch>,
}

impl PltBackend {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn apply(patch: &PendingPatch, maps: &[MapInfo]) -> Result<()> {
        let head = maps
            .iter()
            .find(|map| map.dev == patch.dev && map.inode == patch.inode && map.is_image_head())
            .ok_or_else(|| {
                patch_error(format!(
                    "image {:x}:{} is not mapped",
                    patch.dev, patch.inode
                ))
            })?;
        let image = unsafe { LoadedImage::from_head(head)? };
        let slots = image.find_slots(&patch.symbol);
        if slots.is_empty() {
            return Err(patch_error(format!(
                "[{}] has no import slot in {}",
                patch.symbol, head.path
            )));
        }

        let mut original = None;
        for slot in slots {
            let previous = unsafe { write_slot(slot, patch.replacement, maps)? };
            original.get_or_insert(previous);
        }
        if patch.backup != 0 {
            if let Some(previous) = original {
                unsafe { (patch.backup as *mut usize).write(previous) };
            }
        }
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] patched in {} -> {:#x}",
            patch.symbol,
            head.path,
            patch.replacement
        );
        Ok(())
    }
}

impl HookBackend for PltBackend {
    fn register(
        &mut self,
        dev: u64,
        inode: u64,
        symbol: &str,
        replacement: *mut c_void,
        backup: *mut *mut c_void,
    ) -> bool {
        if dev == 0 || inode == 0 || symbol.is_empty() || replacement.is_null() {
            return false;
        }
        self.pending.push(PendingPatch {
            dev,
            inode,
            symbol: symbol.to_owned(),
            replacement: replacement as usize,
            backup: backup as usize,
        });
        true
    }

    fn commit(&mut self, maps: &[MapInfo]) -> Result<()> {
        let pending = core::mem::take(&mut self.pending);
        let mut failed = 0;
        for patch in &pending {
            if let Err(err) = Self::apply(patch, maps) {
                #[cfg(feature = "log")]
                log::error!("{err}");
                let _ = err;
                failed += 1;
            }
        }
        if failed != 0 {
            return Err(patch_error(format!(
                "{failed} of {} patches failed",
                pending.len()
            )));
        }
        Ok(())
    }
}

/// Writes `value` into the pointer-sized slot at `slot` and returns the
/// value it held.
///
/// # Safety
/// `slot` must be an import slot of an image described by `maps`.
unsafe fn write_slot(slot: usize, value: usize, maps: &[MapInfo]) -> Result<usize> {
    let prot = maps
        .iter()
        .find(|map| map.contains(slot))
        .map(|map| map.perms)
        .ok_or_else(|| patch_error(format!("slot {slot:#x} is not mapped")))?;

    let page = slot & !(page_size() - 1);
    let len = slot + size_of::<usize>() - page;
    let writable = prot.contains(ProtFlags::PROT_WRITE);
    if !writable {
        let res = unsafe {
            libc::mprotect(
                page as *mut c_void,
                len,
                (prot | ProtFlags::PROT_WRITE).bits(),
            )
        };
        if res != 0 {
            return Err(patch_error(format!("mprotect of {page:#x} failed")));
        }
    }

    let ptr = slot as *mut usize;
    let previous = unsafe { ptr.read_volatile() };
    unsafe { ptr.write_volatile(value) };

    if !writable {
        let res = unsafe { libc::mprotect(page as *mut c_void, len, prot.bits()) };
        if res != 0 {
            return Err(patch_error(format!(
                "failed to restore protection of {page:#x}"
            )));
        }
    }
    Ok(previous)
}
