use super::{
    defs::{ElfDyn, ElfRel, ElfRela, ElfSymbol, RelocEntry},
    ehdr::ElfHeader,
};
#[cfg(feature = "log")]
use crate::arch::rel_type_to_str;
use crate::{Result, arch::is_import_slot, maps::MapInfo, patch_error};
use core::ffi::CStr;
use elf::abi::{
    DT_JMPREL, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ, DT_STRTAB,
    DT_SYMTAB, PT_DYNAMIC, PT_LOAD,
};

/// The dynamic linking tables of an image that is mapped in this process.
pub(crate) struct LoadedImage {
    bias: usize,
    symtab: usize,
    strtab: usize,
    jmprel: Option<(usize, usize)>,
    jmprel_is_rela: bool,
    rela: Option<(usize, usize)>,
    rel: Option<(usize, usize)>,
}

impl LoadedImage {
    /// Reads the dynamic section of the image whose first segment is `head`.
    ///
    /// # Safety
    /// `head` must describe a mapping that is still present in this process.
    pub(crate) unsafe fn from_head(head: &MapInfo) -> Result<Self> {
        let base = head.start;
        let ehdr = unsafe { ElfHeader::from_mapped(base)? };
        let phdrs = unsafe { ehdr.phdrs(base) };

        let first_load = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_LOAD && phdr.p_offset == 0)
            .ok_or_else(|| patch_error(format!("{} has no load segment at offset 0", head.path)))?;
        let bias = base.wrapping_sub(first_load.p_vaddr as usize & !(page_size() - 1));

        let dynamic = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_DYNAMIC)
            .ok_or_else(|| patch_error(format!("{} has no dynamic section", head.path)))?;

        let mut symtab = 0;
        let mut strtab = 0;
        let mut jmprel = None;
        let mut jmprel_size = 0;
        let mut jmprel_is_rela = cfg!(target_pointer_width = "64");
        let mut rela = None;
        let mut rela_size = 0;
        let mut rel = None;
        let mut rel_size = 0;

        // glibc rewrites d_ptr entries to absolute addresses, bionic does not.
        let absolute = |value: usize| if value < bias { value + bias } else { value };

        let mut cur = (bias + dynamic.p_vaddr as usize) as *const ElfDyn;
        unsafe {
            loop {
                let entry = &*cur;
                match entry.d_tag() {
                    DT_NULL => break,
                    DT_SYMTAB => symtab = absolute(entry.d_un()),
                    DT_STRTAB => strtab = absolute(entry.d_un()),
                    DT_JMPREL => jmprel = Some(absolute(entry.d_un())),
                    DT_PLTRELSZ => jmprel_size = entry.d_un(),
                    DT_PLTREL => jmprel_is_rela = entry.d_un() as i64 == DT_RELA,
                    DT_RELA => rela = Some(absolute(entry.d_un())),
                    DT_RELASZ => rela_size = entry.d_un(),
                    DT_REL => rel = Some(absolute(entry.d_un())),
                    DT_RELSZ => rel_size = entry.d_un(),
                    _ => {}
                }
                cur = cur.add(1);
            }
        }

        if symtab == 0 || strtab == 0 {
            return Err(patch_error(format!(
                "{} has no dynamic symbol table",
                head.path
            )));
        }

        Ok(LoadedImage {
            bias,
            symtab,
            strtab,
            jmprel: jmprel.map(|addr| (addr, jmprel_size)),
            jmprel_is_rela,
            rela: rela.map(|addr| (addr, rela_size)),
            rel: rel.map(|addr| (addr, rel_size)),
        })
    }

    /// Addresses of every import slot bound to `symbol`.
    pub(crate) fn find_slots(&self, symbol: &str) -> Vec<usize> {
        let mut slots = Vec::new();
        if let Some((addr, size)) = self.jmprel {
            if self.jmprel_is_rela {
                self.scan::<ElfRela>(addr, size, symbol, &mut slots);
            } else {
                self.scan::<ElfRel>(addr, size, symbol, &mut slots);
            }
        }
        if let Some((addr, size)) = self.rela {
            self.scan::<ElfRela>(addr, size, symbol, &mut slots);
        }
        if let Some((addr, size)) = self.rel {
            self.scan::<ElfRel>(addr, size, symbol, &mut slots);
        }
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    fn scan<R: RelocEntry>(&self, addr: usize, size: usize, symbol: &str, out: &mut Vec<usize>) {
        let entries =
            unsafe { core::slice::from_raw_parts(addr as *const R, size / size_of::<R>()) };
        for entry in entries {
            let r_type = entry.r_type();
            let index = entry.r_symbol();
            if index == 0 || !is_import_slot(r_type) {
                continue;
            }
            if self.symbol_name(index) == symbol.as_bytes() {
                #[cfg(feature = "log")]
                log::trace!(
                    "[{symbol}] import slot at {:#x} ({})",
                    self.bias + entry.r_offset(),
                    rel_type_to_str(r_type)
                );
                out.push(self.bias + entry.r_offset());
            }
        }
    }

    fn symbol_name(&self, index: usize) -> &[u8] {
        unsafe {
            let sym = &*((self.symtab as *const ElfSymbol).add(index));
            CStr::from_ptr((self.strtab + sym.st_name()) as *const core::ffi::c_char).to_bytes()
        }
    }
}

#[inline]
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
