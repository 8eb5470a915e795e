use super::defs::{E_CLASS, ElfPhdr, Ehdr};
use crate::{Result, arch::EM_ARCH, patch_error};
use core::ops::Deref;
use elf::abi::{EI_CLASS, EI_VERSION, ELFMAGIC, EV_CURRENT};

/// The ELF header of an image that is already mapped into this process.
#[repr(transparent)]
pub(crate) struct ElfHeader {
    ehdr: Ehdr,
}

impl Deref for ElfHeader {
    type Target = Ehdr;

    fn deref(&self) -> &Self::Target {
        &self.ehdr
    }
}

impl ElfHeader {
    /// # Safety
    /// `base` must be the start of a readable mapping of at least one page.
    pub(crate) unsafe fn from_mapped<'a>(base: usize) -> Result<&'a Self> {
        let ehdr: &ElfHeader = unsafe { &*(base as *const ElfHeader) };
        ehdr.validate()?;
        Ok(ehdr)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.e_ident[0..4] != ELFMAGIC {
            return Err(patch_error("invalid ELF magic"));
        }
        if self.e_ident[EI_CLASS] != E_CLASS {
            return Err(patch_error("image class mismatch"));
        }
        if self.e_ident[EI_VERSION] != EV_CURRENT {
            return Err(patch_error("invalid ELF version"));
        }
        if self.e_machine != EM_ARCH {
            return Err(patch_error("image arch mismatch"));
        }
        Ok(())
    }

    /// Program headers of the image mapped at `base`.
    ///
    /// # Safety
    /// `base` must be the address this header was read from.
    pub(crate) unsafe fn phdrs<'a>(&self, base: usize) -> &'a [ElfPhdr] {
        unsafe {
            core::slice::from_raw_parts(
                (base + self.e_phoff as usize) as *const ElfPhdr,
                self.e_phnum as usize,
            )
        }
    }
}
