//! ELF layout definitions for the word size of the running process.
//!
//! Only the records needed to walk a loaded image's dynamic section and
//! its relocation tables are described here.

use core::ops::Deref;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")]{
        pub(crate) const E_CLASS: u8 = elf::abi::ELFCLASS64;
        pub(crate) type Phdr = elf::segment::Elf64_Phdr;
        pub(crate) type Dyn = elf::dynamic::Elf64_Dyn;
        pub(crate) type Ehdr = elf::file::Elf64_Ehdr;
        pub(crate) type Rela = elf::relocation::Elf64_Rela;
        pub(crate) type Rel = elf::relocation::Elf64_Rel;
        pub(crate) type Sym = elf::symbol::Elf64_Sym;
        pub(crate) const REL_MASK: usize = 0xFFFFFFFF;
        pub(crate) const REL_BIT: usize = 32;
    }else{
        pub(crate) const E_CLASS: u8 = elf::abi::ELFCLASS32;
        pub(crate) type Phdr = elf::segment::Elf32_Phdr;
        pub(crate) type Dyn = elf::dynamic::Elf32_Dyn;
        pub(crate) type Ehdr = elf::file::Elf32_Ehdr;
        pub(crate) type Rela = elf::relocation::Elf32_Rela;
        pub(crate) type Rel = elf::relocation::Elf32_Rel;
        pub(crate) type Sym = Elf32Sym;
        pub(crate) const REL_MASK: usize = 0xFF;
        pub(crate) const REL_BIT: usize = 8;
    }
}

#[allow(unused)]
#[repr(C)]
/// 32-bit ELF symbol table entry.
pub(crate) struct Elf32Sym {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

/// Common view over `REL` and `RELA` entries.
pub(crate) trait RelocEntry {
    fn r_type(&self) -> u32;
    fn r_symbol(&self) -> usize;
    fn r_offset(&self) -> usize;
}

/// ELF RELA relocation entry.
#[repr(transparent)]
pub(crate) struct ElfRela {
    rela: Rela,
}

impl RelocEntry for ElfRela {
    #[inline]
    fn r_type(&self) -> u32 {
        (self.rela.r_info as usize & REL_MASK) as u32
    }

    #[inline]
    fn r_symbol(&self) -> usize {
        self.rela.r_info as usize >> REL_BIT
    }

    #[inline]
    fn r_offset(&self) -> usize {
        self.rela.r_offset as usize
    }
}

/// ELF REL relocation entry.
#[repr(transparent)]
pub(crate) struct ElfRel {
    rel: Rel,
}

impl RelocEntry for ElfRel {
    #[inline]
    fn r_type(&self) -> u32 {
        (self.rel.r_info as usize & REL_MASK) as u32
    }

    #[inline]
    fn r_symbol(&self) -> usize {
        self.rel.r_info as usize >> REL_BIT
    }

    #[inline]
    fn r_offset(&self) -> usize {
        self.rel.r_offset as usize
    }
}

/// ELF symbol table entry.
#[repr(transparent)]
pub(crate) struct ElfSymbol {
    sym: Sym,
}

impl ElfSymbol {
    /// Returns the symbol name index.
    #[inline]
    pub(crate) fn st_name(&self) -> usize {
        self.sym.st_name as usize
    }
}

/// ELF program header.
#[repr(transparent)]
pub(crate) struct ElfPhdr {
    phdr: Phdr,
}

impl Deref for ElfPhdr {
    type Target = Phdr;

    fn deref(&self) -> &Self::Target {
        &self.phdr
    }
}

/// ELF dynamic entry.
#[repr(transparent)]
pub(crate) struct ElfDyn {
    dynamic: Dyn,
}

impl ElfDyn {
    #[inline]
    pub(crate) fn d_tag(&self) -> i64 {
        self.dynamic.d_tag as i64
    }

    #[inline]
    pub(crate) fn d_un(&self) -> usize {
        self.dynamic.d_un as usize
    }
}
