//! Architectures whose import slots can be patched.
//!
//! Each backend only names the three relocation kinds that may hold the
//! address of an imported function: the lazy-binding jump slot, the GOT
//! entry and the plain absolute word.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")]{
        mod x86_64;
        pub use x86_64::*;
    }else if #[cfg(target_arch = "riscv64")]{
        mod riscv64;
        pub use riscv64::*;
    }else if #[cfg(target_arch="aarch64")]{
        mod aarch64;
        pub use aarch64::*;
    }else if #[cfg(target_arch = "x86")]{
        mod x86;
        pub use x86::*;
    }else if #[cfg(target_arch = "arm")]{
        mod arm;
        pub use arm::*;
    }
}

/// Returns true if a relocation of this type resolves to a symbol address
/// that a call may be routed through.
#[inline]
pub(crate) fn is_import_slot(r_type: u32) -> bool {
    r_type == REL_JUMP_SLOT || r_type == REL_GOT || r_type == REL_SYMBOLIC
}
