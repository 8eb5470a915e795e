//! AArch64 import slot relocation types.

use elf::abi::*;

pub const EM_ARCH: u16 = EM_AARCH64;

/// GOT entry relocation type.
pub const REL_GOT: u32 = R_AARCH64_GLOB_DAT;
/// Symbolic relocation type.
pub const REL_SYMBOLIC: u32 = R_AARCH64_ABS64;
/// PLT jump slot relocation type.
pub const REL_JUMP_SLOT: u32 = R_AARCH64_JUMP_SLOT;

/// Map aarch64 relocation type to human readable name
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        _ => "UNKNOWN",
    }
}

/// Entry point patched over `pthread_attr_destroy`.
///
/// Calls [`crate::hooks::unload_step`] with a two-word continuation slot
/// on its own stack, then drops its frame and jumps to the stored target
/// with the stored argument. When the target is `dlclose` on this image,
/// nothing of ours is left on the stack to return into.
///
/// # Safety
/// Must only be reached as a replacement for `pthread_attr_destroy`.
#[unsafe(naked)]
pub(crate) extern "C" fn unload_trampoline() {
    core::arch::naked_asm!(
        "
        stp x29, x30, [sp, #-32]!
        mov x29, sp
        // [sp + 16]: target, [sp + 24]: arg
        add x1, sp, #16
        bl {0}
        ldp x16, x0, [sp, #16]
        ldp x29, x30, [sp], #32
        br x16
        ",
        sym crate::hooks::unload_step,
    )
}
