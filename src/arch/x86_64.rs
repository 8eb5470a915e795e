//! x86-64 import slot relocation types.

use elf::abi::*;

/// The ELF machine type for x86-64 architecture.
pub const EM_ARCH: u16 = EM_X86_64;

/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;

/// Map x86-64 relocation type to human readable name
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
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
        // [rsp]: target, [rsp + 8]: arg, 8 bytes of padding
        sub rsp, 24
        mov rsi, rsp
        call {0}
        mov rax, [rsp]
        mov rdi, [rsp + 8]
        add rsp, 24
        jmp rax
        ",
        sym crate::hooks::unload_step,
    )
}
