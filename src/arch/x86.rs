use elf::abi::*;

pub const EM_ARCH: u16 = EM_386;

pub const REL_GOT: u32 = R_386_GLOB_DAT;
pub const REL_SYMBOLIC: u32 = R_386_32;
pub const REL_JUMP_SLOT: u32 = R_386_JMP_SLOT;

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_386_NONE => "R_386_NONE",
        R_386_32 => "R_386_32",
        R_386_GLOB_DAT => "R_386_GLOB_DAT",
        R_386_JMP_SLOT => "R_386_JMP_SLOT",
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
        // [esp]: target, [esp + 4]: arg, attr sits at [esp + 24]
        sub esp, 20
        mov eax, esp
        mov ecx, [esp + 24]
        push eax
        push ecx
        call {0}
        add esp, 8
        mov eax, [esp]
        mov ecx, [esp + 4]
        add esp, 20
        // reuse the caller's argument slot
        mov [esp + 4], ecx
        jmp eax
        ",
        sym crate::hooks::unload_step,
    )
}
