use elf::abi::*;

pub const EM_ARCH: u16 = EM_ARM;

pub const REL_GOT: u32 = R_ARM_GLOB_DAT;
pub const REL_SYMBOLIC: u32 = R_ARM_ABS32;
pub const REL_JUMP_SLOT: u32 = R_ARM_JUMP_SLOT;

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_ARM_NONE => "R_ARM_NONE",
        R_ARM_ABS32 => "R_ARM_ABS32",
        R_ARM_GLOB_DAT => "R_ARM_GLOB_DAT",
        R_ARM_JUMP_SLOT => "R_ARM_JUMP_SLOT",
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
        push {{r4, lr}}
        // [sp]: target, [sp + 4]: arg
        sub sp, sp, #8
        mov r1, sp
        blx {0}
        ldr ip, [sp]
        ldr r0, [sp, #4]
        add sp, sp, #8
        pop {{r4, lr}}
        bx ip
        ",
        sym crate::hooks::unload_step,
    )
}
