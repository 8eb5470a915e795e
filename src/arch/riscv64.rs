use elf::abi::*;

pub const EM_ARCH: u16 = EM_RISCV;

// RISC-V has no dedicated GOT relocation; GOT entries use R_RISCV_64.
pub const REL_GOT: u32 = u32::MAX;
pub const REL_SYMBOLIC: u32 = R_RISCV_64;
pub const REL_JUMP_SLOT: u32 = R_RISCV_JUMP_SLOT;

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_RISCV_NONE => "R_RISCV_NONE",
        R_RISCV_64 => "R_RISCV_64",
        R_RISCV_JUMP_SLOT => "R_RISCV_JUMP_SLOT",
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
        addi sp, sp, -32
        sd ra, 24(sp)
        // 0(sp): target, 8(sp): arg
        mv a1, sp
        call {0}
        ld t1, 0(sp)
        ld a0, 8(sp)
        ld ra, 24(sp)
        addi sp, sp, 32
        jr t1
        ",
        sym crate::hooks::unload_step,
    )
}
