//! Register alias helpers.
//!
//! The analyses reason about the 64-bit general-purpose registers and their
//! narrower aliases (writing `ESP` zero-extends into `RSP`, writing `SP`
//! silently corrupts it). `iced-x86` already knows the containment relation
//! via `Register::full_register`; these helpers give it the shape the
//! analyses want.

use iced_x86::Register;

/// The 64-bit parent of a 32-bit general-purpose register
/// (`ESP` -> `RSP`), or `None` for anything else.
pub fn gpr64_for_gpr32(reg: Register) -> Option<Register> {
    if reg.is_gpr32() {
        Some(reg.full_register())
    } else {
        None
    }
}

/// The 32-bit alias of a 64-bit general-purpose register
/// (`RSP` -> `ESP`), or `None` for anything else.
pub fn gpr32_for_gpr64(reg: Register) -> Option<Register> {
    let r = match reg {
        Register::RAX => Register::EAX,
        Register::RCX => Register::ECX,
        Register::RDX => Register::EDX,
        Register::RBX => Register::EBX,
        Register::RSP => Register::ESP,
        Register::RBP => Register::EBP,
        Register::RSI => Register::ESI,
        Register::RDI => Register::EDI,
        Register::R8 => Register::R8D,
        Register::R9 => Register::R9D,
        Register::R10 => Register::R10D,
        Register::R11 => Register::R11D,
        Register::R12 => Register::R12D,
        Register::R13 => Register::R13D,
        Register::R14 => Register::R14D,
        Register::R15 => Register::R15D,
        _ => return None,
    };
    Some(r)
}

/// True if `reg` is a strict sub-register (8/16/32-bit alias) of the 64-bit
/// register `full64`.
pub fn is_sub_reg_of(reg: Register, full64: Register) -> bool {
    debug_assert!(full64.is_gpr64());
    reg != full64 && (reg.is_gpr8() || reg.is_gpr16() || reg.is_gpr32()) && reg.full_register() == full64
}

/// True for the six segment registers.
pub fn is_segment_reg(reg: Register) -> bool {
    reg.is_segment_register()
}
