//! Shared instruction-shape helpers for the analyses.
//!
//! The idiom matchers below all work on the fixed expression-tree layout:
//! a binary instruction's first operand value sits behind the first
//! `OperandRef`, its second behind the second.

use sbx_x86::expr::{ExprFlags, ExprKind, ExprVec};
use sbx_x86::{regs, DecodedInst, Mnemonic, Register};

/// The register of the `n`th operand, when that operand is a plain register.
pub(crate) fn operand_register(inst: &DecodedInst, n: usize) -> Option<Register> {
    let vec = inst.exprs();
    let i = vec.operand_value_index(n)?;
    match vec.get(i)?.kind {
        ExprKind::Register(r) => Some(r),
        _ => None,
    }
}

fn operand_flags(inst: &DecodedInst, n: usize) -> Option<ExprFlags> {
    let vec = inst.exprs();
    let i = vec.operand_value_index(n)?;
    Some(vec.get(i)?.flags)
}

/// `mnemonic reg1, reg2` with exactly two operands.
pub(crate) fn is_binary_using_registers(
    inst: &DecodedInst,
    mnemonic: Mnemonic,
    reg1: Register,
    reg2: Register,
) -> bool {
    inst.mnemonic() == mnemonic
        && inst.exprs().operand_count() == 2
        && operand_register(inst, 0) == Some(reg1)
        && operand_register(inst, 1) == Some(reg2)
}

/// `mov reg_set, reg_use` where the destination is written without being
/// read and the source is read without being written.
pub(crate) fn is_mov_using_registers(
    inst: &DecodedInst,
    reg_set: Register,
    reg_use: Register,
) -> bool {
    is_binary_using_registers(inst, Mnemonic::Mov, reg_set, reg_use)
        && operand_flags(inst, 0).is_some_and(|f| {
            f.contains(ExprFlags::SET) && !f.contains(ExprFlags::USED)
        })
        && operand_flags(inst, 1).is_some_and(|f| {
            f.contains(ExprFlags::USED) && !f.contains(ExprFlags::SET)
        })
}

/// `mnemonic reg1, reg2` where the destination is read *and* written
/// (`or`/`add` style) and the source only read.
pub(crate) fn is_binary_set_using_registers(
    inst: &DecodedInst,
    mnemonic: Mnemonic,
    reg1: Register,
    reg2: Register,
) -> bool {
    is_binary_using_registers(inst, mnemonic, reg1, reg2)
        && operand_flags(inst, 0)
            .is_some_and(|f| f.contains(ExprFlags::SET | ExprFlags::USED))
        && operand_flags(inst, 1).is_some_and(|f| {
            f.contains(ExprFlags::USED) && !f.contains(ExprFlags::SET)
        })
}

/// First operand is a write of exactly `reg`.
pub(crate) fn operand_one_is_register_set(inst: &DecodedInst, reg: Register) -> bool {
    let vec = inst.exprs();
    let Some(i) = vec.operand_value_index(0) else {
        return false;
    };
    let Some(node) = vec.get(i) else { return false };
    matches!(node.kind, ExprKind::Register(r) if r == reg) && node.flags.contains(ExprFlags::SET)
}

/// The instruction writes the full 32-bit register `reg32`, which in
/// 64-bit mode clears the upper half of the 64-bit parent. Any full 32-bit
/// GPR write qualifies.
pub(crate) fn assigns_register_with_zero_extends(inst: &DecodedInst, reg32: Register) -> bool {
    reg32.is_gpr32() && operand_one_is_register_set(inst, reg32)
}

/// Like [`assigns_register_with_zero_extends`], phrased for the 64-bit
/// register whose upper half must end up clear.
pub(crate) fn assigns_register_with_zero_extends64(inst: &DecodedInst, reg64: Register) -> bool {
    regs::gpr32_for_gpr64(reg64)
        .is_some_and(|reg32| assigns_register_with_zero_extends(inst, reg32))
}

/// The identity move `mov reg32, reg32`.
pub(crate) fn is_mov32_using_reg(inst: &DecodedInst, reg32: Register) -> bool {
    reg32.is_gpr32() && is_mov_using_registers(inst, reg32, reg32)
}

/// `add esp, C` / `sub esp, C` with a constant (stack adjustment that
/// leaves the upper half of RSP for the following repair instruction).
pub(crate) fn is_add_or_sub_bounded_const_from_esp(inst: &DecodedInst) -> bool {
    if !matches!(inst.mnemonic(), Mnemonic::Add | Mnemonic::Sub) {
        return false;
    }
    let vec = inst.exprs();
    if vec.operand_count() != 2 {
        return false;
    }
    if operand_register(inst, 0) != Some(Register::ESP) {
        return false;
    }
    let Some(i) = vec.operand_value_index(1) else {
        return false;
    };
    matches!(vec.get(i), Some(node) if node.constant().is_some())
}

/// The memory offset at `mem` is exactly `[base + index*1 + 0]`.
pub(crate) fn mem_offset_matches_base_index(
    vec: &ExprVec,
    mem: usize,
    base: Register,
    index: Register,
) -> bool {
    vec.mem_base(mem) == base
        && vec.mem_index(mem) == index
        && vec.mem_scale(mem) == Some(1)
        && vec.mem_disp(mem) == Some(0)
}

/// `lea reg, [reg + base_register*1 + 0]` with a 64-bit address: the
/// repair instruction filling the upper half of `reg` from the sandbox
/// base.
pub(crate) fn is_lea_address_reg_plus_rbase(
    inst: &DecodedInst,
    reg: Register,
    base_register: Register,
) -> bool {
    if inst.mnemonic() != Mnemonic::Lea || inst.exprs().operand_count() != 2 {
        return false;
    }
    let vec = inst.exprs();
    let Some(mem) = vec.operand_value_index(1) else {
        return false;
    };
    let Some(node) = vec.get(mem) else { return false };
    node.kind == ExprKind::MemOffset
        && node.flags.contains(ExprFlags::SIZE_64)
        && mem_offset_matches_base_index(vec, mem, reg, base_register)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_x86::{decode_one, DecodeMode};

    fn decode(bytes: &[u8]) -> DecodedInst {
        decode_one(DecodeMode::Bits64, 0, bytes).expect("non-empty")
    }

    #[test]
    fn recognises_mov_rsp_rbp() {
        // 48 89 EC => mov rsp, rbp
        let inst = decode(&[0x48, 0x89, 0xEC]);
        assert!(is_mov_using_registers(&inst, Register::RSP, Register::RBP));
        assert!(!is_mov_using_registers(&inst, Register::RBP, Register::RSP));
    }

    #[test]
    fn recognises_add_rsp_rbase() {
        // 4C 01 FC => add rsp, r15
        let inst = decode(&[0x4C, 0x01, 0xFC]);
        assert!(is_binary_set_using_registers(
            &inst,
            Mnemonic::Add,
            Register::RSP,
            Register::R15
        ));
    }

    #[test]
    fn zero_extension_is_a_full_32_bit_write() {
        // 89 CC => mov esp, ecx
        let inst = decode(&[0x89, 0xCC]);
        assert!(assigns_register_with_zero_extends(&inst, Register::ESP));
        assert!(assigns_register_with_zero_extends64(&inst, Register::RSP));
        // 66 89 CC => mov sp, cx does not zero-extend
        let inst = decode(&[0x66, 0x89, 0xCC]);
        assert!(!assigns_register_with_zero_extends(&inst, Register::ESP));
    }

    #[test]
    fn recognises_identity_mov32() {
        // 89 FF => mov edi, edi
        let inst = decode(&[0x89, 0xFF]);
        assert!(is_mov32_using_reg(&inst, Register::EDI));
        assert!(!is_mov32_using_reg(&inst, Register::ESI));
    }

    #[test]
    fn recognises_esp_const_adjustment() {
        // 83 EC 10 => sub esp, 0x10
        let inst = decode(&[0x83, 0xEC, 0x10]);
        assert!(is_add_or_sub_bounded_const_from_esp(&inst));
        // 29 EC => sub esp, ebp is not a constant adjustment
        let inst = decode(&[0x29, 0xEC]);
        assert!(!is_add_or_sub_bounded_const_from_esp(&inst));
    }

    #[test]
    fn recognises_lea_repair() {
        // 4A 8D 24 3C => lea rsp, [rsp+r15*1]
        let inst = decode(&[0x4A, 0x8D, 0x24, 0x3C]);
        assert!(is_lea_address_reg_plus_rbase(
            &inst,
            Register::RSP,
            Register::R15
        ));
        assert!(!is_lea_address_reg_plus_rbase(
            &inst,
            Register::RBP,
            Register::R15
        ));
    }
}
