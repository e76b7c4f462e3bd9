//! Control-flow validation.
//!
//! Single pass over the instruction stream, reconciled at end of segment:
//! every instruction start lands in `possible_targets`, every direct
//! jump/call destination in `actual_targets`, and every address inside a
//! multi-instruction idiom in `removed_targets`. Indirect jumps must be
//! masked by the recognised idiom immediately before them; the summary then
//! proves that nothing branches outside the region, between instructions,
//! or into the middle of an idiom.

use std::collections::TryReserveError;

use sbx_x86::expr::{ExprFlags, ExprKind};
use sbx_x86::{regs, Code, DecodeMode, DecodedInst, InstFlags, Mnemonic, Register, SegmentIter};

use crate::address_set::AddressSet;
use crate::patterns;
use crate::report::Severity;
use crate::state::ValidatorState;

/// The three address sets of one run.
#[derive(Debug)]
pub(crate) struct JumpSets {
    /// Destinations named by direct jumps and calls.
    pub actual_targets: AddressSet,
    /// Legal instruction starts.
    pub possible_targets: AddressSet,
    /// Instruction starts disqualified by idiom membership.
    pub removed_targets: AddressSet,
}

impl JumpSets {
    pub(crate) fn new(codesize: u64) -> Result<Self, TryReserveError> {
        Ok(Self {
            actual_targets: AddressSet::new(codesize)?,
            possible_targets: AddressSet::new(codesize)?,
            removed_targets: AddressSet::new(codesize)?,
        })
    }
}

/// Record that `addr` must not be branched to, because it is inside an
/// atomic idiom (or is a guard the idiom ends in). Out-of-range addresses
/// were already reported when their instruction was visited.
pub(crate) fn mark_target_illegal(state: &mut ValidatorState, addr: u64) {
    if addr >= state.vbase() && addr < state.vlimit() {
        let offset = addr - state.vbase();
        state.jump_sets.removed_targets.add(offset);
    }
}

pub(crate) fn validate_inst(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    remember_ip(state, inst);
    if inst.is_branch() {
        add_expr_jump_targets(state, iter);
        if inst.flags().contains(InstFlags::CALL) {
            validate_call_alignment(state, inst);
        }
    }
}

/// Record the instruction boundary.
fn remember_ip(state: &mut ValidatorState, inst: &DecodedInst) {
    let pc = inst.addr();
    if pc < state.vbase() || pc >= state.vlimit() {
        state.inst_error(inst, "Instruction pc out of range".into());
    } else {
        let offset = pc - state.vbase();
        state.jump_sets.possible_targets.add(offset);
    }
}

fn add_expr_jump_targets(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    for &node in inst.exprs().nodes() {
        if !node.flags.contains(ExprFlags::JUMP_TARGET) {
            continue;
        }
        match node.kind {
            // Wrapper; the value child below carries the same flag.
            ExprKind::OperandRef => {}
            ExprKind::Register(reg) => match state.mode() {
                DecodeMode::Bits64 => check_indirect_jump64(state, iter, reg),
                DecodeMode::Bits32 => check_indirect_jump32(state, iter, reg),
            },
            ExprKind::Constant(disp) => {
                let target = inst.end_addr().wrapping_add(disp);
                // `call 0` is how linkers express unresolved weak targets.
                if target == 0 && inst.flags().contains(InstFlags::CALL) {
                    continue;
                }
                add_jump_to_sets(state, inst, target);
            }
            _ => {
                state.inst_error(inst, "Jump not sandbox compliant".into());
            }
        }
    }
}

fn add_jump_to_sets(state: &mut ValidatorState, inst: &DecodedInst, target: u64) {
    if target >= state.vbase() && target < state.vlimit() {
        // Remember for reconciliation against instruction boundaries.
        state.jump_sets.actual_targets.add(target - state.vbase());
    } else if target & state.bundle_mask() == 0 {
        // Bundle-aligned exit. If it leaves the untrusted address space it
        // lands in the guard regions.
    } else if state.cur_inst_unchanged() {
        // Replacement mode, instruction byte-identical to the already
        // validated original: boundaries outside the replaced range are
        // unknown here but were proven when the code was first admitted.
    } else {
        state.inst_error(inst, "Instruction jumps to bad address".into());
    }
}

/// 64-bit masked indirect jump:
///
/// ```text
///     and  r32, MASK
///     lea  r64, [rbase + r64'*1]     (or: add r64', rbase)
///     jmp  r64                       (any jump or call)
/// ```
///
/// where `r64'` is the 64-bit parent of `r32` and MASK clears exactly the
/// bundle bits. The AND must use the `0x83` (imm8) encoding. On a match
/// the middle instruction and the jump are removed from the legal targets,
/// so control can only enter at the AND.
fn check_indirect_jump64(state: &mut ValidatorState, iter: &SegmentIter<'_>, jump_reg: Register) {
    match match_indirect_jump64(state, iter, jump_reg) {
        Some(middle_addr) => {
            mark_target_illegal(state, middle_addr);
            mark_target_illegal(state, iter.cur().addr());
        }
        None => {
            state.inst_error(iter.cur(), "Invalid indirect jump".into());
        }
    }
}

fn match_indirect_jump64(
    state: &ValidatorState,
    iter: &SegmentIter<'_>,
    jump_reg: Register,
) -> Option<u64> {
    let and_inst = iter.lookback(2)?;
    if and_inst.code() != Code::And_rm32_imm8 {
        return None;
    }
    let and_reg = patterns::operand_register(and_inst, 0)?;
    let and_64_reg = regs::gpr64_for_gpr32(and_reg)?;

    let and_vec = and_inst.exprs();
    let mask_index = and_vec.operand_value_index(1)?;
    if and_vec.get(mask_index)?.constant()? != state.jump_mask() {
        return None;
    }

    let middle = iter.lookback(1)?;
    let middle_reg = patterns::operand_register(middle, 0)?;
    if middle_reg != jump_reg {
        return None;
    }
    match middle.mnemonic() {
        Mnemonic::Lea => {
            let mvec = middle.exprs();
            let mem = mvec.operand_value_index(1)?;
            if mvec.get(mem)?.kind != ExprKind::MemOffset {
                return None;
            }
            if !patterns::mem_offset_matches_base_index(
                mvec,
                mem,
                state.config().base_register,
                and_64_reg,
            ) {
                return None;
            }
        }
        Mnemonic::Add => {
            if jump_reg != and_64_reg {
                return None;
            }
            if patterns::operand_register(middle, 1)? != state.config().base_register {
                return None;
            }
        }
        _ => return None,
    }
    Some(middle.addr())
}

/// 32-bit masked indirect jump: `and r32, MASK` immediately before the
/// jump, same register, same mask encoding. The jump itself is removed
/// from the legal targets.
fn check_indirect_jump32(state: &mut ValidatorState, iter: &SegmentIter<'_>, jump_reg: Register) {
    let matched = (|| -> Option<()> {
        let and_inst = iter.lookback(1)?;
        if and_inst.code() != Code::And_rm32_imm8 {
            return None;
        }
        if patterns::operand_register(and_inst, 0)? != jump_reg {
            return None;
        }
        let vec = and_inst.exprs();
        let mask_index = vec.operand_value_index(1)?;
        if vec.get(mask_index)?.constant()? != state.jump_mask() {
            return None;
        }
        Some(())
    })();
    match matched {
        Some(()) => mark_target_illegal(state, iter.cur().addr()),
        None => state.inst_error(iter.cur(), "Invalid indirect jump".into()),
    }
}

/// A call's return address is reached by `ret`, which is not an explicit
/// jump; the only way it can be safe is to lie on a bundle boundary.
fn validate_call_alignment(state: &mut ValidatorState, inst: &DecodedInst) {
    let return_pc = inst.end_addr();
    if return_pc & state.bundle_mask() != 0 {
        state.inst_error(
            inst,
            format!("Bad call alignment, return pc = {return_pc:x}"),
        );
    }
}

fn is_reachable(state: &ValidatorState, offset: u64) -> bool {
    state.jump_sets.possible_targets.contains(offset)
        && !state.jump_sets.removed_targets.contains(offset)
}

/// End-of-segment reconciliation.
pub(crate) fn summarize(state: &mut ValidatorState) {
    if state.quit() {
        return;
    }
    state.message(
        Severity::Info,
        None,
        format!(
            "Checking jump targets: {:x} to {:x}",
            state.vbase(),
            state.vlimit()
        ),
    );

    // Walk the backing bytes of all three sets at once; only ranges with a
    // problem bit fall back to per-address checks. The naive per-address
    // loop costs a measurable share of overall validation time.
    let array_len = state.jump_sets.actual_targets.as_bytes().len();
    for i in 0..array_len {
        let actual = state.jump_sets.actual_targets.as_bytes()[i];
        let possible = state.jump_sets.possible_targets.as_bytes()[i];
        let removed = state.jump_sets.removed_targets.as_bytes()[i];
        let problem = actual & (!possible | removed);
        if problem == 0 {
            continue;
        }
        for bit in 0..8u64 {
            let offset = ((i as u64) << 3) + bit;
            if offset >= state.codesize() {
                break;
            }
            if state.jump_sets.actual_targets.contains(offset) && !is_reachable(state, offset) {
                state.message(
                    Severity::Error,
                    Some(state.vbase() + offset),
                    "Bad jump target".into(),
                );
            }
        }
    }

    state.message(
        Severity::Info,
        None,
        "Checking that basic blocks are aligned".into(),
    );
    if state.vbase() & state.bundle_mask() != 0 {
        state.message(
            Severity::Error,
            Some(state.vbase()),
            "Code segment starts at misaligned address".into(),
        );
    } else {
        let bundle = u64::from(state.config().bundle_size);
        let mut offset = 0;
        while offset < state.codesize() {
            if !is_reachable(state, offset) {
                state.message(
                    Severity::Error,
                    Some(state.vbase() + offset),
                    "Bad basic block alignment".into(),
                );
            }
            offset += bundle;
        }
    }
}
