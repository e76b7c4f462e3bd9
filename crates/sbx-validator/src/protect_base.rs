//! Protection of the sandbox base register and the stack/frame registers.
//!
//! The sandbox base register may never be written. RSP and RBP may only
//! change through idioms that provably keep their upper halves equal to
//! the base register's, because both are used as memory bases without
//! masking. A write to ESP/EBP is judged one instruction late: it is legal
//! exactly when the *next* instruction completes one of the repair idioms,
//! hence the two-slot pending buffer.

use sbx_x86::expr::{ExprFlags, ExprKind};
use sbx_x86::{regs, DecodedInst, Mnemonic, Register, SegmentIter};

use crate::jumps::mark_target_illegal;
use crate::patterns;
use crate::state::ValidatorState;

/// Pending 32-bit assignments of one instruction: `(address, length)` of
/// the instruction that set ESP/EBP, to report if nothing consumes it.
#[derive(Debug, Default, Clone, Copy)]
struct RegisterLocals {
    esp_set: Option<(u64, u8)>,
    ebp_set: Option<(u64, u8)>,
}

/// Two-slot circular buffer over the current and previous instruction.
#[derive(Debug)]
pub(crate) struct BaseRegisterLocals {
    buffer: [RegisterLocals; 2],
    previous: usize,
    current: usize,
}

impl Default for BaseRegisterLocals {
    fn default() -> Self {
        Self {
            buffer: [RegisterLocals::default(); 2],
            previous: 0,
            current: 1,
        }
    }
}

impl BaseRegisterLocals {
    fn record_esp(&mut self, inst: &DecodedInst) {
        self.buffer[self.current].esp_set = Some((inst.addr(), inst.len()));
    }

    fn record_ebp(&mut self, inst: &DecodedInst) {
        self.buffer[self.current].ebp_set = Some((inst.addr(), inst.len()));
    }

    /// The previous instruction's ESP assignment was consumed by a repair
    /// idiom.
    fn clear_previous_esp(&mut self) {
        self.buffer[self.previous].esp_set = None;
    }

    fn clear_previous_ebp(&mut self) {
        self.buffer[self.previous].ebp_set = None;
    }
}

/// Report whatever the previous instruction left pending, then rotate the
/// buffer by one instruction.
fn maybe_report_previous_bad(state: &mut ValidatorState) {
    let previous = state.base_locals.previous;
    if let Some((addr, len)) = state.base_locals.buffer[previous].esp_set.take() {
        state.error_at(addr, len, "Illegal assignment to ESP".into());
    }
    if let Some((addr, len)) = state.base_locals.buffer[previous].ebp_set.take() {
        state.error_at(addr, len, "Illegal assignment to EBP".into());
    }
    let current = state.base_locals.current;
    state.base_locals.previous = current;
    state.base_locals.current = (current + 1) % 2;
}

pub(crate) fn validate_inst(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    let base_register = state.config().base_register;

    for &node in inst.exprs().nodes() {
        let ExprKind::Register(reg) = node.kind else {
            continue;
        };
        if !node.flags.contains(ExprFlags::SET) {
            continue;
        }
        if reg == base_register {
            state.inst_error(
                inst,
                format!("Illegal to change the value of register {base_register:?}"),
            );
            continue;
        }
        match reg {
            Register::RSP => check_rsp_assignment(state, iter),
            Register::RBP => check_rbp_assignment(state, iter),
            Register::ESP => state.base_locals.record_esp(inst),
            Register::EBP => state.base_locals.record_ebp(inst),
            r if regs::is_segment_reg(r) => {
                state.inst_error(inst, format!("Illegal assignment to segment register {r:?}"));
            }
            r => check_subregister_assignment(state, inst, r),
        }
    }
    maybe_report_previous_bad(state);
}

/// RSP may change through:
///  1. `mov rsp, rbp` (RBP already meets the invariant);
///  2. `or/add rsp, rbase` right after a zero-extending write of ESP,
///     or after `add/sub esp, C` for the `add` form;
///  3. the implicit adjustment of `push`/`pop`/`call`;
///  4. `and rsp, -C` (imm8, stack realignment; keeps the upper half);
///  5. `lea rsp, [rsp+rbase*1]` right after a zero-extending write of ESP.
fn check_rsp_assignment(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    match inst.mnemonic() {
        Mnemonic::Push | Mnemonic::Pop | Mnemonic::Call => {
            // The stack-slot update (or `pop rsp`, which loads from the
            // sandboxed stack).
            return;
        }
        Mnemonic::Or | Mnemonic::Add => {
            if patterns::is_binary_set_using_registers(
                inst,
                inst.mnemonic(),
                Register::RSP,
                state.config().base_register,
            ) {
                if let Some(prev) = iter.lookback(1) {
                    let adjusts = patterns::assigns_register_with_zero_extends(prev, Register::ESP)
                        || (inst.mnemonic() == Mnemonic::Add
                            && patterns::is_add_or_sub_bounded_const_from_esp(prev));
                    if adjusts {
                        // Legal as long as the pair stays atomic.
                        mark_target_illegal(state, inst.addr());
                        state.base_locals.clear_previous_esp();
                        return;
                    }
                }
            }
        }
        Mnemonic::Lea => {
            if accept_reg_move_lea32_to_64(state, iter, Register::RSP) {
                state.base_locals.clear_previous_esp();
                return;
            }
        }
        Mnemonic::And => {
            // `and rsp, -C` encoded 48 83 e4 XX with XX negative.
            let bytes = inst.bytes();
            if bytes.len() == 4
                && bytes[0] == 0x48
                && bytes[1] == 0x83
                && bytes[2] == 0xE4
                && bytes[3] & 0x80 != 0
            {
                return;
            }
        }
        _ => {}
    }
    if patterns::is_mov_using_registers(inst, Register::RSP, Register::RBP) {
        return;
    }
    state.inst_error(inst, "Illegal assignment to RSP".into());
}

/// RBP may change through `mov rbp, rsp`, or `add rbp, rbase` /
/// `lea rbp, [rbp+rbase*1]` right after a zero-extending write of EBP.
fn check_rbp_assignment(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    match inst.mnemonic() {
        Mnemonic::Add => {
            if patterns::is_binary_set_using_registers(
                inst,
                Mnemonic::Add,
                Register::RBP,
                state.config().base_register,
            ) {
                if let Some(prev) = iter.lookback(1) {
                    if patterns::assigns_register_with_zero_extends(prev, Register::EBP) {
                        mark_target_illegal(state, inst.addr());
                        state.base_locals.clear_previous_ebp();
                        return;
                    }
                }
            }
        }
        Mnemonic::Lea => {
            if accept_reg_move_lea32_to_64(state, iter, Register::RBP) {
                state.base_locals.clear_previous_ebp();
                return;
            }
        }
        _ => {}
    }
    if patterns::is_mov_using_registers(inst, Register::RBP, Register::RSP) {
        return;
    }
    state.inst_error(inst, "Illegal change to register RBP".into());
}

/// The two-instruction repair: a zero-extending write of the 32-bit alias
/// followed by `lea reg, [reg+rbase*1]` filling the upper half.
fn accept_reg_move_lea32_to_64(
    state: &mut ValidatorState,
    iter: &SegmentIter<'_>,
    reg: Register,
) -> bool {
    let inst = iter.cur();
    debug_assert!(matches!(reg, Register::RSP | Register::RBP));
    if !patterns::operand_one_is_register_set(inst, reg) {
        return false;
    }
    let Some(prev) = iter.lookback(1) else {
        return false;
    };
    if patterns::assigns_register_with_zero_extends64(prev, reg)
        && patterns::is_lea_address_reg_plus_rbase(inst, reg, state.config().base_register)
    {
        mark_target_illegal(state, inst.addr());
        return true;
    }
    false
}

/// Writing any narrower alias of a protected register silently corrupts
/// the 64-bit value. (ESP/EBP were matched before reaching here.)
fn check_subregister_assignment(state: &mut ValidatorState, inst: &DecodedInst, reg: Register) {
    for full in [state.config().base_register, Register::RSP, Register::RBP] {
        if regs::is_sub_reg_of(reg, full) {
            state.inst_error(
                inst,
                format!("Changing {reg:?} changes the value of {full:?}"),
            );
            return;
        }
    }
}

/// End of segment: anything still pending is an unconsumed 32-bit
/// assignment.
pub(crate) fn summarize(state: &mut ValidatorState) {
    maybe_report_previous_bad(state);
}
