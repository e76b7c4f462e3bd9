//! The validation driver: sequences the analyses over an instruction
//! stream and implements replacement validation.

use sbx_x86::expr::{ExprFlags, ExprKind};
use sbx_x86::{DecodeMode, DecodedInst, Mnemonic, SegmentIter};

use crate::halt_trim::halt_trim_size;
use crate::report::Severity;
use crate::state::ValidatorState;
use crate::{cpu_checks, jumps, jumps_detailed, memory_protect, protect_base};

/// Run every analysis on the current instruction, in fixed order. An
/// exhausted error budget stops the remaining analyses for this and all
/// later instructions.
fn apply_validators(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    if state.config().trace_instructions {
        state.trace(format!("-> visit: {}", iter.cur()));
    }
    cpu_checks::validate_inst(state, iter);
    if state.quit() {
        return;
    }
    if let Err(reason) = state.check_legality(iter.cur()) {
        state.inst_error(iter.cur(), reason);
    }
    if state.quit() {
        return;
    }
    // Register protection and memory sandboxing are 64-bit properties;
    // 32-bit segments rely on segmentation plus the jump rules.
    if state.mode() == DecodeMode::Bits64 {
        protect_base::validate_inst(state, iter);
        if state.quit() {
            return;
        }
        memory_protect::validate_inst(state, iter);
        if state.quit() {
            return;
        }
    }
    jumps::validate_inst(state, iter);
    if state.config().opcode_histogram {
        state.histogram.record(iter.cur().mnemonic());
    }
}

/// Post-pass summarization: pending base-register state first, so its
/// reports precede the jump reconciliation's.
fn apply_post_validators(state: &mut ValidatorState, code: &[u8]) {
    if state.mode() == DecodeMode::Bits64 {
        protect_base::summarize(state);
    }
    if state.config().detailed_jumps {
        jumps_detailed::summarize(state, code);
    } else {
        jumps::summarize(state);
    }
    if state.config().opcode_histogram {
        for line in state.histogram.lines() {
            state.message(Severity::Info, None, line);
        }
    }
}

/// Validate one code segment. The verdict is read with
/// [`ValidatorState::is_valid`]; `code` must be the bytes mapped at the
/// state's base address.
pub fn validate_segment(code: &[u8], state: &mut ValidatorState) {
    let code = trim_padding(code, state);
    let mut iter = SegmentIter::new(code, state.vbase(), state.mode());
    while iter.advance() {
        state.note_instruction();
        if state.quit() {
            // Keep walking to preserve the instruction count, but stop
            // analysing.
            continue;
        }
        apply_validators(state, &iter);
    }
    apply_post_validators(state, code);
}

fn trim_padding<'a>(code: &'a [u8], state: &mut ValidatorState) -> &'a [u8] {
    let limit = (code.len() as u64).min(state.codesize()) as usize;
    let trimmed = halt_trim_size(
        &code[..limit],
        state.vbase(),
        state.config().bundle_size,
    );
    state.set_codesize(trimmed as u64);
    &code[..trimmed]
}

/// Validate `new_code` as a replacement for the previously validated
/// `old_code` at the same address and size. Instruction pairs must be
/// byte-identical or differ only in the admitted constants; every new
/// instruction additionally passes the full analyses, with byte-identical
/// ones marked unchanged (which relaxes the direct-jump range check).
pub fn validate_segment_pair(old_code: &[u8], new_code: &[u8], state: &mut ValidatorState) {
    if old_code.len() != new_code.len() {
        state.message(
            Severity::Error,
            None,
            "Code modification: code segments have different sizes".into(),
        );
        return;
    }
    let mut iter_old = SegmentIter::new(old_code, state.vbase(), state.mode());
    let mut iter_new = SegmentIter::new(new_code, state.vbase(), state.mode());
    loop {
        let old_next = iter_old.advance();
        let new_next = iter_new.advance();
        if !old_next || !new_next {
            if old_next != new_next {
                state.message(
                    Severity::Error,
                    None,
                    "Code modification: code segments have different number of instructions"
                        .into(),
                );
            }
            break;
        }
        state.note_instruction();
        if state.quit() {
            continue;
        }
        let changed = validate_inst_replacement(state, iter_old.cur(), iter_new.cur());
        state.set_cur_inst_unchanged(!changed);
        apply_validators(state, &iter_new);
        state.set_cur_inst_unchanged(false);
    }
    apply_post_validators(state, new_code);
}

/// Check that `new` is an admissible replacement for `old`. Returns true
/// when the instruction changed (in admitted or inadmissible ways).
fn validate_inst_replacement(
    state: &mut ValidatorState,
    old: &DecodedInst,
    new: &DecodedInst,
) -> bool {
    if old.addr() != new.addr() || old.len() != new.len() {
        state.inst_error(
            new,
            "Code modification: instructions length/addresses do not match".into(),
        );
        return true;
    }
    if old.bytes() == new.bytes() {
        return false;
    }
    if !is_admissible_modification(old, new) {
        state.inst_error(
            new,
            "Code modification: failed to modify instruction".into(),
        );
    }
    true
}

/// Structural diff of two same-length instructions. Everything must match
/// except constants confined to:
///  - a direct call's target displacement,
///  - a `mov` immediate source operand,
///  - a `mov` memory displacement.
///
/// None of those constants participate in the sandboxing idioms.
fn is_admissible_modification(old: &DecodedInst, new: &DecodedInst) -> bool {
    if old.code() != new.code() {
        return false;
    }
    let old_vec = old.exprs();
    let new_vec = new.exprs();
    if old_vec.len() != new_vec.len() {
        return false;
    }
    for i in 0..old_vec.len() {
        let old_node = old_vec.nodes()[i];
        let new_node = new_vec.nodes()[i];
        if old_node.flags != new_node.flags {
            return false;
        }
        match (old_node.kind, new_node.kind) {
            (ExprKind::Constant(a), ExprKind::Constant(b)) => {
                if a != b && !constant_diff_allowed(old, i) {
                    return false;
                }
            }
            (a, b) => {
                if a != b {
                    return false;
                }
            }
        }
    }
    true
}

fn constant_diff_allowed(old: &DecodedInst, index: usize) -> bool {
    let vec = old.exprs();
    let node = vec.nodes()[index];
    let Some(parent) = vec.parent_index(index) else {
        return false;
    };
    let parent_kind = vec.nodes()[parent].kind;

    // Direct call target.
    if old.mnemonic() == Mnemonic::Call
        && node.flags.contains(ExprFlags::JUMP_TARGET)
        && parent_kind == ExprKind::OperandRef
    {
        return true;
    }
    // mov immediate, e.g. `mov rax, 0xdeadbeef`.
    if old.mnemonic() == Mnemonic::Mov
        && node.flags.contains(ExprFlags::USED)
        && parent_kind == ExprKind::OperandRef
    {
        return true;
    }
    // mov memory displacement, e.g. `mov rax, [r15+rbx*1+0x7fff]`.
    if old.mnemonic() == Mnemonic::Mov
        && parent_kind == ExprKind::MemOffset
        && index == vec.mem_disp_index(parent)
    {
        return true;
    }
    false
}
