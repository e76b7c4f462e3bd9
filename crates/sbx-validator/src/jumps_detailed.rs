//! Per-instruction jump diagnostics (second pass).
//!
//! Functionally equivalent to the set reconciliation in [`crate::jumps`],
//! but walks the instructions again so every error is attributed to the
//! instruction that caused it. Checking that no instruction crosses a
//! bundle boundary subsumes the aligned-entry scan: if instructions tile
//! the segment and never straddle a boundary, every boundary is an
//! instruction start.

use sbx_x86::expr::{ExprFlags, ExprKind};
use sbx_x86::{DecodedInst, SegmentIter};

use crate::report::Severity;
use crate::state::ValidatorState;

pub(crate) fn summarize(state: &mut ValidatorState, code: &[u8]) {
    if state.quit() {
        return;
    }
    state.message(
        Severity::Info,
        None,
        format!(
            "Checking block alignment and jump targets: {:x} to {:x}",
            state.vbase(),
            state.vlimit()
        ),
    );
    if state.vbase() & state.bundle_mask() != 0 {
        state.message(
            Severity::Error,
            Some(state.vbase()),
            "Code segment starts at misaligned address".into(),
        );
    }

    let mut iter = SegmentIter::new(code, state.vbase(), state.mode());
    while iter.advance() {
        inst_layout_check(state, iter.cur());
    }
}

fn inst_layout_check(state: &mut ValidatorState, inst: &DecodedInst) {
    let start = inst.addr();

    // An instruction opening a basic block must not sit inside an idiom.
    if start & state.bundle_mask() == 0 {
        let offset = start - state.vbase();
        if state.jump_sets.removed_targets.contains(offset) {
            state.inst_error(
                inst,
                "Instruction begins basic block, but in middle of pattern".into(),
            );
        }
    }

    for addr in start + 1..inst.end_addr() {
        if addr & state.bundle_mask() == 0 {
            state.inst_error(inst, "Instruction crosses basic block alignment".into());
        }
    }

    if !inst.is_branch() {
        return;
    }
    for &node in inst.exprs().nodes() {
        if !node.flags.contains(ExprFlags::JUMP_TARGET) {
            continue;
        }
        let ExprKind::Constant(disp) = node.kind else {
            continue;
        };
        let target = inst.end_addr().wrapping_add(disp);
        if target < state.vbase() || target >= state.vlimit() {
            // Out-of-range targets were judged in the first pass.
            continue;
        }
        let offset = target - state.vbase();
        if state.jump_sets.possible_targets.contains(offset) {
            if state.jump_sets.removed_targets.contains(offset) {
                state.inst_error(inst, "Jumps into middle of pattern".into());
            }
        } else {
            state.inst_error(inst, "Doesn't jump to instruction address".into());
        }
    }
}
