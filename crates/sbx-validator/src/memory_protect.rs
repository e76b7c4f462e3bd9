//! Memory-operand legality.
//!
//! Every load and store must address memory as `[base + index*scale + d32]`
//! where `base` is one of {sandbox base, RSP, RBP, RIP} and any index
//! register had its upper half cleared by the immediately preceding
//! instruction. String instructions reference memory through a segment
//! prefix instead; their address register must have been produced by the
//! `mov r32, r32` + `lea r64, [rbase+r64*1]` pair. Matched idioms span
//! several instructions, and every instruction of a pattern except the
//! first is removed from the legal jump targets.

use sbx_x86::expr::{ExprFlags, ExprKind, ExprNode};
use sbx_x86::{regs, Mnemonic, Register, SegmentIter};

use crate::jumps::mark_target_illegal;
use crate::patterns;
use crate::state::ValidatorState;

/// A node worth sandbox-checking: a set, or a use when read sandboxing is
/// on.
fn is_possible_sandboxing_node(state: &ValidatorState, node: &ExprNode) -> bool {
    (state.config().read_sandbox && node.flags.contains(ExprFlags::USED))
        || node.flags.contains(ExprFlags::SET)
}

pub(crate) fn validate_inst(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    let vec = inst.exprs();

    // Instructions matched by patterns reaching behind the current one.
    let mut pattern_length: usize = 0;
    let mut number_memory_refs: usize = 0;
    let mut number_segment_addresses: usize = 0;
    // First segment address register seen, so a paired reference through
    // the same register (movs-style) validates once.
    let mut previous_seg_addr = Register::None;

    for i in 0..vec.len() {
        if state.quit() {
            break;
        }
        let node = vec.nodes()[i];
        if !is_possible_sandboxing_node(state, &node) {
            continue;
        }

        if let Some(extra) = match_valid_mem_offset(state, iter, 0, i, false, true) {
            number_memory_refs += 1;
            pattern_length += extra;
            continue;
        }

        if node.kind == ExprKind::SegmentAddress {
            if !node.flags.contains(ExprFlags::SIZE_64) {
                state.inst_error(inst, "Assignment to non-64 bit segment address".into());
                continue;
            }
            let seg = vec.seg_segment(i);
            // Only segments that act as null prefixes in 64-bit mode.
            if matches!(
                seg,
                Register::CS | Register::DS | Register::ES | Register::SS
            ) {
                let addr_reg = vec.seg_addr_reg(i);
                if addr_reg != Register::None {
                    if previous_seg_addr == Register::None {
                        previous_seg_addr = addr_reg;
                    } else if addr_reg == previous_seg_addr {
                        // Covered by the pattern already matched for the
                        // first reference.
                        continue;
                    }
                    if match_lea_safe_address(state, iter, pattern_length + 1, addr_reg) {
                        number_memory_refs += 1;
                        number_segment_addresses += 1;
                        pattern_length += 2;
                        continue;
                    }
                }
            }
            state.inst_error(inst, "Segment memory reference not allowed".into());
            continue;
        }

        let unknown_register =
            matches!(node.kind, ExprKind::Register(r) if r == Register::None);
        if node.kind == ExprKind::Undefined || unknown_register {
            // A memory offset's index register is optional; its
            // placeholder is legal. Anything else is a shape we do not
            // understand, so reject it.
            let placeholder = vec.parent_index(i).is_some_and(|p| {
                vec.nodes()[p].kind == ExprKind::MemOffset && i == vec.mem_index_index(p)
            });
            if !placeholder {
                state.inst_error(
                    inst,
                    "Memory reference not understood, can't verify correctness".into(),
                );
            }
        }
    }

    // Several references in one instruction are only admitted for the
    // paired segment-address case (movs and friends).
    if number_memory_refs > 1 && number_segment_addresses != number_memory_refs {
        state.inst_error(
            inst,
            "Multiple memory references not allowed in this context".into(),
        );
    }

    if pattern_length > 0 {
        mark_instructions_jump_range_illegal(state, iter, pattern_length);
    }
}

/// Check the memory offset at `node_index` of the instruction `distance`
/// back from the current one. Returns the number of *additional*
/// instructions the match consumed (the zero-extension of an index
/// register), or `None` when the offset is not compliant.
///
/// With `use_mov_for_zero_ext` the index register's zero-extension must be
/// the identity `mov r32, r32`; this is the stricter form used behind
/// string instructions.
fn match_valid_mem_offset(
    state: &mut ValidatorState,
    iter: &SegmentIter<'_>,
    distance: usize,
    node_index: usize,
    use_mov_for_zero_ext: bool,
    print_messages: bool,
) -> Option<usize> {
    let inst = iter.lookback(distance)?;
    let vec = inst.exprs();
    let node = vec.get(node_index)?;
    if node.kind != ExprKind::MemOffset {
        return None;
    }
    if !node.flags.contains(ExprFlags::SIZE_64) {
        if print_messages {
            state.inst_error(inst, "Assignment to non-64 bit memory address".into());
        }
        return None;
    }

    let base_reg = vec.mem_base(node_index);
    let base_ok = base_reg == state.config().base_register
        || matches!(base_reg, Register::RSP | Register::RBP | Register::RIP);
    if !base_ok {
        if print_messages {
            let message = if base_reg == Register::None {
                "No base register specified in memory offset"
            } else {
                "Invalid base register in memory offset"
            };
            state.inst_error(inst, message.into());
        }
        return None;
    }

    let mut extra = 0;
    let index_reg = vec.mem_index(node_index);
    if index_reg != Register::None {
        let index_node = vec.nodes()[vec.mem_index_index(node_index)];
        let mut index_reg_is_good = false;
        if base_reg != Register::RIP && index_node.flags.contains(ExprFlags::SIZE_64) {
            if let Some(prev) = iter.lookback(distance + 1) {
                index_reg_is_good = if use_mov_for_zero_ext {
                    regs::gpr32_for_gpr64(index_reg)
                        .is_some_and(|r32| patterns::is_mov32_using_reg(prev, r32))
                } else {
                    patterns::assigns_register_with_zero_extends64(prev, index_reg)
                };
            }
        }
        if index_reg_is_good {
            extra = 1;
        } else {
            if print_messages {
                state.inst_error(inst, "Invalid index register in memory offset".into());
            }
            return None;
        }
    } else if use_mov_for_zero_ext && print_messages {
        // The stricter form requires an index register.
        state.inst_error(inst, "Invalid index register in memory offset".into());
        return None;
    }

    // Scale cannot exceed 8 and is meaningless without an index; only the
    // displacement needs to be a compile-time constant.
    if vec.mem_disp(node_index).is_none() {
        if print_messages {
            state.inst_error(inst, "Invalid displacement in memory offset".into());
        }
        return None;
    }

    Some(extra)
}

/// The instruction `distance` back is `lea reg64, [...]` whose address is
/// itself a compliant memory offset with the identity-mov zero-extension
/// one instruction earlier. This is how string-instruction address
/// registers are derived.
fn match_lea_safe_address(
    state: &mut ValidatorState,
    iter: &SegmentIter<'_>,
    distance: usize,
    reg64: Register,
) -> bool {
    let Some(inst) = iter.lookback(distance) else {
        return false;
    };
    if inst.mnemonic() != Mnemonic::Lea {
        return false;
    }
    if patterns::operand_register(inst, 0) != Some(reg64) {
        return false;
    }
    let Some(mem) = inst.exprs().operand_value_index(1) else {
        return false;
    };
    if inst.exprs().get(mem).map(|n| n.kind) != Some(ExprKind::MemOffset) {
        return false;
    }
    match_valid_mem_offset(state, iter, distance, mem, true, false).is_some()
}

/// Remove the current instruction and the `distance - 1` before it from
/// the legal jump targets, so control can only enter a matched pattern at
/// its first instruction.
fn mark_instructions_jump_range_illegal(
    state: &mut ValidatorState,
    iter: &SegmentIter<'_>,
    distance: usize,
) {
    for back in 0..distance {
        if let Some(inst) = iter.lookback(back) {
            let addr = inst.addr();
            mark_target_illegal(state, addr);
        }
    }
}
