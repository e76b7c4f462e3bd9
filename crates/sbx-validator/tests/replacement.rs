//! Replacement validation: a candidate patch against the already-validated
//! bytes it overwrites.

mod common;

use common::*;

// 89 DB; 49 8B 84 1F disp32 => mov ebx, ebx; mov rax, [r15+rbx*1+disp32]
fn indexed_load(disp: u32) -> Vec<u8> {
    let mut code = vec![0x89, 0xDB, 0x49, 0x8B, 0x84, 0x1F];
    code.extend(disp.to_le_bytes());
    bundle_pad(code)
}

#[test]
fn identical_code_always_passes() {
    let code = indexed_load(0x1000);
    let state = validate_pair(&code, &code);
    assert!(state.is_valid(), "{:?}", error_messages(&state));
    assert!(!error_messages(&state)
        .iter()
        .any(|m| m.contains("Code modification")));
}

#[test]
fn mov_displacement_may_change() {
    let old = indexed_load(0x1000);
    let new = indexed_load(0x2000);
    let state = validate_pair(&old, &new);
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn mov_immediate_may_change() {
    // 48 C7 C0 imm32 => mov rax, imm32
    let old = bundle_pad(vec![0x48, 0xC7, 0xC0, 0xEF, 0xBE, 0xAD, 0xDE]);
    let new = bundle_pad(vec![0x48, 0xC7, 0xC0, 0x0D, 0xF0, 0xDF, 0xCA]);
    let state = validate_pair(&old, &new);
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn call_target_may_change() {
    // 90 x27, E8 disp32, 90 x32, 90 x32: the call return stays aligned and
    // both targets are bundle starts.
    let make = |target_off: u32| {
        let mut code = vec![0x90u8; 27];
        code.push(0xE8);
        code.extend((target_off - 32).to_le_bytes());
        code.extend(vec![0x90u8; 64]);
        code
    };
    let old = make(32);
    let new = make(64);
    let state = validate_pair(&old, &new);
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn changing_the_instruction_is_rejected() {
    // 90 => nop vs 50 => push rax: same length, different instruction
    let old = bundle_pad(vec![0x90]);
    let new = bundle_pad(vec![0x50]);
    let state = validate_pair(&old, &new);
    assert!(!state.is_valid());
    assert!(has_error(&state, "failed to modify instruction"));
}

#[test]
fn changing_a_masking_constant_is_rejected() {
    // The and-mask of the indirect-jump idiom is not a modifiable
    // constant: relaxing it would widen the jump set.
    let old = bundle_pad(vec![
        0x83, 0xE0, 0xE0, 0x4C, 0x01, 0xF8, 0xFF, 0xE0,
    ]);
    let mut new = old.clone();
    new[2] = 0xF0;
    let state = validate_pair(&old, &new);
    assert!(!state.is_valid());
}

#[test]
fn diverging_instruction_boundaries_are_rejected() {
    // 89 C0 x16 => sixteen 2-byte movs vs thirty-two 1-byte nops
    let mut old = Vec::new();
    for _ in 0..16 {
        old.extend([0x89, 0xC0]);
    }
    let new = vec![0x90u8; 32];
    let state = validate_pair(&old, &new);
    assert!(!state.is_valid());
    assert!(has_error(&state, "Code modification"));
}

#[test]
fn unchanged_instruction_keeps_out_of_range_target() {
    // EB DD => jmp -35 (out of range, unaligned): rejected in a fresh
    // segment but admitted when byte-identical during replacement.
    let code = bundle_pad(vec![0xEB, 0xDD]);
    let state = validate(&code);
    assert!(!state.is_valid());
    let state = validate_pair(&code, &code);
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn size_mismatch_is_rejected() {
    let old = bundle_pad(vec![0x90]);
    let new = vec![0x90u8; 64];
    let state = validate_pair(&old, &new);
    assert!(!state.is_valid());
    assert!(has_error(&state, "different sizes"));
}
