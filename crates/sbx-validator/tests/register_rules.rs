//! Sandbox base register and RSP/RBP protection.

mod common;

use common::*;
use sbx_validator::ValidatorConfig;
use sbx_x86::Register;

#[test]
fn base_register_is_never_writable() {
    // 49 89 C7 => mov r15, rax
    let state = validate(&bundle_pad(vec![0x49, 0x89, 0xC7]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Illegal to change the value of register R15"));
}

#[test]
fn base_register_32_bit_alias_is_protected() {
    // 41 89 C7 => mov r15d, eax
    let state = validate(&bundle_pad(vec![0x41, 0x89, 0xC7]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "changes the value of R15"));
}

#[test]
fn alternate_base_register_is_honoured() {
    // 49 89 C6 => mov r14, rax
    let code = bundle_pad(vec![0x49, 0x89, 0xC6]);
    let state = validate_with(&code, ValidatorConfig {
        base_register: Register::R14,
        ..ValidatorConfig::default()
    });
    assert!(!state.is_valid());
    // The same bytes are fine when R14 is just another register.
    let state = validate(&code);
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn stack_prologue_is_legal() {
    // 55        => push rbp
    // 48 89 E5  => mov rbp, rsp
    let state = validate(&bundle_pad(vec![0x55, 0x48, 0x89, 0xE5]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn pop_rbp_is_rejected() {
    // 5D => pop rbp loads an unsandboxed value; the restore idiom is
    // required instead.
    let state = validate(&bundle_pad(vec![0x5D]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Illegal change to register RBP"));
}

#[test]
fn arbitrary_rsp_write_is_rejected() {
    // 48 89 C4 => mov rsp, rax
    let state = validate(&bundle_pad(vec![0x48, 0x89, 0xC4]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Illegal assignment to RSP"));
}

#[test]
fn mov_rsp_rbp_is_legal() {
    // 48 89 EC => mov rsp, rbp
    let state = validate(&bundle_pad(vec![0x48, 0x89, 0xEC]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn stack_realignment_is_legal() {
    // 48 83 E4 F0 => and rsp, -16
    let state = validate(&bundle_pad(vec![0x48, 0x83, 0xE4, 0xF0]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
    // 48 83 E4 10 => and rsp, 16 masks the stack into the first 16 bytes
    let state = validate(&bundle_pad(vec![0x48, 0x83, 0xE4, 0x10]));
    assert!(!state.is_valid());
}

#[test]
fn esp_write_needs_a_completing_instruction() {
    // 89 CC => mov esp, ecx with nothing after it
    let state = validate(&bundle_pad(vec![0x89, 0xCC]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Illegal assignment to ESP"));
    assert!(!errors_at(&state, VBASE).is_empty());
}

#[test]
fn esp_write_completed_by_add_rbase_is_legal() {
    // 89 CC     => mov esp, ecx
    // 4C 01 FC  => add rsp, r15
    let state = validate(&bundle_pad(vec![0x89, 0xCC, 0x4C, 0x01, 0xFC]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn esp_write_completed_by_or_rbase_is_legal() {
    // 89 CC     => mov esp, ecx
    // 4C 09 FC  => or rsp, r15
    let state = validate(&bundle_pad(vec![0x89, 0xCC, 0x4C, 0x09, 0xFC]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn esp_adjustment_completed_by_lea_is_legal() {
    // 89 CC        => mov esp, ecx
    // 4A 8D 24 3C  => lea rsp, [rsp+r15*1]
    let state = validate(&bundle_pad(vec![0x89, 0xCC, 0x4A, 0x8D, 0x24, 0x3C]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn esp_const_adjust_then_add_rbase_is_legal() {
    // 83 EC 10  => sub esp, 16
    // 4C 01 FC  => add rsp, r15
    let state = validate(&bundle_pad(vec![0x83, 0xEC, 0x10, 0x4C, 0x01, 0xFC]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn completing_instruction_is_not_a_jump_target() {
    // The add of the esp-repair pair must not be directly reachable:
    // 89 CC     => mov esp, ecx        (offset 0)
    // 4C 01 FC  => add rsp, r15        (offset 2)
    // EB FB     => jmp back to the add (offset 5)
    let state = validate(&bundle_pad(vec![0x89, 0xCC, 0x4C, 0x01, 0xFC, 0xEB, 0xFB]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Bad jump target"));
}

#[test]
fn ebp_restore_idiom_is_legal() {
    // 89 C5           => mov ebp, eax
    // 4C 01 FD        => add rbp, r15
    let state = validate(&bundle_pad(vec![0x89, 0xC5, 0x4C, 0x01, 0xFD]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));

    // 89 C5              => mov ebp, eax
    // 4A 8D 6C 3D 00     => lea rbp, [rbp+r15*1]
    let state = validate(&bundle_pad(vec![0x89, 0xC5, 0x4A, 0x8D, 0x6C, 0x3D, 0x00]));
    assert!(state.is_valid(), "{:?}", error_messages(&state));
}

#[test]
fn arbitrary_rbp_write_is_rejected() {
    // 48 89 C5 => mov rbp, rax
    let state = validate(&bundle_pad(vec![0x48, 0x89, 0xC5]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Illegal change to register RBP"));

    // 89 C5 => mov ebp, eax with no completing instruction
    let state = validate(&bundle_pad(vec![0x89, 0xC5]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "Illegal assignment to EBP"));
}

#[test]
fn segment_register_writes_are_rejected() {
    // 8E D8 => mov ds, ax
    let state = validate(&bundle_pad(vec![0x8E, 0xD8]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "segment register"));
}

#[test]
fn narrow_stack_aliases_are_protected() {
    // 66 89 C4 => mov sp, ax
    let state = validate(&bundle_pad(vec![0x66, 0x89, 0xC4]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "changes the value of RSP"));

    // 40 88 C5 => mov bpl, al
    let state = validate(&bundle_pad(vec![0x40, 0x88, 0xC5]));
    assert!(!state.is_valid());
    assert!(has_error(&state, "changes the value of RBP"));
}
