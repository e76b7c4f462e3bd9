// Shared test helpers (integration tests compile as separate crates, so put
// common code in a submodule to avoid it becoming its own test target).
#![allow(dead_code)]

use sbx_validator::report::{Diagnostic, Severity};
use sbx_validator::{validate_segment, validate_segment_pair, ValidatorConfig, ValidatorState};

/// Load address used by all tests; bundle-aligned.
pub const VBASE: u64 = 0x10000;

pub const BUNDLE: usize = 32;

/// Pad a code fragment to the next bundle boundary with NOPs.
pub fn bundle_pad(mut code: Vec<u8>) -> Vec<u8> {
    while code.len() % BUNDLE != 0 {
        code.push(0x90);
    }
    code
}

pub fn validate_with(code: &[u8], config: ValidatorConfig) -> ValidatorState {
    let mut state =
        ValidatorState::new(VBASE, code.len() as u64, config).expect("validator state");
    validate_segment(code, &mut state);
    state
}

pub fn validate(code: &[u8]) -> ValidatorState {
    validate_with(code, ValidatorConfig::default())
}

pub fn validate_pair(old: &[u8], new: &[u8]) -> ValidatorState {
    let mut state = ValidatorState::new(VBASE, new.len() as u64, ValidatorConfig::default())
        .expect("validator state");
    validate_segment_pair(old, new, &mut state);
    state
}

pub fn error_messages(state: &ValidatorState) -> Vec<&str> {
    state
        .diagnostics()
        .iter()
        .filter(|d| d.severity >= Severity::Error)
        .map(|d| d.message.as_str())
        .collect()
}

pub fn has_error(state: &ValidatorState, needle: &str) -> bool {
    error_messages(state).iter().any(|m| m.contains(needle))
}

pub fn errors_at(state: &ValidatorState, addr: u64) -> Vec<&Diagnostic> {
    state
        .diagnostics()
        .iter()
        .filter(|d| d.severity >= Severity::Error && d.addr == Some(addr))
        .collect()
}
