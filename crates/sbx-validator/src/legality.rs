//! Hook for the host's opcode-legality table.
//!
//! Which opcodes the sandbox admits is decided by an external table, not by
//! this crate; the driver only guarantees the table is consulted once per
//! instruction, before the safety analyses run.

use sbx_x86::DecodedInst;

/// Per-instruction legality decision. `Err` carries the reason reported to
/// the diagnostics stream.
pub trait LegalityChecker {
    fn check(&self, inst: &DecodedInst) -> Result<(), String>;
}

/// Default checker: rejects only what no table could admit — byte sequences
/// that do not decode to a defined instruction.
#[derive(Debug, Default)]
pub struct BaselineLegality;

impl LegalityChecker for BaselineLegality {
    fn check(&self, inst: &DecodedInst) -> Result<(), String> {
        if inst.is_valid() {
            Ok(())
        } else {
            Err("Opcode sequence doesn't define a valid x86 instruction".into())
        }
    }
}
