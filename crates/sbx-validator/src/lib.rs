//! Static software-fault-isolation validator for x86-64 sandbox code.
//!
//! Given a block of machine code destined to run inside an untrusted
//! sandbox, the validator proves (or rejects) that it cannot escape its
//! memory region, divert control flow to an unaligned or mid-idiom
//! address, or corrupt the protected sandbox registers. It is the last
//! line of defense before untrusted native code runs, so everything not
//! provably safe is rejected.
//!
//! The usual sequence:
//!
//! ```
//! use sbx_validator::{validate_segment, ValidatorConfig, ValidatorState};
//!
//! let code = [0x90u8; 31].iter().chain(&[0xF4u8]).copied().collect::<Vec<_>>();
//! let mut state = ValidatorState::new(0x10000, code.len() as u64, ValidatorConfig::default())
//!     .expect("config");
//! validate_segment(&code, &mut state);
//! assert!(state.is_valid());
//! ```
//!
//! Replacement validation ([`validate_segment_pair`]) checks a candidate
//! patch against the already-validated bytes it overwrites, admitting only
//! constant changes that cannot affect the sandboxing idioms.
//!
//! Decoding is delegated to the `sbx-x86` adapter (re-exported as
//! [`x86`]); which opcodes are admissible at all is the host's
//! [`LegalityChecker`] table.

#![forbid(unsafe_code)]

pub mod address_set;
pub mod report;

mod cpu_checks;
mod driver;
mod halt_trim;
mod histogram;
mod jumps;
mod jumps_detailed;
mod legality;
mod memory_protect;
mod patterns;
mod protect_base;
mod state;

pub use cpu_checks::CpuFeatures;
pub use driver::{validate_segment, validate_segment_pair};
pub use halt_trim::halt_trim_size;
pub use legality::{BaselineLegality, LegalityChecker};
pub use state::{
    apply_stub_edits, CreateError, StubEdit, ValidatorConfig, ValidatorState,
    DEFAULT_MAX_REPORTED_ERRORS, STUB_OPCODE,
};

pub use sbx_x86 as x86;
