//! Validator configuration and per-run state.

use sbx_x86::{DecodeMode, DecodedInst, Register};
use thiserror::Error;

use crate::cpu_checks::CpuFeatures;
use crate::histogram::OpcodeHistogram;
use crate::jumps::JumpSets;
use crate::legality::{BaselineLegality, LegalityChecker};
use crate::protect_base::BaseRegisterLocals;
use crate::report::{Diagnostic, ErrorReporter, NullReporter, Severity};

/// x86 HLT opcode; rejected instructions are overwritten with it when
/// stubbing out.
pub const STUB_OPCODE: u8 = 0xF4;

/// Default error budget: stop printing after this many errors.
pub const DEFAULT_MAX_REPORTED_ERRORS: i32 = 100;

/// Per-run configuration, fixed at state creation.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Decode mode of the sandboxed code.
    pub mode: DecodeMode,
    /// Alignment granule for jump targets and entry points (16 or 32).
    pub bundle_size: u8,
    /// The reserved register anchoring the untrusted address space.
    pub base_register: Register,
    /// CPU features the host supports; instructions needing anything else
    /// are stubbed out with a warning.
    pub cpu_features: CpuFeatures,
    /// The text being validated cannot be rewritten; squashing an
    /// unsupported instruction becomes an error instead.
    pub readonly_text: bool,
    /// Maximum errors to report: negative reports all, zero is silent,
    /// positive stops reporting after that many. Never affects the verdict.
    pub max_reported_errors: i32,
    /// Check memory reads as well as writes.
    pub read_sandbox: bool,
    /// Accept `0xff` as the indirect-jump mask (mask-pattern testing only).
    pub identity_mask: bool,
    /// Use the slower per-instruction second pass for jump diagnostics.
    pub detailed_jumps: bool,
    /// Record stub edits for every rejected instruction instead of failing
    /// the run.
    pub stub_out: bool,
    /// Report every visited instruction through the reporter.
    pub trace_instructions: bool,
    /// Collect and report a mnemonic histogram.
    pub opcode_histogram: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            mode: DecodeMode::Bits64,
            bundle_size: 32,
            base_register: Register::R15,
            cpu_features: CpuFeatures::all(),
            readonly_text: false,
            max_reported_errors: DEFAULT_MAX_REPORTED_ERRORS,
            read_sandbox: true,
            identity_mask: false,
            detailed_jumps: false,
            stub_out: false,
            trace_instructions: false,
            opcode_histogram: false,
        }
    }
}

/// Errors constructing a [`ValidatorState`]. Safety violations are never
/// errors at this level; they are diagnostics on the run.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("code segment is empty")]
    EmptySegment,
    #[error("segment end overflows the address space (base {vbase:#x}, size {size:#x})")]
    AddressOverflow { vbase: u64, size: u64 },
    #[error("bundle size {0} is not 16 or 32")]
    BadBundleSize(u8),
    #[error("{0:?} cannot anchor the sandbox (need a 64-bit general-purpose register)")]
    BadBaseRegister(Register),
    #[error("out of memory allocating jump target sets")]
    OutOfMemory,
}

/// One pending byte-range overwrite produced by stub-out mode. Applying the
/// edits to the code buffer is the caller's responsibility (see
/// [`apply_stub_edits`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubEdit {
    /// Byte offset of the instruction within the validated segment.
    pub offset: usize,
    /// Instruction length in bytes.
    pub len: usize,
}

/// Overwrite every edited range with the HLT opcode.
pub fn apply_stub_edits(code: &mut [u8], edits: &[StubEdit]) {
    for edit in edits {
        let len = code.len();
        let end = edit.offset.saturating_add(edit.len).min(len);
        for b in &mut code[edit.offset.min(len)..end] {
            *b = STUB_OPCODE;
        }
    }
}

/// The aggregate context of one validation run. Owned by exactly one run;
/// concurrent validations each need their own state.
pub struct ValidatorState {
    config: ValidatorConfig,
    vbase: u64,
    codesize: u64,
    bundle_mask: u64,
    validates_ok: bool,
    did_stub_out: bool,
    errors_remaining: i32,
    inst_count: u64,
    cur_inst_unchanged: bool,
    diagnostics: Vec<Diagnostic>,
    stub_edits: Vec<StubEdit>,
    reporter: Box<dyn ErrorReporter>,
    legality: Box<dyn LegalityChecker>,
    pub(crate) jump_sets: JumpSets,
    pub(crate) base_locals: BaseRegisterLocals,
    pub(crate) cpu_reported: CpuFeatures,
    pub(crate) histogram: OpcodeHistogram,
}

impl ValidatorState {
    /// Create the state for validating `codesize` bytes mapped at `vbase`.
    pub fn new(vbase: u64, codesize: u64, config: ValidatorConfig) -> Result<Self, CreateError> {
        if codesize == 0 {
            return Err(CreateError::EmptySegment);
        }
        if vbase.checked_add(codesize).is_none() {
            return Err(CreateError::AddressOverflow {
                vbase,
                size: codesize,
            });
        }
        if !matches!(config.bundle_size, 16 | 32) {
            return Err(CreateError::BadBundleSize(config.bundle_size));
        }
        let base = config.base_register;
        if !base.is_gpr64() || matches!(base, Register::RSP | Register::RBP) {
            return Err(CreateError::BadBaseRegister(base));
        }
        let jump_sets = JumpSets::new(codesize).map_err(|_| CreateError::OutOfMemory)?;
        // Stub-out implies a silent run; rerun without it for diagnostics.
        let errors_remaining = if config.stub_out {
            0
        } else {
            config.max_reported_errors
        };
        Ok(Self {
            bundle_mask: u64::from(config.bundle_size) - 1,
            config,
            vbase,
            codesize,
            validates_ok: true,
            did_stub_out: false,
            errors_remaining,
            inst_count: 0,
            cur_inst_unchanged: false,
            diagnostics: Vec::new(),
            stub_edits: Vec::new(),
            reporter: Box::new(NullReporter),
            legality: Box::new(BaselineLegality),
            jump_sets,
            base_locals: BaseRegisterLocals::default(),
            cpu_reported: CpuFeatures::empty(),
            histogram: OpcodeHistogram::default(),
        })
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn ErrorReporter>) {
        self.reporter = reporter;
    }

    pub fn set_legality_checker(&mut self, checker: Box<dyn LegalityChecker>) {
        self.legality = checker;
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn mode(&self) -> DecodeMode {
        self.config.mode
    }

    pub fn vbase(&self) -> u64 {
        self.vbase
    }

    pub fn codesize(&self) -> u64 {
        self.codesize
    }

    /// First address past the validated range.
    pub fn vlimit(&self) -> u64 {
        self.vbase + self.codesize
    }

    pub fn bundle_mask(&self) -> u64 {
        self.bundle_mask
    }

    /// Expected immediate of the masking `AND` in the indirect-jump idiom,
    /// sign-extended the way the decoder extends `imm8` operands.
    pub fn jump_mask(&self) -> u64 {
        if self.config.identity_mask {
            !0
        } else {
            !self.bundle_mask
        }
    }

    /// The sole contract callers may rely on.
    pub fn is_valid(&self) -> bool {
        self.validates_ok
    }

    /// True once any instruction was queued for stubbing.
    pub fn did_stub_out(&self) -> bool {
        self.did_stub_out
    }

    /// Every diagnostic the run produced, in order, independent of the
    /// error budget (which only gates the reporter).
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn stub_edits(&self) -> &[StubEdit] {
        &self.stub_edits
    }

    pub fn instructions_seen(&self) -> u64 {
        self.inst_count
    }

    pub(crate) fn set_codesize(&mut self, codesize: u64) {
        debug_assert!(codesize <= self.codesize);
        self.codesize = codesize;
    }

    pub(crate) fn note_instruction(&mut self) {
        self.inst_count += 1;
    }

    pub(crate) fn cur_inst_unchanged(&self) -> bool {
        self.cur_inst_unchanged
    }

    pub(crate) fn set_cur_inst_unchanged(&mut self, unchanged: bool) {
        self.cur_inst_unchanged = unchanged;
    }

    /// True once the run is known invalid and the error budget is spent;
    /// the driver then stops invoking analyses (but finishes the walk).
    pub(crate) fn quit(&self) -> bool {
        !self.validates_ok && self.errors_remaining == 0
    }

    pub(crate) fn check_legality(&self, inst: &DecodedInst) -> Result<(), String> {
        self.legality.check(inst)
    }

    /// Report a trace line. Goes only to the reporter, never into the
    /// diagnostic record.
    pub(crate) fn trace(&mut self, message: String) {
        self.reporter.report(&Diagnostic {
            severity: Severity::Info,
            addr: None,
            message,
        });
    }

    /// Record a diagnostic. Errors mark the run invalid (except in stub-out
    /// mode) regardless of whether the budget lets them print.
    pub(crate) fn message(&mut self, severity: Severity, addr: Option<u64>, message: String) {
        if severity >= Severity::Error && !self.config.stub_out {
            self.validates_ok = false;
        }
        let diag = Diagnostic {
            severity,
            addr,
            message,
        };
        if self.errors_remaining != 0 {
            self.reporter.report(&diag);
            if severity >= Severity::Error && self.errors_remaining > 0 {
                self.errors_remaining -= 1;
                if self.errors_remaining == 0 {
                    self.reporter.report(&Diagnostic {
                        severity: Severity::Info,
                        addr: None,
                        message: "Error limit reached, remaining reports muted".into(),
                    });
                }
            }
        }
        self.diagnostics.push(diag);
    }

    /// Error attributed to a specific instruction; stubs it out when
    /// configured to.
    pub(crate) fn inst_error(&mut self, inst: &DecodedInst, message: String) {
        self.error_at(inst.addr(), inst.len(), message);
    }

    /// Error attributed to an instruction recorded earlier as
    /// `(address, length)` (deferred reports).
    pub(crate) fn error_at(&mut self, addr: u64, len: u8, message: String) {
        self.message(Severity::Error, Some(addr), message);
        if self.config.stub_out {
            self.push_stub_edit(addr, len);
        }
    }

    pub(crate) fn push_stub_edit(&mut self, addr: u64, len: u8) {
        debug_assert!(addr >= self.vbase);
        self.stub_edits.push(StubEdit {
            offset: (addr - self.vbase) as usize,
            len: usize::from(len),
        });
        self.did_stub_out = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_configurations() {
        assert!(matches!(
            ValidatorState::new(0, 0, ValidatorConfig::default()),
            Err(CreateError::EmptySegment)
        ));
        assert!(matches!(
            ValidatorState::new(u64::MAX, 32, ValidatorConfig::default()),
            Err(CreateError::AddressOverflow { .. })
        ));
        let config = ValidatorConfig {
            bundle_size: 24,
            ..ValidatorConfig::default()
        };
        assert!(matches!(
            ValidatorState::new(0, 32, config),
            Err(CreateError::BadBundleSize(24))
        ));
        let config = ValidatorConfig {
            base_register: Register::RSP,
            ..ValidatorConfig::default()
        };
        assert!(matches!(
            ValidatorState::new(0, 32, config),
            Err(CreateError::BadBaseRegister(Register::RSP))
        ));
    }

    #[test]
    fn error_budget_mutes_reports_but_not_verdict() {
        let config = ValidatorConfig {
            max_reported_errors: 1,
            ..ValidatorConfig::default()
        };
        let mut state = ValidatorState::new(0, 32, config).unwrap();
        state.message(Severity::Error, Some(0), "first".into());
        state.message(Severity::Error, Some(1), "second".into());
        assert!(!state.is_valid());
        assert!(state.quit());
        // Both errors are still on record.
        assert_eq!(
            state
                .diagnostics()
                .iter()
                .filter(|d| d.severity == Severity::Error)
                .count(),
            2
        );
    }

    #[test]
    fn jump_mask_matches_bundle_size() {
        let state = ValidatorState::new(0, 64, ValidatorConfig::default()).unwrap();
        assert_eq!(state.jump_mask(), 0xFFFF_FFFF_FFFF_FFE0);
        let config = ValidatorConfig {
            identity_mask: true,
            ..ValidatorConfig::default()
        };
        let state = ValidatorState::new(0, 64, config).unwrap();
        assert_eq!(state.jump_mask(), u64::MAX);
    }

    #[test]
    fn stub_edits_overwrite_with_hlt() {
        let mut code = [0x90u8; 8];
        apply_stub_edits(&mut code, &[StubEdit { offset: 2, len: 3 }]);
        assert_eq!(code, [0x90, 0x90, 0xF4, 0xF4, 0xF4, 0x90, 0x90, 0x90]);
    }
}
