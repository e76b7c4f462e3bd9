//! Diagnostics and error reporting.
//!
//! Safety violations are data, not `Err`s: each one becomes a [`Diagnostic`]
//! recorded on the validator state and, subject to the error budget, handed
//! to the configured [`ErrorReporter`]. The boolean verdict is the only
//! contract callers may rely on; the diagnostic stream is advisory.

use std::io::{self, Write};

/// Severity of one diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Internal invariant break. Never produced for attacker-controlled
    /// input; reserved for reporter parity.
    Fatal,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Info => "",
            Self::Warning => "WARNING: ",
            Self::Error => "ERROR: ",
            Self::Fatal => "FATAL: ",
        }
    }
}

/// One validator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Address the message refers to, when tied to an instruction or
    /// target address.
    pub addr: Option<u64>,
    pub message: String,
}

/// Sink for diagnostics as they are produced.
pub trait ErrorReporter {
    fn report(&mut self, diag: &Diagnostic);
}

/// Discards everything (the default).
#[derive(Debug, Default)]
pub struct NullReporter;

impl ErrorReporter for NullReporter {
    fn report(&mut self, _diag: &Diagnostic) {}
}

/// Writes one line per diagnostic to any `io::Write`.
#[derive(Debug)]
pub struct WriteReporter<W: Write> {
    out: W,
}

impl<W: Write> WriteReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ErrorReporter for WriteReporter<W> {
    fn report(&mut self, diag: &Diagnostic) {
        // Reporting is best effort; a broken pipe must not abort validation.
        let _ = match diag.addr {
            Some(addr) => writeln!(
                self.out,
                "VALIDATOR: {}{addr:x}: {}",
                diag.severity.label(),
                diag.message
            ),
            None => writeln!(
                self.out,
                "VALIDATOR: {}{}",
                diag.severity.label(),
                diag.message
            ),
        };
    }
}

/// Convenience reporter for tools: line-buffered standard error.
pub fn stderr_reporter() -> WriteReporter<io::Stderr> {
    WriteReporter::new(io::stderr())
}
