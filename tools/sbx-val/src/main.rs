//! Command-line validator: check a flat x86-64 code image against the
//! sandbox rules and print every violation.

#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;

use sbx_validator::report::stderr_reporter;
use sbx_validator::{
    apply_stub_edits, validate_segment, validate_segment_pair, ValidatorConfig, ValidatorState,
};

#[derive(Debug, Parser)]
#[command(about = "Validate a flat x86-64 code image against the sandbox rules")]
struct Args {
    /// Code image to validate (raw bytes, already laid out for the load
    /// address).
    code: PathBuf,

    /// Load address of the image (hex with 0x prefix, or decimal).
    #[arg(long, default_value = "0", value_parser = parse_addr)]
    base: u64,

    /// Bundle (alignment granule) size in bytes.
    #[arg(long, default_value_t = 32)]
    bundle: u8,

    /// Validate `code` as a replacement for this previously validated
    /// image of identical size.
    #[arg(long)]
    old: Option<PathBuf>,

    /// Per-instruction jump diagnostics (slower second pass).
    #[arg(long)]
    detailed: bool,

    /// Rewrite rejected instructions with HLT and write the result next to
    /// the input instead of failing.
    #[arg(long)]
    stub_out: bool,

    /// Stop reporting after this many errors (negative reports all).
    #[arg(long, default_value_t = sbx_validator::DEFAULT_MAX_REPORTED_ERRORS)]
    max_errors: i32,

    /// Print a mnemonic histogram after validation.
    #[arg(long)]
    histogram: bool,

    /// Trace every visited instruction.
    #[arg(long)]
    trace: bool,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn run(args: &Args) -> Result<bool> {
    let mut code = fs::read(&args.code)
        .with_context(|| format!("reading {}", args.code.display()))?;
    if code.is_empty() {
        bail!("{} is empty", args.code.display());
    }

    let config = ValidatorConfig {
        bundle_size: args.bundle,
        detailed_jumps: args.detailed,
        stub_out: args.stub_out,
        max_reported_errors: args.max_errors,
        opcode_histogram: args.histogram,
        trace_instructions: args.trace,
        ..ValidatorConfig::default()
    };
    let mut state = ValidatorState::new(args.base, code.len() as u64, config)
        .context("creating validator state")?;
    state.set_reporter(Box::new(stderr_reporter()));

    match &args.old {
        Some(old_path) => {
            let old = fs::read(old_path)
                .with_context(|| format!("reading {}", old_path.display()))?;
            if old.len() != code.len() {
                bail!(
                    "replacement images must have identical sizes ({} vs {} bytes)",
                    old.len(),
                    code.len()
                );
            }
            validate_segment_pair(&old, &code, &mut state);
        }
        None => validate_segment(&code, &mut state),
    }

    if args.stub_out && state.did_stub_out() {
        apply_stub_edits(&mut code, state.stub_edits());
        let out = args.code.with_extension("stubbed");
        fs::write(&out, &code).with_context(|| format!("writing {}", out.display()))?;
        eprintln!(
            "{} instruction(s) stubbed out; patched image written to {}",
            state.stub_edits().len(),
            out.display()
        );
    }

    Ok(state.is_valid())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(true) => {
            eprintln!("{}: valid", args.code.display());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("{}: NOT valid", args.code.display());
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("sbx-val: {err:#}");
            ExitCode::FAILURE
        }
    }
}
