//! x86-64 decoding adapter for the sandbox validator.
//!
//! The project uses `iced-x86` as the underlying decoder, but we keep a
//! wrapper API so the validator crates do not depend on `iced-x86` directly:
//! each decoded instruction is presented as an immutable [`DecodedInst`]
//! carrying a flattened, pre-order operand-expression tree ([`expr::ExprVec`])
//! that the safety analyses match on exhaustively.

#![forbid(unsafe_code)]

pub mod expr;
pub mod iter;
pub mod regs;

mod decoder;

pub use decoder::{decode_one, DecodeMode, DecodedInst, InstFlags, MAX_INST_LEN};
pub use iter::SegmentIter;

// Backend types that appear in the public API.
pub use iced_x86::{Code, CpuidFeature, Mnemonic, Register};
