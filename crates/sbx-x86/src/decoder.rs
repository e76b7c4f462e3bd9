//! Decoding of single instructions into the validator-facing model.

use iced_x86::{
    Code, CpuidFeature, Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfo,
    InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register,
};

use crate::expr::{ExprFlags, ExprKind, ExprNode, ExprVec};

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INST_LEN: usize = 15;

/// Decode mode of the code being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Bits32,
    Bits64,
}

impl DecodeMode {
    pub fn bitness(self) -> u32 {
        match self {
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }
}

bitflags::bitflags! {
    /// Instruction classification consumed by the analyses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstFlags: u8 {
        /// Unconditional or indirect jump.
        const JUMP = 1 << 0;
        /// Conditional branch.
        const COND_JUMP = 1 << 1;
        /// Near call (direct or indirect).
        const CALL = 1 << 2;
        /// The bytes did not decode to a defined instruction.
        const INVALID = 1 << 3;
    }
}

/// One decoded instruction, immutable once produced.
#[derive(Debug, Clone)]
pub struct DecodedInst {
    addr: u64,
    len: u8,
    bytes: [u8; MAX_INST_LEN],
    flags: InstFlags,
    exprs: ExprVec,
    inner: Instruction,
}

#[allow(clippy::len_without_is_empty)]
impl DecodedInst {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    /// Address of the byte after the instruction.
    pub fn end_addr(&self) -> u64 {
        self.addr + u64::from(self.len)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }

    pub fn code(&self) -> Code {
        self.inner.code()
    }

    pub fn flags(&self) -> InstFlags {
        self.flags
    }

    pub fn exprs(&self) -> &ExprVec {
        &self.exprs
    }

    pub fn is_valid(&self) -> bool {
        !self.flags.contains(InstFlags::INVALID)
    }

    /// True if the instruction transfers control (jump, conditional jump
    /// or call).
    pub fn is_branch(&self) -> bool {
        self.flags
            .intersects(InstFlags::JUMP | InstFlags::COND_JUMP | InstFlags::CALL)
    }

    /// CPUID feature sets the instruction requires.
    pub fn cpuid_features(&self) -> &'static [CpuidFeature] {
        self.inner.cpuid_features()
    }
}

impl core::fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:016x}: {:?} (", self.addr, self.mnemonic())?;
        for (i, b) in self.bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Decode one instruction at `ip` from the start of `bytes`.
///
/// Returns `None` only for an empty slice. Undecodable bytes yield an
/// instruction with [`InstFlags::INVALID`] spanning the consumed bytes
/// (at least one), so callers can report the problem and keep walking.
pub fn decode_one(mode: DecodeMode, ip: u64, bytes: &[u8]) -> Option<DecodedInst> {
    if bytes.is_empty() {
        return None;
    }
    let mut decoder = Decoder::with_ip(mode.bitness(), bytes, ip, DecoderOptions::NONE);
    let mut instr = Instruction::default();
    decoder.decode_out(&mut instr);

    let consumed = decoder.position().clamp(1, bytes.len().min(MAX_INST_LEN));
    let mut raw = [0u8; MAX_INST_LEN];
    raw[..consumed].copy_from_slice(&bytes[..consumed]);

    if instr.is_invalid() {
        return Some(DecodedInst {
            addr: ip,
            len: consumed as u8,
            bytes: raw,
            flags: InstFlags::INVALID,
            exprs: ExprVec::default(),
            inner: instr,
        });
    }

    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(&instr);
    let exprs = build_exprs(&instr, info);

    Some(DecodedInst {
        addr: ip,
        len: instr.len() as u8,
        bytes: raw,
        flags: classify(&instr),
        exprs,
        inner: instr,
    })
}

fn classify(instr: &Instruction) -> InstFlags {
    match instr.flow_control() {
        FlowControl::UnconditionalBranch | FlowControl::IndirectBranch => InstFlags::JUMP,
        FlowControl::ConditionalBranch => InstFlags::COND_JUMP,
        FlowControl::Call | FlowControl::IndirectCall => InstFlags::CALL,
        _ => InstFlags::empty(),
    }
}

fn op_access(info: &InstructionInfo, operand: u32) -> OpAccess {
    match operand {
        0 => info.op0_access(),
        1 => info.op1_access(),
        2 => info.op2_access(),
        3 => info.op3_access(),
        _ => info.op4_access(),
    }
}

fn access_flags(access: OpAccess) -> ExprFlags {
    match access {
        OpAccess::Read | OpAccess::CondRead => ExprFlags::USED,
        OpAccess::Write | OpAccess::CondWrite => ExprFlags::SET,
        OpAccess::ReadWrite | OpAccess::ReadCondWrite => ExprFlags::USED | ExprFlags::SET,
        _ => ExprFlags::empty(),
    }
}

fn reg_node(reg: Register, flags: ExprFlags) -> ExprNode {
    ExprNode::new(
        ExprKind::Register(reg),
        flags | ExprFlags::size_of_bytes(reg.size()),
    )
}

/// Address-size flag of a memory operand, derived from its address
/// registers (or the displacement width when there are none).
fn mem_addr_size(instr: &Instruction) -> ExprFlags {
    let base = instr.memory_base();
    if base != Register::None {
        return ExprFlags::size_of_bytes(base.size());
    }
    let index = instr.memory_index();
    if index != Register::None {
        return ExprFlags::size_of_bytes(index.size());
    }
    ExprFlags::size_of_bytes(instr.memory_displ_size() as usize)
}

fn push_mem_offset(exprs: &mut ExprVec, instr: &Instruction, flags: ExprFlags) {
    let addr_size = mem_addr_size(instr);
    // Children carry only the address-computation use, never the
    // operand's set flag (a memory write sets the memory, not its
    // address registers).
    let child_flags = if flags.intersects(ExprFlags::USED | ExprFlags::SET) {
        ExprFlags::USED
    } else {
        ExprFlags::empty()
    };
    exprs.push(ExprNode::new(ExprKind::MemOffset, flags | addr_size));

    let base = instr.memory_base();
    exprs.push(reg_node(base, child_flags));
    exprs.push(reg_node(instr.memory_index(), child_flags));
    exprs.push(ExprNode::new(
        ExprKind::Constant(u64::from(instr.memory_index_scale())),
        child_flags,
    ));
    let disp = if matches!(base, Register::RIP | Register::EIP) {
        // iced resolves IP-relative displacements to the absolute target;
        // store the raw encoded displacement instead.
        instr.memory_displacement64().wrapping_sub(instr.next_ip())
    } else {
        instr.memory_displacement64()
    };
    exprs.push(ExprNode::new(ExprKind::Constant(disp), child_flags));
}

fn push_segment_address(
    exprs: &mut ExprVec,
    seg: Register,
    addr_reg: Register,
    flags: ExprFlags,
) {
    let child_flags = if flags.intersects(ExprFlags::USED | ExprFlags::SET) {
        ExprFlags::USED
    } else {
        ExprFlags::empty()
    };
    exprs.push(ExprNode::new(
        ExprKind::SegmentAddress,
        flags | ExprFlags::size_of_bytes(addr_reg.size()),
    ));
    exprs.push(reg_node(seg, child_flags));
    exprs.push(reg_node(addr_reg, child_flags));
}

fn build_exprs(instr: &Instruction, info: &InstructionInfo) -> ExprVec {
    let mut exprs = ExprVec::default();
    let indirect_target = matches!(
        instr.flow_control(),
        FlowControl::IndirectBranch | FlowControl::IndirectCall
    );

    for i in 0..instr.op_count() {
        let mut flags = access_flags(op_access(info, i));
        let kind = instr.op_kind(i);
        let is_branch_op = matches!(
            kind,
            OpKind::NearBranch16
                | OpKind::NearBranch32
                | OpKind::NearBranch64
                | OpKind::FarBranch16
                | OpKind::FarBranch32
        );
        if is_branch_op || (indirect_target && i == 0) {
            flags |= ExprFlags::JUMP_TARGET;
        }

        exprs.push(ExprNode::new(ExprKind::OperandRef, flags));
        match kind {
            OpKind::Register => {
                exprs.push(reg_node(instr.op_register(i), flags));
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                let disp = instr.near_branch_target().wrapping_sub(instr.next_ip());
                let size = match kind {
                    OpKind::NearBranch16 => ExprFlags::SIZE_16,
                    OpKind::NearBranch32 => ExprFlags::SIZE_32,
                    _ => ExprFlags::SIZE_64,
                };
                exprs.push(ExprNode::new(
                    ExprKind::Constant(disp),
                    flags | ExprFlags::USED | size,
                ));
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                exprs.push(ExprNode::new(ExprKind::Undefined, flags | ExprFlags::USED));
            }
            OpKind::Immediate8 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(u64::from(instr.immediate8())),
                    flags | ExprFlags::SIZE_8,
                ));
            }
            OpKind::Immediate8_2nd => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(u64::from(instr.immediate8_2nd())),
                    flags | ExprFlags::SIZE_8,
                ));
            }
            OpKind::Immediate16 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(u64::from(instr.immediate16())),
                    flags | ExprFlags::SIZE_16,
                ));
            }
            OpKind::Immediate32 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(u64::from(instr.immediate32())),
                    flags | ExprFlags::SIZE_32,
                ));
            }
            OpKind::Immediate64 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(instr.immediate64()),
                    flags | ExprFlags::SIZE_64,
                ));
            }
            OpKind::Immediate8to16 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(instr.immediate8to16() as i64 as u64),
                    flags | ExprFlags::SIZE_16,
                ));
            }
            OpKind::Immediate8to32 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(instr.immediate8to32() as i64 as u64),
                    flags | ExprFlags::SIZE_32,
                ));
            }
            OpKind::Immediate8to64 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(instr.immediate8to64() as u64),
                    flags | ExprFlags::SIZE_64,
                ));
            }
            OpKind::Immediate32to64 => {
                exprs.push(ExprNode::new(
                    ExprKind::Constant(instr.immediate32to64() as u64),
                    flags | ExprFlags::SIZE_64,
                ));
            }
            OpKind::Memory => {
                push_mem_offset(&mut exprs, instr, flags);
            }
            OpKind::MemorySegSI => {
                push_segment_address(&mut exprs, instr.memory_segment(), Register::SI, flags);
            }
            OpKind::MemorySegESI => {
                push_segment_address(&mut exprs, instr.memory_segment(), Register::ESI, flags);
            }
            OpKind::MemorySegRSI => {
                push_segment_address(&mut exprs, instr.memory_segment(), Register::RSI, flags);
            }
            OpKind::MemorySegDI => {
                push_segment_address(&mut exprs, instr.memory_segment(), Register::DI, flags);
            }
            OpKind::MemorySegEDI => {
                push_segment_address(&mut exprs, instr.memory_segment(), Register::EDI, flags);
            }
            OpKind::MemorySegRDI => {
                push_segment_address(&mut exprs, instr.memory_segment(), Register::RDI, flags);
            }
            OpKind::MemoryESDI => {
                push_segment_address(&mut exprs, Register::ES, Register::DI, flags);
            }
            OpKind::MemoryESEDI => {
                push_segment_address(&mut exprs, Register::ES, Register::EDI, flags);
            }
            OpKind::MemoryESRDI => {
                push_segment_address(&mut exprs, Register::ES, Register::RDI, flags);
            }
            _ => {
                exprs.push(ExprNode::new(ExprKind::Undefined, flags));
            }
        }
    }

    append_implicit_writes(&mut exprs, info);
    exprs
}

/// Registers the instruction writes without naming them as operands
/// (`PUSH`/`POP`/`CALL` adjusting the stack pointer, string instructions
/// stepping their address registers, `LEAVE`/`ENTER`, ...). These must be
/// visible to the register-protection analysis.
fn append_implicit_writes(exprs: &mut ExprVec, info: &InstructionInfo) {
    let explicit_sets: Vec<Register> = exprs
        .nodes()
        .iter()
        .filter(|n| n.is_register_set())
        .map(|n| n.register())
        .collect();

    // A write to a 32-bit register is reported widened to its 64-bit
    // parent (the zero-extension); an explicit set of any alias already
    // covers it.
    let covered = |reg: Register| {
        explicit_sets
            .iter()
            .any(|&r| r == reg || (r.is_gpr() && reg.is_gpr() && r.full_register() == reg.full_register()))
    };

    for used in info.used_registers() {
        let access = used.access();
        let is_write = matches!(
            access,
            OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
        );
        if !is_write {
            continue;
        }
        let reg = used.register();
        if matches!(reg, Register::RIP | Register::EIP) {
            continue;
        }
        if covered(reg) {
            continue;
        }
        let mut flags = ExprFlags::SET | ExprFlags::IMPLICIT;
        if matches!(access, OpAccess::ReadWrite | OpAccess::ReadCondWrite) {
            flags |= ExprFlags::USED;
        }
        exprs.push(reg_node(reg, flags));
    }
}
