//! Flattened operand-expression trees.
//!
//! Every decoded instruction carries a pre-order vector of [`ExprNode`]s, one
//! subtree per operand. The layout is fixed: an [`ExprKind::OperandRef`] root
//! is followed by its value node; a memory offset owns exactly four leaf
//! children (base, index, scale, displacement) and a segment address exactly
//! two (segment register, address register). Analyses therefore never walk
//! variable-shape trees; they use the named accessors on [`ExprVec`].

use bitflags::bitflags;
use iced_x86::Register;

bitflags! {
    /// Flags attached to a single expression node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExprFlags: u16 {
        /// The node's value is read by the instruction.
        const USED = 1 << 0;
        /// The node's value is written by the instruction.
        const SET = 1 << 1;
        /// The node is a branch-target operand.
        const JUMP_TARGET = 1 << 2;
        /// The node describes an implicit operand (not encoded in the
        /// instruction bytes).
        const IMPLICIT = 1 << 3;
        const SIZE_8 = 1 << 4;
        const SIZE_16 = 1 << 5;
        const SIZE_32 = 1 << 6;
        const SIZE_64 = 1 << 7;
    }
}

impl ExprFlags {
    /// Size flag for a width in bytes (0 for widths we do not track).
    pub fn size_of_bytes(bytes: usize) -> Self {
        match bytes {
            1 => Self::SIZE_8,
            2 => Self::SIZE_16,
            4 => Self::SIZE_32,
            8 => Self::SIZE_64,
            _ => Self::empty(),
        }
    }
}

/// Kind (and payload) of one expression node.
///
/// The node set is closed; analyses match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprKind {
    /// Root of one operand subtree.
    OperandRef,
    /// A register leaf. `Register::None` stands for an absent register
    /// (e.g. a memory offset without an index).
    Register(Register),
    /// A constant leaf, sign-extended to 64 bits where narrower.
    ///
    /// For direct branches this is the signed displacement relative to the
    /// end of the instruction, not the absolute target.
    Constant(u64),
    /// `[base + index*scale + disp]`. Children: base register, index
    /// register, scale constant, displacement constant.
    MemOffset,
    /// `seg:[reg]` as used by the string instructions. Children: segment
    /// register, address register.
    SegmentAddress,
    /// An operand shape this adapter does not model (far pointers etc.).
    Undefined,
}

/// One node of the flattened tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub flags: ExprFlags,
}

impl ExprNode {
    pub fn new(kind: ExprKind, flags: ExprFlags) -> Self {
        Self { kind, flags }
    }

    /// The register of a `Register` node, `Register::None` otherwise.
    pub fn register(&self) -> Register {
        match self.kind {
            ExprKind::Register(r) => r,
            _ => Register::None,
        }
    }

    /// The value of a `Constant` node.
    pub fn constant(&self) -> Option<u64> {
        match self.kind {
            ExprKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_register_set(&self) -> bool {
        matches!(self.kind, ExprKind::Register(_)) && self.flags.contains(ExprFlags::SET)
    }
}

/// The flattened, pre-order operand-expression vector of one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExprVec {
    nodes: Vec<ExprNode>,
}

impl ExprVec {
    pub(crate) fn push(&mut self, node: ExprNode) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[ExprNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ExprNode> {
        self.nodes.get(index)
    }

    /// Number of nodes occupied by the subtree rooted at `index`.
    pub fn subtree_width(&self, index: usize) -> usize {
        match self.nodes[index].kind {
            ExprKind::OperandRef => 1 + self.subtree_width(index + 1),
            ExprKind::MemOffset => 5,
            ExprKind::SegmentAddress => 3,
            _ => 1,
        }
    }

    /// Index of the root value node of the `n`th operand (0-based), skipping
    /// over the `OperandRef` wrapper.
    pub fn operand_value_index(&self, n: usize) -> Option<usize> {
        let mut seen = 0;
        let mut i = 0;
        while i < self.nodes.len() {
            if self.nodes[i].kind == ExprKind::OperandRef {
                if seen == n {
                    return Some(i + 1);
                }
                seen += 1;
            }
            i += self.subtree_width(i);
        }
        None
    }

    /// Number of operands (i.e. `OperandRef` roots).
    pub fn operand_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.kind == ExprKind::OperandRef)
            .count()
    }

    /// Index of the parent node of `index`, if any. Implicit operand nodes
    /// and operand roots have no parent.
    pub fn parent_index(&self, index: usize) -> Option<usize> {
        let mut i = 0;
        while i < self.nodes.len() {
            let width = self.subtree_width(i);
            if index > i && index < i + width {
                // `index` is inside this subtree; descend one level.
                let mut child = i + 1;
                while child < i + width {
                    if index == child {
                        return Some(i);
                    }
                    let child_width = self.subtree_width(child);
                    if index < child + child_width {
                        break;
                    }
                    child += child_width;
                }
                i = child;
            } else {
                i += width;
            }
        }
        None
    }

    // Named accessors for the fixed memory-offset layout.

    pub fn mem_base(&self, mem: usize) -> Register {
        debug_assert_eq!(self.nodes[mem].kind, ExprKind::MemOffset);
        self.nodes[mem + 1].register()
    }

    pub fn mem_index_index(&self, mem: usize) -> usize {
        mem + 2
    }

    pub fn mem_index(&self, mem: usize) -> Register {
        debug_assert_eq!(self.nodes[mem].kind, ExprKind::MemOffset);
        self.nodes[mem + 2].register()
    }

    pub fn mem_scale(&self, mem: usize) -> Option<u64> {
        debug_assert_eq!(self.nodes[mem].kind, ExprKind::MemOffset);
        self.nodes[mem + 3].constant()
    }

    pub fn mem_disp_index(&self, mem: usize) -> usize {
        mem + 4
    }

    pub fn mem_disp(&self, mem: usize) -> Option<u64> {
        debug_assert_eq!(self.nodes[mem].kind, ExprKind::MemOffset);
        self.nodes[mem + 4].constant()
    }

    // Named accessors for the fixed segment-address layout.

    pub fn seg_segment(&self, seg: usize) -> Register {
        debug_assert_eq!(self.nodes[seg].kind, ExprKind::SegmentAddress);
        self.nodes[seg + 1].register()
    }

    pub fn seg_addr_reg(&self, seg: usize) -> Register {
        debug_assert_eq!(self.nodes[seg].kind, ExprKind::SegmentAddress);
        self.nodes[seg + 2].register()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(r: Register, flags: ExprFlags) -> ExprNode {
        ExprNode::new(ExprKind::Register(r), flags)
    }

    #[test]
    fn operand_value_index_skips_subtrees() {
        // mov rax, [rbx+rcx*1+8]: opref/reg, opref/memoffset{base,index,scale,disp}
        let mut v = ExprVec::default();
        v.push(ExprNode::new(ExprKind::OperandRef, ExprFlags::SET));
        v.push(reg(Register::RAX, ExprFlags::SET | ExprFlags::SIZE_64));
        v.push(ExprNode::new(ExprKind::OperandRef, ExprFlags::USED));
        v.push(ExprNode::new(
            ExprKind::MemOffset,
            ExprFlags::USED | ExprFlags::SIZE_64,
        ));
        v.push(reg(Register::RBX, ExprFlags::USED));
        v.push(reg(Register::RCX, ExprFlags::USED));
        v.push(ExprNode::new(ExprKind::Constant(1), ExprFlags::USED));
        v.push(ExprNode::new(ExprKind::Constant(8), ExprFlags::USED));

        assert_eq!(v.operand_value_index(0), Some(1));
        assert_eq!(v.operand_value_index(1), Some(3));
        assert_eq!(v.operand_value_index(2), None);
        assert_eq!(v.operand_count(), 2);

        assert_eq!(v.mem_base(3), Register::RBX);
        assert_eq!(v.mem_index(3), Register::RCX);
        assert_eq!(v.mem_scale(3), Some(1));
        assert_eq!(v.mem_disp(3), Some(8));
        assert_eq!(v.mem_disp_index(3), 7);
    }

    #[test]
    fn parent_index_descends_into_mem_offsets() {
        let mut v = ExprVec::default();
        v.push(ExprNode::new(ExprKind::OperandRef, ExprFlags::USED));
        v.push(ExprNode::new(
            ExprKind::MemOffset,
            ExprFlags::USED | ExprFlags::SIZE_64,
        ));
        v.push(reg(Register::R15, ExprFlags::USED));
        v.push(reg(Register::None, ExprFlags::USED));
        v.push(ExprNode::new(ExprKind::Constant(1), ExprFlags::USED));
        v.push(ExprNode::new(ExprKind::Constant(0), ExprFlags::USED));

        assert_eq!(v.parent_index(0), None);
        assert_eq!(v.parent_index(1), Some(0));
        assert_eq!(v.parent_index(2), Some(1));
        assert_eq!(v.parent_index(5), Some(1));
    }
}
