//! Operation, value and block records.
//!
//! Ownership follows SSA: an operation owns its result values, a block owns
//! its arguments, and operand lists only reference values by handle. Each
//! region is a single block owned by its parent operation.

use smallvec::SmallVec;

use super::arena::Id;
use super::ops::OpKind;
use super::types::Type;

/// Handle of an operation.
pub type OpId = Id<Operation>;

/// Handle of an SSA value.
pub type ValueId = Id<Value>;

/// Handle of a block.
pub type BlockId = Id<Block>;

/// Operand list. Most operations take at most four operands.
pub type OperandList = SmallVec<[ValueId; 4]>;

// =============================================================================
// Value
// =============================================================================

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDef {
    /// Result `index` of `op`.
    Result { op: OpId, index: u32 },
    /// Argument `index` of `block`.
    BlockArg { block: BlockId, index: u32 },
}

/// An SSA value.
#[derive(Debug, Clone)]
pub struct Value {
    pub ty: Type,
    pub def: ValueDef,
}

/// One operand slot that reads a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: OpId,
    pub operand: u32,
}

// =============================================================================
// Operation
// =============================================================================

/// An operation in a block.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub operands: OperandList,
    pub results: SmallVec<[ValueId; 2]>,
    /// One block per region.
    pub regions: SmallVec<[BlockId; 1]>,
    /// Block containing this operation.
    pub parent: BlockId,
    pub flags: OpFlags,
}

impl Operation {
    /// Get the single result, if the op has exactly one.
    pub fn result(&self) -> Option<ValueId> {
        match self.results.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    #[inline]
    pub fn is_erased(&self) -> bool {
        self.flags.contains(OpFlags::ERASED)
    }
}

// =============================================================================
// Block
// =============================================================================

/// A straight-line sequence of operations with block arguments.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub args: SmallVec<[ValueId; 4]>,
    pub ops: Vec<OpId>,
    /// Operation owning this block as a region, `None` for the module body.
    pub parent_op: Option<OpId>,
}

// =============================================================================
// Operation Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags for operation properties.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// Operation has been erased and unlinked from its block.
        const ERASED = 0b0000_0001;
        /// Operation was created by rematerializing another one.
        const REMATERIALIZED = 0b0000_0010;
        /// Conversion was moved out of a loop body.
        const HOISTED = 0b0000_0100;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn op_with_results(n: u32) -> Operation {
        Operation {
            kind: OpKind::Splat,
            operands: OperandList::new(),
            results: (0..n).map(ValueId::new).collect(),
            regions: SmallVec::new(),
            parent: BlockId::new(0),
            flags: OpFlags::empty(),
        }
    }

    #[test]
    fn test_single_result() {
        assert_eq!(op_with_results(1).result(), Some(ValueId::new(0)));
        assert_eq!(op_with_results(0).result(), None);
        assert_eq!(op_with_results(2).result(), None);
    }

    #[test]
    fn test_flags() {
        let mut op = op_with_results(1);
        assert!(!op.is_erased());

        op.flags.insert(OpFlags::ERASED | OpFlags::REMATERIALIZED);
        assert!(op.is_erased());
        assert!(op.flags.contains(OpFlags::REMATERIALIZED));
        assert!(!op.flags.contains(OpFlags::HOISTED));
    }
}
