//! Module graph.
//!
//! The module provides:
//! - **Arena-based storage**: operations, values and blocks addressed by handle
//! - **Use lists**: derived index from each value to the operand slots reading it
//! - **Structural edits**: insert, move, erase, operand rewrites, RAUW
//! - **Loop accessors**: `ForView` over init args, iteration args, yield, results
//!
//! # Design Principles
//!
//! - **Operands are authoritative**: the use index is maintained by every
//!   mutator but can always be recomputed with `rebuild_uses`
//! - **Stable order**: `walk` and `loops` visit operations in block order,
//!   outer before inner, so every analysis over the module is deterministic

use std::fmt;

use smallvec::SmallVec;

use super::arena::{Arena, SecondaryMap};
use super::operation::{Block, BlockId, OpFlags, OpId, Operation, Use, Value, ValueDef, ValueId};
use super::ops::{OpKind, ResultTypes};
use super::types::Type;

/// Use list of one value.
pub type UseList = SmallVec<[Use; 4]>;

// =============================================================================
// Target Info
// =============================================================================

/// Launch configuration the module is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub num_warps: u32,
    pub threads_per_warp: u32,
}

impl TargetInfo {
    pub const fn new(num_warps: u32, threads_per_warp: u32) -> Self {
        Self {
            num_warps,
            threads_per_warp,
        }
    }

    /// Total threads in one program instance.
    #[inline]
    pub const fn threads_per_cta(&self) -> u32 {
        self.num_warps * self.threads_per_warp
    }
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self::new(4, 32)
    }
}

// =============================================================================
// Insertion Point
// =============================================================================

/// Where a new or moved operation is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpId),
    After(OpId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
}

// =============================================================================
// Module
// =============================================================================

/// A tensor IR module: one body block whose arguments are kernel parameters.
#[derive(Clone)]
pub struct Module {
    ops: Arena<Operation>,
    values: Arena<Value>,
    blocks: Arena<Block>,
    uses: SecondaryMap<Value, UseList>,
    body: BlockId,
    pub target: TargetInfo,
}

impl Module {
    /// Create an empty module.
    pub fn new(target: TargetInfo) -> Self {
        let mut blocks = Arena::new();
        let body = blocks.alloc(Block::default());
        Self {
            ops: Arena::with_capacity(64),
            values: Arena::with_capacity(64),
            blocks,
            uses: SecondaryMap::new(),
            body,
            target,
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Get the module body block.
    #[inline]
    pub fn body(&self) -> BlockId {
        self.body
    }

    #[inline]
    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id]
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    #[inline]
    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id].ty
    }

    /// Overwrite the type of a value in place.
    pub fn set_value_type(&mut self, id: ValueId, ty: Type) {
        self.values[id].ty = ty;
    }

    /// Number of operations ever created, erased ones included.
    #[inline]
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Get result `index` of `op`.
    #[inline]
    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op].results[index]
    }

    /// Get the types of an operation's operands.
    pub fn operand_types(&self, op: OpId) -> SmallVec<[&Type; 4]> {
        self.ops[op]
            .operands
            .iter()
            .map(|&v| &self.values[v].ty)
            .collect()
    }

    /// Get the types of an operation's results.
    pub fn result_types(&self, op: OpId) -> ResultTypes {
        self.ops[op]
            .results
            .iter()
            .map(|&v| self.values[v].ty.clone())
            .collect()
    }

    // =========================================================================
    // Use-Def Navigation
    // =========================================================================

    /// Get the operation defining a value, `None` for block arguments.
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value].def {
            ValueDef::Result { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Get the block a value is visible from: the block holding its defining
    /// op, or the block owning it as an argument.
    pub fn owning_block(&self, value: ValueId) -> BlockId {
        match self.values[value].def {
            ValueDef::Result { op, .. } => self.ops[op].parent,
            ValueDef::BlockArg { block, .. } => block,
        }
    }

    /// Get the operation owning a block as a region.
    #[inline]
    pub fn parent_op(&self, block: BlockId) -> Option<OpId> {
        self.blocks[block].parent_op
    }

    /// Get all operand slots reading a value.
    pub fn uses(&self, value: ValueId) -> &[Use] {
        self.uses
            .get(value)
            .map(|u| u.as_slice())
            .unwrap_or(&[])
    }

    /// Iterate over the operations reading a value, once per operand slot.
    pub fn users(&self, value: ValueId) -> impl Iterator<Item = OpId> + '_ {
        self.uses(value).iter().map(|u| u.user)
    }

    #[inline]
    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.uses(value).is_empty()
    }

    /// Position of an operation inside its block.
    pub fn position(&self, op: OpId) -> Option<usize> {
        let parent = self.ops[op].parent;
        self.blocks[parent].ops.iter().position(|&o| o == op)
    }

    /// If `value` is a loop iteration argument, get its loop and iter index.
    pub fn iteration_arg(&self, value: ValueId) -> Option<(OpId, usize)> {
        let ValueDef::BlockArg { block, index } = self.values[value].def else {
            return None;
        };
        let owner = self.blocks[block].parent_op?;
        if self.ops[owner].kind != OpKind::For || index == 0 {
            return None;
        }
        Some((owner, index as usize - 1))
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Create a detached block with the given argument types.
    pub fn add_block(&mut self, arg_types: &[Type]) -> BlockId {
        let block = self.blocks.alloc(Block::default());
        for ty in arg_types {
            self.add_block_arg(block, ty.clone());
        }
        block
    }

    /// Append an argument to a block.
    pub fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block].args.len() as u32;
        let value = self.values.alloc(Value {
            ty,
            def: ValueDef::BlockArg { block, index },
        });
        self.blocks[block].args.push(value);
        value
    }

    /// Attach a detached block as the next region of `op`.
    pub fn attach_region(&mut self, op: OpId, block: BlockId) {
        debug_assert!(self.blocks[block].parent_op.is_none());
        self.blocks[block].parent_op = Some(op);
        self.ops[op].regions.push(block);
    }

    // =========================================================================
    // Operation Creation
    // =========================================================================

    /// Create an operation with explicit result types.
    ///
    /// No inference is run; callers that need checked types go through
    /// `OpBuilder` or the layout cloner.
    pub fn create_op(
        &mut self,
        at: InsertPoint,
        kind: OpKind,
        operands: &[ValueId],
        result_types: ResultTypes,
    ) -> OpId {
        let (block, index) = self.resolve(at);
        let id = self.ops.alloc(Operation {
            kind,
            operands: operands.iter().copied().collect(),
            results: SmallVec::new(),
            regions: SmallVec::new(),
            parent: block,
            flags: OpFlags::empty(),
        });

        for (i, ty) in result_types.into_iter().enumerate() {
            let value = self.values.alloc(Value {
                ty,
                def: ValueDef::Result {
                    op: id,
                    index: i as u32,
                },
            });
            self.ops[id].results.push(value);
        }

        for (i, &operand) in operands.iter().enumerate() {
            self.add_use(
                operand,
                Use {
                    user: id,
                    operand: i as u32,
                },
            );
        }

        self.blocks[block].ops.insert(index, id);
        id
    }

    /// Resolve an insertion point to a block and index.
    fn resolve(&self, at: InsertPoint) -> (BlockId, usize) {
        match at {
            InsertPoint::Before(op) => {
                let parent = self.ops[op].parent;
                debug_assert!(!self.ops[op].is_erased());
                let pos = self.position(op).unwrap_or(self.blocks[parent].ops.len());
                (parent, pos)
            }
            InsertPoint::After(op) => {
                let parent = self.ops[op].parent;
                debug_assert!(!self.ops[op].is_erased());
                let pos = self
                    .position(op)
                    .map(|p| p + 1)
                    .unwrap_or(self.blocks[parent].ops.len());
                (parent, pos)
            }
            InsertPoint::BlockStart(block) => (block, 0),
            InsertPoint::BlockEnd(block) => (block, self.blocks[block].ops.len()),
        }
    }

    // =========================================================================
    // Use Index
    // =========================================================================

    fn add_use(&mut self, value: ValueId, u: Use) {
        self.uses.slot(value).push(u);
    }

    fn remove_use(&mut self, value: ValueId, u: Use) {
        let list = self.uses.slot(value);
        if let Some(pos) = list.iter().position(|&x| x == u) {
            list.remove(pos);
        }
    }

    /// Recompute the use index from operand lists.
    pub fn rebuild_uses(&mut self) {
        self.uses = self.compute_uses();
    }

    /// Get the maintained use index.
    pub fn use_index(&self) -> &SecondaryMap<Value, UseList> {
        &self.uses
    }

    /// Compute a fresh use index without touching the maintained one.
    pub fn compute_uses(&self) -> SecondaryMap<Value, UseList> {
        let mut uses: SecondaryMap<Value, UseList> = SecondaryMap::with_capacity(self.values.len());
        for op in self.walk() {
            for (i, &operand) in self.ops[op].operands.iter().enumerate() {
                uses.slot(operand).push(Use {
                    user: op,
                    operand: i as u32,
                });
            }
        }
        uses
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Replace operand `index` of `op`.
    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        let old = self.ops[op].operands[index];
        if old == value {
            return;
        }
        let u = Use {
            user: op,
            operand: index as u32,
        };
        self.remove_use(old, u);
        self.ops[op].operands[index] = value;
        self.add_use(value, u);
    }

    /// Redirect every use of `old` to `new`. Returns the number of rewrites.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) -> usize {
        self.replace_uses_where(old, new, |_| true)
    }

    /// Redirect the uses of `old` accepted by `pred` to `new`.
    pub fn replace_uses_where(
        &mut self,
        old: ValueId,
        new: ValueId,
        pred: impl Fn(Use) -> bool,
    ) -> usize {
        if old == new {
            return 0;
        }
        let targets: Vec<Use> = self.uses(old).iter().copied().filter(|&u| pred(u)).collect();
        for u in &targets {
            self.set_operand(u.user, u.operand as usize, new);
        }
        targets.len()
    }

    /// Move an operation to a new position.
    pub fn move_op(&mut self, op: OpId, at: InsertPoint) {
        let parent = self.ops[op].parent;
        if let Some(pos) = self.position(op) {
            self.blocks[parent].ops.remove(pos);
        }
        let (block, index) = self.resolve(at);
        self.ops[op].parent = block;
        self.blocks[block].ops.insert(index, op);
    }

    /// Unlink an operation and everything nested in its regions.
    ///
    /// Results must already be unused.
    pub fn erase_op(&mut self, op: OpId) {
        if self.ops[op].is_erased() {
            return;
        }
        debug_assert!(
            self.ops[op].results.iter().all(|&r| {
                self.uses(r)
                    .iter()
                    .all(|u| self.is_nested_in(u.user, op))
            }),
            "erasing {:?} with live uses",
            op
        );

        let regions = self.ops[op].regions.clone();
        for region in regions {
            let nested: Vec<OpId> = self.blocks[region].ops.iter().rev().copied().collect();
            for inner in nested {
                self.erase_op(inner);
            }
        }

        let operands = self.ops[op].operands.clone();
        for (i, operand) in operands.into_iter().enumerate() {
            self.remove_use(
                operand,
                Use {
                    user: op,
                    operand: i as u32,
                },
            );
        }

        let parent = self.ops[op].parent;
        if let Some(pos) = self.position(op) {
            self.blocks[parent].ops.remove(pos);
        }
        self.ops[op].flags.insert(OpFlags::ERASED);
    }

    /// Check if `op` is `ancestor` or nested inside one of its regions.
    pub fn is_nested_in(&self, op: OpId, ancestor: OpId) -> bool {
        let mut current = Some(op);
        while let Some(o) = current {
            if o == ancestor {
                return true;
            }
            current = self.blocks[self.ops[o].parent].parent_op;
        }
        false
    }

    /// Set flags on an operation.
    pub fn mark(&mut self, op: OpId, flags: OpFlags) {
        self.ops[op].flags.insert(flags);
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// All live operations in pre-order: block order, parents before regions.
    pub fn walk(&self) -> Vec<OpId> {
        let mut out = Vec::with_capacity(self.ops.len());
        self.walk_block(self.body, &mut out);
        out
    }

    fn walk_block(&self, block: BlockId, out: &mut Vec<OpId>) {
        for &op in &self.blocks[block].ops {
            out.push(op);
            for &region in &self.ops[op].regions {
                self.walk_block(region, out);
            }
        }
    }

    /// All loops in pre-order.
    pub fn loops(&self) -> Vec<OpId> {
        self.walk()
            .into_iter()
            .filter(|&op| self.ops[op].kind == OpKind::For)
            .collect()
    }

    /// View a `For` operation through its loop accessors.
    pub fn for_view(&self, op: OpId) -> Option<ForView<'_>> {
        let o = &self.ops[op];
        if o.kind != OpKind::For || o.regions.len() != 1 {
            return None;
        }
        Some(ForView { module: self, op })
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new(TargetInfo::default())
    }
}

// =============================================================================
// Loop View
// =============================================================================

/// Accessors for a `For` loop.
///
/// Operands are `[lower, upper, step, init...]`, the body block arguments are
/// `[induction, iter_args...]`, the body ends in a `Yield`, and the results
/// mirror the iteration arguments.
#[derive(Clone, Copy)]
pub struct ForView<'m> {
    module: &'m Module,
    op: OpId,
}

impl<'m> ForView<'m> {
    /// Number of leading non-carried operands (bounds and step).
    pub const NUM_CONTROL_OPERANDS: usize = 3;

    #[inline]
    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn body(&self) -> BlockId {
        self.module.op(self.op).regions[0]
    }

    pub fn init_args(&self) -> &'m [ValueId] {
        &self.module.op(self.op).operands[Self::NUM_CONTROL_OPERANDS..]
    }

    pub fn induction_var(&self) -> ValueId {
        self.module.block(self.body()).args[0]
    }

    pub fn iter_args(&self) -> &'m [ValueId] {
        &self.module.block(self.body()).args[1..]
    }

    /// Get the terminator of the body.
    pub fn yield_op(&self) -> Option<OpId> {
        let last = *self.module.block(self.body()).ops.last()?;
        (self.module.op(last).kind == OpKind::Yield).then_some(last)
    }

    /// Get the values yielded to the next iteration.
    pub fn yielded(&self) -> &'m [ValueId] {
        match self.yield_op() {
            Some(y) => &self.module.op(y).operands[..],
            None => &[],
        }
    }

    pub fn results(&self) -> &'m [ValueId] {
        &self.module.op(self.op).results
    }

    pub fn init_types(&self) -> Vec<&'m Type> {
        self.init_args()
            .iter()
            .map(|&v| self.module.value_type(v))
            .collect()
    }

    pub fn iter_arg_types(&self) -> Vec<&'m Type> {
        self.iter_args()
            .iter()
            .map(|&v| self.module.value_type(v))
            .collect()
    }

    pub fn yielded_types(&self) -> Vec<&'m Type> {
        self.yielded()
            .iter()
            .map(|&v| self.module.value_type(v))
            .collect()
    }

    pub fn result_types(&self) -> Vec<&'m Type> {
        self.results()
            .iter()
            .map(|&v| self.module.value_type(v))
            .collect()
    }

    /// Check the iteration-signature invariant:
    /// init types == iter-arg types == yielded types == result types.
    pub fn signature_consistent(&self) -> bool {
        let iter = self.iter_arg_types();
        self.init_types() == iter && self.yielded_types() == iter && self.result_types() == iter
    }
}

// =============================================================================
// Printing
// =============================================================================

impl Module {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: BlockId, depth: usize) -> fmt::Result {
        for &op in &self.blocks[block].ops {
            let o = &self.ops[op];
            write!(f, "{:indent$}", "", indent = depth * 2)?;
            if !o.results.is_empty() {
                for (i, r) in o.results.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "%{}", r.index())?;
                }
                write!(f, " = ")?;
            }
            write!(f, "{}", o.kind.name())?;
            for (i, operand) in o.operands.iter().enumerate() {
                write!(f, "{}%{}", if i == 0 { " " } else { ", " }, operand.index())?;
            }
            if let Some(r) = o.results.first() {
                write!(f, " : {}", self.values[*r].ty)?;
            }
            writeln!(f)?;
            for &region in &o.regions {
                write!(f, "{:indent$}^(", "", indent = depth * 2 + 2)?;
                for (i, arg) in self.blocks[region].args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "%{}: {}", arg.index(), self.values[*arg].ty)?;
                }
                writeln!(f, "):")?;
                self.fmt_block(f, region, depth + 2)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module (num_warps = {}):", self.target.num_warps)?;
        self.fmt_block(f, self.body, 1)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::encoding::Encoding;
    use crate::ir::ops::{ConstValue, ElementwiseOp};
    use crate::ir::types::{ElemType, ScalarType};

    fn f32_ty() -> Type {
        Type::tensor(
            &[128],
            ElemType::Scalar(ScalarType::F32),
            Encoding::blocked(&[1], &[32], &[4], &[0]),
        )
    }

    fn constant(m: &mut Module, at: InsertPoint) -> ValueId {
        let op = m.create_op(
            at,
            OpKind::Constant(ConstValue::float(1.0)),
            &[],
            ResultTypes::from_iter([f32_ty()]),
        );
        m.result(op, 0)
    }

    fn add(m: &mut Module, at: InsertPoint, a: ValueId, b: ValueId) -> OpId {
        m.create_op(
            at,
            OpKind::Elementwise(ElementwiseOp::Add),
            &[a, b],
            ResultTypes::from_iter([f32_ty()]),
        )
    }

    #[test]
    fn test_create_registers_uses() {
        let mut m = Module::default();
        let body = m.body();
        let c = constant(&mut m, InsertPoint::BlockEnd(body));
        let sum = add(&mut m, InsertPoint::BlockEnd(body), c, c);

        assert_eq!(m.uses(c).len(), 2);
        assert!(m.users(c).all(|u| u == sum));
        assert_eq!(m.defining_op(m.result(sum, 0)), Some(sum));
    }

    #[test]
    fn test_insert_points_order_ops() {
        let mut m = Module::default();
        let body = m.body();
        let c = constant(&mut m, InsertPoint::BlockEnd(body));
        let c_op = m.defining_op(c).unwrap();
        let last = add(&mut m, InsertPoint::BlockEnd(body), c, c);
        let middle = add(&mut m, InsertPoint::After(c_op), c, c);
        let head = constant(&mut m, InsertPoint::BlockStart(body));
        let first = m.defining_op(head).unwrap();

        assert_eq!(m.block(body).ops, vec![first, c_op, middle, last]);
        assert_eq!(m.walk(), vec![first, c_op, middle, last]);
    }

    #[test]
    fn test_replace_all_uses_and_erase() {
        let mut m = Module::default();
        let body = m.body();
        let a = constant(&mut m, InsertPoint::BlockEnd(body));
        let b = constant(&mut m, InsertPoint::BlockEnd(body));
        let sum = add(&mut m, InsertPoint::BlockEnd(body), a, a);

        assert_eq!(m.replace_all_uses_with(a, b), 2);
        assert!(!m.has_uses(a));
        assert_eq!(m.op(sum).operands.as_slice(), &[b, b]);

        let a_op = m.defining_op(a).unwrap();
        m.erase_op(a_op);
        assert!(m.op(a_op).is_erased());
        assert!(!m.walk().contains(&a_op));
    }

    #[test]
    fn test_rebuild_uses_matches_incremental_index() {
        let mut m = Module::default();
        let body = m.body();
        let a = constant(&mut m, InsertPoint::BlockEnd(body));
        let b = constant(&mut m, InsertPoint::BlockEnd(body));
        let sum = add(&mut m, InsertPoint::BlockEnd(body), a, b);
        m.set_operand(sum, 1, a);

        let incremental: Vec<Use> = m.uses(a).to_vec();
        m.rebuild_uses();
        assert_eq!(m.uses(a), incremental.as_slice());
        assert!(!m.has_uses(b));
    }

    #[test]
    fn test_move_op() {
        let mut m = Module::default();
        let body = m.body();
        let a = constant(&mut m, InsertPoint::BlockEnd(body));
        let b = constant(&mut m, InsertPoint::BlockEnd(body));
        let (a_op, b_op) = (m.defining_op(a).unwrap(), m.defining_op(b).unwrap());

        m.move_op(a_op, InsertPoint::After(b_op));
        assert_eq!(m.block(body).ops, vec![b_op, a_op]);
    }
}
