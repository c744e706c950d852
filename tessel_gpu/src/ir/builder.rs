//! Operation builder.
//!
//! `OpBuilder` wraps a module and an insertion point. Every constructor runs
//! type/encoding inference before creating the operation, so a module built
//! exclusively through the builder is type-sound by construction.

use super::encoding::Encoding;
use super::module::{InsertPoint, Module};
use super::operation::{OpId, ValueId};
use super::ops::{ConstValue, ElementwiseOp, InferError, InferResult, OpKind, ReduceKind};
use super::types::{ElemType, ScalarType, Type};

// =============================================================================
// Op Builder
// =============================================================================

/// Construction context for one insertion point.
pub struct OpBuilder<'m> {
    module: &'m mut Module,
    ip: InsertPoint,
}

impl<'m> OpBuilder<'m> {
    pub fn new(module: &'m mut Module, ip: InsertPoint) -> Self {
        OpBuilder { module, ip }
    }

    /// Builder appending to the module body.
    pub fn at_body_end(module: &'m mut Module) -> Self {
        let body = module.body();
        OpBuilder::new(module, InsertPoint::BlockEnd(body))
    }

    #[inline]
    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    #[inline]
    pub fn insertion_point(&self) -> InsertPoint {
        self.ip
    }

    pub fn set_insertion_point(&mut self, ip: InsertPoint) {
        self.ip = ip;
    }

    /// Append a kernel parameter to the module body.
    pub fn param(&mut self, ty: Type) -> ValueId {
        let body = self.module.body();
        self.module.add_block_arg(body, ty)
    }

    // =========================================================================
    // Generic Construction
    // =========================================================================

    /// Infer result types and create the op at the insertion point.
    ///
    /// Anchored insertion points advance past the new op so that successive
    /// builds appear in program order.
    pub fn build(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        declared: &[Type],
    ) -> InferResult<OpId> {
        let result_types = {
            let types: Vec<&Type> = operands
                .iter()
                .map(|&v| self.module.value_type(v))
                .collect();
            kind.infer_result_types(&types, declared)?
        };
        let op = self.module.create_op(self.ip, kind, operands, result_types);
        match self.ip {
            InsertPoint::After(_) | InsertPoint::BlockStart(_) => {
                self.ip = InsertPoint::After(op);
            }
            InsertPoint::Before(_) | InsertPoint::BlockEnd(_) => {}
        }
        Ok(op)
    }

    fn build_value(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        declared: &[Type],
    ) -> InferResult<ValueId> {
        let op = self.build(kind, operands, declared)?;
        Ok(self.module.result(op, 0))
    }

    fn operand_type(&self, v: ValueId) -> &Type {
        self.module.value_type(v)
    }

    // =========================================================================
    // Layout Sources
    // =========================================================================

    /// Splat constant of type `ty` (scalar or tensor).
    pub fn constant(&mut self, value: ConstValue, ty: Type) -> InferResult<ValueId> {
        self.build_value(OpKind::Constant(value), &[], &[ty])
    }

    /// Scalar i32 constant.
    pub fn const_i32(&mut self, value: i64) -> InferResult<ValueId> {
        self.constant(ConstValue::Int(value), Type::scalar(ScalarType::I32))
    }

    /// `[start, end)` as an i32 tensor in `encoding`.
    pub fn make_range(&mut self, start: i32, end: i32, encoding: Encoding) -> InferResult<ValueId> {
        let ty = Type::tensor(
            &[i64::from(end) - i64::from(start)],
            ElemType::Scalar(ScalarType::I32),
            encoding,
        );
        self.build_value(OpKind::MakeRange { start, end }, &[], &[ty])
    }

    /// Broadcast a scalar into a tensor of `shape` in `encoding`.
    pub fn splat(&mut self, scalar: ValueId, shape: &[i64], encoding: Encoding) -> InferResult<ValueId> {
        let elem = self.operand_type(scalar).elem();
        let ty = Type::tensor(shape, elem, encoding);
        self.build_value(OpKind::Splat, &[scalar], &[ty])
    }

    // =========================================================================
    // Elementwise
    // =========================================================================

    pub fn elementwise(&mut self, op: ElementwiseOp, operands: &[ValueId]) -> InferResult<ValueId> {
        self.build_value(OpKind::Elementwise(op), operands, &[])
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> InferResult<ValueId> {
        self.elementwise(ElementwiseOp::Add, &[lhs, rhs])
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> InferResult<ValueId> {
        self.elementwise(ElementwiseOp::Mul, &[lhs, rhs])
    }

    pub fn cmp_lt(&mut self, lhs: ValueId, rhs: ValueId) -> InferResult<ValueId> {
        self.elementwise(ElementwiseOp::CmpLt, &[lhs, rhs])
    }

    pub fn select(&mut self, cond: ValueId, a: ValueId, b: ValueId) -> InferResult<ValueId> {
        self.elementwise(ElementwiseOp::Select, &[cond, a, b])
    }

    pub fn cast(&mut self, value: ValueId, to: ScalarType) -> InferResult<ValueId> {
        self.elementwise(ElementwiseOp::Cast(to), &[value])
    }

    pub fn add_ptr(&mut self, ptr: ValueId, offset: ValueId) -> InferResult<ValueId> {
        self.build_value(OpKind::AddPtr, &[ptr, offset], &[])
    }

    // =========================================================================
    // Shape Manipulation
    // =========================================================================

    pub fn broadcast(&mut self, src: ValueId, shape: &[i64]) -> InferResult<ValueId> {
        let declared = self.shaped_like(src, shape)?;
        self.build_value(OpKind::Broadcast, &[src], &[declared])
    }

    pub fn expand_dims(&mut self, src: ValueId, axis: u32) -> InferResult<ValueId> {
        self.build_value(OpKind::ExpandDims { axis }, &[src], &[])
    }

    pub fn reduce(&mut self, src: ValueId, axis: u32, combine: ReduceKind) -> InferResult<ValueId> {
        self.build_value(OpKind::Reduce { axis, combine }, &[src], &[])
    }

    pub fn view(&mut self, src: ValueId, shape: &[i64]) -> InferResult<ValueId> {
        let declared = self.shaped_like(src, shape)?;
        self.build_value(OpKind::View, &[src], &[declared])
    }

    pub fn cat(&mut self, lhs: ValueId, rhs: ValueId, shape: &[i64]) -> InferResult<ValueId> {
        let declared = self.shaped_like(lhs, shape)?;
        self.build_value(OpKind::Cat, &[lhs, rhs], &[declared])
    }

    fn shaped_like(&self, src: ValueId, shape: &[i64]) -> InferResult<Type> {
        let src_ty = self
            .operand_type(src)
            .as_tensor()
            .ok_or(InferError::ExpectedTensor {
                op: "reshape",
                index: 0,
            })?;
        Ok(Type::tensor(shape, src_ty.elem, src_ty.encoding.clone()))
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub fn load(
        &mut self,
        ptr: ValueId,
        mask: Option<ValueId>,
        other: Option<ValueId>,
    ) -> InferResult<ValueId> {
        let operands: Vec<ValueId> = std::iter::once(ptr).chain(mask).chain(other).collect();
        self.build_value(OpKind::Load, &operands, &[])
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId, mask: Option<ValueId>) -> InferResult<OpId> {
        let operands: Vec<ValueId> = [ptr, value].into_iter().chain(mask).collect();
        self.build(OpKind::Store, &operands, &[])
    }

    pub fn atomic_rmw(&mut self, ptr: ValueId, value: ValueId) -> InferResult<ValueId> {
        self.build_value(OpKind::AtomicRmw, &[ptr, value], &[])
    }

    // =========================================================================
    // Compute
    // =========================================================================

    pub fn dot(&mut self, a: ValueId, b: ValueId, acc: ValueId) -> InferResult<ValueId> {
        self.build_value(OpKind::Dot, &[a, b, acc], &[])
    }

    /// Explicit layout conversion of `src` to `encoding`.
    pub fn convert(&mut self, src: ValueId, encoding: Encoding) -> InferResult<ValueId> {
        let declared = self.operand_type(src).with_encoding(encoding);
        self.build_value(OpKind::ConvertLayout, &[src], &[declared])
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Build `for iv = lb to ub step s iter_args(inits)`.
    ///
    /// `body` receives a builder at the end of the loop body, the induction
    /// variable and the iteration arguments, and returns the yielded values.
    pub fn build_for<F>(
        &mut self,
        lb: ValueId,
        ub: ValueId,
        step: ValueId,
        inits: &[ValueId],
        body: F,
    ) -> InferResult<OpId>
    where
        F: FnOnce(&mut OpBuilder<'_>, ValueId, &[ValueId]) -> InferResult<Vec<ValueId>>,
    {
        let mut operands = vec![lb, ub, step];
        operands.extend_from_slice(inits);
        let loop_op = self.build(OpKind::For, &operands, &[])?;

        let mut arg_types = vec![self.operand_type(lb).clone()];
        arg_types.extend(inits.iter().map(|&v| self.operand_type(v).clone()));
        let block = self.module.add_block(&arg_types);
        self.module.attach_region(loop_op, block);

        let args = self.module.block(block).args.clone();
        let yielded = {
            let mut inner = OpBuilder::new(&mut *self.module, InsertPoint::BlockEnd(block));
            body(&mut inner, args[0], &args[1..])?
        };
        self.module
            .create_op(InsertPoint::BlockEnd(block), OpKind::Yield, &yielded, Default::default());
        Ok(loop_op)
    }
}

// =============================================================================
// Tests
// =============================================================================
