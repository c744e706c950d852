//! Operation kinds and their type/encoding inference rules.
//!
//! `OpKind` is a closed tagged variant. Each kind supplies:
//! - **Inference**: operand types → result types (`infer_result_types`)
//! - **Classification**: purity, memory access, region ownership
//!
//! Inversion and cost rules live next to the layout passes that use them
//! (`opt::layout::invert`, `opt::layout::cost`) and dispatch on the same enum.
//!
//! Some kinds fix their result type by construction (a constant, a range,
//! an explicit conversion). For those, inference validates the operands and
//! returns the *declared* result type supplied by the caller.

use smallvec::SmallVec;
use thiserror::Error;

use super::encoding::Encoding;
use super::types::{ElemType, ScalarType, TensorType, Type};

// =============================================================================
// Operator Payloads
// =============================================================================

/// Splat constant payload. Floats are stored as bits for `Eq`/`Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstValue {
    Int(i64),
    Float(u64),
}

impl ConstValue {
    pub fn float(value: f64) -> Self {
        ConstValue::Float(value.to_bits())
    }
}

/// Elementwise operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    CmpLt,
    CmpEq,
    /// `select(cond, a, b)`
    Select,
    Exp,
    Neg,
    Cast(ScalarType),
}

impl ElementwiseOp {
    /// Number of operands.
    pub const fn arity(self) -> usize {
        match self {
            ElementwiseOp::Exp | ElementwiseOp::Neg | ElementwiseOp::Cast(_) => 1,
            ElementwiseOp::Select => 3,
            _ => 2,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            ElementwiseOp::Add => "add",
            ElementwiseOp::Sub => "sub",
            ElementwiseOp::Mul => "mul",
            ElementwiseOp::Div => "div",
            ElementwiseOp::Max => "max",
            ElementwiseOp::Min => "min",
            ElementwiseOp::CmpLt => "cmp_lt",
            ElementwiseOp::CmpEq => "cmp_eq",
            ElementwiseOp::Select => "select",
            ElementwiseOp::Exp => "exp",
            ElementwiseOp::Neg => "neg",
            ElementwiseOp::Cast(_) => "cast",
        }
    }
}

/// Reduction combiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

// =============================================================================
// Operation Kind
// =============================================================================

/// Operation kind (opcode plus kind-specific attributes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Splat constant. Result type declared.
    Constant(ConstValue),
    /// `[start, end)` as a 1-D i32 tensor. Result type declared.
    MakeRange { start: i32, end: i32 },
    /// Scalar to tensor. Result type declared.
    Splat,
    Elementwise(ElementwiseOp),
    /// Pointer tensor plus offset tensor.
    AddPtr,
    /// Expand unit dimensions. Result shape declared.
    Broadcast,
    /// Insert a unit dimension at `axis`.
    ExpandDims { axis: u32 },
    /// Reduce along `axis`.
    Reduce { axis: u32, combine: ReduceKind },
    /// Reshape. Result shape declared.
    View,
    /// Concatenate along dimension 0. Result shape declared.
    Cat,
    /// `load(ptr, mask?, other?)`
    Load,
    /// `store(ptr, value, mask?)`
    Store,
    /// `atomic_add(ptr, value)`
    AtomicRmw,
    /// `dot(a, b, acc)`
    Dot,
    /// Explicit data-moving layout conversion. Result type declared.
    ConvertLayout,
    /// `for %iv = lb to ub step s iter_args(...)` with one body region.
    For,
    /// Loop terminator.
    Yield,
}

/// Errors produced by type/encoding inference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferError {
    #[error("{op} expects {expected} operands, found {found}")]
    OperandCount {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{op} operand {index} must be a tensor")]
    ExpectedTensor { op: &'static str, index: usize },
    #[error("{op} operand {index} must be a scalar")]
    ExpectedScalar { op: &'static str, index: usize },
    #[error("{op} operand {index} must be a pointer")]
    ExpectedPointer { op: &'static str, index: usize },
    #[error("{op} operands disagree on encoding: {lhs} vs {rhs}")]
    EncodingMismatch {
        op: &'static str,
        lhs: Encoding,
        rhs: Encoding,
    },
    #[error("{op} operands disagree on shape")]
    ShapeMismatch { op: &'static str },
    #[error("{op} operands disagree on element type")]
    ElementMismatch { op: &'static str },
    #[error("{op} axis {axis} out of range for rank {rank}")]
    InvalidAxis {
        op: &'static str,
        axis: u32,
        rank: usize,
    },
    #[error("{op} operand {index} has unexpected encoding {found}")]
    UnexpectedEncoding {
        op: &'static str,
        index: usize,
        found: Encoding,
    },
    #[error("{op} requires a declared result type")]
    MissingDeclaredType { op: &'static str },
}

/// Result types of one operation.
pub type ResultTypes = SmallVec<[Type; 2]>;

/// Result type for inference.
pub type InferResult<T> = Result<T, InferError>;

impl OpKind {
    /// Get the mnemonic.
    pub const fn name(&self) -> &'static str {
        match self {
            OpKind::Constant(_) => "constant",
            OpKind::MakeRange { .. } => "make_range",
            OpKind::Splat => "splat",
            OpKind::Elementwise(op) => op.name(),
            OpKind::AddPtr => "addptr",
            OpKind::Broadcast => "broadcast",
            OpKind::ExpandDims { .. } => "expand_dims",
            OpKind::Reduce { .. } => "reduce",
            OpKind::View => "view",
            OpKind::Cat => "cat",
            OpKind::Load => "load",
            OpKind::Store => "store",
            OpKind::AtomicRmw => "atomic_rmw",
            OpKind::Dot => "dot",
            OpKind::ConvertLayout => "convert_layout",
            OpKind::For => "for",
            OpKind::Yield => "yield",
        }
    }

    /// Check if this operation can be erased when its results are unused.
    pub const fn is_pure(&self) -> bool {
        !matches!(
            self,
            OpKind::Store | OpKind::AtomicRmw | OpKind::For | OpKind::Yield
        )
    }

    /// Check if this operation touches global memory.
    pub const fn is_memory_access(&self) -> bool {
        matches!(self, OpKind::Load | OpKind::Store | OpKind::AtomicRmw)
    }

    #[inline]
    pub const fn is_terminator(&self) -> bool {
        matches!(self, OpKind::Yield)
    }

    #[inline]
    pub const fn has_regions(&self) -> bool {
        matches!(self, OpKind::For)
    }

    /// Check if a conversion of this op's result can be folded into the op
    /// itself by re-creating it directly in the target encoding.
    pub const fn is_layout_source(&self) -> bool {
        matches!(
            self,
            OpKind::Constant(_) | OpKind::MakeRange { .. } | OpKind::Splat
        )
    }

    // =========================================================================
    // Type Inference
    // =========================================================================

    /// Infer result types from operand types.
    ///
    /// `declared` carries the result types recorded on an existing op (or
    /// requested by a builder). It is consulted only by kinds whose result
    /// shape or encoding is an attribute of the op rather than a function
    /// of the operands.
    pub fn infer_result_types(
        &self,
        operands: &[&Type],
        declared: &[Type],
    ) -> InferResult<ResultTypes> {
        let op = self.name();
        let mut out = ResultTypes::new();

        match *self {
            OpKind::Constant(_) | OpKind::MakeRange { .. } => {
                expect_count(op, operands, 0)?;
                out.push(declared_single(op, declared)?);
            }

            OpKind::Splat => {
                expect_count(op, operands, 1)?;
                if operands[0].is_tensor() {
                    return Err(InferError::ExpectedScalar { op, index: 0 });
                }
                let result = declared_single(op, declared)?;
                if result.elem() != operands[0].elem() {
                    return Err(InferError::ElementMismatch { op });
                }
                out.push(result);
            }

            OpKind::ConvertLayout => {
                expect_count(op, operands, 1)?;
                let src = tensor_operand(op, operands, 0)?;
                let result = declared_single(op, declared)?;
                let dst = result
                    .as_tensor()
                    .ok_or(InferError::MissingDeclaredType { op })?;
                if !src.same_shape_and_elem(dst) {
                    return Err(InferError::ShapeMismatch { op });
                }
                out.push(result);
            }

            OpKind::Elementwise(ew) => {
                expect_count(op, operands, ew.arity())?;
                out.push(infer_elementwise(op, ew, operands)?);
            }

            OpKind::AddPtr => {
                expect_count(op, operands, 2)?;
                if !operands[0].elem().is_ptr() {
                    return Err(InferError::ExpectedPointer { op, index: 0 });
                }
                check_same_layout(op, operands)?;
                out.push(operands[0].clone());
            }

            OpKind::Broadcast => {
                expect_count(op, operands, 1)?;
                let src = tensor_operand(op, operands, 0)?;
                let declared = declared_tensor(op, declared)?;
                if declared.rank() != src.rank() {
                    return Err(InferError::ShapeMismatch { op });
                }
                let compatible = src
                    .shape
                    .iter()
                    .zip(declared.shape.iter())
                    .all(|(&s, &d)| s == d || s == 1);
                if !compatible {
                    return Err(InferError::ShapeMismatch { op });
                }
                out.push(Type::Tensor(TensorType {
                    shape: declared.shape.clone(),
                    elem: src.elem,
                    encoding: src.encoding.clone(),
                }));
            }

            OpKind::ExpandDims { axis } => {
                expect_count(op, operands, 1)?;
                let src = tensor_operand(op, operands, 0)?;
                if axis as usize > src.rank() {
                    return Err(InferError::InvalidAxis {
                        op,
                        axis,
                        rank: src.rank(),
                    });
                }
                let parent = match &src.encoding {
                    Encoding::Slice(s) if s.dim == axis => (*s.parent).clone(),
                    other => {
                        return Err(InferError::UnexpectedEncoding {
                            op,
                            index: 0,
                            found: other.clone(),
                        })
                    }
                };
                let mut shape = src.shape.clone();
                shape.insert(axis as usize, 1);
                out.push(Type::Tensor(TensorType {
                    shape,
                    elem: src.elem,
                    encoding: parent,
                }));
            }

            OpKind::Reduce { axis, .. } => {
                expect_count(op, operands, 1)?;
                let src = tensor_operand(op, operands, 0)?;
                if axis as usize >= src.rank() {
                    return Err(InferError::InvalidAxis {
                        op,
                        axis,
                        rank: src.rank(),
                    });
                }
                if src.rank() == 1 {
                    out.push(Type::Scalar(src.elem));
                } else {
                    let mut shape = src.shape.clone();
                    shape.remove(axis as usize);
                    out.push(Type::Tensor(TensorType {
                        shape,
                        elem: src.elem,
                        encoding: Encoding::slice(axis, src.encoding.clone()),
                    }));
                }
            }

            OpKind::View => {
                expect_count(op, operands, 1)?;
                let src = tensor_operand(op, operands, 0)?;
                let declared = declared_tensor(op, declared)?;
                if declared.num_elements() != src.num_elements() {
                    return Err(InferError::ShapeMismatch { op });
                }
                out.push(Type::Tensor(TensorType {
                    shape: declared.shape.clone(),
                    elem: src.elem,
                    encoding: src.encoding.clone(),
                }));
            }

            OpKind::Cat => {
                expect_count(op, operands, 2)?;
                let lhs = tensor_operand(op, operands, 0)?;
                let rhs = tensor_operand(op, operands, 1)?;
                if lhs.encoding != rhs.encoding {
                    return Err(InferError::EncodingMismatch {
                        op,
                        lhs: lhs.encoding.clone(),
                        rhs: rhs.encoding.clone(),
                    });
                }
                if lhs.elem != rhs.elem {
                    return Err(InferError::ElementMismatch { op });
                }
                let declared = declared_tensor(op, declared)?;
                if declared.num_elements() != lhs.num_elements() + rhs.num_elements() {
                    return Err(InferError::ShapeMismatch { op });
                }
                out.push(Type::Tensor(TensorType {
                    shape: declared.shape.clone(),
                    elem: lhs.elem,
                    encoding: lhs.encoding.clone(),
                }));
            }

            OpKind::Load => {
                if operands.is_empty() || operands.len() > 3 {
                    return Err(InferError::OperandCount {
                        op,
                        expected: 3,
                        found: operands.len(),
                    });
                }
                let loaded = infer_pointer_access(op, operands)?;
                if let Some(mask) = operands.get(1) {
                    if mask.elem() != ElemType::Scalar(ScalarType::I1) {
                        return Err(InferError::ElementMismatch { op });
                    }
                }
                if let Some(other) = operands.get(2) {
                    if other.elem() != loaded.elem() {
                        return Err(InferError::ElementMismatch { op });
                    }
                }
                out.push(loaded);
            }

            OpKind::AtomicRmw => {
                expect_count(op, operands, 2)?;
                let result = infer_pointer_access(op, &operands[..1])?;
                check_same_layout(op, operands)?;
                if operands[1].elem() != result.elem() {
                    return Err(InferError::ElementMismatch { op });
                }
                out.push(result);
            }

            OpKind::Store => {
                if operands.len() < 2 || operands.len() > 3 {
                    return Err(InferError::OperandCount {
                        op,
                        expected: 3,
                        found: operands.len(),
                    });
                }
                let loaded = infer_pointer_access(op, &operands[..1])?;
                if loaded.elem() != operands[1].elem() {
                    return Err(InferError::ElementMismatch { op });
                }
                check_same_layout(op, operands)?;
            }

            OpKind::Dot => {
                expect_count(op, operands, 3)?;
                let a = tensor_operand(op, operands, 0)?;
                let b = tensor_operand(op, operands, 1)?;
                let c = tensor_operand(op, operands, 2)?;
                if a.rank() != 2 || b.rank() != 2 || c.rank() != 2 {
                    return Err(InferError::ShapeMismatch { op });
                }
                if a.shape[1] != b.shape[0] || a.shape[0] != c.shape[0] || b.shape[1] != c.shape[1]
                {
                    return Err(InferError::ShapeMismatch { op });
                }
                for (index, operand) in [(0usize, a), (1, b)] {
                    let expected = Encoding::dot_operand(index as u32, c.encoding.clone());
                    if operand.encoding != expected {
                        return Err(InferError::UnexpectedEncoding {
                            op,
                            index,
                            found: operand.encoding.clone(),
                        });
                    }
                }
                out.push(operands[2].clone());
            }

            OpKind::For => {
                if operands.len() < 3 {
                    return Err(InferError::OperandCount {
                        op,
                        expected: 3,
                        found: operands.len(),
                    });
                }
                for (index, bound) in operands[..3].iter().enumerate() {
                    if bound.is_tensor() {
                        return Err(InferError::ExpectedScalar { op, index });
                    }
                }
                out.extend(operands[3..].iter().map(|t| (*t).clone()));
            }

            OpKind::Yield => {}
        }

        Ok(out)
    }
}

// =============================================================================
// Inference Helpers
// =============================================================================

fn expect_count(op: &'static str, operands: &[&Type], expected: usize) -> InferResult<()> {
    if operands.len() != expected {
        return Err(InferError::OperandCount {
            op,
            expected,
            found: operands.len(),
        });
    }
    Ok(())
}

fn tensor_operand<'t>(
    op: &'static str,
    operands: &[&'t Type],
    index: usize,
) -> InferResult<&'t TensorType> {
    operands[index]
        .as_tensor()
        .ok_or(InferError::ExpectedTensor { op, index })
}

fn declared_single(op: &'static str, declared: &[Type]) -> InferResult<Type> {
    declared
        .first()
        .cloned()
        .ok_or(InferError::MissingDeclaredType { op })
}

fn declared_tensor<'t>(op: &'static str, declared: &'t [Type]) -> InferResult<&'t TensorType> {
    declared
        .first()
        .and_then(Type::as_tensor)
        .ok_or(InferError::MissingDeclaredType { op })
}

/// All operands must be tensors of one shape and encoding, or all scalars.
fn check_same_layout(op: &'static str, operands: &[&Type]) -> InferResult<()> {
    let Some(first) = operands.first() else {
        return Ok(());
    };
    match first.as_tensor() {
        Some(head) => {
            for (index, other) in operands.iter().enumerate().skip(1) {
                let other = other
                    .as_tensor()
                    .ok_or(InferError::ExpectedTensor { op, index })?;
                if other.shape != head.shape {
                    return Err(InferError::ShapeMismatch { op });
                }
                if other.encoding != head.encoding {
                    return Err(InferError::EncodingMismatch {
                        op,
                        lhs: head.encoding.clone(),
                        rhs: other.encoding.clone(),
                    });
                }
            }
        }
        None => {
            if let Some(index) = operands.iter().position(|t| t.is_tensor()) {
                return Err(InferError::ExpectedScalar { op, index });
            }
        }
    }
    Ok(())
}

fn infer_elementwise(op: &'static str, ew: ElementwiseOp, operands: &[&Type]) -> InferResult<Type> {
    check_same_layout(op, operands)?;

    let elem = match ew {
        ElementwiseOp::CmpLt | ElementwiseOp::CmpEq => {
            if operands[0].elem() != operands[1].elem() {
                return Err(InferError::ElementMismatch { op });
            }
            ElemType::Scalar(ScalarType::I1)
        }
        ElementwiseOp::Cast(to) => ElemType::Scalar(to),
        ElementwiseOp::Select => {
            if operands[0].elem() != ElemType::Scalar(ScalarType::I1)
                || operands[1].elem() != operands[2].elem()
            {
                return Err(InferError::ElementMismatch { op });
            }
            operands[1].elem()
        }
        ElementwiseOp::Exp | ElementwiseOp::Neg => operands[0].elem(),
        _ => {
            if operands[0].elem() != operands[1].elem() {
                return Err(InferError::ElementMismatch { op });
            }
            operands[0].elem()
        }
    };

    Ok(operands[0].with_elem(elem))
}

/// Result of reading through `operands[0]`; trailing operands (mask, other)
/// must share its layout.
fn infer_pointer_access(op: &'static str, operands: &[&Type]) -> InferResult<Type> {
    let ptr = operands[0];
    let pointee = ptr
        .elem()
        .pointee()
        .ok_or(InferError::ExpectedPointer { op, index: 0 })?;
    check_same_layout(op, operands)?;
    Ok(ptr.with_elem(ElemType::Scalar(pointee)))
}

// =============================================================================
// Tests
// =============================================================================
