//! Encoding inversion.
//!
//! Given an operation and the encoding its result should have, compute the
//! encoding each operand must carry so that re-executing the operation
//! produces that result. Every rule here mirrors an inference rule in
//! `OpKind::infer_result_types`: feeding the returned operand encodings
//! back through inference yields the requested result encoding.

use smallvec::SmallVec;
use thiserror::Error;
use tracing::trace;

use crate::ir::{Encoding, Module, OpId, OpKind};

/// Required encoding per operand; `None` for scalar operands.
pub type OperandEncodings = SmallVec<[Option<Encoding>; 4]>;

/// No operand encoding produces the requested result encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InversionError {
    #[error("{op} cannot produce a shared-memory result")]
    SharedTarget { op: &'static str },

    #[error("reduce along axis {axis} produces a slice encoding, not {found}")]
    NotASlice { axis: u32, found: Encoding },

    #[error("reduce along axis {axis} cannot produce a slice of dimension {dim}")]
    ReduceAxisMismatch { axis: u32, dim: u32 },

    #[error("{op} has no operand encoding for a requested result encoding")]
    Unsupported { op: &'static str },
}

/// Compute the operand encodings `op` needs to produce `target`.
pub fn invert_encoding(
    module: &Module,
    op: OpId,
    target: &Encoding,
) -> Result<OperandEncodings, InversionError> {
    let o = module.op(op);
    let name = o.kind.name();

    if target.is_shared() && o.kind != OpKind::ConvertLayout {
        return Err(InversionError::SharedTarget { op: name });
    }

    let per_tensor = |enc: &dyn Fn(usize) -> Encoding| -> OperandEncodings {
        o.operands
            .iter()
            .enumerate()
            .map(|(i, &v)| module.value_type(v).is_tensor().then(|| enc(i)))
            .collect()
    };

    let required = match o.kind {
        OpKind::Constant(_)
        | OpKind::MakeRange { .. }
        | OpKind::Splat
        | OpKind::Elementwise(_)
        | OpKind::AddPtr
        | OpKind::Broadcast
        | OpKind::Load
        | OpKind::Store
        | OpKind::AtomicRmw
        | OpKind::ConvertLayout => per_tensor(&|_: usize| target.clone()),

        OpKind::ExpandDims { axis } => {
            per_tensor(&|_: usize| Encoding::slice(axis, target.clone()))
        }

        OpKind::Reduce { axis, .. } => {
            let slice = target.as_slice().ok_or_else(|| InversionError::NotASlice {
                axis,
                found: target.clone(),
            })?;
            if slice.dim != axis {
                return Err(InversionError::ReduceAxisMismatch {
                    axis,
                    dim: slice.dim,
                });
            }
            let parent = (*slice.parent).clone();
            per_tensor(&|_: usize| parent.clone())
        }

        OpKind::Dot => per_tensor(&|i: usize| match i {
            0 | 1 => Encoding::dot_operand(i as u32, target.clone()),
            _ => target.clone(),
        }),

        OpKind::View | OpKind::Cat | OpKind::For | OpKind::Yield => {
            trace!(op = %op, kind = name, "no structural inverse");
            return Err(InversionError::Unsupported { op: name });
        }
    };

    Ok(required)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstValue, ElemType, OpBuilder, ReduceKind, ScalarType, Type};

    fn enc_a() -> Encoding {
        Encoding::blocked(&[1, 4], &[8, 4], &[4, 1], &[1, 0])
    }

    fn enc_b() -> Encoding {
        Encoding::blocked(&[4, 1], &[4, 8], &[1, 4], &[0, 1])
    }

    fn f32_2d(enc: Encoding) -> Type {
        Type::tensor(&[32, 32], ElemType::Scalar(ScalarType::F32), enc)
    }

    /// Check that inference over the inverted operand types gives `target`.
    fn assert_consistent(m: &Module, op: OpId, target: &Encoding) {
        let required = invert_encoding(m, op, target).unwrap();
        let o = m.op(op);
        let operand_types: Vec<Type> = o
            .operands
            .iter()
            .zip(&required)
            .map(|(&v, enc)| match enc {
                Some(enc) => m.value_type(v).with_encoding(enc.clone()),
                None => m.value_type(v).clone(),
            })
            .collect();
        let refs: Vec<&Type> = operand_types.iter().collect();
        let declared: Vec<Type> = m
            .result_types(op)
            .iter()
            .map(|t| t.with_encoding(target.clone()))
            .collect();
        let inferred = o.kind.infer_result_types(&refs, &declared).unwrap();
        assert_eq!(inferred[0].encoding(), Some(target));
    }

    #[test]
    fn test_elementwise_mirrors_target() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(1.0), f32_2d(enc_a())).unwrap();
        let y = b.add(x, x).unwrap();
        let add = m.defining_op(y).unwrap();

        let required = invert_encoding(&m, add, &enc_b()).unwrap();
        assert_eq!(required.as_slice(), &[Some(enc_b()), Some(enc_b())]);
        assert_consistent(&m, add, &enc_b());
    }

    #[test]
    fn test_scalar_operands_have_no_requirement() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let s = b.param(Type::scalar(ScalarType::F32));
        let t = b.splat(s, &[32, 32], enc_a()).unwrap();
        let splat = m.defining_op(t).unwrap();

        let required = invert_encoding(&m, splat, &enc_b()).unwrap();
        assert_eq!(required.as_slice(), &[None]);
        assert_consistent(&m, splat, &enc_b());
    }

    #[test]
    fn test_expand_dims_requires_slice() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(0.0), f32_2d(enc_a())).unwrap();
        let r = b.reduce(x, 1, ReduceKind::Sum).unwrap();
        let e = b.expand_dims(r, 1).unwrap();
        let expand = m.defining_op(e).unwrap();

        let required = invert_encoding(&m, expand, &enc_b()).unwrap();
        assert_eq!(required[0], Some(Encoding::slice(1, enc_b())));
        assert_consistent(&m, expand, &enc_b());
    }

    #[test]
    fn test_reduce_inverts_matching_slice_only() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(0.0), f32_2d(enc_a())).unwrap();
        let r = b.reduce(x, 0, ReduceKind::Max).unwrap();
        let reduce = m.defining_op(r).unwrap();

        let required = invert_encoding(&m, reduce, &Encoding::slice(0, enc_b())).unwrap();
        assert_eq!(required[0], Some(enc_b()));
        assert_consistent(&m, reduce, &Encoding::slice(0, enc_b()));

        assert_eq!(
            invert_encoding(&m, reduce, &Encoding::slice(1, enc_b())),
            Err(InversionError::ReduceAxisMismatch { axis: 0, dim: 1 })
        );
        assert!(matches!(
            invert_encoding(&m, reduce, &enc_b()),
            Err(InversionError::NotASlice { axis: 0, .. })
        ));
    }

    #[test]
    fn test_view_and_shared_targets_fail() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(0.0), f32_2d(enc_a())).unwrap();
        let v = b.view(x, &[1024]).unwrap();
        let y = b.add(x, x).unwrap();
        let view = m.defining_op(v).unwrap();
        let add = m.defining_op(y).unwrap();

        assert!(matches!(
            invert_encoding(&m, view, &enc_b()),
            Err(InversionError::Unsupported { op: "view" })
        ));
        assert!(matches!(
            invert_encoding(&m, add, &Encoding::shared(8, 1, 8, &[1, 0])),
            Err(InversionError::SharedTarget { .. })
        ));
    }

    #[test]
    fn test_dot_operands() {
        let mma = Encoding::mma(2, &[2, 2]);
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let f16 = |enc| Type::tensor(&[32, 32], ElemType::Scalar(ScalarType::F16), enc);
        let a = b
            .constant(ConstValue::float(1.0), f16(Encoding::dot_operand(0, mma.clone())))
            .unwrap();
        let bb = b
            .constant(ConstValue::float(1.0), f16(Encoding::dot_operand(1, mma.clone())))
            .unwrap();
        let c = b.constant(ConstValue::float(0.0), f32_2d(mma.clone())).unwrap();
        let d = b.dot(a, bb, c).unwrap();
        let dot = m.defining_op(d).unwrap();

        let other = Encoding::mma(3, &[4, 1]);
        let required = invert_encoding(&m, dot, &other).unwrap();
        assert_eq!(
            required.as_slice(),
            &[
                Some(Encoding::dot_operand(0, other.clone())),
                Some(Encoding::dot_operand(1, other.clone())),
                Some(other.clone()),
            ]
        );
        assert_consistent(&m, dot, &other);
    }
}
