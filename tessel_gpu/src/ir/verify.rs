//! Whole-module consistency checks.
//!
//! The verifier checks what the layout passes promise to preserve:
//! - every operation's recorded result types equal what inference derives
//!   from its current operand types
//! - every loop satisfies init types == iter-arg types == yielded types ==
//!   result types
//! - every operand is defined before it is used, in its own or an
//!   enclosing block
//! - the maintained use index agrees with the operand lists

use rustc_hash::FxHashSet;
use thiserror::Error;

use super::module::{Module, UseList};
use super::operation::{BlockId, OpId, Use, ValueId};
use super::ops::{InferError, OpKind};
use super::types::Type;

/// Verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{op} ({name}): inference failed: {source}")]
    Inference {
        op: OpId,
        name: &'static str,
        #[source]
        source: InferError,
    },

    #[error("{op} ({name}): result {index} is {found}, inference gives {expected}")]
    ResultType {
        op: OpId,
        name: &'static str,
        index: usize,
        expected: Type,
        found: Type,
    },

    #[error("{op} ({name}): records {found} results, inference gives {expected}")]
    ResultCount {
        op: OpId,
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("loop {op}: iteration value {index} has inconsistent types")]
    LoopSignature { op: OpId, index: usize },

    #[error("loop {op}: malformed body")]
    MalformedLoop { op: OpId },

    #[error("{op}: operand {index} ({value}) used before definition")]
    UseBeforeDef {
        op: OpId,
        index: usize,
        value: ValueId,
    },

    #[error("use index out of sync for value {value}")]
    StaleUses { value: ValueId },
}

/// Verify a module.
pub fn verify(module: &Module) -> Result<(), VerifyError> {
    let mut visible = FxHashSet::default();
    verify_block(module, module.body(), &mut visible)?;
    verify_use_index(module)
}

fn verify_block(
    module: &Module,
    block: BlockId,
    visible: &mut FxHashSet<ValueId>,
) -> Result<(), VerifyError> {
    visible.extend(module.block(block).args.iter().copied());

    for &op in &module.block(block).ops {
        let o = module.op(op);
        for (index, &value) in o.operands.iter().enumerate() {
            if !visible.contains(&value) {
                return Err(VerifyError::UseBeforeDef { op, index, value });
            }
        }

        verify_types(module, op)?;

        for &region in &o.regions {
            let mut inner = visible.clone();
            verify_block(module, region, &mut inner)?;
        }

        visible.extend(o.results.iter().copied());
    }
    Ok(())
}

fn verify_types(module: &Module, op: OpId) -> Result<(), VerifyError> {
    let o = module.op(op);
    let name = o.kind.name();
    let operand_types = module.operand_types(op);
    let recorded = module.result_types(op);

    let inferred = o
        .kind
        .infer_result_types(&operand_types, &recorded)
        .map_err(|source| VerifyError::Inference { op, name, source })?;

    if o.kind == OpKind::For {
        return verify_loop(module, op);
    }

    if inferred.len() != recorded.len() {
        return Err(VerifyError::ResultCount {
            op,
            name,
            expected: inferred.len(),
            found: recorded.len(),
        });
    }
    for (index, (expected, found)) in inferred.into_iter().zip(recorded).enumerate() {
        if expected != found {
            return Err(VerifyError::ResultType {
                op,
                name,
                index,
                expected,
                found,
            });
        }
    }
    Ok(())
}

fn verify_loop(module: &Module, op: OpId) -> Result<(), VerifyError> {
    let view = module
        .for_view(op)
        .ok_or(VerifyError::MalformedLoop { op })?;
    view.yield_op().ok_or(VerifyError::MalformedLoop { op })?;

    let inits = view.init_types();
    let iters = view.iter_arg_types();
    let yielded = view.yielded_types();
    let results = view.result_types();

    let n = iters.len();
    if inits.len() != n || yielded.len() != n || results.len() != n {
        return Err(VerifyError::MalformedLoop { op });
    }
    for index in 0..n {
        let ty = iters[index];
        if inits[index] != ty || yielded[index] != ty || results[index] != ty {
            return Err(VerifyError::LoopSignature { op, index });
        }
    }
    Ok(())
}

fn verify_use_index(module: &Module) -> Result<(), VerifyError> {
    let fresh = module.compute_uses();
    let maintained = module.use_index();

    let sorted = |uses: Option<&UseList>| -> Vec<Use> {
        let mut v: Vec<Use> = uses.map(|u| u.to_vec()).unwrap_or_default();
        v.sort_by_key(|u| (u.user, u.operand));
        v
    };

    for (value, _) in fresh.iter().chain(maintained.iter()) {
        if sorted(fresh.get(value)) != sorted(maintained.get(value)) {
            return Err(VerifyError::StaleUses { value });
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::OpBuilder;
    use crate::ir::encoding::Encoding;
    use crate::ir::module::InsertPoint;
    use crate::ir::ops::ConstValue;
    use crate::ir::types::{ElemType, ScalarType};

    fn enc_a() -> Encoding {
        Encoding::blocked(&[1], &[32], &[4], &[0])
    }

    fn enc_b() -> Encoding {
        Encoding::blocked(&[4], &[32], &[1], &[0])
    }

    fn f32_tensor(enc: Encoding) -> Type {
        Type::tensor(&[128], ElemType::Scalar(ScalarType::F32), enc)
    }

    #[test]
    fn test_built_module_verifies() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(1.0), f32_tensor(enc_a())).unwrap();
        let y = b.convert(x, enc_b()).unwrap();
        b.add(y, y).unwrap();

        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_detects_stale_result_type() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(1.0), f32_tensor(enc_a())).unwrap();
        let y = b.add(x, x).unwrap();

        m.set_value_type(y, f32_tensor(enc_b()));
        assert!(matches!(verify(&m), Err(VerifyError::ResultType { .. })));
    }

    #[test]
    fn test_detects_loop_signature_mismatch() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let lb = b.const_i32(0).unwrap();
        let ub = b.const_i32(8).unwrap();
        let step = b.const_i32(1).unwrap();
        let init = b.constant(ConstValue::float(0.0), f32_tensor(enc_a())).unwrap();
        let loop_op = b
            .build_for(lb, ub, step, &[init], |_, _, args| Ok(vec![args[0]]))
            .unwrap();

        let result = m.result(loop_op, 0);
        m.set_value_type(result, f32_tensor(enc_b()));
        assert!(matches!(
            verify(&m),
            Err(VerifyError::LoopSignature { index: 0, .. })
        ));
    }

    #[test]
    fn test_detects_use_before_def() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let x = b.constant(ConstValue::float(1.0), f32_tensor(enc_a())).unwrap();
        let y = b.add(x, x).unwrap();

        let x_op = m.defining_op(x).unwrap();
        let y_op = m.defining_op(y).unwrap();
        m.move_op(x_op, InsertPoint::After(y_op));
        assert!(matches!(verify(&m), Err(VerifyError::UseBeforeDef { .. })));
    }
}
