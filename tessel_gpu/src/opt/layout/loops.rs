//! Loop repair.
//!
//! Two responsibilities around `For` loops:
//!
//! - **Hoisting**: `can_move_out_of_loop` decides whether the conversions of
//!   an iteration argument are loop invariant, and
//!   `hoist_conversion_out_of_loop` moves them in front of the loop by
//!   retyping the iteration argument.
//! - **Signature repair**: `fixup_loops` restores
//!   init types == iteration-argument types == yielded types == result types
//!   for every loop, inserting conversions at the loop boundary.
//!
//! ```text
//!   x0: A                                 x0' = convert(x0, B)
//!   for .. iter_args(x = x0) {            for .. iter_args(x = x0') {
//!     y = convert(x, B)          ==>        z = f(x)
//!     z = f(y)                              yield x
//!     yield x                             }
//!   }
//! ```

use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace};

use super::cost::CostModel;
use super::simulate::RematAnalysis;
use super::{ConversionPlan, LayoutSet, ProcessedSet};
use crate::ir::{
    Encoding, ForView, InferError, InsertPoint, Module, OpBuilder, OpFlags, OpId, OpKind, Type,
    Use, ValueId,
};

// =============================================================================
// Errors
// =============================================================================

/// Reason a conversion of an iteration argument must stay in the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HoistError {
    #[error("{value} is not an iteration argument of a for loop")]
    NotIterationArg { value: ValueId },

    #[error("conversions of {value} target {count} distinct encodings")]
    MultipleTargets { value: ValueId, count: usize },

    #[error("conversion {op} of {value} is outside the loop body")]
    ConversionOutsideBody { value: ValueId, op: OpId },

    #[error("user {op} of {value} is outside the loop body")]
    UserOutsideBody { value: ValueId, op: OpId },

    #[error("user {op} of {value} would need {cost} new conversions")]
    UnprofitableUser { value: ValueId, op: OpId, cost: i32 },

    #[error("hoistability of {value} is already being decided")]
    Reentrant { value: ValueId },

    #[error("no conversion of iteration value {index} of loop {op} to hoist")]
    NothingToHoist { op: OpId, index: usize },

    #[error("cannot convert {value}: {source}")]
    Convert {
        value: ValueId,
        #[source]
        source: InferError,
    },
}

/// Loop boundary that cannot be repaired by inserting conversions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopRepairError {
    #[error("loop {op}: malformed body")]
    MalformedLoop { op: OpId },

    #[error(
        "loop {op}: {inits} init args, {iter_args} iteration args, \
         {yielded} yielded values, {results} results"
    )]
    ArityMismatch {
        op: OpId,
        inits: usize,
        iter_args: usize,
        yielded: usize,
        results: usize,
    },

    #[error("loop {op}: iteration value {index} is {found}, init is {expected}")]
    SignatureMismatch {
        op: OpId,
        index: usize,
        expected: Type,
        found: Type,
    },

    #[error("loop {op}: cannot convert iteration value {index}: {source}")]
    Convert {
        op: OpId,
        index: usize,
        #[source]
        source: InferError,
    },
}

// =============================================================================
// Hoistability
// =============================================================================

impl RematAnalysis<'_> {
    /// Decide whether the conversions of iteration argument `arg` can be
    /// moved in front of its loop.
    ///
    /// On success `cvts` holds the conversions to hoist; it may be empty.
    /// Block arguments that are not loop-carried always succeed.
    pub fn can_move_out_of_loop(
        &mut self,
        arg: ValueId,
        cvts: &mut Vec<OpId>,
    ) -> Result<(), HoistError> {
        if self.module.iteration_arg(arg).is_none() {
            return Ok(());
        }
        if self.hoist_guard.contains(&arg) {
            return Err(HoistError::Reentrant { value: arg });
        }
        self.hoist_guard.push(arg);
        let result = self.check_hoistable(arg, cvts);
        self.hoist_guard.pop();

        match &result {
            Ok(()) => trace!(arg = %arg, conversions = cvts.len(), "hoistable"),
            Err(err) => trace!(arg = %arg, reason = %err, "not hoistable"),
        }
        result
    }

    fn check_hoistable(&mut self, arg: ValueId, cvts: &mut Vec<OpId>) -> Result<(), HoistError> {
        let module = self.module;
        let Some((loop_op, _)) = module.iteration_arg(arg) else {
            return Ok(());
        };
        let body = module.op(loop_op).regions[0];
        let old_encoding = module.value_type(arg).encoding();

        let mut targets: SmallVec<[Encoding; 2]> = SmallVec::new();
        let mut others: SmallVec<[OpId; 4]> = SmallVec::new();
        for user in module.users(arg) {
            let op = module.op(user);
            if op.kind != OpKind::ConvertLayout {
                if !others.contains(&user) {
                    others.push(user);
                }
                continue;
            }
            let Some(new_encoding) = module.value_type(module.result(user, 0)).encoding() else {
                continue;
            };
            let from_shared = old_encoding.is_some_and(Encoding::is_shared);
            if from_shared && new_encoding.is_dot_operand() {
                continue;
            }
            if new_encoding.as_shared().is_some_and(|s| s.vec == 1) {
                continue;
            }
            if !cvts.contains(&user) {
                cvts.push(user);
            }
            if !targets.contains(new_encoding) {
                targets.push(new_encoding.clone());
            }
        }

        if cvts.is_empty() {
            return Ok(());
        }
        if targets.len() != 1 {
            return Err(HoistError::MultipleTargets {
                value: arg,
                count: targets.len(),
            });
        }
        if let Some(&op) = cvts.iter().find(|&&c| module.op(c).parent != body) {
            return Err(HoistError::ConversionOutsideBody { value: arg, op });
        }

        let target = &targets[0];
        for &other in &others {
            if module.op(other).parent != body {
                return Err(HoistError::UserOutsideBody {
                    value: arg,
                    op: other,
                });
            }
            for &operand in &module.op(other).operands {
                let Some(producer) = module.defining_op(operand) else {
                    continue;
                };
                if module.op(producer).kind == OpKind::ConvertLayout {
                    continue;
                }
                let mut processed = ProcessedSet::default();
                let mut layouts = LayoutSet::default();
                let mut to_convert = ConversionPlan::default();
                let cost = self.simulate(
                    producer,
                    false,
                    &mut processed,
                    &mut layouts,
                    &mut to_convert,
                    target,
                );
                if !cost.is_feasible() || cost.net_conversions > 0 {
                    return Err(HoistError::UnprofitableUser {
                        value: arg,
                        op: other,
                        cost: cost.net_conversions,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Decide whether the conversions of iteration argument `arg` can be moved
/// in front of its loop.
pub fn can_move_out_of_loop(
    module: &Module,
    cost_model: &dyn CostModel,
    arg: ValueId,
    cvts: &mut Vec<OpId>,
) -> Result<(), HoistError> {
    RematAnalysis::new(module, cost_model).can_move_out_of_loop(arg, cvts)
}

// =============================================================================
// Hoisting
// =============================================================================

fn convert_at(
    module: &mut Module,
    at: InsertPoint,
    value: ValueId,
    encoding: &Encoding,
) -> Result<ValueId, InferError> {
    OpBuilder::new(module, at).convert(value, encoding.clone())
}

/// Hoist conversions `cvts` of iteration argument `iter_index` of `loop_op`.
///
/// `cvts` must have been accepted by `can_move_out_of_loop`. Returns the
/// converted init value.
pub fn hoist_conversion_out_of_loop(
    module: &mut Module,
    loop_op: OpId,
    iter_index: usize,
    cvts: &[OpId],
) -> Result<ValueId, HoistError> {
    let Some(&first) = cvts.first() else {
        return Err(HoistError::NothingToHoist {
            op: loop_op,
            index: iter_index,
        });
    };
    let arg = module.op(first).operands[0];
    let not_carried = HoistError::NotIterationArg { value: arg };
    if module.iteration_arg(arg) != Some((loop_op, iter_index)) {
        return Err(not_carried);
    }
    let view = module.for_view(loop_op).ok_or(not_carried.clone())?;
    let init = view.init_args()[iter_index];
    let result = view.results()[iter_index];
    let body = view.body();
    let yield_op = view.yield_op().ok_or(not_carried)?;

    let old_ty = module.value_type(arg).clone();
    let Some(old_encoding) = old_ty.encoding().cloned() else {
        return Err(HoistError::NotIterationArg { value: arg });
    };
    let new_ty = module.value_type(module.result(first, 0)).clone();
    let Some(target) = new_ty.encoding().cloned() else {
        return Err(HoistError::NothingToHoist {
            op: loop_op,
            index: iter_index,
        });
    };
    let yield_use = Use {
        user: yield_op,
        operand: iter_index as u32,
    };

    // Users that keep reading the old encoding.
    let stale: Vec<Use> = module
        .uses(arg)
        .iter()
        .copied()
        .filter(|u| *u != yield_use && !cvts.contains(&u.user))
        .collect();

    // Entry: convert the init value once.
    let new_init = convert_at(module, InsertPoint::Before(loop_op), init, &target)
        .map_err(|source| HoistError::Convert { value: init, source })?;
    if let Some(op) = module.defining_op(new_init) {
        module.mark(op, OpFlags::HOISTED);
    }
    module.set_operand(loop_op, ForView::NUM_CONTROL_OPERANDS + iter_index, new_init);

    // Body: the argument now carries the target encoding.
    module.set_value_type(arg, new_ty.clone());
    for &cvt in cvts {
        let converted = module.result(cvt, 0);
        module.replace_all_uses_with(converted, arg);
        module.erase_op(cvt);
    }
    if !stale.is_empty() {
        let back = convert_at(module, InsertPoint::BlockStart(body), arg, &old_encoding)
            .map_err(|source| HoistError::Convert { value: arg, source })?;
        if let Some(op) = module.defining_op(back) {
            module.mark(op, OpFlags::HOISTED);
        }
        for u in stale {
            module.set_operand(u.user, u.operand as usize, back);
        }
    }

    // Yield: next iteration must arrive in the target encoding.
    let yielded = module.op(yield_op).operands[iter_index];
    if module.value_type(yielded) != &new_ty {
        let converted = convert_at(module, InsertPoint::Before(yield_op), yielded, &target)
            .map_err(|source| HoistError::Convert { value: yielded, source })?;
        module.set_operand(yield_op, iter_index, converted);
    }

    // Exit: external users keep the old encoding.
    module.set_value_type(result, new_ty);
    if module.has_uses(result) {
        let back = convert_at(module, InsertPoint::After(loop_op), result, &old_encoding)
            .map_err(|source| HoistError::Convert { value: result, source })?;
        let back_op = module.defining_op(back);
        module.replace_uses_where(result, back, |u| Some(u.user) != back_op);
    }

    debug!(
        loop_op = %loop_op,
        index = iter_index,
        removed = cvts.len(),
        %target,
        "hoisted conversion out of loop"
    );
    Ok(new_init)
}

// =============================================================================
// Signature Repair
// =============================================================================

/// Restore the iteration-signature invariant of every loop.
///
/// Init types are authoritative. Returns true if anything changed.
pub fn fixup_loops(module: &mut Module) -> Result<bool, LoopRepairError> {
    let mut changed = false;
    for loop_op in module.loops() {
        changed |= fixup_loop(module, loop_op)?;
    }
    Ok(changed)
}

fn fixup_loop(module: &mut Module, loop_op: OpId) -> Result<bool, LoopRepairError> {
    let malformed = LoopRepairError::MalformedLoop { op: loop_op };
    let view = module.for_view(loop_op).ok_or(malformed.clone())?;
    let yield_op = view.yield_op().ok_or(malformed)?;
    let body = view.body();
    let inits: Vec<ValueId> = view.init_args().to_vec();
    let args: Vec<ValueId> = view.iter_args().to_vec();
    let results: Vec<ValueId> = view.results().to_vec();
    let num_yielded = view.yielded().len();

    let n = inits.len();
    if args.len() != n || num_yielded != n || results.len() != n {
        return Err(LoopRepairError::ArityMismatch {
            op: loop_op,
            inits: n,
            iter_args: args.len(),
            yielded: num_yielded,
            results: results.len(),
        });
    }

    let mut changed = false;
    for index in 0..n {
        let expected = module.value_type(inits[index]).clone();
        let yielded = module.op(yield_op).operands[index];
        for value in [args[index], yielded, results[index]] {
            let found = module.value_type(value);
            if !found.layout_compatible(&expected) {
                return Err(LoopRepairError::SignatureMismatch {
                    op: loop_op,
                    index,
                    expected,
                    found: found.clone(),
                });
            }
        }

        let convert_err = |source| LoopRepairError::Convert {
            op: loop_op,
            index,
            source,
        };
        let yield_use = Use {
            user: yield_op,
            operand: index as u32,
        };

        // Iteration argument.
        let arg = args[index];
        if module.value_type(arg) != &expected {
            let old = module.value_type(arg).clone();
            module.set_value_type(arg, expected.clone());
            let stale: Vec<Use> = module
                .uses(arg)
                .iter()
                .copied()
                .filter(|u| *u != yield_use)
                .collect();
            if let (false, Some(old_encoding)) = (stale.is_empty(), old.encoding()) {
                let back = convert_at(module, InsertPoint::BlockStart(body), arg, old_encoding)
                    .map_err(convert_err)?;
                for u in stale {
                    module.set_operand(u.user, u.operand as usize, back);
                }
            }
            trace!(loop_op = %loop_op, index, "retyped iteration argument");
            changed = true;
        }

        // Yielded value.
        let yielded = module.op(yield_op).operands[index];
        if module.value_type(yielded) != &expected {
            let peeled = module
                .defining_op(yielded)
                .filter(|&op| module.op(op).kind == OpKind::ConvertLayout)
                .map(|op| module.op(op).operands[0])
                .filter(|&src| module.value_type(src) == &expected);
            let replacement = match (peeled, expected.encoding()) {
                (Some(src), _) => src,
                (None, Some(encoding)) => {
                    convert_at(module, InsertPoint::Before(yield_op), yielded, encoding)
                        .map_err(convert_err)?
                }
                (None, None) => {
                    return Err(LoopRepairError::SignatureMismatch {
                        op: loop_op,
                        index,
                        expected: expected.clone(),
                        found: module.value_type(yielded).clone(),
                    })
                }
            };
            module.set_operand(yield_op, index, replacement);
            trace!(loop_op = %loop_op, index, "repaired yielded value");
            changed = true;
        }

        // Loop result.
        let result = results[index];
        if module.value_type(result) != &expected {
            let old = module.value_type(result).clone();
            module.set_value_type(result, expected.clone());
            if let (true, Some(old_encoding)) = (module.has_uses(result), old.encoding()) {
                let back = convert_at(module, InsertPoint::After(loop_op), result, old_encoding)
                    .map_err(convert_err)?;
                let back_op = module.defining_op(back);
                module.replace_uses_where(result, back, |u| Some(u.user) != back_op);
            }
            trace!(loop_op = %loop_op, index, "retyped loop result");
            changed = true;
        }
    }

    if changed {
        debug!(loop_op = %loop_op, "repaired loop signature");
    }
    Ok(changed)
}

// =============================================================================
// Tests
// =============================================================================
