//! Backward rematerialization simulator.
//!
//! Dry-runs a rematerialization: starting from a conversion site, walk
//! use-def edges toward producers and decide, for every value reached, the
//! encoding it must be rematerialized in. The walk only writes to the
//! caller's accumulators; the module is never mutated.
//!
//! # Accounting
//!
//! The returned `RematCost` counts the conversions that would remain after
//! rematerializing:
//!
//! - every operand edge that needs a new conversion adds one
//! - every operation absorbed into the plan removes one (its result no longer
//!   needs the conversion it was charged when reached)
//! - foldable producers (`Constant`, `MakeRange`, `Splat`, `ConvertLayout`)
//!   and iteration arguments whose in-loop conversions to the demanded
//!   encoding can be hoisted are free
//! - a value demanded in two different encodings makes the plan infeasible
//!
//! # Determinism
//!
//! Operands are visited in operand order from an explicit stack, and every
//! accumulator is insertion ordered, so identical input produces identical
//! plans.

use tracing::{debug, trace};

use super::cost::{CostModel, RematCost};
use super::invert::invert_encoding;
use super::remat::RematError;
use super::{ConversionPlan, LayoutSet, ProcessedSet};
use crate::ir::{BlockId, Encoding, Module, OpFlags, OpId, OpKind, ValueId};

// =============================================================================
// Remat Plan
// =============================================================================

/// A simulated plan for eliminating one conversion.
#[derive(Debug, Clone)]
pub struct RematPlan {
    /// The conversion being eliminated.
    pub site: OpId,
    /// Value the conversion reads.
    pub source: ValueId,
    /// Encoding the conversion produces.
    pub target: Encoding,
    /// Values to rematerialize, producers first.
    pub to_convert: ConversionPlan,
    /// Operations the plan clones.
    pub processed: ProcessedSet,
    /// Encodings the cloned operations produce.
    pub layouts: LayoutSet,
    /// Net conversion count of the plan.
    pub cost: RematCost,
}

// =============================================================================
// Remat Analysis
// =============================================================================

/// Read-only analysis context for simulating rematerialization.
pub struct RematAnalysis<'m> {
    pub(super) module: &'m Module,
    pub(super) cost_model: &'m dyn CostModel,
    /// Iteration arguments whose hoistability is being decided; re-entering
    /// one of them treats it as not hoistable.
    pub(super) hoist_guard: Vec<ValueId>,
}

impl<'m> RematAnalysis<'m> {
    pub fn new(module: &'m Module, cost_model: &'m dyn CostModel) -> Self {
        Self {
            module,
            cost_model,
            hoist_guard: Vec::new(),
        }
    }

    #[inline]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// Simulate rematerializing the result of `init_op` in `target`.
    ///
    /// With `skip_init`, `init_op` itself is neither cloned nor charged: its
    /// operands are demanded directly. This is how a conversion site is
    /// analyzed, with `init_op` the conversion.
    pub fn simulate(
        &mut self,
        init_op: OpId,
        skip_init: bool,
        processed: &mut ProcessedSet,
        layouts: &mut LayoutSet,
        to_convert: &mut ConversionPlan,
        target: &Encoding,
    ) -> RematCost {
        let module = self.module;
        let mut cost = RematCost::with_initial(if skip_init { 0 } else { 1 });
        let mut stack: Vec<(OpId, Encoding)> = Vec::new();

        if skip_init {
            let Ok(required) = invert_encoding(module, init_op, target) else {
                return RematCost::INFEASIBLE;
            };
            let block = module.op(init_op).parent;
            for (&value, req) in module.op(init_op).operands.iter().zip(required) {
                let Some(req) = req else { continue };
                let demand = Demand { value, encoding: req, consumer_block: block };
                if !self.demand(demand, processed, to_convert, &mut stack, &mut cost) {
                    return RematCost::INFEASIBLE;
                }
            }
        } else {
            stack.push((init_op, target.clone()));
        }

        while let Some((op, encoding)) = stack.pop() {
            if processed.contains(&op) {
                continue;
            }
            if self.cost_model.is_barrier(module, op, &encoding) {
                trace!(op = %op, kind = module.op(op).kind.name(), "barrier");
                continue;
            }
            let required = match invert_encoding(module, op, &encoding) {
                Ok(required) => required,
                Err(err) => {
                    trace!(op = %op, error = %err, "inversion failed");
                    continue;
                }
            };

            cost.net_conversions -= 1;
            cost.cloned += 1;
            processed.insert(op);
            layouts.insert(encoding);

            let block = module.op(op).parent;
            for (&value, req) in module.op(op).operands.iter().zip(required) {
                let Some(req) = req else { continue };
                let demand = Demand { value, encoding: req, consumer_block: block };
                if !self.demand(demand, processed, to_convert, &mut stack, &mut cost) {
                    return RematCost::INFEASIBLE;
                }
            }
        }

        trace!(
            init = %init_op,
            net = cost.net_conversions,
            cloned = cost.cloned,
            folded = cost.folded,
            "simulated"
        );
        cost
    }

    /// Record that `demand.value` must be available in `demand.encoding`.
    ///
    /// Returns false on a conflicting demand.
    fn demand(
        &mut self,
        demand: Demand,
        processed: &ProcessedSet,
        to_convert: &mut ConversionPlan,
        stack: &mut Vec<(OpId, Encoding)>,
        cost: &mut RematCost,
    ) -> bool {
        let module = self.module;
        let Demand { value, encoding, consumer_block } = demand;

        match to_convert.get(&value) {
            Some(existing) if *existing != encoding => {
                debug!(value = %value, %existing, requested = %encoding, "conflicting demand");
                return false;
            }
            Some(_) => return true,
            None => {}
        }
        to_convert.insert(value, encoding.clone());

        if module.value_type(value).encoding() == Some(&encoding) {
            return true;
        }

        let Some(def) = module.defining_op(value) else {
            if self.iteration_arg_is_free(value, &encoding) {
                cost.folded += 1;
            } else {
                cost.net_conversions += 1;
            }
            return true;
        };

        let def_op = module.op(def);
        if def_op.kind.is_layout_source() || def_op.kind == OpKind::ConvertLayout {
            cost.folded += 1;
        } else if def_op.parent != consumer_block {
            cost.net_conversions += 1;
        } else if !processed.contains(&def) {
            cost.net_conversions += 1;
            stack.push((def, encoding));
        }
        true
    }

    /// Check whether iteration argument `arg` already has in-loop
    /// conversions to `encoding` that would be hoisted out of its loop.
    fn iteration_arg_is_free(&mut self, arg: ValueId, encoding: &Encoding) -> bool {
        if self.module.iteration_arg(arg).is_none() || self.hoist_guard.contains(&arg) {
            return false;
        }
        let mut cvts = Vec::new();
        if self.can_move_out_of_loop(arg, &mut cvts).is_err() || cvts.is_empty() {
            return false;
        }
        let module = self.module;
        cvts.iter().all(|&c| {
            !module.op(c).flags.contains(OpFlags::HOISTED)
                && module.value_type(module.result(c, 0)).encoding() == Some(encoding)
        })
    }

    /// Simulate eliminating conversion `cvt`.
    pub fn plan_conversion(&mut self, cvt: OpId) -> Result<RematPlan, RematError> {
        let module = self.module;
        let op = module.op(cvt);
        if op.kind != OpKind::ConvertLayout {
            return Err(RematError::NotAConversion { op: cvt });
        }
        let source = op.operands[0];
        let result = module.result(cvt, 0);
        let target = module
            .value_type(result)
            .encoding()
            .cloned()
            .ok_or(RematError::NotAConversion { op: cvt })?;

        let mut processed = ProcessedSet::default();
        let mut layouts = LayoutSet::default();
        let mut to_convert = ConversionPlan::default();
        let cost = self.simulate(
            cvt,
            true,
            &mut processed,
            &mut layouts,
            &mut to_convert,
            &target,
        );

        debug!(
            site = %cvt,
            %target,
            net = cost.net_conversions,
            cloned = cost.cloned,
            feasible = cost.is_feasible(),
            "planned rematerialization"
        );

        Ok(RematPlan {
            site: cvt,
            source,
            target,
            to_convert,
            processed,
            layouts,
            cost,
        })
    }
}

/// One operand demand during simulation.
struct Demand {
    value: ValueId,
    encoding: Encoding,
    consumer_block: BlockId,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstValue, ElemType, OpBuilder, ReduceKind, ScalarType, TargetInfo, Type};
    use crate::opt::layout::cost::DefaultCostModel;

    fn enc_a() -> Encoding {
        Encoding::blocked(&[1], &[32], &[4], &[0])
    }

    fn enc_b() -> Encoding {
        Encoding::blocked(&[4], &[32], &[1], &[0])
    }

    fn f32_tensor(n: i64, enc: Encoding) -> Type {
        Type::tensor(&[n], ElemType::Scalar(ScalarType::F32), enc)
    }

    /// `a = load(ptrs)`, `b = add(a, c)`, `convert(b, B)`.
    fn load_chain(n: i32) -> (Module, OpId) {
        let mut m = Module::new(TargetInfo::new(4, 32));
        let mut b = OpBuilder::at_body_end(&mut m);
        let base = b.param(Type::ptr(ScalarType::F32));
        let ptrs = b.splat(base, &[i64::from(n)], enc_a()).unwrap();
        let offs = b.make_range(0, n, enc_a()).unwrap();
        let addrs = b.add_ptr(ptrs, offs).unwrap();
        let a = b.load(addrs, None, None).unwrap();
        let c = b
            .constant(ConstValue::float(1.0), f32_tensor(i64::from(n), enc_a()))
            .unwrap();
        let sum = b.add(a, c).unwrap();
        let cvt = b.convert(sum, enc_b()).unwrap();
        let site = m.defining_op(cvt).unwrap();
        (m, site)
    }

    #[test]
    fn test_load_is_a_barrier() {
        let (m, site) = load_chain(1024);
        let model = DefaultCostModel::new();
        let mut analysis = RematAnalysis::new(&m, &model);
        let plan = analysis.plan_conversion(site).unwrap();

        assert_eq!(plan.cost.net_conversions, 1);
        assert_eq!(plan.cost.cloned, 1);
        assert_eq!(plan.processed.len(), 1);
        let add = m.defining_op(plan.source).unwrap();
        assert!(plan.processed.contains(&add));
        assert!(plan.to_convert.values().all(|e| *e == enc_b()));
        assert_eq!(plan.to_convert.len(), 3);
        assert!(!model.should_rematerialize(&plan.cost));
    }

    #[test]
    fn test_cheap_load_is_absorbed() {
        let (m, site) = load_chain(64);
        let model = DefaultCostModel::new();
        let mut analysis = RematAnalysis::new(&m, &model);
        let plan = analysis.plan_conversion(site).unwrap();

        // add and load are cloned; addptr is cloned too, its operands fold.
        assert_eq!(plan.processed.len(), 3);
        assert_eq!(plan.cost.net_conversions, 0);
        assert!(model.should_rematerialize(&plan.cost));
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let (m, site) = load_chain(1024);
        let model = DefaultCostModel::new();
        let first = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();
        let second = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();

        assert_eq!(first.cost, second.cost);
        assert!(first.to_convert.iter().eq(second.to_convert.iter()));
        assert!(first.processed.iter().eq(second.processed.iter()));
    }

    #[test]
    fn test_conflicting_demands_are_infeasible() {
        // y reaches the conversion directly and through a reduce/expand_dims
        // round trip; both paths must agree on its encoding.
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let enc2 = Encoding::blocked(&[1, 1], &[8, 4], &[4, 1], &[1, 0]);
        let enc2_b = Encoding::blocked(&[1, 1], &[4, 8], &[1, 4], &[0, 1]);
        let x = b
            .constant(
                ConstValue::float(1.0),
                Type::tensor(&[32, 32], ElemType::Scalar(ScalarType::F32), enc2.clone()),
            )
            .unwrap();
        let y = b.add(x, x).unwrap();
        let r = b.reduce(y, 0, ReduceKind::Sum).unwrap();
        let e = b.expand_dims(r, 0).unwrap();
        let bc = b.broadcast(e, &[32, 32]).unwrap();
        let z = b.add(bc, y).unwrap();
        let cvt = b.convert(z, enc2_b.clone()).unwrap();
        let site = m.defining_op(cvt).unwrap();

        let model = DefaultCostModel::new();
        let plan = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();
        // Both paths agree on y: B, so this chain is feasible.
        assert!(plan.cost.is_feasible());
        assert_eq!(plan.to_convert.get(&y), Some(&enc2_b));

        // Demanding y in A through one path and B through another is not.
        let mut processed = ProcessedSet::default();
        let mut layouts = LayoutSet::default();
        let mut to_convert = ConversionPlan::default();
        to_convert.insert(y, enc2.clone());
        let cost = RematAnalysis::new(&m, &model).simulate(
            site,
            true,
            &mut processed,
            &mut layouts,
            &mut to_convert,
            &enc2_b,
        );
        assert_eq!(cost, RematCost::INFEASIBLE);
    }

    #[test]
    fn test_non_conversion_is_rejected() {
        let (m, site) = load_chain(1024);
        let add = m.defining_op(m.op(site).operands[0]).unwrap();
        let model = DefaultCostModel::new();
        assert!(matches!(
            RematAnalysis::new(&m, &model).plan_conversion(add),
            Err(RematError::NotAConversion { .. })
        ));
    }

    #[test]
    fn test_simulation_does_not_mutate() {
        let (m, site) = load_chain(1024);
        let before = format!("{:?}", m);
        let model = DefaultCostModel::new();
        RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();
        assert_eq!(format!("{:?}", m), before);
    }
}
