//! Property tests for simulation and rematerialization over random
//! elementwise chains.

use proptest::prelude::*;
use proptest::sample::Index;

use super::*;
use crate::ir::{
    verify, ConstValue, ElemType, ElementwiseOp, OpBuilder, ScalarType, TargetInfo, Type,
};

fn enc_a() -> Encoding {
    Encoding::blocked(&[1], &[32], &[4], &[0])
}

fn enc_b() -> Encoding {
    Encoding::blocked(&[4], &[32], &[1], &[0])
}

/// One chain step: operator selector and two operand picks.
type Step = (u8, Index, Index);

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec((0u8..5, any::<Index>(), any::<Index>()), 1..10)
}

/// Build `seeds -> steps -> convert(last, B) -> store` and return the
/// module and the conversion.
fn build_chain(len: i64, steps: &[Step]) -> (Module, OpId) {
    let mut m = Module::new(TargetInfo::new(4, 32));
    let mut b = OpBuilder::at_body_end(&mut m);
    let f32_a = Type::tensor(&[len], ElemType::Scalar(ScalarType::F32), enc_a());

    let base = b.param(Type::ptr(ScalarType::F32));
    let ptrs = b.splat(base, &[len], enc_a()).unwrap();
    let offs = b.make_range(0, len as i32, enc_a()).unwrap();
    let addrs = b.add_ptr(ptrs, offs).unwrap();
    let mut values = vec![
        b.load(addrs, None, None).unwrap(),
        b.constant(ConstValue::float(2.0), f32_a).unwrap(),
    ];

    for (selector, lhs, rhs) in steps {
        let lhs = values[lhs.index(values.len())];
        let rhs = values[rhs.index(values.len())];
        let next = match selector {
            0 => b.add(lhs, rhs),
            1 => b.mul(lhs, rhs),
            2 => b.elementwise(ElementwiseOp::Sub, &[lhs, rhs]),
            3 => b.elementwise(ElementwiseOp::Exp, &[lhs]),
            _ => b.elementwise(ElementwiseOp::Neg, &[lhs]),
        };
        values.push(next.unwrap());
    }

    let last = values[values.len() - 1];
    let converted = b.convert(last, enc_b()).unwrap();
    let out_ptrs = b.splat(base, &[len], enc_b()).unwrap();
    let out_offs = b.make_range(0, len as i32, enc_b()).unwrap();
    let out = b.add_ptr(out_ptrs, out_offs).unwrap();
    b.store(out, converted, None).unwrap();

    let site = m.defining_op(converted).unwrap();
    (m, site)
}

/// Flags memory accesses through `expensive_load_or_store` alone.
struct MemoryBarriers;

impl CostModel for MemoryBarriers {
    fn expensive_load_or_store(&self, m: &Module, op: OpId, _: &Encoding) -> bool {
        matches!(m.op(op).kind, OpKind::Load | OpKind::Store)
    }

    fn expensive_to_remat(&self, _: &Module, _: OpId, _: &Encoding) -> bool {
        false
    }

    fn should_rematerialize(&self, cost: &RematCost) -> bool {
        cost.is_feasible()
    }
}

fn conversions(m: &Module) -> usize {
    m.walk()
        .into_iter()
        .filter(|&op| m.op(op).kind == OpKind::ConvertLayout)
        .count()
}

proptest! {
    #[test]
    fn prop_simulation_is_deterministic(steps in steps(), small in any::<bool>()) {
        let (m, site) = build_chain(if small { 64 } else { 1024 }, &steps);
        let model = DefaultCostModel::new();
        let first = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();
        let second = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();

        prop_assert_eq!(first.cost, second.cost);
        prop_assert!(first.to_convert.iter().eq(second.to_convert.iter()));
        prop_assert!(first.processed.iter().eq(second.processed.iter()));
    }

    #[test]
    fn prop_applied_plans_are_complete_and_well_typed(steps in steps(), small in any::<bool>()) {
        let (mut m, site) = build_chain(if small { 64 } else { 1024 }, &steps);
        let model = DefaultCostModel::new();
        let plan = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();
        prop_assume!(plan.cost.is_feasible());

        let mut mapping = ValueMapping::new();
        rematerialize_conversion_chain(&mut m, &plan.to_convert, &plan.processed, &mut mapping)
            .unwrap();
        for (&value, target) in &plan.to_convert {
            let replacement = mapping.lookup_or_default(value);
            prop_assert_eq!(m.value_type(replacement).encoding(), Some(target));
        }
        prop_assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn prop_barrier_is_never_cloned(steps in steps()) {
        let (m, site) = build_chain(1024, &steps);
        let model = DefaultCostModel::new();
        let plan = RematAnalysis::new(&m, &model).plan_conversion(site).unwrap();
        prop_assert!(plan
            .processed
            .iter()
            .all(|&op| m.op(op).kind != OpKind::Load));
    }

    #[test]
    fn prop_memory_predicate_alone_stops_descent(steps in steps(), small in any::<bool>()) {
        let (m, site) = build_chain(if small { 64 } else { 1024 }, &steps);
        let plan = RematAnalysis::new(&m, &MemoryBarriers).plan_conversion(site).unwrap();
        prop_assert!(plan
            .processed
            .iter()
            .all(|&op| !m.op(op).kind.is_memory_access()));
    }

    #[test]
    fn prop_pass_never_adds_conversions(steps in steps(), small in any::<bool>()) {
        let (mut m, _) = build_chain(if small { 64 } else { 1024 }, &steps);
        let before = conversions(&m);
        let mut pass = RemoveLayoutConversions::with_config(LayoutConfig {
            verify: true,
            ..LayoutConfig::default()
        });
        pass.run(&mut m).unwrap();
        prop_assert!(conversions(&m) <= before);
        prop_assert_eq!(verify(&m), Ok(()));
    }
}
