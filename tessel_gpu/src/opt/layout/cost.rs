//! Layout Cost Model
//!
//! Decides where backward rematerialization must stop. Two predicates
//! classify a single operation under a requested result encoding:
//!
//! - **expensive_load_or_store**: re-issuing a memory access under another
//!   layout would duplicate global-memory traffic
//! - **expensive_to_remat**: cloning the operation is costly or unsafe
//!   regardless of memory traffic
//!
//! An operation flagged by either predicate is a *barrier*. The simulator
//! keeps a net conversion count (`RematCost`) and the policy hook
//! `CostModel::should_rematerialize` turns that count into a decision.

use crate::ir::{Encoding, Module, OpId, OpKind};

// =============================================================================
// Remat Cost
// =============================================================================

/// Outcome of simulating one rematerialization plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RematCost {
    /// Conversions that would remain after rematerializing.
    pub net_conversions: i32,
    /// Operations the plan would clone.
    pub cloned: usize,
    /// Operand edges absorbed for free (foldable producers, hoistable args).
    pub folded: usize,
    /// The plan demands one value in two different encodings.
    pub infeasible: bool,
}

impl RematCost {
    /// A plan that must not be applied.
    pub const INFEASIBLE: Self = Self {
        net_conversions: i32::MAX,
        cloned: 0,
        folded: 0,
        infeasible: true,
    };

    /// Start a count at `initial` conversions.
    pub const fn with_initial(initial: i32) -> Self {
        Self {
            net_conversions: initial,
            cloned: 0,
            folded: 0,
            infeasible: false,
        }
    }

    #[inline]
    pub const fn is_feasible(&self) -> bool {
        !self.infeasible
    }
}

impl Default for RematCost {
    fn default() -> Self {
        Self::with_initial(0)
    }
}

// =============================================================================
// Cost Model Configuration
// =============================================================================

/// Configuration for the default cost model.
#[derive(Debug, Clone)]
pub struct CostModelConfig {
    /// Accesses through a single pointer are cheap to duplicate.
    pub single_value_is_cheap: bool,
    /// Accesses covering fewer elements than threads in the program are
    /// cheap to duplicate.
    pub small_access_is_cheap: bool,
    /// Largest net conversion count still worth rematerializing.
    pub max_net_conversions: i32,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            single_value_is_cheap: true,
            small_access_is_cheap: true,
            max_net_conversions: 0,
        }
    }
}

impl CostModelConfig {
    /// Every memory access is a barrier.
    pub fn conservative() -> Self {
        Self {
            single_value_is_cheap: false,
            small_access_is_cheap: false,
            max_net_conversions: 0,
        }
    }
}

// =============================================================================
// Cost Model
// =============================================================================

/// Barrier classification and profitability policy.
pub trait CostModel {
    /// Check if duplicating memory access `op` in `target` costs more than
    /// converting its result once.
    fn expensive_load_or_store(&self, module: &Module, op: OpId, target: &Encoding) -> bool;

    /// Check if cloning `op` to produce `target` is too costly.
    fn expensive_to_remat(&self, module: &Module, op: OpId, target: &Encoding) -> bool;

    /// Decide whether a simulated plan is worth applying.
    fn should_rematerialize(&self, cost: &RematCost) -> bool {
        cost.is_feasible() && cost.net_conversions <= 0
    }

    /// Check if backward rematerialization must stop at `op`.
    ///
    /// Memory accesses are asked `expensive_load_or_store` first; every
    /// operation is then asked `expensive_to_remat`.
    fn is_barrier(&self, module: &Module, op: OpId, target: &Encoding) -> bool {
        (module.op(op).kind.is_memory_access() && self.expensive_load_or_store(module, op, target))
            || self.expensive_to_remat(module, op, target)
    }
}

/// Cost model following the launch configuration of the module.
#[derive(Debug, Clone, Default)]
pub struct DefaultCostModel {
    config: CostModelConfig,
}

impl DefaultCostModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CostModelConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &CostModelConfig {
        &self.config
    }
}

impl CostModel for DefaultCostModel {
    fn expensive_load_or_store(&self, module: &Module, op: OpId, _target: &Encoding) -> bool {
        let Some(&ptr) = module.op(op).operands.first() else {
            return true;
        };
        let num_elements = match module.value_type(ptr).as_tensor() {
            Some(t) => t.num_elements(),
            None => 1,
        };

        if self.config.single_value_is_cheap && num_elements == 1 {
            return false;
        }
        let threads = i64::from(module.target.threads_per_cta());
        if self.config.small_access_is_cheap && num_elements < threads {
            return false;
        }
        true
    }

    fn expensive_to_remat(&self, module: &Module, op: OpId, _target: &Encoding) -> bool {
        match module.op(op).kind {
            OpKind::AtomicRmw | OpKind::Dot | OpKind::Cat => true,
            OpKind::For | OpKind::Yield => true,
            _ => false,
        }
    }

    fn should_rematerialize(&self, cost: &RematCost) -> bool {
        cost.is_feasible() && cost.net_conversions <= self.config.max_net_conversions
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElemType, OpBuilder, ScalarType, TargetInfo, Type};

    fn blocked() -> Encoding {
        Encoding::blocked(&[1], &[32], &[4], &[0])
    }

    /// Module with one load of `n` pointers.
    fn load_of(n: i32) -> (Module, OpId) {
        let mut m = Module::new(TargetInfo::new(4, 32));
        let mut b = OpBuilder::at_body_end(&mut m);
        let base = b.param(Type::ptr(ScalarType::F32));
        let ptrs = b.splat(base, &[i64::from(n)], blocked()).unwrap();
        let offs = b.make_range(0, n, blocked()).unwrap();
        let addrs = b.add_ptr(ptrs, offs).unwrap();
        let loaded = b.load(addrs, None, None).unwrap();
        let op = m.defining_op(loaded).unwrap();
        (m, op)
    }

    #[test]
    fn test_large_load_is_expensive() {
        let (m, load) = load_of(1024);
        let model = DefaultCostModel::new();
        assert!(model.expensive_load_or_store(&m, load, &blocked()));
        assert!(!model.expensive_to_remat(&m, load, &blocked()));
        assert!(model.is_barrier(&m, load, &blocked()));
    }

    #[test]
    fn test_barrier_follows_either_predicate() {
        struct MemoryOnly;
        impl CostModel for MemoryOnly {
            fn expensive_load_or_store(&self, _: &Module, _: OpId, _: &Encoding) -> bool {
                true
            }
            fn expensive_to_remat(&self, _: &Module, _: OpId, _: &Encoding) -> bool {
                false
            }
        }

        let (mut m, load) = load_of(1024);
        let loaded = m.result(load, 0);
        let mut b = OpBuilder::at_body_end(&mut m);
        let sum = b.add(loaded, loaded).unwrap();
        let add = m.defining_op(sum).unwrap();

        assert!(MemoryOnly.is_barrier(&m, load, &blocked()));
        // The memory predicate only applies to memory accesses.
        assert!(!MemoryOnly.is_barrier(&m, add, &blocked()));
    }

    #[test]
    fn test_small_load_is_cheap() {
        let (m, load) = load_of(64);
        let model = DefaultCostModel::new();
        assert!(!model.expensive_load_or_store(&m, load, &blocked()));

        let strict = DefaultCostModel::with_config(CostModelConfig::conservative());
        assert!(strict.expensive_load_or_store(&m, load, &blocked()));
    }

    #[test]
    fn test_scalar_load_is_cheap() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let ptr = b.param(Type::ptr(ScalarType::F32));
        let loaded = b.load(ptr, None, None).unwrap();
        let op = m.defining_op(loaded).unwrap();

        assert_eq!(m.value_type(loaded).elem(), ElemType::Scalar(ScalarType::F32));
        assert!(!DefaultCostModel::new().expensive_load_or_store(&m, op, &blocked()));
    }

    #[test]
    fn test_elementwise_is_not_a_barrier() {
        let (mut m, load) = load_of(1024);
        let loaded = m.result(load, 0);
        let mut b = OpBuilder::at_body_end(&mut m);
        let sum = b.add(loaded, loaded).unwrap();
        let add = m.defining_op(sum).unwrap();
        assert!(!DefaultCostModel::new().expensive_to_remat(&m, add, &blocked()));
    }

    #[test]
    fn test_should_rematerialize_policy() {
        let model = DefaultCostModel::new();
        assert!(model.should_rematerialize(&RematCost::with_initial(0)));
        assert!(model.should_rematerialize(&RematCost::with_initial(-1)));
        assert!(!model.should_rematerialize(&RematCost::with_initial(1)));
        assert!(!model.should_rematerialize(&RematCost::INFEASIBLE));

        let lenient = DefaultCostModel::with_config(CostModelConfig {
            max_net_conversions: 1,
            ..CostModelConfig::default()
        });
        assert!(lenient.should_rematerialize(&RematCost::with_initial(1)));
    }
}
