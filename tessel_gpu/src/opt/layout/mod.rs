//! Layout-conversion elimination.
//!
//! Tensor values carry an encoding; an explicit `ConvertLayout` moves data
//! between encodings. This module removes conversions by either moving them
//! out of loops or recomputing their producers directly in the target
//! encoding.
//!
//! # Components
//!
//! - **Inversion** (`invert.rs`): operand encodings an op needs for a result
//!   encoding
//! - **Cost model** (`cost.rs`): barrier predicates and profitability policy
//! - **Simulation** (`simulate.rs`): read-only backward walk producing a
//!   `RematPlan`
//! - **Cloning** (`clone.rs`): operation clones with re-inferred types
//! - **Rematerialization** (`remat.rs`): applies a plan, producers first
//! - **Loops** (`loops.rs`): conversion hoisting and loop signature repair
//!
//! # Design Principles
//!
//! - Analysis never mutates the module; a plan is fully built before it is
//!   applied, so rejected plans leave no trace
//! - Iteration order is stable everywhere, so identical input compiles to
//!   identical output
//! - Local failures (inversion, barriers, unhoistable loops) only mean a
//!   conversion stays; broken loop signatures are hard errors
//!
//! # Pass Order
//!
//! `RemoveLayoutConversions` repeats until nothing changes:
//!
//! 1. Hoist loop-invariant conversions of iteration arguments
//! 2. Rematerialize profitable conversion chains
//! 3. Canonicalize and drop dead originals
//! 4. Repair loop iteration signatures

pub mod clone;
pub mod cost;
pub mod invert;
pub mod loops;
pub mod remat;
pub mod simulate;

#[cfg(test)]
mod prop_tests;

pub use clone::{clone_with_encoding, clone_with_infer_type, CloneError, ValueMapping};
pub use cost::{CostModel, CostModelConfig, DefaultCostModel, RematCost};
pub use invert::{invert_encoding, InversionError, OperandEncodings};
pub use loops::{
    can_move_out_of_loop, fixup_loops, hoist_conversion_out_of_loop, HoistError,
    LoopRepairError,
};
pub use remat::{rematerialize_conversion_chain, RematError};
pub use simulate::{RematAnalysis, RematPlan};

use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxBuildHasher;
use thiserror::Error;
use tracing::debug;

use super::canonicalize::canonicalize;
use super::OptimizationPass;
use crate::ir::{verify, Encoding, InferError, Module, OpFlags, OpId, OpKind, ValueId, VerifyError};

// =============================================================================
// Plan Types
// =============================================================================

/// Values to rematerialize and the encoding each must end up in.
///
/// Insertion ordered so that iteration is deterministic.
pub type ConversionPlan = IndexMap<ValueId, Encoding, FxBuildHasher>;

/// Operations absorbed into a plan.
pub type ProcessedSet = IndexSet<OpId, FxBuildHasher>;

/// Encodings produced by absorbed operations.
pub type LayoutSet = IndexSet<Encoding, FxBuildHasher>;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by layout-conversion elimination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error(transparent)]
    Inversion(#[from] InversionError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Remat(#[from] RematError),

    #[error(transparent)]
    Hoist(#[from] HoistError),

    #[error(transparent)]
    LoopRepair(#[from] LoopRepairError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Infer(#[from] InferError),
}

/// Result type for layout passes.
pub type LayoutResult<T> = Result<T, LayoutError>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for conversion elimination.
#[derive(Debug, Clone)]
pub struct LayoutConfig {
    /// Move loop-invariant conversions of iteration arguments before loops.
    pub enable_hoisting: bool,
    /// Rematerialize producer chains in the converted encoding.
    pub enable_remat: bool,
    /// Fold conversions and erase dead code after each round.
    pub canonicalize: bool,
    /// Maximum rounds before giving up on a fixed point.
    pub max_iterations: usize,
    /// Verify the module after the pass.
    pub verify: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            enable_hoisting: true,
            enable_remat: true,
            canonicalize: true,
            max_iterations: 4,
            verify: cfg!(debug_assertions),
        }
    }
}

impl LayoutConfig {
    /// Single round, no hoisting, always verified.
    pub fn conservative() -> Self {
        Self {
            enable_hoisting: false,
            enable_remat: true,
            canonicalize: true,
            max_iterations: 1,
            verify: true,
        }
    }

    /// Run until a fixed point is found or many rounds pass.
    pub fn aggressive() -> Self {
        Self {
            max_iterations: 16,
            ..Self::default()
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from conversion elimination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutStats {
    /// Rounds run.
    pub iterations: usize,
    /// Conversions moved out of loops.
    pub conversions_hoisted: usize,
    /// Conversion sites replaced by rematerialized chains.
    pub conversions_rematerialized: usize,
    /// Operations cloned while rematerializing.
    pub ops_cloned: usize,
    /// Simulated plans that were not applied.
    pub plans_rejected: usize,
    /// Rounds in which loop signatures needed repair.
    pub loop_repairs: usize,
    /// Canonicalization rewrites.
    pub canonicalized: usize,
}

// =============================================================================
// Remove Layout Conversions Pass
// =============================================================================

/// Layout-conversion elimination pass.
pub struct RemoveLayoutConversions {
    config: LayoutConfig,
    cost_model: Box<dyn CostModel>,
    stats: LayoutStats,
}

impl RemoveLayoutConversions {
    /// Create a new pass with default configuration and cost model.
    pub fn new() -> Self {
        Self::with_config(LayoutConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(config: LayoutConfig) -> Self {
        Self {
            config,
            cost_model: Box::new(DefaultCostModel::new()),
            stats: LayoutStats::default(),
        }
    }

    /// Replace the cost model.
    pub fn with_cost_model(mut self, cost_model: impl CostModel + 'static) -> Self {
        self.cost_model = Box::new(cost_model);
        self
    }

    #[inline]
    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Get statistics from the last run.
    pub fn stats(&self) -> &LayoutStats {
        &self.stats
    }

    /// Run conversion elimination on a module.
    pub fn run_layout(&mut self, module: &mut Module) -> LayoutResult<bool> {
        self.stats = LayoutStats::default();
        let cost_model = self.cost_model.as_ref();
        let stats = &mut self.stats;
        let mut changed = false;

        for _ in 0..self.config.max_iterations {
            stats.iterations += 1;
            let mut round = false;

            if self.config.enable_hoisting {
                round |= hoist_loop_conversions(module, cost_model, stats)?;
            }
            if self.config.enable_remat {
                round |= rematerialize_conversions(module, cost_model, stats)?;
            }
            if self.config.canonicalize {
                let rewrites = canonicalize(module)?.total();
                stats.canonicalized += rewrites;
                round |= rewrites > 0;
            }
            if fixup_loops(module)? {
                stats.loop_repairs += 1;
                round = true;
            }

            changed |= round;
            if !round {
                break;
            }
        }

        if self.config.verify {
            verify(module)?;
        }
        debug!(
            iterations = stats.iterations,
            hoisted = stats.conversions_hoisted,
            rematerialized = stats.conversions_rematerialized,
            cloned = stats.ops_cloned,
            rejected = stats.plans_rejected,
            "removed layout conversions"
        );
        Ok(changed)
    }
}

impl Default for RemoveLayoutConversions {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for RemoveLayoutConversions {
    fn name(&self) -> &'static str {
        "remove_layout_conversions"
    }

    fn run(&mut self, module: &mut Module) -> LayoutResult<bool> {
        self.run_layout(module)
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Hoist every loop-invariant conversion of an iteration argument.
fn hoist_loop_conversions(
    module: &mut Module,
    cost_model: &dyn CostModel,
    stats: &mut LayoutStats,
) -> LayoutResult<bool> {
    let mut changed = false;
    for loop_op in module.loops() {
        let num_iter_args = module
            .for_view(loop_op)
            .map_or(0, |view| view.iter_args().len());

        for index in 0..num_iter_args {
            let Some(arg) = module
                .for_view(loop_op)
                .and_then(|view| view.iter_args().get(index).copied())
            else {
                continue;
            };

            let mut cvts = Vec::new();
            if can_move_out_of_loop(module, cost_model, arg, &mut cvts).is_err() || cvts.is_empty() {
                continue;
            }
            // Conversions created by an earlier hoist stay put.
            if cvts
                .iter()
                .any(|&c| module.op(c).flags.contains(OpFlags::HOISTED))
            {
                continue;
            }

            hoist_conversion_out_of_loop(module, loop_op, index, &cvts)?;
            stats.conversions_hoisted += cvts.len();
            changed = true;
        }
    }
    Ok(changed)
}

/// Rematerialize every conversion whose plan the cost model accepts.
fn rematerialize_conversions(
    module: &mut Module,
    cost_model: &dyn CostModel,
    stats: &mut LayoutStats,
) -> LayoutResult<bool> {
    let sites: Vec<OpId> = module
        .walk()
        .into_iter()
        .filter(|&op| module.op(op).kind == OpKind::ConvertLayout)
        .collect();

    let mut changed = false;
    for site in sites {
        let op = module.op(site);
        if op.is_erased() || op.flags.contains(OpFlags::HOISTED) {
            continue;
        }
        if !module.has_uses(module.result(site, 0)) {
            continue;
        }

        let plan = RematAnalysis::new(module, cost_model).plan_conversion(site)?;
        if plan.processed.is_empty() || !cost_model.should_rematerialize(&plan.cost) {
            stats.plans_rejected += 1;
            continue;
        }

        plan.apply(module)?;
        stats.conversions_rematerialized += 1;
        stats.ops_cloned += plan.processed.len();
        changed = true;
    }
    Ok(changed)
}

// =============================================================================
// Tests
// =============================================================================
