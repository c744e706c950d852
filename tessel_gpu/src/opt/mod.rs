//! Optimization passes over the tensor IR.
//!
//! # Passes
//!
//! - **Canonicalize** (`canonicalize.rs`): Conversion folding and dead-op cleanup
//! - **Layout** (`layout/`): Layout-conversion elimination
//!   - Encoding inversion, cost model, backward simulation
//!   - Chain rematerialization, operation cloning
//!   - Loop hoisting and loop signature repair

pub mod canonicalize;
pub mod layout;

pub use canonicalize::Canonicalize;
pub use layout::{LayoutConfig, LayoutError, LayoutResult, LayoutStats, RemoveLayoutConversions};

use crate::ir::Module;

/// Trait for optimization passes.
pub trait OptimizationPass {
    /// Get the pass name.
    fn name(&self) -> &'static str;

    /// Run the pass on a module.
    ///
    /// Returns true if the module was modified.
    fn run(&mut self, module: &mut Module) -> LayoutResult<bool>;
}
