//! Operation cloning with type re-inference.
//!
//! Rematerialization re-executes producers under new operand encodings, so a
//! clone cannot keep the original result types. Each clone:
//!
//! 1. Resolves operands through a `ValueMapping` (original operand if absent)
//! 2. Re-runs the kind's inference over the substituted operand types
//! 3. Registers its results in the mapping for later clones
//!
//! Layout sources (constants, ranges, splats) have no tensor operands to
//! substitute; `clone_with_encoding` re-creates them directly in a requested
//! encoding instead.

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

use crate::ir::{Encoding, InferError, InsertPoint, Module, OpFlags, OpId, ValueId};

// =============================================================================
// Value Mapping
// =============================================================================

/// Substitution table from original values to their replacements.
#[derive(Debug, Clone, Default)]
pub struct ValueMapping {
    map: FxHashMap<ValueId, ValueId>,
}

impl ValueMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` is replaced by `to`.
    pub fn map(&mut self, from: ValueId, to: ValueId) {
        self.map.insert(from, to);
    }

    pub fn lookup(&self, value: ValueId) -> Option<ValueId> {
        self.map.get(&value).copied()
    }

    /// Get the replacement for `value`, or `value` itself.
    #[inline]
    pub fn lookup_or_default(&self, value: ValueId) -> ValueId {
        self.lookup(value).unwrap_or(value)
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.map.contains_key(&value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure to produce a well-typed clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloneError {
    #[error("cannot clone {op} ({name}): it owns regions")]
    HasRegions { op: OpId, name: &'static str },

    #[error("clone of {op} ({name}) is ill-typed: {source}")]
    Inference {
        op: OpId,
        name: &'static str,
        #[source]
        source: InferError,
    },

    #[error("{op} ({name}) is not a layout source")]
    NotALayoutSource { op: OpId, name: &'static str },
}

// =============================================================================
// Cloning
// =============================================================================

/// Clone `op` at `at` with operands resolved through `mapping`.
///
/// Result types come from inference over the substituted operands; the
/// original result types are passed only as declared types for kinds whose
/// result shape is an attribute.
pub fn clone_with_infer_type(
    module: &mut Module,
    op: OpId,
    mapping: &mut ValueMapping,
    at: InsertPoint,
) -> Result<OpId, CloneError> {
    let original = module.op(op);
    let kind = original.kind;
    let name = kind.name();
    if !original.regions.is_empty() {
        return Err(CloneError::HasRegions { op, name });
    }

    let operands: Vec<ValueId> = original
        .operands
        .iter()
        .map(|&v| mapping.lookup_or_default(v))
        .collect();
    let declared = module.result_types(op);
    let result_types = {
        let types: Vec<_> = operands.iter().map(|&v| module.value_type(v)).collect();
        kind.infer_result_types(&types, &declared)
            .map_err(|source| CloneError::Inference { op, name, source })?
    };

    let clone = module.create_op(at, kind, &operands, result_types);
    module.mark(clone, OpFlags::REMATERIALIZED);

    let pairs: Vec<(ValueId, ValueId)> = module
        .op(op)
        .results
        .iter()
        .copied()
        .zip(module.op(clone).results.iter().copied())
        .collect();
    for (from, to) in pairs {
        mapping.map(from, to);
    }

    trace!(op = %op, clone = %clone, kind = name, "cloned with inferred type");
    Ok(clone)
}

/// Re-create layout source `op` at `at` producing `encoding` directly.
pub fn clone_with_encoding(
    module: &mut Module,
    op: OpId,
    encoding: &Encoding,
    at: InsertPoint,
) -> Result<OpId, CloneError> {
    let original = module.op(op);
    let kind = original.kind;
    let name = kind.name();
    if !kind.is_layout_source() {
        return Err(CloneError::NotALayoutSource { op, name });
    }

    let operands = original.operands.clone();
    let declared: Vec<_> = module
        .result_types(op)
        .iter()
        .map(|t| t.with_encoding(encoding.clone()))
        .collect();
    let result_types = {
        let types: Vec<_> = operands.iter().map(|&v| module.value_type(v)).collect();
        kind.infer_result_types(&types, &declared)
            .map_err(|source| CloneError::Inference { op, name, source })?
    };

    let clone = module.create_op(at, kind, &operands, result_types);
    module.mark(clone, OpFlags::REMATERIALIZED);
    trace!(op = %op, clone = %clone, %encoding, "re-created layout source");
    Ok(clone)
}

// =============================================================================
// Tests
// =============================================================================
