//! Chain rematerialization.
//!
//! Executes a plan produced by the simulator. Plan entries are materialized
//! producers first:
//!
//! - **Absorbed op**: cloned right after the original with operands resolved
//!   through the running `ValueMapping`
//! - **Layout source**: re-created directly in the planned encoding
//! - **Conversion**: collapsed onto its source
//! - **Leaf** (barrier, block argument, other block): a conversion is
//!   inserted right after the definition
//!
//! Originals are left in place; `Canonicalize` removes the ones that become
//! dead.

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, trace};

use super::clone::{clone_with_encoding, clone_with_infer_type, CloneError, ValueMapping};
use super::simulate::RematPlan;
use super::{ConversionPlan, ProcessedSet};
use crate::ir::{
    Encoding, InferError, InsertPoint, Module, OpBuilder, OpId, OpKind, Type, ValueId,
};

/// Failure while materializing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RematError {
    #[error("{op} is not a layout conversion")]
    NotAConversion { op: OpId },

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error("cannot convert {value} to {encoding}: {source}")]
    Convert {
        value: ValueId,
        encoding: Encoding,
        #[source]
        source: InferError,
    },

    #[error("rematerialized {value} has type {found}, conversion site expects {expected}")]
    SiteMismatch {
        value: ValueId,
        expected: Type,
        found: Type,
    },
}

// =============================================================================
// Ordering
// =============================================================================

/// Order plan entries so that every entry follows the entries its clone reads.
fn materialization_order(
    module: &Module,
    to_convert: &ConversionPlan,
    processed: &ProcessedSet,
) -> Vec<ValueId> {
    let mut order = Vec::with_capacity(to_convert.len());
    let mut visited = FxHashSet::default();

    for &root in to_convert.keys() {
        // Iterative post-order: (value, operands expanded).
        let mut stack = vec![(root, false)];
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !visited.insert(value) {
                continue;
            }
            stack.push((value, true));
            let Some(def) = module.defining_op(value) else {
                continue;
            };
            if !processed.contains(&def) {
                continue;
            }
            for &operand in module.op(def).operands.iter().rev() {
                if to_convert.contains_key(&operand) && !visited.contains(&operand) {
                    stack.push((operand, false));
                }
            }
        }
    }
    order
}

// =============================================================================
// Rematerialization
// =============================================================================

/// Materialize `to_convert`, recording every replacement in `mapping`.
pub fn rematerialize_conversion_chain(
    module: &mut Module,
    to_convert: &ConversionPlan,
    processed: &ProcessedSet,
    mapping: &mut ValueMapping,
) -> Result<(), RematError> {
    for value in materialization_order(module, to_convert, processed) {
        let Some(target) = to_convert.get(&value) else {
            continue;
        };
        let def = module.defining_op(value);

        let replacement = match def {
            Some(op) if processed.contains(&op) => {
                let clone = clone_with_infer_type(module, op, mapping, InsertPoint::After(op))?;
                let cloned = module.result(clone, 0);
                if module.value_type(cloned).encoding() == Some(target) {
                    cloned
                } else {
                    debug!(value = %value, %target, "clone produced another encoding");
                    insert_convert(module, InsertPoint::After(clone), cloned, target)?
                }
            }
            _ if module.value_type(value).encoding() == Some(target) => value,
            Some(op) if module.op(op).kind.is_layout_source() => {
                let clone = clone_with_encoding(module, op, target, InsertPoint::After(op))?;
                module.result(clone, 0)
            }
            Some(op) if module.op(op).kind == OpKind::ConvertLayout => {
                let source = mapping.lookup_or_default(module.op(op).operands[0]);
                if module.value_type(source).encoding() == Some(target) {
                    source
                } else {
                    insert_convert(module, InsertPoint::After(op), source, target)?
                }
            }
            Some(op) => insert_convert(module, InsertPoint::After(op), value, target)?,
            None => {
                let block = module.owning_block(value);
                insert_convert(module, InsertPoint::BlockStart(block), value, target)?
            }
        };

        trace!(value = %value, replacement = %replacement, %target, "materialized");
        mapping.map(value, replacement);
    }
    Ok(())
}

fn insert_convert(
    module: &mut Module,
    at: InsertPoint,
    value: ValueId,
    encoding: &Encoding,
) -> Result<ValueId, RematError> {
    OpBuilder::new(module, at)
        .convert(value, encoding.clone())
        .map_err(|source| RematError::Convert {
            value,
            encoding: encoding.clone(),
            source,
        })
}

// =============================================================================
// Plan Application
// =============================================================================

impl RematPlan {
    /// Materialize the plan and redirect the conversion site's uses.
    ///
    /// Returns the value that replaces the site's result. The site itself is
    /// left unused.
    pub fn apply(&self, module: &mut Module) -> Result<ValueId, RematError> {
        let mut mapping = ValueMapping::new();
        rematerialize_conversion_chain(module, &self.to_convert, &self.processed, &mut mapping)?;

        let site_result = module.result(self.site, 0);
        let replacement = mapping.lookup_or_default(self.source);
        let expected = module.value_type(site_result);
        let found = module.value_type(replacement);
        if expected != found {
            return Err(RematError::SiteMismatch {
                value: replacement,
                expected: expected.clone(),
                found: found.clone(),
            });
        }

        let rewired = module.replace_all_uses_with(site_result, replacement);
        debug!(
            site = %self.site,
            cloned = self.processed.len(),
            rewired,
            "rematerialized conversion chain"
        );
        Ok(replacement)
    }
}

// =============================================================================
// Tests
// =============================================================================
