//! Conversion Canonicalization.
//!
//! Local cleanup run after layout rewrites:
//!
//! - **Identity**: `convert(x: E, E)` is replaced by `x`
//! - **Chains**: `convert(convert(x, E1), E2)` reads `x` directly
//! - **Layout sources**: `convert(constant/make_range/splat, E)` is replaced
//!   by the producer re-created in `E`
//! - **Dead code**: unused side-effect-free operations are erased
//!
//! Rules are applied until nothing changes.

use tracing::{debug, trace};

use super::layout::clone::{clone_with_encoding, CloneError};
use super::layout::LayoutResult;
use super::OptimizationPass;
use crate::ir::{InsertPoint, Module, OpId, OpKind};

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from canonicalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanonicalizeStats {
    /// Conversions to the encoding their operand already has.
    pub identities_removed: usize,
    /// Conversions rewired past another conversion.
    pub chains_collapsed: usize,
    /// Layout sources re-created in a converted encoding.
    pub sources_refolded: usize,
    /// Unused pure operations erased.
    pub dead_erased: usize,
}

impl CanonicalizeStats {
    /// Total number of rewrites.
    pub fn total(&self) -> usize {
        self.identities_removed + self.chains_collapsed + self.sources_refolded + self.dead_erased
    }

    fn accumulate(&mut self, other: &CanonicalizeStats) {
        self.identities_removed += other.identities_removed;
        self.chains_collapsed += other.chains_collapsed;
        self.sources_refolded += other.sources_refolded;
        self.dead_erased += other.dead_erased;
    }
}

// =============================================================================
// Rewrites
// =============================================================================

/// Simplify one conversion. Returns true if it was rewritten.
fn simplify_conversion(
    module: &mut Module,
    cvt: OpId,
    stats: &mut CanonicalizeStats,
) -> Result<bool, CloneError> {
    let source = module.op(cvt).operands[0];
    let result = module.result(cvt, 0);

    if module.value_type(source) == module.value_type(result) {
        module.replace_all_uses_with(result, source);
        module.erase_op(cvt);
        stats.identities_removed += 1;
        trace!(op = %cvt, "removed identity conversion");
        return Ok(true);
    }

    let Some(producer) = module.defining_op(source) else {
        return Ok(false);
    };
    let producer_kind = module.op(producer).kind;

    if producer_kind == OpKind::ConvertLayout {
        let original = module.op(producer).operands[0];
        module.set_operand(cvt, 0, original);
        stats.chains_collapsed += 1;
        trace!(op = %cvt, skipped = %producer, "collapsed conversion chain");
        return Ok(true);
    }

    if producer_kind.is_layout_source() && module.has_uses(result) {
        let Some(encoding) = module.value_type(result).encoding().cloned() else {
            return Ok(false);
        };
        let clone = clone_with_encoding(module, producer, &encoding, InsertPoint::Before(cvt))?;
        let refolded = module.result(clone, 0);
        module.replace_all_uses_with(result, refolded);
        module.erase_op(cvt);
        stats.sources_refolded += 1;
        trace!(op = %cvt, source = %producer, "re-created layout source");
        return Ok(true);
    }

    Ok(false)
}

fn is_trivially_dead(module: &Module, op: OpId) -> bool {
    let o = module.op(op);
    !o.is_erased()
        && o.kind.is_pure()
        && o.regions.is_empty()
        && !o.results.is_empty()
        && o.results.iter().all(|&r| !module.has_uses(r))
}

/// Erase unused pure operations, consumers first.
fn eliminate_dead(module: &mut Module, stats: &mut CanonicalizeStats) -> bool {
    let mut changed = false;
    for op in module.walk().into_iter().rev() {
        if is_trivially_dead(module, op) {
            module.erase_op(op);
            stats.dead_erased += 1;
            changed = true;
        }
    }
    changed
}

/// Canonicalize conversions and erase dead code until a fixed point.
pub fn canonicalize(module: &mut Module) -> Result<CanonicalizeStats, CloneError> {
    let mut stats = CanonicalizeStats::default();
    loop {
        let mut changed = false;
        for op in module.walk() {
            let o = module.op(op);
            if o.is_erased() || o.kind != OpKind::ConvertLayout {
                continue;
            }
            changed |= simplify_conversion(module, op, &mut stats)?;
        }
        changed |= eliminate_dead(module, &mut stats);
        if !changed {
            break;
        }
    }
    if stats.total() > 0 {
        debug!(
            identities = stats.identities_removed,
            chains = stats.chains_collapsed,
            refolded = stats.sources_refolded,
            dead = stats.dead_erased,
            "canonicalized"
        );
    }
    Ok(stats)
}

// =============================================================================
// Canonicalize Pass
// =============================================================================

/// Conversion canonicalization pass.
#[derive(Debug, Default)]
pub struct Canonicalize {
    stats: CanonicalizeStats,
}

impl Canonicalize {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get statistics accumulated across runs.
    pub fn stats(&self) -> &CanonicalizeStats {
        &self.stats
    }
}

impl OptimizationPass for Canonicalize {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn run(&mut self, module: &mut Module) -> LayoutResult<bool> {
        let stats = canonicalize(module)?;
        self.stats.accumulate(&stats);
        Ok(stats.total() > 0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{verify, ConstValue, ElemType, Encoding, OpBuilder, ScalarType, Type};

    fn enc_a() -> Encoding {
        Encoding::blocked(&[1], &[32], &[4], &[0])
    }

    fn enc_b() -> Encoding {
        Encoding::blocked(&[4], &[32], &[1], &[0])
    }

    fn f32_tensor(enc: Encoding) -> Type {
        Type::tensor(&[128], ElemType::Scalar(ScalarType::F32), enc)
    }

    fn count(m: &Module, kind: OpKind) -> usize {
        m.walk().into_iter().filter(|&op| m.op(op).kind == kind).count()
    }

    #[test]
    fn test_identity_conversion_removed() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let base = b.param(Type::ptr(ScalarType::F32));
        let ptrs = b.splat(base, &[128], enc_a()).unwrap();
        let offs = b.make_range(0, 128, enc_a()).unwrap();
        let addrs = b.add_ptr(ptrs, offs).unwrap();
        let x = b.load(addrs, None, None).unwrap();
        let same = b.convert(x, enc_a()).unwrap();
        b.store(addrs, same, None).unwrap();

        let stats = canonicalize(&mut m).unwrap();
        assert_eq!(stats.identities_removed, 1);
        assert_eq!(count(&m, OpKind::ConvertLayout), 0);
        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_chain_collapses_to_single_conversion() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let base = b.param(Type::ptr(ScalarType::F32));
        let ptrs = b.splat(base, &[128], enc_a()).unwrap();
        let offs = b.make_range(0, 128, enc_a()).unwrap();
        let addrs = b.add_ptr(ptrs, offs).unwrap();
        let x = b.load(addrs, None, None).unwrap();
        let other = Encoding::blocked(&[2], &[32], &[2], &[0]);
        let mid = b.convert(x, other).unwrap();
        let out = b.convert(mid, enc_b()).unwrap();
        let sum = b.add(out, out).unwrap();
        let back = b.convert(sum, enc_a()).unwrap();
        b.store(addrs, back, None).unwrap();

        let stats = canonicalize(&mut m).unwrap();
        assert_eq!(stats.chains_collapsed, 1);
        let out_cvt = m.defining_op(out).unwrap();
        assert_eq!(m.op(out_cvt).operands[0], x);
        // The intermediate conversion is dead afterwards.
        assert_eq!(count(&m, OpKind::ConvertLayout), 2);
        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_layout_source_refolded() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let base = b.param(Type::ptr(ScalarType::F32));
        let c = b.constant(ConstValue::float(1.0), f32_tensor(enc_a())).unwrap();
        let c_b = b.convert(c, enc_b()).unwrap();
        let ptrs = b.splat(base, &[128], enc_b()).unwrap();
        let offs = b.make_range(0, 128, enc_b()).unwrap();
        let addrs = b.add_ptr(ptrs, offs).unwrap();
        b.store(addrs, c_b, None).unwrap();

        let stats = canonicalize(&mut m).unwrap();
        assert_eq!(stats.sources_refolded, 1);
        assert_eq!(count(&m, OpKind::ConvertLayout), 0);
        // The original constant in A is dead and erased.
        assert_eq!(count(&m, OpKind::Constant(ConstValue::float(1.0))), 1);
        assert_eq!(verify(&m), Ok(()));
    }

    #[test]
    fn test_dead_code_keeps_side_effects() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let base = b.param(Type::ptr(ScalarType::F32));
        let ptrs = b.splat(base, &[128], enc_a()).unwrap();
        let offs = b.make_range(0, 128, enc_a()).unwrap();
        let addrs = b.add_ptr(ptrs, offs).unwrap();
        let x = b.load(addrs, None, None).unwrap();
        b.mul(x, x).unwrap();
        b.store(addrs, x, None).unwrap();

        let stats = canonicalize(&mut m).unwrap();
        assert_eq!(stats.dead_erased, 1);
        assert_eq!(count(&m, OpKind::Store), 1);
        assert_eq!(count(&m, OpKind::Load), 1);
    }

    #[test]
    fn test_pass_reports_changes_once() {
        let mut m = Module::default();
        let mut b = OpBuilder::at_body_end(&mut m);
        let c = b.constant(ConstValue::float(0.0), f32_tensor(enc_a())).unwrap();
        b.add(c, c).unwrap();

        let mut pass = Canonicalize::new();
        assert_eq!(pass.name(), "canonicalize");
        assert_eq!(pass.run(&mut m), Ok(true));
        assert_eq!(pass.run(&mut m), Ok(false));
        assert_eq!(pass.stats().dead_erased, 2);
        assert!(m.walk().is_empty());
    }
}
