//! Layout encodings for tensor values.
//!
//! An encoding describes how the elements of a tensor are physically
//! distributed across threads, warps and shared memory. Encodings compare
//! structurally: two independently constructed encodings with the same
//! parameters are the same layout.
//!
//! ```text
//!   Blocked ──┬── Slice(dim, parent)        one dimension removed
//!   Mma ──────┼── DotOperand(idx, parent)   operand of a tensor-core dot
//!             └── (any distributed layout)
//!   Shared                                  swizzled shared memory
//! ```

use std::fmt;

use smallvec::SmallVec;

/// Per-dimension layout parameters.
pub type LayoutDims = SmallVec<[u32; 4]>;

// =============================================================================
// Encoding Variants
// =============================================================================

/// Register layout where each thread owns a contiguous block of elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockedEncoding {
    pub size_per_thread: LayoutDims,
    pub threads_per_warp: LayoutDims,
    pub warps_per_cta: LayoutDims,
    /// Dimension order, fastest varying first.
    pub order: LayoutDims,
}

/// Parent layout with dimension `dim` removed (the result of a reduction).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceEncoding {
    pub dim: u32,
    pub parent: Box<Encoding>,
}

/// Tensor-core accumulator layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MmaEncoding {
    pub version_major: u32,
    pub warps_per_cta: LayoutDims,
}

/// Layout required for operand `op_idx` of a dot whose result is `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DotOperandEncoding {
    pub op_idx: u32,
    pub parent: Box<Encoding>,
}

/// Swizzled shared-memory layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedEncoding {
    pub vec: u32,
    pub per_phase: u32,
    pub max_phase: u32,
    pub order: LayoutDims,
}

/// A tensor layout encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    Blocked(BlockedEncoding),
    Slice(SliceEncoding),
    Mma(MmaEncoding),
    DotOperand(DotOperandEncoding),
    Shared(SharedEncoding),
}

impl Encoding {
    /// Create a blocked encoding.
    pub fn blocked(
        size_per_thread: &[u32],
        threads_per_warp: &[u32],
        warps_per_cta: &[u32],
        order: &[u32],
    ) -> Self {
        Encoding::Blocked(BlockedEncoding {
            size_per_thread: LayoutDims::from_slice(size_per_thread),
            threads_per_warp: LayoutDims::from_slice(threads_per_warp),
            warps_per_cta: LayoutDims::from_slice(warps_per_cta),
            order: LayoutDims::from_slice(order),
        })
    }

    /// Create a slice of `parent` along `dim`.
    pub fn slice(dim: u32, parent: Encoding) -> Self {
        Encoding::Slice(SliceEncoding {
            dim,
            parent: Box::new(parent),
        })
    }

    pub fn mma(version_major: u32, warps_per_cta: &[u32]) -> Self {
        Encoding::Mma(MmaEncoding {
            version_major,
            warps_per_cta: LayoutDims::from_slice(warps_per_cta),
        })
    }

    /// Create the operand layout for dot operand `op_idx` (0 = lhs, 1 = rhs).
    pub fn dot_operand(op_idx: u32, parent: Encoding) -> Self {
        Encoding::DotOperand(DotOperandEncoding {
            op_idx,
            parent: Box::new(parent),
        })
    }

    pub fn shared(vec: u32, per_phase: u32, max_phase: u32, order: &[u32]) -> Self {
        Encoding::Shared(SharedEncoding {
            vec,
            per_phase,
            max_phase,
            order: LayoutDims::from_slice(order),
        })
    }

    /// Check if this layout lives in shared memory.
    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self, Encoding::Shared(_))
    }

    #[inline]
    pub fn is_dot_operand(&self) -> bool {
        matches!(self, Encoding::DotOperand(_))
    }

    /// Check if this layout distributes elements across thread registers.
    #[inline]
    pub fn is_distributed(&self) -> bool {
        !self.is_shared()
    }

    /// Get the slice parameters if this is a slice layout.
    #[inline]
    pub fn as_slice(&self) -> Option<&SliceEncoding> {
        match self {
            Encoding::Slice(s) => Some(s),
            _ => None,
        }
    }

    /// Get the shared-memory parameters if this is a shared layout.
    #[inline]
    pub fn as_shared(&self) -> Option<&SharedEncoding> {
        match self {
            Encoding::Shared(s) => Some(s),
            _ => None,
        }
    }
}

// =============================================================================
// Display
// =============================================================================

fn write_dims(f: &mut fmt::Formatter<'_>, dims: &[u32]) -> fmt::Result {
    write!(f, "[")?;
    for (i, d) in dims.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", d)?;
    }
    write!(f, "]")
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Blocked(b) => {
                write!(f, "#blocked<")?;
                write_dims(f, &b.size_per_thread)?;
                write!(f, ", ")?;
                write_dims(f, &b.threads_per_warp)?;
                write!(f, ", ")?;
                write_dims(f, &b.warps_per_cta)?;
                write!(f, ", ")?;
                write_dims(f, &b.order)?;
                write!(f, ">")
            }
            Encoding::Slice(s) => write!(f, "#slice<{}, {}>", s.dim, s.parent),
            Encoding::Mma(m) => {
                write!(f, "#mma<v{}, ", m.version_major)?;
                write_dims(f, &m.warps_per_cta)?;
                write!(f, ">")
            }
            Encoding::DotOperand(d) => write!(f, "#dot_op<{}, {}>", d.op_idx, d.parent),
            Encoding::Shared(s) => {
                write!(f, "#shared<{}, {}, {}, ", s.vec, s.per_phase, s.max_phase)?;
                write_dims(f, &s.order)?;
                write!(f, ">")
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
