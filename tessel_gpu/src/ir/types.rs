//! Value types for the tensor IR.
//!
//! Every SSA value is either a scalar or a ranked tensor. Tensor types carry
//! their layout encoding, so two tensors with identical shape and element
//! type but different encodings are different types.

use std::fmt;

use smallvec::SmallVec;

use super::encoding::Encoding;

/// Tensor shape.
pub type Dims = SmallVec<[i64; 4]>;

// =============================================================================
// Element Types
// =============================================================================

/// Primitive scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I1,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl ScalarType {
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, ScalarType::F16 | ScalarType::F32 | ScalarType::F64)
    }

    const fn name(self) -> &'static str {
        match self {
            ScalarType::I1 => "i1",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F16 => "f16",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }
}

/// Element type of a scalar or tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    Scalar(ScalarType),
    /// Global-memory pointer to the given scalar type.
    Ptr(ScalarType),
}

impl ElemType {
    #[inline]
    pub const fn is_ptr(self) -> bool {
        matches!(self, ElemType::Ptr(_))
    }

    /// Get the pointee type if this is a pointer.
    #[inline]
    pub const fn pointee(self) -> Option<ScalarType> {
        match self {
            ElemType::Ptr(s) => Some(s),
            ElemType::Scalar(_) => None,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::Scalar(s) => write!(f, "{}", s.name()),
            ElemType::Ptr(s) => write!(f, "!ptr<{}>", s.name()),
        }
    }
}

// =============================================================================
// Tensor Type
// =============================================================================

/// Ranked tensor type with a layout encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Dims,
    pub elem: ElemType,
    pub encoding: Encoding,
}

impl TensorType {
    pub fn new(shape: &[i64], elem: ElemType, encoding: Encoding) -> Self {
        Self {
            shape: Dims::from_slice(shape),
            elem,
            encoding,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }

    /// Check shape and element type, ignoring the encoding.
    pub fn same_shape_and_elem(&self, other: &TensorType) -> bool {
        self.shape == other.shape && self.elem == other.elem
    }
}

// =============================================================================
// Value Type
// =============================================================================

/// Type of an SSA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(ElemType),
    Tensor(TensorType),
}

impl Type {
    /// Shorthand for a tensor type.
    pub fn tensor(shape: &[i64], elem: ElemType, encoding: Encoding) -> Self {
        Type::Tensor(TensorType::new(shape, elem, encoding))
    }

    #[inline]
    pub fn scalar(s: ScalarType) -> Self {
        Type::Scalar(ElemType::Scalar(s))
    }

    #[inline]
    pub fn ptr(s: ScalarType) -> Self {
        Type::Scalar(ElemType::Ptr(s))
    }

    #[inline]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    #[inline]
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            Type::Scalar(_) => None,
        }
    }

    /// Get the layout encoding if this is a tensor.
    #[inline]
    pub fn encoding(&self) -> Option<&Encoding> {
        self.as_tensor().map(|t| &t.encoding)
    }

    pub fn elem(&self) -> ElemType {
        match self {
            Type::Scalar(e) => *e,
            Type::Tensor(t) => t.elem,
        }
    }

    /// Same type with a different encoding. Scalars are returned unchanged.
    pub fn with_encoding(&self, encoding: Encoding) -> Type {
        match self {
            Type::Tensor(t) => Type::Tensor(TensorType {
                shape: t.shape.clone(),
                elem: t.elem,
                encoding,
            }),
            Type::Scalar(_) => self.clone(),
        }
    }

    /// Same type with a different element type.
    pub fn with_elem(&self, elem: ElemType) -> Type {
        match self {
            Type::Tensor(t) => Type::Tensor(TensorType {
                shape: t.shape.clone(),
                elem,
                encoding: t.encoding.clone(),
            }),
            Type::Scalar(_) => Type::Scalar(elem),
        }
    }

    /// Check whether two types agree in everything but their encoding.
    pub fn layout_compatible(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Scalar(a), Type::Scalar(b)) => a == b,
            (Type::Tensor(a), Type::Tensor(b)) => a.same_shape_and_elem(b),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(e) => write!(f, "{}", e),
            Type::Tensor(t) => {
                write!(f, "tensor<")?;
                for d in &t.shape {
                    write!(f, "{}x", d)?;
                }
                write!(f, "{}, {}>", t.elem, t.encoding)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked() -> Encoding {
        Encoding::blocked(&[1], &[32], &[4], &[0])
    }

    #[test]
    fn test_with_encoding_preserves_shape() {
        let ty = Type::tensor(&[128], ElemType::Scalar(ScalarType::F32), blocked());
        let other = Encoding::blocked(&[4], &[32], &[1], &[0]);
        let retyped = ty.with_encoding(other.clone());

        assert_eq!(retyped.encoding(), Some(&other));
        assert!(ty.layout_compatible(&retyped));
        assert_ne!(ty, retyped);
    }

    #[test]
    fn test_scalar_has_no_encoding() {
        let ty = Type::scalar(ScalarType::I32);
        assert_eq!(ty.encoding(), None);
        assert_eq!(ty.with_encoding(blocked()), ty);
    }

    #[test]
    fn test_num_elements() {
        let t = TensorType::new(&[16, 64], ElemType::Ptr(ScalarType::F16), blocked());
        assert_eq!(t.num_elements(), 1024);
        assert_eq!(t.rank(), 2);
    }

    #[test]
    fn test_display() {
        let ty = Type::tensor(&[64], ElemType::Scalar(ScalarType::F16), blocked());
        assert_eq!(ty.to_string(), "tensor<64xf16, #blocked<[1], [32], [4], [0]>>");
        assert_eq!(Type::ptr(ScalarType::F32).to_string(), "!ptr<f32>");
    }
}
