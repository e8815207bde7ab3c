//! Element, tensor and pointer types.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use tlc_layout::Layout;

/// Tensor shape: static extents, outermost first.
pub type Shape = SmallVec<[u32; 4]>;

/// Numeric element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 1-bit boolean.
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 8-bit float, 5 exponent bits and 2 mantissa bits.
    Float8E5M2,
    /// 16-bit floating point (half precision).
    Float16,
    /// Brain floating point (bfloat16).
    BFloat16,
    /// 32-bit floating point (single precision).
    Float32,
    /// 64-bit floating point (double precision).
    Float64,
}

impl DType {
    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::Int8 | Self::Float8E5M2 => 8,
            Self::Int16 | Self::Float16 | Self::BFloat16 => 16,
            Self::Int32 | Self::Float32 => 32,
            Self::Int64 | Self::Float64 => 64,
        }
    }

    /// Size in bytes of one stored element.
    #[must_use]
    pub const fn size_bytes(self) -> u32 {
        match self {
            Self::Bool => 1,
            other => other.bits() / 8,
        }
    }

    /// Returns true if this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float8E5M2 | Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64
        )
    }

    /// Returns true if this is an integer type (booleans included).
    #[must_use]
    pub const fn is_integer(self) -> bool {
        !self.is_float()
    }

    /// IR spelling.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Bool => "i1",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Float8E5M2 => "f8E5M2",
            Self::Float16 => "f16",
            Self::BFloat16 => "bf16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Element of a scalar or tensor: a number or a global pointer to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    /// A number.
    Scalar(DType),
    /// A pointer into global memory (address space 1).
    Ptr(DType),
}

impl ElemType {
    /// Width in bits; pointers are 64 bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Scalar(d) => d.bits(),
            Self::Ptr(_) => 64,
        }
    }

    /// The pointee of a pointer.
    #[must_use]
    pub const fn pointee(self) -> Option<DType> {
        match self {
            Self::Ptr(d) => Some(d),
            Self::Scalar(_) => None,
        }
    }

    /// The numeric type, if this is not a pointer.
    #[must_use]
    pub const fn dtype(self) -> Option<DType> {
        match self {
            Self::Scalar(d) => Some(d),
            Self::Ptr(_) => None,
        }
    }

    /// Check if this is a pointer.
    #[must_use]
    pub const fn is_ptr(self) -> bool {
        matches!(self, Self::Ptr(_))
    }
}

impl From<DType> for ElemType {
    fn from(dtype: DType) -> Self {
        Self::Scalar(dtype)
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(d) => write!(f, "{d}"),
            Self::Ptr(d) => write!(f, "!tt.ptr<{d}>"),
        }
    }
}

/// A ranked tensor, optionally carrying a layout encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    /// Static shape.
    pub shape: Shape,
    /// Element type.
    pub elem: ElemType,
    /// Layout, once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Layout>,
}

impl TensorType {
    /// A tensor without an encoding.
    #[must_use]
    pub fn new(shape: impl Into<Shape>, elem: impl Into<ElemType>) -> Self {
        Self {
            shape: shape.into(),
            elem: elem.into(),
            encoding: None,
        }
    }

    /// Tensor rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().map(|&d| u64::from(d)).product()
    }
}

/// A block pointer (`!tt.ptr<tensor<...>>`) describing a 2-D tile of a
/// strided global tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPtrType {
    /// Tile shape.
    pub shape: Shape,
    /// Pointee element type.
    pub elem: DType,
}

/// The type of an SSA value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// A scalar number or pointer.
    Scalar(ElemType),
    /// A tensor.
    Tensor(TensorType),
    /// A block pointer.
    BlockPtr(BlockPtrType),
}

impl Type {
    /// A scalar number.
    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::Scalar(ElemType::Scalar(dtype))
    }

    /// A scalar pointer.
    #[must_use]
    pub fn ptr(pointee: DType) -> Self {
        Self::Scalar(ElemType::Ptr(pointee))
    }

    /// A tensor without an encoding.
    #[must_use]
    pub fn tensor(shape: &[u32], elem: impl Into<ElemType>) -> Self {
        Self::Tensor(TensorType::new(shape, elem))
    }

    /// Get the tensor type, if this is one.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Get the tensor type mutably, if this is one.
    pub fn as_tensor_mut(&mut self) -> Option<&mut TensorType> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Check if this is a tensor.
    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor(_))
    }

    /// Tensor shape; empty for scalars.
    #[must_use]
    pub fn shape(&self) -> &[u32] {
        match self {
            Self::Tensor(t) => &t.shape,
            Self::BlockPtr(b) => &b.shape,
            Self::Scalar(_) => &[],
        }
    }

    /// Element type of a scalar or tensor.
    #[must_use]
    pub fn elem(&self) -> Option<ElemType> {
        match self {
            Self::Scalar(e) => Some(*e),
            Self::Tensor(t) => Some(t.elem),
            Self::BlockPtr(_) => None,
        }
    }

    /// Layout of a tensor.
    #[must_use]
    pub fn encoding(&self) -> Option<&Layout> {
        self.as_tensor().and_then(|t| t.encoding.as_ref())
    }

    /// The same type with a different layout; non-tensors are unchanged.
    #[must_use]
    pub fn with_encoding(&self, layout: Option<Layout>) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(TensorType {
                encoding: layout,
                ..t.clone()
            }),
            other => other.clone(),
        }
    }

    /// Compare ignoring layouts.
    #[must_use]
    pub fn same_modulo_encoding(&self, other: &Self) -> bool {
        self.with_encoding(None) == other.with_encoding(None)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<")?;
        for dim in &self.shape {
            write!(f, "{dim}x")?;
        }
        write!(f, "{}", self.elem)?;
        if let Some(layout) = &self.encoding {
            write!(f, ", {layout}")?;
        }
        write!(f, ">")
    }
}

impl fmt::Display for BlockPtrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!tt.ptr<tensor<")?;
        for dim in &self.shape {
            write!(f, "{dim}x")?;
        }
        write!(f, "{}>>", self.elem)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(e) => write!(f, "{e}"),
            Self::Tensor(t) => write!(f, "{t}"),
            Self::BlockPtr(b) => write!(f, "{b}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Float32.size_bytes(), 4);
        assert_eq!(DType::Float16.size_bytes(), 2);
        assert_eq!(DType::Bool.size_bytes(), 1);
        assert_eq!(DType::Bool.bits(), 1);
        assert_eq!(ElemType::Ptr(DType::Float16).bits(), 64);
    }

    #[test]
    fn test_type_display() {
        assert_eq!(Type::tensor(&[64, 64], DType::Float32).to_string(), "tensor<64x64xf32>");
        assert_eq!(
            Type::tensor(&[16], ElemType::Ptr(DType::Float16)).to_string(),
            "tensor<16x!tt.ptr<f16>>"
        );
        let block = Type::BlockPtr(BlockPtrType {
            shape: Shape::from_slice(&[64, 32]),
            elem: DType::Float16,
        });
        assert_eq!(block.to_string(), "!tt.ptr<tensor<64x32xf16>>");
        assert_eq!(Type::scalar(DType::Int32).to_string(), "i32");
    }

    #[test]
    fn test_same_modulo_encoding() {
        let a = Type::tensor(&[8], DType::Float32);
        let layout = tlc_layout::BlockedLayout::default_for(&[8], &tlc_layout::LayoutConfig::new(1, 8, 1))
            .unwrap();
        let b = a.with_encoding(Some(layout.into()));
        assert_ne!(a, b);
        assert!(a.same_modulo_encoding(&b));
        assert!(!a.same_modulo_encoding(&Type::tensor(&[8], DType::Float16)));
    }
}
