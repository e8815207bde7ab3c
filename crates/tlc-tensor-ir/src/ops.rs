//! Operation kinds and their typing rules.

use crate::types::{BlockPtrType, DType, ElemType, Shape, TensorType, Type};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Elementwise unary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Negation.
    Neg,
    /// Absolute value.
    Abs,
    /// Square root.
    Sqrt,
    /// Reciprocal square root.
    Rsqrt,
    /// Exponential.
    Exp,
    /// Base-2 exponential.
    Exp2,
    /// Natural logarithm.
    Log,
    /// Base-2 logarithm.
    Log2,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
    /// Hyperbolic tangent.
    Tanh,
    /// Ceiling.
    Ceil,
    /// Floor.
    Floor,
    /// Bitwise not (integers).
    Not,
}

impl UnaryOp {
    /// Check if the operation is only defined on floats.
    #[must_use]
    pub const fn is_float_only(self) -> bool {
        !matches!(self, Self::Neg | Self::Abs | Self::Not)
    }

    /// IR spelling for an operand of element type `dtype`.
    #[must_use]
    pub const fn mnemonic(self, dtype: DType) -> &'static str {
        let float = dtype.is_float();
        match self {
            Self::Neg if float => "arith.negf",
            Self::Neg => "arith.negi",
            Self::Abs if float => "math.absf",
            Self::Abs => "math.absi",
            Self::Sqrt => "math.sqrt",
            Self::Rsqrt => "math.rsqrt",
            Self::Exp => "math.exp",
            Self::Exp2 => "math.exp2",
            Self::Log => "math.log",
            Self::Log2 => "math.log2",
            Self::Sin => "math.sin",
            Self::Cos => "math.cos",
            Self::Tanh => "math.tanh",
            Self::Ceil => "math.ceil",
            Self::Floor => "math.floor",
            Self::Not => "arith.not",
        }
    }
}

/// Elementwise binary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
    /// Equality.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Left shift.
    Shl,
    /// Arithmetic right shift.
    Shr,
}

impl BinaryOp {
    /// Check if the operation produces booleans.
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Check if the operation is only defined on integers.
    #[must_use]
    pub const fn is_integer_only(self) -> bool {
        matches!(
            self,
            Self::And | Self::Or | Self::Xor | Self::Shl | Self::Shr
        )
    }

    /// IR spelling for operands of element type `dtype`.
    #[must_use]
    pub const fn mnemonic(self, dtype: DType) -> &'static str {
        let float = dtype.is_float();
        match self {
            Self::Add if float => "arith.addf",
            Self::Add => "arith.addi",
            Self::Sub if float => "arith.subf",
            Self::Sub => "arith.subi",
            Self::Mul if float => "arith.mulf",
            Self::Mul => "arith.muli",
            Self::Div if float => "arith.divf",
            Self::Div => "arith.divsi",
            Self::Rem if float => "arith.remf",
            Self::Rem => "arith.remsi",
            Self::Max if float => "arith.maxnumf",
            Self::Max => "arith.maxsi",
            Self::Min if float => "arith.minnumf",
            Self::Min => "arith.minsi",
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge if float => {
                "arith.cmpf"
            }
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => "arith.cmpi",
            Self::And => "arith.andi",
            Self::Or => "arith.ori",
            Self::Xor => "arith.xori",
            Self::Shl => "arith.shli",
            Self::Shr => "arith.shrsi",
        }
    }

    /// Comparison predicate spelling.
    #[must_use]
    pub const fn predicate(self, dtype: DType) -> Option<&'static str> {
        let float = dtype.is_float();
        Some(match self {
            Self::Eq if float => "oeq",
            Self::Eq => "eq",
            Self::Ne if float => "une",
            Self::Ne => "ne",
            Self::Lt if float => "olt",
            Self::Lt => "slt",
            Self::Le if float => "ole",
            Self::Le => "sle",
            Self::Gt if float => "ogt",
            Self::Gt => "sgt",
            Self::Ge if float => "oge",
            Self::Ge => "sge",
            _ => return None,
        })
    }
}

/// Reduction combiners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Sum reduction.
    Sum,
    /// Product reduction.
    Prod,
    /// Maximum reduction.
    Max,
    /// Minimum reduction.
    Min,
    /// Logical and.
    All,
    /// Logical or.
    Any,
}

impl ReduceOp {
    /// The binary operation combining two partial results.
    #[must_use]
    pub const fn combiner(self) -> BinaryOp {
        match self {
            Self::Sum => BinaryOp::Add,
            Self::Prod => BinaryOp::Mul,
            Self::Max => BinaryOp::Max,
            Self::Min => BinaryOp::Min,
            Self::All => BinaryOp::And,
            Self::Any => BinaryOp::Or,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Prod => "prod",
            Self::Max => "max",
            Self::Min => "min",
            Self::All => "all",
            Self::Any => "any",
        }
    }
}

/// Cache modifier of a global memory access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheModifier {
    /// No modifier.
    #[default]
    None,
    /// Cache at all levels.
    Ca,
    /// Cache at the global level only.
    Cg,
    /// Write back.
    Wb,
    /// Streaming, likely accessed once.
    Cs,
    /// Write through.
    Wt,
}

impl CacheModifier {
    /// IR spelling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ca => "ca",
            Self::Cg => "cg",
            Self::Wb => "wb",
            Self::Cs => "cs",
            Self::Wt => "wt",
        }
    }
}

/// Eviction policy of a global memory access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Default policy.
    #[default]
    Normal,
    /// Evict first.
    EvictFirst,
    /// Evict last.
    EvictLast,
}

impl EvictionPolicy {
    /// IR spelling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::EvictFirst => "evict_first",
            Self::EvictLast => "evict_last",
        }
    }
}

/// Value of out-of-bounds elements of a boundary-checked block load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Zeros.
    Zero,
    /// NaNs.
    Nan,
}

/// Attributes shared by loads and stores.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MemAttrs {
    /// Cache modifier.
    pub cache: CacheModifier,
    /// Eviction policy.
    pub eviction: EvictionPolicy,
    /// Volatile access.
    pub is_volatile: bool,
    /// Dimensions of a block pointer access checked against the tensor bounds.
    pub boundary_check: Vec<u32>,
    /// Fill value for checked-out elements of a block load.
    pub padding: Option<Padding>,
}

/// A constant payload.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    /// Integer or boolean.
    Int(i64),
    /// Floating point.
    Float(f64),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => {
                // MLIR spelling: 1.000000e+00.
                let text = format!("{v:.6e}");
                match text.split_once('e') {
                    Some((mantissa, exp)) => {
                        let exp: i32 = exp.parse().unwrap_or(0);
                        let sign = if exp < 0 { '-' } else { '+' };
                        write!(f, "{mantissa}e{sign}{:02}", exp.abs())
                    }
                    None => f.write_str(&text),
                }
            }
        }
    }
}

/// Operation kinds.
///
/// Operand conventions:
///
/// | Kind | Operands |
/// |------|----------|
/// | `Load` | ptr, mask?, other? |
/// | `Store` | ptr, value, mask? |
/// | `MakeTensorPtr` | base, shape x rank, strides x rank, offsets x rank |
/// | `Advance` | block ptr, offsets x rank |
/// | `Dot` | a, b, c |
/// | `Select` | condition, true value, false value |
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Index of this program instance along `axis`.
    GetProgramId {
        /// Grid axis (0, 1 or 2).
        axis: u32,
    },
    /// Number of program instances along `axis`.
    GetNumPrograms {
        /// Grid axis (0, 1 or 2).
        axis: u32,
    },
    /// `[start, end)` as a 1-D i32 tensor.
    MakeRange {
        /// First value.
        start: i32,
        /// One past the last value.
        end: i32,
    },
    /// Scalar to tensor.
    Splat {
        /// Result shape.
        shape: Shape,
    },
    /// Stretch unit dimensions.
    Broadcast {
        /// Result shape.
        shape: Shape,
    },
    /// Insert a unit dimension at `axis`.
    ExpandDims {
        /// New dimension position.
        axis: u32,
    },
    /// Permute dimensions: result dimension `i` is operand dimension `order[i]`.
    Trans {
        /// Permutation.
        order: Vec<u32>,
    },
    /// A scalar constant, or a tensor filled with one value.
    Constant {
        /// Payload.
        value: ConstValue,
        /// Result type.
        ty: Type,
    },
    /// Elementwise unary operation.
    Unary(UnaryOp),
    /// Elementwise binary operation.
    Binary(BinaryOp),
    /// Elementwise numeric conversion.
    Cast {
        /// Target element type.
        to: DType,
    },
    /// Pointer plus element offset.
    AddPtr,
    /// Elementwise choice.
    Select,
    /// Global memory load.
    Load(MemAttrs),
    /// Global memory store.
    Store(MemAttrs),
    /// Build a block pointer.
    MakeTensorPtr {
        /// Tile shape.
        shape: Shape,
        /// Dimension order of the tile, fastest first.
        order: Vec<u32>,
    },
    /// Move a block pointer by per-dimension offsets.
    Advance,
    /// Matrix multiply-accumulate `a * b + c`.
    Dot,
    /// Reduce one axis.
    Reduce {
        /// Reduced axis.
        axis: u32,
        /// Combiner.
        op: ReduceOp,
    },
    /// Change the layout of a tensor.
    ConvertLayout,
    /// End of the kernel.
    Return,
}

impl OpKind {
    /// Operation name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetProgramId { .. } => "tt.get_program_id",
            Self::GetNumPrograms { .. } => "tt.get_num_programs",
            Self::MakeRange { .. } => "tt.make_range",
            Self::Splat { .. } => "tt.splat",
            Self::Broadcast { .. } => "tt.broadcast",
            Self::ExpandDims { .. } => "tt.expand_dims",
            Self::Trans { .. } => "tt.trans",
            Self::Constant { .. } => "arith.constant",
            Self::Unary(_) => "elementwise.unary",
            Self::Binary(_) => "elementwise.binary",
            Self::Cast { .. } => "arith.cast",
            Self::AddPtr => "tt.addptr",
            Self::Select => "arith.select",
            Self::Load(_) => "tt.load",
            Self::Store(_) => "tt.store",
            Self::MakeTensorPtr { .. } => "tt.make_tensor_ptr",
            Self::Advance => "tt.advance",
            Self::Dot => "tt.dot",
            Self::Reduce { .. } => "tt.reduce",
            Self::ConvertLayout => "ttg.convert_layout",
            Self::Return => "tt.return",
        }
    }

    /// Elementwise operations: every tensor operand and the result share one
    /// layout.
    #[must_use]
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Self::Unary(_) | Self::Binary(_) | Self::Cast { .. } | Self::AddPtr | Self::Select
        )
    }

    /// Operations touching global memory.
    #[must_use]
    pub fn is_memory_access(&self) -> bool {
        matches!(self, Self::Load(_) | Self::Store(_))
    }

    /// Check if the operation has effects beyond its results.
    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Return)
            || matches!(self, Self::Load(attrs) if attrs.is_volatile)
    }
}

/// Compute the result types of `kind` applied to operands of `operands`,
/// ignoring layouts.
///
/// # Errors
///
/// Returns a description of the first typing rule the operands break.
pub fn result_types(kind: &OpKind, operands: &[&Type]) -> Result<SmallVec<[Type; 1]>, String> {
    let arity = |n: usize| -> Result<(), String> {
        if operands.len() == n {
            Ok(())
        } else {
            Err(format!("expects {n} operands, found {}", operands.len()))
        }
    };
    let one = |ty: Type| -> Result<SmallVec<[Type; 1]>, String> { Ok(smallvec![ty]) };

    match kind {
        OpKind::GetProgramId { axis } | OpKind::GetNumPrograms { axis } => {
            arity(0)?;
            if *axis > 2 {
                return Err(format!("grid axis {axis} out of range"));
            }
            one(Type::scalar(DType::Int32))
        }
        OpKind::MakeRange { start, end } => {
            arity(0)?;
            if end <= start {
                return Err(format!("empty range [{start}, {end})"));
            }
            let len = u32::try_from(i64::from(*end) - i64::from(*start))
                .map_err(|_| "range too large".to_string())?;
            one(Type::tensor(&[len], DType::Int32))
        }
        OpKind::Splat { shape } => {
            arity(1)?;
            check_shape(shape)?;
            match operands[0] {
                Type::Scalar(elem) => one(Type::tensor(shape, *elem)),
                other => Err(format!("splat of non-scalar {other}")),
            }
        }
        OpKind::Broadcast { shape } => {
            arity(1)?;
            check_shape(shape)?;
            let src = expect_tensor(operands[0])?;
            if src.rank() != shape.len() {
                return Err(format!(
                    "broadcast changes rank from {} to {}",
                    src.rank(),
                    shape.len()
                ));
            }
            for (&from, &to) in src.shape.iter().zip(shape) {
                if from != to && from != 1 {
                    return Err(format!("cannot broadcast dimension {from} to {to}"));
                }
            }
            one(Type::tensor(shape, src.elem))
        }
        OpKind::ExpandDims { axis } => {
            arity(1)?;
            let src = expect_tensor(operands[0])?;
            if *axis as usize > src.rank() {
                return Err(format!("axis {axis} out of range for rank {}", src.rank()));
            }
            let mut shape = src.shape.clone();
            shape.insert(*axis as usize, 1);
            one(Type::tensor(&shape, src.elem))
        }
        OpKind::Trans { order } => {
            arity(1)?;
            let src = expect_tensor(operands[0])?;
            if !is_permutation(order, src.rank()) {
                return Err(format!("{order:?} is not a permutation of rank {}", src.rank()));
            }
            let shape: Shape = order.iter().map(|&d| src.shape[d as usize]).collect();
            one(Type::tensor(&shape, src.elem))
        }
        OpKind::Constant { value, ty } => {
            arity(0)?;
            let elem = ty.elem().ok_or("constant of block pointer type")?;
            match (elem, value) {
                (ElemType::Scalar(d), ConstValue::Int(_)) if d.is_integer() => {}
                (ElemType::Scalar(d), ConstValue::Float(_)) if d.is_float() => {}
                _ => return Err(format!("constant {value} does not fit {elem}")),
            }
            if ty.is_tensor() {
                check_shape(ty.shape())?;
            }
            one(ty.with_encoding(None))
        }
        OpKind::Unary(op) => {
            arity(1)?;
            let dtype = numeric_elem(operands[0])?;
            if op.is_float_only() && !dtype.is_float() {
                return Err(format!("{op:?} requires a float operand, found {dtype}"));
            }
            if *op == UnaryOp::Not && dtype.is_float() {
                return Err("bitwise not of a float".to_string());
            }
            one(operands[0].with_encoding(None))
        }
        OpKind::Binary(op) => {
            arity(2)?;
            if !operands[0].same_modulo_encoding(operands[1]) {
                return Err(format!(
                    "operand types differ: {} and {}",
                    operands[0], operands[1]
                ));
            }
            let dtype = numeric_elem(operands[0])?;
            if op.is_integer_only() && dtype.is_float() {
                return Err(format!("{op:?} requires integer operands, found {dtype}"));
            }
            if op.is_comparison() {
                one(with_elem(operands[0], ElemType::Scalar(DType::Bool)))
            } else {
                one(operands[0].with_encoding(None))
            }
        }
        OpKind::Cast { to } => {
            arity(1)?;
            numeric_elem(operands[0])?;
            one(with_elem(operands[0], ElemType::Scalar(*to)))
        }
        OpKind::AddPtr => {
            arity(2)?;
            let ptr = operands[0].elem().filter(|e| e.is_ptr());
            let offset = operands[1].elem().and_then(ElemType::dtype);
            match (ptr, offset) {
                (Some(_), Some(d)) if d.is_integer() && d != DType::Bool => {}
                _ => {
                    return Err(format!(
                        "expects a pointer and an integer offset, found {} and {}",
                        operands[0], operands[1]
                    ))
                }
            }
            if operands[0].shape() != operands[1].shape() {
                return Err("pointer and offset shapes differ".to_string());
            }
            one(operands[0].with_encoding(None))
        }
        OpKind::Select => {
            arity(3)?;
            if operands[0].elem() != Some(ElemType::Scalar(DType::Bool)) {
                return Err(format!("condition must be i1, found {}", operands[0]));
            }
            if !operands[1].same_modulo_encoding(operands[2]) {
                return Err(format!(
                    "branch types differ: {} and {}",
                    operands[1], operands[2]
                ));
            }
            let cond = operands[0].shape();
            let result = operands[1].shape();
            if cond.len() > result.len() || !result.ends_with_broadcastable(cond) {
                return Err(format!(
                    "condition shape {cond:?} does not broadcast to {result:?}"
                ));
            }
            one(operands[1].with_encoding(None))
        }
        OpKind::Load(attrs) => {
            if operands.is_empty() || operands.len() > 3 {
                return Err(format!("expects 1 to 3 operands, found {}", operands.len()));
            }
            let loaded = match operands[0] {
                Type::BlockPtr(block) => {
                    if operands.len() > 1 {
                        return Err("block pointer loads take no mask".to_string());
                    }
                    check_boundary(&attrs.boundary_check, block.shape.len())?;
                    Type::tensor(&block.shape, block.elem)
                }
                Type::Scalar(ElemType::Ptr(pointee)) => Type::scalar(*pointee),
                Type::Tensor(TensorType {
                    shape,
                    elem: ElemType::Ptr(pointee),
                    ..
                }) => Type::tensor(shape, *pointee),
                other => return Err(format!("load from non-pointer {other}")),
            };
            if !matches!(operands[0], Type::BlockPtr(_))
                && (!attrs.boundary_check.is_empty() || attrs.padding.is_some())
            {
                return Err("boundary checks need a block pointer".to_string());
            }
            if let Some(mask) = operands.get(1) {
                check_mask(mask, loaded.shape())?;
            }
            if let Some(other) = operands.get(2) {
                if !other.same_modulo_encoding(&loaded) {
                    return Err(format!("other has type {other}, expected {loaded}"));
                }
            }
            one(loaded)
        }
        OpKind::Store(attrs) => {
            if operands.len() < 2 || operands.len() > 3 {
                return Err(format!("expects 2 or 3 operands, found {}", operands.len()));
            }
            let stored = match operands[0] {
                Type::BlockPtr(block) => {
                    if operands.len() > 2 {
                        return Err("block pointer stores take no mask".to_string());
                    }
                    check_boundary(&attrs.boundary_check, block.shape.len())?;
                    Type::tensor(&block.shape, block.elem)
                }
                Type::Scalar(ElemType::Ptr(pointee)) => Type::scalar(*pointee),
                Type::Tensor(TensorType {
                    shape,
                    elem: ElemType::Ptr(pointee),
                    ..
                }) => Type::tensor(shape, *pointee),
                other => return Err(format!("store to non-pointer {other}")),
            };
            if !operands[1].same_modulo_encoding(&stored) {
                return Err(format!("stored value has type {}, expected {stored}", operands[1]));
            }
            if let Some(mask) = operands.get(2) {
                check_mask(mask, stored.shape())?;
            }
            Ok(SmallVec::new())
        }
        OpKind::MakeTensorPtr { shape, order } => {
            let rank = shape.len();
            check_shape(shape)?;
            arity(1 + 3 * rank)?;
            if !is_permutation(order, rank) {
                return Err(format!("{order:?} is not a permutation of rank {rank}"));
            }
            let Type::Scalar(ElemType::Ptr(pointee)) = operands[0] else {
                return Err(format!("base must be a scalar pointer, found {}", operands[0]));
            };
            for (i, ty) in operands[1..].iter().enumerate() {
                let expected = if i < 2 * rank { DType::Int64 } else { DType::Int32 };
                if **ty != Type::scalar(expected) {
                    return Err(format!("operand {} must be {expected}, found {ty}", i + 1));
                }
            }
            one(Type::BlockPtr(BlockPtrType {
                shape: shape.clone(),
                elem: *pointee,
            }))
        }
        OpKind::Advance => {
            let Some(Type::BlockPtr(block)) = operands.first() else {
                return Err("advance of a non block pointer".to_string());
            };
            arity(1 + block.shape.len())?;
            if operands[1..].iter().any(|ty| **ty != Type::scalar(DType::Int32)) {
                return Err("offsets must be i32".to_string());
            }
            one(operands[0].clone())
        }
        OpKind::Dot => {
            arity(3)?;
            let a = expect_tensor(operands[0])?;
            let b = expect_tensor(operands[1])?;
            let c = expect_tensor(operands[2])?;
            if a.rank() != 2 || b.rank() != 2 || c.rank() != 2 {
                return Err("dot operands must be rank 2".to_string());
            }
            if a.shape[0] != c.shape[0] || b.shape[1] != c.shape[1] {
                return Err(format!(
                    "accumulator shape {:?} does not match {}x{}",
                    c.shape, a.shape[0], b.shape[1]
                ));
            }
            for t in [a, b, c] {
                if t.elem.is_ptr() {
                    return Err("dot of pointers".to_string());
                }
            }
            one(operands[2].with_encoding(None))
        }
        OpKind::Reduce { axis, .. } => {
            arity(1)?;
            let src = expect_tensor(operands[0])?;
            if *axis as usize >= src.rank() {
                return Err(format!("axis {axis} out of range for rank {}", src.rank()));
            }
            if src.rank() == 1 {
                return one(Type::Scalar(src.elem));
            }
            let mut shape = src.shape.clone();
            shape.remove(*axis as usize);
            one(Type::tensor(&shape, src.elem))
        }
        OpKind::ConvertLayout => {
            arity(1)?;
            expect_tensor(operands[0])?;
            one(operands[0].with_encoding(None))
        }
        OpKind::Return => {
            arity(0)?;
            Ok(SmallVec::new())
        }
    }
}

trait BroadcastShape {
    fn ends_with_broadcastable(&self, suffix: &[u32]) -> bool;
}

impl BroadcastShape for [u32] {
    /// `suffix` aligns with the trailing dimensions of `self`, each either
    /// equal or 1.
    fn ends_with_broadcastable(&self, suffix: &[u32]) -> bool {
        let offset = self.len() - suffix.len();
        suffix
            .iter()
            .enumerate()
            .all(|(i, &d)| d == self[offset + i] || d == 1)
    }
}

/// Check that `order` is a permutation of `0..rank`.
#[must_use]
pub fn is_permutation(order: &[u32], rank: usize) -> bool {
    let mut seen = vec![false; rank];
    order.len() == rank
        && order
            .iter()
            .all(|&d| (d as usize) < rank && !std::mem::replace(&mut seen[d as usize], true))
}

fn check_shape(shape: &[u32]) -> Result<(), String> {
    if shape.is_empty() {
        Err("tensor shape is empty".to_string())
    } else if shape.contains(&0) {
        Err(format!("tensor shape {shape:?} has a zero extent"))
    } else {
        Ok(())
    }
}

fn check_boundary(dims: &[u32], rank: usize) -> Result<(), String> {
    match dims.iter().find(|&&d| d as usize >= rank) {
        Some(d) => Err(format!("boundary check dimension {d} out of range")),
        None => Ok(()),
    }
}

fn check_mask(mask: &Type, shape: &[u32]) -> Result<(), String> {
    if mask.elem() != Some(ElemType::Scalar(DType::Bool)) || mask.shape() != shape {
        return Err(format!("mask has type {mask}, expected i1 of shape {shape:?}"));
    }
    Ok(())
}

fn expect_tensor(ty: &Type) -> Result<&TensorType, String> {
    ty.as_tensor().ok_or_else(|| format!("expected a tensor, found {ty}"))
}

fn numeric_elem(ty: &Type) -> Result<DType, String> {
    ty.elem()
        .and_then(ElemType::dtype)
        .ok_or_else(|| format!("expected a numeric operand, found {ty}"))
}

fn with_elem(ty: &Type, elem: ElemType) -> Type {
    match ty {
        Type::Tensor(t) => Type::tensor(&t.shape, elem),
        _ => Type::Scalar(elem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elementwise_typing() {
        let f32x64 = Type::tensor(&[64], DType::Float32);
        let tys = result_types(&OpKind::Binary(BinaryOp::Add), &[&f32x64, &f32x64]).unwrap();
        assert_eq!(tys[0], f32x64);
        let tys = result_types(&OpKind::Binary(BinaryOp::Lt), &[&f32x64, &f32x64]).unwrap();
        assert_eq!(tys[0], Type::tensor(&[64], DType::Bool));
        let i32x64 = Type::tensor(&[64], DType::Int32);
        assert!(result_types(&OpKind::Binary(BinaryOp::Add), &[&f32x64, &i32x64]).is_err());
        assert!(result_types(&OpKind::Binary(BinaryOp::Shl), &[&f32x64, &f32x64]).is_err());
    }

    #[test]
    fn test_structural_typing() {
        let range = result_types(&OpKind::MakeRange { start: 0, end: 64 }, &[]).unwrap();
        assert_eq!(range[0], Type::tensor(&[64], DType::Int32));
        let expanded = result_types(&OpKind::ExpandDims { axis: 1 }, &[&range[0]]).unwrap();
        assert_eq!(expanded[0].shape(), &[64, 1]);
        let shape = Shape::from_slice(&[64, 32]);
        let broadcast = result_types(&OpKind::Broadcast { shape }, &[&expanded[0]]).unwrap();
        assert_eq!(broadcast[0].shape(), &[64, 32]);
        let trans = result_types(&OpKind::Trans { order: vec![1, 0] }, &[&broadcast[0]]).unwrap();
        assert_eq!(trans[0].shape(), &[32, 64]);
        let bad = Shape::from_slice(&[64, 32]);
        assert!(result_types(&OpKind::Broadcast { shape: bad }, &[&trans[0]]).is_err());
    }

    #[test]
    fn test_memory_typing() {
        let ptrs = Type::tensor(&[16, 16], ElemType::Ptr(DType::Float16));
        let mask = Type::tensor(&[16, 16], DType::Bool);
        let other = Type::tensor(&[16, 16], DType::Float16);
        let load = OpKind::Load(MemAttrs::default());
        let tys = result_types(&load, &[&ptrs, &mask, &other]).unwrap();
        assert_eq!(tys[0], other);
        let store = OpKind::Store(MemAttrs::default());
        assert!(result_types(&store, &[&ptrs, &other, &mask]).unwrap().is_empty());
        let wrong = Type::tensor(&[16, 16], DType::Float32);
        assert!(result_types(&store, &[&ptrs, &wrong]).is_err());

        let checked = OpKind::Load(MemAttrs {
            boundary_check: vec![0],
            ..MemAttrs::default()
        });
        assert!(result_types(&checked, &[&ptrs]).is_err());
    }

    #[test]
    fn test_dot_and_reduce_typing() {
        let a = Type::tensor(&[128, 32], DType::Float16);
        let b = Type::tensor(&[32, 128], DType::Float16);
        let c = Type::tensor(&[128, 128], DType::Float32);
        assert_eq!(result_types(&OpKind::Dot, &[&a, &b, &c]).unwrap()[0], c);
        let wrong_c = Type::tensor(&[128, 64], DType::Float32);
        assert!(result_types(&OpKind::Dot, &[&a, &b, &wrong_c]).is_err());

        let reduce = OpKind::Reduce {
            axis: 0,
            op: ReduceOp::Max,
        };
        assert_eq!(result_types(&reduce, &[&c]).unwrap()[0].shape(), &[128]);
        let row = Type::tensor(&[128], DType::Float32);
        assert_eq!(
            result_types(&reduce, &[&row]).unwrap()[0],
            Type::scalar(DType::Float32)
        );
    }

    #[test]
    fn test_select_condition_shapes() {
        let x = Type::tensor(&[16, 16], DType::Float32);
        let full = Type::tensor(&[16, 16], DType::Bool);
        let row = Type::tensor(&[16], DType::Bool);
        let scalar = Type::scalar(DType::Bool);
        let wrong = Type::tensor(&[8], DType::Bool);
        for cond in [&full, &row, &scalar] {
            assert!(result_types(&OpKind::Select, &[cond, &x, &x]).is_ok());
        }
        assert!(result_types(&OpKind::Select, &[&wrong, &x, &x]).is_err());
    }

    #[test]
    fn test_const_display() {
        assert_eq!(ConstValue::Int(-3).to_string(), "-3");
        assert_eq!(ConstValue::Float(0.0).to_string(), "0.000000e+00");
        assert_eq!(ConstValue::Float(-1.5).to_string(), "-1.500000e+00");
        assert_eq!(ConstValue::Float(0.125e-3).to_string(), "1.250000e-04");
    }

    #[test]
    fn test_reduce_combiners() {
        assert_eq!(ReduceOp::Sum.combiner(), BinaryOp::Add);
        assert_eq!(ReduceOp::Max.combiner(), BinaryOp::Max);
        assert_eq!(BinaryOp::Lt.predicate(DType::Float32), Some("olt"));
        assert_eq!(BinaryOp::Add.predicate(DType::Int32), None);
    }
}
