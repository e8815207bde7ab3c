//! A small SSA IR in the shape of LLVM IR.
//!
//! Registers and blocks live in arenas owned by their [`Function`]; blocks
//! are printed in [`Function::layout`] order. The printer emits textual
//! LLVM IR accepted by the AMDGPU backend.

mod builder;
mod printer;

pub use builder::Builder;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tlc_index::{define_index, IndexVec};
use tlc_tensor_ir::{DType, ElemType};

define_index! {
    /// A virtual register.
    pub struct Reg;

    /// A basic block.
    pub struct BlockId;
}

/// Address space of global memory.
pub const GLOBAL_ADDRSPACE: u32 = 1;

/// Address space of LDS (shared memory).
pub const LDS_ADDRSPACE: u32 = 3;

/// A first-class type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LlType {
    /// No value.
    Void,
    /// Integer of the given width.
    Int(u32),
    /// IEEE half.
    Half,
    /// bfloat16.
    BFloat,
    /// IEEE single.
    Float,
    /// IEEE double.
    Double,
    /// Opaque pointer in an address space.
    Ptr(u32),
    /// Fixed-length vector.
    Vector(u32, Box<LlType>),
}

impl LlType {
    /// `i1`.
    pub const I1: Self = Self::Int(1);
    /// `i8`.
    pub const I8: Self = Self::Int(8);
    /// `i32`.
    pub const I32: Self = Self::Int(32);
    /// `i64`.
    pub const I64: Self = Self::Int(64);

    /// Vector of `len` elements, or the element itself when `len` is 1.
    #[must_use]
    pub fn vector(len: u32, elem: Self) -> Self {
        if len == 1 {
            elem
        } else {
            Self::Vector(len, Box::new(elem))
        }
    }

    /// The LLVM type of a tensor-IR number.
    ///
    /// 8-bit floats have no LLVM type and travel as `i8`.
    #[must_use]
    pub fn from_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::I1,
            DType::Int8 | DType::Float8E5M2 => Self::I8,
            DType::Int16 => Self::Int(16),
            DType::Int32 => Self::I32,
            DType::Int64 => Self::I64,
            DType::Float16 => Self::Half,
            DType::BFloat16 => Self::BFloat,
            DType::Float32 => Self::Float,
            DType::Float64 => Self::Double,
        }
    }

    /// The LLVM type of a tensor-IR element.
    #[must_use]
    pub fn from_elem(elem: ElemType) -> Self {
        match elem {
            ElemType::Scalar(d) => Self::from_dtype(d),
            ElemType::Ptr(_) => Self::Ptr(GLOBAL_ADDRSPACE),
        }
    }

    /// Width in bits; pointers are 64 bits.
    #[must_use]
    pub fn bits(&self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Int(n) => *n,
            Self::Half | Self::BFloat => 16,
            Self::Float => 32,
            Self::Double | Self::Ptr(_) => 64,
            Self::Vector(n, elem) => n * elem.bits(),
        }
    }

    /// Check if this is a scalar or vector of integers.
    #[must_use]
    pub fn is_int(&self) -> bool {
        matches!(self.element(), Self::Int(_))
    }

    /// Check if this is a scalar or vector of floats.
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(
            self.element(),
            Self::Half | Self::BFloat | Self::Float | Self::Double
        )
    }

    /// The element type of a vector; other types are their own element.
    #[must_use]
    pub fn element(&self) -> &Self {
        match self {
            Self::Vector(_, elem) => elem,
            other => other,
        }
    }

    /// Short name used in mangled callee names and intrinsic suffixes.
    #[must_use]
    pub fn mangle(&self) -> String {
        match self {
            Self::Void => "void".to_string(),
            Self::Int(n) => format!("i{n}"),
            Self::Half => "f16".to_string(),
            Self::BFloat => "bf16".to_string(),
            Self::Float => "f32".to_string(),
            Self::Double => "f64".to_string(),
            Self::Ptr(space) => format!("p{space}"),
            Self::Vector(n, elem) => format!("v{n}{}", elem.mangle()),
        }
    }
}

/// An operand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// A register.
    Reg(Reg),
    /// Integer constant.
    Int(LlType, i64),
    /// Floating point constant.
    Float(LlType, f64),
    /// The all-zero value of a type.
    Zero(LlType),
    /// Undefined value.
    Undef(LlType),
    /// Address of a module global.
    Global(String, u32),
}

impl Value {
    /// An `i32` constant.
    #[must_use]
    pub fn i32(v: i64) -> Self {
        Self::Int(LlType::I32, v)
    }

    /// An `i64` constant.
    #[must_use]
    pub fn i64(v: i64) -> Self {
        Self::Int(LlType::I64, v)
    }

    /// An `i1` constant.
    #[must_use]
    pub fn bool(v: bool) -> Self {
        Self::Int(LlType::I1, i64::from(v))
    }

    /// The integer payload of a constant.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(_, v) => Some(*v),
            _ => None,
        }
    }

    /// The register, if this is one.
    #[must_use]
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Self::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

/// Integer and float arithmetic.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinOp {
    /// Instruction mnemonic.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::SDiv => "sdiv",
            Self::UDiv => "udiv",
            Self::SRem => "srem",
            Self::URem => "urem",
            Self::Shl => "shl",
            Self::LShr => "lshr",
            Self::AShr => "ashr",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::FAdd => "fadd",
            Self::FSub => "fsub",
            Self::FMul => "fmul",
            Self::FDiv => "fdiv",
            Self::FRem => "frem",
        }
    }
}

/// `icmp` predicates.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
}

impl IntPredicate {
    /// Predicate mnemonic.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Slt => "slt",
            Self::Sle => "sle",
            Self::Sgt => "sgt",
            Self::Sge => "sge",
            Self::Ult => "ult",
        }
    }
}

/// `fcmp` predicates.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FloatPredicate {
    Oeq,
    Une,
    Olt,
    Ole,
    Ogt,
    Oge,
}

impl FloatPredicate {
    /// Predicate mnemonic.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Oeq => "oeq",
            Self::Une => "une",
            Self::Olt => "olt",
            Self::Ole => "ole",
            Self::Ogt => "ogt",
            Self::Oge => "oge",
        }
    }
}

/// Conversions.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    SiToFp,
    UiToFp,
    FpToSi,
    BitCast,
    PtrToInt,
    IntToPtr,
}

impl CastOp {
    /// Instruction mnemonic.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Trunc => "trunc",
            Self::ZExt => "zext",
            Self::SExt => "sext",
            Self::FpTrunc => "fptrunc",
            Self::FpExt => "fpext",
            Self::SiToFp => "sitofp",
            Self::UiToFp => "uitofp",
            Self::FpToSi => "fptosi",
            Self::BitCast => "bitcast",
            Self::PtrToInt => "ptrtoint",
            Self::IntToPtr => "inttoptr",
        }
    }
}

/// Markers on a plain load or store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemFlags {
    /// `load volatile` / `store volatile`.
    pub volatile: bool,
    /// `!nontemporal` metadata.
    pub nontemporal: bool,
}

/// An instruction.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    Binary {
        dst: Reg,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    FNeg {
        dst: Reg,
        value: Value,
    },
    ICmp {
        dst: Reg,
        pred: IntPredicate,
        lhs: Value,
        rhs: Value,
    },
    FCmp {
        dst: Reg,
        pred: FloatPredicate,
        lhs: Value,
        rhs: Value,
    },
    Cast {
        dst: Reg,
        op: CastOp,
        value: Value,
        to: LlType,
    },
    Select {
        dst: Reg,
        cond: Value,
        on_true: Value,
        on_false: Value,
    },
    ExtractElement {
        dst: Reg,
        vector: Value,
        index: Value,
    },
    InsertElement {
        dst: Reg,
        vector: Value,
        value: Value,
        index: Value,
    },
    /// `getelementptr inbounds elem, base, index`.
    Gep {
        dst: Reg,
        elem: LlType,
        base: Value,
        index: Value,
    },
    Load {
        dst: Reg,
        ptr: Value,
        flags: MemFlags,
    },
    Store {
        value: Value,
        ptr: Value,
        flags: MemFlags,
    },
    Call {
        dst: Option<Reg>,
        callee: String,
        args: Vec<Value>,
    },
    Phi {
        dst: Reg,
        incoming: Vec<(Value, BlockId)>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Value,
        on_true: BlockId,
        on_false: BlockId,
    },
    Ret,
}

impl Inst {
    /// Check if the instruction ends a block.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Br { .. } | Self::CondBr { .. } | Self::Ret)
    }

    /// The register the instruction defines.
    #[must_use]
    pub fn dst(&self) -> Option<Reg> {
        match self {
            Self::Binary { dst, .. }
            | Self::FNeg { dst, .. }
            | Self::ICmp { dst, .. }
            | Self::FCmp { dst, .. }
            | Self::Cast { dst, .. }
            | Self::Select { dst, .. }
            | Self::ExtractElement { dst, .. }
            | Self::InsertElement { dst, .. }
            | Self::Gep { dst, .. }
            | Self::Load { dst, .. }
            | Self::Phi { dst, .. } => Some(*dst),
            Self::Call { dst, .. } => *dst,
            Self::Store { .. } | Self::Br { .. } | Self::CondBr { .. } | Self::Ret => None,
        }
    }
}

/// Signature of a declared function.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Return type.
    pub ret: LlType,
    /// Parameter types.
    pub params: Vec<LlType>,
}

impl Signature {
    /// Create a signature.
    #[must_use]
    pub fn new(ret: LlType, params: Vec<LlType>) -> Self {
        Self { ret, params }
    }
}

/// A basic block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Label, unique within the function.
    pub label: String,
    /// Instructions; the last one is the terminator.
    pub insts: Vec<Inst>,
}

/// A function definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Parameter registers, in order.
    pub params: Vec<Reg>,
    /// Type of every register.
    pub regs: IndexVec<Reg, LlType>,
    /// Block arena.
    pub blocks: IndexVec<BlockId, Block>,
    /// Block order.
    pub layout: Vec<BlockId>,
    /// Functions this one calls, by name.
    pub externs: IndexMap<String, Signature>,
    /// Whether this is an `amdgpu_kernel` entry point.
    pub kernel: bool,
    /// Function attributes.
    pub attributes: Vec<(String, String)>,
}

impl Function {
    /// Create a function with an empty `entry` block.
    #[must_use]
    pub fn new(name: impl Into<String>, params: impl IntoIterator<Item = LlType>) -> Self {
        let regs: IndexVec<Reg, LlType> = params.into_iter().collect();
        let params = regs.indices().collect();
        let mut func = Self {
            name: name.into(),
            params,
            regs,
            blocks: IndexVec::new(),
            layout: Vec::new(),
            externs: IndexMap::new(),
            kernel: false,
            attributes: Vec::new(),
        };
        let entry = func.blocks.push(Block {
            label: "entry".to_string(),
            insts: Vec::new(),
        });
        func.layout.push(entry);
        func
    }

    /// The entry block.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.layout[0]
    }

    /// A fresh register of type `ty`.
    pub fn new_reg(&mut self, ty: LlType) -> Reg {
        self.regs.push(ty)
    }

    /// Add a block placed right after `after` in the layout.
    pub fn insert_block_after(&mut self, after: BlockId, name: &str) -> BlockId {
        let id = self.blocks.next_index();
        let label = format!("{name}{}", self.blocks.len());
        self.blocks.push(Block {
            label,
            insts: Vec::new(),
        });
        let pos = self
            .layout
            .iter()
            .position(|&b| b == after)
            .map_or(self.layout.len(), |p| p + 1);
        self.layout.insert(pos, id);
        id
    }

    /// Record a callee.
    pub fn declare(&mut self, name: &str, sig: Signature) {
        self.externs.entry(name.to_string()).or_insert(sig);
    }

    /// Type of an operand.
    #[must_use]
    pub fn value_type(&self, value: &Value) -> LlType {
        match value {
            Value::Reg(r) => self.regs[*r].clone(),
            Value::Int(ty, _) | Value::Float(ty, _) | Value::Zero(ty) | Value::Undef(ty) => {
                ty.clone()
            }
            Value::Global(_, space) => LlType::Ptr(*space),
        }
    }

    /// Instructions of every block in layout order.
    pub fn insts(&self) -> impl Iterator<Item = &Inst> + '_ {
        self.layout
            .iter()
            .flat_map(move |&b| self.blocks[b].insts.iter())
    }

    /// Count instructions satisfying `pred`.
    pub fn count_insts(&self, mut pred: impl FnMut(&Inst) -> bool) -> usize {
        self.insts().filter(|i| pred(i)).count()
    }

    /// Count calls whose callee starts with `prefix`.
    #[must_use]
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.count_insts(|i| matches!(i, Inst::Call { callee, .. } if callee.starts_with(prefix)))
    }
}

/// A module-level variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    /// Symbol name.
    pub name: String,
    /// Address space.
    pub addrspace: u32,
    /// Alignment in bytes.
    pub align: u32,
}

/// A compilation unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: String,
    /// Target triple.
    pub triple: String,
    /// Target processor, e.g. `gfx90a`.
    pub cpu: String,
    /// Externally defined shared buffers.
    pub globals: Vec<Global>,
    /// Definitions.
    pub functions: Vec<Function>,
}

impl Module {
    /// Create an empty module for an AMD processor.
    #[must_use]
    pub fn new(name: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triple: "amdgcn-amd-amdhsa".to_string(),
            cpu: cpu.into(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Look up a function by name.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Declarations needed by all functions, first use first.
    #[must_use]
    pub fn externs(&self) -> IndexMap<String, Signature> {
        let mut all = IndexMap::new();
        for func in &self.functions {
            for (name, sig) in &func.externs {
                all.entry(name.clone()).or_insert_with(|| sig.clone());
            }
        }
        all
    }
}
