//! Functions, modules and the operation arena.
//!
//! A [`Function`] owns two arenas: operations indexed by [`OpId`] and SSA
//! values indexed by [`ValueId`]. The lexical order of a function is the
//! `body` list of operation ids. Rewrites never mutate through pointers:
//! they create new operations, rewire uses and erase the old ones.

use crate::ops::OpKind;
use crate::types::Type;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tlc_index::{define_index, IndexVec};
use tlc_layout::{Layout, LayoutConfig};
use tlc_span::Loc;
use tlc_target::{GpuTarget, TargetError};

define_index! {
    /// Index of an operation within a function.
    pub struct OpId;

    /// Index of an SSA value within a function.
    pub struct ValueId;
}

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueDef {
    /// A kernel argument.
    Arg {
        /// Argument position.
        index: u32,
    },
    /// A result of an operation.
    Op {
        /// The defining operation.
        op: OpId,
        /// Result position.
        index: u32,
    },
}

/// An SSA value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueData {
    /// The value's type, including its layout once assigned.
    pub ty: Type,
    /// The definition.
    pub def: ValueDef,
}

/// An operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// What the operation does.
    pub kind: OpKind,
    /// Operand values.
    #[serde(default)]
    pub operands: SmallVec<[ValueId; 4]>,
    /// Result values.
    #[serde(default)]
    pub results: SmallVec<[ValueId; 1]>,
    /// Source location.
    #[serde(default, skip_serializing_if = "Loc::is_unknown")]
    pub loc: Loc,
    /// Set once the operation has been removed from the body.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub erased: bool,
}

impl Operation {
    /// The single result of the operation, if it has exactly one.
    #[must_use]
    pub fn result(&self) -> Option<ValueId> {
        match self.results.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }
}

/// Where to place a new operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertPoint {
    /// At the start of the body.
    Start,
    /// Before an operation.
    Before(OpId),
    /// After an operation.
    After(OpId),
    /// At the end of the body.
    End,
}

/// A kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Kernel name.
    pub name: String,
    /// Argument values, in order.
    pub args: Vec<ValueId>,
    /// Operation arena.
    pub ops: IndexVec<OpId, Operation>,
    /// Value arena.
    pub values: IndexVec<ValueId, ValueData>,
    /// Lexical order of live operations.
    pub body: Vec<OpId>,
}

impl Function {
    /// Create an empty function with the given argument types.
    #[must_use]
    pub fn new(name: impl Into<String>, arg_types: impl IntoIterator<Item = Type>) -> Self {
        let mut values = IndexVec::new();
        let args = arg_types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| {
                values.push(ValueData {
                    ty,
                    def: ValueDef::Arg { index: i as u32 },
                })
            })
            .collect();
        Self {
            name: name.into(),
            args,
            ops: IndexVec::new(),
            values,
            body: Vec::new(),
        }
    }

    /// The `index`th argument.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<ValueId> {
        self.args.get(index).copied()
    }

    /// Get an operation.
    #[must_use]
    pub fn op(&self, op: OpId) -> &Operation {
        &self.ops[op]
    }

    /// Get an operation mutably.
    pub fn op_mut(&mut self, op: OpId) -> &mut Operation {
        &mut self.ops[op]
    }

    /// The type of a value.
    #[must_use]
    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.values[value].ty
    }

    /// The layout of a tensor value.
    #[must_use]
    pub fn encoding(&self, value: ValueId) -> Option<&Layout> {
        self.values[value].ty.encoding()
    }

    /// Replace the type of a value.
    pub fn set_type(&mut self, value: ValueId, ty: Type) {
        self.values[value].ty = ty;
    }

    /// Set or clear the layout of a tensor value.
    pub fn set_encoding(&mut self, value: ValueId, layout: Option<Layout>) {
        if let Some(tensor) = self.values[value].ty.as_tensor_mut() {
            tensor.encoding = layout;
        }
    }

    /// The operation defining a value, if it is not an argument.
    #[must_use]
    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value].def {
            ValueDef::Op { op, .. } => Some(op),
            ValueDef::Arg { .. } => None,
        }
    }

    /// Live operations in lexical order.
    pub fn body_ops(&self) -> impl Iterator<Item = (OpId, &Operation)> + '_ {
        self.body.iter().map(move |&id| (id, &self.ops[id]))
    }

    /// Position of each live operation in the body.
    #[must_use]
    pub fn positions(&self) -> FxHashMap<OpId, usize> {
        self.body.iter().enumerate().map(|(i, &op)| (op, i)).collect()
    }

    /// Create an operation with fresh result values at `at`.
    ///
    /// No typing rules are checked; see [`crate::Builder`] for that.
    pub fn insert_op(
        &mut self,
        at: InsertPoint,
        kind: OpKind,
        operands: &[ValueId],
        result_types: impl IntoIterator<Item = Type>,
        loc: Loc,
    ) -> OpId {
        let id = self.ops.next_index();
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| {
                self.values.push(ValueData {
                    ty,
                    def: ValueDef::Op {
                        op: id,
                        index: i as u32,
                    },
                })
            })
            .collect();
        self.ops.push(Operation {
            kind,
            operands: operands.into(),
            results,
            loc,
            erased: false,
        });
        let pos = match at {
            InsertPoint::Start => 0,
            InsertPoint::End => self.body.len(),
            InsertPoint::Before(anchor) => self.position_of(anchor),
            InsertPoint::After(anchor) => (self.position_of(anchor) + 1).min(self.body.len()),
        };
        self.body.insert(pos, id);
        id
    }

    /// Append an operation at the end of the body.
    pub fn append_op(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        result_types: impl IntoIterator<Item = Type>,
        loc: Loc,
    ) -> OpId {
        self.insert_op(InsertPoint::End, kind, operands, result_types, loc)
    }

    fn position_of(&self, op: OpId) -> usize {
        self.body
            .iter()
            .position(|&id| id == op)
            .unwrap_or(self.body.len())
    }

    /// Replace operand `index` of `op`.
    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        self.ops[op].operands[index] = value;
    }

    /// Rewire every use of `from` to `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        self.replace_uses_if(from, to, |_, _| true);
    }

    /// Rewire the uses of `from` for which `pred(op, operand_index)` holds.
    pub fn replace_uses_if(
        &mut self,
        from: ValueId,
        to: ValueId,
        mut pred: impl FnMut(OpId, usize) -> bool,
    ) {
        for &id in &self.body {
            let op = &mut self.ops[id];
            for (i, operand) in op.operands.iter_mut().enumerate() {
                if *operand == from && pred(id, i) {
                    *operand = to;
                }
            }
        }
    }

    /// Remove an operation from the body. Its results must be unused.
    pub fn erase_op(&mut self, op: OpId) {
        self.body.retain(|&id| id != op);
        self.ops[op].erased = true;
    }

    /// `(op, operand index)` pairs using `value`, in lexical order.
    #[must_use]
    pub fn users(&self, value: ValueId) -> Vec<(OpId, usize)> {
        let mut users = Vec::new();
        for (id, op) in self.body_ops() {
            for (i, &operand) in op.operands.iter().enumerate() {
                if operand == value {
                    users.push((id, i));
                }
            }
        }
        users
    }

    /// Check whether a value has any use.
    #[must_use]
    pub fn has_uses(&self, value: ValueId) -> bool {
        self.body_ops().any(|(_, op)| op.operands.contains(&value))
    }

    /// Uses of every value, in lexical order.
    #[must_use]
    pub fn use_map(&self) -> FxHashMap<ValueId, Vec<(OpId, usize)>> {
        let mut uses: FxHashMap<ValueId, Vec<(OpId, usize)>> = FxHashMap::default();
        for (id, op) in self.body_ops() {
            for (i, &operand) in op.operands.iter().enumerate() {
                uses.entry(operand).or_default().push((id, i));
            }
        }
        uses
    }

    /// Number of live operations.
    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.body.len()
    }

    /// Count the live operations matching `pred`.
    pub fn count_ops(&self, mut pred: impl FnMut(&OpKind) -> bool) -> usize {
        self.body_ops().filter(|(_, op)| pred(&op.kind)).count()
    }
}

/// Compilation parameters attached to a module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ModuleConfig {
    /// Warps per CTA.
    pub num_warps: u32,
    /// CTAs per cluster.
    pub num_ctas: u32,
    /// Lanes per warp; the target's wavefront size when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads_per_warp: Option<u32>,
    /// Target string, e.g. `hip:gfx90a` or `cuda:80`.
    pub target: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            num_warps: 4,
            num_ctas: 1,
            threads_per_warp: None,
            target: GpuTarget::default().to_string(),
        }
    }
}

impl ModuleConfig {
    /// Parse the target string.
    ///
    /// # Errors
    ///
    /// Returns an error if the target string is not recognized.
    pub fn gpu_target(&self) -> Result<GpuTarget, TargetError> {
        self.target.parse()
    }

    /// Lanes per warp, defaulting to the target's wavefront size.
    ///
    /// # Errors
    ///
    /// Returns an error if the target string is not recognized.
    pub fn effective_threads_per_warp(&self) -> Result<u32, TargetError> {
        match self.threads_per_warp {
            Some(threads) => Ok(threads),
            None => Ok(self.gpu_target()?.warp_size()),
        }
    }

    /// The layout configuration derived from this block.
    ///
    /// # Errors
    ///
    /// Returns an error if the target string is not recognized.
    pub fn layout_config(&self) -> Result<LayoutConfig, TargetError> {
        Ok(LayoutConfig::new(
            self.num_warps,
            self.effective_threads_per_warp()?,
            self.num_ctas,
        ))
    }
}

/// A compilation unit: kernels sharing one configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: String,
    /// Compilation parameters.
    #[serde(default)]
    pub config: ModuleConfig,
    /// Kernels.
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl Module {
    /// Create an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ModuleConfig) -> Self {
        Self {
            name: name.into(),
            config,
            functions: Vec::new(),
        }
    }

    /// Look up a kernel by name.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn sample() -> (Function, ValueId, ValueId) {
        let mut func = Function::new("k", [Type::scalar(DType::Int32)]);
        let x = func.args[0];
        let a = func.append_op(
            OpKind::Binary(crate::BinaryOp::Add),
            &[x, x],
            [Type::scalar(DType::Int32)],
            Loc::Unknown,
        );
        let a = func.op(a).results[0];
        (func, x, a)
    }

    #[test]
    fn test_insert_points() {
        let (mut func, x, _) = sample();
        let first = func.body[0];
        let before = func.insert_op(
            InsertPoint::Before(first),
            OpKind::Unary(crate::UnaryOp::Neg),
            &[x],
            [Type::scalar(DType::Int32)],
            Loc::Unknown,
        );
        let after = func.insert_op(
            InsertPoint::After(first),
            OpKind::Return,
            &[],
            [],
            Loc::Unknown,
        );
        assert_eq!(func.body, vec![before, first, after]);
        let start = func.insert_op(InsertPoint::Start, OpKind::Return, &[], [], Loc::Unknown);
        assert_eq!(func.body[0], start);
    }

    #[test]
    fn test_uses_and_replacement() {
        let (mut func, x, a) = sample();
        assert_eq!(func.users(x).len(), 2);
        assert!(!func.has_uses(a));
        let neg = func.append_op(
            OpKind::Unary(crate::UnaryOp::Neg),
            &[a],
            [Type::scalar(DType::Int32)],
            Loc::Unknown,
        );
        func.replace_all_uses(a, x);
        assert_eq!(func.op(neg).operands[0], x);
        assert_eq!(func.use_map()[&x].len(), 3);

        let add = func.defining_op(a).unwrap();
        func.erase_op(add);
        assert!(func.op(add).erased);
        assert_eq!(func.num_ops(), 1);
        assert_eq!(func.defining_op(x), None);
    }

    #[test]
    fn test_module_config() {
        let config = ModuleConfig::default();
        assert_eq!(config.target, "hip:gfx90a");
        assert_eq!(config.layout_config().unwrap(), LayoutConfig::new(4, 64, 1));
        let cuda = ModuleConfig {
            target: "cuda:80".to_string(),
            ..ModuleConfig::default()
        };
        assert_eq!(cuda.effective_threads_per_warp().unwrap(), 32);
        let bad = ModuleConfig {
            target: "tpu".to_string(),
            ..ModuleConfig::default()
        };
        assert!(bad.layout_config().is_err());
    }
}
