//! Typed construction of operations.
//!
//! Every method checks the typing rules of [`crate::ops::result_types`]
//! before touching the function, so a program built only through a
//! [`Builder`] always verifies.

use crate::function::{Function, InsertPoint, OpId, ValueId};
use crate::ops::{result_types, BinaryOp, ConstValue, MemAttrs, OpKind, ReduceOp, UnaryOp};
use crate::types::{DType, Type};
use crate::{IrError, IrResult};
use tlc_layout::Layout;
use tlc_span::Loc;

/// Inserts operations into a function.
pub struct Builder<'f> {
    func: &'f mut Function,
    at: InsertPoint,
    loc: Loc,
}

impl<'f> Builder<'f> {
    /// A builder appending at the end of `func`.
    pub fn new(func: &'f mut Function) -> Self {
        Self::at(func, InsertPoint::End)
    }

    /// A builder inserting at `at`. Consecutive operations keep their
    /// creation order.
    pub fn at(func: &'f mut Function, at: InsertPoint) -> Self {
        Self {
            func,
            at,
            loc: Loc::Unknown,
        }
    }

    /// Attach `loc` to subsequently created operations.
    pub fn set_loc(&mut self, loc: Loc) {
        self.loc = loc;
    }

    /// The function being built.
    #[must_use]
    pub fn func(&self) -> &Function {
        self.func
    }

    /// The type of a value.
    #[must_use]
    pub fn ty(&self, value: ValueId) -> &Type {
        self.func.value_type(value)
    }

    /// Replace the type of a value, e.g. to attach a layout.
    pub fn set_type(&mut self, value: ValueId, ty: Type) {
        self.func.set_type(value, ty);
    }

    /// Create an operation after checking its operand types.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::Malformed`] if the operands break the typing rules
    /// of `kind`.
    pub fn create(&mut self, kind: OpKind, operands: &[ValueId]) -> IrResult<OpId> {
        let types: Vec<&Type> = operands.iter().map(|&v| self.func.value_type(v)).collect();
        let results = result_types(&kind, &types).map_err(|reason| IrError::Malformed {
            op: kind.name().to_string(),
            loc: self.loc.clone(),
            reason,
        })?;
        Ok(self.insert(kind, operands, results))
    }

    /// Create an operation with explicit result types.
    pub fn insert(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        results: impl IntoIterator<Item = Type>,
    ) -> OpId {
        let op = self
            .func
            .insert_op(self.at, kind, operands, results, self.loc.clone());
        if matches!(self.at, InsertPoint::Start | InsertPoint::After(_)) {
            self.at = InsertPoint::After(op);
        }
        op
    }

    fn create_value(&mut self, kind: OpKind, operands: &[ValueId]) -> IrResult<ValueId> {
        let op = self.create(kind, operands)?;
        self.func.op(op).result().ok_or_else(|| {
            IrError::malformed(self.func.op(op), "expected exactly one result")
        })
    }

    /// `tt.get_program_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `axis` is not 0, 1 or 2.
    pub fn program_id(&mut self, axis: u32) -> IrResult<ValueId> {
        self.create_value(OpKind::GetProgramId { axis }, &[])
    }

    /// `tt.get_num_programs`.
    ///
    /// # Errors
    ///
    /// Returns an error if `axis` is not 0, 1 or 2.
    pub fn num_programs(&mut self, axis: u32) -> IrResult<ValueId> {
        self.create_value(OpKind::GetNumPrograms { axis }, &[])
    }

    /// `tt.make_range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is empty.
    pub fn make_range(&mut self, start: i32, end: i32) -> IrResult<ValueId> {
        self.create_value(OpKind::MakeRange { start, end }, &[])
    }

    /// `tt.splat`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a scalar.
    pub fn splat(&mut self, value: ValueId, shape: &[u32]) -> IrResult<ValueId> {
        self.create_value(
            OpKind::Splat {
                shape: shape.into(),
            },
            &[value],
        )
    }

    /// `tt.broadcast`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be broadcast to `shape`.
    pub fn broadcast(&mut self, value: ValueId, shape: &[u32]) -> IrResult<ValueId> {
        self.create_value(
            OpKind::Broadcast {
                shape: shape.into(),
            },
            &[value],
        )
    }

    /// `tt.expand_dims`.
    ///
    /// # Errors
    ///
    /// Returns an error if `axis` exceeds the operand rank.
    pub fn expand_dims(&mut self, value: ValueId, axis: u32) -> IrResult<ValueId> {
        self.create_value(OpKind::ExpandDims { axis }, &[value])
    }

    /// `tt.trans`.
    ///
    /// # Errors
    ///
    /// Returns an error if `order` is not a permutation of the operand rank.
    pub fn trans(&mut self, value: ValueId, order: &[u32]) -> IrResult<ValueId> {
        self.create_value(
            OpKind::Trans {
                order: order.to_vec(),
            },
            &[value],
        )
    }

    /// An integer constant of type `ty`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ty` is not an integer scalar or tensor.
    pub fn const_int(&mut self, value: i64, ty: Type) -> IrResult<ValueId> {
        self.create_value(
            OpKind::Constant {
                value: ConstValue::Int(value),
                ty,
            },
            &[],
        )
    }

    /// A float constant of type `ty`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ty` is not a float scalar or tensor.
    pub fn const_float(&mut self, value: f64, ty: Type) -> IrResult<ValueId> {
        self.create_value(
            OpKind::Constant {
                value: ConstValue::Float(value),
                ty,
            },
            &[],
        )
    }

    /// A scalar `i32` constant.
    ///
    /// # Errors
    ///
    /// Never fails for in-range values; kept fallible for uniformity.
    pub fn const_i32(&mut self, value: i32) -> IrResult<ValueId> {
        self.const_int(i64::from(value), Type::scalar(DType::Int32))
    }

    /// A scalar `i64` constant.
    ///
    /// # Errors
    ///
    /// Never fails; kept fallible for uniformity.
    pub fn const_i64(&mut self, value: i64) -> IrResult<ValueId> {
        self.const_int(value, Type::scalar(DType::Int64))
    }

    /// An elementwise unary operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operand type does not support `op`.
    pub fn unary(&mut self, op: UnaryOp, value: ValueId) -> IrResult<ValueId> {
        self.create_value(OpKind::Unary(op), &[value])
    }

    /// An elementwise binary operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operand types differ or do not support `op`.
    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> IrResult<ValueId> {
        self.create_value(OpKind::Binary(op), &[lhs, rhs])
    }

    /// An elementwise numeric conversion.
    ///
    /// # Errors
    ///
    /// Returns an error if the operand is not numeric.
    pub fn cast(&mut self, value: ValueId, to: DType) -> IrResult<ValueId> {
        self.create_value(OpKind::Cast { to }, &[value])
    }

    /// `tt.addptr`.
    ///
    /// # Errors
    ///
    /// Returns an error unless `ptr` is a pointer and `offset` a matching
    /// integer.
    pub fn add_ptr(&mut self, ptr: ValueId, offset: ValueId) -> IrResult<ValueId> {
        self.create_value(OpKind::AddPtr, &[ptr, offset])
    }

    /// `arith.select`.
    ///
    /// # Errors
    ///
    /// Returns an error if the condition is not `i1` or does not broadcast to
    /// the branches.
    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> IrResult<ValueId> {
        self.create_value(OpKind::Select, &[cond, on_true, on_false])
    }

    /// `tt.load`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer, mask or fallback types disagree.
    pub fn load(
        &mut self,
        ptr: ValueId,
        mask: Option<ValueId>,
        other: Option<ValueId>,
        attrs: MemAttrs,
    ) -> IrResult<ValueId> {
        let mut operands = vec![ptr];
        if let Some(mask) = mask {
            operands.push(mask);
            operands.extend(other);
        } else if other.is_some() {
            return Err(IrError::Malformed {
                op: "tt.load".to_string(),
                loc: self.loc.clone(),
                reason: "a fallback value needs a mask".to_string(),
            });
        }
        self.create_value(OpKind::Load(attrs), &operands)
    }

    /// `tt.store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer, value or mask types disagree.
    pub fn store(
        &mut self,
        ptr: ValueId,
        value: ValueId,
        mask: Option<ValueId>,
        attrs: MemAttrs,
    ) -> IrResult<OpId> {
        let mut operands = vec![ptr, value];
        operands.extend(mask);
        self.create(OpKind::Store(attrs), &operands)
    }

    /// `tt.make_tensor_ptr` over a strided global tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the operand counts do not match the rank, `order`
    /// is not a permutation, or an operand has the wrong type.
    pub fn make_tensor_ptr(
        &mut self,
        base: ValueId,
        dims: &[ValueId],
        strides: &[ValueId],
        offsets: &[ValueId],
        block_shape: &[u32],
        order: &[u32],
    ) -> IrResult<ValueId> {
        let mut operands = vec![base];
        operands.extend_from_slice(dims);
        operands.extend_from_slice(strides);
        operands.extend_from_slice(offsets);
        self.create_value(
            OpKind::MakeTensorPtr {
                shape: block_shape.into(),
                order: order.to_vec(),
            },
            &operands,
        )
    }

    /// `tt.advance`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` is not a block pointer or the offsets do not
    /// match its rank.
    pub fn advance(&mut self, ptr: ValueId, offsets: &[ValueId]) -> IrResult<ValueId> {
        let mut operands = vec![ptr];
        operands.extend_from_slice(offsets);
        self.create_value(OpKind::Advance, &operands)
    }

    /// `tt.dot`: `a * b + c`.
    ///
    /// # Errors
    ///
    /// Returns an error if the operands are not rank 2 or `c` does not match
    /// the product shape.
    pub fn dot(&mut self, a: ValueId, b: ValueId, c: ValueId) -> IrResult<ValueId> {
        self.create_value(OpKind::Dot, &[a, b, c])
    }

    /// `tt.reduce` along `axis`.
    ///
    /// # Errors
    ///
    /// Returns an error if `axis` is out of range.
    pub fn reduce(&mut self, value: ValueId, axis: u32, op: ReduceOp) -> IrResult<ValueId> {
        self.create_value(OpKind::Reduce { axis, op }, &[value])
    }

    /// `ttg.convert_layout` to `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a tensor or `layout` has the wrong
    /// rank.
    pub fn convert_layout(&mut self, value: ValueId, layout: Layout) -> IrResult<ValueId> {
        let ty = self.func.value_type(value);
        if layout.rank() != ty.shape().len() || !ty.is_tensor() {
            return Err(IrError::Malformed {
                op: OpKind::ConvertLayout.name().to_string(),
                loc: self.loc.clone(),
                reason: format!("cannot convert {ty} to rank-{} {layout}", layout.rank()),
            });
        }
        let result = ty.with_encoding(Some(layout));
        let op = self.insert(OpKind::ConvertLayout, &[value], [result]);
        Ok(self.func.op(op).results[0])
    }

    /// `tt.return`.
    pub fn ret(&mut self) -> OpId {
        self.insert(OpKind::Return, &[], [])
    }
}
