//! Instruction builder.

use super::{
    BinOp, BlockId, CastOp, FloatPredicate, Function, Inst, IntPredicate, LlType, MemFlags,
    Signature, Value,
};

/// Appends instructions to one block of a function at a time.
///
/// Integer arithmetic on constants is folded as it is built, so address
/// and coordinate math that is known statically never reaches the output.
pub struct Builder<'f> {
    func: &'f mut Function,
    block: BlockId,
    wave_size: u32,
}

impl<'f> Builder<'f> {
    /// Position a builder at the end of the entry block.
    pub fn new(func: &'f mut Function, wave_size: u32) -> Self {
        let block = func.entry();
        Self {
            func,
            block,
            wave_size,
        }
    }

    /// The function being built.
    #[must_use]
    pub fn func(&self) -> &Function {
        self.func
    }

    /// Lanes per wavefront.
    #[must_use]
    pub fn wave_size(&self) -> u32 {
        self.wave_size
    }

    /// The current block.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Continue at the end of `block`.
    pub fn position_at_end(&mut self, block: BlockId) {
        self.block = block;
    }

    /// Add a block after the current one.
    pub fn append_block(&mut self, name: &str) -> BlockId {
        self.func.insert_block_after(self.block, name)
    }

    /// Type of an operand.
    #[must_use]
    pub fn value_type(&self, value: &Value) -> LlType {
        self.func.value_type(value)
    }

    /// Record a callee.
    pub fn declare(&mut self, name: &str, sig: Signature) {
        self.func.declare(name, sig);
    }

    fn push(&mut self, inst: Inst) {
        self.func.blocks[self.block].insts.push(inst);
    }

    fn define(&mut self, ty: LlType, make: impl FnOnce(super::Reg) -> Inst) -> Value {
        let dst = self.func.new_reg(ty);
        self.push(make(dst));
        Value::Reg(dst)
    }

    /// A binary operation; the result has the type of `lhs`.
    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        if let Some(folded) = fold(op, &lhs, &rhs) {
            return folded;
        }
        let ty = self.value_type(&lhs);
        self.define(ty, |dst| Inst::Binary { dst, op, lhs, rhs })
    }

    /// `add`.
    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    /// `sub`.
    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    /// `mul`.
    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    /// `udiv`.
    pub fn udiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::UDiv, lhs, rhs)
    }

    /// `urem`.
    pub fn urem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::URem, lhs, rhs)
    }

    /// `and`.
    pub fn and(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::And, lhs, rhs)
    }

    /// `xor`.
    pub fn xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Xor, lhs, rhs)
    }

    /// `shl`.
    pub fn shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Shl, lhs, rhs)
    }

    /// `fneg`.
    pub fn fneg(&mut self, value: Value) -> Value {
        let ty = self.value_type(&value);
        self.define(ty, |dst| Inst::FNeg { dst, value })
    }

    /// `icmp`.
    pub fn icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value) -> Value {
        self.define(LlType::I1, |dst| Inst::ICmp {
            dst,
            pred,
            lhs,
            rhs,
        })
    }

    /// `fcmp`.
    pub fn fcmp(&mut self, pred: FloatPredicate, lhs: Value, rhs: Value) -> Value {
        self.define(LlType::I1, |dst| Inst::FCmp {
            dst,
            pred,
            lhs,
            rhs,
        })
    }

    /// A conversion to `to`. Converting to the same type is a no-op.
    pub fn cast(&mut self, op: CastOp, value: Value, to: LlType) -> Value {
        if self.value_type(&value) == to {
            return value;
        }
        if let (Value::Int(_, v), CastOp::SExt | CastOp::ZExt | CastOp::Trunc) = (&value, op) {
            if to.is_int() && !matches!(to, LlType::Vector(..)) {
                return Value::Int(to, *v);
            }
        }
        let ty = to.clone();
        self.define(ty, |dst| Inst::Cast { dst, op, value, to })
    }

    /// `bitcast`.
    pub fn bitcast(&mut self, value: Value, to: LlType) -> Value {
        self.cast(CastOp::BitCast, value, to)
    }

    /// `sext`.
    pub fn sext(&mut self, value: Value, to: LlType) -> Value {
        self.cast(CastOp::SExt, value, to)
    }

    /// `trunc`.
    pub fn trunc(&mut self, value: Value, to: LlType) -> Value {
        self.cast(CastOp::Trunc, value, to)
    }

    /// `select`.
    pub fn select(&mut self, cond: Value, on_true: Value, on_false: Value) -> Value {
        match cond.as_int() {
            Some(0) => return on_false,
            Some(_) => return on_true,
            None => {}
        }
        let ty = self.value_type(&on_true);
        self.define(ty, |dst| Inst::Select {
            dst,
            cond,
            on_true,
            on_false,
        })
    }

    /// `extractelement` at a constant index.
    pub fn extract_element(&mut self, vector: Value, index: u32) -> Value {
        let ty = self.value_type(&vector).element().clone();
        self.define(ty, |dst| Inst::ExtractElement {
            dst,
            vector,
            index: Value::i32(i64::from(index)),
        })
    }

    /// `insertelement` at a constant index.
    pub fn insert_element(&mut self, vector: Value, value: Value, index: u32) -> Value {
        let ty = self.value_type(&vector);
        self.define(ty, |dst| Inst::InsertElement {
            dst,
            vector,
            value,
            index: Value::i32(i64::from(index)),
        })
    }

    /// Pack scalars into a vector; a single scalar stays a scalar.
    pub fn pack(&mut self, elems: &[Value]) -> Value {
        if let [single] = elems {
            return single.clone();
        }
        let elem = elems
            .first()
            .map_or(LlType::I32, |v| self.value_type(v));
        // The vector length is bounded by a lane's register count.
        #[allow(clippy::cast_possible_truncation)]
        let len = elems.len() as u32;
        let mut vector = Value::Undef(LlType::vector(len, elem));
        for (i, v) in (0..len).zip(elems) {
            vector = self.insert_element(vector, v.clone(), i);
        }
        vector
    }

    /// Split a vector into its elements; a scalar is its own only element.
    pub fn unpack(&mut self, vector: Value) -> Vec<Value> {
        match self.value_type(&vector) {
            LlType::Vector(n, _) => (0..n)
                .map(|i| self.extract_element(vector.clone(), i))
                .collect(),
            _ => vec![vector],
        }
    }

    /// `getelementptr inbounds`.
    pub fn gep(&mut self, elem: LlType, base: Value, index: Value) -> Value {
        if index.as_int() == Some(0) {
            return base;
        }
        let ty = self.value_type(&base);
        self.define(ty, |dst| Inst::Gep {
            dst,
            elem,
            base,
            index,
        })
    }

    /// A plain `load`.
    pub fn load(&mut self, ty: LlType, ptr: Value, flags: MemFlags) -> Value {
        self.define(ty, |dst| Inst::Load { dst, ptr, flags })
    }

    /// A plain `store`.
    pub fn store(&mut self, value: Value, ptr: Value, flags: MemFlags) {
        self.push(Inst::Store { value, ptr, flags });
    }

    /// Call `callee`, declaring it with `sig`. Returns `None` for `void`.
    pub fn call(&mut self, callee: &str, sig: Signature, args: Vec<Value>) -> Option<Value> {
        let ret = sig.ret.clone();
        self.declare(callee, sig);
        let callee = callee.to_string();
        if ret == LlType::Void {
            self.push(Inst::Call {
                dst: None,
                callee,
                args,
            });
            None
        } else {
            Some(self.define(ret, |dst| Inst::Call {
                dst: Some(dst),
                callee,
                args,
            }))
        }
    }

    /// Call a value-returning intrinsic whose parameters have the types of
    /// `args`.
    pub fn intrinsic(&mut self, name: &str, ret: LlType, args: Vec<Value>) -> Value {
        let params = args.iter().map(|a| self.value_type(a)).collect();
        let sig = Signature::new(ret.clone(), params);
        self.call(name, sig, args)
            .unwrap_or(Value::Undef(ret))
    }

    /// `phi`.
    pub fn phi(&mut self, ty: LlType, incoming: Vec<(Value, BlockId)>) -> Value {
        self.define(ty, |dst| Inst::Phi { dst, incoming })
    }

    /// `br`.
    pub fn br(&mut self, target: BlockId) {
        self.push(Inst::Br { target });
    }

    /// `br i1`.
    pub fn cond_br(&mut self, cond: Value, on_true: BlockId, on_false: BlockId) {
        self.push(Inst::CondBr {
            cond,
            on_true,
            on_false,
        });
    }

    /// `ret void`.
    pub fn ret(&mut self) {
        self.push(Inst::Ret);
    }

    /// Workitem id along x within the workgroup.
    pub fn thread_id(&mut self) -> Value {
        self.intrinsic("llvm.amdgcn.workitem.id.x", LlType::I32, Vec::new())
    }

    /// Lane of the calling thread within its wavefront.
    pub fn lane_id(&mut self) -> Value {
        let tid = self.thread_id();
        self.urem(tid, Value::i32(i64::from(self.wave_size)))
    }

    /// Workgroup barrier.
    pub fn barrier(&mut self) {
        self.call(
            "llvm.amdgcn.s.barrier",
            Signature::new(LlType::Void, Vec::new()),
            Vec::new(),
        );
    }
}

/// Fold integer arithmetic with constant operands.
fn fold(op: BinOp, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (l, r) = (lhs.as_int(), rhs.as_int());
    if let (Value::Int(ty, a), Some(b)) = (lhs, r) {
        let a = *a;
        let folded = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::UDiv | BinOp::SDiv if b != 0 => Some(a / b),
            BinOp::URem | BinOp::SRem if b != 0 => Some(a % b),
            BinOp::And => Some(a & b),
            BinOp::Or => Some(a | b),
            BinOp::Xor => Some(a ^ b),
            _ => None,
        };
        return folded.map(|v| Value::Int(ty.clone(), v));
    }
    match (op, l, r) {
        (BinOp::Add | BinOp::Or | BinOp::Xor, Some(0), _) => Some(rhs.clone()),
        (BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor | BinOp::Shl, _, Some(0))
        | (BinOp::Mul | BinOp::UDiv | BinOp::SDiv, _, Some(1)) => Some(lhs.clone()),
        (BinOp::Mul, Some(1), _) => Some(rhs.clone()),
        (BinOp::Mul | BinOp::And, Some(0), _) => Some(lhs.clone()),
        (BinOp::Mul | BinOp::And, _, Some(0)) | (BinOp::URem, _, Some(1)) => {
            match rhs {
                Value::Int(ty, _) => Some(Value::Int(ty.clone(), 0)),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_folding() {
        let mut func = Function::new("f", [LlType::I32]);
        let x = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        assert_eq!(b.add(Value::i32(2), Value::i32(3)), Value::i32(5));
        assert_eq!(b.add(Value::i32(0), x.clone()), x);
        assert_eq!(b.mul(x.clone(), Value::i32(1)), x);
        assert_eq!(b.mul(x.clone(), Value::i32(0)), Value::i32(0));
        assert_eq!(b.urem(x.clone(), Value::i32(1)), Value::i32(0));
        assert_eq!(b.udiv(x.clone(), Value::i32(1)), x);
        assert_eq!(b.select(Value::bool(true), x.clone(), Value::i32(7)), x);
        assert!(func.blocks[func.entry()].insts.is_empty());
    }

    #[test]
    fn test_calls_declare_callees() {
        let mut func = Function::new("f", []);
        let mut b = Builder::new(&mut func, 32);
        let lane = b.lane_id();
        b.barrier();
        assert!(lane.as_reg().is_some());
        assert!(func.externs.contains_key("llvm.amdgcn.workitem.id.x"));
        assert_eq!(
            func.externs["llvm.amdgcn.s.barrier"],
            Signature::new(LlType::Void, Vec::new())
        );
        assert_eq!(func.count_calls("llvm.amdgcn."), 2);
    }

    #[test]
    fn test_pack_and_unpack() {
        let mut func = Function::new("f", [LlType::Float, LlType::Float]);
        let (a, c) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 64);
        let v = b.pack(&[a.clone(), c]);
        assert_eq!(
            b.value_type(&v),
            LlType::Vector(2, Box::new(LlType::Float))
        );
        assert_eq!(b.unpack(v).len(), 2);
        assert_eq!(b.pack(&[a.clone()]), a);
    }
}
