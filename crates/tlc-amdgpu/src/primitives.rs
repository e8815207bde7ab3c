//! Primitive emitters shared by every AMD lowering.
//!
//! Cross-lane moves all go through `ds_bpermute`, which reads one 32-bit
//! value from a byte-addressed lane. Narrower values are widened to 32 bits
//! around the permute and 64-bit values are split into two halves.
//!
//! Global memory accesses are emitted as calls to predicated helpers whose
//! names carry the cache modifier; see [`crate::expand`] for how those calls
//! become branches.

use crate::ll::{Builder, CastOp, IntPredicate, LlType, Signature, Value};
use crate::{CodegenError, CodegenResult};
use tlc_tensor_ir::CacheModifier;

/// Base name of predicated loads.
pub const PREDICATED_LOAD: &str = "__predicated_load";
/// Base name of predicated stores.
pub const PREDICATED_STORE: &str = "__predicated_store";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShuffleKind {
    Xor,
    Up,
    Idx,
}

fn check_shuffle_type(b: &Builder<'_>, value: &Value) -> CodegenResult<LlType> {
    let ty = b.value_type(value);
    match &ty {
        LlType::Vector(..) | LlType::Void => Err(CodegenError::TypeError(format!(
            "cannot shuffle a value of type {ty}"
        ))),
        t if t.bits() > 64 => Err(CodegenError::TypeError(format!(
            "cannot shuffle a value of type {ty}"
        ))),
        _ => Ok(ty),
    }
}

/// Shuffle a value of at most 64 bits. `arg` is the xor mask, the delta or
/// the source lane, depending on `kind`.
fn shuffle_common(
    b: &mut Builder<'_>,
    value: Value,
    arg: Value,
    kind: ShuffleKind,
) -> CodegenResult<Value> {
    let ty = check_shuffle_type(b, &value)?;
    if ty.bits() == 64 {
        let halves = LlType::vector(2, LlType::Float);
        let as_int = match ty {
            LlType::Ptr(_) => b.cast(CastOp::PtrToInt, value, LlType::I64),
            _ => value,
        };
        let pair = b.bitcast(as_int, halves);
        let lo = b.extract_element(pair.clone(), 0);
        let hi = b.extract_element(pair.clone(), 1);
        let lo = shuffle_common(b, lo, arg.clone(), kind)?;
        let hi = shuffle_common(b, hi, arg, kind)?;
        let pair = b.insert_element(pair, lo, 0);
        let pair = b.insert_element(pair, hi, 1);
        return Ok(match ty {
            LlType::Ptr(_) => {
                let as_int = b.bitcast(pair, LlType::I64);
                b.cast(CastOp::IntToPtr, as_int, ty)
            }
            _ => b.bitcast(pair, ty),
        });
    }

    // Widen to i32.
    let widened = if ty == LlType::I32 {
        value
    } else {
        let as_int = if ty.is_float() {
            b.bitcast(value, LlType::Int(ty.bits()))
        } else {
            value
        };
        if ty.bits() < 32 {
            b.sext(as_int, LlType::I32)
        } else {
            as_int
        }
    };

    let lane = b.lane_id();
    let src = match kind {
        ShuffleKind::Xor => b.xor(lane, arg),
        ShuffleKind::Up => {
            let below = b.icmp(IntPredicate::Ult, lane.clone(), arg.clone());
            let shifted = b.sub(lane.clone(), arg);
            b.select(below, lane, shifted)
        }
        ShuffleKind::Idx => arg,
    };
    let addr = b.shl(src, Value::i32(2));
    let permuted = b.intrinsic(
        "llvm.amdgcn.ds.bpermute",
        LlType::I32,
        vec![addr, widened],
    );

    // Narrow back.
    if ty == LlType::I32 {
        return Ok(permuted);
    }
    let narrowed = if ty.bits() < 32 {
        b.trunc(permuted, LlType::Int(ty.bits()))
    } else {
        permuted
    };
    Ok(if ty.is_float() {
        b.bitcast(narrowed, ty)
    } else {
        narrowed
    })
}

/// Value of `value` held by lane `lane_id ^ mask`.
///
/// # Errors
///
/// Returns [`CodegenError::TypeError`] for vectors and values wider than
/// 64 bits.
pub fn shuffle_xor(b: &mut Builder<'_>, value: Value, mask: u32) -> CodegenResult<Value> {
    shuffle_common(b, value, Value::i32(i64::from(mask)), ShuffleKind::Xor)
}

/// Value of `value` held by lane `lane_id - delta`; lanes below `delta`
/// keep their own value.
///
/// # Errors
///
/// Returns [`CodegenError::TypeError`] for vectors and values wider than
/// 64 bits.
pub fn shuffle_up(b: &mut Builder<'_>, value: Value, delta: u32) -> CodegenResult<Value> {
    shuffle_common(b, value, Value::i32(i64::from(delta)), ShuffleKind::Up)
}

/// Value of `value` held by the constant lane `lane`.
///
/// # Errors
///
/// Returns [`CodegenError::TypeError`] for vectors and values wider than
/// 64 bits.
pub fn shuffle_idx(b: &mut Builder<'_>, value: Value, lane: u32) -> CodegenResult<Value> {
    shuffle_common(b, value, Value::i32(i64::from(lane)), ShuffleKind::Idx)
}

/// Value of `value` held by the lane computed at runtime in `lane`.
///
/// # Errors
///
/// Returns [`CodegenError::TypeError`] for vectors and values wider than
/// 64 bits.
pub fn shuffle_idx_dyn(b: &mut Builder<'_>, value: Value, lane: Value) -> CodegenResult<Value> {
    shuffle_common(b, value, lane, ShuffleKind::Idx)
}

const AXIS_NAMES: [char; 3] = ['x', 'y', 'z'];

/// Program id of the workgroup along `axis`.
///
/// # Errors
///
/// Returns [`CodegenError::Unsupported`] for axes other than 0, 1 and 2.
pub fn get_pid(b: &mut Builder<'_>, axis: u32) -> CodegenResult<Value> {
    let name = AXIS_NAMES
        .get(axis as usize)
        .ok_or_else(|| CodegenError::Unsupported(format!("program id axis {axis}")))?;
    Ok(b.intrinsic(
        &format!("llvm.amdgcn.workgroup.id.{name}"),
        LlType::I32,
        Vec::new(),
    ))
}

/// Number of workgroups along `axis`.
///
/// # Errors
///
/// Returns [`CodegenError::Unsupported`] for axes other than 0, 1 and 2.
pub fn get_num_programs(b: &mut Builder<'_>, axis: u32) -> CodegenResult<Value> {
    if axis >= 3 {
        return Err(CodegenError::Unsupported(format!("grid axis {axis}")));
    }
    let groups = b.intrinsic(
        "__ockl_get_num_groups",
        LlType::I64,
        vec![Value::i32(i64::from(axis))],
    );
    Ok(b.trunc(groups, LlType::I32))
}

/// Name of a helper specialized for `params`: the base name followed by
/// `_` and the short name of each parameter type.
#[must_use]
pub fn mangle(base: &str, params: &[LlType]) -> String {
    let mut name = base.to_string();
    for p in params {
        name.push('_');
        name.push_str(&p.mangle());
    }
    name
}

/// Suffix of a predicated load helper for a cache modifier.
fn load_suffix(cache: CacheModifier) -> &'static str {
    match cache {
        CacheModifier::Ca => "_CA",
        CacheModifier::Cg => "_CG",
        _ => "",
    }
}

/// Suffix of a predicated store helper for a cache modifier.
fn store_suffix(cache: CacheModifier) -> &'static str {
    match cache {
        CacheModifier::Cg => "_CG",
        CacheModifier::Cs => "_CS",
        CacheModifier::Wt => "_WT",
        _ => "",
    }
}

/// Load an `elem` from `ptr` when `pred` holds, otherwise produce
/// `false_val`.
///
/// # Errors
///
/// Returns [`CodegenError::TypeError`] if `ptr` is not a pointer or
/// `false_val` does not have type `elem`.
pub fn ll_load(
    b: &mut Builder<'_>,
    ptr: Value,
    elem: &LlType,
    pred: Value,
    false_val: Value,
    cache: CacheModifier,
) -> CodegenResult<Value> {
    let ptr_ty = b.value_type(&ptr);
    if !matches!(ptr_ty, LlType::Ptr(_)) {
        return Err(CodegenError::TypeError(format!(
            "load address has type {ptr_ty}"
        )));
    }
    let false_ty = b.value_type(&false_val);
    if &false_ty != elem {
        return Err(CodegenError::TypeError(format!(
            "load of {elem} with a {false_ty} fallback"
        )));
    }
    let params = vec![ptr_ty, LlType::I1, elem.clone()];
    let name = mangle(
        &format!("{PREDICATED_LOAD}{}", load_suffix(cache)),
        &params,
    );
    let sig = Signature::new(elem.clone(), params);
    b.call(&name, sig, vec![ptr, pred, false_val])
        .ok_or_else(|| CodegenError::Internal(format!("{name} returned no value")))
}

/// Store `value` to `ptr` when `pred` holds.
///
/// # Errors
///
/// Returns [`CodegenError::TypeError`] if `ptr` is not a pointer.
pub fn ll_store(
    b: &mut Builder<'_>,
    ptr: Value,
    value: Value,
    pred: Value,
    cache: CacheModifier,
) -> CodegenResult<()> {
    let ptr_ty = b.value_type(&ptr);
    if !matches!(ptr_ty, LlType::Ptr(_)) {
        return Err(CodegenError::TypeError(format!(
            "store address has type {ptr_ty}"
        )));
    }
    let params = vec![ptr_ty, b.value_type(&value), LlType::I1];
    let name = mangle(
        &format!("{PREDICATED_STORE}{}", store_suffix(cache)),
        &params,
    );
    let sig = Signature::new(LlType::Void, params);
    b.call(&name, sig, vec![ptr, value, pred]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::{Function, Inst};

    fn kernel(params: &[LlType]) -> Function {
        Function::new("k", params.iter().cloned())
    }

    fn bpermutes(func: &Function) -> usize {
        func.count_calls("llvm.amdgcn.ds.bpermute")
    }

    #[test]
    fn test_shuffle_xor_i32() {
        let mut func = kernel(&[LlType::I32]);
        let v = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        let out = shuffle_xor(&mut b, v, 16).unwrap();
        assert_eq!(b.value_type(&out), LlType::I32);
        assert_eq!(bpermutes(&func), 1);
        assert!(func.insts().any(|i| matches!(
            i,
            Inst::Binary { op: crate::ll::BinOp::Xor, rhs: Value::Int(_, 16), .. }
        )));
    }

    #[test]
    fn test_shuffle_half_widens() {
        let mut func = kernel(&[LlType::Half]);
        let v = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        let out = shuffle_up(&mut b, v, 1).unwrap();
        assert_eq!(b.value_type(&out), LlType::Half);
        let casts: Vec<&str> = func
            .insts()
            .filter_map(|i| match i {
                Inst::Cast { op, .. } => Some(op.name()),
                _ => None,
            })
            .collect();
        assert_eq!(casts, vec!["bitcast", "sext", "trunc", "bitcast"]);
        assert_eq!(func.count_insts(|i| matches!(i, Inst::Select { .. })), 1);
    }

    #[test]
    fn test_shuffle_double_splits() {
        let mut func = kernel(&[LlType::Double]);
        let v = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        let out = shuffle_idx(&mut b, v, 3).unwrap();
        assert_eq!(b.value_type(&out), LlType::Double);
        assert_eq!(bpermutes(&func), 2);
    }

    #[test]
    fn test_shuffle_idx_dyn_uses_lane_value() {
        let mut func = kernel(&[LlType::Float, LlType::I32]);
        let (v, lane) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 32);
        shuffle_idx_dyn(&mut b, v, lane.clone()).unwrap();
        assert!(func.insts().any(|i| matches!(
            i,
            Inst::Binary { op: crate::ll::BinOp::Shl, lhs, .. } if *lhs == lane
        )));
    }

    #[test]
    fn test_shuffle_rejects_vectors() {
        let mut func = kernel(&[LlType::vector(4, LlType::Float)]);
        let v = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        assert!(matches!(
            shuffle_xor(&mut b, v, 1),
            Err(CodegenError::TypeError(_))
        ));
    }

    #[test]
    fn test_get_pid_axes() {
        let mut func = kernel(&[]);
        let mut b = Builder::new(&mut func, 64);
        get_pid(&mut b, 0).unwrap();
        get_pid(&mut b, 2).unwrap();
        assert_eq!(
            get_pid(&mut b, 3),
            Err(CodegenError::Unsupported("program id axis 3".to_string()))
        );
        assert!(func.externs.contains_key("llvm.amdgcn.workgroup.id.x"));
        assert!(func.externs.contains_key("llvm.amdgcn.workgroup.id.z"));
    }

    #[test]
    fn test_predicated_names() {
        let mut func = kernel(&[LlType::Ptr(1), LlType::I1]);
        let (ptr, pred) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 64);
        let vec4 = LlType::vector(4, LlType::Float);
        ll_load(
            &mut b,
            ptr.clone(),
            &vec4,
            pred.clone(),
            Value::Zero(vec4.clone()),
            CacheModifier::Cg,
        )
        .unwrap();
        ll_store(&mut b, ptr.clone(), Value::Float(LlType::Half, 1.0), pred.clone(), CacheModifier::Wt)
            .unwrap();
        ll_load(&mut b, ptr, &LlType::I32, pred, Value::i32(0), CacheModifier::Wb).unwrap();
        let names: Vec<&String> = func.externs.keys().collect();
        assert_eq!(
            names,
            vec![
                "__predicated_load_CG_p1_i1_v4f32",
                "__predicated_store_WT_p1_f16_i1",
                "__predicated_load_p1_i1_i32",
            ]
        );
    }

    #[test]
    fn test_load_fallback_type_is_checked() {
        let mut func = kernel(&[LlType::Ptr(1)]);
        let ptr = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        let err = ll_load(
            &mut b,
            ptr,
            &LlType::Float,
            Value::bool(true),
            Value::i32(0),
            CacheModifier::None,
        );
        assert!(matches!(err, Err(CodegenError::TypeError(_))));
    }
}
