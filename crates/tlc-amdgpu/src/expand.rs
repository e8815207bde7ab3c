//! Expansion of predicated load and store calls into branches.
//!
//! ```text
//! block:                         block:
//!   %v = call @__predicated_load   br %pred, label %pred.load, label %pred.join
//!   ...                 ==>      pred.load:
//!                                  %t = load %ptr
//!                                  br label %pred.join
//!                                pred.join:
//!                                  %v = phi [ %t, %pred.load ], [ %false, %block ]
//!                                  ...
//! ```
//!
//! Cache modifiers in the callee name become markers on the plain access:
//!
//! | Helper | Marker |
//! |--------|--------|
//! | `__predicated_load_CG` | volatile |
//! | `__predicated_load_CA` | nontemporal |
//! | `__predicated_store_WT` | volatile |
//! | `__predicated_store_CG`, `__predicated_store_CS` | nontemporal |

use crate::ll::{BlockId, Function, Inst, MemFlags, Value};
use crate::primitives::{PREDICATED_LOAD, PREDICATED_STORE};
use crate::{CodegenError, CodegenResult};
use tracing::debug;

fn is_predicated_call(inst: &Inst) -> bool {
    matches!(inst, Inst::Call { callee, .. }
        if callee.starts_with(PREDICATED_LOAD) || callee.starts_with(PREDICATED_STORE))
}

fn flags_for(callee: &str) -> MemFlags {
    let load = callee.starts_with(PREDICATED_LOAD);
    let modifier = |m: &str| callee.contains(&format!("_{m}_")) || callee.ends_with(&format!("_{m}"));
    if load {
        MemFlags {
            volatile: modifier("CG"),
            nontemporal: modifier("CA"),
        }
    } else {
        MemFlags {
            volatile: modifier("WT"),
            nontemporal: modifier("CG") || modifier("CS"),
        }
    }
}

/// Replace every predicated call with a conditional branch around a plain
/// access. Returns the number of calls expanded.
///
/// # Errors
///
/// Returns [`CodegenError::Internal`] if a predicated call has the wrong
/// number of arguments, or a load has no result.
pub fn expand_predicated_calls(func: &mut Function) -> CodegenResult<usize> {
    let mut expanded = 0;
    let mut i = 0;
    while i < func.layout.len() {
        let block = func.layout[i];
        let Some(pos) = func.blocks[block].insts.iter().position(is_predicated_call) else {
            i += 1;
            continue;
        };
        expanded += 1;
        if !inline_unconditional(func, block, pos)? {
            split_at_call(func, block, pos)?;
            // The rest of the block moved to a join block placed after it.
            i += 1;
        }
    }
    func.externs
        .retain(|name, _| !name.starts_with(PREDICATED_LOAD) && !name.starts_with(PREDICATED_STORE));
    debug!(function = %func.name, expanded, "expanded predicated accesses");
    Ok(expanded)
}

/// Replace a call whose predicate is a true constant with the plain access.
fn inline_unconditional(func: &mut Function, block: BlockId, pos: usize) -> CodegenResult<bool> {
    let Inst::Call { dst, callee, args } = &func.blocks[block].insts[pos] else {
        return Ok(false);
    };
    let load = callee.starts_with(PREDICATED_LOAD);
    let pred = args.get(if load { 1 } else { 2 });
    if !matches!(pred.and_then(Value::as_int), Some(v) if v != 0) {
        return Ok(false);
    }
    let arg = |i: usize| {
        args.get(i)
            .cloned()
            .ok_or_else(|| CodegenError::Internal(format!("{callee} expects 3 arguments")))
    };
    let flags = flags_for(callee);
    let inst = if load {
        let dst = (*dst).ok_or_else(|| CodegenError::Internal(format!("{callee} has no result")))?;
        Inst::Load {
            dst,
            ptr: arg(0)?,
            flags,
        }
    } else {
        Inst::Store {
            value: arg(1)?,
            ptr: arg(0)?,
            flags,
        }
    };
    func.blocks[block].insts[pos] = inst;
    Ok(true)
}

fn split_at_call(func: &mut Function, block: BlockId, pos: usize) -> CodegenResult<()> {
    let tail = func.blocks[block].insts.split_off(pos + 1);
    let Some(Inst::Call { dst, callee, args }) = func.blocks[block].insts.pop() else {
        return Err(CodegenError::Internal(
            "predicated call vanished during expansion".to_string(),
        ));
    };
    let load = callee.starts_with(PREDICATED_LOAD);
    let guarded = func.insert_block_after(block, if load { "pred.load" } else { "pred.store" });
    let join = func.insert_block_after(guarded, "pred.join");

    // Successors of the split block now see the join block as predecessor.
    for b in func.blocks.iter_mut() {
        for inst in &mut b.insts {
            if let Inst::Phi { incoming, .. } = inst {
                for (_, from) in incoming.iter_mut() {
                    if *from == block {
                        *from = join;
                    }
                }
            }
        }
    }

    let flags = flags_for(&callee);
    let mut join_insts = Vec::with_capacity(tail.len() + 1);
    let pred = if load {
        let [ptr, pred, false_val]: [Value; 3] = args.try_into().map_err(|_| {
            CodegenError::Internal(format!("{callee} expects 3 arguments"))
        })?;
        let dst = dst.ok_or_else(|| CodegenError::Internal(format!("{callee} has no result")))?;
        let loaded = func.new_reg(func.regs[dst].clone());
        func.blocks[guarded].insts = vec![
            Inst::Load {
                dst: loaded,
                ptr,
                flags,
            },
            Inst::Br { target: join },
        ];
        join_insts.push(Inst::Phi {
            dst,
            incoming: vec![(Value::Reg(loaded), guarded), (false_val, block)],
        });
        pred
    } else {
        let [ptr, value, pred]: [Value; 3] = args.try_into().map_err(|_| {
            CodegenError::Internal(format!("{callee} expects 3 arguments"))
        })?;
        func.blocks[guarded].insts = vec![
            Inst::Store { value, ptr, flags },
            Inst::Br { target: join },
        ];
        pred
    };
    join_insts.extend(tail);
    func.blocks[join].insts = join_insts;
    func.blocks[block].insts.push(Inst::CondBr {
        cond: pred,
        on_true: guarded,
        on_false: join,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::{Builder, LlType};
    use crate::primitives::{ll_load, ll_store};
    use tlc_tensor_ir::CacheModifier;

    #[test]
    fn test_store_is_guarded() {
        let mut func = Function::new("k", [LlType::Ptr(1), LlType::Float, LlType::I1]);
        let p: Vec<Value> = func.params.iter().map(|r| Value::Reg(*r)).collect();
        let mut b = Builder::new(&mut func, 64);
        ll_store(&mut b, p[0].clone(), p[1].clone(), p[2].clone(), CacheModifier::Cs).unwrap();
        b.ret();

        assert_eq!(expand_predicated_calls(&mut func).unwrap(), 1);
        assert_eq!(func.layout.len(), 3);
        let entry = &func.blocks[func.layout[0]].insts;
        assert!(matches!(entry.last(), Some(Inst::CondBr { cond, .. }) if *cond == p[2]));
        let guarded = &func.blocks[func.layout[1]].insts;
        assert!(matches!(
            guarded[0],
            Inst::Store { flags: MemFlags { volatile: false, nontemporal: true }, .. }
        ));
        assert!(matches!(func.blocks[func.layout[2]].insts[0], Inst::Ret));
        assert!(func.externs.is_empty());
    }

    #[test]
    fn test_load_merges_through_phi() {
        let mut func = Function::new("k", [LlType::Ptr(1), LlType::I1]);
        let (ptr, pred) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 64);
        let v = ll_load(
            &mut b,
            ptr.clone(),
            &LlType::Float,
            pred.clone(),
            Value::Float(LlType::Float, 0.0),
            CacheModifier::Cg,
        )
        .unwrap();
        let w = ll_load(&mut b, ptr, &LlType::Float, pred, v.clone(), CacheModifier::None).unwrap();
        b.ret();

        assert_eq!(expand_predicated_calls(&mut func).unwrap(), 2);
        assert_eq!(func.layout.len(), 5);
        assert_eq!(func.count_calls("__predicated"), 0);

        // The first join defines `v` and hands `v` to the second fallback.
        let first_join = &func.blocks[func.layout[2]].insts;
        let Inst::Phi { dst, incoming } = &first_join[0] else {
            panic!("expected a phi, found {:?}", first_join[0]);
        };
        assert_eq!(Value::Reg(*dst), v);
        assert_eq!(incoming[1], (Value::Float(LlType::Float, 0.0), func.layout[0]));
        let first_load = &func.blocks[func.layout[1]].insts[0];
        assert!(matches!(first_load, Inst::Load { flags: MemFlags { volatile: true, .. }, .. }));

        let second_join = &func.blocks[func.layout[4]].insts;
        let Inst::Phi { dst, incoming } = &second_join[0] else {
            panic!("expected a phi, found {:?}", second_join[0]);
        };
        assert_eq!(Value::Reg(*dst), w);
        assert_eq!(incoming[1], (v, func.layout[2]));
        assert!(matches!(second_join.last(), Some(Inst::Ret)));
    }

    #[test]
    fn test_existing_phis_follow_the_split() {
        let mut func = Function::new("k", [LlType::Ptr(1), LlType::I1]);
        let (ptr, pred) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 64);
        let exit = b.append_block("exit");
        ll_store(&mut b, ptr, Value::i32(1), pred, CacheModifier::None).unwrap();
        b.br(exit);
        let entry = b.block();
        b.position_at_end(exit);
        b.phi(LlType::I32, vec![(Value::i32(7), entry)]);
        b.ret();

        expand_predicated_calls(&mut func).unwrap();
        let join = func.layout[2];
        let exit_phi = func
            .insts()
            .find_map(|i| match i {
                Inst::Phi { incoming, .. } => Some(incoming.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(exit_phi, vec![(Value::i32(7), join)]);
    }

    #[test]
    fn test_unconditional_access_stays_inline() {
        let mut func = Function::new("k", [LlType::Ptr(1)]);
        let ptr = Value::Reg(func.params[0]);
        let mut b = Builder::new(&mut func, 64);
        let v = ll_load(
            &mut b,
            ptr.clone(),
            &LlType::I32,
            Value::bool(true),
            Value::i32(0),
            CacheModifier::None,
        )
        .unwrap();
        ll_store(&mut b, ptr, v.clone(), Value::bool(true), CacheModifier::Wt).unwrap();
        b.ret();

        assert_eq!(expand_predicated_calls(&mut func).unwrap(), 2);
        assert_eq!(func.layout.len(), 1);
        let insts = &func.blocks[func.entry()].insts;
        assert!(matches!(&insts[0], Inst::Load { dst, .. } if Value::Reg(*dst) == v));
        assert!(matches!(
            insts[1],
            Inst::Store { flags: MemFlags { volatile: true, .. }, .. }
        ));
        assert!(matches!(insts[2], Inst::Ret));
    }

    #[test]
    fn test_markers() {
        assert_eq!(
            flags_for("__predicated_load_CA_p1_i1_f32"),
            MemFlags { volatile: false, nontemporal: true }
        );
        assert_eq!(
            flags_for("__predicated_store_WT_p1_f32_i1"),
            MemFlags { volatile: true, nontemporal: false }
        );
        assert_eq!(flags_for("__predicated_load_p1_i1_f32"), MemFlags::default());
    }
}
