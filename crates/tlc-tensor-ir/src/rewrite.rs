//! Pattern-based rewriting.

use crate::function::{Function, OpId};
use crate::IrResult;
use tracing::{trace, warn};

/// A local rewrite rooted at one operation.
pub trait RewritePattern {
    /// Pattern name for logging.
    fn name(&self) -> &'static str;

    /// Rewrite `op` if the pattern matches, returning whether anything
    /// changed. `op` is live when called.
    ///
    /// # Errors
    ///
    /// Returns an error if a matched rewrite cannot be completed.
    fn match_and_rewrite(&self, func: &mut Function, op: OpId) -> IrResult<bool>;
}

/// Limits for [`apply_patterns_greedily`].
#[derive(Clone, Copy, Debug)]
pub struct GreedyConfig {
    /// Maximum sweeps over the function.
    pub max_iterations: usize,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self { max_iterations: 16 }
    }
}

/// Apply `patterns` to every operation until a sweep changes nothing or
/// the iteration limit is hit. Returns whether anything changed.
///
/// # Errors
///
/// Propagates the first pattern error.
pub fn apply_patterns_greedily(
    func: &mut Function,
    patterns: &[&dyn RewritePattern],
    config: GreedyConfig,
) -> IrResult<bool> {
    let mut changed_any = false;
    for iteration in 0..config.max_iterations {
        let mut changed = false;
        let worklist = func.body.clone();
        for op in worklist {
            for pattern in patterns {
                if func.op(op).erased {
                    break;
                }
                if pattern.match_and_rewrite(func, op)? {
                    trace!(pattern = pattern.name(), ?op, "applied");
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(changed_any);
        }
        changed_any = true;
        trace!(iteration, "rewrite sweep changed the function");
    }
    warn!(
        function = %func.name,
        max_iterations = config.max_iterations,
        "pattern rewriting did not converge"
    );
    Ok(changed_any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpKind, UnaryOp};
    use crate::types::{DType, Type};
    use crate::Builder;

    /// Erases `neg(neg(x))`.
    struct DoubleNeg;

    impl RewritePattern for DoubleNeg {
        fn name(&self) -> &'static str {
            "double-neg"
        }

        fn match_and_rewrite(&self, func: &mut Function, op: OpId) -> IrResult<bool> {
            if func.op(op).kind != OpKind::Unary(UnaryOp::Neg) {
                return Ok(false);
            }
            let inner = func.op(op).operands[0];
            let Some(def) = func.defining_op(inner) else {
                return Ok(false);
            };
            if func.op(def).kind != OpKind::Unary(UnaryOp::Neg) {
                return Ok(false);
            }
            let source = func.op(def).operands[0];
            let result = func.op(op).results[0];
            func.replace_all_uses(result, source);
            func.erase_op(op);
            if !func.has_uses(inner) {
                func.erase_op(def);
            }
            Ok(true)
        }
    }

    #[test]
    fn test_greedy_reaches_fixpoint() {
        let mut func = Function::new("k", [Type::scalar(DType::Int32)]);
        let x = func.args[0];
        let mut b = Builder::new(&mut func);
        let mut v = x;
        for _ in 0..4 {
            v = b.unary(UnaryOp::Neg, v).unwrap();
        }
        b.binary(crate::BinaryOp::Add, v, v).unwrap();
        let changed =
            apply_patterns_greedily(&mut func, &[&DoubleNeg], GreedyConfig::default()).unwrap();
        assert!(changed);
        assert_eq!(func.num_ops(), 1);
        let add = func.body[0];
        assert_eq!(func.op(add).operands.as_slice(), &[x, x]);
    }

    #[test]
    fn test_greedy_reports_no_change() {
        let mut func = Function::new("k", [Type::scalar(DType::Int32)]);
        let x = func.args[0];
        Builder::new(&mut func).unary(UnaryOp::Neg, x).unwrap();
        let changed =
            apply_patterns_greedily(&mut func, &[&DoubleNeg], GreedyConfig::default()).unwrap();
        assert!(!changed);
    }
}
