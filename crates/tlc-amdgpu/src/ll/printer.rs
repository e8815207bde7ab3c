//! Textual LLVM IR.

use super::{Function, Global, Inst, LlType, Module, Signature, Value};
use std::fmt::{self, Write};
use tlc_index::Idx;

impl fmt::Display for LlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Int(n) => write!(f, "i{n}"),
            Self::Half => f.write_str("half"),
            Self::BFloat => f.write_str("bfloat"),
            Self::Float => f.write_str("float"),
            Self::Double => f.write_str("double"),
            Self::Ptr(0) => f.write_str("ptr"),
            Self::Ptr(space) => write!(f, "ptr addrspace({space})"),
            Self::Vector(n, elem) => write!(f, "<{n} x {elem}>"),
        }
    }
}

/// LLVM spelling of a float constant: decimal when the value survives the
/// round trip through the type, the 64-bit hex pattern otherwise.
fn fmt_float(ty: &LlType, v: f64) -> String {
    let exact = match ty {
        // Narrow values are represented exactly as f32 by construction.
        #[allow(clippy::cast_possible_truncation)]
        LlType::Float | LlType::Half | LlType::BFloat => f64::from(v as f32) == v,
        _ => true,
    };
    if v.is_finite() && exact {
        let text = format!("{v:.6e}");
        if let Some((mantissa, exp)) = text.split_once('e') {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            return format!("{mantissa}e{sign}{:02}", exp.abs());
        }
        text
    } else {
        format!("0x{:016X}", v.to_bits())
    }
}

/// A value in operand position, without its type.
fn operand(value: &Value) -> String {
    match value {
        Value::Reg(r) => format!("%{}", r.index()),
        Value::Int(LlType::Int(1), v) => (if *v == 0 { "false" } else { "true" }).to_string(),
        Value::Int(_, v) => v.to_string(),
        Value::Float(ty, v) => fmt_float(ty, *v),
        Value::Zero(ty) => match ty {
            LlType::Vector(..) => "zeroinitializer".to_string(),
            LlType::Ptr(_) => "null".to_string(),
            t if t.is_float() => fmt_float(t, 0.0),
            _ => "0".to_string(),
        },
        Value::Undef(_) => "undef".to_string(),
        Value::Global(name, _) => format!("@{name}"),
    }
}

fn typed(func: &Function, value: &Value) -> String {
    format!("{} {}", func.value_type(value), operand(value))
}

fn signature(name: &str, sig: &Signature) -> String {
    let params: Vec<String> = sig.params.iter().map(ToString::to_string).collect();
    format!("declare {} @{name}({})", sig.ret, params.join(", "))
}

fn write_inst(out: &mut String, func: &Function, inst: &Inst) -> fmt::Result {
    let reg = |r: &super::Reg| format!("%{}", r.index());
    let label = |b: &super::BlockId| format!("%{}", func.blocks[*b].label);
    match inst {
        Inst::Binary { dst, op, lhs, rhs } => writeln!(
            out,
            "  {} = {} {}, {}",
            reg(dst),
            op.name(),
            typed(func, lhs),
            operand(rhs)
        ),
        Inst::FNeg { dst, value } => writeln!(out, "  {} = fneg {}", reg(dst), typed(func, value)),
        Inst::ICmp {
            dst,
            pred,
            lhs,
            rhs,
        } => writeln!(
            out,
            "  {} = icmp {} {}, {}",
            reg(dst),
            pred.name(),
            typed(func, lhs),
            operand(rhs)
        ),
        Inst::FCmp {
            dst,
            pred,
            lhs,
            rhs,
        } => writeln!(
            out,
            "  {} = fcmp {} {}, {}",
            reg(dst),
            pred.name(),
            typed(func, lhs),
            operand(rhs)
        ),
        Inst::Cast { dst, op, value, to } => writeln!(
            out,
            "  {} = {} {} to {to}",
            reg(dst),
            op.name(),
            typed(func, value)
        ),
        Inst::Select {
            dst,
            cond,
            on_true,
            on_false,
        } => writeln!(
            out,
            "  {} = select {}, {}, {}",
            reg(dst),
            typed(func, cond),
            typed(func, on_true),
            typed(func, on_false)
        ),
        Inst::ExtractElement { dst, vector, index } => writeln!(
            out,
            "  {} = extractelement {}, {}",
            reg(dst),
            typed(func, vector),
            typed(func, index)
        ),
        Inst::InsertElement {
            dst,
            vector,
            value,
            index,
        } => writeln!(
            out,
            "  {} = insertelement {}, {}, {}",
            reg(dst),
            typed(func, vector),
            typed(func, value),
            typed(func, index)
        ),
        Inst::Gep {
            dst,
            elem,
            base,
            index,
        } => writeln!(
            out,
            "  {} = getelementptr inbounds {elem}, {}, {}",
            reg(dst),
            typed(func, base),
            typed(func, index)
        ),
        Inst::Load { dst, ptr, flags } => {
            let volatile = if flags.volatile { "volatile " } else { "" };
            let meta = if flags.nontemporal {
                ", !nontemporal !0"
            } else {
                ""
            };
            writeln!(
                out,
                "  {} = load {volatile}{}, {}{meta}",
                reg(dst),
                func.regs[*dst],
                typed(func, ptr)
            )
        }
        Inst::Store { value, ptr, flags } => {
            let volatile = if flags.volatile { "volatile " } else { "" };
            let meta = if flags.nontemporal {
                ", !nontemporal !0"
            } else {
                ""
            };
            writeln!(
                out,
                "  store {volatile}{}, {}{meta}",
                typed(func, value),
                typed(func, ptr)
            )
        }
        Inst::Call { dst, callee, args } => {
            let ret = func
                .externs
                .get(callee)
                .map_or_else(|| "void".to_string(), |s| s.ret.to_string());
            let args: Vec<String> = args.iter().map(|a| typed(func, a)).collect();
            match dst {
                Some(d) => writeln!(out, "  {} = call {ret} @{callee}({})", reg(d), args.join(", ")),
                None => writeln!(out, "  call {ret} @{callee}({})", args.join(", ")),
            }
        }
        Inst::Phi { dst, incoming } => {
            let arms: Vec<String> = incoming
                .iter()
                .map(|(v, b)| format!("[ {}, {} ]", operand(v), label(b)))
                .collect();
            writeln!(
                out,
                "  {} = phi {} {}",
                reg(dst),
                func.regs[*dst],
                arms.join(", ")
            )
        }
        Inst::Br { target } => writeln!(out, "  br label {}", label(target)),
        Inst::CondBr {
            cond,
            on_true,
            on_false,
        } => writeln!(
            out,
            "  br {}, label {}, label {}",
            typed(func, cond),
            label(on_true),
            label(on_false)
        ),
        Inst::Ret => writeln!(out, "  ret void"),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} %{}", self.regs[*p], p.index()))
            .collect();
        let cc = if self.kernel { "amdgpu_kernel " } else { "" };
        write!(f, "define {cc}void @{}({})", self.name, params.join(", "))?;
        if !self.attributes.is_empty() {
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("\"{k}\"=\"{v}\""))
                .collect();
            write!(f, " {}", attrs.join(" "))?;
        }
        writeln!(f, " {{")?;
        let mut body = String::new();
        for (i, &block) in self.layout.iter().enumerate() {
            if i > 0 {
                body.push('\n');
            }
            writeln!(body, "{}:", self.blocks[block].label)?;
            for inst in &self.blocks[block].insts {
                write_inst(&mut body, self, inst)?;
            }
        }
        f.write_str(&body)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{} = external addrspace({}) global [0 x i8], align {}",
            self.name, self.addrspace, self.align
        )
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        writeln!(f, "target triple = \"{}\"", self.triple)?;
        writeln!(f, "; target-cpu = {}", self.cpu)?;
        for global in &self.globals {
            writeln!(f)?;
            writeln!(f, "{global}")?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{func}")?;
        }
        let externs = self.externs();
        if !externs.is_empty() {
            writeln!(f)?;
        }
        for (name, sig) in &externs {
            writeln!(f, "{}", signature(name, sig))?;
        }
        let nontemporal = self
            .functions
            .iter()
            .flat_map(Function::insts)
            .any(|i| match i {
                Inst::Load { flags, .. } | Inst::Store { flags, .. } => flags.nontemporal,
                _ => false,
            });
        if nontemporal {
            writeln!(f)?;
            writeln!(f, "!0 = !{{i32 1}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Builder, MemFlags, GLOBAL_ADDRSPACE};
    use super::*;

    #[test]
    fn test_type_spelling() {
        assert_eq!(LlType::Ptr(GLOBAL_ADDRSPACE).to_string(), "ptr addrspace(1)");
        assert_eq!(LlType::vector(4, LlType::Float).to_string(), "<4 x float>");
        assert_eq!(LlType::vector(1, LlType::Half).to_string(), "half");
        assert_eq!(LlType::vector(2, LlType::Half).mangle(), "v2f16");
    }

    #[test]
    fn test_float_constants() {
        assert_eq!(fmt_float(&LlType::Float, 1.0), "1.000000e+00");
        assert_eq!(fmt_float(&LlType::Double, -0.125), "-1.250000e-01");
        assert_eq!(fmt_float(&LlType::Float, f64::NAN), "0x7FF8000000000000");
        assert_eq!(fmt_float(&LlType::Float, 0.1), "0x3FB999999999999A");
    }

    #[test]
    fn test_print_kernel() {
        let mut func = Function::new("copy", [LlType::Ptr(1), LlType::Ptr(1)]);
        func.kernel = true;
        let (src, dst) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 64);
        let tid = b.thread_id();
        let from = b.gep(LlType::Float, src, tid.clone());
        let to = b.gep(LlType::Float, dst, tid);
        let v = b.load(LlType::Float, from, MemFlags::default());
        b.store(
            v,
            to,
            MemFlags {
                volatile: false,
                nontemporal: true,
            },
        );
        b.ret();
        let mut module = Module::new("m", "gfx90a");
        module.functions.push(func);
        let text = module.to_string();
        assert!(text.contains("target triple = \"amdgcn-amd-amdhsa\""));
        assert!(text.contains("define amdgpu_kernel void @copy(ptr addrspace(1) %0, ptr addrspace(1) %1) {"));
        assert!(text.contains("%2 = call i32 @llvm.amdgcn.workitem.id.x()"));
        assert!(text.contains("%3 = getelementptr inbounds float, ptr addrspace(1) %0, i32 %2"));
        assert!(text.contains("%5 = load float, ptr addrspace(1) %3"));
        assert!(text.contains("store float %5, ptr addrspace(1) %4, !nontemporal !0"));
        assert!(text.contains("declare i32 @llvm.amdgcn.workitem.id.x()"));
        assert!(text.contains("!0 = !{i32 1}"));
        assert!(text.contains("  ret void\n}"));
    }
}
