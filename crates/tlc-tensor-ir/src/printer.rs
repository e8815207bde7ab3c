//! MLIR-style textual output.
//!
//! Blocked layouts are hoisted into aliases (`#blocked`, `#blocked1`, ...)
//! numbered in order of first appearance; slice and dot operand layouts are
//! printed inline around their parent's alias.

use crate::function::{Function, Module, Operation, ValueId};
use crate::ops::OpKind;
use crate::types::{DType, Type};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt::Write;
use tlc_layout::{BlockedLayout, Layout};

/// Print a module with its layout aliases and attribute block.
#[must_use]
pub fn print_module(module: &Module) -> String {
    let mut printer = Printer::default();
    for func in &module.functions {
        printer.collect_aliases(func);
    }
    let mut out = String::new();
    for (layout, alias) in &printer.aliases {
        let _ = writeln!(out, "{alias} = {layout}");
    }
    if !printer.aliases.is_empty() {
        out.push('\n');
    }
    let config = &module.config;
    let _ = write!(
        out,
        "module attributes {{\"ttg.num-ctas\" = {} : i32, \"ttg.num-warps\" = {} : i32, ttg.target = \"{}\"",
        config.num_ctas, config.num_warps, config.target
    );
    if let Ok(threads) = config.effective_threads_per_warp() {
        let _ = write!(out, ", \"ttg.threads-per-warp\" = {threads} : i32");
    }
    out.push_str("} {\n");
    for func in &module.functions {
        printer.print_function(func, &mut out);
    }
    out.push_str("}\n");
    out
}

/// Print a single function with its own alias table.
#[must_use]
pub fn print_function(func: &Function) -> String {
    let mut printer = Printer::default();
    printer.collect_aliases(func);
    let mut out = String::new();
    for (layout, alias) in &printer.aliases {
        let _ = writeln!(out, "{alias} = {layout}");
    }
    printer.print_function(func, &mut out);
    out
}

#[derive(Default)]
struct Printer {
    aliases: IndexMap<BlockedLayout, String>,
    names: FxHashMap<ValueId, String>,
}

impl Printer {
    fn collect_aliases(&mut self, func: &Function) {
        let values = func
            .args
            .iter()
            .chain(func.body_ops().flat_map(|(_, op)| op.results.iter()));
        for &value in values {
            if let Some(layout) = func.encoding(value) {
                self.alias_layout(layout);
            }
        }
    }

    fn alias_layout(&mut self, layout: &Layout) {
        match layout {
            Layout::Blocked(blocked) => {
                if !self.aliases.contains_key(blocked) {
                    let alias = match self.aliases.len() {
                        0 => "#blocked".to_string(),
                        n => format!("#blocked{n}"),
                    };
                    self.aliases.insert(blocked.clone(), alias);
                }
            }
            Layout::Slice(slice) => self.alias_layout(&slice.parent),
            Layout::DotOperand(dot) => self.alias_layout(&Layout::Blocked(dot.parent.clone())),
        }
    }

    fn layout(&self, layout: &Layout) -> String {
        match layout {
            Layout::Blocked(blocked) => self.blocked(blocked),
            Layout::Slice(slice) => format!(
                "#ttg.slice<{{dim = {}, parent = {}}}>",
                slice.dim,
                self.layout(&slice.parent)
            ),
            Layout::DotOperand(dot) => format!(
                "#ttg.dot_op<{{opIdx = {}, parent = {}, kWidth = {}}}>",
                dot.op_idx,
                self.blocked(&dot.parent),
                dot.k_width
            ),
        }
    }

    fn blocked(&self, blocked: &BlockedLayout) -> String {
        self.aliases
            .get(blocked)
            .cloned()
            .unwrap_or_else(|| blocked.to_string())
    }

    fn ty(&self, ty: &Type) -> String {
        match ty {
            Type::Tensor(tensor) => {
                let mut s = String::from("tensor<");
                for dim in &tensor.shape {
                    let _ = write!(s, "{dim}x");
                }
                let _ = write!(s, "{}", tensor.elem);
                if let Some(layout) = &tensor.encoding {
                    let _ = write!(s, ", {}", self.layout(layout));
                }
                s.push('>');
                s
            }
            other => other.to_string(),
        }
    }

    fn name(&self, value: ValueId) -> &str {
        self.names.get(&value).map_or("%<undef>", String::as_str)
    }

    fn names(&self, values: &[ValueId]) -> String {
        values
            .iter()
            .map(|&v| self.name(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn print_function(&mut self, func: &Function, out: &mut String) {
        self.names.clear();
        let mut args = Vec::with_capacity(func.args.len());
        for (i, &arg) in func.args.iter().enumerate() {
            let name = format!("%arg{i}");
            args.push(format!("{name}: {}", self.ty(func.value_type(arg))));
            self.names.insert(arg, name);
        }
        let _ = writeln!(out, "  tt.func public @{}({}) {{", func.name, args.join(", "));
        let mut next = 0;
        for (_, op) in func.body_ops() {
            for &result in &op.results {
                self.names.insert(result, format!("%{next}"));
                next += 1;
            }
            let line = self.op(func, op);
            if op.results.is_empty() {
                let _ = writeln!(out, "    {line}");
            } else {
                let _ = writeln!(out, "    {} = {line}", self.names(&op.results));
            }
        }
        out.push_str("  }\n");
    }

    fn op(&self, func: &Function, op: &Operation) -> String {
        let ty = |v: ValueId| self.ty(func.value_type(v));
        let operand = |i: usize| self.name(op.operands[i]);
        let result_ty = || op.result().map(&ty).unwrap_or_default();
        let dtype = |v: ValueId| {
            func.value_type(v)
                .elem()
                .and_then(|e| e.dtype())
                .unwrap_or(DType::Int32)
        };
        match &op.kind {
            OpKind::GetProgramId { axis } => {
                format!("tt.get_program_id {} : i32", axis_name(*axis))
            }
            OpKind::GetNumPrograms { axis } => {
                format!("tt.get_num_programs {} : i32", axis_name(*axis))
            }
            OpKind::MakeRange { start, end } => format!(
                "tt.make_range {{end = {end} : i32, start = {start} : i32}} : {}",
                result_ty()
            ),
            OpKind::Splat { .. } | OpKind::Broadcast { .. } => format!(
                "{} {} : {} -> {}",
                op.kind.name(),
                operand(0),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::ExpandDims { axis } => format!(
                "tt.expand_dims {} {{axis = {axis} : i32}} : {} -> {}",
                operand(0),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::Trans { order } => format!(
                "tt.trans {} {{order = array<i32: {}>}} : {} -> {}",
                operand(0),
                join(order),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::Constant { value, ty } => {
                if ty.is_tensor() {
                    format!("arith.constant dense<{value}> : {}", result_ty())
                } else {
                    format!("arith.constant {value} : {}", self.ty(ty))
                }
            }
            OpKind::Unary(unary) => format!(
                "{} {} : {}",
                unary.mnemonic(dtype(op.operands[0])),
                operand(0),
                result_ty()
            ),
            OpKind::Binary(binary) => {
                let elem = dtype(op.operands[0]);
                let predicate = binary
                    .predicate(elem)
                    .map(|p| format!("{p}, "))
                    .unwrap_or_default();
                format!(
                    "{} {predicate}{}, {} : {}",
                    binary.mnemonic(elem),
                    operand(0),
                    operand(1),
                    ty(op.operands[0])
                )
            }
            OpKind::Cast { to } => format!(
                "{} {} : {} to {}",
                cast_mnemonic(dtype(op.operands[0]), *to),
                operand(0),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::AddPtr => format!(
                "tt.addptr {}, {} : {}, {}",
                operand(0),
                operand(1),
                ty(op.operands[0]),
                ty(op.operands[1])
            ),
            OpKind::Select => format!(
                "arith.select {} : {}, {}",
                self.names(&op.operands),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::Load(attrs) | OpKind::Store(attrs) => {
                let mut extra = Vec::new();
                if !attrs.boundary_check.is_empty() {
                    extra.push(format!("boundaryCheck = array<i32: {}>", join(&attrs.boundary_check)));
                }
                if attrs.cache != crate::CacheModifier::None {
                    extra.push(format!("cache = {}", attrs.cache.name()));
                }
                if attrs.eviction != crate::EvictionPolicy::Normal {
                    extra.push(format!("evict = {}", attrs.eviction.name()));
                }
                if attrs.is_volatile {
                    extra.push("isVolatile = true".to_string());
                }
                if let Some(padding) = attrs.padding {
                    let name = match padding {
                        crate::Padding::Zero => "zero",
                        crate::Padding::Nan => "nan",
                    };
                    extra.push(format!("padding = {name}"));
                }
                let extra = if extra.is_empty() {
                    String::new()
                } else {
                    format!(" {{{}}}", extra.join(", "))
                };
                format!(
                    "{} {}{extra} : {}",
                    op.kind.name(),
                    self.names(&op.operands),
                    ty(op.operands[0])
                )
            }
            OpKind::MakeTensorPtr { shape, order } => {
                let rank = shape.len();
                let group = |range: std::ops::Range<usize>| self.names(&op.operands[range]);
                format!(
                    "tt.make_tensor_ptr {}, [{}], [{}], [{}] {{order = array<i32: {}>}} : {}",
                    operand(0),
                    group(1..1 + rank),
                    group(1 + rank..1 + 2 * rank),
                    group(1 + 2 * rank..1 + 3 * rank),
                    join(order),
                    result_ty()
                )
            }
            OpKind::Advance => format!(
                "tt.advance {}, [{}] : {}",
                operand(0),
                self.names(&op.operands[1..]),
                result_ty()
            ),
            OpKind::Dot => format!(
                "tt.dot {} : {} * {} -> {}",
                self.names(&op.operands),
                ty(op.operands[0]),
                ty(op.operands[1]),
                result_ty()
            ),
            OpKind::Reduce { axis, op: combiner } => format!(
                "tt.reduce {} {} {{axis = {axis} : i32}} : {} -> {}",
                combiner.name(),
                operand(0),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::ConvertLayout => format!(
                "ttg.convert_layout {} : {} -> {}",
                operand(0),
                ty(op.operands[0]),
                result_ty()
            ),
            OpKind::Return => "tt.return".to_string(),
        }
    }
}

fn axis_name(axis: u32) -> &'static str {
    match axis {
        0 => "x",
        1 => "y",
        _ => "z",
    }
}

fn join(values: &[u32]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn cast_mnemonic(from: DType, to: DType) -> &'static str {
    match (from.is_float(), to.is_float()) {
        (true, true) if to.bits() > from.bits() => "arith.extf",
        (true, true) => "arith.truncf",
        (false, false) if to.bits() > from.bits() => "arith.extsi",
        (false, false) => "arith.trunci",
        (false, true) => "arith.sitofp",
        (true, false) => "arith.fptosi",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ModuleConfig;
    use crate::infer::infer_layouts;
    use crate::{Builder, MemAttrs};

    #[test]
    fn test_print_annotated_module() {
        let config = ModuleConfig {
            num_warps: 4,
            target: "cuda:80".to_string(),
            ..ModuleConfig::default()
        };
        let mut func = Function::new("add_one", [Type::ptr(DType::Float32)]);
        let ptr = func.args[0];
        let mut b = Builder::new(&mut func);
        let range = b.make_range(0, 64).unwrap();
        let ptrs = b.splat(ptr, &[64]).unwrap();
        let ptrs = b.add_ptr(ptrs, range).unwrap();
        let x = b.load(ptrs, None, None, MemAttrs::default()).unwrap();
        let one = b.const_float(1.0, Type::tensor(&[64], DType::Float32)).unwrap();
        let y = b.binary(crate::BinaryOp::Add, x, one).unwrap();
        b.store(ptrs, y, None, MemAttrs::default()).unwrap();
        b.ret();
        infer_layouts(&mut func, &config.layout_config().unwrap()).unwrap();

        let mut module = Module::new("m", config);
        module.functions.push(func);
        let text = print_module(&module);
        assert!(text.starts_with("#blocked = #ttg.blocked<{sizePerThread = [1]"));
        assert!(text.contains("\"ttg.num-warps\" = 4 : i32"));
        assert!(text.contains("\"ttg.threads-per-warp\" = 32 : i32"));
        assert!(text.contains("ttg.target = \"cuda:80\""));
        assert!(text.contains("tt.func public @add_one(%arg0: !tt.ptr<f32>)"));
        assert!(text.contains(
            "%0 = tt.make_range {end = 64 : i32, start = 0 : i32} : tensor<64xi32, #blocked>"
        ));
        assert!(text.contains("arith.constant dense<1.000000e+00> : tensor<64xf32, #blocked>"));
        assert!(text.contains("arith.addf %3, %4 : tensor<64xf32, #blocked>"));
        assert!(text.contains("tt.store %2, %5 : tensor<64x!tt.ptr<f32>, #blocked>"));
        assert!(text.trim_end().ends_with('}'));
    }

    #[test]
    fn test_slice_prints_parent_alias() {
        let config = tlc_layout::LayoutConfig::new(4, 32, 1);
        let mut func = Function::new("k", [Type::tensor(&[16, 16], DType::Float32)]);
        let x = func.args[0];
        let mut b = Builder::new(&mut func);
        b.reduce(x, 0, crate::ReduceOp::Sum).unwrap();
        b.ret();
        infer_layouts(&mut func, &config).unwrap();
        let text = print_function(&func);
        assert!(text.contains(
            "tt.reduce sum %arg0 {axis = 0 : i32} : tensor<16x16xf32, #blocked> -> \
             tensor<16xf32, #ttg.slice<{dim = 0, parent = #blocked}>>"
        ));
        assert!(!text.contains("#blocked1"));
    }
}
