//! End-to-end tests of verification, inference, coalescing and
//! canonicalization on small kernels.

use tlc_layout::{BlockedLayout, Layout, LayoutConfig, SliceLayout};
use tlc_target::GpuTarget;
use tlc_tensor_ir::canonicalize::canonicalize;
use tlc_tensor_ir::coalesce::coalesce;
use tlc_tensor_ir::infer::infer_layouts;
use tlc_tensor_ir::printer::print_module;
use tlc_tensor_ir::verifier::{verify_layouts, verify_module};
use tlc_tensor_ir::{
    BinaryOp, Builder, DType, ElemType, Function, IrError, MemAttrs, Module, ModuleConfig, OpId,
    OpKind, ReduceOp, Type, ValueId,
};

/// Pointers `base + row * cols + col` over a `rows x cols` tile.
fn pointer_grid(b: &mut Builder<'_>, base: ValueId, rows: u32, cols: u32) -> ValueId {
    let r = b.make_range(0, rows as i32).unwrap();
    let r = b.expand_dims(r, 1).unwrap();
    let stride = b
        .const_int(i64::from(cols), Type::tensor(&[rows, 1], DType::Int32))
        .unwrap();
    let r = b.binary(BinaryOp::Mul, r, stride).unwrap();
    let r = b.broadcast(r, &[rows, cols]).unwrap();
    let c = b.make_range(0, cols as i32).unwrap();
    let c = b.expand_dims(c, 0).unwrap();
    let c = b.broadcast(c, &[rows, cols]).unwrap();
    let offsets = b.binary(BinaryOp::Add, r, c).unwrap();
    let ptrs = b.splat(base, &[rows, cols]).unwrap();
    b.add_ptr(ptrs, offsets).unwrap()
}

fn memory_ops(func: &Function) -> Vec<OpId> {
    func.body_ops()
        .filter(|(_, op)| op.kind.is_memory_access())
        .map(|(id, _)| id)
        .collect()
}

fn conversion_target(func: &Function, value: ValueId) -> Option<&Layout> {
    let def = func.defining_op(value)?;
    (func.op(def).kind == OpKind::ConvertLayout).then(|| func.encoding(value))?
}

#[test]
fn test_dot_warps_are_balanced() {
    let config = ModuleConfig {
        num_warps: 2,
        threads_per_warp: Some(64),
        target: "hip:gfx90a".to_string(),
        ..ModuleConfig::default()
    };
    let layout_config = config.layout_config().unwrap();
    let mut func = Function::new(
        "matmul",
        [
            Type::ptr(DType::Float16),
            Type::ptr(DType::Float16),
            Type::ptr(DType::Float32),
        ],
    );
    let (pa, pb, pc) = (func.args[0], func.args[1], func.args[2]);
    let mut b = Builder::new(&mut func);
    let a_ptrs = pointer_grid(&mut b, pa, 128, 32);
    let b_ptrs = pointer_grid(&mut b, pb, 32, 128);
    let c_ptrs = pointer_grid(&mut b, pc, 128, 128);
    let a = b.load(a_ptrs, None, None, MemAttrs::default()).unwrap();
    let bm = b.load(b_ptrs, None, None, MemAttrs::default()).unwrap();
    let zero = b
        .const_float(0.0, Type::tensor(&[128, 128], DType::Float32))
        .unwrap();
    let acc = b.dot(a, bm, zero).unwrap();
    b.store(c_ptrs, acc, None, MemAttrs::default()).unwrap();
    b.ret();

    infer_layouts(&mut func, &layout_config).unwrap();
    verify_layouts(&func, &layout_config).unwrap();

    let Some(Layout::Blocked(dot)) = func.encoding(acc) else {
        panic!("dot result is not blocked");
    };
    assert_eq!(dot.warps_per_cta.as_slice(), &[2, 1]);
    assert_eq!(dot.threads_per_warp.iter().product::<u32>(), 64);
    assert_eq!(func.encoding(zero), func.encoding(acc));

    let dot_op = func.defining_op(acc).unwrap();
    for (index, operand) in func.op(dot_op).operands[..2].iter().enumerate() {
        match conversion_target(&func, *operand) {
            Some(Layout::DotOperand(layout)) => {
                assert_eq!(layout.op_idx as usize, index);
                assert_eq!(&layout.parent, dot);
                assert_eq!(layout.k_width, 4);
            }
            other => panic!("operand {index} not converted to a dot operand: {other:?}"),
        }
    }

    let mut module = Module::new("matmul", config);
    module.functions.push(func);
    let text = print_module(&module);
    assert!(text.contains("\"ttg.threads-per-warp\" = 64 : i32"));
    assert!(text.contains("\"ttg.num-warps\" = 2 : i32"));
    assert!(text.contains("#ttg.dot_op<{opIdx = 0, parent = #blocked"));
}

#[test]
fn test_transpose_copy_converts_each_operand_once() {
    let config = LayoutConfig::new(4, 64, 1);
    let rows_fast = BlockedLayout::default_for(&[64, 64], &config).unwrap();
    let cols_fast = BlockedLayout::with_size_per_thread(
        &[64, 64],
        [1, 1].into_iter().collect(),
        [0, 1].into_iter().collect(),
        &config,
    )
    .unwrap();
    let tensor = |elem: ElemType, layout: &BlockedLayout| {
        Type::tensor(&[64, 64], elem).with_encoding(Some(layout.clone().into()))
    };
    let mut func = Function::new(
        "transpose",
        [
            tensor(ElemType::Ptr(DType::Float32), &rows_fast),
            tensor(ElemType::Scalar(DType::Bool), &rows_fast),
            tensor(ElemType::Scalar(DType::Float32), &rows_fast),
            tensor(ElemType::Ptr(DType::Float32), &cols_fast),
            tensor(ElemType::Scalar(DType::Bool), &cols_fast),
        ],
    );
    let args = func.args.clone();
    let mut b = Builder::new(&mut func);
    let x = b
        .load(args[0], Some(args[1]), Some(args[2]), MemAttrs::default())
        .unwrap();
    b.store(args[3], x, Some(args[4]), MemAttrs::default()).unwrap();
    b.ret();

    let target = GpuTarget::default();
    infer_layouts(&mut func, &config).unwrap();
    coalesce(&mut func, &target, &config).unwrap();
    canonicalize(&mut func).unwrap();
    verify_layouts(&func, &config).unwrap();

    let ops = memory_ops(&func);
    let (load, store) = (ops[0], ops[1]);
    let load_layout = func.encoding(func.op(load).results[0]).unwrap().clone();
    assert_eq!(load_layout.order().as_slice(), &[1, 0]);
    assert_eq!(load_layout.size_per_thread().as_slice(), &[1, 4]);
    for &operand in &func.op(load).operands {
        assert_eq!(conversion_target(&func, operand), Some(&load_layout));
    }

    let store_layout = func.encoding(func.op(store).operands[0]).unwrap().clone();
    assert_eq!(store_layout.order().as_slice(), &[0, 1]);
    assert_eq!(store_layout.size_per_thread().as_slice(), &[4, 1]);
    for &operand in &func.op(store).operands {
        assert_eq!(conversion_target(&func, operand), Some(&store_layout));
    }
    assert_eq!(func.count_ops(|k| *k == OpKind::ConvertLayout), 6);

    let before = func.clone();
    assert_eq!(coalesce(&mut func, &target, &config).unwrap(), 0);
    assert_eq!(func, before);
}

#[test]
fn test_mixed_widths_share_one_arrangement() {
    let config = LayoutConfig::new(4, 32, 1);
    let target = GpuTarget::cuda(80);
    let mut func = Function::new(
        "mixed",
        [
            Type::ptr(DType::Float32),
            Type::ptr(DType::Float16),
            Type::ptr(DType::Float32),
        ],
    );
    let (pa, pb, pc) = (func.args[0], func.args[1], func.args[2]);
    let mut b = Builder::new(&mut func);
    let offsets = b.make_range(0, 1024).unwrap();
    let mut ptrs = Vec::new();
    for base in [pa, pb, pc] {
        let splat = b.splat(base, &[1024]).unwrap();
        ptrs.push(b.add_ptr(splat, offsets).unwrap());
    }
    let wide = b.load(ptrs[0], None, None, MemAttrs::default()).unwrap();
    let narrow = b.load(ptrs[1], None, None, MemAttrs::default()).unwrap();
    let widened = b.cast(narrow, DType::Float32).unwrap();
    let sum = b.binary(BinaryOp::Add, wide, widened).unwrap();
    b.store(ptrs[2], sum, None, MemAttrs::default()).unwrap();
    b.ret();

    infer_layouts(&mut func, &config).unwrap();
    coalesce(&mut func, &target, &config).unwrap();
    canonicalize(&mut func).unwrap();
    verify_layouts(&func, &config).unwrap();

    let layouts: Vec<Layout> = memory_ops(&func)
        .into_iter()
        .map(|op| func.encoding(func.op(op).operands[0]).unwrap().clone())
        .collect();
    let spt: Vec<u32> = layouts.iter().map(|l| l.size_per_thread()[0]).collect();
    assert_eq!(spt, vec![4, 8, 4]);
    for layout in &layouts[1..] {
        assert_eq!(layout.threads_per_warp(), layouts[0].threads_per_warp());
        assert_eq!(layout.warps_per_cta(), layouts[0].warps_per_cta());
        assert_eq!(layout.order(), layouts[0].order());
    }
    assert_eq!(func.encoding(narrow), Some(&layouts[1]));

    let before = func.clone();
    assert_eq!(coalesce(&mut func, &target, &config).unwrap(), 0);
    assert_eq!(func, before);
}

#[test]
fn test_reduction_result_is_slice_of_parent() {
    let config = LayoutConfig::new(2, 32, 1);
    let mut func = Function::new("colsum", [Type::ptr(DType::Float32)]);
    let base = func.args[0];
    let mut b = Builder::new(&mut func);
    let ptrs = pointer_grid(&mut b, base, 16, 16);
    let x = b.load(ptrs, None, None, MemAttrs::default()).unwrap();
    let sum = b.reduce(x, 0, ReduceOp::Sum).unwrap();
    b.ret();

    infer_layouts(&mut func, &config).unwrap();
    verify_layouts(&func, &config).unwrap();

    let parent = BlockedLayout::default_for(&[16, 16], &config).unwrap();
    assert_eq!(func.encoding(x), Some(&Layout::Blocked(parent.clone())));
    let expected = Layout::Slice(SliceLayout::new(0, parent).unwrap());
    assert_eq!(func.encoding(sum), Some(&expected));
    assert_eq!(func.value_type(sum).shape(), &[16]);
}

#[test]
fn test_dot_contraction_mismatch_is_reported() {
    let config = LayoutConfig::new(4, 64, 1);
    let mut func = Function::new(
        "bad_dot",
        [
            Type::tensor(&[64, 32], DType::Float16),
            Type::tensor(&[16, 64], DType::Float16),
            Type::tensor(&[64, 64], DType::Float32),
        ],
    );
    let (a, bm, c) = (func.args[0], func.args[1], func.args[2]);
    Builder::new(&mut func).dot(a, bm, c).unwrap();
    match infer_layouts(&mut func, &config) {
        Err(IrError::ConstraintViolation { lhs, rhs, reason, .. }) => {
            assert!(reason.contains("K = 32") && reason.contains("K = 16"));
            assert!(lhs.starts_with("#ttg.dot_op<{opIdx = 0"));
            assert!(rhs.starts_with("#ttg.dot_op<{opIdx = 1"));
        }
        other => panic!("expected a constraint violation, got {other:?}"),
    }
}

#[test]
fn test_json_module_is_verified() {
    let mut func = Function::new("k", [Type::scalar(DType::Int32)]);
    let x = func.args[0];
    let mut b = Builder::new(&mut func);
    let y = b.binary(BinaryOp::Mul, x, x).unwrap();
    b.binary(BinaryOp::Add, y, x).unwrap();
    b.ret();
    let mut module = Module::new("m", ModuleConfig::default());
    module.functions.push(func);

    let json = serde_json::to_string(&module).unwrap();
    let parsed: Module = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, module);
    verify_module(&parsed).unwrap();

    let mut broken = parsed;
    broken.functions[0].body.swap(0, 1);
    match verify_module(&broken) {
        Err(IrError::Malformed { op, reason, .. }) => {
            assert_eq!(op, "elementwise.binary");
            assert!(reason.contains("not defined before use"));
        }
        other => panic!("expected a malformed-input error, got {other:?}"),
    }
}
