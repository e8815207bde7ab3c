//! Integration tests for the TLC compilation pipeline.

use camino::Utf8PathBuf;
use tlc_block_ir::Plan;
use tlc_diagnostics::IntoDiagnostic;
use tlc_driver::{read_module, CompileError, Compiler, CompilerBuilder};
use tlc_session::OutputType;
use tlc_tensor_ir::{
    BinaryOp, Builder, DType, Function, MemAttrs, Module, ModuleConfig, Padding, ReduceOp, Type,
    UnaryOp, ValueId,
};

const BLOCK: u32 = 64;
const HEAD_DIM: u32 = 64;

/// One query block of softmax(Q Kᵀ) V over a 64-key window.
fn attention_forward() -> Function {
    let mut func = Function::new(
        "attn_fwd",
        [
            Type::ptr(DType::Float16),
            Type::ptr(DType::Float16),
            Type::ptr(DType::Float16),
            Type::ptr(DType::Float32),
            Type::scalar(DType::Int64),
        ],
    );
    let (q, k, v, out, seq_len) = (
        func.args[0],
        func.args[1],
        func.args[2],
        func.args[3],
        func.args[4],
    );
    let mut b = Builder::new(&mut func);
    let head_dim = b.const_i64(i64::from(HEAD_DIM)).unwrap();
    let one = b.const_i64(1).unwrap();
    let zero = b.const_i32(0).unwrap();
    let pid = b.program_id(0).unwrap();
    let block = b.const_i32(BLOCK as i32).unwrap();
    let row = b.binary(BinaryOp::Mul, pid, block).unwrap();

    let rows_of = |b: &mut Builder<'_>, base: ValueId, row: ValueId| {
        b.make_tensor_ptr(
            base,
            &[seq_len, head_dim],
            &[head_dim, one],
            &[row, zero],
            &[BLOCK, HEAD_DIM],
            &[1, 0],
        )
        .unwrap()
    };
    let q_ptr = rows_of(&mut b, q, row);
    let v_ptr = rows_of(&mut b, v, zero);
    let o_ptr = b
        .make_tensor_ptr(
            out,
            &[seq_len, head_dim],
            &[head_dim, one],
            &[row, zero],
            &[BLOCK, HEAD_DIM],
            &[1, 0],
        )
        .unwrap();
    // Kᵀ read in place: the key index runs along columns.
    let kt_ptr = b
        .make_tensor_ptr(
            k,
            &[head_dim, seq_len],
            &[one, head_dim],
            &[zero, zero],
            &[HEAD_DIM, BLOCK],
            &[0, 1],
        )
        .unwrap();

    let checked = |dim: u32| MemAttrs {
        boundary_check: vec![dim],
        padding: Some(Padding::Zero),
        ..MemAttrs::default()
    };
    let q_tile = b.load(q_ptr, None, None, checked(0)).unwrap();
    let kt_tile = b.load(kt_ptr, None, None, checked(1)).unwrap();
    let acc = b
        .const_float(0.0, Type::tensor(&[BLOCK, BLOCK], DType::Float32))
        .unwrap();
    let scores = b.dot(q_tile, kt_tile, acc).unwrap();

    let row_max = b.reduce(scores, 1, ReduceOp::Max).unwrap();
    let row_max = b.expand_dims(row_max, 1).unwrap();
    let row_max = b.broadcast(row_max, &[BLOCK, BLOCK]).unwrap();
    let shifted = b.binary(BinaryOp::Sub, scores, row_max).unwrap();
    let p = b.unary(UnaryOp::Exp, shifted).unwrap();
    let denom = b.reduce(p, 1, ReduceOp::Sum).unwrap();
    let p = b.cast(p, DType::Float16).unwrap();

    let v_tile = b.load(v_ptr, None, None, checked(0)).unwrap();
    let acc = b
        .const_float(0.0, Type::tensor(&[BLOCK, HEAD_DIM], DType::Float32))
        .unwrap();
    let o = b.dot(p, v_tile, acc).unwrap();
    let denom = b.expand_dims(denom, 1).unwrap();
    let denom = b.broadcast(denom, &[BLOCK, HEAD_DIM]).unwrap();
    let o = b.binary(BinaryOp::Div, o, denom).unwrap();
    b.store(o_ptr, o, None, checked(0)).unwrap();
    b.ret();
    func
}

fn module_with(name: &str, func: Function) -> Module {
    let mut module = Module::new(name, ModuleConfig::default());
    module.functions.push(func);
    module
}

#[test]
fn test_attention_forward_compiles_end_to_end() {
    let compiler = CompilerBuilder::new()
        .target("hip:gfx90a")
        .num_warps(4)
        .build()
        .unwrap();
    let output = compiler
        .compile(module_with("attention", attention_forward()))
        .unwrap();

    let text = output.annotated_ir();
    assert!(text.contains("\"ttg.num-warps\" = 4 : i32"));
    assert!(text.contains("\"ttg.threads-per-warp\" = 64 : i32"));
    assert!(text.contains("#ttg.dot_op<{opIdx = 0, parent = #blocked"));
    assert!(text.contains("#ttg.dot_op<{opIdx = 1, parent = #blocked"));
    assert!(text.contains("#ttg.slice<{dim = 1, parent = #blocked"));

    let kernel = &output.block.functions[0];
    assert_eq!(kernel.count_plans(|p| matches!(p, Plan::Dot(_))), 2);
    assert_eq!(kernel.count_plans(|p| matches!(p, Plan::Reduce(_))), 2);
    assert_eq!(kernel.count_plans(|p| matches!(p, Plan::MemAccess(_))), 4);

    let llvm = output.llvm.as_ref().unwrap();
    let func = llvm.function("attn_fwd").unwrap();
    assert!(func.kernel);
    assert_eq!(func.count_calls("__tlc_tile_dot_m64n64k64"), 2);
    assert!(func.count_calls("llvm.exp.f32") > 0);
    assert_eq!(func.count_calls("__predicated"), 0);
    let ll_text = output.render(OutputType::LlvmIr).unwrap();
    assert!(ll_text.contains("define amdgpu_kernel void @attn_fwd("));
    assert!(ll_text.contains("pred.store"));
    assert!(ll_text.contains("fdiv float"));
}

#[test]
fn test_json_module_round_trips_through_the_driver() {
    let dir = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let input = dir.join("attention.json");
    let module = module_with("attention", attention_forward());
    std::fs::write(&input, serde_json::to_string_pretty(&module).unwrap()).unwrap();
    assert_eq!(read_module(&input).unwrap(), module);

    let out = dir.join("attention.blk");
    let compiler = CompilerBuilder::new()
        .module_config(&module.config)
        .output_type(OutputType::BlockIr)
        .output_path(out.clone())
        .build()
        .unwrap();
    let output = compiler.compile_file(&input).unwrap();
    let written = compiler.write_output(&output, input.as_str()).unwrap();
    assert_eq!(written, out);
    let text = std::fs::read_to_string(&out).unwrap();
    assert!(text.contains("block.func @attn_fwd"));
    assert_eq!(text, output.block.to_string());
}

#[test]
fn test_malformed_module_is_reported_with_e0001() {
    let mut func = Function::new("k", [Type::scalar(DType::Int32)]);
    let x = func.args[0];
    let mut b = Builder::new(&mut func);
    let y = b.binary(BinaryOp::Mul, x, x).unwrap();
    b.binary(BinaryOp::Add, y, x).unwrap();
    b.ret();
    func.body.swap(0, 1);

    let compiler = Compiler::with_defaults().unwrap();
    let err = compiler.compile(module_with("broken", func)).unwrap_err();
    assert!(matches!(err, CompileError::Ir(_)));
    let diag = err.into_diagnostic();
    assert_eq!(diag.code.as_deref(), Some("E0001"));
    assert!(diag.message.contains("not defined before use"));
}

#[test]
fn test_unreadable_and_invalid_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let compiler = Compiler::with_defaults().unwrap();

    let missing = compiler.compile_file(dir.join("missing.json")).unwrap_err();
    assert!(matches!(missing, CompileError::SourceRead { .. }));

    let garbage = dir.join("garbage.json");
    std::fs::write(&garbage, "{ \"name\": 3 }").unwrap();
    let err = compiler.compile_file(&garbage).unwrap_err();
    assert!(matches!(err, CompileError::Parse { .. }));
    assert_eq!(err.into_diagnostic().code.as_deref(), Some("E0001"));
}

#[test]
fn test_lds_budget_is_enforced() {
    // A 256x256 f32 transpose needs 256 KiB of scratch; gfx90a has 64 KiB.
    let mut func = Function::new(
        "big",
        [Type::ptr(DType::Float32), Type::ptr(DType::Float32)],
    );
    let (src, dst) = (func.args[0], func.args[1]);
    let mut b = Builder::new(&mut func);
    let grid = |b: &mut Builder<'_>, base: ValueId, rs: i64, cs: i64| {
        let r = b.make_range(0, 256).unwrap();
        let r = b.expand_dims(r, 1).unwrap();
        let rstride = b
            .const_int(rs, Type::tensor(&[256, 1], DType::Int32))
            .unwrap();
        let r = b.binary(BinaryOp::Mul, r, rstride).unwrap();
        let r = b.broadcast(r, &[256, 256]).unwrap();
        let c = b.make_range(0, 256).unwrap();
        let c = b.expand_dims(c, 0).unwrap();
        let cstride = b
            .const_int(cs, Type::tensor(&[1, 256], DType::Int32))
            .unwrap();
        let c = b.binary(BinaryOp::Mul, c, cstride).unwrap();
        let c = b.broadcast(c, &[256, 256]).unwrap();
        let offsets = b.binary(BinaryOp::Add, r, c).unwrap();
        let ptrs = b.splat(base, &[256, 256]).unwrap();
        b.add_ptr(ptrs, offsets).unwrap()
    };
    let from = grid(&mut b, src, 256, 1);
    let to = grid(&mut b, dst, 1, 256);
    let x = b.load(from, None, None, MemAttrs::default()).unwrap();
    b.store(to, x, None, MemAttrs::default()).unwrap();
    b.ret();

    let compiler = Compiler::with_defaults().unwrap();
    let err = compiler.compile(module_with("big", func)).unwrap_err();
    assert!(matches!(
        err,
        CompileError::Lower(tlc_block_ir::LowerError::SharedMemoryExceeded { .. })
    ));
    assert_eq!(err.into_diagnostic().code.as_deref(), Some("E0005"));
}
