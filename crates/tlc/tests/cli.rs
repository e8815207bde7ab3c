//! Command line tests: JSON modules in, IR text out.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tlc_tensor_ir::{
    BinaryOp, Builder, DType, Function, MemAttrs, Module, ModuleConfig, Type,
};

fn scale_kernel() -> Module {
    let mut func = Function::new(
        "scale",
        [Type::ptr(DType::Float32), Type::ptr(DType::Float32)],
    );
    let (src, dst) = (func.args[0], func.args[1]);
    let mut b = Builder::new(&mut func);
    let offsets = b.make_range(0, 512).unwrap();
    let from = b.splat(src, &[512]).unwrap();
    let from = b.add_ptr(from, offsets).unwrap();
    let to = b.splat(dst, &[512]).unwrap();
    let to = b.add_ptr(to, offsets).unwrap();
    let x = b.load(from, None, None, MemAttrs::default()).unwrap();
    let two = b
        .const_float(2.0, Type::tensor(&[512], DType::Float32))
        .unwrap();
    let y = b.binary(BinaryOp::Mul, x, two).unwrap();
    b.store(to, y, None, MemAttrs::default()).unwrap();
    b.ret();

    let config = ModuleConfig {
        target: "hip:gfx90a".to_string(),
        ..ModuleConfig::default()
    };
    let mut module = Module::new("scale", config);
    module.functions.push(func);
    module
}

fn write_module(dir: &Path, module: &Module) -> PathBuf {
    let path = dir.join(format!("{}.json", module.name));
    std::fs::write(&path, serde_json::to_string(module).unwrap()).unwrap();
    path
}

fn tlc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tlc"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_prints_annotated_ir() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), &scale_kernel());
    let out = tlc(&[input.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.starts_with("#blocked = #ttg.blocked<{"));
    assert!(stdout.contains("\"ttg.num-warps\" = 4 : i32"));
    assert!(stdout.contains("ttg.target = \"hip:gfx90a\""));
    assert!(stdout.contains("tt.load"));
}

#[test]
fn test_flags_override_the_module() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), &scale_kernel());
    let out = tlc(&[input.to_str().unwrap(), "--num-warps", "2", "--emit", "block"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("block.func @scale"));
}

#[test]
fn test_writes_llvm_to_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), &scale_kernel());
    let output = dir.path().join("scale.ll");
    let out = tlc(&[
        "build",
        input.to_str().unwrap(),
        "--emit",
        "llvm",
        "-o",
        output.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(out.stdout.is_empty());
    let text = std::fs::read_to_string(&output).unwrap();
    assert!(text.contains("target triple = \"amdgcn-amd-amdhsa\""));
    assert!(text.contains("define amdgpu_kernel void @scale("));
}

#[test]
fn test_check_prints_nothing_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), &scale_kernel());
    let out = tlc(&["check", input.to_str().unwrap()]);
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
}

#[test]
fn test_dump_ir_goes_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), &scale_kernel());
    let out = tlc(&["check", input.to_str().unwrap(), "--dump-ir", "all"]);
    assert!(out.status.success());
    let stderr = String::from_utf8(out.stderr).unwrap();
    for phase in ["verify", "infer", "coalesce", "lower", "codegen"] {
        assert!(
            stderr.contains(&format!("// -----// IR Dump After {phase} //----- //")),
            "missing {phase} dump"
        );
    }
}

#[test]
fn test_errors_are_reported_as_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.json");
    std::fs::write(&input, "{\"name\": \"broken\", \"functions\": 7}").unwrap();

    let out = tlc(&[input.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("E0001"));

    let out = tlc(&[input.to_str().unwrap(), "--error-format", "json"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr).unwrap();
    let start = stderr.find("[\n").expect("a JSON diagnostic array");
    let diags: serde_json::Value = serde_json::from_str(stderr[start..].trim()).unwrap();
    assert_eq!(diags[0]["code"], "E0001");
    assert_eq!(diags[0]["severity"], "error");
}

#[test]
fn test_unknown_target_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_module(dir.path(), &scale_kernel());
    let out = tlc(&[input.to_str().unwrap(), "--target", "tpu:v4"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown backend"));
}
