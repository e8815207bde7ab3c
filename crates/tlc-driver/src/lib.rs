//! Compilation orchestration and pipeline for TLC.
//!
//! This crate takes a tensor-IR module from its unannotated form to the
//! artifacts the compiler emits. It owns the session, runs every pass in
//! order and turns failures into diagnostics.
//!
//! # Compilation Pipeline
//!
//! ```text
//!   Module (builder API or JSON)
//!      │
//!      ▼
//! ┌─────────┐     ┌─────────┐     ┌──────────┐     ┌──────────────┐
//! │ Verify  │ ──▶ │  Infer  │ ──▶ │ Coalesce │ ──▶ │ Canonicalize │
//! └─────────┘     └─────────┘     └──────────┘     └──────────────┘
//!                                                         │
//!      ┌──────────────────────────────────────────────────┘
//!      ▼
//! ┌─────────┐     ┌─────────┐
//! │  Lower  │ ──▶ │ Codegen │   (AMD targets)
//! └─────────┘     └─────────┘
//!      │               │
//!      ▼               ▼
//!  Block IR        AMD ll IR
//! ```
//!
//! The session options are authoritative: [`Compiler::compile`] stamps them
//! into the module's configuration block before verification, so the
//! printed module attributes always describe what was compiled. Use
//! [`CompilerBuilder::module_config`] to start from a module's own block.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod diagnostic;

use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tlc_amdgpu::ll;
use tlc_block_ir::BlockModule;
use tlc_session::{Options, OutputType, Session, SessionRef};
use tlc_tensor_ir::printer;

pub use tlc_tensor_ir::{Module, ModuleConfig};
use tracing::{debug, info, instrument};

/// Errors that can occur during compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Session creation failed.
    #[error("failed to create session: {0}")]
    Session(#[from] tlc_session::SessionError),

    /// The module configuration names an unknown target.
    #[error("invalid target: {0}")]
    Target(#[from] tlc_target::TargetError),

    /// Input file could not be read.
    #[error("failed to read module file: {path}")]
    SourceRead {
        /// The path that could not be read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Input file is not a serialized module.
    #[error("{path} is not a valid module: {source}")]
    Parse {
        /// The offending file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Verification, layout inference, coalescing or canonicalization failed.
    #[error(transparent)]
    Ir(#[from] tlc_tensor_ir::IrError),

    /// Operation lowering failed.
    #[error("lowering failed: {0}")]
    Lower(#[from] tlc_block_ir::LowerError),

    /// AMD code generation failed.
    #[error("code generation failed: {0}")]
    Codegen(#[from] tlc_amdgpu::CodegenError),

    /// An artifact could not be written.
    #[error("failed to write {path}")]
    Write {
        /// Destination path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for compilation operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// A stage of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompilePhase {
    /// Structural and type verification of the input.
    Verify,
    /// Layout inference and propagation.
    Infer,
    /// Memory access coalescing.
    Coalesce,
    /// Cleanup rewrites and the final layout check.
    Canonicalize,
    /// Operation lowering to Block IR.
    Lower,
    /// AMD code generation.
    Codegen,
}

impl CompilePhase {
    /// Get a human-readable name for this phase.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Infer => "infer",
            Self::Coalesce => "coalesce",
            Self::Canonicalize => "canonicalize",
            Self::Lower => "lower",
            Self::Codegen => "codegen",
        }
    }
}

/// Callbacks for monitoring compilation progress.
pub trait CompileCallbacks: Send + Sync {
    /// Called when a compilation phase starts.
    fn on_phase_start(&self, _phase: CompilePhase, _module: &str) {}

    /// Called when a compilation phase completes.
    fn on_phase_complete(&self, _phase: CompilePhase, _module: &str) {}

    /// Called when an error occurs.
    fn on_error(&self, _error: &CompileError) {}
}

/// Default no-op implementation of callbacks.
#[derive(Default)]
pub struct NoopCallbacks;

impl CompileCallbacks for NoopCallbacks {}

/// Everything a compilation produced.
#[derive(Debug)]
pub struct CompileOutput {
    /// The module with every tensor annotated with its layout.
    pub module: Module,
    /// Per-operation plans.
    pub block: BlockModule,
    /// AMD low-level IR; `None` for other targets.
    pub llvm: Option<ll::Module>,
    /// Layout conversions coalescing inserted, summed over kernels.
    pub conversions_inserted: usize,
    /// Intermediate dumps requested by the session, in pipeline order.
    pub dumps: Vec<(CompilePhase, String)>,
}

impl CompileOutput {
    /// The layout-annotated module in textual form.
    #[must_use]
    pub fn annotated_ir(&self) -> String {
        printer::print_module(&self.module)
    }

    /// Render the artifact selected by `output_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::Codegen`] if low-level IR was requested for a
    /// target that has none.
    pub fn render(&self, output_type: OutputType) -> CompileResult<String> {
        match output_type {
            OutputType::AnnotatedIr => Ok(self.annotated_ir()),
            OutputType::BlockIr => Ok(self.block.to_string()),
            OutputType::LlvmIr => self.llvm.as_ref().map(ToString::to_string).ok_or_else(|| {
                tlc_amdgpu::CodegenError::UnsupportedTarget(self.block.target.to_string()).into()
            }),
        }
    }
}

/// The main compiler driver.
pub struct Compiler {
    session: SessionRef,
    callbacks: Arc<dyn CompileCallbacks>,
}

impl Compiler {
    /// Create a new compiler with the given options.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be created.
    pub fn new(options: Options) -> CompileResult<Self> {
        let session = tlc_session::create_session(options)?;
        Ok(Self {
            session,
            callbacks: Arc::new(NoopCallbacks),
        })
    }

    /// Create a new compiler with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be created.
    pub fn with_defaults() -> CompileResult<Self> {
        Self::new(Options::default())
    }

    /// Set the compilation callbacks.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: impl CompileCallbacks + 'static) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    /// Get a reference to the session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The configuration block the session compiles for.
    #[must_use]
    pub fn module_config(&self) -> ModuleConfig {
        let options = &self.session.options;
        ModuleConfig {
            num_warps: options.num_warps,
            num_ctas: options.num_ctas,
            threads_per_warp: options.threads_per_warp,
            target: self.session.target().to_string(),
        }
    }

    /// Compile a module serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// compilation fails at any phase.
    #[instrument(skip(self, path), fields(path = %path.as_ref()))]
    pub fn compile_file(&self, path: impl AsRef<Utf8Path>) -> CompileResult<CompileOutput> {
        let module = read_module(path.as_ref())?;
        self.compile(module)
    }

    /// Compile a module through all phases.
    ///
    /// # Errors
    ///
    /// Returns the first error any phase reports. Every error is fatal and
    /// no partial output is produced.
    #[instrument(skip(self, module), fields(module = %module.name))]
    pub fn compile(&self, module: Module) -> CompileResult<CompileOutput> {
        let result = self.compile_inner(module);
        if let Err(e) = &result {
            self.callbacks.on_error(e);
        }
        result
    }

    fn compile_inner(&self, mut module: Module) -> CompileResult<CompileOutput> {
        info!(module = %module.name, target = %self.session.target(), "starting compilation");
        module.config = self.module_config();
        let layout = module.config.layout_config()?;
        let target = module.config.gpu_target()?;
        let dump = &self.session.options.dump_ir;
        let mut dumps = Vec::new();

        self.phase(CompilePhase::Verify, &module.name, || {
            tlc_tensor_ir::verifier::verify_module(&module).map_err(CompileError::from)
        })?;
        if dump.dump_input {
            dumps.push((CompilePhase::Verify, printer::print_module(&module)));
        }

        self.phase(CompilePhase::Infer, &module.name.clone(), || {
            for func in &mut module.functions {
                tlc_tensor_ir::infer::infer_layouts(func, &layout)?;
            }
            Ok(())
        })?;
        if dump.dump_layouts {
            dumps.push((CompilePhase::Infer, printer::print_module(&module)));
        }

        let conversions_inserted = self.phase(CompilePhase::Coalesce, &module.name.clone(), || {
            let mut inserted = 0;
            for func in &mut module.functions {
                inserted += tlc_tensor_ir::coalesce::coalesce(func, &target, &layout)?;
            }
            Ok(inserted)
        })?;
        if dump.dump_coalesced {
            dumps.push((CompilePhase::Coalesce, printer::print_module(&module)));
        }

        self.phase(CompilePhase::Canonicalize, &module.name.clone(), || {
            for func in &mut module.functions {
                tlc_tensor_ir::canonicalize::canonicalize(func)?;
                tlc_tensor_ir::verifier::verify_layouts(func, &layout)?;
            }
            Ok(())
        })?;

        let block = self.phase(CompilePhase::Lower, &module.name, || {
            tlc_block_ir::lower_module(&module).map_err(CompileError::from)
        })?;
        if dump.dump_block_ir {
            dumps.push((CompilePhase::Lower, block.to_string()));
        }

        let wants_llvm = self.session.options.output_type == OutputType::LlvmIr || dump.dump_llvm;
        let llvm = if target.is_amd() || wants_llvm {
            let llvm = self.phase(CompilePhase::Codegen, &module.name, || {
                tlc_amdgpu::emit_module(&block).map_err(CompileError::from)
            })?;
            if dump.dump_llvm {
                dumps.push((CompilePhase::Codegen, llvm.to_string()));
            }
            Some(llvm)
        } else {
            debug!(target = %target, "skipping code generation for a non-AMD target");
            None
        };

        for func in &module.functions {
            self.session.register_kernel(&func.name)?;
        }
        info!(
            module = %module.name,
            kernels = module.functions.len(),
            conversions_inserted,
            scratch_bytes = block.functions.iter().map(|f| f.scratch_bytes).max().unwrap_or(0),
            "compilation complete"
        );

        Ok(CompileOutput {
            module,
            block,
            llvm,
            conversions_inserted,
            dumps,
        })
    }

    #[instrument(skip(self, run), fields(phase = phase.name()))]
    fn phase<T>(
        &self,
        phase: CompilePhase,
        module: &str,
        run: impl FnOnce() -> CompileResult<T>,
    ) -> CompileResult<T> {
        self.callbacks.on_phase_start(phase, module);
        let value = run()?;
        self.callbacks.on_phase_complete(phase, module);
        debug!(module, phase = phase.name(), "phase complete");
        Ok(value)
    }

    /// Write the artifact the session asks for and return its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact is unavailable or cannot be written.
    pub fn write_output(&self, output: &CompileOutput, input_name: &str) -> CompileResult<Utf8PathBuf> {
        let text = output.render(self.session.options.output_type)?;
        let path = self.session.output_path(input_name);
        std::fs::write(&path, text).map_err(|source| CompileError::Write {
            path: path.clone(),
            source,
        })?;
        info!(path = %path, "wrote output");
        Ok(path)
    }
}

/// Read a JSON-serialized module.
///
/// # Errors
///
/// Returns [`CompileError::SourceRead`] or [`CompileError::Parse`].
pub fn read_module(path: &Utf8Path) -> CompileResult<Module> {
    let text = std::fs::read_to_string(path).map_err(|source| CompileError::SourceRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CompileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Builder for configuring and creating a compiler.
#[derive(Default)]
pub struct CompilerBuilder {
    options: Options,
}

impl CompilerBuilder {
    /// Create a new compiler builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a module's configuration block.
    #[must_use]
    pub fn module_config(mut self, config: &ModuleConfig) -> Self {
        self.options.num_warps = config.num_warps;
        self.options.num_ctas = config.num_ctas;
        self.options.threads_per_warp = config.threads_per_warp;
        self.options.target.clone_from(&config.target);
        self
    }

    /// Set the number of warps per CTA.
    #[must_use]
    pub fn num_warps(mut self, num_warps: u32) -> Self {
        self.options.num_warps = num_warps;
        self
    }

    /// Set the number of CTAs per cluster.
    #[must_use]
    pub fn num_ctas(mut self, num_ctas: u32) -> Self {
        self.options.num_ctas = num_ctas;
        self
    }

    /// Set the lanes per warp.
    #[must_use]
    pub fn threads_per_warp(mut self, threads: u32) -> Self {
        self.options.threads_per_warp = Some(threads);
        self
    }

    /// Set the target string.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.options.target = target.into();
        self
    }

    /// Set the output type.
    #[must_use]
    pub fn output_type(mut self, output_type: OutputType) -> Self {
        self.options.output_type = output_type;
        self
    }

    /// Set the output path.
    #[must_use]
    pub fn output_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.options.output_path = Some(path.into());
        self
    }

    /// Set the intermediate dumps.
    #[must_use]
    pub fn dump_ir(mut self, dump: tlc_session::IrDumpOptions) -> Self {
        self.options.dump_ir = dump;
        self
    }

    /// Build the compiler.
    ///
    /// # Errors
    ///
    /// Returns an error if the options do not describe a valid session.
    pub fn build(self) -> CompileResult<Compiler> {
        Compiler::new(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tlc_tensor_ir::{BinaryOp, Builder, DType, Function, MemAttrs, Type};

    #[derive(Clone, Default)]
    struct PhaseLog {
        phases: Arc<Mutex<Vec<CompilePhase>>>,
        errors: Arc<AtomicUsize>,
    }

    impl CompileCallbacks for PhaseLog {
        fn on_phase_complete(&self, phase: CompilePhase, _module: &str) {
            self.phases.lock().unwrap().push(phase);
        }

        fn on_error(&self, _error: &CompileError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }


    fn copy_kernel(name: &str) -> Function {
        let mut func = Function::new(
            name,
            [Type::ptr(DType::Float32), Type::ptr(DType::Float32)],
        );
        let (src, dst) = (func.args[0], func.args[1]);
        let mut b = Builder::new(&mut func);
        let offsets = b.make_range(0, 256).unwrap();
        let from = b.splat(src, &[256]).unwrap();
        let from = b.add_ptr(from, offsets).unwrap();
        let to = b.splat(dst, &[256]).unwrap();
        let to = b.add_ptr(to, offsets).unwrap();
        let x = b.load(from, None, None, MemAttrs::default()).unwrap();
        let y = b.binary(BinaryOp::Add, x, x).unwrap();
        b.store(to, y, None, MemAttrs::default()).unwrap();
        b.ret();
        func
    }

    fn module_with(func: Function) -> Module {
        let mut module = Module::new("m", ModuleConfig::default());
        module.functions.push(func);
        module
    }

    #[test]
    fn test_compiler_builder() {
        let compiler = CompilerBuilder::new()
            .num_warps(8)
            .target("hip:gfx1100")
            .build()
            .unwrap();
        assert_eq!(compiler.session().num_warps(), 8);
        assert_eq!(compiler.session().threads_per_warp(), 32);
        let config = compiler.module_config();
        assert_eq!(config.num_warps, 8);
        assert_eq!(config.target, "hip:gfx1100");
    }

    #[test]
    fn test_builder_rejects_bad_target() {
        let err = CompilerBuilder::new().target("tpu:v4").build();
        assert!(matches!(err, Err(CompileError::Session(_))));
    }

    #[test]
    fn test_phases_run_in_order() {
        let log = PhaseLog::default();
        let compiler = Compiler::with_defaults()
            .unwrap()
            .with_callbacks(log.clone());
        compiler.compile(module_with(copy_kernel("copy"))).unwrap();
        assert_eq!(
            *log.phases.lock().unwrap(),
            vec![
                CompilePhase::Verify,
                CompilePhase::Infer,
                CompilePhase::Coalesce,
                CompilePhase::Canonicalize,
                CompilePhase::Lower,
                CompilePhase::Codegen,
            ]
        );
        assert_eq!(log.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cuda_target_skips_codegen() {
        let compiler = CompilerBuilder::new().target("cuda:80").build().unwrap();
        let output = compiler.compile(module_with(copy_kernel("copy"))).unwrap();
        assert!(output.llvm.is_none());
        assert!(output.render(OutputType::AnnotatedIr).unwrap().contains("ttg.target = \"cuda:80\""));
        assert!(matches!(
            output.render(OutputType::LlvmIr),
            Err(CompileError::Codegen(_))
        ));
    }

    #[test]
    fn test_session_config_is_stamped() {
        let compiler = CompilerBuilder::new().num_warps(2).build().unwrap();
        let output = compiler.compile(module_with(copy_kernel("copy"))).unwrap();
        assert_eq!(output.module.config.num_warps, 2);
        assert_eq!(output.block.config.num_warps, 2);
    }

    #[test]
    fn test_kernel_names_are_unique_per_session() {
        let compiler = Compiler::with_defaults().unwrap();
        compiler.compile(module_with(copy_kernel("copy"))).unwrap();
        assert!(compiler.session().is_kernel_emitted("copy"));
        let err = compiler.compile(module_with(copy_kernel("copy"))).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Session(tlc_session::SessionError::DuplicateKernel(_))
        ));
    }

    #[test]
    fn test_dumps_follow_the_pipeline() {
        let compiler = CompilerBuilder::new()
            .dump_ir(tlc_session::IrDumpOptions {
                dump_input: true,
                dump_layouts: true,
                dump_block_ir: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        let output = compiler.compile(module_with(copy_kernel("copy"))).unwrap();
        let phases: Vec<_> = output.dumps.iter().map(|(p, _)| *p).collect();
        assert_eq!(
            phases,
            vec![CompilePhase::Verify, CompilePhase::Infer, CompilePhase::Lower]
        );
        assert!(!output.dumps[0].1.contains("#blocked"));
        assert!(output.dumps[1].1.contains("#blocked"));
        assert!(output.dumps[2].1.contains("block.func @copy"));
    }
}
