//! Tile Layout Compiler (TLC) - Main Entry Point
//!
//! Reads a tensor-IR module serialized as JSON, assigns layouts and prints
//! the annotated module, its Block IR plans or AMD low-level IR.

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tlc_diagnostics::{diagnostics_to_json, DiagnosticRenderer, IntoDiagnostic};
use tlc_driver::{read_module, CompileError, CompileOutput, Compiler, CompilerBuilder};
use tlc_session::{IrDumpOptions, OutputType};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Tile Layout Compiler - layout assignment and lowering for GPU tile kernels
#[derive(Parser, Debug)]
#[command(name = "tlc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The command to execute
    #[command(subcommand)]
    command: Option<Commands>,

    /// Module to compile (JSON)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Output file name; stdout when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    output: Option<PathBuf>,

    /// Artifact to emit
    #[arg(long, value_enum, default_value = "annotated", global = true)]
    emit: Emit,

    /// Target, e.g. hip:gfx90a or cuda:80 (overrides the module)
    #[arg(long, global = true)]
    target: Option<String>,

    /// Warps per CTA (overrides the module)
    #[arg(long, global = true)]
    num_warps: Option<u32>,

    /// CTAs per cluster (overrides the module)
    #[arg(long, global = true)]
    num_ctas: Option<u32>,

    /// Lanes per warp (overrides the module)
    #[arg(long, global = true)]
    threads_per_warp: Option<u32>,

    /// Dump intermediate representations to stderr
    #[arg(long, global = true)]
    dump_ir: Option<IrStage>,

    /// How errors are reported
    #[arg(long, value_enum, default_value = "human", global = true)]
    error_format: ErrorFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Emitted artifact
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Layout-annotated tensor IR
    Annotated,
    /// Block IR plans
    Block,
    /// AMD low-level IR
    Llvm,
}

/// IR stages for dumping
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum IrStage {
    /// The verified input
    Input,
    /// After layout inference
    Layouts,
    /// After coalescing
    Coalesced,
    /// Block IR
    Block,
    /// AMD low-level IR
    Llvm,
    /// All stages
    All,
}

/// Error report format
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ErrorFormat {
    /// Rendered for a terminal
    Human,
    /// One JSON array on stderr
    Json,
}

/// Subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a module
    Build {
        /// Input module
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Run every pass and report errors without writing output
    Check {
        /// Input module
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Some(Commands::Build { ref file }) => compile_file(file, &cli, true),
        Some(Commands::Check { ref file }) => compile_file(file, &cli, false),
        None => match cli.file {
            Some(ref file) => compile_file(file, &cli, true),
            None => {
                println!("Tile Layout Compiler (TLC) v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Usage: tlc [OPTIONS] <FILE>");
                println!();
                println!("For more information, try '--help'");
                Ok(())
            }
        },
    }
}

fn utf8(path: &Path) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|p| anyhow::anyhow!("Invalid UTF-8 in path: {}", p.display()))
}

fn dump_options(stage: Option<IrStage>) -> IrDumpOptions {
    let all = stage == Some(IrStage::All);
    IrDumpOptions {
        dump_input: all || stage == Some(IrStage::Input),
        dump_layouts: all || stage == Some(IrStage::Layouts),
        dump_coalesced: all || stage == Some(IrStage::Coalesced),
        dump_block_ir: all || stage == Some(IrStage::Block),
        dump_llvm: all || stage == Some(IrStage::Llvm),
    }
}

/// Build a compiler from the module's own configuration and the flags.
fn compiler_for(
    config: &tlc_driver::ModuleConfig,
    out: Option<&Utf8PathBuf>,
    cli: &Cli,
) -> Result<Compiler, CompileError> {
    let output_type = match cli.emit {
        Emit::Annotated => OutputType::AnnotatedIr,
        Emit::Block => OutputType::BlockIr,
        Emit::Llvm => OutputType::LlvmIr,
    };
    let mut builder = CompilerBuilder::new()
        .module_config(config)
        .output_type(output_type)
        .dump_ir(dump_options(cli.dump_ir));
    if let Some(out) = out {
        builder = builder.output_path(out.clone());
    }
    if let Some(ref target) = cli.target {
        builder = builder.target(target.clone());
    }
    if let Some(warps) = cli.num_warps {
        builder = builder.num_warps(warps);
    }
    if let Some(ctas) = cli.num_ctas {
        builder = builder.num_ctas(ctas);
    }
    if let Some(threads) = cli.threads_per_warp {
        builder = builder.threads_per_warp(threads);
    }
    builder.build()
}

/// Compile one module, reporting failures as diagnostics.
fn compile_file(file: &Path, cli: &Cli, emit: bool) -> Result<()> {
    let path = utf8(file)?;
    let out = cli.output.as_deref().map(utf8).transpose()?;
    tracing::info!("Compiling {}", path);

    let result = read_module(&path).and_then(|module| {
        let compiler = compiler_for(&module.config, out.as_ref(), cli)?;
        let output = compiler.compile(module)?;
        Ok((compiler, output))
    });
    let (compiler, output) = match result {
        Ok(compiled) => compiled,
        Err(e) => {
            report(e, cli.error_format)?;
            std::process::exit(1);
        }
    };

    print_dumps(&output);
    if !emit {
        return Ok(());
    }
    let written = match out {
        Some(_) => compiler.write_output(&output, path.as_str()).map(|out| {
            tracing::info!("Generated: {}", out);
        }),
        None => output
            .render(compiler.session().options.output_type)
            .map(|text| print!("{text}")),
    };
    if let Err(e) = written {
        report(e, cli.error_format)?;
        std::process::exit(1);
    }
    Ok(())
}

fn print_dumps(output: &CompileOutput) {
    for (phase, text) in &output.dumps {
        eprintln!("// -----// IR Dump After {} //----- //", phase.name());
        eprintln!("{text}");
    }
}

fn report(error: CompileError, format: ErrorFormat) -> Result<()> {
    let diagnostic = error.into_diagnostic();
    match format {
        ErrorFormat::Human => DiagnosticRenderer::new().render_all(&[diagnostic]),
        ErrorFormat::Json => eprintln!("{}", diagnostics_to_json(&[diagnostic])?),
    }
    Ok(())
}
