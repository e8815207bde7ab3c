//! Compiler session state and options for TLC.
//!
//! The [`Session`] holds everything a single compilation needs besides the
//! program itself: the validated [`Options`], the parsed [`GpuTarget`], and
//! the set of kernels already emitted so that two modules compiled in the
//! same session cannot produce clashing symbols.
//!
//! # Module Configuration
//!
//! The options mirror the module configuration block every kernel module
//! carries:
//!
//! - `num-warps`: warps per cooperative thread array (default 4)
//! - `num-ctas`: CTAs per cluster (default 1)
//! - `threads-per-warp`: lanes per warp (default: the target's wavefront size)
//! - `target`: `hip:gfx90a`, `cuda:80`, ...

#![warn(missing_docs)]

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tlc_target::{GpuTarget, TargetError};

/// Which artifact the compiler writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputType {
    /// Layout-annotated tensor IR (.ttgir).
    #[default]
    AnnotatedIr,
    /// Block IR lowering summary (.blk).
    BlockIr,
    /// AMD low-level IR (.ll).
    LlvmIr,
}

impl OutputType {
    /// File extension used for this artifact.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::AnnotatedIr => "ttgir",
            Self::BlockIr => "blk",
            Self::LlvmIr => "ll",
        }
    }
}

/// Compiler options that can be set via CLI or configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Warps per cooperative thread array.
    pub num_warps: u32,
    /// Cooperative thread arrays per cluster.
    pub num_ctas: u32,
    /// Lanes per warp. `None` uses the target's wavefront size.
    pub threads_per_warp: Option<u32>,
    /// Target string (e.g. "hip:gfx90a").
    pub target: String,
    /// Output type.
    pub output_type: OutputType,
    /// Output path for compiled artifacts.
    pub output_path: Option<Utf8PathBuf>,
    /// Dump intermediate representations.
    pub dump_ir: IrDumpOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_warps: 4,
            num_ctas: 1,
            threads_per_warp: None,
            target: GpuTarget::default().to_string(),
            output_type: OutputType::AnnotatedIr,
            output_path: None,
            dump_ir: IrDumpOptions::default(),
        }
    }
}

/// Options for dumping intermediate representations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrDumpOptions {
    /// Dump the input tensor IR after verification.
    pub dump_input: bool,
    /// Dump the IR after layout inference.
    pub dump_layouts: bool,
    /// Dump the IR after coalescing.
    pub dump_coalesced: bool,
    /// Dump the block IR.
    pub dump_block_ir: bool,
    /// Dump the AMD low-level IR.
    pub dump_llvm: bool,
}

/// Errors that can occur during session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Configuration file not found.
    #[error("configuration file not found: {0}")]
    ConfigNotFound(Utf8PathBuf),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Target not supported.
    #[error("unsupported target: {0}")]
    UnsupportedTarget(#[from] TargetError),
    /// A kernel with this name was already emitted in this session.
    #[error("kernel `{0}` is defined more than once")]
    DuplicateKernel(String),
}

/// The compiler session holds all state for a compilation unit.
pub struct Session {
    /// Compiler options.
    pub options: Options,
    target: GpuTarget,
    threads_per_warp: u32,
    /// Kernel symbols already emitted in this session.
    emitted_kernels: RwLock<FxHashSet<String>>,
}

impl Session {
    /// Create a new session with the given options.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be parsed or the warp
    /// configuration is not legal on it.
    pub fn new(options: Options) -> Result<Self, SessionError> {
        let target: GpuTarget = options.target.parse()?;
        if options.num_warps == 0 {
            return Err(SessionError::InvalidConfig(
                "num-warps must be at least 1".to_string(),
            ));
        }
        if options.num_ctas == 0 {
            return Err(SessionError::InvalidConfig(
                "num-ctas must be at least 1".to_string(),
            ));
        }
        let threads_per_warp = options
            .threads_per_warp
            .unwrap_or_else(|| target.warp_size());
        if !target.supports_threads_per_warp(threads_per_warp) {
            return Err(SessionError::InvalidConfig(format!(
                "threads-per-warp {threads_per_warp} is not supported on {target}"
            )));
        }

        Ok(Self {
            options,
            target,
            threads_per_warp,
            emitted_kernels: RwLock::new(FxHashSet::default()),
        })
    }

    /// Create a new session with default options.
    ///
    /// # Errors
    ///
    /// Never fails for the default options; the signature matches [`Session::new`].
    pub fn with_defaults() -> Result<Self, SessionError> {
        Self::new(Options::default())
    }

    /// Load options from a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or is not a valid options object.
    pub fn from_config_file(path: &Utf8Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| SessionError::ConfigNotFound(path.to_path_buf()))?;
        let options: Options = serde_json::from_str(&text)
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        Self::new(options)
    }

    /// The parsed compilation target.
    #[must_use]
    pub fn target(&self) -> &GpuTarget {
        &self.target
    }

    /// Warps per CTA.
    #[must_use]
    pub fn num_warps(&self) -> u32 {
        self.options.num_warps
    }

    /// CTAs per cluster.
    #[must_use]
    pub fn num_ctas(&self) -> u32 {
        self.options.num_ctas
    }

    /// Resolved lanes per warp.
    #[must_use]
    pub fn threads_per_warp(&self) -> u32 {
        self.threads_per_warp
    }

    /// Record an emitted kernel symbol.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateKernel`] if the name was already emitted.
    pub fn register_kernel(&self, name: &str) -> Result<(), SessionError> {
        if self.emitted_kernels.write().insert(name.to_string()) {
            Ok(())
        } else {
            Err(SessionError::DuplicateKernel(name.to_string()))
        }
    }

    /// Check if a kernel has been emitted.
    #[must_use]
    pub fn is_kernel_emitted(&self, name: &str) -> bool {
        self.emitted_kernels.read().contains(name)
    }

    /// Get the output path, computing a default if not specified.
    #[must_use]
    pub fn output_path(&self, input_name: &str) -> Utf8PathBuf {
        if let Some(ref path) = self.options.output_path {
            path.clone()
        } else {
            let stem = Utf8Path::new(input_name).file_stem().unwrap_or(input_name);
            Utf8PathBuf::from(format!("{stem}.{}", self.options.output_type.extension()))
        }
    }
}

/// A shared, thread-safe reference to a session.
pub type SessionRef = Arc<Session>;

/// Create a shared session reference.
///
/// # Errors
///
/// Returns an error if the options do not validate.
pub fn create_session(options: Options) -> Result<SessionRef, SessionError> {
    Ok(Arc::new(Session::new(options)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let session = Session::with_defaults().unwrap();
        assert_eq!(session.num_warps(), 4);
        assert_eq!(session.num_ctas(), 1);
        assert_eq!(session.target().to_string(), "hip:gfx90a");
        assert_eq!(session.threads_per_warp(), 64);
    }

    #[test]
    fn test_threads_per_warp_follows_target() {
        let options = Options {
            target: "cuda:80".to_string(),
            ..Options::default()
        };
        assert_eq!(Session::new(options).unwrap().threads_per_warp(), 32);

        let options = Options {
            target: "hip:gfx1100".to_string(),
            threads_per_warp: Some(64),
            ..Options::default()
        };
        assert_eq!(Session::new(options).unwrap().threads_per_warp(), 64);
    }

    #[test]
    fn test_invalid_options() {
        let options = Options {
            num_warps: 0,
            ..Options::default()
        };
        assert!(matches!(
            Session::new(options),
            Err(SessionError::InvalidConfig(_))
        ));

        let options = Options {
            target: "cuda:80".to_string(),
            threads_per_warp: Some(64),
            ..Options::default()
        };
        assert!(matches!(
            Session::new(options),
            Err(SessionError::InvalidConfig(_))
        ));

        let options = Options {
            target: "opencl:x".to_string(),
            ..Options::default()
        };
        assert!(matches!(
            Session::new(options),
            Err(SessionError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_kernel_tracking() {
        let session = Session::with_defaults().unwrap();
        assert!(!session.is_kernel_emitted("attn_fwd"));
        session.register_kernel("attn_fwd").unwrap();
        assert!(session.is_kernel_emitted("attn_fwd"));
        assert!(matches!(
            session.register_kernel("attn_fwd"),
            Err(SessionError::DuplicateKernel(_))
        ));
    }

    #[test]
    fn test_output_path() {
        let mut options = Options::default();
        options.output_type = OutputType::LlvmIr;
        let session = Session::new(options).unwrap();
        assert_eq!(session.output_path("kernels/attn.json"), "attn.ll");
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: Options = serde_json::from_str(r#"{"num_warps": 8}"#).unwrap();
        assert_eq!(options.num_warps, 8);
        assert_eq!(options.num_ctas, 1);
        assert_eq!(options.threads_per_warp, None);
    }
}
