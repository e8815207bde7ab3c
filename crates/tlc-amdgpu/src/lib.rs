//! AMD GPU code generation for TLC.
//!
//! This crate turns a planned [`BlockModule`] into an LLVM-flavoured kernel
//! module for the `amdgcn-amd-amdhsa` target, and provides the small
//! utilities every AMD lowering needs: warp shuffles, program ids and
//! predicated global memory accesses.
//!
//! # Overview
//!
//! ```text
//! Block IR ──▶ ll IR (predicated calls) ──▶ expand ──▶ ll IR (branches)
//! ```
//!
//! # Primitives
//!
//! | Emitter | Lowering |
//! |---------|----------|
//! | [`shuffle_xor`], [`shuffle_up`], [`shuffle_idx`] | `llvm.amdgcn.ds.bpermute` on 32-bit pieces |
//! | [`get_pid`] | `llvm.amdgcn.workgroup.id.{x,y,z}` |
//! | [`ll_load`], [`ll_store`] | calls to `__predicated_load*` / `__predicated_store*` |
//!
//! Predicated calls are placeholders: [`expand_predicated_calls`] replaces
//! each one with a conditional branch around a plain load or store, merging
//! the loaded value with the fallback through a phi.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codegen;
mod distribution;
pub mod expand;
pub mod ll;
pub mod primitives;

pub use codegen::{emit_function, emit_module};
pub use expand::expand_predicated_calls;
pub use primitives::{
    get_num_programs, get_pid, ll_load, ll_store, mangle, shuffle_idx, shuffle_idx_dyn,
    shuffle_up, shuffle_xor,
};

use thiserror::Error;

/// Errors that can occur during AMD code generation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodegenError {
    /// Target is not an AMD GPU.
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    /// A construct this backend cannot express.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An operand did not have the expected form.
    #[error("type error: {0}")]
    TypeError(String),

    /// A value was used before the backend produced it.
    #[error("value %{0} has not been emitted")]
    MissingValue(usize),

    /// Internal backend error.
    #[error("internal codegen error: {0}")]
    Internal(String),
}

/// Result type for code generation operations.
pub type CodegenResult<T> = Result<T, CodegenError>;
