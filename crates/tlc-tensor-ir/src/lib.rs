//! # TLC Tensor IR
//!
//! The tile-level program representation of TLC and the passes that assign
//! it layouts.
//!
//! ## Overview
//!
//! A kernel is a [`Function`] of SSA values in a flat arena. Tensor values
//! start without a layout encoding; the passes here give every tensor one:
//!
//! | Pass | Module | Effect |
//! |------|--------|--------|
//! | Verification | [`verifier`] | Rejects malformed programs |
//! | Layout inference | [`infer`] | Assigns every tensor a layout |
//! | Coalescing | [`coalesce`] | Vectorizes global memory accesses |
//! | Canonicalization | [`canonicalize`] | Folds conversions, broadcasts select conditions |
//!
//! ## Pipeline Position
//!
//! ```text
//! [Kernel DSL / JSON]
//!     |
//!     v
//! [Tensor IR]  <- This crate: layouts assigned
//!     |
//!     v
//! [Block IR]   <- per-op lowering plans
//!     |
//!     v
//! [AMD ll IR]
//! ```
//!
//! ## Main Types
//!
//! - [`Module`], [`Function`], [`Operation`]: the program
//! - [`OpKind`]: operation kinds and their attributes
//! - [`Type`]: scalar, tensor and block pointer types
//! - [`Builder`]: typed construction of operations
//! - [`IrError`]: everything the passes report

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod builder;
pub mod canonicalize;
pub mod coalesce;
pub mod function;
pub mod infer;
pub mod ops;
pub mod printer;
pub mod rewrite;
pub mod types;
pub mod verifier;

pub use builder::Builder;
pub use function::{
    Function, InsertPoint, Module, ModuleConfig, OpId, Operation, ValueData, ValueDef, ValueId,
};
pub use ops::{
    BinaryOp, CacheModifier, ConstValue, EvictionPolicy, MemAttrs, OpKind, Padding, ReduceOp,
    UnaryOp,
};
pub use types::{BlockPtrType, DType, ElemType, Shape, TensorType, Type};

use thiserror::Error;
use tlc_layout::LayoutError;
use tlc_span::Loc;

/// Errors reported by verification and the layout passes.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum IrError {
    /// The program breaks a structural or typing rule.
    #[error("malformed `{op}` at {loc}: {reason}")]
    Malformed {
        /// Operation name.
        op: String,
        /// Location of the operation.
        loc: Loc,
        /// What is wrong.
        reason: String,
    },
    /// Two layouts an operation needs to agree on do not.
    #[error("`{op}` at {loc}: {reason} ({lhs} vs {rhs})")]
    ConstraintViolation {
        /// Operation name.
        op: String,
        /// Location of the operation.
        loc: Loc,
        /// First layout.
        lhs: String,
        /// Second layout.
        rhs: String,
        /// What is violated.
        reason: String,
    },
    /// A construct the compiler does not handle.
    #[error("unsupported `{op}` at {loc}: {reason}")]
    Unsupported {
        /// Operation name.
        op: String,
        /// Location of the operation.
        loc: Loc,
        /// What is unsupported.
        reason: String,
    },
    /// A layout could not be built.
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
}

impl IrError {
    /// A malformed-program error for an operation.
    pub fn malformed(op: &Operation, reason: impl Into<String>) -> Self {
        Self::Malformed {
            op: op.kind.name().to_string(),
            loc: op.loc.clone(),
            reason: reason.into(),
        }
    }

    /// An unsupported-construct error for an operation.
    pub fn unsupported(op: &Operation, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            op: op.kind.name().to_string(),
            loc: op.loc.clone(),
            reason: reason.into(),
        }
    }

    /// The location the error points at.
    #[must_use]
    pub fn loc(&self) -> Option<&Loc> {
        match self {
            Self::Malformed { loc, .. }
            | Self::ConstraintViolation { loc, .. }
            | Self::Unsupported { loc, .. } => Some(loc),
            Self::Layout(_) => None,
        }
    }
}

/// Result type for tensor IR operations.
pub type IrResult<T> = Result<T, IrError>;
