//! GPU target descriptions for TLC.
//!
//! A target decides the hardware facts the layout pipeline reasons about:
//! the warp (wavefront) width, the widest legal vector memory access, and
//! which primitive emitters exist.
//!
//! # Target String Format
//!
//! Targets use the `<backend>:<arch>` form carried in the module
//! configuration block:
//!
//! - `cuda:80`: NVIDIA, compute capability 8.0
//! - `hip:gfx90a`: AMD CDNA 2 (MI200)
//! - `hip:gfx1100`: AMD RDNA 3

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// GPU backend family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// NVIDIA CUDA.
    Cuda,
    /// AMD ROCm/HIP.
    Hip,
}

impl Backend {
    /// Get the name used in target strings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Hip => "hip",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// AMD GPU architecture families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmdFamily {
    /// GCN (Vega): gfx900, gfx906.
    Gcn,
    /// CDNA: gfx908, gfx90a, gfx940-942.
    Cdna,
    /// RDNA: gfx10xx, gfx11xx, gfx12xx.
    Rdna,
}

/// A compilation target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuTarget {
    /// The backend family.
    pub backend: Backend,
    /// Architecture name: `sm_80` style for CUDA, `gfx90a` style for HIP.
    pub arch: String,
    /// Numeric compute capability (`80` for sm_80; the gfx number for AMD).
    pub compute_capability: u32,
}

impl GpuTarget {
    /// Create a CUDA target with the given compute capability (e.g. `80`).
    #[must_use]
    pub fn cuda(compute_capability: u32) -> Self {
        Self {
            backend: Backend::Cuda,
            arch: format!("sm_{compute_capability}"),
            compute_capability,
        }
    }

    /// Create a HIP target from a gfx architecture name (e.g. `gfx90a`).
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::UnknownArch`] if the name is not `gfx<hex>`.
    pub fn hip(arch: &str) -> Result<Self, TargetError> {
        let digits = arch
            .strip_prefix("gfx")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| TargetError::UnknownArch(arch.to_string()))?;
        let compute_capability = u32::from_str_radix(digits, 16)
            .map_err(|_| TargetError::UnknownArch(arch.to_string()))?;
        Ok(Self {
            backend: Backend::Hip,
            arch: arch.to_string(),
            compute_capability,
        })
    }

    /// Check if this is an AMD target.
    #[must_use]
    pub fn is_amd(&self) -> bool {
        self.backend == Backend::Hip
    }

    /// The AMD architecture family, for HIP targets.
    #[must_use]
    pub fn amd_family(&self) -> Option<AmdFamily> {
        if !self.is_amd() {
            return None;
        }
        // The gfx number reads as hex: gfx90a is 0x90a, gfx1100 is 0x1100.
        let family = match self.compute_capability {
            0x1000.. => AmdFamily::Rdna,
            0x908..=0x9ff => AmdFamily::Cdna,
            _ => AmdFamily::Gcn,
        };
        Some(family)
    }

    /// Native warp (wavefront) width.
    ///
    /// RDNA runs 32-wide wavefronts, GCN and CDNA 64-wide; CUDA warps are 32.
    #[must_use]
    pub fn warp_size(&self) -> u32 {
        match self.amd_family() {
            Some(AmdFamily::Gcn | AmdFamily::Cdna) => 64,
            Some(AmdFamily::Rdna) | None => 32,
        }
    }

    /// Widest vectorized global memory access in bits.
    #[must_use]
    pub fn max_vector_access_bits(&self) -> u32 {
        match self.backend {
            Backend::Cuda if self.compute_capability < 70 => 64,
            Backend::Cuda | Backend::Hip => 128,
        }
    }

    /// Widest vectorized global memory access in bytes.
    #[must_use]
    pub fn max_contiguous_bytes(&self) -> u32 {
        self.max_vector_access_bits() / 8
    }

    /// Shared memory (LDS on AMD) available to one CTA, in bytes.
    #[must_use]
    pub fn shared_memory_bytes(&self) -> u32 {
        match self.backend {
            Backend::Hip => 64 * 1024,
            Backend::Cuda if self.compute_capability >= 80 => 163 * 1024,
            Backend::Cuda if self.compute_capability >= 70 => 96 * 1024,
            Backend::Cuda => 48 * 1024,
        }
    }

    /// Check that `threads_per_warp` is legal on this target.
    ///
    /// RDNA supports both wave32 and wave64; other targets only their native width.
    #[must_use]
    pub fn supports_threads_per_warp(&self, threads_per_warp: u32) -> bool {
        match self.amd_family() {
            Some(AmdFamily::Rdna) => matches!(threads_per_warp, 32 | 64),
            _ => threads_per_warp == self.warp_size(),
        }
    }
}

impl Default for GpuTarget {
    fn default() -> Self {
        Self {
            backend: Backend::Hip,
            arch: "gfx90a".to_string(),
            compute_capability: 0x90a,
        }
    }
}

impl fmt::Display for GpuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend {
            Backend::Cuda => write!(f, "cuda:{}", self.compute_capability),
            Backend::Hip => write!(f, "hip:{}", self.arch),
        }
    }
}

impl FromStr for GpuTarget {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (backend, arch) = s
            .split_once(':')
            .ok_or_else(|| TargetError::InvalidTarget(s.to_string()))?;
        match backend {
            "cuda" => arch
                .parse::<u32>()
                .map(Self::cuda)
                .map_err(|_| TargetError::UnknownArch(arch.to_string())),
            "hip" => Self::hip(arch),
            other => Err(TargetError::UnknownBackend(other.to_string())),
        }
    }
}

/// Errors that can occur when parsing target strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    /// Unknown backend.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    /// Unknown architecture.
    #[error("unknown architecture: {0}")]
    UnknownArch(String),
    /// Invalid target string format.
    #[error("invalid target string `{0}`, expected `<backend>:<arch>`")]
    InvalidTarget(String),
}
