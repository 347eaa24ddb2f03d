// recolor.rs — Color-substitution configuration, backend seam, and the CPU
// reference kernel.
//
// The per-pixel rule lives here once, in plain Rust, and is the
// authoritative semantics: the WGSL kernel in gpu/recolor.rs is validated
// against it pixel-for-pixel. Tests that don't need a device run entirely
// through `CpuRecolorEngine`.
//
// THRESHOLD SEMANTICS
// ────────────────────
// The threshold is compared against the SQUARED Euclidean channel distance
// (r-dr)² + (g-dg)² + (b-db)² — no square root is ever taken. A threshold
// of 1 therefore means "squared channel distance <= 1", not "Euclidean
// distance <= 1". The kernel additionally takes abs() of the distance
// before comparing; a sum of squares is never negative, so the abs is a
// no-op safeguard kept so both backends compare identically.

use thiserror::Error;

use crate::gpu::device::GpuError;
use crate::image::{Image, Pixel};

// ---------------------------------------------------------------------------
// Color / RecolorConfig
// ---------------------------------------------------------------------------

/// A bare RGB triple used as the target or replacement of a recolor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    #[inline]
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }
}

/// Configuration of one recolor pass.
///
/// `threshold` is in squared-distance units (see the module docs). The
/// constructor clamps a negative value to 0.0, under which only exact
/// matches are replaced — squared distance is never negative, so no pixel
/// can sit below zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecolorConfig {
    pub target: Color,
    pub replacement: Color,
    pub threshold: f32,
}

impl RecolorConfig {
    pub fn new(target: Color, replacement: Color, threshold: f32) -> Self {
        RecolorConfig {
            target,
            replacement,
            threshold: threshold.max(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from one recolor pass. Compile/link failures abort before any
/// dispatch and leave the image exactly as it was on entry. After a
/// readback failure the image state is undefined and must not be trusted.
/// No variant is ever retried.
#[derive(Debug, Error)]
pub enum RecolorError {
    /// Kernel source failed to compile. Carries the backend diagnostic
    /// log verbatim.
    #[error("kernel compilation failed:\n{log}")]
    KernelCompile { log: String },

    /// Compiled kernel failed to link into an executable pipeline.
    /// Carries the backend diagnostic log verbatim.
    #[error("kernel pipeline creation failed:\n{log}")]
    KernelLink { log: String },

    /// Device buffer mapping or readback failed.
    #[error("GPU resource failure: {0}")]
    GpuResource(String),

    /// Device initialization failed before the pass could start.
    #[error("GPU device unavailable")]
    Device(#[from] GpuError),
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// A compute backend that can run one recolor pass over an image.
///
/// The call is synchronous and blocks for its whole duration; the only
/// parallelism is inside the backend's kernel, where every pixel is
/// independent. Implementations own their per-call device resources
/// exclusively — concurrent calls on one backend instance require external
/// serialization.
pub trait RecolorBackend {
    /// Replace every pixel within `config.threshold` (squared distance)
    /// of `config.target` with `config.replacement`, in place.
    fn apply(&self, image: &mut Image, config: &RecolorConfig) -> Result<(), RecolorError>;
}

// ---------------------------------------------------------------------------
// CPU reference kernel
// ---------------------------------------------------------------------------

/// Squared Euclidean distance between a pixel and a color, per channel.
///
/// i64 because a channel can legitimately reach 255 * 255 = 65025 after
/// low-depth normalization, and its square exceeds i32::MAX.
#[inline]
pub fn squared_distance(pixel: Pixel, color: Color) -> i64 {
    let dr = pixel.r as i64 - color.r as i64;
    let dg = pixel.g as i64 - color.g as i64;
    let db = pixel.b as i64 - color.b as i64;
    dr * dr + dg * dg + db * db
}

/// The per-pixel rule shared by both backends: the replacement when the
/// squared distance to the target is within the threshold, the original
/// pixel otherwise. Compared in f32 for exact parity with the GPU kernel.
#[inline]
pub fn recolor_pixel(pixel: Pixel, config: &RecolorConfig) -> Pixel {
    let dist = squared_distance(pixel, config.target) as f32;
    if dist.abs() <= config.threshold {
        Pixel::new(
            config.replacement.r as u16,
            config.replacement.g as u16,
            config.replacement.b as u16,
        )
    } else {
        pixel
    }
}

/// Host-side reference implementation of the recolor pass.
///
/// Runs the same per-pixel rule as the GPU kernel in a plain loop. Used as
/// the authoritative semantics in tests and as a fallback where no
/// suitable adapter exists. Never fails.
#[derive(Debug, Default)]
pub struct CpuRecolorEngine;

impl RecolorBackend for CpuRecolorEngine {
    fn apply(&self, image: &mut Image, config: &RecolorConfig) -> Result<(), RecolorError> {
        for pixel in image.as_mut_slice() {
            *pixel = recolor_pixel(*pixel, config);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
