// chroma-swap: GPU-accelerated bulk color substitution for binary
// pixel-map (PPM "P6") images.
//
// Pipeline: ppm::decode → Image → RecolorBackend::apply → ppm::encode.
//
// The CPU implementation in `recolor` is the authoritative reference for
// the per-pixel rule; the wgpu kernel in `gpu::recolor` is validated
// against it pixel-for-pixel and carries the same squared-distance
// threshold semantics.

pub mod image;
pub mod ppm;
pub mod recolor;

pub mod gpu;

pub use image::{Image, Pixel};
pub use ppm::PpmError;
pub use recolor::{Color, CpuRecolorEngine, RecolorBackend, RecolorConfig, RecolorError};

pub use gpu::device::{GpuDevice, GpuError, WorkgroupSize};
pub use gpu::recolor::GpuRecolorEngine;
