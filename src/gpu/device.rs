// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and select the first non-CPU one.
//   - Expose `WorkgroupSize` — the 2D work-group configuration used when
//     specializing the compute kernel, with grid sizing that covers the
//     whole image even when its dimensions are not multiples of the
//     work-group size.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab a software rasterizer (llvmpipe and friends) where one appears
// as a valid adapter. We enumerate explicitly and prefer real hardware:
//   1. DiscreteGpu / IntegratedGpu — real hardware.
//   2. VirtualGpu / Other — VM pass-through, translation layers.
//   3. Last resort: whatever exists, adapter name logged so you know.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

/// A work-group size configuration for 2D compute dispatches.
///
/// The kernel source is specialized with these values at pipeline creation
/// time; the product must stay within the device's invocation limit
/// (checked by [`GpuDevice::set_workgroup_size`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl Default for WorkgroupSize {
    /// 8×8 = 64 invocations — comfortably within every backend's default
    /// 256-invocation limit, and a good fit for row-major image tiles.
    fn default() -> Self {
        WorkgroupSize { x: 8, y: 8 }
    }
}

impl WorkgroupSize {
    /// Total invocations per work-group (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Number of work-groups needed to cover an image of the given size.
    ///
    /// Ceiling division, so every pixel is covered even when the image
    /// dimensions are not multiples of the work-group size. The kernel
    /// must guard against out-of-bounds global IDs in the partial edge
    /// groups:
    /// ```wgsl
    /// if gid.x >= width || gid.y >= height { return; }
    /// ```
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let dx = (img_w + self.x - 1) / self.x;
        let dy = (img_h + self.y - 1) / self.y;
        (dx, dy)
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The core GPU context: device, queue, and active work-group size.
///
/// Expensive to create (instance + device initialization); hold one for
/// the lifetime of the application. Per-pass resources (buffers,
/// pipelines) are never stored here — they live and die inside each
/// recolor call.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; some
/// drivers crash when the instance is destroyed while device-level
/// objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never accessed directly.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` on the first non-CPU adapter found.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self, GpuError> {
        // Validation layer in debug builds so kernel diagnostics carry
        // source context.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let i = a.get_info();
            debug!(name = %i.name, backend = ?i.backend, device_type = ?i.device_type, "adapter");
        }

        // Tier 1: anything that is not a software rasterizer.
        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            // Tier 2 (last resort): take whatever exists, even Cpu/software.
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::PRIMARY)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        info!(adapter = %adapter_info, "selected compute adapter");

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("chroma-swap"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            workgroup_size: WorkgroupSize::default(),
            _instance: instance,
        })
    }

    /// Override the default work-group size, validating against the
    /// device's invocation limit.
    ///
    /// # Errors
    /// Returns `Err` if `x * y` exceeds the device's
    /// `max_compute_invocations_per_workgroup`.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = self.device.limits().max_compute_invocations_per_workgroup;
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Number of work-groups covering an image of the given size with the
    /// active work-group configuration.
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        self.workgroup_size.dispatch_size(img_w, img_h)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, workgroup: {} }}",
            self.adapter_info, self.workgroup_size
        )
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization and configuration.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter found at all. Check that a Vulkan/Metal/DX12 driver is
    /// installed and visible to the process.
    #[error("no suitable compute adapter found (no GPU driver visible)")]
    NoSuitableAdapter,

    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),

    /// Requested work-group size exceeds the device's invocation limit.
    #[error("workgroup size {total} exceeds device limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },
}

// ============================================================
// Tests
// ============================================================
