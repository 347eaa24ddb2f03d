// gpu/recolor.rs — GPU color-substitution pass.
//
// RESOURCE PROTOCOL (per call, in order):
//   1. Flatten the image into a staged f32 buffer, one vec4 per pixel
//      (r, g, b, sentinel 1.0).
//   2. Compile the WGSL kernel — validation failure aborts with
//      `KernelCompile` and the image untouched.
//   3. Build the compute pipeline — failure aborts with `KernelLink`.
//   4. Bind target, replacement, threshold, and image dimensions through
//      one uniform struct; upload the staged pixel data as the input
//      storage buffer.
//   5. Dispatch a 2D grid of 8×8 workgroups covering the whole image
//      (ceiling division; the kernel guards partial edge groups).
//   6. Copy the output storage buffer to a MAP_READ buffer and block on
//      the mapped readback — the one point where the host waits for the
//      device.
//   7. Write the first three channels of each record back into the image,
//      discarding the sentinel.
//
// Every device resource is a local of `apply`, so success and every error
// path release all of them before returning; nothing persists across
// calls. Shader modules and pipelines are rebuilt per call for the same
// reason.

use wgpu::util::DeviceExt;

use tracing::debug;

use crate::gpu::device::{GpuDevice, GpuError};
use crate::image::{Image, Pixel};
use crate::recolor::{RecolorBackend, RecolorConfig, RecolorError};

/// Value of the unused fourth slot in every staged pixel record.
const SENTINEL: f32 = 1.0;

// ---------------------------------------------------------------------------
// Uniform params (must match WGSL struct RecolorParams exactly)
// ---------------------------------------------------------------------------

/// Kernel-visible configuration. `target` and `replacement` occupy
/// distinct slots at distinct offsets — the comparison reads one, the
/// rewrite reads the other, and the two must never alias.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct RecolorParams {
    target: [f32; 4],
    replacement: [f32; 4],
    threshold: f32,
    width: u32,
    height: u32,
    _pad: u32,
}

impl RecolorParams {
    fn new(config: &RecolorConfig, width: u32, height: u32) -> Self {
        RecolorParams {
            target: [
                config.target.r as f32,
                config.target.g as f32,
                config.target.b as f32,
                0.0,
            ],
            replacement: [
                config.replacement.r as f32,
                config.replacement.g as f32,
                config.replacement.b as f32,
                0.0,
            ],
            threshold: config.threshold,
            width,
            height,
            _pad: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Staging helpers
// ---------------------------------------------------------------------------

/// Flatten the pixel grid into the staged upload layout: one 4-element
/// f32 record per pixel in row-major order, sentinel in the fourth slot.
///
/// The staged vector carries the real pixel values — it is exactly what
/// reaches device memory.
fn flatten_rgba(image: &Image) -> Vec<f32> {
    let mut staged = Vec::with_capacity(image.width() * image.height() * 4);
    for pixel in image.as_slice() {
        staged.push(pixel.r as f32);
        staged.push(pixel.g as f32);
        staged.push(pixel.b as f32);
        staged.push(SENTINEL);
    }
    staged
}

/// Copy kernel output records back into the image, taking the first three
/// channels of each record and discarding the fourth.
fn write_back(image: &mut Image, records: &[f32]) {
    debug_assert_eq!(records.len(), image.width() * image.height() * 4);
    for (idx, pixel) in image.as_mut_slice().iter_mut().enumerate() {
        let off = idx * 4;
        *pixel = Pixel::new(
            clamp_channel(records[off]),
            clamp_channel(records[off + 1]),
            clamp_channel(records[off + 2]),
        );
    }
}

#[inline]
fn clamp_channel(v: f32) -> u16 {
    v.clamp(0.0, u16::MAX as f32) as u16
}

// ---------------------------------------------------------------------------
// GpuRecolorEngine
// ---------------------------------------------------------------------------

/// GPU recolor pass over a wgpu compute pipeline.
///
/// Owns the device context; per-call resources are created and released
/// inside each [`RecolorBackend::apply`] invocation. One in-flight pass
/// at a time — concurrent calls need their own engine or external
/// serialization.
pub struct GpuRecolorEngine {
    gpu: GpuDevice,
}

impl GpuRecolorEngine {
    /// Create an engine on the first suitable adapter.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        Ok(GpuRecolorEngine {
            gpu: GpuDevice::new()?,
        })
    }

    /// Create an engine around an existing device context.
    pub fn with_device(gpu: GpuDevice) -> Self {
        GpuRecolorEngine { gpu }
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Kernel source specialized for the active work-group size.
    fn kernel_source(&self) -> String {
        let template = include_str!("../shaders/recolor.wgsl");
        template
            .replace("{{WG_X}}", &self.gpu.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &self.gpu.workgroup_size.y.to_string())
    }

    /// Compile the kernel source into a shader module.
    ///
    /// Validation diagnostics are captured through an error scope and
    /// surface on [`RecolorError::KernelCompile`] verbatim.
    fn compile_kernel(&self, source: &str) -> Result<wgpu::ShaderModule, RecolorError> {
        self.gpu
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("recolor.wgsl"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(e) = pollster::block_on(self.gpu.device.pop_error_scope()) {
            return Err(RecolorError::KernelCompile { log: e.to_string() });
        }
        Ok(module)
    }

    /// Link the compiled kernel into an executable compute pipeline.
    ///
    /// Failures surface on [`RecolorError::KernelLink`] with the backend
    /// diagnostic.
    fn build_pipeline(
        &self,
        module: &wgpu::ShaderModule,
    ) -> Result<(wgpu::ComputePipeline, wgpu::BindGroupLayout), RecolorError> {
        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("recolor BGL"),
            entries: &[
                // 0 — input pixel records (storage, read-only)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 1 — output pixel records (storage, read_write)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 2 — params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("recolor pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("replace_color"),
            layout: Some(&layout),
            module,
            entry_point: "replace_color",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(RecolorError::KernelLink { log: e.to_string() });
        }
        Ok((pipeline, bgl))
    }
}

impl RecolorBackend for GpuRecolorEngine {
    fn apply(&self, image: &mut Image, config: &RecolorConfig) -> Result<(), RecolorError> {
        let device = &self.gpu.device;
        let width = image.width() as u32;
        let height = image.height() as u32;
        let n_pixels = image.width() * image.height();
        let buf_size = (n_pixels * 4 * std::mem::size_of::<f32>()) as u64;

        // Stage the real pixel contents before touching the device —
        // compile/link failures below must leave the image untouched,
        // which holds because nothing writes back until readback succeeds.
        let staged = flatten_rgba(image);

        let module = self.compile_kernel(&self.kernel_source())?;
        let (pipeline, bgl) = self.build_pipeline(&module)?;

        let params = RecolorParams::new(config, width, height);
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("recolor params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        // Input buffer initialized with the staged pixel data. COPY_SRC so
        // tests can read device-side contents back and assert fidelity.
        let input_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("recolor input"),
            contents: bytemuck::cast_slice(&staged),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });

        // Output buffer, zero-filled by wgpu, same shape as the input.
        let output_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("recolor output"),
            size: buf_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("recolor BG"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let (wg_x, wg_y) = self.gpu.dispatch_size(width, height);
        debug!(width, height, wg_x, wg_y, "dispatching recolor kernel");

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("recolor dispatch"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("replace_color"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wg_x, wg_y, 1);
        }

        // The copy below is ordered after the compute pass by wgpu's
        // usage-scope tracking: all kernel writes to output_buf are made
        // visible before the copy reads them.
        let readback_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("recolor readback"),
            size: buf_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&output_buf, 0, &readback_buf, 0, buf_size);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        // Mapped readback — the single blocking point. The poll waits for
        // all prior device work; a hang here hangs the call (no timeout).
        let slice = readback_buf.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| RecolorError::GpuResource("readback map callback never fired".into()))?
            .map_err(|e| RecolorError::GpuResource(format!("output buffer map failed: {e:?}")))?;

        {
            let mapped = slice.get_mapped_range();
            let records: &[f32] = bytemuck::cast_slice(&mapped);
            write_back(image, records);
        }
        readback_buf.unmap();

        // input_buf, output_buf, params_buf, readback_buf, pipeline, and
        // module are all locals: dropped here on success, and on every
        // error path above via unwind-free early return.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recolor::{Color, CpuRecolorEngine};

    // ---- Staging and params (pure, no GPU needed) ---------------------------

    #[test]
    fn test_flatten_carries_real_pixel_data() {
        // Guard against staging a zeroed placeholder: the staged buffer
        // must hold the host's actual channel values.
        let img = Image::from_vec(
            2,
            1,
            vec![Pixel::new(10, 20, 30), Pixel::new(200, 150, 100)],
        );
        let staged = flatten_rgba(&img);
        assert_eq!(
            staged,
            vec![10.0, 20.0, 30.0, SENTINEL, 200.0, 150.0, 100.0, SENTINEL]
        );
        assert!(
            staged.iter().any(|&v| v != 0.0),
            "staged buffer must never be all zeros for a non-black image"
        );
    }

    #[test]
    fn test_flatten_length_is_4_per_pixel() {
        let img = Image::new(7, 5);
        assert_eq!(flatten_rgba(&img).len(), 7 * 5 * 4);
    }

    #[test]
    fn test_write_back_discards_fourth_slot() {
        let mut img = Image::new(2, 1);
        let records = vec![1.0, 2.0, 3.0, 99.0, 4.0, 5.0, 6.0, -7.0];
        write_back(&mut img, &records);
        assert_eq!(img.get(0, 0), Pixel::new(1, 2, 3));
        assert_eq!(img.get(1, 0), Pixel::new(4, 5, 6));
    }

    #[test]
    fn test_flatten_write_back_roundtrip() {
        let pixels: Vec<Pixel> = (0..12u16).map(|i| Pixel::new(i, i * 2, i * 3)).collect();
        let img = Image::from_vec(4, 3, pixels);
        let staged = flatten_rgba(&img);
        let mut out = Image::new(4, 3);
        write_back(&mut out, &staged);
        for (a, b) in img.as_slice().iter().zip(out.as_slice()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_params_bind_target_and_replacement_to_distinct_slots() {
        // Binding both colors to the same uniform slot silently turns
        // recoloring into a no-op (replacement == target). Each field
        // must hold its own configured value.
        let config = RecolorConfig::new(Color::new(255, 254, 253), Color::new(1, 2, 3), 7.0);
        let params = RecolorParams::new(&config, 10, 20);
        assert_eq!(params.target[..3], [255.0, 254.0, 253.0]);
        assert_eq!(params.replacement[..3], [1.0, 2.0, 3.0]);
        assert_ne!(
            params.target, params.replacement,
            "target and replacement slots must hold different values"
        );
        assert_eq!(params.threshold, 7.0);
        assert_eq!((params.width, params.height), (10, 20));
    }

    #[test]
    fn test_params_layout_matches_wgsl_uniform() {
        // vec4 + vec4 + f32 + u32 + u32 + pad = 48 bytes, 16-aligned —
        // must match the WGSL struct byte-for-byte.
        assert_eq!(std::mem::size_of::<RecolorParams>(), 48);
        assert_eq!(std::mem::align_of::<RecolorParams>(), 4);
    }

    #[test]
    fn test_kernel_template_has_placeholders() {
        let template = include_str!("../shaders/recolor.wgsl");
        assert!(template.contains("{{WG_X}}"));
        assert!(template.contains("{{WG_Y}}"));
        let specialized = template.replace("{{WG_X}}", "8").replace("{{WG_Y}}", "8");
        assert!(
            !specialized.contains("{{"),
            "all placeholders must be substituted"
        );
    }

    // ---- GPU integration tests ----------------------------------------------
    //
    // These need a real adapter and are `#[ignore]`d so `cargo test`
    // passes in CI without a driver. Run with:
    //   cargo test -- --include-ignored

    fn engine() -> GpuRecolorEngine {
        GpuRecolorEngine::new().expect("need a compute-capable adapter")
    }

    #[test]
    #[ignore = "requires a GPU"]
    fn gpu_white_image_to_black() {
        let mut img = Image::from_vec(2, 2, vec![Pixel::new(255, 255, 255); 4]);
        let config = RecolorConfig::new(Color::new(255, 255, 255), Color::new(0, 0, 0), 0.0);
        engine().apply(&mut img, &config).unwrap();
        for (_, _, p) in img.pixels() {
            assert_eq!(p, Pixel::new(0, 0, 0));
        }
    }

    #[test]
    #[ignore = "requires a GPU"]
    fn gpu_matches_cpu_reference() {
        // Pseudo-random image (LCG, fixed seed) over a size that is not a
        // multiple of the 8×8 workgroup, so partial edge groups run too.
        let mut rng = 99991u32;
        let pixels: Vec<Pixel> = (0..61 * 37)
            .map(|_| {
                let mut next = || {
                    rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
                    (rng >> 24) as u16
                };
                Pixel::new(next(), next(), next())
            })
            .collect();
        let src = Image::from_vec(61, 37, pixels);
        let config = RecolorConfig::new(Color::new(128, 64, 32), Color::new(0, 255, 0), 5000.0);

        let mut cpu_img = src.clone();
        CpuRecolorEngine.apply(&mut cpu_img, &config).unwrap();

        let mut gpu_img = src.clone();
        engine().apply(&mut gpu_img, &config).unwrap();

        for (a, b) in cpu_img.as_slice().iter().zip(gpu_img.as_slice()) {
            assert_eq!(a, b, "GPU kernel disagrees with CPU reference");
        }
    }

    #[test]
    #[ignore = "requires a GPU"]
    fn gpu_device_side_input_matches_host() {
        // Upload fidelity: read the staged input buffer back from device
        // memory and compare against the host's flattened pixel data.
        let eng = engine();
        let img = Image::from_vec(
            3,
            2,
            (1..=6u16).map(|i| Pixel::new(i * 10, i * 20, i * 30)).collect(),
        );
        let staged = flatten_rgba(&img);
        let size = (staged.len() * std::mem::size_of::<f32>()) as u64;

        let device = &eng.gpu.device;
        let input_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("fidelity input"),
            contents: bytemuck::cast_slice(&staged),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fidelity readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&input_buf, 0, &readback, 0, size);
        eng.gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv().unwrap().unwrap();

        let mapped = slice.get_mapped_range();
        let device_side: &[f32] = bytemuck::cast_slice(&mapped);
        assert_eq!(device_side, staged.as_slice(), "device-side input differs from host data");
        drop(mapped);
        readback.unmap();
    }

    #[test]
    #[ignore = "requires a GPU"]
    fn gpu_repeated_apply_stays_correct() {
        // Resource hygiene: all device resources are call-locals, so
        // repeated passes on one engine must neither leak nor corrupt.
        let eng = engine();
        let config = RecolorConfig::new(Color::new(255, 255, 255), Color::new(0, 0, 0), 0.0);
        for _ in 0..32 {
            let mut img = Image::from_vec(17, 9, vec![Pixel::new(255, 255, 255); 17 * 9]);
            eng.apply(&mut img, &config).unwrap();
            assert!(img.pixels().all(|(_, _, p)| p == Pixel::new(0, 0, 0)));
        }
    }

    #[test]
    #[ignore = "requires a GPU"]
    fn gpu_invalid_kernel_source_reports_compile_log() {
        let eng = engine();
        let err = eng
            .compile_kernel("@compute fn broken( { not wgsl")
            .unwrap_err();
        match err {
            RecolorError::KernelCompile { log } => {
                assert!(!log.is_empty(), "compile error must carry the backend diagnostic");
            }
            other => panic!("expected KernelCompile, got {other:?}"),
        }
    }
}
