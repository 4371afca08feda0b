// gpu/scale_space.rs — device-side Gaussian scale space.
//
// Mirrors the CPU `ScaleSpace` octave for octave: the base image is
// uploaded once, optionally doubled (delta_min = 0.5), pre-blurred to
// sigma_min, and then each octave's slices are produced by incremental
// separable blurs entirely on the device. The seed slice is decimated
// into the next octave's base without ever leaving the GPU.
//
// Three pipelines, one WGSL file each:
//   blur.wgsl      — 1D Gaussian pass, horizontal or vertical by uniform
//                    flag; run twice per incremental blur with a scratch
//                    slice between the passes.
//   decimate.wgsl  — dst(x, y) = src(2x, 2y).
//   upsample.wgsl  — exact 2× bilinear sampling at (x/2, y/2).
//
// Kernel coefficients come from the same `gaussian_kernel_1d` the CPU
// path uses; only the symmetric right half is shipped in the uniform.

use wgpu::util::DeviceExt;

use crate::convolution::{gaussian_half_width, gaussian_kernel_1d};
use crate::gpu::device::GpuDevice;
use crate::gpu::slice::GpuSlice;
use crate::image::Image;
use crate::params::{ConfigError, ScaleSpaceParams};
use crate::scale_space::{
    max_octave_count, seed_slice_index, slice_sigma, Octave, OctaveSource,
};

/// Largest supported half-width of a blur kernel: the uniform carries 32
/// coefficients, covering sigma up to ≈ 10 in grid units. The widest blur
/// the default geometry produces (last incremental step with
/// delta_min = 0.5) has half-width 19; `check_kernel_capacity` rejects
/// configurations that would exceed the limit before any work is queued.
const MAX_KERNEL_HALF_WIDTH: usize = 31;

/// Reject configurations whose blur kernels do not fit the uniform.
///
/// Sigmas are free parameters, so a configuration that passes
/// `ScaleSpaceParams::validate` can still demand a kernel wider than the
/// 32-coefficient capacity. Every blur the pipeline will ever run is
/// checked here: the base preparation and each incremental octave step
/// (which, in grid units, are the same for every octave because sigma
/// scales with delta). Runs before the first upload so the failure is a
/// `ConfigError`, not a mid-pipeline panic.
pub(crate) fn check_kernel_capacity(params: &ScaleSpaceParams) -> Result<(), ConfigError> {
    let mut widest = (params.sigma_min * params.sigma_min
        - params.sigma_in * params.sigma_in)
        .max(0.0)
        .sqrt()
        / params.delta_min;

    let n = params.slices_per_octave();
    let sigmas: Vec<f32> = (0..n).map(|s| slice_sigma(params, params.delta_min, s)).collect();
    for s in 1..n {
        let sigma_extra =
            (sigmas[s] * sigmas[s] - sigmas[s - 1] * sigmas[s - 1]).sqrt() / params.delta_min;
        widest = widest.max(sigma_extra);
    }

    let half_width = if widest > 0.0 { gaussian_half_width(widest) } else { 0 };
    if half_width > MAX_KERNEL_HALF_WIDTH {
        return Err(ConfigError::KernelCapacityExceeded {
            half_width,
            max: MAX_KERNEL_HALF_WIDTH,
        });
    }
    Ok(())
}

/// Uniform block for `blur.wgsl`. Layout must match the WGSL struct:
///   offset   0: width      (u32)
///   offset   4: height     (u32)
///   offset   8: half_size  (u32)
///   offset  12: horizontal (u32, 0 or 1)
///   offset  16: coeffs     (8 × vec4<f32>)
///   total: 144 bytes
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    width: u32,
    height: u32,
    half_size: u32,
    horizontal: u32,
    /// coeffs[i/4][i%4] = kernel weight for offset i (right half; the left
    /// half is its mirror).
    coeffs: [[f32; 4]; 8],
}

impl BlurParams {
    fn new(width: u32, height: u32, kernel: &[f32], horizontal: bool) -> Self {
        assert!(kernel.len() % 2 == 1, "kernel must have odd length");
        let half_size = (kernel.len() - 1) / 2;
        assert!(
            half_size <= MAX_KERNEL_HALF_WIDTH,
            "kernel half-width {half_size} exceeds uniform capacity"
        );
        let mut coeffs = [[0.0f32; 4]; 8];
        for (i, &c) in kernel[half_size..].iter().enumerate() {
            coeffs[i / 4][i % 4] = c;
        }
        BlurParams {
            width,
            height,
            half_size: half_size as u32,
            horizontal: horizontal as u32,
            coeffs,
        }
    }
}

/// One texture-in/texture-out compute pipeline plus its layout.
struct SlicePipeline {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl SlicePipeline {
    /// Compile a WGSL source with the device's workgroup size substituted
    /// for the {{WG_X}}/{{WG_Y}} tokens. `with_uniform` adds a binding-2
    /// uniform buffer entry (blur needs it, resampling does not).
    fn new(
        gpu: &GpuDevice,
        source: &str,
        entry_point: &str,
        with_uniform: bool,
    ) -> Self {
        let shader_src = source
            .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(entry_point),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let mut entries = vec![
            // Binding 0 — input slice.
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                },
                count: None,
            },
            // Binding 1 — output slice.
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu::TextureFormat::R32Float,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
        ];
        if with_uniform {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(entry_point),
                entries: &entries,
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(entry_point),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&layout),
                module: &shader,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        SlicePipeline { pipeline, bgl }
    }

    /// Dispatch `src → dst` covering the destination, with an optional
    /// uniform at binding 2.
    fn dispatch(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        src: &GpuSlice,
        dst: &GpuSlice,
        uniform: Option<&wgpu::Buffer>,
    ) {
        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&src.read_view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&dst.write_view),
            },
        ];
        if let Some(buf) = uniform {
            entries.push(wgpu::BindGroupEntry {
                binding: 2,
                resource: buf.as_entire_binding(),
            });
        }
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.bgl,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let (dx, dy) = gpu.dispatch_size(dst.width, dst.height);
        pass.dispatch_workgroups(dx, dy, 1);
    }
}

/// The compiled scale-space pipelines. Build once per device.
pub struct GpuScaleSpacePipelines {
    blur: SlicePipeline,
    decimate: SlicePipeline,
    upsample: SlicePipeline,
}

impl GpuScaleSpacePipelines {
    pub fn new(gpu: &GpuDevice) -> Self {
        GpuScaleSpacePipelines {
            blur: SlicePipeline::new(gpu, include_str!("../shaders/blur.wgsl"), "blur_1d", true),
            decimate: SlicePipeline::new(
                gpu,
                include_str!("../shaders/decimate.wgsl"),
                "decimate_2x",
                false,
            ),
            upsample: SlicePipeline::new(
                gpu,
                include_str!("../shaders/upsample.wgsl"),
                "upsample_2x",
                false,
            ),
        }
    }

    /// Separable Gaussian blur `src → dst` through `scratch`, all three the
    /// same size. Two passes in one submission.
    fn blur(
        &self,
        gpu: &GpuDevice,
        src: &GpuSlice,
        scratch: &GpuSlice,
        dst: &GpuSlice,
        sigma: f32,
    ) {
        let kernel = gaussian_kernel_1d(sigma);
        let horizontal = BlurParams::new(src.width, src.height, &kernel, true);
        let vertical = BlurParams::new(src.width, src.height, &kernel, false);
        let h_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("BlurParams horizontal"),
            contents: bytemuck::bytes_of(&horizontal),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let v_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("BlurParams vertical"),
            contents: bytemuck::bytes_of(&vertical),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("blur") });
        self.blur.dispatch(gpu, &mut encoder, src, scratch, Some(&h_buf));
        self.blur.dispatch(gpu, &mut encoder, scratch, dst, Some(&v_buf));
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    fn decimate(&self, gpu: &GpuDevice, src: &GpuSlice) -> GpuSlice {
        let dst = GpuSlice::new(&gpu.device, src.width / 2, src.height / 2, "decimated");
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("decimate") });
        self.decimate.dispatch(gpu, &mut encoder, src, &dst, None);
        gpu.queue.submit(std::iter::once(encoder.finish()));
        dst
    }

    fn upsample(&self, gpu: &GpuDevice, src: &GpuSlice) -> GpuSlice {
        let dst = GpuSlice::new(&gpu.device, src.width * 2, src.height * 2, "upsampled");
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("upsample") });
        self.upsample.dispatch(gpu, &mut encoder, src, &dst, None);
        gpu.queue.submit(std::iter::once(encoder.finish()));
        dst
    }
}

/// One octave resident on the device.
pub struct GpuOctave {
    pub level: u32,
    pub delta: f32,
    pub sigmas: Vec<f32>,
    pub slices: Vec<GpuSlice>,
}

impl GpuOctave {
    /// Read every slice back into a CPU `Octave`.
    pub fn download(&self, gpu: &GpuDevice) -> Octave {
        Octave {
            level: self.level,
            delta: self.delta,
            sigmas: self.sigmas.clone(),
            slices: self.slices.iter().map(|s| s.download(gpu)).collect(),
        }
    }
}

/// Device-side `OctaveSource`. Owns the pipelines and the current base
/// slice; borrows the device context.
pub struct GpuScaleSpace<'a> {
    gpu: &'a GpuDevice,
    pipelines: GpuScaleSpacePipelines,
    params: ScaleSpaceParams,
    base: Option<GpuSlice>,
    native_size: (usize, usize),
    octave_index: u32,
    max_octaves: u32,
    delta: f32,
}

impl<'a> GpuScaleSpace<'a> {
    pub fn new(gpu: &'a GpuDevice, params: ScaleSpaceParams) -> Self {
        GpuScaleSpace {
            gpu,
            pipelines: GpuScaleSpacePipelines::new(gpu),
            params,
            base: None,
            native_size: (0, 0),
            octave_index: 0,
            max_octaves: 0,
            delta: params.delta_min,
        }
    }

    pub fn params(&self) -> &ScaleSpaceParams {
        &self.params
    }

    /// Build the next octave without leaving the device. The seed slice is
    /// decimated into the following octave's base as part of the chain.
    pub fn next_device_octave(&mut self) -> Option<GpuOctave> {
        if self.octave_index >= self.max_octaves {
            return None;
        }
        let base = self.base.take()?;
        let gpu = self.gpu;

        let n = self.params.slices_per_octave();
        let delta = self.delta;
        let sigmas: Vec<f32> = (0..n).map(|s| slice_sigma(&self.params, delta, s)).collect();

        let scratch = GpuSlice::new(&gpu.device, base.width, base.height, "blur scratch");
        let mut slices = Vec::with_capacity(n);
        slices.push(base);
        for s in 1..n {
            let sigma_extra =
                (sigmas[s] * sigmas[s] - sigmas[s - 1] * sigmas[s - 1]).sqrt() / delta;
            let label = format!("octave {} slice {s}", self.octave_index);
            let dst = GpuSlice::new(&gpu.device, scratch.width, scratch.height, &label);
            self.pipelines.blur(gpu, &slices[s - 1], &scratch, &dst, sigma_extra);
            slices.push(dst);
        }

        let seed = seed_slice_index(&self.params);
        self.base = Some(self.pipelines.decimate(gpu, &slices[seed]));
        self.delta *= 2.0;

        let octave = GpuOctave {
            level: self.octave_index,
            delta,
            sigmas,
            slices,
        };
        self.octave_index += 1;
        Some(octave)
    }
}

impl OctaveSource for GpuScaleSpace<'_> {
    fn set_image(&mut self, image: &Image) -> Result<(), ConfigError> {
        self.params.validate()?;
        check_kernel_capacity(&self.params)?;
        let gpu = self.gpu;

        let input = GpuSlice::upload(gpu, image, "input image");
        let working = if self.params.delta_min == 0.5 {
            self.pipelines.upsample(gpu, &input)
        } else {
            input
        };

        let sigma_extra = (self.params.sigma_min * self.params.sigma_min
            - self.params.sigma_in * self.params.sigma_in)
            .max(0.0)
            .sqrt()
            / self.params.delta_min;
        let base = if sigma_extra > 0.0 {
            let scratch =
                GpuSlice::new(&gpu.device, working.width, working.height, "base scratch");
            let dst = GpuSlice::new(&gpu.device, working.width, working.height, "base");
            self.pipelines.blur(gpu, &working, &scratch, &dst, sigma_extra);
            dst
        } else {
            working
        };

        self.native_size = (image.width(), image.height());
        self.max_octaves = self
            .params
            .nb_octaves
            .min(max_octave_count(image.width(), image.height()));
        self.octave_index = 0;
        self.delta = self.params.delta_min;
        self.base = Some(base);
        Ok(())
    }

    fn next_octave(&mut self) -> Option<Octave> {
        let octave = self.next_device_octave()?;
        Some(octave.download(self.gpu))
    }

    fn native_size(&self) -> (usize, usize) {
        self.native_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::convolve_separable;
    use crate::scale_space::ScaleSpace;

    #[test]
    fn test_blur_params_layout() {
        assert_eq!(std::mem::size_of::<BlurParams>(), 144);
    }

    #[test]
    fn test_blur_params_right_half() {
        let kernel = gaussian_kernel_1d(1.0); // 7 taps, half 3
        let p = BlurParams::new(64, 64, &kernel, true);
        assert_eq!(p.half_size, 3);
        assert_eq!(p.horizontal, 1);
        // Centre weight is the largest; weights decay outward.
        assert!(p.coeffs[0][0] > p.coeffs[0][1]);
        assert!(p.coeffs[0][1] > p.coeffs[0][2]);
        assert_eq!(p.coeffs[1][0], 0.0);
    }

    #[test]
    fn test_default_config_within_kernel_capacity() {
        assert_eq!(check_kernel_capacity(&ScaleSpaceParams::default()), Ok(()));
        let native = ScaleSpaceParams { delta_min: 1.0, ..Default::default() };
        assert_eq!(check_kernel_capacity(&native), Ok(()));
    }

    #[test]
    fn test_oversized_sigma_rejected_before_any_upload() {
        // sigma_min = 6.0 passes validate() (it only requires
        // sigma_min >= sigma_in * delta_min) but the last incremental step
        // needs a kernel far wider than the 32-coefficient uniform. The
        // device path must surface this as a ConfigError up front instead
        // of panicking once the blur uniform is built.
        let params = ScaleSpaceParams { sigma_min: 6.0, ..Default::default() };
        assert_eq!(params.validate(), Ok(()));
        assert!(matches!(
            check_kernel_capacity(&params),
            Err(ConfigError::KernelCapacityExceeded { half_width, max })
                if half_width > max
        ));
    }

    #[test]
    fn test_widest_geometry_kernel_fits() {
        // Largest incremental blur the default geometry produces, in grid
        // units: the last step of any octave with delta_min = 0.5.
        let params = ScaleSpaceParams::default();
        let n = params.slices_per_octave();
        let sigmas: Vec<f32> =
            (0..n).map(|s| slice_sigma(&params, params.delta_min, s)).collect();
        let widest = (sigmas[n - 1] * sigmas[n - 1] - sigmas[n - 2] * sigmas[n - 2]).sqrt()
            / params.delta_min;
        let kernel = gaussian_kernel_1d(widest);
        assert!((kernel.len() - 1) / 2 <= MAX_KERNEL_HALF_WIDTH);
    }

    // ---- GPU integration tests (subprocess-isolated) ------------------------

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test", "--lib", "--",
                test_name, "--exact", "--ignored", "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    fn noise_image(w: usize, h: usize, mut seed: u32) -> Image {
        let data = (0..w * h)
            .map(|_| {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                (seed >> 8) as f32 / (1u32 << 24) as f32
            })
            .collect();
        Image::from_vec(w, h, data)
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_blur_matches_cpu() {
        let src = noise_image(96, 64, 3);
        let sigma = 1.8f32;

        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let pipelines = GpuScaleSpacePipelines::new(&gpu);
        let src_slice = GpuSlice::upload(&gpu, &src, "blur input");
        let scratch = GpuSlice::new(&gpu.device, 96, 64, "scratch");
        let dst = GpuSlice::new(&gpu.device, 96, 64, "blur output");
        pipelines.blur(&gpu, &src_slice, &scratch, &dst, sigma);
        let got = dst.download(&gpu);

        let k = gaussian_kernel_1d(sigma);
        let want = convolve_separable(&src, &k, &k);
        let mut max_err = 0.0f32;
        for (a, b) in got.as_slice().iter().zip(want.as_slice().iter()) {
            max_err = max_err.max((a - b).abs());
        }
        assert!(max_err < 1e-4, "blur host/device divergence: {max_err}");
        eprintln!("[test] max blur error: {max_err:e}");
        println!("GPU_TEST_OK");
        drop((dst, scratch, src_slice, pipelines, gpu));
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_octaves_match_cpu() {
        // Full pyramid agreement on a noise image, every slice of every
        // octave. Tolerance grows slightly with the accumulated chain.
        let src = noise_image(128, 96, 11);
        let params = ScaleSpaceParams::default();

        let mut cpu = ScaleSpace::new(params);
        cpu.set_image(&src).unwrap();

        let gpu_dev = GpuDevice::new().expect("need Vulkan GPU");
        let mut gpu_ss = GpuScaleSpace::new(&gpu_dev, params);
        gpu_ss.set_image(&src).unwrap();

        let mut compared = 0;
        loop {
            match (cpu.next_octave(), gpu_ss.next_octave()) {
                (None, None) => break,
                (Some(c), Some(g)) => {
                    assert_eq!(c.slices.len(), g.slices.len());
                    for (s, (cs, gs)) in c.slices.iter().zip(g.slices.iter()).enumerate() {
                        assert_eq!(cs.width(), gs.width());
                        assert_eq!(cs.height(), gs.height());
                        let mut max_err = 0.0f32;
                        for (a, b) in cs.as_slice().iter().zip(gs.as_slice().iter()) {
                            max_err = max_err.max((a - b).abs());
                        }
                        assert!(
                            max_err < 1e-3,
                            "octave {} slice {s}: host/device divergence {max_err}",
                            c.level
                        );
                    }
                    compared += 1;
                }
                (c, g) => panic!(
                    "octave count mismatch: cpu ended = {}, gpu ended = {}",
                    c.is_none(),
                    g.is_none()
                ),
            }
        }
        assert!(compared >= 2);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_blur_matches_cpu() {
        let out =
            run_gpu_test_in_subprocess("gpu::scale_space::tests::inner_blur_matches_cpu");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_octaves_match_cpu() {
        let out =
            run_gpu_test_in_subprocess("gpu::scale_space::tests::inner_octaves_match_cpu");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
