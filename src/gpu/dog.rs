// gpu/dog.rs — device-side DoG subtraction and extrema scan.
//
// Two kernels:
//   dog_subtract.wgsl — pixel-wise signed difference of adjacent octave
//                       slices, written to a fresh R32Float slice.
//   dog_extrema.wgsl  — strict 26-neighbor extremum test over a triple of
//                       DoG slices. Results come back through a dense
//                       score buffer: one f32 per pixel, the DoG response
//                       where the pixel is a surviving extremum and 0.0
//                       everywhere else. No atomics, no compaction — the
//                       CPU walks the buffer once and collects nonzeros.
//
// The extrema kernel applies the same pre-filter fraction and the same
// tie-disqualifying inequalities as the CPU `find_candidates`, so the two
// paths produce identical candidate sets on identical stacks (a blanket
// zero response cannot pass the pre-filter, which keeps the 0.0 sentinel
// unambiguous).

use wgpu::util::DeviceExt;

use crate::dog::{DogStack, PREFILTER_FRACTION};
use crate::gpu::device::GpuDevice;
use crate::gpu::scale_space::GpuOctave;
use crate::gpu::slice::GpuSlice;
use crate::keypoint::Candidate;

/// Uniform block for `dog_extrema.wgsl`:
///   offset  0: width     (u32)
///   offset  4: height    (u32)
///   offset  8: threshold (f32) — pre-filter, already scaled by 0.8
///   offset 12: _pad      (u32)
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtremaParams {
    width: u32,
    height: u32,
    threshold: f32,
    _pad: u32,
}

/// Compiled DoG pipelines. Build once per device.
pub struct GpuDogPipelines {
    subtract: wgpu::ComputePipeline,
    subtract_bgl: wgpu::BindGroupLayout,
    extrema: wgpu::ComputePipeline,
    extrema_bgl: wgpu::BindGroupLayout,
}

impl GpuDogPipelines {
    pub fn new(gpu: &GpuDevice) -> Self {
        let (subtract, subtract_bgl) = Self::build_subtract(gpu);
        let (extrema, extrema_bgl) = Self::build_extrema(gpu);
        GpuDogPipelines { subtract, subtract_bgl, extrema, extrema_bgl }
    }

    fn compile(gpu: &GpuDevice, source: &str, label: &str) -> wgpu::ShaderModule {
        let src = source
            .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());
        gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(src.into()),
        })
    }

    fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
            },
            count: None,
        }
    }

    fn build_subtract(gpu: &GpuDevice) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
        let shader = Self::compile(gpu, include_str!("../shaders/dog_subtract.wgsl"), "dog_subtract");
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dog_subtract"),
            entries: &[
                // Binding 0 — the more-blurred slice (minuend).
                Self::texture_entry(0),
                // Binding 1 — the less-blurred slice (subtrahend).
                Self::texture_entry(1),
                // Binding 2 — output DoG slice.
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::R32Float,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });
        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("dog_subtract"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("dog_subtract"),
            layout: Some(&layout),
            module: &shader,
            entry_point: "dog_subtract",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        (pipeline, bgl)
    }

    fn build_extrema(gpu: &GpuDevice) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
        let shader = Self::compile(gpu, include_str!("../shaders/dog_extrema.wgsl"), "dog_extrema");
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dog_extrema"),
            entries: &[
                // Bindings 0-2 — DoG slices below / center / above.
                Self::texture_entry(0),
                Self::texture_entry(1),
                Self::texture_entry(2),
                // Binding 3 — dense score output buffer.
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Binding 4 — params uniform.
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
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
        let layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("dog_extrema"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("dog_extrema"),
            layout: Some(&layout),
            module: &shader,
            entry_point: "dog_extrema",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        (pipeline, bgl)
    }
}

/// A DoG stack resident on the device.
pub struct GpuDogStack {
    pub octave_level: u32,
    pub delta: f32,
    pub sigmas: Vec<f32>,
    pub slices: Vec<GpuSlice>,
}

impl GpuDogStack {
    /// Subtract adjacent slices of a device octave. `None` if the octave
    /// has fewer than 2 slices (matching the CPU constructor) or if the
    /// slices disagree on dimensions.
    pub fn from_octave(
        gpu: &GpuDevice,
        pipelines: &GpuDogPipelines,
        octave: &GpuOctave,
    ) -> Option<GpuDogStack> {
        if octave.slices.len() < 2 {
            return None;
        }
        let (w, h) = (octave.slices[0].width, octave.slices[0].height);
        if octave.slices.iter().any(|s| s.width != w || s.height != h) {
            return None;
        }

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("dog") });
        let mut slices = Vec::with_capacity(octave.slices.len() - 1);
        for pair in octave.slices.windows(2) {
            let dst = GpuSlice::new(&gpu.device, w, h, "dog slice");
            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &pipelines.subtract_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&pair[1].read_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&pair[0].read_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&dst.write_view),
                    },
                ],
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("dog_subtract"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipelines.subtract);
                pass.set_bind_group(0, &bind_group, &[]);
                let (dx, dy) = gpu.dispatch_size(w, h);
                pass.dispatch_workgroups(dx, dy, 1);
            }
            slices.push(dst);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        Some(GpuDogStack {
            octave_level: octave.level,
            delta: octave.delta,
            sigmas: octave.sigmas[..octave.sigmas.len() - 1].to_vec(),
            slices,
        })
    }

    /// Run the extrema kernel over every interior scale and collect the
    /// surviving pixels from the dense score buffers.
    pub fn find_candidates(
        &self,
        gpu: &GpuDevice,
        pipelines: &GpuDogPipelines,
        peak_threshold: f32,
    ) -> Vec<Candidate> {
        let nb = self.slices.len();
        let mut candidates = Vec::new();
        if nb < 3 {
            return candidates;
        }
        let (w, h) = (self.slices[0].width, self.slices[0].height);
        if w < 3 || h < 3 {
            return candidates;
        }

        let params = ExtremaParams {
            width: w,
            height: h,
            threshold: PREFILTER_FRACTION * peak_threshold,
            _pad: 0,
        };
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("ExtremaParams"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let score_len = (w * h) as u64 * 4;
        for s in 1..nb - 1 {
            let scores = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("extrema scores"),
                size: score_len,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &pipelines.extrema_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(
                            &self.slices[s - 1].read_view,
                        ),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&self.slices[s].read_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(
                            &self.slices[s + 1].read_view,
                        ),
                    },
                    wgpu::BindGroupEntry { binding: 3, resource: scores.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 4, resource: params_buf.as_entire_binding() },
                ],
            });

            let mut encoder = gpu.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("dog_extrema") },
            );
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("dog_extrema"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipelines.extrema);
                pass.set_bind_group(0, &bind_group, &[]);
                let (dx, dy) = gpu.dispatch_size(w, h);
                pass.dispatch_workgroups(dx, dy, 1);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()));

            let data = read_f32_buffer(gpu, &scores, (w * h) as usize);
            for j in 0..h as usize {
                for i in 0..w as usize {
                    let v = data[j * w as usize + i];
                    if v != 0.0 {
                        candidates.push(Candidate {
                            i,
                            j,
                            s,
                            octave: self.octave_level,
                            x: self.delta * i as f32,
                            y: self.delta * j as f32,
                            value: v,
                        });
                    }
                }
            }
        }
        candidates
    }

    /// Read the whole stack back for CPU refinement.
    pub fn download(&self, gpu: &GpuDevice) -> DogStack {
        DogStack {
            octave_level: self.octave_level,
            delta: self.delta,
            sigmas: self.sigmas.clone(),
            slices: self.slices.iter().map(|s| s.download(gpu)).collect(),
        }
    }
}

/// Copy a storage buffer into a mappable buffer and read it as f32.
fn read_f32_buffer(gpu: &GpuDevice, src: &wgpu::Buffer, count: usize) -> Vec<f32> {
    let size = (count * 4) as u64;
    let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("score readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("score copy") });
    encoder.copy_buffer_to_buffer(src, 0, &readback, 0, size);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let buf_slice = readback.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    buf_slice.map_async(wgpu::MapMode::Read, move |r| {
        tx.send(r).expect("score readback channel closed");
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .expect("score readback callback never fired")
        .expect("score readback map failed");

    let mapped = buf_slice.get_mapped_range();
    let out: Vec<f32> = bytemuck::cast_slice(&mapped).to_vec();
    drop(mapped);
    readback.unmap();
    out
}
