// gpu/slice.rs — device-resident scale-space slices (R32Float textures).
//
// Slices use R32Float rather than a normalized 8-bit format: the octave
// blur chain re-convolves its own output up to five times per octave, and
// quantising between passes would compound into errors far above the
// host/device agreement tolerance. Values carry the same [0, 1] range as
// the CPU `Image`.
//
// Upload and download go through staging buffers with rows padded to
// wgpu's 256-byte `COPY_BYTES_PER_ROW_ALIGNMENT`; the padding is stripped
// on the way back so callers only ever see tightly packed `Image` data.

use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;
use crate::image::Image;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
const BYTES_PER_PIXEL: u32 = 4;

/// One R32Float slice on the device, with views for both binding roles.
pub struct GpuSlice {
    pub texture: wgpu::Texture,
    /// Bound as `texture_2d<f32>` when the slice is a kernel input.
    pub read_view: wgpu::TextureView,
    /// Bound as `texture_storage_2d<r32float, write>` when it is output.
    pub write_view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuSlice {
    /// Allocate an uninitialised slice.
    pub fn new(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let read_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let write_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuSlice { texture, read_view, write_view, width, height }
    }

    /// Allocate a slice and fill it from a CPU image.
    pub fn upload(gpu: &GpuDevice, src: &Image, label: &str) -> Self {
        let slice = Self::new(&gpu.device, src.width() as u32, src.height() as u32, label);
        slice.write(gpu, src);
        slice
    }

    /// Copy a CPU image into this slice. Dimensions must match exactly.
    ///
    /// # Panics
    /// Panics if `src` has different dimensions from the slice.
    pub fn write(&self, gpu: &GpuDevice, src: &Image) {
        assert_eq!(src.width() as u32, self.width, "upload width mismatch");
        assert_eq!(src.height() as u32, self.height, "upload height mismatch");

        let aligned_bytes_per_row = align_to(self.width * BYTES_PER_PIXEL, COPY_ALIGNMENT);
        let mut staging = vec![0u8; (aligned_bytes_per_row * self.height) as usize];

        let data = src.as_slice();
        let row_bytes = self.width as usize * 4;
        for y in 0..self.height as usize {
            let row = &data[y * self.width as usize..(y + 1) * self.width as usize];
            let dst = y * aligned_bytes_per_row as usize;
            staging[dst..dst + row_bytes].copy_from_slice(bytemuck::cast_slice(row));
        }

        let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("GpuSlice::write staging"),
            contents: &staging,
            usage: wgpu::BufferUsages::COPY_SRC,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuSlice::write"),
            });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Read the slice back into a CPU image.
    ///
    /// Synchronous: stalls until the GPU timeline reaches the copy. Cheap
    /// enough once per octave (the only hot-path use), unbounded use would
    /// serialize the pipeline.
    pub fn download(&self, gpu: &GpuDevice) -> Image {
        let aligned_bytes_per_row = align_to(self.width * BYTES_PER_PIXEL, COPY_ALIGNMENT);
        let readback_size = (aligned_bytes_per_row * self.height) as u64;

        let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuSlice::download"),
            size: readback_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuSlice::download"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &readback_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let buf_slice = readback_buf.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buf_slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).expect("download channel closed");
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .expect("download callback never fired")
            .expect("download map failed");

        let mapped = buf_slice.get_mapped_range();
        let row_bytes = self.width as usize * 4;
        let mut out = vec![0.0f32; (self.width * self.height) as usize];
        for y in 0..self.height as usize {
            let src = y * aligned_bytes_per_row as usize;
            let dst = y * self.width as usize;
            out[dst..dst + self.width as usize]
                .copy_from_slice(bytemuck::cast_slice(&mapped[src..src + row_bytes]));
        }
        drop(mapped);
        readback_buf.unmap();

        Image::from_vec(self.width as usize, self.height as usize, out)
    }
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}
