// gpu/device.rs — wgpu device context for the detector kernels.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` applies power-preference heuristics
// that can land on llvmpipe/softpipe where a software Vulkan renderer is
// installed. We enumerate explicitly and prefer real hardware, taking a
// software adapter only as a last resort (and logging the choice so a
// slow run is explainable).
//
// WORKGROUP SIZES:
// naga does not support `override` expressions inside @workgroup_size(),
// so the pipelines bake the dimensions into the WGSL source via the
// {{WG_X}}/{{WG_Y}} placeholder tokens. All kernels here are 2D image
// sweeps; one (x, y) configuration serves every pipeline.

use std::fmt;

/// Workgroup dimensions for the 2D image kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup.
    pub fn total(&self) -> u32 {
        self.x * self.y
    }
}

impl Default for WorkgroupSize {
    /// 16×8 = 128 invocations: 4 NVIDIA warps or 2 AMD wavefronts, with
    /// the 16-wide x dimension matching row-major texture locality.
    fn default() -> Self {
        WorkgroupSize { x: 16, y: 8 }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging.
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

/// The GPU context: device, queue, adapter info, workgroup configuration.
///
/// Expensive to create (Vulkan instance + device init); hold one for the
/// lifetime of the application and build pipelines against it once.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue` (struct fields drop top to bottom). Some translation layers
/// crash if the instance goes first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a context on the best available Vulkan adapter.
    ///
    /// # Errors
    /// `GpuError::NoSuitableAdapter` if no Vulkan adapter exists at all;
    /// `GpuError::DeviceRequest` if the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self, GpuError> {
        // Non-conformant adapters (e.g. dzn on WSL2) are enumerated too;
        // compute-only dispatch does not rely on conformance-gated
        // rendering behaviour.
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags: wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> =
            instance.enumerate_adapters(wgpu::Backends::VULKAN);
        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for a in &all_adapters {
            let info = a.get_info();
            eprintln!(
                "[blitzen] Vulkan adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        // Prefer real hardware; fall back to anything enumerable (a
        // software renderer is slow but numerically fine for the kernels).
        let adapter = all_adapters
            .into_iter()
            .reduce(|best, a| {
                if adapter_rank(&a) > adapter_rank(&best) {
                    a
                } else {
                    best
                }
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        eprintln!("[blitzen] selected adapter: {}", raw_info.name);
        let adapter_info = AdapterInfo {
            name: raw_info.name,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("blitzen"),
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

    /// Override the workgroup size. Must happen before any pipeline is
    /// built — the dimensions are baked into the compiled shaders.
    ///
    /// # Errors
    /// `GpuError::WorkgroupTooLarge` if x·y exceeds the device's
    /// invocation limit.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = self.device.limits().max_compute_invocations_per_workgroup;
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Workgroup counts covering a `w`×`h` sweep: ceiling division so the
    /// trailing partial workgroups exist. Shaders guard the overhang with
    /// `if gid.x >= width || gid.y >= height { return; }`.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        let dx = (w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
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

/// Selection tier: higher is better. Discrete > integrated > virtual/other
/// translation layers > software.
fn adapter_rank(a: &wgpu::Adapter) -> u32 {
    match a.get_info().device_type {
        wgpu::DeviceType::DiscreteGpu => 4,
        wgpu::DeviceType::IntegratedGpu => 3,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 2,
        wgpu::DeviceType::Cpu => 1,
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU initialization and slice plumbing.
#[derive(Debug)]
pub enum GpuError {
    /// No Vulkan adapter enumerable at all.
    NoSuitableAdapter,
    /// Device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Requested workgroup size exceeds the device invocation limit.
    WorkgroupTooLarge { total: u32, max: u32 },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => write!(
                f,
                "no Vulkan adapter found (check that `vulkaninfo` lists a device)"
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            GpuError::WorkgroupTooLarge { total, max } => write!(
                f,
                "workgroup size {total} exceeds device limit of {max} invocations"
            ),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================
// Tests
// ============================================================
