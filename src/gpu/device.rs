// gpu/device.rs — Device controller: adapter selection, capabilities, and
// ownership of every buffer, program and kernel created on the device.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power-preference heuristics that can
// pick a software renderer (llvmpipe) over a real GPU. We enumerate
// explicitly and take the first adapter in two tiers:
//   1. GPU class:  DiscreteGpu, IntegratedGpu, VirtualGpu, Other (dzn on WSL2)
//   2. CPU class:  Cpu (llvmpipe, WARP, SwiftShader)
// Nothing in either tier is `Error::DeviceUnavailable`.
//
// OWNERSHIP:
// The controller is the only factory for `MemoryBuffer` and `Program`
// handles and the only owner of the wgpu objects behind them (see
// `registry.rs`). Handles keep a `Weak` reference; once the controller is
// dropped every handle call returns `Error::Released`.
//
// ERROR CAPTURE:
// wgpu reports validation failures asynchronously through the device error
// sink, whose default handler panics. Every backend call made by this crate
// runs inside `Shared::scoped`, which pushes an error scope, runs the call,
// and pops the scope. The captured error is then mapped to an `Error`
// variant by the caller.
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch against the requested limits, so
// violations that would fail on the target board are caught on the
// development machine.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::gpu::buffer::{AccessMode, MemoryBuffer};
use crate::gpu::error::{Error, Result};
use crate::gpu::program::Program;
use crate::gpu::registry::{BufferSlot, LiveObjects, Registry};

/// Hardware profile controlling the limits requested from the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits.
    #[default]
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    /// Caps `max_compute_invocations_per_workgroup` to 256.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Options for [`DeviceController::acquire_with`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Backends to enumerate adapters on.
    pub backends: wgpu::Backends,
    pub profile: DeviceProfile,
    /// Enable backend validation layers. Defaults to on in debug builds.
    pub validation: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            backends: wgpu::Backends::PRIMARY,
            profile: DeviceProfile::Native,
            validation: cfg!(debug_assertions),
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by the environment:
    ///
    /// - `WGPU_BACKEND` — comma-separated backend list (`vulkan,metal,dx12,gl`)
    /// - `OFFLOAD_PROFILE` — `native` or `rpi`
    pub fn from_env() -> Self {
        let mut config = DeviceConfig::default();
        if let Some(backends) = wgpu::util::backend_bits_from_env() {
            config.backends = backends;
        }
        if let Ok(profile) = std::env::var("OFFLOAD_PROFILE") {
            match parse_profile(&profile) {
                Some(p) => config.profile = p,
                None => warn!("ignoring unknown OFFLOAD_PROFILE={profile:?}"),
            }
        }
        config
    }
}

fn parse_profile(s: &str) -> Option<DeviceProfile> {
    match s.trim().to_ascii_lowercase().as_str() {
        "native" => Some(DeviceProfile::Native),
        "rpi" | "raspberrypi" | "raspberry-pi" => Some(DeviceProfile::RaspberryPi),
        _ => None,
    }
}

/// Coarse device class used for adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Gpu,
    Cpu,
}

impl DeviceClass {
    pub fn of(device_type: wgpu::DeviceType) -> Self {
        match device_type {
            wgpu::DeviceType::Cpu => DeviceClass::Cpu,
            wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu
            | wgpu::DeviceType::Other => DeviceClass::Gpu,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Gpu => write!(f, "GPU"),
            DeviceClass::Cpu => write!(f, "CPU"),
        }
    }
}

/// Index of the adapter to open: the first GPU-class one, else the first
/// CPU-class one.
pub fn select_adapter(device_types: &[wgpu::DeviceType]) -> Option<usize> {
    let first = |class| {
        device_types
            .iter()
            .position(|&t| DeviceClass::of(t) == class)
    };
    first(DeviceClass::Gpu).or_else(|| first(DeviceClass::Cpu))
}

/// Properties of the opened device, read once at acquisition.
///
/// wgpu exposes no compute-unit count, so `compute_units` is `None` on every
/// backend. Memory sizes are the per-binding limits the device enforces, not
/// physical memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub name: String,
    pub vendor: String,
    pub vendor_id: u32,
    pub device_class: DeviceClass,
    pub backend: wgpu::Backend,
    pub compute_units: Option<u32>,
    /// Largest single buffer (`max_buffer_size`).
    pub global_mem_size: u64,
    /// Workgroup shared memory (`max_compute_workgroup_storage_size`).
    pub local_mem_size: u64,
    /// Largest uniform binding (`max_uniform_buffer_binding_size`).
    pub constant_mem_size: u64,
    /// Largest storage binding (`max_storage_buffer_binding_size`).
    pub max_storage_binding_size: u64,
    /// Invocations per work-group.
    pub max_work_group_size: usize,
    /// Per-dimension work-group extent.
    pub max_work_item_sizes: [usize; 3],
    /// Work-groups per dispatch dimension.
    pub max_work_groups_per_dimension: usize,
    /// Highest usable kernel argument index + 1.
    pub max_argument_slots: u32,
}

impl DeviceCapabilities {
    /// Derive capabilities from an adapter description and the limits the
    /// device was opened with.
    ///
    /// # Errors
    /// `Error::Query` when a limit is zero or does not fit the host's
    /// `usize`.
    pub fn from_parts(info: &wgpu::AdapterInfo, limits: &wgpu::Limits) -> Result<Self> {
        let max_work_group_size = to_usize(
            limits.max_compute_invocations_per_workgroup,
            "max_compute_invocations_per_workgroup",
        )?;
        let max_work_item_sizes = [
            to_usize(limits.max_compute_workgroup_size_x, "max_compute_workgroup_size_x")?,
            to_usize(limits.max_compute_workgroup_size_y, "max_compute_workgroup_size_y")?,
            to_usize(limits.max_compute_workgroup_size_z, "max_compute_workgroup_size_z")?,
        ];
        let max_work_groups_per_dimension = to_usize(
            limits.max_compute_workgroups_per_dimension,
            "max_compute_workgroups_per_dimension",
        )?;
        if limits.max_buffer_size == 0 {
            return Err(Error::Query("device reports max_buffer_size = 0".into()));
        }
        usize::try_from(limits.max_buffer_size)
            .map_err(|e| Error::Query(format!("max_buffer_size does not fit usize: {e}")))?;

        Ok(DeviceCapabilities {
            name: info.name.clone(),
            vendor: vendor_name(info.vendor).to_owned(),
            vendor_id: info.vendor,
            device_class: DeviceClass::of(info.device_type),
            backend: info.backend,
            compute_units: None,
            global_mem_size: limits.max_buffer_size,
            local_mem_size: u64::from(limits.max_compute_workgroup_storage_size),
            constant_mem_size: u64::from(limits.max_uniform_buffer_binding_size),
            max_storage_binding_size: u64::from(limits.max_storage_buffer_binding_size),
            max_work_group_size,
            max_work_item_sizes,
            max_work_groups_per_dimension,
            max_argument_slots: limits.max_bindings_per_bind_group,
        })
    }
}

fn to_usize(value: u32, what: &str) -> Result<usize> {
    let v = usize::try_from(value)
        .map_err(|e| Error::Query(format!("{what} does not fit usize: {e}")))?;
    if v == 0 {
        return Err(Error::Query(format!("device reports {what} = 0")));
    }
    Ok(v)
}

/// PCI vendor id → name. Backends without PCI ids report 0.
fn vendor_name(id: u32) -> &'static str {
    match id {
        0x1002 | 0x1022 => "AMD",
        0x10de => "NVIDIA",
        0x8086 => "Intel",
        0x13b5 => "ARM",
        0x5143 => "Qualcomm",
        0x1010 => "Imagination Technologies",
        0x106b => "Apple",
        0x14e4 => "Broadcom",
        0x1414 => "Microsoft",
        0x10005 => "Mesa",
        _ => "unknown",
    }
}

impl fmt::Display for DeviceCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device name:                  {}", self.name)?;
        writeln!(f, "Vendor:                       {} ({:#06x})", self.vendor, self.vendor_id)?;
        writeln!(f, "Device type:                  {} ({:?})", self.device_class, self.backend)?;
        match self.compute_units {
            Some(n) => writeln!(f, "Compute units:                {n}")?,
            None => writeln!(f, "Compute units:                n/a")?,
        }
        writeln!(f, "Global memory (max buffer):   {} KB", self.global_mem_size / 1024)?;
        writeln!(f, "Local memory:                 {} KB", self.local_mem_size / 1024)?;
        writeln!(f, "Constant memory:              {} KB", self.constant_mem_size / 1024)?;
        writeln!(f, "Max work group size:          {}", self.max_work_group_size)?;
        let [x, y, z] = self.max_work_item_sizes;
        write!(f, "Max work item sizes:          ({x}, {y}, {z})")
    }
}

/// State shared between the controller and the handles it issues.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. The registry goes first
/// (kernels, programs, buffers), then queue and device, and `_instance`
/// last so the backend instance outlives every device-level object. dzn
/// (D3D12-to-Vulkan on WSL2) crashes if the instance is destroyed first.
pub(crate) struct Shared {
    registry: Mutex<Registry>,
    pub(crate) queue: wgpu::Queue,
    pub(crate) device: wgpu::Device,
    pub(crate) capabilities: DeviceCapabilities,
    _instance: wgpu::Instance,
}

impl Shared {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with validation and out-of-memory error scopes pushed, and
    /// return its value together with the first error captured.
    pub(crate) fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device, &wgpu::Queue) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device, &self.queue);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(oom))
    }

    /// Block until all submitted work has completed.
    pub(crate) fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

/// Owner of an opened compute device and everything created on it.
///
/// Create one with [`DeviceController::acquire`] and keep it for the
/// lifetime of the application. Dropping it releases kernels, programs and
/// buffers (in that order) before the device itself.
pub struct DeviceController {
    shared: Arc<Shared>,
    profile: DeviceProfile,
}

impl DeviceController {
    /// Open the best available device with default configuration.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no GPU-class or CPU-class adapter exists or the
    /// device request fails; `Query` if its limits are unusable.
    pub fn acquire() -> Result<Self> {
        Self::acquire_with(DeviceConfig::default())
    }

    pub fn acquire_with(config: DeviceConfig) -> Result<Self> {
        pollster::block_on(Self::init_async(config))
    }

    async fn init_async(config: DeviceConfig) -> Result<Self> {
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets wgpu enumerate dzn on
        // WSL2, which declares itself non-conformant.
        let mut flags = wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER;
        if config.validation {
            flags |= wgpu::InstanceFlags::VALIDATION;
        }
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            flags,
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(config.backends);
        for a in &adapters {
            let info = a.get_info();
            debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        let types: Vec<wgpu::DeviceType> =
            adapters.iter().map(|a| a.get_info().device_type).collect();
        let index = select_adapter(&types).ok_or_else(|| {
            Error::DeviceUnavailable(format!(
                "no GPU-class or CPU-class adapter among {} enumerated on {:?}",
                adapters.len(),
                config.backends
            ))
        })?;
        let adapter = adapters.swap_remove(index);
        let info = adapter.get_info();
        if DeviceClass::of(info.device_type) == DeviceClass::Cpu {
            warn!("no GPU adapter found, falling back to CPU device {}", info.name);
        }

        // Auto-detect RPi when the caller asked for Native on a V3D adapter.
        let profile = match config.profile {
            DeviceProfile::Native if info.name.to_ascii_lowercase().contains("v3d") => {
                info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };
        let limits = limits_for_profile(profile, adapter.limits());

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("offload-v"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("device request failed: {e}")))?;

        let capabilities = DeviceCapabilities::from_parts(&info, &limits)?;
        info!(
            "using {} device {} ({:?}, profile {})",
            capabilities.device_class, capabilities.name, capabilities.backend, profile
        );

        Ok(DeviceController {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                queue,
                device,
                capabilities,
                _instance: instance,
            }),
            profile,
        })
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.capabilities
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Create and allocate a buffer of `size` bytes.
    ///
    /// `data` is required for [`AccessMode::HostShared`] (at least `size`
    /// bytes, copied into the allocation) and rejected for every other mode.
    ///
    /// # Errors
    /// `Allocation` on a zero size, a size above the device limit, a
    /// missing or misplaced `data`, or a backend failure.
    pub fn create_memory_buffer(
        &self,
        mode: AccessMode,
        size: usize,
        data: Option<&[u8]>,
    ) -> Result<MemoryBuffer> {
        let mut buffer = self.create_empty_buffer();
        if let Err(e) = buffer.allocate(mode, size, data) {
            self.shared.registry().buffers.remove(&buffer.id());
            return Err(e);
        }
        Ok(buffer)
    }

    /// Create a buffer handle with no allocation. Call
    /// [`MemoryBuffer::allocate`] before using it.
    pub fn create_empty_buffer(&self) -> MemoryBuffer {
        let id = self.shared.registry().insert_buffer(BufferSlot::default());
        MemoryBuffer::new(Arc::downgrade(&self.shared), id)
    }

    /// Create an empty program. Compile it with
    /// [`Program::compile_from_source`].
    pub fn create_program(&self) -> Program {
        let id = self.shared.registry().insert_program();
        Program::new(Arc::downgrade(&self.shared), id)
    }

    /// Release a buffer before controller teardown.
    pub fn release_buffer(&self, buffer: MemoryBuffer) -> Result<()> {
        buffer.check_owner(&self.shared)?;
        self.shared
            .registry()
            .buffers
            .remove(&buffer.id())
            .map(drop)
            .ok_or(Error::Released("memory buffer"))
    }

    /// Release a program and all kernels created from it.
    pub fn release_program(&self, program: Program) -> Result<()> {
        program.check_owner(&self.shared)?;
        let mut slot = self
            .shared
            .registry()
            .programs
            .remove(&program.id())
            .ok_or(Error::Released("program"))?;
        slot.release();
        Ok(())
    }

    /// Counts of buffers, programs and kernels currently owned.
    pub fn live_objects(&self) -> LiveObjects {
        self.shared.registry().live_objects()
    }
}

impl fmt::Display for DeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let caps = self.capabilities();
        write!(
            f,
            "DeviceController {{ adapter: {} ({}, {:?}), profile: {} }}",
            caps.name, caps.device_class, caps.backend, self.profile
        )
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        let live = self.live_objects();
        info!(
            "releasing device {}: {} kernel(s), {} program(s), {} buffer(s)",
            self.shared.capabilities.name, live.kernels, live.programs, live.buffers
        );
        // Objects go now even if a `Weak` upgrade is in flight on another
        // thread; that call then sees empty tables and returns `Released`.
        self.shared.registry().release_all();
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Build the limits to request for `profile` on an adapter supporting
/// `supported`.
fn limits_for_profile(profile: DeviceProfile, supported: wgpu::Limits) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => supported,

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            // 128 MiB per binding; RPi 4 shares 4 GiB with the CPU.
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 128 << 20,
            ..wgpu::Limits::default()
        }
        .using_resolution(supported.clone())
        .using_alignment(supported),
    }
}

// ============================================================
// Tests
// ============================================================
