// gpu/kernel.rs — Argument binding and dispatch.
//
// Argument index N is `@group(0) @binding(N)` in the shader. Buffers bind
// as storage, byte arguments are uploaded to a fresh uniform buffer at each
// dispatch (padded to 16 bytes) and bind as `var<uniform>`. The setters
// check index, kind and uniform size against the signature reflected by
// `Program::create_kernel`.
//
// A dispatch goes through four stages, each mapped to one error class:
//
//   shape check      host-side, against DeviceCapabilities
//                    → InvalidWorkDimension / InvalidWorkGroupSize /
//                      InvalidWorkItemSize
//   resolve args     unset slot, released or unallocated buffer
//                    → InvalidArguments
//   bind group       wgpu layout validation → InvalidArguments
//   pipeline/submit  anything else → Generic
//
// Pipelines are cached per work-group shape on the kernel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use tracing::trace;
use wgpu::util::DeviceExt;

use crate::gpu::buffer::{align_to, MemoryBuffer};
use crate::gpu::device::{DeviceCapabilities, Shared};
use crate::gpu::error::{Error, ExecutionError, Result};
use crate::gpu::ndrange::{auto_local, validate_local, NdRange};
use crate::gpu::program::{create_pipeline, diagnostic, module_for};
use crate::gpu::registry::{ArgumentKind, BufferSlot, KernelArg, ObjectId, Registry, WorkgroupKey};

/// Uniform bindings are padded to this many bytes.
const UNIFORM_ALIGNMENT: usize = 16;

/// Handle to a compute entry point of a [`Program`](crate::gpu::Program).
#[derive(Debug)]
pub struct Kernel {
    shared: Weak<Shared>,
    program: ObjectId,
    id: ObjectId,
    name: String,
}

impl Kernel {
    pub(crate) fn new(shared: Weak<Shared>, program: ObjectId, id: ObjectId, name: &str) -> Self {
        Kernel { shared, program, id, name: name.to_owned() }
    }

    /// Entry point name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn upgrade(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(Error::Released("kernel"))
    }

    /// Bind `value` by copy as argument `index`.
    ///
    /// # Errors
    /// `Argument` if `value` is empty or larger than the device's uniform
    /// binding limit, if the kernel declares no uniform at `index`, or if
    /// `value` is not exactly the declared uniform size.
    pub fn set_argument(&mut self, index: u32, value: &[u8]) -> Result<()> {
        let shared = self.upgrade()?;
        let caps = &shared.capabilities;
        check_index(index, caps)?;
        if value.is_empty() {
            return Err(Error::Argument { index, reason: "argument value is empty".into() });
        }
        if value.len() as u64 > caps.constant_mem_size {
            return Err(Error::Argument {
                index,
                reason: format!(
                    "{} bytes exceeds the uniform binding limit of {} bytes",
                    value.len(),
                    caps.constant_mem_size
                ),
            });
        }
        let mut registry = shared.registry();
        let kernel = registry.kernel_mut(self.program, self.id)?;
        expect_uniform(&kernel.params, &self.name, index, value.len())?;
        kernel.bind(index, KernelArg::Bytes(value.to_vec()));
        Ok(())
    }

    /// Bind a plain-old-data scalar or struct as argument `index`.
    pub fn set_scalar<T: Pod>(&mut self, index: u32, value: &T) -> Result<()> {
        self.set_argument(index, bytemuck::bytes_of(value))
    }

    /// Bind `buffer` as argument `index`.
    ///
    /// The binding refers to the buffer, not its current allocation: a
    /// later [`MemoryBuffer::allocate`] is picked up by the next dispatch.
    ///
    /// # Errors
    /// `Argument` if the kernel declares no storage buffer at `index`, or the
    /// buffer belongs to another controller, was released, holds no
    /// allocation, or exceeds the device's storage binding limit.
    pub fn set_buffer_argument(&mut self, index: u32, buffer: &MemoryBuffer) -> Result<()> {
        let shared = self.upgrade()?;
        let caps = &shared.capabilities;
        check_index(index, caps)?;
        if !Weak::ptr_eq(buffer.owner(), &self.shared) {
            return Err(Error::Argument {
                index,
                reason: "memory buffer belongs to a different device controller".into(),
            });
        }
        let mut registry = shared.registry();
        expect_storage(&registry.kernel_mut(self.program, self.id)?.params, &self.name, index)?;
        let size = match registry.buffer(buffer.id()) {
            Err(_) => {
                return Err(Error::Argument { index, reason: "memory buffer has been released".into() })
            }
            Ok(BufferSlot { alloc: None }) => {
                return Err(Error::Argument { index, reason: "memory buffer is not allocated".into() })
            }
            Ok(BufferSlot { alloc: Some(alloc) }) => alloc.size,
        };
        check_binding_size(index, size, caps)?;
        registry
            .kernel_mut(self.program, self.id)?
            .bind(index, KernelArg::Buffer(buffer.id()));
        Ok(())
    }

    /// Dispatch over `global` with a work-group shape chosen from the device
    /// limits (see [`auto_local`]). Blocks until the kernel has finished.
    pub fn execute(&self, global: NdRange) -> Result<()> {
        let shared = self.upgrade()?;
        let caps = &shared.capabilities;
        let local = auto_local(&global, caps.max_work_item_sizes, caps.max_work_group_size);
        self.dispatch(&shared, &global, &local)
    }

    /// Dispatch over `global` in work-groups of `local`. Blocks until the
    /// kernel has finished.
    ///
    /// # Errors
    /// `DimensionMismatch` / `IndivisibleRange` before any backend call,
    /// otherwise a classified [`ExecutionError`].
    pub fn execute_with_local(&self, global: NdRange, local: NdRange) -> Result<()> {
        validate_local(&global, &local)?;
        let shared = self.upgrade()?;
        self.dispatch(&shared, &global, &local)
    }

    fn dispatch(&self, shared: &Shared, global: &NdRange, local: &NdRange) -> Result<()> {
        let groups = check_shape(&shared.capabilities, global, local)?;
        let shape = workgroup_key(local);

        let mut guard = shared.registry();
        let registry: &mut Registry = &mut guard;
        let program = registry
            .programs
            .get_mut(&self.program)
            .ok_or(Error::Released("program"))?;
        let kernel = program.kernels.get_mut(&self.id).ok_or(Error::Released("kernel"))?;
        let source = program.source.as_deref().ok_or(Error::NotCompiled)?;

        if !kernel.pipelines.contains_key(&shape) {
            let module = module_for(shared, source, &mut program.modules, shape)
                .map_err(ExecutionError::Generic)?;
            let pipeline = create_pipeline(shared, module, &kernel.entry_point)
                .map_err(ExecutionError::Generic)?;
            kernel.pipelines.insert(shape, pipeline);
        }
        let pipeline = kernel
            .pipelines
            .get(&shape)
            .ok_or_else(|| ExecutionError::Generic(format!("no pipeline for {shape:?}")))?;

        let bindings = resolve_bindings(shared, &kernel.params, &kernel.args, &registry.buffers)?;

        let (bind_group, err) = shared.scoped(|device, _| {
            if bindings.is_empty() {
                return None;
            }
            let entries: Vec<wgpu::BindGroupEntry> = bindings
                .iter()
                .map(|(index, b)| wgpu::BindGroupEntry {
                    binding: *index,
                    resource: b.buffer().as_entire_binding(),
                })
                .collect();
            Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&self.name),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            }))
        });
        if let Some(e) = err {
            return Err(ExecutionError::InvalidArguments(diagnostic(&e)).into());
        }

        trace!(
            "dispatch `{}`: global {global}, local {local}, groups {groups:?}",
            self.name
        );
        let ((), err) = shared.scoped(|device, queue| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&self.name),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&self.name),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                if let Some(bg) = &bind_group {
                    pass.set_bind_group(0, bg, &[]);
                }
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            queue.submit(std::iter::once(encoder.finish()));
        });
        shared.wait_idle();
        match err {
            Some(e) => Err(ExecutionError::Generic(diagnostic(&e)).into()),
            None => Ok(()),
        }
    }
}

/// A resolved argument ready to be placed in a bind group.
enum Binding<'a> {
    Storage(&'a wgpu::Buffer),
    Uniform(wgpu::Buffer),
}

impl Binding<'_> {
    fn buffer(&self) -> &wgpu::Buffer {
        match self {
            Binding::Storage(b) => b,
            Binding::Uniform(b) => b,
        }
    }
}

/// One binding per declared argument, in binding order.
fn resolve_bindings<'a>(
    shared: &Shared,
    params: &BTreeMap<u32, ArgumentKind>,
    args: &BTreeMap<u32, KernelArg>,
    buffers: &'a HashMap<ObjectId, BufferSlot>,
) -> Result<Vec<(u32, Binding<'a>)>> {
    let mut bindings = Vec::with_capacity(params.len());
    for (&index, kind) in params {
        let binding = match (kind, args.get(&index)) {
            (_, None) => {
                return Err(ExecutionError::InvalidArguments(format!(
                    "argument {index} is not set"
                ))
                .into())
            }
            (ArgumentKind::Storage, Some(KernelArg::Buffer(id))) => {
                let alloc = buffers.get(id).and_then(|slot| slot.alloc.as_ref()).ok_or_else(|| {
                    ExecutionError::InvalidArguments(format!(
                        "argument {index}: memory buffer was released or is not allocated"
                    ))
                })?;
                Binding::Storage(&alloc.buffer)
            }
            (ArgumentKind::Uniform { .. }, Some(KernelArg::Bytes(bytes))) => {
                let contents = pad_uniform(bytes);
                let (buffer, err) = shared.scoped(|device, _| {
                    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("kernel argument"),
                        contents: &contents,
                        usage: wgpu::BufferUsages::UNIFORM,
                    })
                });
                if let Some(e) = err {
                    return Err(ExecutionError::InvalidArguments(format!(
                        "argument {index}: {}",
                        diagnostic(&e)
                    ))
                    .into());
                }
                Binding::Uniform(buffer)
            }
            (_, Some(_)) => {
                return Err(ExecutionError::InvalidArguments(format!(
                    "argument {index} does not match the declared binding"
                ))
                .into())
            }
        };
        bindings.push((index, binding));
    }
    Ok(bindings)
}

/// `index` must be a declared uniform of exactly `len` bytes.
fn expect_uniform(
    params: &BTreeMap<u32, ArgumentKind>,
    kernel: &str,
    index: u32,
    len: usize,
) -> Result<()> {
    let reason = match params.get(&index) {
        Some(ArgumentKind::Uniform { size }) if len == *size as usize => return Ok(()),
        Some(ArgumentKind::Uniform { size }) => {
            format!("{len} bytes given for a {size}-byte uniform of `{kernel}`")
        }
        Some(ArgumentKind::Storage) => {
            format!("binding of `{kernel}` is a storage buffer, use set_buffer_argument")
        }
        Some(ArgumentKind::Opaque) => format!("binding of `{kernel}` is not a buffer"),
        None => format!("kernel `{kernel}` declares no argument at this index"),
    };
    Err(Error::Argument { index, reason })
}

/// `index` must be a declared storage buffer.
fn expect_storage(params: &BTreeMap<u32, ArgumentKind>, kernel: &str, index: u32) -> Result<()> {
    let reason = match params.get(&index) {
        Some(ArgumentKind::Storage) => return Ok(()),
        Some(ArgumentKind::Uniform { size }) => {
            format!("binding of `{kernel}` is a {size}-byte uniform, use set_argument")
        }
        Some(ArgumentKind::Opaque) => format!("binding of `{kernel}` is not a buffer"),
        None => format!("kernel `{kernel}` declares no argument at this index"),
    };
    Err(Error::Argument { index, reason })
}

/// A buffer binds whole, so its padded size must fit one storage binding.
fn check_binding_size(index: u32, size: usize, caps: &DeviceCapabilities) -> Result<()> {
    let bound = align_to(size, wgpu::COPY_BUFFER_ALIGNMENT as usize) as u64;
    if bound > caps.max_storage_binding_size {
        return Err(Error::Argument {
            index,
            reason: format!(
                "{size} byte buffer exceeds the storage binding limit of {} bytes",
                caps.max_storage_binding_size
            ),
        });
    }
    Ok(())
}

fn check_index(index: u32, caps: &DeviceCapabilities) -> Result<()> {
    if index >= caps.max_argument_slots {
        return Err(Error::Argument {
            index,
            reason: format!("index exceeds the device limit of {} bindings", caps.max_argument_slots),
        });
    }
    Ok(())
}

/// Validate a dispatch shape against device limits and return the
/// work-group count per dimension.
fn check_shape(caps: &DeviceCapabilities, global: &NdRange, local: &NdRange) -> Result<[u32; 3]> {
    if global.sizes().contains(&0) {
        return Err(ExecutionError::InvalidWorkDimension(format!(
            "global range {global} has a zero dimension"
        ))
        .into());
    }
    if local.total() > caps.max_work_group_size {
        return Err(ExecutionError::InvalidWorkGroupSize(format!(
            "local range {local} has {} work items, device maximum is {}",
            local.total(),
            caps.max_work_group_size
        ))
        .into());
    }
    let mut groups = [1u32; 3];
    for d in 0..3 {
        let l = local.extent()[d];
        if l > caps.max_work_item_sizes[d] {
            return Err(ExecutionError::InvalidWorkItemSize(format!(
                "local size {l} in dimension {d} exceeds device maximum {}",
                caps.max_work_item_sizes[d]
            ))
            .into());
        }
        let count = global.extent()[d] / l;
        if count > caps.max_work_groups_per_dimension {
            return Err(ExecutionError::InvalidWorkGroupSize(format!(
                "{count} work-groups in dimension {d} exceeds device maximum {}",
                caps.max_work_groups_per_dimension
            ))
            .into());
        }
        groups[d] = u32::try_from(count)
            .map_err(|_| ExecutionError::InvalidWorkGroupSize(format!("{count} work-groups")))?;
    }
    Ok(groups)
}

/// Local extent as a module/pipeline cache key. Sizes are within the
/// device's u32 limits once `check_shape` has passed.
fn workgroup_key(local: &NdRange) -> WorkgroupKey {
    let [x, y, z] = local.extent();
    [x as u32, y as u32, z as u32]
}

fn pad_uniform(bytes: &[u8]) -> Vec<u8> {
    let mut padded = bytes.to_vec();
    padded.resize(bytes.len().div_ceil(UNIFORM_ALIGNMENT) * UNIFORM_ALIGNMENT, 0);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::buffer::AccessMode;
    use crate::gpu::device::DeviceController;

    fn caps() -> DeviceCapabilities {
        let info = wgpu::AdapterInfo {
            name: "test".into(),
            vendor: 0,
            device: 0,
            device_type: wgpu::DeviceType::DiscreteGpu,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        };
        DeviceCapabilities::from_parts(&info, &wgpu::Limits::default()).unwrap()
    }

    fn classify(global: NdRange, local: NdRange) -> Option<ExecutionError> {
        match check_shape(&caps(), &global, &local) {
            Ok(_) => None,
            Err(Error::Execution(e)) => Some(e),
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_shape_ok_group_counts() {
        let groups = check_shape(&caps(), &NdRange::d2(640, 480), &NdRange::d2(16, 8)).unwrap();
        assert_eq!(groups, [40, 60, 1]);
    }

    #[test]
    fn test_zero_global_is_work_dimension() {
        assert!(matches!(
            classify(NdRange::d2(0, 8), NdRange::d2(1, 8)),
            Some(ExecutionError::InvalidWorkDimension(_))
        ));
    }

    #[test]
    fn test_too_many_invocations_is_work_group_size() {
        // 32×32 = 1024 > 256, each dimension within 256.
        assert!(matches!(
            classify(NdRange::d2(64, 64), NdRange::d2(32, 32)),
            Some(ExecutionError::InvalidWorkGroupSize(_))
        ));
    }

    #[test]
    fn test_dimension_over_limit_is_work_item_size() {
        // z limit is 64; 1×1×128 = 128 invocations.
        assert!(matches!(
            classify(NdRange::d3(1, 1, 128), NdRange::d3(1, 1, 128)),
            Some(ExecutionError::InvalidWorkItemSize(_))
        ));
    }

    #[test]
    fn test_too_many_groups_is_work_group_size() {
        assert!(matches!(
            classify(NdRange::d1(70_000), NdRange::d1(1)),
            Some(ExecutionError::InvalidWorkGroupSize(_))
        ));
    }

    fn nms_params() -> BTreeMap<u32, ArgumentKind> {
        [
            (0, ArgumentKind::Storage),
            (1, ArgumentKind::Storage),
            (2, ArgumentKind::Uniform { size: 4 }),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_uniform_must_be_declared_with_exact_size() {
        let params = nms_params();
        assert!(expect_uniform(&params, "nms", 2, 4).is_ok());
        // u64 into a u32 uniform.
        assert!(matches!(expect_uniform(&params, "nms", 2, 8), Err(Error::Argument { index: 2, .. })));
        assert!(matches!(expect_uniform(&params, "nms", 2, 2), Err(Error::Argument { index: 2, .. })));
        assert!(matches!(expect_uniform(&params, "nms", 7, 4), Err(Error::Argument { index: 7, .. })));
        assert!(matches!(expect_uniform(&params, "nms", 0, 4), Err(Error::Argument { index: 0, .. })));
    }

    #[test]
    fn test_buffer_must_target_declared_storage() {
        let params = nms_params();
        assert!(expect_storage(&params, "nms", 1).is_ok());
        assert!(matches!(expect_storage(&params, "nms", 2), Err(Error::Argument { index: 2, .. })));
        assert!(matches!(expect_storage(&params, "nms", 3), Err(Error::Argument { index: 3, .. })));
    }

    #[test]
    fn test_binding_size_limit() {
        let caps = caps();
        let limit = caps.max_storage_binding_size as usize;
        assert!(check_binding_size(0, limit, &caps).is_ok());
        assert!(matches!(check_binding_size(4, limit + 1, &caps), Err(Error::Argument { index: 4, .. })));
    }

    #[test]
    fn test_pad_uniform() {
        assert_eq!(pad_uniform(&[1, 2, 3, 4]).len(), 16);
        assert_eq!(pad_uniform(&[0; 16]).len(), 16);
        assert_eq!(pad_uniform(&[0; 17]).len(), 32);
        assert_eq!(&pad_uniform(&[9, 8])[..2], &[9, 8]);
    }

    // ---- GPU tests ------------------------------------------------------------

    const SCALE: &str = "
        @group(0) @binding(0) var<storage, read_write> data: array<u32>;
        @group(0) @binding(1) var<uniform> factor: u32;

        @compute @workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}})
        fn scale(@builtin(global_invocation_id) gid: vec3<u32>) {
            data[gid.x] = data[gid.x] * factor;
        }
    ";

    fn setup(ctrl: &DeviceController, n: usize) -> (crate::gpu::Program, Kernel, MemoryBuffer) {
        let mut p = ctrl.create_program();
        p.compile_from_source(SCALE).unwrap();
        let k = p.create_kernel("scale").unwrap();
        let words: Vec<u32> = (0..n as u32).collect();
        let buf = ctrl
            .create_memory_buffer(AccessMode::HostShared, n * 4, Some(bytemuck::cast_slice(&words)))
            .unwrap();
        (p, k, buf)
    }

    fn read_words(buf: &MemoryBuffer) -> Vec<u32> {
        let bytes = buf.read_to_vec().unwrap();
        bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_execute_auto_local() {
        let ctrl = DeviceController::acquire().unwrap();
        let (_p, mut k, buf) = setup(&ctrl, 1000);
        k.set_buffer_argument(0, &buf).unwrap();
        k.set_scalar(1, &3u32).unwrap();
        k.execute(NdRange::d1(1000)).unwrap();
        let out = read_words(&buf);
        assert!(out.iter().enumerate().all(|(i, &v)| v == 3 * i as u32));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_execute_explicit_local_and_rebinding() {
        let ctrl = DeviceController::acquire().unwrap();
        let (_p, mut k, buf) = setup(&ctrl, 64);
        k.set_buffer_argument(0, &buf).unwrap();
        k.set_scalar(1, &2u32).unwrap();
        k.execute_with_local(NdRange::d1(64), NdRange::d1(16)).unwrap();
        // Rebinding replaces the previous value at the same index.
        k.set_scalar(1, &5u32).unwrap();
        k.execute_with_local(NdRange::d1(64), NdRange::d1(32)).unwrap();
        let out = read_words(&buf);
        assert_eq!(out[7], 70);
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_unset_argument_is_invalid_arguments() {
        let ctrl = DeviceController::acquire().unwrap();
        let (_p, mut k, _buf) = setup(&ctrl, 16);
        k.set_scalar(1, &2u32).unwrap();
        let err = k.execute(NdRange::d1(16)).unwrap_err();
        assert!(matches!(err, Error::Execution(ExecutionError::InvalidArguments(_))));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_missing_binding_is_invalid_arguments() {
        let ctrl = DeviceController::acquire().unwrap();
        let (_p, mut k, buf) = setup(&ctrl, 16);
        k.set_buffer_argument(0, &buf).unwrap();
        let err = k.execute(NdRange::d1(16)).unwrap_err();
        assert!(matches!(err, Error::Execution(ExecutionError::InvalidArguments(_))));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_argument_validation() {
        let ctrl = DeviceController::acquire().unwrap();
        let (_p, mut k, _buf) = setup(&ctrl, 16);
        assert!(matches!(k.set_argument(0, &[]), Err(Error::Argument { index: 0, .. })));
        let slots = ctrl.capabilities().max_argument_slots;
        assert!(matches!(k.set_argument(slots, &[1]), Err(Error::Argument { .. })));

        let empty = ctrl.create_empty_buffer();
        assert!(matches!(k.set_buffer_argument(0, &empty), Err(Error::Argument { .. })));

        let other = DeviceController::acquire().unwrap();
        let foreign = other.create_memory_buffer(AccessMode::ReadWrite, 4, None).unwrap();
        assert!(matches!(k.set_buffer_argument(0, &foreign), Err(Error::Argument { .. })));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_arguments_checked_against_signature() {
        let ctrl = DeviceController::acquire().unwrap();
        let mut p = ctrl.create_program();
        p.compile_from_source(crate::gpu::filters::NMS_WGSL).unwrap();
        let mut k = p.create_kernel("nms").unwrap();
        let buf = ctrl.create_memory_buffer(AccessMode::ReadWrite, 16, None).unwrap();

        // nms declares bindings 0..=4.
        assert!(matches!(k.set_argument(7, &[1, 0, 0, 0]), Err(Error::Argument { index: 7, .. })));
        assert!(matches!(k.set_buffer_argument(5, &buf), Err(Error::Argument { index: 5, .. })));
        // `width` is a u32 uniform.
        assert!(matches!(k.set_scalar(2, &0u64), Err(Error::Argument { index: 2, .. })));
        assert!(matches!(k.set_buffer_argument(2, &buf), Err(Error::Argument { index: 2, .. })));
        assert!(matches!(k.set_scalar(0, &0u32), Err(Error::Argument { index: 0, .. })));

        k.set_scalar(2, &4u32).unwrap();
        k.set_buffer_argument(0, &buf).unwrap();
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_shape_errors_before_backend() {
        let ctrl = DeviceController::acquire().unwrap();
        let (_p, k, _buf) = setup(&ctrl, 16);
        // No arguments bound: shape errors must win over argument errors.
        assert!(matches!(
            k.execute_with_local(NdRange::d1(16), NdRange::d2(4, 1)),
            Err(Error::DimensionMismatch { global: 1, local: 2 })
        ));
        assert!(matches!(
            k.execute_with_local(NdRange::d1(16), NdRange::d1(5)),
            Err(Error::IndivisibleRange { .. })
        ));
        assert!(matches!(
            k.execute(NdRange::d1(0)),
            Err(Error::Execution(ExecutionError::InvalidWorkDimension(_)))
        ));
    }
}
