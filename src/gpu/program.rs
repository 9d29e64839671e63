// gpu/program.rs — Compiled device code and kernel creation.
//
// A Program holds WGSL source text. Compilation validates the source once
// (wgpu reports parse and validation failures through the error scope) and
// keeps it for later specialisation.
//
// WORKGROUP SIZE:
// naga does not accept `override` constants inside `@workgroup_size`, so
// the shape is injected by string replacement of `{{WG_X}}`, `{{WG_Y}}` and
// `{{WG_Z}}`. One shader module is kept per shape actually dispatched.
// Compilation and entry-point lookup use the 1×1×1 specialisation. Sources
// without placeholders are compiled as-is for every shape; such kernels must
// be dispatched with the local range their `@workgroup_size` declares.
//
// SIGNATURE:
// `create_kernel` reflects the `@group(0)` bindings the entry point actually
// uses (naga parse + validation, the same usage analysis wgpu applies for
// `layout: None`). The kernel checks arguments against them when they are
// set, not at dispatch.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::gpu::device::Shared;
use crate::gpu::error::{bounded_build_log, Error, Result};
use crate::gpu::kernel::Kernel;
use crate::gpu::registry::{ArgumentKind, KernelSlot, ObjectId, WorkgroupKey};

/// Specialisation used to validate source and entry points.
pub(crate) const VALIDATION_SHAPE: WorkgroupKey = [1, 1, 1];

/// Handle to a unit of device code owned by a [`DeviceController`].
///
/// [`DeviceController`]: crate::gpu::DeviceController
#[derive(Debug)]
pub struct Program {
    shared: Weak<Shared>,
    id: ObjectId,
}

impl Program {
    pub(crate) fn new(shared: Weak<Shared>, id: ObjectId) -> Self {
        Program { shared, id }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn check_owner(&self, shared: &Arc<Shared>) -> Result<()> {
        if std::ptr::eq(self.shared.as_ptr(), Arc::as_ptr(shared)) {
            Ok(())
        } else {
            Err(Error::ForeignHandle("program"))
        }
    }

    fn upgrade(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(Error::Released("program"))
    }

    /// Compile WGSL `source`.
    ///
    /// Kernels created from a previous compilation are released first, even
    /// if this compilation fails.
    ///
    /// # Errors
    /// `Compile` with the diagnostic, prefixed and bounded to
    /// [`BUILD_LOG_LIMIT`](crate::gpu::error::BUILD_LOG_LIMIT) bytes.
    pub fn compile_from_source(&mut self, source: &str) -> Result<()> {
        let shared = self.upgrade()?;
        let mut registry = shared.registry();
        let slot = registry.program_mut(self.id)?;
        slot.release();

        let module = create_module(&shared, source, VALIDATION_SHAPE).map_err(|diagnostic| {
            warn!("program #{} failed to compile", self.id);
            Error::Compile { log: bounded_build_log(&diagnostic) }
        })?;
        slot.modules.insert(VALIDATION_SHAPE, module);
        slot.source = Some(source.to_owned());
        debug!("compiled program #{} ({} bytes of source)", self.id, source.len());
        Ok(())
    }

    /// Read the file at `path` and compile its contents.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as
    /// [`compile_from_source`](Self::compile_from_source).
    pub fn compile_from_source_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.compile_from_source(&source)
    }

    /// True once a compilation has succeeded.
    pub fn is_compiled(&self) -> bool {
        self.shared
            .upgrade()
            .map(|s| {
                s.registry()
                    .program(self.id)
                    .map(|slot| slot.source.is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Create a kernel for the compute entry point `name`.
    ///
    /// # Errors
    /// `NotCompiled` before a successful compilation, `Symbol` if the
    /// program has no compute entry point of that name.
    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        let shared = self.upgrade()?;
        let mut registry = shared.registry();
        let kernel_id = registry.next_id();
        let slot = registry.program_mut(self.id)?;
        let source = slot.source.as_deref().ok_or(Error::NotCompiled)?;

        let symbol = |reason| Error::Symbol { name: name.to_owned(), reason };
        let params = reflect_arguments(source, name).map_err(symbol)?;
        let module = module_for(&shared, source, &mut slot.modules, VALIDATION_SHAPE).map_err(symbol)?;
        let pipeline = create_pipeline(&shared, module, name).map_err(symbol)?;

        debug!(
            "created kernel `{name}` #{kernel_id} from program #{} ({} argument(s))",
            self.id,
            params.len()
        );
        slot.kernels
            .insert(kernel_id, KernelSlot::new(name, params, Some((VALIDATION_SHAPE, pipeline))));
        Ok(Kernel::new(self.shared.clone(), self.id, kernel_id, name))
    }
}

/// Replace the work-group placeholders with `shape`.
pub(crate) fn specialise(source: &str, shape: WorkgroupKey) -> String {
    source
        .replace("{{WG_X}}", &shape[0].to_string())
        .replace("{{WG_Y}}", &shape[1].to_string())
        .replace("{{WG_Z}}", &shape[2].to_string())
}

fn create_module(
    shared: &Shared,
    source: &str,
    shape: WorkgroupKey,
) -> std::result::Result<wgpu::ShaderModule, String> {
    let wgsl = specialise(source, shape);
    let (module, err) = shared.scoped(|device, _| {
        device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Program"),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        })
    });
    match err {
        Some(e) => Err(diagnostic(&e)),
        None => Ok(module),
    }
}

/// Cached module for `shape`, compiling it on first use.
pub(crate) fn module_for<'a>(
    shared: &Shared,
    source: &str,
    modules: &'a mut HashMap<WorkgroupKey, wgpu::ShaderModule>,
    shape: WorkgroupKey,
) -> std::result::Result<&'a wgpu::ShaderModule, String> {
    if !modules.contains_key(&shape) {
        let module = create_module(shared, source, shape)?;
        modules.insert(shape, module);
    }
    modules
        .get(&shape)
        .ok_or_else(|| format!("no module for work-group shape {shape:?}"))
}

/// Compute pipeline for `entry_point` with a layout derived from the shader.
pub(crate) fn create_pipeline(
    shared: &Shared,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> std::result::Result<wgpu::ComputePipeline, String> {
    let (pipeline, err) = shared.scoped(|device, _| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: None,
            module,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        })
    });
    match err {
        Some(e) => Err(diagnostic(&e)),
        None => Ok(pipeline),
    }
}

/// The `@group(0)` bindings used by compute entry point `entry_point`.
///
/// Bindings declared in the source but never touched by the entry point are
/// left out, matching the layout wgpu derives for the pipeline.
pub(crate) fn reflect_arguments(
    source: &str,
    entry_point: &str,
) -> std::result::Result<BTreeMap<u32, ArgumentKind>, String> {
    let wgsl = specialise(source, VALIDATION_SHAPE);
    let module = naga::front::wgsl::parse_str(&wgsl).map_err(|e| e.emit_to_string(&wgsl))?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| e.emit_to_string(&wgsl))?;

    let index = module
        .entry_points
        .iter()
        .position(|ep| ep.name == entry_point && ep.stage == naga::ShaderStage::Compute)
        .ok_or_else(|| format!("no compute entry point named `{entry_point}`"))?;
    let usage = info.get_entry_point(index);

    let mut params = BTreeMap::new();
    for (handle, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else { continue };
        if binding.group != 0 || usage[handle].is_empty() {
            continue;
        }
        let kind = match var.space {
            naga::AddressSpace::Storage { .. } => ArgumentKind::Storage,
            naga::AddressSpace::Uniform => ArgumentKind::Uniform {
                size: module.types[var.ty].inner.size(module.to_ctx()),
            },
            _ => ArgumentKind::Opaque,
        };
        params.insert(binding.binding, kind);
    }
    Ok(params)
}

/// Backend diagnostic text for a captured error.
pub(crate) fn diagnostic(e: &wgpu::Error) -> String {
    match e {
        wgpu::Error::Validation { description, .. } => description.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::DeviceController;

    #[test]
    fn test_specialise_replaces_all_placeholders() {
        let src = "@workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}}) // {{WG_X}}";
        assert_eq!(specialise(src, [16, 8, 1]), "@workgroup_size(16, 8, 1) // 16");
    }

    #[test]
    fn test_specialise_leaves_plain_source() {
        let src = "@compute @workgroup_size(64) fn main() {}";
        assert_eq!(specialise(src, [4, 4, 4]), src);
    }

    #[test]
    fn test_reflect_bundled_nms_signature() {
        let params = reflect_arguments(crate::gpu::filters::NMS_WGSL, "nms").unwrap();
        let expected: BTreeMap<u32, ArgumentKind> = [
            (0, ArgumentKind::Storage),
            (1, ArgumentKind::Storage),
            (2, ArgumentKind::Uniform { size: 4 }),
            (3, ArgumentKind::Uniform { size: 4 }),
            (4, ArgumentKind::Uniform { size: 4 }),
        ]
        .into_iter()
        .collect();
        assert_eq!(params, expected);
    }

    #[test]
    fn test_reflect_bundled_convolve2d_signature() {
        let params = reflect_arguments(crate::gpu::filters::CONVOLVE2D_WGSL, "convolve2d").unwrap();
        assert_eq!(params.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(params[&2], ArgumentKind::Storage);
        assert_eq!(params[&6], ArgumentKind::Uniform { size: 4 });
    }

    #[test]
    fn test_reflect_only_bindings_the_entry_point_uses() {
        let src = "
            struct Params { offset: u32, scale: vec2<f32> }
            @group(0) @binding(0) var<storage, read_write> data: array<u32>;
            @group(0) @binding(3) var<uniform> params: Params;
            @group(0) @binding(5) var<storage, read> unused: array<u32>;
            @group(1) @binding(0) var<uniform> other_group: u32;

            @compute @workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}})
            fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
                data[gid.x] = data[gid.x] + params.offset;
            }

            @compute @workgroup_size(1)
            fn touch_unused() {
                data[0] = unused[0];
            }
        ";
        let params = reflect_arguments(src, "main").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[&0], ArgumentKind::Storage);
        // u32 + padding to vec2 alignment + vec2<f32>.
        assert_eq!(params[&3], ArgumentKind::Uniform { size: 16 });

        let params = reflect_arguments(src, "touch_unused").unwrap();
        assert_eq!(params.keys().copied().collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn test_reflect_missing_entry_point() {
        let err = reflect_arguments(SOURCE, "thrice").unwrap_err();
        assert!(err.contains("thrice"), "{err}");
    }

    // ---- GPU tests ------------------------------------------------------------

    const SOURCE: &str = "
        @group(0) @binding(0) var<storage, read_write> data: array<u32>;

        @compute @workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}})
        fn twice(@builtin(global_invocation_id) gid: vec3<u32>) {
            data[gid.x] = data[gid.x] * 2u;
        }
    ";

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_compile_and_create_kernel() {
        let ctrl = DeviceController::acquire().unwrap();
        let mut p = ctrl.create_program();
        assert!(!p.is_compiled());
        assert!(matches!(p.create_kernel("twice"), Err(Error::NotCompiled)));

        p.compile_from_source(SOURCE).unwrap();
        assert!(p.is_compiled());
        let k = p.create_kernel("twice").unwrap();
        assert_eq!(k.name(), "twice");
        assert!(matches!(p.create_kernel("thrice"), Err(Error::Symbol { .. })));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_compile_error_log() {
        let ctrl = DeviceController::acquire().unwrap();
        let mut p = ctrl.create_program();
        let err = p.compile_from_source("fn broken( {").unwrap_err();
        match err {
            Error::Compile { log } => {
                assert!(log.starts_with("Error while compiling program:\n"));
                assert!(log.len() <= crate::gpu::error::BUILD_LOG_LIMIT);
            }
            other => panic!("expected Compile, got {other}"),
        }
        assert!(!p.is_compiled());
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_recompile_releases_kernels() {
        let ctrl = DeviceController::acquire().unwrap();
        let mut p = ctrl.create_program();
        p.compile_from_source(SOURCE).unwrap();
        let k = p.create_kernel("twice").unwrap();
        assert_eq!(ctrl.live_objects().kernels, 1);

        p.compile_from_source(SOURCE).unwrap();
        assert_eq!(ctrl.live_objects().kernels, 0);
        assert!(matches!(
            k.execute(crate::gpu::NdRange::d1(4)),
            Err(Error::Released("kernel"))
        ));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_missing_source_file() {
        let ctrl = DeviceController::acquire().unwrap();
        let mut p = ctrl.create_program();
        let err = p.compile_from_source_file("/nonexistent/kernel.wgsl").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
