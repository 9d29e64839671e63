// gpu/registry.rs — Ownership table behind a DeviceController.
//
// Public handles (`MemoryBuffer`, `Program`, `Kernel`) hold only an id and a
// `Weak` back-reference to the controller. The wgpu objects themselves live
// here, so the controller decides when they are destroyed:
//
//   Registry
//   ├── buffers:  id → BufferSlot  (Option<Allocation>)
//   └── programs: id → ProgramSlot
//                      ├── source + shader modules per work-group shape
//                      └── kernels: id → KernelSlot (params, args, pipelines)
//
// A handle whose id is missing from the table (controller dropped, program
// recompiled, object released) resolves to `Error::Released`.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::gpu::error::{Error, Result};

pub(crate) type ObjectId = u64;

/// Work-group shape used as a cache key for modules and pipelines.
pub(crate) type WorkgroupKey = [u32; 3];

/// One device allocation.
pub(crate) struct Allocation {
    pub buffer: wgpu::Buffer,
    /// Declared size in bytes. The wgpu buffer may be up to 3 bytes larger
    /// (`COPY_BUFFER_ALIGNMENT`).
    pub size: usize,
}

#[derive(Default)]
pub(crate) struct BufferSlot {
    pub alloc: Option<Allocation>,
}

/// A bound kernel argument. Buffers are resolved by id at dispatch time so a
/// re-allocated buffer is picked up without re-binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KernelArg {
    Buffer(ObjectId),
    Bytes(Vec<u8>),
}

/// What a kernel declares at one `@group(0)` binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgumentKind {
    /// `var<storage>`: takes a memory buffer.
    Storage,
    /// `var<uniform>` of `size` bytes: takes a byte argument of that size.
    Uniform { size: u32 },
    /// Textures and samplers; nothing in this crate can bind them.
    Opaque,
}

pub(crate) struct KernelSlot {
    pub entry_point: String,
    /// Bindings the entry point uses, by index.
    pub params: BTreeMap<u32, ArgumentKind>,
    pub args: BTreeMap<u32, KernelArg>,
    pub pipelines: HashMap<WorkgroupKey, wgpu::ComputePipeline>,
}

impl KernelSlot {
    pub fn new(
        entry_point: &str,
        params: BTreeMap<u32, ArgumentKind>,
        validated: Option<(WorkgroupKey, wgpu::ComputePipeline)>,
    ) -> Self {
        KernelSlot {
            entry_point: entry_point.to_owned(),
            params,
            args: BTreeMap::new(),
            pipelines: validated.into_iter().collect(),
        }
    }

    /// Store `arg` at `index`, replacing any earlier value.
    pub fn bind(&mut self, index: u32, arg: KernelArg) {
        self.args.insert(index, arg);
    }
}

#[derive(Default)]
pub(crate) struct ProgramSlot {
    /// Source text of the last successful compilation.
    pub source: Option<String>,
    pub modules: HashMap<WorkgroupKey, wgpu::ShaderModule>,
    pub kernels: HashMap<ObjectId, KernelSlot>,
}

impl ProgramSlot {
    /// Drop kernels first, then compiled modules.
    pub fn release(&mut self) {
        if !self.kernels.is_empty() {
            debug!("releasing {} kernel(s)", self.kernels.len());
        }
        self.kernels.clear();
        self.modules.clear();
        self.source = None;
    }
}

/// Counts of live objects owned by a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub programs: usize,
    pub kernels: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: ObjectId,
    pub buffers: HashMap<ObjectId, BufferSlot>,
    pub programs: HashMap<ObjectId, ProgramSlot>,
}

impl Registry {
    pub fn next_id(&mut self) -> ObjectId {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert_buffer(&mut self, slot: BufferSlot) -> ObjectId {
        let id = self.next_id();
        self.buffers.insert(id, slot);
        id
    }

    pub fn insert_program(&mut self) -> ObjectId {
        let id = self.next_id();
        self.programs.insert(id, ProgramSlot::default());
        id
    }

    pub fn buffer(&self, id: ObjectId) -> Result<&BufferSlot> {
        self.buffers.get(&id).ok_or(Error::Released("memory buffer"))
    }

    pub fn buffer_mut(&mut self, id: ObjectId) -> Result<&mut BufferSlot> {
        self.buffers.get_mut(&id).ok_or(Error::Released("memory buffer"))
    }

    pub fn program(&self, id: ObjectId) -> Result<&ProgramSlot> {
        self.programs.get(&id).ok_or(Error::Released("program"))
    }

    pub fn program_mut(&mut self, id: ObjectId) -> Result<&mut ProgramSlot> {
        self.programs.get_mut(&id).ok_or(Error::Released("program"))
    }

    pub fn kernel_mut(&mut self, program: ObjectId, kernel: ObjectId) -> Result<&mut KernelSlot> {
        self.program_mut(program)?
            .kernels
            .get_mut(&kernel)
            .ok_or(Error::Released("kernel"))
    }

    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            buffers: self.buffers.len(),
            programs: self.programs.len(),
            kernels: self.programs.values().map(|p| p.kernels.len()).sum(),
        }
    }

    /// Release everything: kernels (through their programs), programs, then
    /// buffers. The controller drops its queue and device only afterwards.
    pub fn release_all(&mut self) {
        let live = self.live_objects();
        debug!(
            "releasing {} kernel(s), {} program(s), {} buffer(s)",
            live.kernels, live.programs, live.buffers
        );
        for program in self.programs.values_mut() {
            program.release();
        }
        self.programs.clear();
        self.buffers.clear();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.release_all();
    }
}
