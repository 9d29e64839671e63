// gpu/buffer.rs — Device memory buffers and host ↔ device transfers.
//
// Every allocation is a wgpu storage buffer with COPY_SRC | COPY_DST so it
// can be bound as a kernel argument and transferred in both directions.
// `AccessMode` records how kernels are expected to use it; wgpu decides
// read-only vs read-write from the shader declaration, not the buffer.
//
// ALIGNMENT:
// wgpu copies and queue writes work in 4-byte units
// (`wgpu::COPY_BUFFER_ALIGNMENT`). Allocations are rounded up to a
// multiple of 4 and the declared size is tracked separately. Transfers of
// an unaligned length are split:
//   write — aligned prefix via `queue.write_buffer`; the trailing partial
//           word is read back, patched, and rewritten so bytes past the
//           requested range keep their contents.
//   read  — copy the aligned-up range into a MAP_READ staging buffer, then
//           return the requested prefix.
//
// HOST-SHARED:
// wgpu has no zero-copy host pointer buffers. `AccessMode::HostShared`
// allocations are initialised from the caller's data at creation
// (`create_buffer_init`) and behave like any other device buffer after.
//
// Both transfers block until the device has finished the copy.

use std::sync::{mpsc, Arc, Weak};

use tracing::trace;
use wgpu::util::DeviceExt;

use crate::gpu::device::Shared;
use crate::gpu::error::{Error, Result};
use crate::gpu::registry::{Allocation, ObjectId};

const COPY_ALIGNMENT: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

/// How kernels access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    WriteOnly,
    /// Initialised from host data at allocation.
    HostShared,
}

/// Handle to a device buffer owned by a [`DeviceController`].
///
/// A handle may exist without an allocation (see
/// [`DeviceController::create_empty_buffer`]); transfers on it fail until
/// [`allocate`](Self::allocate) succeeds.
///
/// [`DeviceController`]: crate::gpu::DeviceController
/// [`DeviceController::create_empty_buffer`]: crate::gpu::DeviceController::create_empty_buffer
#[derive(Debug)]
pub struct MemoryBuffer {
    shared: Weak<Shared>,
    id: ObjectId,
    size: usize,
    mode: Option<AccessMode>,
}

impl MemoryBuffer {
    pub(crate) fn new(shared: Weak<Shared>, id: ObjectId) -> Self {
        MemoryBuffer { shared, id, size: 0, mode: None }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn owner(&self) -> &Weak<Shared> {
        &self.shared
    }

    pub(crate) fn check_owner(&self, shared: &Arc<Shared>) -> Result<()> {
        if std::ptr::eq(self.shared.as_ptr(), Arc::as_ptr(shared)) {
            Ok(())
        } else {
            Err(Error::ForeignHandle("memory buffer"))
        }
    }

    fn upgrade(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(Error::Released("memory buffer"))
    }

    /// Declared size in bytes of the current allocation (0 if none).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mode(&self) -> Option<AccessMode> {
        self.mode
    }

    /// True while the buffer holds a live device allocation.
    pub fn is_allocated(&self) -> bool {
        self.shared
            .upgrade()
            .map(|s| {
                s.registry()
                    .buffer(self.id)
                    .map(|slot| slot.alloc.is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Allocate `size` bytes, replacing any previous allocation.
    ///
    /// # Errors
    /// `Allocation` when `size` is zero or above the device limit,
    /// when `HostShared` is requested without at least `size` bytes of
    /// `data`, when `data` is passed for another mode, or when the backend
    /// rejects the buffer. The previous allocation is released first, so
    /// the buffer is left unallocated on error.
    pub fn allocate(&mut self, mode: AccessMode, size: usize, data: Option<&[u8]>) -> Result<()> {
        let shared = self.upgrade()?;
        shared.registry().buffer_mut(self.id)?.alloc = None;
        self.size = 0;
        self.mode = None;
        let alloc = create_allocation(&shared, mode, size, data)?;
        shared.registry().buffer_mut(self.id)?.alloc = Some(alloc);
        self.size = size;
        self.mode = Some(mode);
        trace!("allocated {size} byte {mode:?} buffer #{}", self.id);
        Ok(())
    }

    /// Copy `data` to the start of the buffer, blocking until done.
    ///
    /// # Errors
    /// `Transfer` when the buffer is unallocated, `data` is longer than the
    /// buffer, or the backend reports a failure.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let shared = self.upgrade()?;
        let registry = shared.registry();
        let alloc = allocation(registry.buffer(self.id)?.alloc.as_ref())?;
        if data.len() > alloc.size {
            return Err(Error::Transfer(format!(
                "write of {} bytes exceeds buffer size {}",
                data.len(),
                alloc.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let aligned = data.len() / COPY_ALIGNMENT * COPY_ALIGNMENT;
        if aligned < data.len() {
            let mut word = read_range(&shared, &alloc.buffer, aligned, COPY_ALIGNMENT)?;
            word[..data.len() - aligned].copy_from_slice(&data[aligned..]);
            write_range(&shared, &alloc.buffer, aligned, &word)?;
        }
        if aligned > 0 {
            write_range(&shared, &alloc.buffer, 0, &data[..aligned])?;
        }
        Ok(())
    }

    /// Fill `out` from the start of the buffer, blocking until done.
    ///
    /// # Errors
    /// `Transfer` when the buffer is unallocated, `out` is longer than the
    /// buffer, or the backend reports a failure.
    pub fn read(&self, out: &mut [u8]) -> Result<()> {
        let shared = self.upgrade()?;
        let registry = shared.registry();
        let alloc = allocation(registry.buffer(self.id)?.alloc.as_ref())?;
        if out.len() > alloc.size {
            return Err(Error::Transfer(format!(
                "read of {} bytes exceeds buffer size {}",
                out.len(),
                alloc.size
            )));
        }
        if out.is_empty() {
            return Ok(());
        }
        let bytes = read_range(&shared, &alloc.buffer, 0, align_to(out.len(), COPY_ALIGNMENT))?;
        out.copy_from_slice(&bytes[..out.len()]);
        Ok(())
    }

    /// Read the whole allocation into a new vector.
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size];
        self.read(&mut out)?;
        Ok(out)
    }
}

fn allocation(alloc: Option<&Allocation>) -> Result<&Allocation> {
    alloc.ok_or_else(|| Error::Transfer("memory buffer is not allocated".into()))
}

/// Validate the request and create the wgpu buffer behind it.
fn create_allocation(
    shared: &Shared,
    mode: AccessMode,
    size: usize,
    data: Option<&[u8]>,
) -> Result<Allocation> {
    if size == 0 {
        return Err(Error::Allocation("size must be greater than zero".into()));
    }
    let limit = shared.capabilities.global_mem_size;
    let padded = align_to(size, COPY_ALIGNMENT);
    if padded as u64 > limit {
        return Err(Error::Allocation(format!(
            "{size} bytes exceeds the device buffer limit of {limit} bytes"
        )));
    }
    let init = match (mode, data) {
        (AccessMode::HostShared, Some(d)) if d.len() >= size => Some(&d[..size]),
        (AccessMode::HostShared, Some(d)) => {
            return Err(Error::Allocation(format!(
                "host-shared buffer of {size} bytes given only {} bytes of data",
                d.len()
            )))
        }
        (AccessMode::HostShared, None) => {
            return Err(Error::Allocation("host-shared buffer requires initial data".into()))
        }
        (_, Some(_)) => {
            return Err(Error::Allocation(format!(
                "initial data is only accepted for host-shared buffers, not {mode:?}"
            )))
        }
        (_, None) => None,
    };

    let label = format!("MemoryBuffer {mode:?}");
    let usage = wgpu::BufferUsages::STORAGE
        | wgpu::BufferUsages::COPY_SRC
        | wgpu::BufferUsages::COPY_DST;
    let (buffer, err) = shared.scoped(|device, _| match init {
        // create_buffer_init pads the contents to COPY_BUFFER_ALIGNMENT.
        Some(contents) => device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&label),
            contents,
            usage,
        }),
        None => device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size: padded as u64,
            usage,
            mapped_at_creation: false,
        }),
    });
    if let Some(e) = err {
        return Err(Error::Allocation(e.to_string()));
    }
    Ok(Allocation { buffer, size })
}

/// Queue a write at `offset` and wait for it. `offset` and `data.len()`
/// must be multiples of 4.
fn write_range(shared: &Shared, buffer: &wgpu::Buffer, offset: usize, data: &[u8]) -> Result<()> {
    let ((), err) = shared.scoped(|_, queue| {
        queue.write_buffer(buffer, offset as u64, data);
        queue.submit(std::iter::empty());
    });
    shared.wait_idle();
    match err {
        Some(e) => Err(Error::Transfer(e.to_string())),
        None => Ok(()),
    }
}

/// Copy `len` bytes at `offset` into host memory through a staging buffer.
/// `offset` and `len` must be multiples of 4.
pub(crate) fn read_range(
    shared: &Shared,
    buffer: &wgpu::Buffer,
    offset: usize,
    len: usize,
) -> Result<Vec<u8>> {
    let (staging, err) = shared.scoped(|device, queue| {
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("MemoryBuffer::read staging"),
            size: len as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("MemoryBuffer::read"),
        });
        encoder.copy_buffer_to_buffer(buffer, offset as u64, &staging, 0, len as u64);
        queue.submit(std::iter::once(encoder.finish()));
        staging
    });
    if let Some(e) = err {
        return Err(Error::Transfer(e.to_string()));
    }

    // Map the staging buffer; wgpu's map is async, so poll until the
    // callback fires.
    let slice = staging.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver outlives the poll below; a send failure means nobody
        // is waiting any more.
        let _ = sender.send(result);
    });
    shared.wait_idle();
    receiver
        .recv()
        .map_err(|_| Error::Transfer("map callback never fired".into()))?
        .map_err(|e| Error::Transfer(format!("map failed: {e}")))?;

    let bytes = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(bytes)
}

/// Round `value` up to the next multiple of `alignment`.
///
/// ```text
///   align_to(0, 4)  = 0
///   align_to(5, 4)  = 8
///   align_to(8, 4)  = 8
/// ```
pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::DeviceController;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(4, 4), 4);
        assert_eq!(align_to(5, 4), 8);
        assert_eq!(align_to(100, 256), 256);
    }

    // ---- GPU tests ------------------------------------------------------------
    //
    // These open a real adapter (a software one is fine). Run with:
    //   cargo test -- --include-ignored

    fn controller() -> DeviceController {
        DeviceController::acquire().expect("no compute device available")
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_write_read_round_trip() {
        let ctrl = controller();
        let buf = ctrl.create_memory_buffer(AccessMode::ReadWrite, 8, None).unwrap();
        buf.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(buf.read_to_vec().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_partial_write_leaves_remainder() {
        let ctrl = controller();
        let buf = ctrl.create_memory_buffer(AccessMode::ReadWrite, 10, None).unwrap();
        buf.write(&[9; 10]).unwrap();
        // 6 bytes: one aligned word + a 2-byte tail patched into the next.
        buf.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(buf.read_to_vec().unwrap(), vec![1, 2, 3, 4, 5, 6, 9, 9, 9, 9]);
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_unaligned_size_read() {
        let ctrl = controller();
        let data: Vec<u8> = (0..7).collect();
        let buf = ctrl
            .create_memory_buffer(AccessMode::HostShared, 7, Some(&data))
            .unwrap();
        let mut out = [0u8; 3];
        buf.read(&mut out).unwrap();
        assert_eq!(out, [0, 1, 2]);
        assert_eq!(buf.read_to_vec().unwrap(), data);
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_oversized_transfers_rejected() {
        let ctrl = controller();
        let buf = ctrl.create_memory_buffer(AccessMode::ReadOnly, 4, None).unwrap();
        assert!(matches!(buf.write(&[0; 5]), Err(Error::Transfer(_))));
        let mut out = [0u8; 5];
        assert!(matches!(buf.read(&mut out), Err(Error::Transfer(_))));
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_allocation_rules() {
        let ctrl = controller();
        let err = ctrl.create_memory_buffer(AccessMode::ReadWrite, 0, None).unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        let err = ctrl.create_memory_buffer(AccessMode::HostShared, 4, None).unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        let err = ctrl
            .create_memory_buffer(AccessMode::HostShared, 8, Some(&[0; 4]))
            .unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        let err = ctrl
            .create_memory_buffer(AccessMode::WriteOnly, 4, Some(&[0; 4]))
            .unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        let limit = usize::try_from(ctrl.capabilities().global_mem_size).unwrap();
        if let Some(too_big) = limit.checked_add(1) {
            let err = ctrl.create_memory_buffer(AccessMode::ReadWrite, too_big, None).unwrap_err();
            assert!(matches!(err, Error::Allocation(_)));
        }
        assert_eq!(ctrl.live_objects().buffers, 0);
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_empty_buffer_then_allocate() {
        let ctrl = controller();
        let mut buf = ctrl.create_empty_buffer();
        assert!(!buf.is_allocated());
        assert_eq!(buf.mode(), None);
        assert!(matches!(buf.write(&[1]), Err(Error::Transfer(_))));

        buf.allocate(AccessMode::WriteOnly, 16, None).unwrap();
        assert!(buf.is_allocated());
        assert_eq!(buf.size(), 16);
        assert_eq!(buf.mode(), Some(AccessMode::WriteOnly));

        // Reallocation replaces the old storage.
        buf.allocate(AccessMode::HostShared, 4, Some(&[7, 7, 7, 7])).unwrap();
        assert_eq!(buf.size(), 4);
        assert_eq!(buf.read_to_vec().unwrap(), vec![7; 4]);
        assert_eq!(ctrl.live_objects().buffers, 1);

        assert!(buf.allocate(AccessMode::ReadWrite, 0, None).is_err());
        assert!(!buf.is_allocated());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    #[ignore = "requires a GPU or software adapter"]
    fn test_buffer_from_other_controller_rejected() {
        let a = controller();
        let b = controller();
        let buf = b.create_memory_buffer(AccessMode::ReadWrite, 4, None).unwrap();
        assert!(matches!(a.release_buffer(buf), Err(Error::ForeignHandle("memory buffer"))));
        let program = b.create_program();
        assert!(matches!(a.release_program(program), Err(Error::ForeignHandle("program"))));
        assert_eq!(b.live_objects().programs, 1);
    }
}
