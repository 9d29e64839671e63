// gpu/mod.rs — Compute offload layer (wgpu).
//
// Turns one physical compute device into a set of owned objects:
//
//   DeviceController ── owns ──┬── MemoryBuffer  (device allocation)
//                              └── Program       (compiled WGSL)
//                                    └── Kernel  (entry point + arguments)
//
// All host calls are blocking. Errors from wgpu are captured with error
// scopes and returned as `gpu::Error`; nothing is reported through the
// uncaptured-error handler.
//
// `filters` runs the crate's two algorithms on the device and is checked
// byte-for-byte against the CPU references in `nms` and `convolution`.

pub mod buffer;
pub mod device;
pub mod error;
pub mod filters;
pub mod kernel;
pub mod ndrange;
pub mod program;
mod registry;

pub use buffer::{AccessMode, MemoryBuffer};
pub use device::{DeviceCapabilities, DeviceClass, DeviceConfig, DeviceController, DeviceProfile};
pub use error::{Error, ExecutionError, Result};
pub use filters::GpuFilters;
pub use kernel::Kernel;
pub use ndrange::NdRange;
pub use program::Program;
pub use registry::LiveObjects;
