// gpu/filters.rs — NMS and convolution on the device.
//
// Drives the resource layer the way an application would: compile the
// bundled WGSL once, create both kernels, then per call upload the image,
// bind arguments, dispatch and read the result back. Buffers are created
// empty and re-allocated only when a call needs a different size.
//
// Results are byte-identical to `nms::suppress_to_mask` and
// `convolution::convolve2d_image`.

use tracing::debug;

use crate::gpu::buffer::{AccessMode, MemoryBuffer};
use crate::gpu::device::DeviceController;
use crate::gpu::error::{Error, Result};
use crate::gpu::kernel::Kernel;
use crate::gpu::ndrange::NdRange;
use crate::gpu::program::Program;
use crate::image::Image;
use crate::nms::block_grid;

/// Device code for the `nms` kernel.
pub const NMS_WGSL: &str = include_str!("../shaders/nms.wgsl");

/// Device code for the `convolve2d` kernel.
pub const CONVOLVE2D_WGSL: &str = include_str!("../shaders/convolve2d.wgsl");

/// Compiled NMS and convolution kernels plus their reusable buffers.
pub struct GpuFilters {
    nms: Kernel,
    convolve: Kernel,
    input: MemoryBuffer,
    output: MemoryBuffer,
    weights: MemoryBuffer,
    _programs: [Program; 2],
}

impl GpuFilters {
    /// Compile both kernels on `ctrl`.
    pub fn new(ctrl: &DeviceController) -> Result<Self> {
        let mut nms_program = ctrl.create_program();
        nms_program.compile_from_source(NMS_WGSL)?;
        let nms = nms_program.create_kernel("nms")?;

        let mut conv_program = ctrl.create_program();
        conv_program.compile_from_source(CONVOLVE2D_WGSL)?;
        let convolve = conv_program.create_kernel("convolve2d")?;

        debug!("filter kernels ready on {}", ctrl.capabilities().name);
        Ok(GpuFilters {
            nms,
            convolve,
            input: ctrl.create_empty_buffer(),
            output: ctrl.create_empty_buffer(),
            weights: ctrl.create_empty_buffer(),
            _programs: [nms_program, conv_program],
        })
    }

    /// Block NMS with radius `n`; returns a fresh mask with 255 at every
    /// surviving maximum and 0 elsewhere.
    ///
    /// # Panics
    /// Panics if `n == 0`.
    pub fn nms(&mut self, image: &Image, n: usize) -> Result<Image> {
        let (w, h) = (image.width(), image.height());
        let (bx, by) = block_grid(w, h, n);
        let mut mask = Image::new(w, h);
        if bx == 0 || by == 0 {
            return Ok(mask);
        }

        upload(&mut self.input, AccessMode::ReadOnly, image.as_slice())?;
        upload(&mut self.output, AccessMode::ReadWrite, mask.as_slice())?;

        let k = &mut self.nms;
        k.set_buffer_argument(0, &self.input)?;
        k.set_buffer_argument(1, &self.output)?;
        k.set_scalar(2, &to_u32(2, w)?)?;
        k.set_scalar(3, &to_u32(3, h)?)?;
        k.set_scalar(4, &to_u32(4, n)?)?;
        k.execute(NdRange::d2(bx, by))?;

        self.output.read(mask.as_mut_slice())?;
        Ok(mask)
    }

    /// Correlate a pre-padded `input` with an odd `kernel_size²` kernel,
    /// returning the `(W - k + 1) × (H - k + 1)` valid region.
    ///
    /// `local` selects the work-group shape; it must divide the output size.
    ///
    /// # Panics
    /// Panics on an even kernel size, a wrong kernel length, or an image
    /// smaller than the kernel.
    pub fn convolve2d(
        &mut self,
        input: &Image,
        kernel: &[i8],
        kernel_size: usize,
        local: Option<NdRange>,
    ) -> Result<Image> {
        assert!(kernel_size % 2 == 1, "kernel size must be odd (got {kernel_size})");
        assert_eq!(kernel.len(), kernel_size * kernel_size, "kernel must hold kernel_size² weights");
        assert!(
            input.width() >= kernel_size && input.height() >= kernel_size,
            "image {}×{} smaller than kernel {kernel_size}",
            input.width(),
            input.height(),
        );
        let out_w = input.width() - kernel_size + 1;
        let out_h = input.height() - kernel_size + 1;
        let mut out = Image::new(out_w, out_h);

        upload(&mut self.input, AccessMode::ReadOnly, input.as_slice())?;
        upload(&mut self.output, AccessMode::WriteOnly, out.as_slice())?;
        upload(&mut self.weights, AccessMode::ReadOnly, bytemuck::cast_slice(kernel))?;

        let k = &mut self.convolve;
        k.set_buffer_argument(0, &self.input)?;
        k.set_buffer_argument(1, &self.output)?;
        k.set_buffer_argument(2, &self.weights)?;
        k.set_scalar(3, &to_u32(3, input.width())?)?;
        k.set_scalar(4, &to_u32(4, out_w)?)?;
        k.set_scalar(5, &to_u32(5, out_h)?)?;
        k.set_scalar(6, &to_u32(6, kernel_size)?)?;

        let global = NdRange::d2(out_w, out_h);
        match local {
            Some(local) => k.execute_with_local(global, local)?,
            None => k.execute(global)?,
        }

        self.output.read(out.as_mut_slice())?;
        Ok(out)
    }
}

/// Make `buffer` hold exactly `data`, re-allocating on a size or mode change.
fn upload(buffer: &mut MemoryBuffer, mode: AccessMode, data: &[u8]) -> Result<()> {
    if buffer.size() != data.len() || buffer.mode() != Some(mode) || !buffer.is_allocated() {
        buffer.allocate(mode, data.len(), None)?;
    }
    buffer.write(data)
}

fn to_u32(index: u32, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Argument {
        index,
        reason: format!("{value} does not fit a u32"),
    })
}
