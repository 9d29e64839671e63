// image.rs — Row-major 8-bit grayscale image shared by the CPU and GPU paths.
//
// The accelerator kernels read the exact same byte layout the CPU reference
// reads: `width * height` samples, row-major, no stride padding. Keeping a
// single representation means a buffer can be uploaded with one
// `MemoryBuffer::write` and compared against the CPU result byte-for-byte.
//
// Memory layout (width = 4, height = 3):
//
//   data index:  0  1  2  3 | 4  5  6  7 | 8  9 10 11
//   row:         |- row 0 -|  |- row 1 -|  |- row 2 -|
//
// Padding helpers (`padded`, `padded_to_multiple`) exist because the
// convolution reads a k×k window anchored at the top-left of every output
// pixel and never clamps: the caller grows the image with zero samples so no
// read leaves the buffer.

use std::fmt;

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A single-channel 8-bit image with runtime dimensions.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    /// Samples in row-major order. Length = width * height.
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl Image {
    // --- Constructors ---

    /// Create a zero-initialized image.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![0; width * height],
            width,
            height,
        }
    }

    /// Create an image filled with a single value.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Create an image from an existing sample vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    // --- Accessors ---

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of samples (and bytes) in the image.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the sample at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// Set the sample at (x, y).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Borrow a single row as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[u8] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Iterate over all samples as `(x, y, value)` tuples.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, u8)> + '_ {
        let w = self.width;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % w, i / w, v))
    }

    /// Raw sample bytes, row-major.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Set every sample to zero. NMS writes only survivors, so its output
    /// must be cleared before reuse.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    // --- Padding / cropping ---

    /// Copy this image into the top-left corner of a larger zero-filled image.
    ///
    /// # Panics
    /// Panics if the target is smaller than the image in either axis.
    pub fn padded(&self, width: usize, height: usize) -> Image {
        assert!(
            width >= self.width && height >= self.height,
            "padded size {width}×{height} is smaller than image {}×{}",
            self.width,
            self.height,
        );
        let mut out = Image::new(width, height);
        for y in 0..self.height {
            out.data[y * width..y * width + self.width].copy_from_slice(self.row(y));
        }
        out
    }

    /// Pad so both axes become multiples of the given work-group shape, then
    /// add `border` extra columns and rows (e.g. `kernel_size - 1` so a
    /// top-left anchored convolution of the rounded size stays in bounds).
    ///
    /// # Panics
    /// Panics if either multiple is zero.
    pub fn padded_to_multiple(&self, multiple_x: usize, multiple_y: usize, border: usize) -> Image {
        assert!(multiple_x > 0 && multiple_y > 0, "padding multiples must be > 0");
        let w = round_up(self.width, multiple_x) + border;
        let h = round_up(self.height, multiple_y) + border;
        self.padded(w, h)
    }

    /// Copy the top-left `width × height` region into a new image.
    ///
    /// # Panics
    /// Panics if the region exceeds the image.
    pub fn cropped(&self, width: usize, height: usize) -> Image {
        assert!(
            width <= self.width && height <= self.height,
            "crop {width}×{height} exceeds image {}×{}",
            self.width,
            self.height,
        );
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            data.extend_from_slice(&self.row(y)[..width]);
        }
        Image { data, width, height }
    }

    // --- Internal helpers ---

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

/// Round `value` up to the next multiple of `multiple`.
#[inline]
pub(crate) fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

// Debug output: dimensions plus the top-left corner, enough for small test images.
impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image {{ {}×{} }}", self.width, self.height)?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl std::ops::Index<(usize, usize)> for Image {
    type Output = u8;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &u8 {
        self.bounds_check(x, y);
        &self.data[y * self.width + x]
    }
}

impl std::ops::IndexMut<(usize, usize)> for Image {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut u8 {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
