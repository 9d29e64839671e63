// convolution.rs — 2D correlation with an 8-bit wrapping accumulator
// (CPU reference).
//
// Output pixel (x, y) reads the k×k input window whose TOP-LEFT corner is
// (x, y):
//
//     out[y][x] = Σ_i Σ_j  kernel[i][j] * in[y + i][x + j]      (mod 256)
//
// This is a top-left anchored correlation, not a centred convolution, and it
// never clamps. The caller pads the input (see `Image::padded_to_multiple`)
// so that `in_width >= width + k - 1` and there are `height + k - 1` rows.
//
// WRAPAROUND: the accumulator is a u8 and every multiply/add wraps modulo
// 256. The accelerator kernel `convolve2d` does the same, and the two paths
// are compared byte-for-byte, so do not "fix" this with saturation or a wider
// accumulator. Signed weights (e.g. -1) reduce to the same residue as their
// u8 bit pattern (255), so an i8 kernel is exactly equivalent to the u8 one
// the device sees.

use rayon::prelude::*;

use crate::image::Image;

/// Correlate `input` (row stride `in_width`) with a square `kernel_size ×
/// kernel_size` kernel, writing a `width × height` result into `output`.
///
/// Rows are independent and computed in parallel.
///
/// # Panics
/// Panics if the kernel size is even or zero, `kernel.len()` is not
/// `kernel_size²`, `output` is smaller than `width * height`, or `input` is
/// too small to cover every window.
pub fn convolve2d(
    input: &[u8],
    output: &mut [u8],
    kernel: &[i8],
    in_width: usize,
    width: usize,
    height: usize,
    kernel_size: usize,
) {
    assert!(kernel_size % 2 == 1, "kernel size must be odd (got {kernel_size})");
    assert_eq!(
        kernel.len(),
        kernel_size * kernel_size,
        "kernel must hold kernel_size² = {} weights",
        kernel_size * kernel_size,
    );
    assert!(output.len() >= width * height, "output buffer smaller than width * height");
    if width == 0 || height == 0 {
        return;
    }
    assert!(
        in_width >= width + kernel_size - 1,
        "input stride {in_width} too small for width {width} and kernel {kernel_size}"
    );
    assert!(
        input.len() >= (height + kernel_size - 2) * in_width + width + kernel_size - 1,
        "input too small: every output pixel needs its full kernel window (pad the input)"
    );

    output[..width * height]
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out_row)| {
            for (x, out) in out_row.iter_mut().enumerate() {
                let mut sum = 0u8;
                for (i, k_row) in kernel.chunks_exact(kernel_size).enumerate() {
                    let start = (y + i) * in_width + x;
                    let window = &input[start..start + kernel_size];
                    for (&k, &s) in k_row.iter().zip(window) {
                        sum = sum.wrapping_add((k as u8).wrapping_mul(s));
                    }
                }
                *out = sum;
            }
        });
}

/// Correlate a padded image with `kernel`, returning the valid region of
/// `(W - k + 1) × (H - k + 1)` pixels.
///
/// # Panics
/// Panics as [`convolve2d`], or if the image is smaller than the kernel.
pub fn convolve2d_image(input: &Image, kernel: &[i8], kernel_size: usize) -> Image {
    assert!(
        input.width() >= kernel_size && input.height() >= kernel_size,
        "image {}×{} smaller than kernel {kernel_size}",
        input.width(),
        input.height(),
    );
    let out_w = input.width() - kernel_size + 1;
    let out_h = input.height() - kernel_size + 1;
    let mut out = Image::new(out_w, out_h);
    convolve2d(
        input.as_slice(),
        out.as_mut_slice(),
        kernel,
        input.width(),
        out_w,
        out_h,
        kernel_size,
    );
    out
}

/// The 5×5 blob-detection kernel used by the comparison demo: a negative
/// ring around a positive centre with weight 8.
#[rustfmt::skip]
pub const BLOB_KERNEL_5X5: [i8; 25] = [
    -1, -1, -1, -1, -1,
    -1,  1,  1,  1, -1,
    -1,  1,  8,  1, -1,
    -1,  1,  1,  1, -1,
    -1, -1, -1, -1, -1,
];

/// 3×3 Laplacian-style kernel; weights sum to zero.
#[rustfmt::skip]
pub const LAPLACE_KERNEL_3X3: [i8; 9] = [
    -1, -1, -1,
    -1,  8, -1,
    -1, -1, -1,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_kernel_top_left_anchor() {
        // Identity at the kernel centre shifts the image by (1, 1): output
        // (x, y) reads input (x + 1, y + 1).
        let data: Vec<u8> = (0..16).collect();
        let img = Image::from_vec(4, 4, data);
        let k = [0, 0, 0, 0, 1, 0, 0, 0, 0];
        let out = convolve2d_image(&img, &k, 3);
        assert_eq!(out.width(), 2);
        assert_eq!(out.height(), 2);
        assert_eq!(out.as_slice(), &[5, 6, 9, 10]);
    }

    #[test]
    fn test_zero_sum_kernel_on_flat_region() {
        let img = Image::filled(6, 6, 50);
        let out = convolve2d_image(&img, &LAPLACE_KERNEL_3X3, 3);
        assert!(out.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_accumulator_wraps_on_overflow() {
        // 9 × 1 × 100 = 900 = 3·256 + 132.
        let img = Image::filled(3, 3, 100);
        let out = convolve2d_image(&img, &[1; 9], 3);
        assert_eq!(out.as_slice(), &[132]);
    }

    #[test]
    fn test_accumulator_wraps_on_underflow() {
        // -1 × 10 = -10 ≡ 246.
        let img = Image::filled(1, 1, 10);
        let out = convolve2d_image(&img, &[-1], 1);
        assert_eq!(out.as_slice(), &[246]);
    }

    #[test]
    fn test_signed_and_unsigned_weights_agree() {
        // -1 and its u8 bit pattern 255 are the same residue.
        let data: Vec<u8> = (0..25).map(|i| (i * 37 % 251) as u8).collect();
        let img = Image::from_vec(5, 5, data);
        let signed = convolve2d_image(&img, &BLOB_KERNEL_5X5, 5);
        let mut expected = 0u8;
        for (&k, &s) in BLOB_KERNEL_5X5.iter().zip(img.as_slice()) {
            expected = expected.wrapping_add((k as u8).wrapping_mul(s));
        }
        assert_eq!(signed.as_slice(), &[expected]);
    }

    #[test]
    fn test_explicit_stride_larger_than_width() {
        // Only the first 2×1 outputs are requested from a 5-wide input.
        let input: Vec<u8> = vec![1, 2, 3, 4, 5];
        let mut out = [0u8; 2];
        convolve2d(&input, &mut out, &[1], 5, 2, 1, 1);
        assert_eq!(out, [1, 2]);
    }

    #[test]
    #[should_panic(expected = "odd")]
    fn test_even_kernel_panics() {
        let img = Image::new(4, 4);
        convolve2d_image(&img, &[0; 4], 2);
    }

    #[test]
    #[should_panic(expected = "pad the input")]
    fn test_unpadded_input_panics() {
        let input = [0u8; 9];
        let mut out = [0u8; 9];
        convolve2d(&input, &mut out, &[0; 9], 5, 3, 3, 3);
    }
}
