// nms.rs — Block-wise non-maximum suppression (CPU reference).
//
// Neubeck & Van Gool, "Efficient Non-Maximum Suppression" (ICPR 2006),
// Algorithm 4, maxima only. The image is tiled into non-overlapping
// (n+1)×(n+1) blocks starting at offset n in both axes:
//
//     n = 1:   . . . . . . .
//              . B B C C . .      B, C: blocks; '.' never a block member
//              . B B C C . .      (the outer n-wide border and any
//              . D D E E . .       partial block at the far edge)
//              . D D E E . .
//              . . . . . . .
//
// Each block yields exactly one candidate (its maximum, first occurrence in
// row-major order). The candidate survives only if nothing in its clamped
// radius-n window is STRICTLY greater. Equal neighbours do not reject, so two
// plateau pixels in adjacent blocks can both survive.
//
// The accelerator kernel `nms` in shaders/nms.wgsl runs one invocation per
// block and must produce the same mask byte-for-byte.

use rayon::prelude::*;

use crate::image::Image;

/// Number of blocks per axis for an image of `width × height` and radius `n`.
///
/// Returned as `(blocks_x, blocks_y)`; this is also the global NDRange of the
/// accelerator dispatch. Either value is zero when the image is too small to
/// hold a single block (`dim < 2n + 1`).
///
/// # Panics
/// Panics if `n == 0`.
pub fn block_grid(width: usize, height: usize, n: usize) -> (usize, usize) {
    assert!(n > 0, "nms radius n must be >= 1");
    (blocks_along(width, n), blocks_along(height, n))
}

#[inline]
fn blocks_along(dim: usize, n: usize) -> usize {
    // Block k spans [n + k(n+1), n + k(n+1) + n]; it fits iff the last index
    // is <= dim - 1, i.e. k <= (dim - 1 - 2n) / (n + 1). A first block exists
    // iff dim >= 2n + 1, tested as n <= (dim - 1) / 2 so a huge n cannot
    // overflow.
    if dim == 0 || n > (dim - 1) / 2 {
        0
    } else {
        (dim - 1 - 2 * n) / (n + 1) + 1
    }
}

/// Run block NMS over `image`, writing 255 at every surviving maximum.
///
/// `maxima` is NOT cleared: only survivors are written, everything else is
/// left as it was. Pass a zeroed image (see [`Image::clear`]) to get a pure
/// mask.
///
/// Blocks are evaluated in parallel. They read a shared immutable input and
/// each writes at most one location inside its own block, so the candidates
/// are computed in parallel and written sequentially afterwards.
///
/// # Panics
/// Panics if `n == 0` or the output size differs from the input size.
pub fn suppress(image: &Image, maxima: &mut Image, n: usize) {
    assert_eq!(
        (image.width(), image.height()),
        (maxima.width(), maxima.height()),
        "nms output must match input size",
    );
    let (bx, by) = block_grid(image.width(), image.height(), n);

    let survivors: Vec<(usize, usize)> = (0..by)
        .into_par_iter()
        .flat_map_iter(|v| (0..bx).filter_map(move |u| evaluate_block(image, n, u, v)))
        .collect();

    for (x, y) in survivors {
        maxima.set(x, y, 255);
    }
}

/// Convenience wrapper: allocate a zeroed mask and run [`suppress`].
pub fn suppress_to_mask(image: &Image, n: usize) -> Image {
    let mut mask = Image::new(image.width(), image.height());
    suppress(image, &mut mask, n);
    mask
}

/// Evaluate block `(u, v)`; returns the candidate location if it survives.
fn evaluate_block(image: &Image, n: usize, u: usize, v: usize) -> Option<(usize, usize)> {
    let data = image.as_slice();
    let w = image.width();
    let h = image.height();

    let x0 = n + u * (n + 1);
    let y0 = n + v * (n + 1);

    // 1. Block maximum, row-major scan, first occurrence wins.
    let (mut mx, mut my) = (x0, y0);
    let mut best = data[y0 * w + x0];
    for y in y0..=y0 + n {
        for x in x0..=x0 + n {
            let s = data[y * w + x];
            if s > best {
                best = s;
                mx = x;
                my = y;
            }
        }
    }

    // 2–3. Verification window, clamped. mx, my >= n so the lower bound never
    // underflows. Short-circuits on the first strictly greater sample.
    let x_hi = (mx + n).min(w - 1);
    let y_hi = (my + n).min(h - 1);
    let beaten = (my - n..=y_hi).any(|y| data[y * w + mx - n..=y * w + x_hi].iter().any(|&s| s > best));

    // 4.
    (!beaten).then_some((mx, my))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_grid_counts() {
        // n = 1: blocks start at 1, 3, 5, ...; each is 2 wide.
        assert_eq!(block_grid(3, 3, 1), (1, 1));
        assert_eq!(block_grid(4, 4, 1), (1, 1)); // block at 3 would need index 4
        assert_eq!(block_grid(5, 5, 1), (2, 2));
        assert_eq!(block_grid(7, 3, 1), (3, 1));
        assert_eq!(block_grid(2, 2, 1), (0, 0));
        // n = 2: blocks of 3 starting at 2, 5, 8, ...
        assert_eq!(block_grid(5, 5, 2), (1, 1));
        assert_eq!(block_grid(8, 8, 2), (2, 2));
        assert_eq!(block_grid(10, 10, 2), (2, 2));
    }

    #[test]
    fn test_single_peak_center() {
        let mut img = Image::filled(3, 3, 100);
        img.set(1, 1, 200);
        let mask = suppress_to_mask(&img, 1);
        for (x, y, v) in mask.pixels() {
            let expected = if (x, y) == (1, 1) { 255 } else { 0 };
            assert_eq!(v, expected, "unexpected mask value at ({x}, {y})");
        }
    }

    #[test]
    fn test_strictly_greater_neighbour_rejects() {
        // The only block (1..=2, 1..=2) peaks at (1,1)=150, but (0,0)=200
        // lies in its verification window.
        let mut img = Image::filled(3, 3, 10);
        img.set(1, 1, 150);
        img.set(0, 0, 200);
        let mask = suppress_to_mask(&img, 1);
        assert!(mask.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_ties_are_accepted_in_adjacent_blocks() {
        // Blocks at x = 1..=2 and x = 3..=4 on a 5×3 image. Equal maxima at
        // (2,1) and (3,1) sit in each other's window; both survive.
        let mut img = Image::filled(5, 3, 0);
        img.set(2, 1, 90);
        img.set(3, 1, 90);
        let mask = suppress_to_mask(&img, 1);
        assert_eq!(mask.get(2, 1), 255);
        assert_eq!(mask.get(3, 1), 255);
    }

    #[test]
    fn test_first_occurrence_wins_within_block() {
        // Flat block: candidate is the block origin.
        let img = Image::filled(3, 3, 7);
        let mask = suppress_to_mask(&img, 1);
        assert_eq!(mask.get(1, 1), 255);
        assert_eq!(mask.pixels().filter(|&(_, _, v)| v == 255).count(), 1);
    }

    #[test]
    fn test_border_never_a_candidate() {
        // Global max on the border is never a block member; it suppresses
        // the interior candidate instead of being marked itself.
        let mut img = Image::filled(5, 5, 1);
        img.set(0, 2, 250);
        let mask = suppress_to_mask(&img, 1);
        assert_eq!(mask.get(0, 2), 0);
    }

    #[test]
    fn test_output_not_cleared() {
        let img = Image::filled(3, 3, 0);
        let mut out = Image::filled(3, 3, 0);
        out.set(0, 0, 42);
        suppress(&img, &mut out, 1);
        assert_eq!(out.get(0, 0), 42);
    }

    #[test]
    fn test_image_too_small_marks_nothing() {
        let img = Image::filled(2, 9, 5);
        let mask = suppress_to_mask(&img, 1);
        assert!(mask.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_huge_radius_has_no_blocks() {
        assert_eq!(block_grid(100, 100, usize::MAX), (0, 0));
        assert_eq!(block_grid(100, 100, usize::MAX / 2), (0, 0));
        assert_eq!(block_grid(0, 7, 1), (0, 3));
        let img = Image::filled(9, 9, 3);
        let mask = suppress_to_mask(&img, usize::MAX / 2 + 1);
        assert!(mask.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    #[should_panic(expected = "radius")]
    fn test_zero_radius_panics() {
        block_grid(4, 4, 0);
    }

    #[test]
    #[should_panic(expected = "match input size")]
    fn test_mismatched_output_panics() {
        let img = Image::new(4, 4);
        let mut out = Image::new(3, 4);
        suppress(&img, &mut out, 1);
    }
}
