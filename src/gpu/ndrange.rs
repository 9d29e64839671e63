// gpu/ndrange.rs — 1–3 dimensional dispatch shapes.
//
// An `NdRange` is used twice per dispatch:
//   global — total number of work items per dimension,
//   local  — work items per work-group (wgpu: `@workgroup_size`).
//
// wgpu dispatches whole work-groups (`dispatch_workgroups(gx, gy, gz)`), so a
// global range is only expressible when each dimension is an exact multiple
// of the local one. `validate_local` enforces that on the host before any
// backend call; `auto_local` picks a shape that always divides.

use std::fmt;

use crate::gpu::error::{Error, Result};

/// Immutable 1D, 2D or 3D dispatch shape.
///
/// Unused trailing dimensions are stored as 1 so `extent()` can be passed to
/// wgpu directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    dims: usize,
    sizes: [usize; 3],
}

impl NdRange {
    pub fn d1(x: usize) -> Self {
        NdRange { dims: 1, sizes: [x, 1, 1] }
    }

    pub fn d2(x: usize, y: usize) -> Self {
        NdRange { dims: 2, sizes: [x, y, 1] }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        NdRange { dims: 3, sizes: [x, y, z] }
    }

    /// Number of dimensions (1..=3).
    #[inline]
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Sizes of the used dimensions; length == `dims()`.
    #[inline]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes[..self.dims]
    }

    /// All three sizes, unused dimensions set to 1.
    #[inline]
    pub fn extent(&self) -> [usize; 3] {
        self.sizes
    }

    /// Total number of work items.
    pub fn total(&self) -> usize {
        self.sizes().iter().product()
    }

    /// True when `other` has the same dimensionality and divides every
    /// dimension of `self` exactly. A zero in `other` never divides.
    pub fn divisible_by(&self, other: &NdRange) -> bool {
        self.dims == other.dims
            && self
                .sizes()
                .iter()
                .zip(other.sizes())
                .all(|(&g, &l)| l != 0 && g % l == 0)
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.sizes())
    }
}

/// Check an explicit local range against a global range.
///
/// # Errors
/// `DimensionMismatch` if the dimensionalities differ, `IndivisibleRange` if
/// any global size is not a multiple of the local size.
pub fn validate_local(global: &NdRange, local: &NdRange) -> Result<()> {
    if global.dims() != local.dims() {
        return Err(Error::DimensionMismatch {
            global: global.dims(),
            local: local.dims(),
        });
    }
    if !global.divisible_by(local) {
        return Err(Error::IndivisibleRange {
            global: *global,
            local: *local,
        });
    }
    Ok(())
}

/// Preferred work-group shape when the caller does not choose one.
///
/// 16×8 for 2D is 128 invocations: four 32-wide warps or two 64-wide
/// wavefronts. 1D and 3D keep a similar budget.
pub fn preferred_local(dims: usize) -> [usize; 3] {
    match dims {
        1 => [64, 1, 1],
        2 => [16, 8, 1],
        _ => [8, 4, 4],
    }
}

/// Choose a local range for `global`: per dimension, the largest divisor of
/// the global size not exceeding `min(preferred, max_size)`, with the total
/// kept within `max_invocations`.
///
/// The result always satisfies `validate_local(global, &result)` for
/// non-zero global sizes.
pub fn auto_local(global: &NdRange, max_size: [usize; 3], max_invocations: usize) -> NdRange {
    let preferred = preferred_local(global.dims());
    let mut local = [1usize; 3];
    let mut budget = max_invocations.max(1);
    for d in 0..global.dims() {
        let cap = preferred[d].min(max_size[d]).min(budget).max(1);
        local[d] = largest_divisor_at_most(global.extent()[d], cap);
        budget /= local[d];
    }
    NdRange {
        dims: global.dims(),
        sizes: local,
    }
}

fn largest_divisor_at_most(n: usize, cap: usize) -> usize {
    if n == 0 {
        return 1;
    }
    (1..=cap.min(n)).rev().find(|d| n % d == 0).unwrap_or(1)
}
