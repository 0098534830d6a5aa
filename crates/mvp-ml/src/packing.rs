//! Parallel lane packing.
//!
//! Two adjacent 8-bit (or fp16) elements can be walked as one complex
//! element, so every ALU operation handles both lanes at once. That only
//! works when the walk's base address is aligned to the pair and every
//! stride actually used lands on a pair boundary. [`Layout::packed`]
//! checks that for one buffer; kernels check each buffer of each tile on
//! its own and fall back to the real walk when any required buffer fails.

use mvp_driver::{ArrayId, DataType, Dim, ProgramContext};

/// Saturating conversion of an element stride to the builder's stride type.
///
/// Out-of-range values are rejected by the array descriptor.
pub(crate) fn to_stride(elements: usize) -> i32 {
    i32::try_from(elements).unwrap_or(i32::MAX)
}

/// A buffer walk as configured into one array slot.
///
/// Sizes and strides are `[vec, row, col]`, strides in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Address of the first element.
    pub base: u32,
    /// Element type.
    pub dtype: DataType,
    /// Elements per dimension.
    pub sizes: [usize; 3],
    /// Element stride per dimension.
    pub strides: [usize; 3],
}

impl Layout {
    /// Real-valued walk.
    pub const fn new(base: u32, dtype: DataType, sizes: [usize; 3], strides: [usize; 3]) -> Self {
        Self {
            base,
            dtype,
            sizes,
            strides,
        }
    }

    /// True if this walk reads lane pairs.
    pub const fn is_packed(&self) -> bool {
        self.dtype.is_complex()
    }

    /// The paired-lane form of this walk, if alignment allows it.
    ///
    /// With `along = Some(dim)` the pairs are adjacent elements of that
    /// dimension, which must be contiguous and of even length; its size
    /// halves. With `None` every element is paired with its successor in
    /// memory (e.g. the next channel) and sizes stay as they are. Strides of
    /// the other used dimensions must be even and are halved.
    pub fn packed(&self, along: Option<Dim>) -> Option<Self> {
        if self.is_packed() {
            return None;
        }
        let pair_bytes = 2 * self.dtype.lane_bytes();
        if self.base as usize % pair_bytes != 0 {
            return None;
        }
        let mut sizes = self.sizes;
        let mut strides = self.strides;
        for dim in Dim::ALL {
            let d = dim.index();
            if along == Some(dim) {
                if strides[d] != 1 || sizes[d] % 2 != 0 {
                    return None;
                }
                sizes[d] /= 2;
            } else {
                if sizes[d] > 1 && strides[d] % 2 != 0 {
                    return None;
                }
                strides[d] /= 2;
            }
        }
        Some(Self {
            base: self.base,
            dtype: self.dtype.to_complex(),
            sizes,
            strides,
        })
    }

    /// Write this walk into array slot `id` of the program being built.
    ///
    /// Dimensions of size 1 never move, so their strides are written as 0.
    pub fn configure(&self, ctx: &mut ProgramContext, id: ArrayId) {
        let strides = std::array::from_fn(|d| {
            if self.sizes[d] > 1 {
                to_stride(self.strides[d])
            } else {
                0
            }
        });
        ctx.config_array(id, self.base, self.dtype, self.sizes, strides);
    }
}

/// Pack every walk or none of them.
///
/// Buffers combined lane by lane in one ALU operation must agree on
/// packing.
pub fn pack_all<const N: usize>(walks: [(Layout, Option<Dim>); N]) -> Option<[Layout; N]> {
    let mut packed = walks.map(|(layout, _)| layout);
    for (slot, (layout, along)) in packed.iter_mut().zip(walks) {
        *slot = layout.packed(along)?;
    }
    Some(packed)
}
