//! Hardware limits of the MVP.
//!
//! All counts come from the register map: 8 ALU registers, 5 array
//! descriptors, 8 loop counters and 8 instruction slots. Size and iteration
//! fields are 10 bits wide and hold `value - 1`; strides are 12-bit signed.

/// Number of ALU registers (`R0`..`R7`).
pub const NUM_REGISTERS: usize = 8;

/// Number of array descriptors.
pub const NUM_ARRAYS: usize = 5;

/// Number of loop counters.
pub const NUM_LOOPS: usize = 8;

/// Number of instruction slots.
pub const NUM_INSTRUCTIONS: usize = 8;

/// Number of dimensions per array descriptor.
pub const NUM_DIMS: usize = 3;

/// Largest element count of one array dimension (10-bit `SIZE` field + 1).
pub const MAX_DIM_SIZE: usize = 1024;

/// Largest loop iteration count (10-bit `NUMITERS` field + 1).
pub const MAX_LOOP_ITERATIONS: usize = 1024;

/// Largest positive stride (12-bit signed `STRIDE` field).
pub const MAX_STRIDE: i32 = 2047;

/// Most negative stride.
pub const MIN_STRIDE: i32 = -2048;

/// Returns true if `stride` fits the signed stride field.
#[must_use]
pub const fn stride_in_range(stride: i32) -> bool {
    stride >= MIN_STRIDE && stride <= MAX_STRIDE
}

/// Returns true if `size` fits a dimension size field.
#[must_use]
pub const fn dim_size_in_range(size: usize) -> bool {
    size >= 1 && size <= MAX_DIM_SIZE
}
