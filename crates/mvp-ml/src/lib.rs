#![deny(unsafe_code)]

//! Quantized tensor kernels for the MVP accelerator.
//!
//! Every kernel takes NHWC int8 tensors already resident in device memory,
//! splits the work into micro-programs that fit the accelerator's loop,
//! instruction and stride budgets, and runs them through an [`Mvp`] handle.
//!
//! | Kernel | Entry point |
//! |--------|-------------|
//! | Average pooling | [`average_pooling_s8`] |
//! | Max pooling | [`max_pooling_s8`] |
//! | Convolution | [`conv2d_s8`] |
//! | Transposed convolution | [`transpose_conv2d_s8`] |
//! | Elementwise | [`add_f16`], [`add_s8`], [`clamp_i8`] |
//!
//! Each has an `*_is_supported` twin that builds the same programs without
//! an engine and reports whether they fit. Execution proves the tiling the
//! same way before the first program starts, so an unsupported shape never
//! leaves a half-written output.
//!
//! # Example
//!
//! ```no_run
//! use mvp_ml::prelude::*;
//!
//! # fn main() -> mvp_driver::Result<()> {
//! let mut mvp = Mvp::software(1 << 16);
//! let input_shape = Shape::new(1, 8, 8, 4);
//! let output_shape = Shape::new(1, 4, 4, 4);
//! let input = mvp.memory_mut().alloc(input_shape.element_count(), 4)?;
//! let output = mvp.memory_mut().alloc(output_shape.element_count(), 4)?;
//!
//! let params = PoolingParams {
//!     input_shape,
//!     output_shape,
//!     window: Window::new(2, 2, 2, 2),
//!     activation: Activation::FULL,
//!     input,
//!     output,
//! };
//! max_pooling_s8(&mut mvp, &params, &KernelConfig::new())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod config;
mod conv;
mod exec;
mod packing;
mod params;
mod pooling;
mod quant;
mod shape;
pub mod tiling;
mod transpose_conv;
mod vector;

pub use config::{KernelConfig, DEFAULT_CLAMP_HOST_THRESHOLD, DEFAULT_MAX_AVG_FILTER_COUNT};
pub use conv::{conv2d_s8, conv2d_s8_is_supported, conv2d_scratch_size};
pub use packing::{pack_all, Layout};
pub use params::{
    Activation, AddS8Params, Conv2dParams, PoolingParams, Quantization, TransposeConv2dParams,
    Window,
};
pub use pooling::{
    area_ratio_policy, average_pooling_s8, average_pooling_s8_is_supported,
    average_pooling_s8_with, max_pooling_s8, max_pooling_s8_is_supported, GenericPooling,
    OptimizedPooling, PoolingKind, PoolingPolicy, PoolingStrategy,
};
pub use quant::{
    check_fp16, is_fp16_normal, saturate_i8, ACCUMULATOR_MULTIPLIER, ACCUMULATOR_SCALER,
    FP16_MAX, FP16_MIN_NORMAL,
};
pub use shape::Shape;
pub use transpose_conv::{
    transpose_conv2d_s8, transpose_conv2d_s8_is_supported, transpose_conv2d_scratch_size,
};
pub use vector::{
    add_f16, add_f16_is_supported, add_s8, add_s8_is_supported, clamp_i8, clamp_i8_is_supported,
};

pub use mvp_driver::Mvp;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        average_pooling_s8, conv2d_s8, max_pooling_s8, transpose_conv2d_s8, Activation,
        Conv2dParams, KernelConfig, PoolingParams, Quantization, Shape, TransposeConv2dParams,
        Window,
    };
    pub use mvp_driver::{Buffer, Mvp};
}
