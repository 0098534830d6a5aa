//! Kernel parameter blocks.
//!
//! Parameters describe one tensor operation. Tensors live in device memory
//! and are referenced by [`Buffer`] handles; per-channel quantization data
//! stays on the host and is turned into fp16 tables by the kernels. No
//! kernel mutates its parameters.

use crate::shape::Shape;
use mvp_driver::{Buffer, MvpError, Result};

/// Output activation clamp, inclusive, in the int8 domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Lower bound.
    pub min: i32,
    /// Upper bound.
    pub max: i32,
}

impl Activation {
    /// The whole int8 range; no clamp is emitted.
    pub const FULL: Self = Self { min: -128, max: 127 };

    /// Clamp to `[min, max]`.
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// True if the clamp is a no-op for int8 outputs.
    pub const fn is_full_range(&self) -> bool {
        self.min <= -128 && self.max >= 127
    }

    /// Clamp one value.
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(&self, value: i8) -> i8 {
        i32::from(value).clamp(self.min, self.max) as i8
    }

    /// # Errors
    ///
    /// `InvalidParameter` if `min > max` or a bound lies outside int8.
    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(MvpError::invalid_parameter(format!(
                "activation min {} exceeds max {}",
                self.min, self.max
            )));
        }
        if self.min < -128 || self.max > 127 {
            return Err(MvpError::invalid_parameter(format!(
                "activation [{}, {}] outside int8",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

impl Default for Activation {
    fn default() -> Self {
        Self::FULL
    }
}

/// Spatial window of a pooling or convolution operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Filter height.
    pub filter_height: usize,
    /// Filter width.
    pub filter_width: usize,
    /// Vertical stride.
    pub stride_height: usize,
    /// Horizontal stride.
    pub stride_width: usize,
    /// Vertical dilation (1 = dense).
    pub dilation_height: usize,
    /// Horizontal dilation (1 = dense).
    pub dilation_width: usize,
    /// Rows of implicit zero padding above the input.
    pub pad_height: usize,
    /// Columns of implicit zero padding left of the input.
    pub pad_width: usize,
    /// Padding allowed at all; when false both pads must be zero.
    pub padding: bool,
}

impl Window {
    /// Dense, unpadded `filter_h x filter_w` window moving by `stride_h x stride_w`.
    pub const fn new(
        filter_height: usize,
        filter_width: usize,
        stride_height: usize,
        stride_width: usize,
    ) -> Self {
        Self {
            filter_height,
            filter_width,
            stride_height,
            stride_width,
            dilation_height: 1,
            dilation_width: 1,
            pad_height: 0,
            pad_width: 0,
            padding: false,
        }
    }

    /// Enable padding with the given top/left pads.
    #[must_use]
    pub const fn with_padding(mut self, pad_height: usize, pad_width: usize) -> Self {
        self.pad_height = pad_height;
        self.pad_width = pad_width;
        self.padding = true;
        self
    }

    /// Set the dilation.
    #[must_use]
    pub const fn with_dilation(mut self, dilation_height: usize, dilation_width: usize) -> Self {
        self.dilation_height = dilation_height;
        self.dilation_width = dilation_width;
        self
    }

    /// # Errors
    ///
    /// `InvalidParameter` for zero filter/stride/dilation or for pads given
    /// while padding is disabled.
    pub fn validate(&self) -> Result<()> {
        if self.filter_height == 0 || self.filter_width == 0 {
            return Err(MvpError::invalid_parameter("filter dimensions must be non-zero"));
        }
        if self.stride_height == 0 || self.stride_width == 0 {
            return Err(MvpError::invalid_parameter("strides must be non-zero"));
        }
        if self.dilation_height == 0 || self.dilation_width == 0 {
            return Err(MvpError::invalid_parameter("dilation must be non-zero"));
        }
        if !self.padding && (self.pad_height != 0 || self.pad_width != 0) {
            return Err(MvpError::invalid_parameter(format!(
                "padding disabled but pad is {}x{}",
                self.pad_height, self.pad_width
            )));
        }
        Ok(())
    }
}

fn check_buffer(name: &str, buffer: Buffer, bytes: usize) -> Result<()> {
    if buffer.len < bytes {
        return Err(MvpError::invalid_parameter(format!(
            "{name} buffer holds {} bytes, {bytes} required",
            buffer.len
        )));
    }
    Ok(())
}

fn check_shape(name: &str, shape: &Shape) -> Result<()> {
    if !shape.is_populated() {
        return Err(MvpError::invalid_parameter(format!(
            "{name} shape {shape} has a zero dimension"
        )));
    }
    Ok(())
}

// ── Pooling ──────────────────────────────────────────────────────────────────

/// Average or max pooling over int8 NHWC tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolingParams {
    /// Input shape.
    pub input_shape: Shape,
    /// Output shape; batches and channels must match the input.
    pub output_shape: Shape,
    /// Pooling window. Dilation must be 1.
    pub window: Window,
    /// Output clamp.
    pub activation: Activation,
    /// Input tensor (int8).
    pub input: Buffer,
    /// Output tensor (int8).
    pub output: Buffer,
}

impl PoolingParams {
    /// Channel count.
    pub const fn channels(&self) -> usize {
        self.input_shape.channels
    }

    /// # Errors
    ///
    /// `InvalidParameter` for inconsistent shapes, undersized buffers, a bad
    /// window or a bad activation range.
    pub fn validate(&self) -> Result<()> {
        check_shape("input", &self.input_shape)?;
        check_shape("output", &self.output_shape)?;
        self.window.validate()?;
        self.activation.validate()?;
        if self.window.dilation_height != 1 || self.window.dilation_width != 1 {
            return Err(MvpError::invalid_parameter("pooling does not dilate"));
        }
        if self.input_shape.batches != self.output_shape.batches
            || self.input_shape.channels != self.output_shape.channels
        {
            return Err(MvpError::invalid_parameter(format!(
                "input {} and output {} disagree on batches or channels",
                self.input_shape, self.output_shape
            )));
        }
        check_buffer("input", self.input, self.input_shape.element_count())?;
        check_buffer("output", self.output, self.output_shape.element_count())
    }
}

// ── Convolution ──────────────────────────────────────────────────────────────

/// Per-tensor and per-channel quantization of a convolution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Quantization {
    /// Added to every input value before multiplication.
    pub input_offset: i32,
    /// Added to every output value after scaling.
    pub output_offset: i32,
    /// Real-valued requantization factor per output channel.
    pub output_multiplier: Vec<f32>,
    /// int32 bias per output channel, in accumulator units.
    pub bias: Vec<i32>,
}

impl Quantization {
    /// Uniform multiplier and zero bias for `channels` outputs.
    pub fn uniform(channels: usize, multiplier: f32) -> Self {
        Self {
            input_offset: 0,
            output_offset: 0,
            output_multiplier: vec![multiplier; channels],
            bias: vec![0; channels],
        }
    }

    fn validate(&self, channels: usize) -> Result<()> {
        if self.output_multiplier.len() != channels || self.bias.len() != channels {
            return Err(MvpError::invalid_parameter(format!(
                "quantization holds {} multipliers and {} biases for {channels} output channels",
                self.output_multiplier.len(),
                self.bias.len()
            )));
        }
        Ok(())
    }
}

/// 2-D convolution over int8 NHWC tensors with an OHWI filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dParams {
    /// Input shape `[N, H, W, Cin]`.
    pub input_shape: Shape,
    /// Filter shape `[Cout, fh, fw, Cin]`.
    pub filter_shape: Shape,
    /// Output shape `[N, OH, OW, Cout]`.
    pub output_shape: Shape,
    /// Convolution window; filter size must match `filter_shape`.
    pub window: Window,
    /// Offsets, multipliers and bias.
    pub quant: Quantization,
    /// Output clamp.
    pub activation: Activation,
    /// Input tensor (int8).
    pub input: Buffer,
    /// Filter tensor (int8).
    pub filter: Buffer,
    /// Output tensor (int8).
    pub output: Buffer,
    /// Scratch area, at least [`crate::conv2d_scratch_size`] bytes.
    pub scratch: Buffer,
}

impl Conv2dParams {
    /// # Errors
    ///
    /// `InvalidParameter` for inconsistent shapes or undersized buffers.
    pub fn validate(&self) -> Result<()> {
        validate_conv_shapes(
            &self.input_shape,
            &self.filter_shape,
            &self.output_shape,
            &self.window,
        )?;
        self.activation.validate()?;
        self.quant.validate(self.output_shape.channels)?;
        check_buffer("input", self.input, self.input_shape.element_count())?;
        check_buffer("filter", self.filter, self.filter_shape.element_count())?;
        check_buffer("output", self.output, self.output_shape.element_count())
    }
}

/// Transposed 2-D convolution over int8 NHWC tensors with an OHWI filter.
#[derive(Debug, Clone, PartialEq)]
pub struct TransposeConv2dParams {
    /// Input shape `[N, H, W, Cin]`.
    pub input_shape: Shape,
    /// Filter shape `[Cout, fh, fw, Cin]`.
    pub filter_shape: Shape,
    /// Output shape `[N, OH, OW, Cout]`.
    pub output_shape: Shape,
    /// Stride and padding of the equivalent forward convolution. Dilation
    /// must be 1.
    pub window: Window,
    /// Offsets, multipliers and bias.
    pub quant: Quantization,
    /// Output clamp.
    pub activation: Activation,
    /// Input tensor (int8).
    pub input: Buffer,
    /// Filter tensor (int8).
    pub filter: Buffer,
    /// Output tensor (int8).
    pub output: Buffer,
    /// Scratch area, at least [`crate::transpose_conv2d_scratch_size`] bytes.
    pub scratch: Buffer,
}

impl TransposeConv2dParams {
    /// # Errors
    ///
    /// `InvalidParameter` for inconsistent shapes or undersized buffers.
    pub fn validate(&self) -> Result<()> {
        validate_conv_shapes(
            &self.input_shape,
            &self.filter_shape,
            &self.output_shape,
            &self.window,
        )?;
        if self.window.dilation_height != 1 || self.window.dilation_width != 1 {
            return Err(MvpError::invalid_parameter("transposed convolution does not dilate"));
        }
        self.activation.validate()?;
        self.quant.validate(self.output_shape.channels)?;
        check_buffer("input", self.input, self.input_shape.element_count())?;
        check_buffer("filter", self.filter, self.filter_shape.element_count())?;
        check_buffer("output", self.output, self.output_shape.element_count())
    }
}

fn validate_conv_shapes(
    input: &Shape,
    filter: &Shape,
    output: &Shape,
    window: &Window,
) -> Result<()> {
    check_shape("input", input)?;
    check_shape("filter", filter)?;
    check_shape("output", output)?;
    window.validate()?;
    if input.batches != output.batches {
        return Err(MvpError::invalid_parameter(format!(
            "input {input} and output {output} disagree on batches"
        )));
    }
    if filter.channels != input.channels || filter.batches != output.channels {
        return Err(MvpError::invalid_parameter(format!(
            "filter {filter} does not map {} to {} channels",
            input.channels, output.channels
        )));
    }
    if filter.height != window.filter_height || filter.width != window.filter_width {
        return Err(MvpError::invalid_parameter(format!(
            "filter {filter} does not match a {}x{} window",
            window.filter_height, window.filter_width
        )));
    }
    Ok(())
}

// ── Elementwise ──────────────────────────────────────────────────────────────

/// Quantized int8 addition `out = (a + a_off) * a_mult + (b + b_off) * b_mult + out_off`.
#[derive(Debug, Clone, PartialEq)]
pub struct AddS8Params {
    /// First operand (int8).
    pub input1: Buffer,
    /// Second operand (int8).
    pub input2: Buffer,
    /// Result (int8); may alias either input.
    pub output: Buffer,
    /// Element count.
    pub len: usize,
    /// Offset added to the first operand.
    pub input1_offset: i32,
    /// Scale of the first operand.
    pub input1_multiplier: f32,
    /// Offset added to the second operand.
    pub input2_offset: i32,
    /// Scale of the second operand.
    pub input2_multiplier: f32,
    /// Offset added to the scaled sum.
    pub output_offset: i32,
    /// Output clamp.
    pub activation: Activation,
}

impl AddS8Params {
    /// Unit multipliers, zero offsets, no clamp.
    pub const fn new(input1: Buffer, input2: Buffer, output: Buffer, len: usize) -> Self {
        Self {
            input1,
            input2,
            output,
            len,
            input1_offset: 0,
            input1_multiplier: 1.0,
            input2_offset: 0,
            input2_multiplier: 1.0,
            output_offset: 0,
            activation: Activation::FULL,
        }
    }

    /// # Errors
    ///
    /// `InvalidParameter` for undersized buffers or a bad activation range.
    pub fn validate(&self) -> Result<()> {
        self.activation.validate()?;
        check_buffer("input1", self.input1, self.len)?;
        check_buffer("input2", self.input2, self.len)?;
        check_buffer("output", self.output, self.len)
    }
}

/// Require `buffer` to hold `len` elements of `element_bytes` each, aligned
/// to the element size.
pub(crate) fn check_vector(
    name: &str,
    buffer: Buffer,
    len: usize,
    element_bytes: usize,
) -> Result<()> {
    check_buffer(name, buffer, len * element_bytes)?;
    if buffer.addr as usize % element_bytes != 0 {
        return Err(MvpError::invalid_parameter(format!(
            "{name} buffer at {:#010x} is not {element_bytes}-byte aligned",
            buffer.addr
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvp_driver::ErrorKind;

    fn pooling() -> PoolingParams {
        PoolingParams {
            input_shape: Shape::new(1, 4, 4, 2),
            output_shape: Shape::new(1, 2, 2, 2),
            window: Window::new(2, 2, 2, 2),
            activation: Activation::FULL,
            input: Buffer::new(0x100, 32),
            output: Buffer::new(0x200, 8),
        }
    }

    #[test]
    fn test_valid_pooling() {
        pooling().validate().unwrap();
    }

    #[test]
    fn test_pad_without_padding_rejected() {
        let mut p = pooling();
        p.window.pad_height = 1;
        assert_eq!(p.validate().unwrap_err().kind(), ErrorKind::InvalidParameter);
        p.window.padding = true;
        p.validate().unwrap();
    }

    #[test]
    fn test_inverted_activation_rejected() {
        let mut p = pooling();
        p.activation = Activation::new(5, -5);
        assert_eq!(p.validate().unwrap_err().kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut p = pooling();
        p.output.len = 7;
        assert_eq!(p.validate().unwrap_err().kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_activation_apply() {
        let a = Activation::new(-10, 20);
        assert!(!a.is_full_range());
        assert!(Activation::FULL.is_full_range());
        assert_eq!(a.apply(-100), -10);
        assert_eq!(a.apply(100), 20);
        assert_eq!(a.apply(3), 3);
    }

    #[test]
    fn test_conv_channel_mismatch_rejected() {
        let params = Conv2dParams {
            input_shape: Shape::new(1, 3, 3, 2),
            filter_shape: Shape::new(4, 3, 3, 3),
            output_shape: Shape::new(1, 1, 1, 4),
            window: Window::new(3, 3, 1, 1),
            quant: Quantization::uniform(4, 1.0),
            activation: Activation::FULL,
            input: Buffer::new(0, 18),
            filter: Buffer::new(0, 108),
            output: Buffer::new(0, 4),
            scratch: Buffer::new(0, 0),
        };
        assert_eq!(params.validate().unwrap_err().kind(), ErrorKind::InvalidParameter);
    }
}
