//! Int8 transposed 2-D convolution.
//!
//! Runs in four phases on one fp16 accumulation buffer in scratch:
//!
//! 1. zero the accumulator (one fp16 per output element)
//! 2. prescale the input: `(input + input_offset) * 2^-10`
//! 3. scatter: for every input pixel, add `input x filter` into the part of
//!    the output window that lies inside the output
//! 4. requantize with the per-channel tables and store int8
//!
//! followed by the activation clamp.

use crate::config::KernelConfig;
use crate::conv::{Carver, ChannelTables};
use crate::exec;
use crate::packing::Layout;
use crate::params::{check_vector, TransposeConv2dParams};
use crate::tiling::channel_groups;
use crate::vector::{emit_clamp, emit_prescale, emit_zero_f16};
use mvp_driver::limits::MAX_LOOP_ITERATIONS;
use mvp_driver::{
    AluConfig, AluOp, ArrayId, Buffer, DataType, Dim, LoadConfig, Mvp, Reg, Result, Session,
    StoreConfig, Stream,
};
use tracing::{debug, info};

/// Scatter registers.
#[derive(Debug, Clone, Copy)]
enum ScatterReg {
    Acc,
    Input,
    Filter,
}

impl ScatterReg {
    const fn reg(self) -> Reg {
        match self {
            Self::Acc => Reg::R5,
            Self::Input => Reg::R6,
            Self::Filter => Reg::R7,
        }
    }
}

/// Requantization registers.
#[derive(Debug, Clone, Copy)]
enum FinishReg {
    Acc,
    Scale,
    Bias,
}

impl FinishReg {
    const fn reg(self) -> Reg {
        match self {
            Self::Acc => Reg::R0,
            Self::Scale => Reg::R1,
            Self::Bias => Reg::R2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scratch {
    scale: Buffer,
    bias: Buffer,
    acc: Buffer,
    prescaled: Buffer,
    size: usize,
}

impl Scratch {
    fn carve(scratch: Buffer, params: &TransposeConv2dParams) -> Self {
        let mut carver = Carver::new(scratch);
        let scale = carver.take_f16(params.output_shape.channels);
        let bias = carver.take_f16(params.output_shape.channels);
        let acc = carver.take_f16(params.output_shape.element_count());
        let prescaled = carver.take_f16(params.input_shape.element_count());
        Self {
            scale,
            bias,
            acc,
            prescaled,
            size: carver.used(),
        }
    }
}

/// Scratch bytes [`transpose_conv2d_s8`] needs for `params`: the two
/// per-channel tables, the fp16 accumulator and the prescaled input.
pub fn transpose_conv2d_scratch_size(params: &TransposeConv2dParams) -> usize {
    Scratch::carve(Buffer::new(0, 0), params).size
}

/// Transposed convolution of int8 NHWC input with an OHWI filter.
///
/// Output pixel `(oy, ox)` receives input pixel `(iy, ix)` through filter tap
/// `(oy + pad_h - iy * stride_h, ox + pad_w - ix * stride_w)`.
///
/// # Errors
///
/// `InvalidParameter` for malformed parameters or an undersized scratch
/// area; `InvalidRange` when a table value does not fit fp16 or a walk does
/// not fit the hardware.
pub fn transpose_conv2d_s8(
    mvp: &mut Mvp,
    params: &TransposeConv2dParams,
    config: &KernelConfig,
) -> Result<()> {
    check(params)?;
    info!(
        "transpose_conv2d_s8 {} * {} -> {}",
        params.input_shape, params.filter_shape, params.output_shape
    );
    exec::run(mvp, "transpose_conv2d_s8", |s| build(s, params, config))
}

/// True if [`transpose_conv2d_s8`] supports `params`.
pub fn transpose_conv2d_s8_is_supported(
    params: &TransposeConv2dParams,
    config: &KernelConfig,
) -> bool {
    check(params).is_ok() && exec::probe(|s| build(s, params, config)).is_ok()
}

fn check(params: &TransposeConv2dParams) -> Result<()> {
    params.validate()?;
    check_vector("scratch", params.scratch, transpose_conv2d_scratch_size(params) / 2, 2)
}

/// Taps `[start, end)` of a filter axis that land inside the output for
/// input coordinate `i`.
fn tap_range(i: usize, stride: usize, pad: usize, filter: usize, output: usize) -> (usize, usize) {
    let origin = i * stride;
    let start = pad.saturating_sub(origin).min(filter);
    let end = (output + pad).saturating_sub(origin).min(filter);
    (start, end.max(start))
}

fn build(
    session: &mut Session<'_>,
    params: &TransposeConv2dParams,
    config: &KernelConfig,
) -> Result<()> {
    let in_shape = params.input_shape;
    let filter_shape = params.filter_shape;
    let out_shape = params.output_shape;
    let window = params.window;
    let in_channels = in_shape.channels;
    let out_channels = out_shape.channels;

    let tables = ChannelTables::new(&params.quant)?;
    let scratch = Scratch::carve(params.scratch, params);
    tables.write(session, scratch.scale, scratch.bias)?;

    emit_zero_f16(session, config, scratch.acc, out_shape.element_count())?;
    emit_prescale(
        session,
        config,
        params.input,
        scratch.prescaled,
        in_shape.element_count(),
        params.quant.input_offset,
    )?;

    let groups = channel_groups(out_channels, filter_shape.image_elements());
    let mut scattered = 0usize;
    for batch in 0..in_shape.batches {
        for iy in 0..in_shape.height {
            let (fy0, fy1) = tap_range(
                iy,
                window.stride_height,
                window.pad_height,
                window.filter_height,
                out_shape.height,
            );
            for ix in 0..in_shape.width {
                let (fx0, fx1) = tap_range(
                    ix,
                    window.stride_width,
                    window.pad_width,
                    window.filter_width,
                    out_shape.width,
                );
                let (rows, cols) = (fy1 - fy0, fx1 - fx0);
                if rows == 0 || cols == 0 {
                    continue;
                }
                let oy0 = iy * window.stride_height + fy0 - window.pad_height;
                let ox0 = ix * window.stride_width + fx0 - window.pad_width;

                for &(first, count) in &groups {
                    let acc = Layout::new(
                        scratch.acc.at(2 * out_shape.offset(batch, oy0, ox0, first)),
                        DataType::Fp16,
                        [count, rows, cols],
                        [1, out_shape.row_elements(), out_channels],
                    );
                    let filter = Layout::new(
                        params.filter.at(filter_shape.offset(first, fy0, fx0, 0)),
                        DataType::Int8,
                        [count, rows, cols * in_channels],
                        [filter_shape.image_elements(), filter_shape.row_elements(), 1],
                    );
                    let input = Layout::new(
                        scratch.prescaled.at(2 * in_shape.offset(batch, iy, ix, 0)),
                        DataType::Fp16,
                        [1, 1, in_channels],
                        [0, 0, 1],
                    );

                    session.begin_program()?;
                    acc.configure(session, ArrayId::A0);
                    filter.configure(session, ArrayId::A1);
                    input.configure(session, ArrayId::A2);
                    emit_scatter(session, count, rows, cols, in_channels);
                    exec::issue(session, config)?;
                    scattered += 1;
                }
            }
        }
    }
    debug!("transpose_conv2d_s8: {scattered} scatter program(s)");

    emit_finish(session, config, params, &scratch)?;
    emit_clamp(
        session,
        config,
        params.output,
        out_shape.element_count(),
        params.activation,
    )
}

fn emit_scatter(
    session: &mut Session<'_>,
    channels: usize,
    rows: usize,
    cols: usize,
    in_channels: usize,
) {
    let acc = ScatterReg::Acc.reg();
    session.begin_loop(channels);
    session.begin_loop(rows);
    session.begin_loop(cols);
    session.compute(
        AluOp::Noop,
        AluConfig::new(),
        LoadConfig::one(Stream::new(acc, ArrayId::A0)),
        StoreConfig::NONE,
    );
    session.begin_loop(in_channels);
    session.compute(
        AluOp::Macr2a,
        AluConfig::new()
            .z(acc)
            .x(ScatterReg::Input.reg())
            .y(ScatterReg::Filter.reg())
            .a(acc),
        LoadConfig::two(
            Stream::new(ScatterReg::Input.reg(), ArrayId::A2).incr(Dim::Col),
            Stream::new(ScatterReg::Filter.reg(), ArrayId::A1).incr(Dim::Col),
        ),
        StoreConfig::NONE,
    );
    session.end_loop();
    session.compute(
        AluOp::Noop,
        AluConfig::new(),
        LoadConfig::NONE,
        StoreConfig::one(Stream::new(acc, ArrayId::A0).incr(Dim::Col)),
    );
    session.end_loop();
    session.postloop_incr_dim(ArrayId::A0, Dim::Row);
    session.postloop_incr_dim(ArrayId::A1, Dim::Row);
    session.end_loop();
    session.postloop_incr_dim(ArrayId::A0, Dim::Vec);
    session.postloop_incr_dim(ArrayId::A1, Dim::Vec);
    session.end_loop();
}

/// `output = int8(acc * scale[oc] + bias[oc])`, in blocks of whole pixels.
fn emit_finish(
    session: &mut Session<'_>,
    config: &KernelConfig,
    params: &TransposeConv2dParams,
    scratch: &Scratch,
) -> Result<()> {
    let channels = params.output_shape.channels;
    let pixels = params.output_shape.element_count() / channels;
    let table = |buffer: Buffer| {
        Layout::new(buffer.addr, DataType::Fp16, [1, 1, channels], [0, 0, 1])
    };
    let mut first = 0;
    while first < pixels {
        let rows = (pixels - first).min(MAX_LOOP_ITERATIONS);
        let acc = Layout::new(
            scratch.acc.at(2 * first * channels),
            DataType::Fp16,
            [1, rows, channels],
            [0, channels, 1],
        );
        let output = Layout::new(
            params.output.at(first * channels),
            DataType::Int8,
            [1, rows, channels],
            [0, channels, 1],
        );

        session.begin_program()?;
        acc.configure(session, ArrayId::A0);
        table(scratch.scale).configure(session, ArrayId::A1);
        table(scratch.bias).configure(session, ArrayId::A2);
        output.configure(session, ArrayId::A3);
        session.begin_loop(rows);
        session.begin_loop(channels);
        session.compute(
            AluOp::Mulr2a,
            AluConfig::new()
                .z(FinishReg::Acc.reg())
                .x(FinishReg::Acc.reg())
                .y(FinishReg::Scale.reg()),
            LoadConfig::two(
                Stream::new(FinishReg::Acc.reg(), ArrayId::A0).incr(Dim::Col),
                Stream::new(FinishReg::Scale.reg(), ArrayId::A1).incr(Dim::Col),
            ),
            StoreConfig::NONE,
        );
        session.compute(
            AluOp::Addc,
            AluConfig::new()
                .z(FinishReg::Acc.reg())
                .x(FinishReg::Acc.reg())
                .a(FinishReg::Bias.reg()),
            LoadConfig::one(Stream::new(FinishReg::Bias.reg(), ArrayId::A2).incr(Dim::Col)),
            StoreConfig::one(Stream::new(FinishReg::Acc.reg(), ArrayId::A3).incr(Dim::Col)),
        );
        session.end_loop();
        session.postloop_incr_dim(ArrayId::A0, Dim::Row);
        session.postloop_incr_dim(ArrayId::A3, Dim::Row);
        session.end_loop();
        exec::issue(session, config)?;
        first += rows;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Activation, Quantization, Window};
    use crate::shape::Shape;
    use mvp_driver::ProgramContext;

    fn params() -> TransposeConv2dParams {
        let input = Shape::new(1, 2, 2, 3);
        let filter = Shape::new(2, 2, 2, 3);
        let output = Shape::new(1, 4, 4, 2);
        TransposeConv2dParams {
            input_shape: input,
            filter_shape: filter,
            output_shape: output,
            window: Window::new(2, 2, 2, 2),
            quant: Quantization::uniform(2, 0.25),
            activation: Activation::FULL,
            input: Buffer::new(0x1000, input.element_count()),
            filter: Buffer::new(0x2000, filter.element_count()),
            output: Buffer::new(0x3000, output.element_count()),
            scratch: Buffer::new(0x4000, 0x400),
        }
    }

    #[test]
    fn test_tap_range() {
        // Stride 2, 3 taps, pad 1, 4 outputs.
        assert_eq!(tap_range(0, 2, 1, 3, 4), (1, 3));
        assert_eq!(tap_range(1, 2, 1, 3, 4), (0, 3));
        assert_eq!(tap_range(2, 2, 1, 3, 4), (0, 1));
        assert_eq!(tap_range(3, 2, 1, 3, 4), (0, 0));
    }

    #[test]
    fn test_scratch_size() {
        // Tables 2 x 4 bytes, accumulator 32 x 2, prescaled input 12 x 2.
        assert_eq!(transpose_conv2d_scratch_size(&params()), 8 + 64 + 24);
    }

    #[test]
    fn test_supported() {
        assert!(transpose_conv2d_s8_is_supported(&params(), &KernelConfig::default()));
        let mut small = params();
        small.scratch = Buffer::new(0x4000, 16);
        assert!(!transpose_conv2d_s8_is_supported(&small, &KernelConfig::default()));
    }

    #[test]
    fn test_scatter_program_shape() {
        let mut ctx = ProgramContext::new();
        let mut session = Session::probe(&mut ctx);
        session.begin_program().unwrap();
        emit_scatter(&mut session, 2, 2, 2, 3);
        session.execute_program().unwrap();
        let program = session.program();
        assert_eq!(program.instr_count, 3);
        assert_eq!(program.loop_count, 4);
        assert_eq!(program.loops()[3].iterations, 3);
    }
}
