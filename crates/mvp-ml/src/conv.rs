//! Int8 2-D convolution.
//!
//! Each tile program walks
//!
//! ```text
//! A0 input    vec: out_x (or out_y)   row: filter rows   col: filter cols x Cin
//! A1 filter   vec: out channel        row: filter rows   col: filter cols x Cin
//! A2 scale    vec: out channel        (fp16 table in scratch)
//! A3 bias     vec: out channel        (fp16 table in scratch)
//! A4 output   vec: out_y              row: out_x         col: out channel
//! ```
//!
//! and accumulates `(input + input_offset) * 2^-10 * filter` in fp16. The
//! per-channel tables fold the requantization into one multiply-add:
//! `acc * scale[oc] + bias[oc]`, stored with int8 saturation.

use crate::config::KernelConfig;
use crate::exec;
use crate::packing::{pack_all, Layout};
use crate::params::{check_vector, Conv2dParams, Quantization};
use crate::quant::{check_fp16, ACCUMULATOR_MULTIPLIER, ACCUMULATOR_SCALER};
use crate::tiling::{self, channel_groups, emit_output_skip, emit_skip, Axis, Tile};
use crate::vector::{emit_clamp, emit_prescale};
use half::f16;
use mvp_driver::{
    AluConfig, AluOp, ArrayId, Buffer, DataType, Dim, LoadConfig, Mvp, MvpError, ProgramContext,
    Reg, Result, Session, StoreConfig, Stream,
};
use tracing::{debug, info};

/// Convolution registers.
///
/// | reg | use                                  |
/// |-----|--------------------------------------|
/// | R0  | accumulator scaler                   |
/// | R1  | `input_offset * scaler`              |
/// | R2  | channel scale (loaded from A2)       |
/// | R3  | channel bias (loaded from A3)        |
/// | R5  | accumulator                          |
/// | R6  | streamed input                       |
/// | R7  | streamed filter                      |
#[derive(Debug, Clone, Copy)]
enum ConvReg {
    Scaler,
    Offset,
    Scale,
    Bias,
    Acc,
    Input,
    Filter,
}

impl ConvReg {
    const fn reg(self) -> Reg {
        match self {
            Self::Scaler => Reg::R0,
            Self::Offset => Reg::R1,
            Self::Scale => Reg::R2,
            Self::Bias => Reg::R3,
            Self::Acc => Reg::R5,
            Self::Input => Reg::R6,
            Self::Filter => Reg::R7,
        }
    }
}

// ── Scratch ──────────────────────────────────────────────────────────────────

/// Hands out consecutive scratch segments, each starting 4-byte aligned
/// relative to the scratch base.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Carver {
    base: Buffer,
    used: usize,
}

impl Carver {
    pub(crate) const fn new(base: Buffer) -> Self {
        Self { base, used: 0 }
    }

    /// Carve `elements` fp16 values.
    pub(crate) fn take_f16(&mut self, elements: usize) -> Buffer {
        let bytes = 2 * elements;
        let segment = self.base.slice(self.used, bytes);
        self.used += bytes.next_multiple_of(4);
        segment
    }

    /// Bytes carved so far.
    pub(crate) const fn used(&self) -> usize {
        self.used
    }
}

/// Per-output-channel requantization tables.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelTables {
    /// `output_multiplier * ACCUMULATOR_MULTIPLIER`.
    pub scale: Vec<f16>,
    /// `bias * output_multiplier + output_offset`.
    pub bias: Vec<f16>,
}

impl ChannelTables {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn new(quant: &Quantization) -> Result<Self> {
        let scale = quant
            .output_multiplier
            .iter()
            .map(|m| check_fp16(m * ACCUMULATOR_MULTIPLIER, "channel scale"))
            .collect::<Result<Vec<_>>>()?;
        let bias = quant
            .output_multiplier
            .iter()
            .zip(&quant.bias)
            .map(|(m, b)| {
                check_fp16(*b as f32 * m + quant.output_offset as f32, "channel bias")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scale, bias })
    }

    /// Write both tables before any program that reads them is issued.
    pub(crate) fn write(
        &self,
        session: &mut Session<'_>,
        scale: Buffer,
        bias: Buffer,
    ) -> Result<()> {
        if let Some(memory) = session.memory_mut() {
            memory.write_f16(scale, &self.scale)?;
            memory.write_f16(bias, &self.bias)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvScratch {
    scale: Buffer,
    bias: Buffer,
    prescaled: Option<Buffer>,
    size: usize,
}

impl ConvScratch {
    fn carve(scratch: Buffer, params: &Conv2dParams, config: &KernelConfig) -> Self {
        let mut carver = Carver::new(scratch);
        let channels = params.output_shape.channels;
        let scale = carver.take_f16(channels);
        let bias = carver.take_f16(channels);
        let prescaled = config
            .optimize_for_speed
            .then(|| carver.take_f16(params.input_shape.element_count()));
        Self {
            scale,
            bias,
            prescaled,
            size: carver.used(),
        }
    }
}

/// Scratch bytes [`conv2d_s8`] needs for `params` under `config`.
///
/// Two fp16 tables of one entry per output channel, plus an fp16 copy of the
/// input when `optimize_for_speed` is set.
pub fn conv2d_scratch_size(params: &Conv2dParams, config: &KernelConfig) -> usize {
    ConvScratch::carve(Buffer::new(0, 0), params, config).size
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// 2-D convolution of int8 NHWC input with an OHWI filter.
///
/// # Errors
///
/// `InvalidParameter` for malformed parameters or an undersized scratch
/// area; `InvalidRange` when a table value does not fit fp16 or the tiling
/// does not fit the hardware.
pub fn conv2d_s8(mvp: &mut Mvp, params: &Conv2dParams, config: &KernelConfig) -> Result<()> {
    check(params, config)?;
    info!(
        "conv2d_s8 {} * {} -> {}{}",
        params.input_shape,
        params.filter_shape,
        params.output_shape,
        if config.optimize_for_speed { " (prescaled)" } else { "" }
    );
    exec::run(mvp, "conv2d_s8", |s| build(s, params, config))
}

/// True if [`conv2d_s8`] supports `params` under `config`.
pub fn conv2d_s8_is_supported(params: &Conv2dParams, config: &KernelConfig) -> bool {
    check(params, config).is_ok() && exec::probe(|s| build(s, params, config)).is_ok()
}

fn check(params: &Conv2dParams, config: &KernelConfig) -> Result<()> {
    params.validate()?;
    check_vector("scratch", params.scratch, conv2d_scratch_size(params, config) / 2, 2)
}

// ── Emission ─────────────────────────────────────────────────────────────────

#[allow(clippy::cast_precision_loss)]
fn build(session: &mut Session<'_>, params: &Conv2dParams, config: &KernelConfig) -> Result<()> {
    let in_shape = params.input_shape;
    let filter_shape = params.filter_shape;
    let out_shape = params.output_shape;
    let window = params.window;
    let in_channels = in_shape.channels;
    let out_channels = out_shape.channels;

    if window.dilation_width > 1 && in_channels != 1 {
        return Err(MvpError::invalid_range(format!(
            "horizontal dilation needs one input channel, got {in_channels}"
        )));
    }

    let tables = ChannelTables::new(&params.quant)?;
    let scratch = ConvScratch::carve(params.scratch, params, config);
    let offset = check_fp16(
        params.quant.input_offset as f32 * ACCUMULATOR_SCALER,
        "scaled input offset",
    )?;
    tables.write(session, scratch.scale, scratch.bias)?;

    let (source, source_type) = match scratch.prescaled {
        Some(prescaled) => {
            emit_prescale(
                session,
                config,
                params.input,
                prescaled,
                in_shape.element_count(),
                params.quant.input_offset,
            )?;
            (prescaled, DataType::Fp16)
        }
        None => (params.input, DataType::Int8),
    };

    let x_axis = Axis::width(&in_shape, &out_shape, &window);
    let y_axis = Axis::height(&in_shape, &out_shape, &window);
    let row = in_shape.row_elements();
    let tiles = tiling::plan(&x_axis, &y_axis, window.stride_height * row)?;
    let groups = channel_groups(out_channels, filter_shape.image_elements());

    for tile in &tiles {
        let (out_step, out_skip) = tiling::output_step(tile.incr, out_shape.row_elements());
        let in_y = y_axis.first_input(tile.first_row());
        let in_x = x_axis.first_input(tile.x.out_min);
        let cols = tile.x.taps() * in_channels;
        debug!(
            "conv tile x {}..={} y {}(+{}) x{} taps {}x{}",
            tile.x.out_min,
            tile.x.out_max,
            tile.first_row(),
            tile.incr,
            tile.rows,
            tile.y.taps(),
            tile.x.taps()
        );

        for batch in 0..in_shape.batches {
            let input = Layout::new(
                source.at(source_type.element_bytes() * in_shape.offset(batch, in_y, in_x, 0)),
                source_type,
                [
                    if tile.single_x { tile.y.len() } else { tile.x.len() },
                    tile.in_rows,
                    cols,
                ],
                [
                    if tile.single_x {
                        window.stride_height * row
                    } else {
                        window.stride_width * in_channels
                    },
                    window.dilation_height * row,
                    window.dilation_width,
                ],
            );
            for &(first, count) in &groups {
                let filter = Layout::new(
                    params.filter.at(filter_shape.offset(
                        first,
                        tile.y.tap_start,
                        tile.x.tap_start,
                        0,
                    )),
                    DataType::Int8,
                    [count, tile.y.taps(), cols],
                    [filter_shape.image_elements(), filter_shape.row_elements(), 1],
                );
                let table = |buffer: Buffer| {
                    Layout::new(buffer.at(2 * first), DataType::Fp16, [count, 1, 1], [1, 0, 0])
                };
                let output = Layout::new(
                    params.output.at(out_shape.offset(
                        batch,
                        tile.first_row(),
                        tile.x.out_min,
                        first,
                    )),
                    DataType::Int8,
                    [tile.rows * (out_skip + 1), tile.x.len(), count],
                    [out_step, out_channels, 1],
                );
                let packed = if config.lane_packing {
                    pack_all([(input, Some(Dim::Col)), (filter, Some(Dim::Col))])
                } else {
                    None
                };
                let [input, filter] = packed.unwrap_or([input, filter]);

                session.begin_program()?;
                input.configure(session, ArrayId::A0);
                filter.configure(session, ArrayId::A1);
                table(scratch.scale).configure(session, ArrayId::A2);
                table(scratch.bias).configure(session, ArrayId::A3);
                output.configure(session, ArrayId::A4);
                if scratch.prescaled.is_none() {
                    session.set_reg_f16(ConvReg::Scaler.reg(), ACCUMULATOR_SCALER);
                    session.set_reg_f16(ConvReg::Offset.reg(), offset.to_f32());
                }
                emit_tile(
                    session,
                    &TileWalk {
                        tile,
                        channels: count,
                        cols: input.sizes[Dim::Col.index()],
                        prescaled: scratch.prescaled.is_some(),
                        packed: packed.is_some(),
                        out_skip,
                    },
                );
                exec::issue(session, config)?;
            }
        }
    }

    emit_clamp(
        session,
        config,
        params.output,
        out_shape.element_count(),
        params.activation,
    )
}

struct TileWalk<'t> {
    tile: &'t Tile,
    channels: usize,
    cols: usize,
    prescaled: bool,
    packed: bool,
    out_skip: usize,
}

fn emit_tile(ctx: &mut ProgramContext, walk: &TileWalk<'_>) {
    let tile = walk.tile;
    let acc = ConvReg::Acc.reg();
    let taps = LoadConfig::two(
        Stream::new(ConvReg::Input.reg(), ArrayId::A0).incr(Dim::Col),
        Stream::new(ConvReg::Filter.reg(), ArrayId::A1).incr(Dim::Col),
    );
    let mac = AluConfig::new()
        .z(acc)
        .x(ConvReg::Input.reg())
        .y(ConvReg::Filter.reg())
        .a(acc);

    ctx.begin_loop(walk.channels);
    ctx.begin_loop(tile.x.len());
    ctx.begin_loop(tile.rows);
    ctx.compute(AluOp::Clear, AluConfig::new().z(acc), LoadConfig::NONE, StoreConfig::NONE);
    ctx.begin_loop(tile.y.taps());
    ctx.begin_loop(walk.cols);
    if walk.prescaled {
        ctx.compute(AluOp::Macr2a, mac, taps, StoreConfig::NONE);
    } else {
        ctx.compute(
            AluOp::Macr2a,
            AluConfig::new()
                .z(ConvReg::Input.reg())
                .x(ConvReg::Input.reg())
                .y(ConvReg::Scaler.reg())
                .a(ConvReg::Offset.reg()),
            taps,
            StoreConfig::NONE,
        );
        ctx.compute(AluOp::Macr2a, mac, LoadConfig::NONE, StoreConfig::NONE);
    }
    ctx.end_loop();
    ctx.postloop_incr_dim(ArrayId::A0, Dim::Row);
    ctx.postloop_incr_dim(ArrayId::A1, Dim::Row);
    ctx.end_loop();
    if tile.single_x {
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Vec);
    }
    let mut skip = tile.skip_rows;
    if skip > 0 {
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Row);
        skip -= 1;
    }

    if walk.packed {
        ctx.compute(
            AluOp::Addr,
            AluConfig::new().z(acc).a(acc),
            LoadConfig::NONE,
            StoreConfig::NONE,
        );
    }
    ctx.compute(
        AluOp::Macr2a,
        AluConfig::new()
            .z(acc)
            .x(acc)
            .y(ConvReg::Scale.reg())
            .a(ConvReg::Bias.reg()),
        LoadConfig::two(
            Stream::new(ConvReg::Scale.reg(), ArrayId::A2),
            Stream::new(ConvReg::Bias.reg(), ArrayId::A3),
        ),
        StoreConfig::one(Stream::new(acc, ArrayId::A4).incr(Dim::Vec)),
    );
    emit_output_skip(ctx, ArrayId::A4, walk.out_skip);
    emit_skip(ctx, ArrayId::A0, Dim::Row, skip);

    ctx.end_loop();
    ctx.postloop_incr_dim(ArrayId::A4, Dim::Row);
    if !tile.single_x {
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Vec);
    }
    ctx.end_loop();
    ctx.postloop_incr_dim(ArrayId::A4, Dim::Col);
    ctx.postloop_incr_dim(ArrayId::A1, Dim::Vec);
    ctx.postloop_incr_dim(ArrayId::A2, Dim::Vec);
    ctx.postloop_incr_dim(ArrayId::A3, Dim::Vec);
    ctx.end_loop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Activation, Window};
    use crate::shape::Shape;

    fn params(window: Window, input: Shape, out_channels: usize, output: Shape) -> Conv2dParams {
        let filter = Shape::new(
            out_channels,
            window.filter_height,
            window.filter_width,
            input.channels,
        );
        Conv2dParams {
            input_shape: input,
            filter_shape: filter,
            output_shape: output,
            window,
            quant: Quantization::uniform(out_channels, 0.5),
            activation: Activation::FULL,
            input: Buffer::new(0x1000, input.element_count()),
            filter: Buffer::new(0x4000, filter.element_count()),
            output: Buffer::new(0x8000, output.element_count()),
            scratch: Buffer::new(0xc000, 0x2000),
        }
    }

    #[test]
    fn test_scratch_size() {
        let p = params(
            Window::new(3, 3, 1, 1),
            Shape::new(1, 8, 8, 3),
            5,
            Shape::new(1, 6, 6, 5),
        );
        // Two 5-entry fp16 tables, each rounded up to 12 bytes.
        assert_eq!(conv2d_scratch_size(&p, &KernelConfig::default()), 24);
        let speed = KernelConfig::default().with_optimize_for_speed(true);
        assert_eq!(conv2d_scratch_size(&p, &speed), 24 + 2 * 8 * 8 * 3);
    }

    #[test]
    fn test_channel_tables() {
        let quant = Quantization {
            input_offset: 0,
            output_offset: 3,
            output_multiplier: vec![0.5, 0.25],
            bias: vec![4, -8],
        };
        let tables = ChannelTables::new(&quant).unwrap();
        assert_eq!(tables.scale, vec![f16::from_f32(512.0), f16::from_f32(256.0)]);
        assert_eq!(tables.bias, vec![f16::from_f32(5.0), f16::from_f32(1.0)]);
    }

    #[test]
    fn test_table_overflow_is_invalid_range() {
        let quant = Quantization::uniform(1, 100.0);
        let err = ChannelTables::new(&quant).unwrap_err();
        assert_eq!(err.kind(), mvp_driver::ErrorKind::InvalidRange);
    }

    #[test]
    fn test_program_budget() {
        let p = params(
            Window::new(3, 3, 1, 1),
            Shape::new(1, 8, 8, 3),
            4,
            Shape::new(1, 6, 6, 4),
        );
        let config = KernelConfig::default();
        assert!(conv2d_s8_is_supported(&p, &config));
        let mut ctx = ProgramContext::new();
        let mut session = Session::probe(&mut ctx);
        build(&mut session, &p, &config).unwrap();
        assert_eq!(session.program().instr_count, 4);
        assert_eq!(session.program().loop_count, 5);
    }

    #[test]
    fn test_dilated_x_needs_single_channel() {
        let window = Window::new(3, 3, 1, 1).with_dilation(1, 2);
        let p = params(window, Shape::new(1, 8, 8, 2), 1, Shape::new(1, 6, 4, 1));
        assert!(!conv2d_s8_is_supported(&p, &KernelConfig::default()));
        let p = params(window, Shape::new(1, 8, 8, 1), 1, Shape::new(1, 6, 4, 1));
        assert!(conv2d_s8_is_supported(&p, &KernelConfig::default()));
    }

    #[test]
    fn test_small_scratch_rejected() {
        let mut p = params(
            Window::new(1, 1, 1, 1),
            Shape::new(1, 2, 2, 1),
            4,
            Shape::new(1, 2, 2, 4),
        );
        p.scratch = Buffer::new(0xc000, 8);
        let err = check(&p, &KernelConfig::default()).unwrap_err();
        assert_eq!(err.kind(), mvp_driver::ErrorKind::InvalidParameter);
    }
}
