//! Average and max pooling over int8 NHWC tensors.
//!
//! Both reductions share the edge-aware tiler: one program per tile, batch
//! and channel (or channel pair when lane packing applies), walking
//!
//! ```text
//! A0 input   vec: out_x (or out_y for a single column)
//!            row: filter rows, rolling over between output rows
//!            col: filter columns
//! A1 output  vec: out_y    row: out_x    col: unused
//! ```
//!
//! Average pooling also has an optimized strategy that issues one program
//! per output pixel with the channel loop inside the program. It wins on
//! small outputs with large windows; [`area_ratio_policy`] picks between
//! the two.

use crate::config::KernelConfig;
use crate::exec;
use crate::packing::{pack_all, Layout};
use crate::params::{Activation, PoolingParams};
use crate::quant::{is_fp16_normal, ACCUMULATOR_MULTIPLIER, ACCUMULATOR_SCALER};
use crate::tiling::{self, emit_output_skip, emit_skip, Axis, Tile};
use mvp_driver::{
    AluConfig, AluOp, ArrayId, DataType, Dim, LoadConfig, Mvp, MvpError, ProgramContext, Reg,
    Result, Session, StoreConfig, Stream,
};
use tracing::{debug, info, warn};

// ── Register conventions ─────────────────────────────────────────────────────

/// Average pooling registers.
///
/// | reg | use                                   |
/// |-----|---------------------------------------|
/// | R0  | final scale `MULTIPLIER / taps`       |
/// | R1  | accumulator scaler                    |
/// | R2  | accumulator                           |
/// | R3  | streamed input                        |
/// | R4  | activation min                        |
/// | R5  | activation max                        |
/// | R6  | clipped result                        |
#[derive(Debug, Clone, Copy)]
enum AvgReg {
    FinalScale,
    AccScaler,
    Acc,
    Input,
    ActMin,
    ActMax,
    Clipped,
}

impl AvgReg {
    const fn reg(self) -> Reg {
        match self {
            Self::FinalScale => Reg::R0,
            Self::AccScaler => Reg::R1,
            Self::Acc => Reg::R2,
            Self::Input => Reg::R3,
            Self::ActMin => Reg::R4,
            Self::ActMax => Reg::R5,
            Self::Clipped => Reg::R6,
        }
    }
}

/// Max pooling registers.
///
/// | reg | use                    |
/// |-----|------------------------|
/// | R0  | int8 lowest (-128)     |
/// | R1  | running maximum        |
/// | R2  | streamed input         |
/// | R3  | activation min         |
/// | R4  | activation max         |
/// | R5  | clipped result         |
#[derive(Debug, Clone, Copy)]
enum MaxReg {
    Lowest,
    Acc,
    Input,
    ActMin,
    ActMax,
    Out,
}

impl MaxReg {
    const fn reg(self) -> Reg {
        match self {
            Self::Lowest => Reg::R0,
            Self::Acc => Reg::R1,
            Self::Input => Reg::R2,
            Self::ActMin => Reg::R3,
            Self::ActMax => Reg::R4,
            Self::Out => Reg::R5,
        }
    }
}

// ── Reductions ───────────────────────────────────────────────────────────────

/// The per-output arithmetic emitted around the tap loops.
#[derive(Debug, Clone, Copy)]
enum Reduction {
    Average { final_scale: f32 },
    Max,
}

impl Reduction {
    #[allow(clippy::cast_precision_loss)]
    fn average(taps: usize, config: &KernelConfig) -> Result<Self> {
        if taps > config.max_avg_filter_count {
            return Err(MvpError::invalid_range(format!(
                "averaging {taps} taps exceeds the limit of {}",
                config.max_avg_filter_count
            )));
        }
        let final_scale = ACCUMULATOR_MULTIPLIER / taps as f32;
        if !is_fp16_normal(final_scale) {
            return Err(MvpError::invalid_range(format!(
                "final scale {final_scale} for {taps} taps is not an fp16 normal"
            )));
        }
        Ok(Self::Average { final_scale })
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_registers(self, ctx: &mut ProgramContext, activation: Activation) {
        match self {
            Self::Average { final_scale } => {
                ctx.set_reg_f16(AvgReg::FinalScale.reg(), final_scale);
                ctx.set_reg_f16(AvgReg::AccScaler.reg(), ACCUMULATOR_SCALER);
                if !activation.is_full_range() {
                    ctx.set_reg_f16(AvgReg::ActMin.reg(), activation.min as f32);
                    ctx.set_reg_f16(AvgReg::ActMax.reg(), activation.max as f32);
                }
            }
            Self::Max => {
                ctx.set_reg_f16(MaxReg::Lowest.reg(), f32::from(i8::MIN));
                ctx.set_reg_f16(MaxReg::ActMin.reg(), activation.min as f32);
                ctx.set_reg_f16(MaxReg::ActMax.reg(), activation.max as f32);
            }
        }
    }

    const fn input(self) -> Reg {
        match self {
            Self::Average { .. } => AvgReg::Input.reg(),
            Self::Max => MaxReg::Input.reg(),
        }
    }

    /// Reset the accumulator.
    fn seed(self, ctx: &mut ProgramContext) {
        match self {
            Self::Average { .. } => ctx.compute(
                AluOp::Clear,
                AluConfig::new().z(AvgReg::Acc.reg()),
                LoadConfig::NONE,
                StoreConfig::NONE,
            ),
            Self::Max => ctx.compute(
                AluOp::Copy,
                AluConfig::new().z(MaxReg::Acc.reg()).a(MaxReg::Lowest.reg()),
                LoadConfig::NONE,
                StoreConfig::NONE,
            ),
        }
    }

    /// Fold one input from A0 into the accumulator.
    fn tap(self, ctx: &mut ProgramContext) {
        let load = LoadConfig::one(Stream::new(self.input(), ArrayId::A0).incr(Dim::Col));
        match self {
            Self::Average { .. } => ctx.compute(
                AluOp::Macr2a,
                AluConfig::new()
                    .z(AvgReg::Acc.reg())
                    .x(AvgReg::Input.reg())
                    .y(AvgReg::AccScaler.reg())
                    .a(AvgReg::Acc.reg()),
                load,
                StoreConfig::NONE,
            ),
            Self::Max => ctx.compute(
                AluOp::Max2a,
                AluConfig::new()
                    .z(MaxReg::Acc.reg())
                    .x(MaxReg::Input.reg())
                    .a(MaxReg::Acc.reg()),
                load,
                StoreConfig::NONE,
            ),
        }
    }

    /// Scale/clip the accumulator and store it to A1.
    ///
    /// With `skip_row` the first instruction also advances A0 by one row
    /// through an otherwise unused load stream.
    fn finish(self, ctx: &mut ProgramContext, activation: Activation, skip_row: bool) {
        let load = if skip_row {
            LoadConfig::one(Stream::new(self.input(), ArrayId::A0).incr(Dim::Row))
        } else {
            LoadConfig::NONE
        };
        let store = |reg: Reg| StoreConfig::one(Stream::new(reg, ArrayId::A1).incr(Dim::Vec));
        match self {
            Self::Average { .. } => {
                let clip = !activation.is_full_range();
                ctx.compute(
                    AluOp::Mulr2a,
                    AluConfig::new()
                        .z(AvgReg::Acc.reg())
                        .x(AvgReg::Acc.reg())
                        .y(AvgReg::FinalScale.reg()),
                    load,
                    if clip { StoreConfig::NONE } else { store(AvgReg::Acc.reg()) },
                );
                if clip {
                    ctx.compute(
                        AluOp::Clip2a,
                        AluConfig::new()
                            .z(AvgReg::Clipped.reg())
                            .x(AvgReg::ActMin.reg())
                            .y(AvgReg::ActMax.reg())
                            .a(AvgReg::Acc.reg()),
                        LoadConfig::NONE,
                        store(AvgReg::Clipped.reg()),
                    );
                }
            }
            Self::Max => ctx.compute(
                AluOp::Clip2a,
                AluConfig::new()
                    .z(MaxReg::Out.reg())
                    .x(MaxReg::ActMin.reg())
                    .y(MaxReg::ActMax.reg())
                    .a(MaxReg::Acc.reg()),
                load,
                store(MaxReg::Out.reg()),
            ),
        }
    }
}

// ── Strategy selection ───────────────────────────────────────────────────────

/// Average pooling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingKind {
    /// Edge-aware tiling; one program per tile, batch and channel group.
    Generic,
    /// One program per output pixel, channels looped inside.
    Optimized,
}

impl PoolingKind {
    /// The other algorithm.
    pub const fn other(self) -> Self {
        match self {
            Self::Generic => Self::Optimized,
            Self::Optimized => Self::Generic,
        }
    }

    /// Strategy implementing this algorithm.
    pub fn strategy(self) -> &'static dyn PoolingStrategy {
        match self {
            Self::Generic => &GenericPooling,
            Self::Optimized => &OptimizedPooling,
        }
    }
}

impl std::fmt::Display for PoolingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::Optimized => write!(f, "optimized"),
        }
    }
}

/// Chooses the preferred average pooling algorithm.
pub type PoolingPolicy = fn(&PoolingParams) -> PoolingKind;

/// Prefer the per-pixel algorithm when the output is small compared to the
/// work of one window across all channels.
pub fn area_ratio_policy(params: &PoolingParams) -> PoolingKind {
    let out_area = params.output_shape.width * params.output_shape.height;
    let work = (9 * params.window.filter_width * params.window.filter_height * params.channels()
        + 5)
        / 10;
    if out_area <= work {
        PoolingKind::Optimized
    } else {
        PoolingKind::Generic
    }
}

/// One way of emitting average pooling programs.
pub trait PoolingStrategy: std::fmt::Debug + Sync {
    /// Which algorithm this is.
    fn kind(&self) -> PoolingKind;

    /// Emit (and, in an executing session, run) every program.
    ///
    /// # Errors
    ///
    /// Returns the first tiling or build error.
    fn build(
        &self,
        session: &mut Session<'_>,
        params: &PoolingParams,
        config: &KernelConfig,
    ) -> Result<()>;
}

/// Edge-aware tiled average pooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericPooling;

impl PoolingStrategy for GenericPooling {
    fn kind(&self) -> PoolingKind {
        PoolingKind::Generic
    }

    fn build(
        &self,
        session: &mut Session<'_>,
        params: &PoolingParams,
        config: &KernelConfig,
    ) -> Result<()> {
        build_tiled(session, params, config, |taps| Reduction::average(taps, config))
    }
}

/// Per-pixel average pooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizedPooling;

impl PoolingStrategy for OptimizedPooling {
    fn kind(&self) -> PoolingKind {
        PoolingKind::Optimized
    }

    fn build(
        &self,
        session: &mut Session<'_>,
        params: &PoolingParams,
        config: &KernelConfig,
    ) -> Result<()> {
        build_per_pixel(session, params, config)
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Average pooling with the algorithm chosen by `config.pooling_policy`,
/// falling back to the other one when the preferred one cannot express
/// these parameters.
///
/// # Errors
///
/// Returns `InvalidParameter` for malformed parameters, or the error of the
/// last algorithm tried when neither supports them.
pub fn average_pooling_s8(mvp: &mut Mvp, params: &PoolingParams, config: &KernelConfig) -> Result<()> {
    params.validate()?;
    let preferred = (config.pooling_policy)(params);
    let mut last_err = None;
    for kind in [preferred, preferred.other()] {
        let strategy = kind.strategy();
        match exec::probe(|s| strategy.build(s, params, config)) {
            Ok(()) => {
                if kind != preferred {
                    warn!("average_pooling_s8: {preferred} unsupported, falling back to {kind}");
                }
                info!(
                    "average_pooling_s8 {} -> {} ({kind})",
                    params.input_shape, params.output_shape
                );
                return exec::run(mvp, "average_pooling_s8", |s| strategy.build(s, params, config));
            }
            Err(e) => {
                debug!("average_pooling_s8: {kind} rejected: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| MvpError::fail("no pooling strategy")))
}

/// Average pooling with an explicit algorithm.
///
/// # Errors
///
/// As [`average_pooling_s8`], without fallback.
pub fn average_pooling_s8_with(
    mvp: &mut Mvp,
    params: &PoolingParams,
    config: &KernelConfig,
    strategy: &dyn PoolingStrategy,
) -> Result<()> {
    params.validate()?;
    info!(
        "average_pooling_s8 {} -> {} ({})",
        params.input_shape,
        params.output_shape,
        strategy.kind()
    );
    exec::run(mvp, "average_pooling_s8", |s| strategy.build(s, params, config))
}

/// True if either average pooling algorithm supports `params`.
pub fn average_pooling_s8_is_supported(params: &PoolingParams, config: &KernelConfig) -> bool {
    params.validate().is_ok()
        && [PoolingKind::Optimized, PoolingKind::Generic]
            .into_iter()
            .any(|kind| exec::probe(|s| kind.strategy().build(s, params, config)).is_ok())
}

/// Max pooling, always clamped to the activation range.
///
/// # Errors
///
/// Returns `InvalidParameter` for malformed parameters and `InvalidRange`
/// when the tiling does not fit the hardware.
pub fn max_pooling_s8(mvp: &mut Mvp, params: &PoolingParams, config: &KernelConfig) -> Result<()> {
    params.validate()?;
    info!(
        "max_pooling_s8 {} -> {}",
        params.input_shape, params.output_shape
    );
    exec::run(mvp, "max_pooling_s8", |s| {
        build_tiled(s, params, config, |_| Ok(Reduction::Max))
    })
}

/// True if max pooling supports `params`.
pub fn max_pooling_s8_is_supported(params: &PoolingParams, config: &KernelConfig) -> bool {
    params.validate().is_ok()
        && exec::probe(|s| build_tiled(s, params, config, |_| Ok(Reduction::Max))).is_ok()
}

// ── Tiled emission ───────────────────────────────────────────────────────────

fn build_tiled<F>(
    session: &mut Session<'_>,
    params: &PoolingParams,
    config: &KernelConfig,
    reduction_for: F,
) -> Result<()>
where
    F: Fn(usize) -> Result<Reduction>,
{
    let in_shape = params.input_shape;
    let out_shape = params.output_shape;
    let channels = params.channels();
    let x_axis = Axis::width(&in_shape, &out_shape, &params.window);
    let y_axis = Axis::height(&in_shape, &out_shape, &params.window);
    let sw = params.window.stride_width;
    let sh = params.window.stride_height;

    let tiles = tiling::plan(&x_axis, &y_axis, sh * in_shape.row_elements())?;
    for tile in &tiles {
        let reduction = reduction_for(tile.x.taps() * tile.y.taps())?;
        let (out_step, out_skip) = tiling::output_step(tile.incr, out_shape.row_elements());
        let in_y = y_axis.first_input(tile.first_row());
        let in_x = x_axis.first_input(tile.x.out_min);
        debug!(
            "pool tile x {}..={} y {}(+{}) x{} taps {}x{}",
            tile.x.out_min,
            tile.x.out_max,
            tile.first_row(),
            tile.incr,
            tile.rows,
            tile.y.taps(),
            tile.x.taps()
        );

        for batch in 0..in_shape.batches {
            let mut channel = 0;
            while channel < channels {
                let input = Layout::new(
                    params.input.at(in_shape.offset(batch, in_y, in_x, channel)),
                    DataType::Int8,
                    [
                        if tile.single_x { tile.y.len() } else { tile.x.len() },
                        tile.in_rows,
                        tile.x.taps(),
                    ],
                    [
                        if tile.single_x {
                            sh * in_shape.row_elements()
                        } else {
                            sw * channels
                        },
                        in_shape.row_elements(),
                        channels,
                    ],
                );
                let output = Layout::new(
                    params
                        .output
                        .at(out_shape.offset(batch, tile.first_row(), tile.x.out_min, channel)),
                    DataType::Int8,
                    [tile.rows * (out_skip + 1), tile.x.len(), 1],
                    [out_step, channels, 0],
                );
                let packed = if config.lane_packing && channel + 1 < channels {
                    pack_all([(input, None), (output, None)])
                } else {
                    None
                };
                let ([input, output], step) = match packed {
                    Some(walks) => (walks, 2),
                    None => ([input, output], 1),
                };

                session.begin_program()?;
                input.configure(session, ArrayId::A0);
                output.configure(session, ArrayId::A1);
                reduction.set_registers(session, params.activation);
                emit_tile(session, tile, reduction, params.activation, out_skip);
                exec::issue(session, config)?;

                channel += step;
            }
        }
    }
    Ok(())
}

fn emit_tile(
    ctx: &mut ProgramContext,
    tile: &Tile,
    reduction: Reduction,
    activation: Activation,
    out_skip: usize,
) {
    ctx.begin_loop(tile.x.len());
    ctx.begin_loop(tile.rows);
    reduction.seed(ctx);
    ctx.begin_loop(tile.y.taps());
    ctx.begin_loop(tile.x.taps());
    reduction.tap(ctx);
    ctx.end_loop();
    ctx.postloop_incr_dim(ArrayId::A0, Dim::Row);
    ctx.end_loop();
    if tile.single_x {
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Vec);
    }

    // Rows between two outputs' windows: the first rides on the filter-row
    // loop, the second on the finishing instruction's spare load stream,
    // the rest on do-nothing loops.
    let mut skip = tile.skip_rows;
    if skip > 0 {
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Row);
        skip -= 1;
    }
    let fused = skip > 0;
    if fused {
        skip -= 1;
    }
    reduction.finish(ctx, activation, fused);
    emit_output_skip(ctx, ArrayId::A1, out_skip);
    emit_skip(ctx, ArrayId::A0, Dim::Row, skip);
    ctx.end_loop();
    ctx.postloop_incr_dim(ArrayId::A1, Dim::Row);
    if !tile.single_x {
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Vec);
    }
    ctx.end_loop();
}

// ── Per-pixel emission ───────────────────────────────────────────────────────

fn build_per_pixel(
    session: &mut Session<'_>,
    params: &PoolingParams,
    config: &KernelConfig,
) -> Result<()> {
    let in_shape = params.input_shape;
    let out_shape = params.output_shape;
    let channels = params.channels();
    let x_axis = Axis::width(&in_shape, &out_shape, &params.window);
    let y_axis = Axis::height(&in_shape, &out_shape, &params.window);

    for batch in 0..in_shape.batches {
        for oy in 0..out_shape.height {
            let (ys, ye) = y_axis.taps(oy);
            for ox in 0..out_shape.width {
                let (xs, xe) = x_axis.taps(ox);
                let (rows, cols) = (ye - ys, xe - xs);
                if rows == 0 || cols == 0 {
                    return Err(MvpError::invalid_range(format!(
                        "output ({oy}, {ox}) sees only padding"
                    )));
                }
                let reduction = Reduction::average(rows * cols, config)?;

                let input = Layout::new(
                    params.input.at(in_shape.offset(
                        batch,
                        y_axis.first_input(oy),
                        x_axis.first_input(ox),
                        0,
                    )),
                    DataType::Int8,
                    [channels, rows, cols],
                    [1, in_shape.row_elements(), channels],
                );
                let output = Layout::new(
                    params.output.at(out_shape.offset(batch, oy, ox, 0)),
                    DataType::Int8,
                    [channels, 1, 1],
                    [1, 0, 0],
                );
                let packed = if config.lane_packing {
                    pack_all([(input, Some(Dim::Vec)), (output, Some(Dim::Vec))])
                } else {
                    None
                };
                let [input, output] = packed.unwrap_or([input, output]);

                session.begin_program()?;
                input.configure(session, ArrayId::A0);
                output.configure(session, ArrayId::A1);
                reduction.set_registers(session, params.activation);

                session.begin_loop(input.sizes[Dim::Vec.index()]);
                reduction.seed(session);
                session.begin_loop(rows);
                session.begin_loop(cols);
                reduction.tap(session);
                session.end_loop();
                session.postloop_incr_dim(ArrayId::A0, Dim::Row);
                session.postloop_reset_dim(ArrayId::A0, Dim::Col);
                session.end_loop();
                session.postloop_incr_dim(ArrayId::A0, Dim::Vec);
                session.postloop_reset_dim(ArrayId::A0, Dim::Row);
                reduction.finish(session, params.activation, false);
                session.end_loop();

                exec::issue(session, config)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Window;
    use crate::shape::Shape;
    use mvp_driver::{Buffer, ErrorKind};

    fn params(input: Shape, output: Shape, window: Window) -> PoolingParams {
        PoolingParams {
            input_shape: input,
            output_shape: output,
            window,
            activation: Activation::FULL,
            input: Buffer::new(0x1000, input.element_count()),
            output: Buffer::new(0x8000, output.element_count()),
        }
    }

    #[test]
    fn test_area_ratio_policy() {
        // Global pooling: one output, big window.
        let global = params(Shape::new(1, 8, 8, 4), Shape::new(1, 1, 1, 4), Window::new(8, 8, 1, 1));
        assert_eq!(area_ratio_policy(&global), PoolingKind::Optimized);
        // 2x2/2 over a large plane.
        let dense = params(Shape::new(1, 32, 32, 1), Shape::new(1, 16, 16, 1), Window::new(2, 2, 2, 2));
        assert_eq!(area_ratio_policy(&dense), PoolingKind::Generic);
    }

    #[test]
    fn test_kind_other_and_display() {
        assert_eq!(PoolingKind::Generic.other(), PoolingKind::Optimized);
        assert_eq!(PoolingKind::Optimized.strategy().kind(), PoolingKind::Optimized);
        assert_eq!(PoolingKind::Generic.to_string(), "generic");
    }

    #[test]
    fn test_filter_count_ceiling() {
        let config = KernelConfig::default();
        assert!(Reduction::average(512, &config).is_ok());
        let err = Reduction::average(513, &config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
        let tight = config.with_max_avg_filter_count(4);
        assert!(Reduction::average(9, &tight).is_err());
    }

    #[test]
    fn test_supported_shapes() {
        let config = KernelConfig::default();
        let p = params(Shape::new(1, 4, 4, 2), Shape::new(1, 2, 2, 2), Window::new(2, 2, 2, 2));
        assert!(average_pooling_s8_is_supported(&p, &config));
        assert!(max_pooling_s8_is_supported(&p, &config));
    }

    #[test]
    fn test_large_window_unsupported() {
        let config = KernelConfig::default();
        let p = params(Shape::new(1, 24, 24, 1), Shape::new(1, 1, 1, 1), Window::new(24, 24, 1, 1));
        assert!(!average_pooling_s8_is_supported(&p, &config));
        assert!(max_pooling_s8_is_supported(&p, &config));
    }

    #[test]
    fn test_generic_program_shape() {
        // 3-tap rows at stride 2: skip rows ride on the tap loop.
        let p = params(Shape::new(1, 9, 9, 1), Shape::new(1, 4, 4, 1), Window::new(3, 3, 2, 2));
        let config = KernelConfig::default();
        let mut ctx = ProgramContext::new();
        let mut session = Session::probe(&mut ctx);
        GenericPooling.build(&mut session, &p, &config).unwrap();
        let program = session.program();
        assert_eq!(program.instr_count, 3);
        assert_eq!(program.loop_count, 4);
        let filter_rows = &program.loops()[2];
        assert!(filter_rows.increments(ArrayId::A0, Dim::Row));
    }
}
