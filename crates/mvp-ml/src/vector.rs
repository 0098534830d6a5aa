//! Elementwise kernels over contiguous vectors.
//!
//! A vector is walked as `[1, rows, cols]` blocks of up to 1024 x 1024
//! elements followed by one short tail block, one program per block. Blocks
//! with an even column count walk lane pairs when every operand allows it.

use crate::config::KernelConfig;
use crate::exec;
use crate::packing::{pack_all, Layout};
use crate::params::{check_vector, Activation, AddS8Params};
use crate::quant::{check_fp16, ACCUMULATOR_SCALER};
use mvp_driver::limits::{MAX_DIM_SIZE, MAX_LOOP_ITERATIONS};
use mvp_driver::{
    AluConfig, AluOp, ArrayId, Buffer, DataType, Dim, LoadConfig, Mvp, ProgramContext, Reg,
    Result, Session, StoreConfig, Stream,
};
use tracing::{debug, info};

// ── Blocking ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    offset: usize,
    rows: usize,
    cols: usize,
}

fn blocks(len: usize) -> Vec<Block> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < len {
        let remaining = len - offset;
        let (rows, cols) = if remaining >= MAX_DIM_SIZE {
            ((remaining / MAX_DIM_SIZE).min(MAX_LOOP_ITERATIONS), MAX_DIM_SIZE)
        } else {
            (1, remaining)
        };
        out.push(Block { offset, rows, cols });
        offset += rows * cols;
    }
    out
}

/// Emit one program per block of `len` elements.
///
/// Operand `i` is configured into array slot `Ai`; `body` is emitted once
/// inside the block loops and must advance every operand along `Col`.
fn for_each_block<const N: usize, F>(
    session: &mut Session<'_>,
    config: &KernelConfig,
    len: usize,
    operands: [(Buffer, DataType); N],
    registers: &[(Reg, f32)],
    mut body: F,
) -> Result<()>
where
    F: FnMut(&mut ProgramContext),
{
    for block in blocks(len) {
        let walks = operands.map(|(buffer, dtype)| {
            Layout::new(
                buffer.at(block.offset * dtype.element_bytes()),
                dtype,
                [1, block.rows, block.cols],
                [0, block.cols, 1],
            )
        });
        let walks = if config.lane_packing {
            pack_all(walks.map(|w| (w, Some(Dim::Col)))).unwrap_or(walks)
        } else {
            walks
        };

        session.begin_program()?;
        for (walk, id) in walks.iter().zip(ArrayId::ALL) {
            walk.configure(session, id);
        }
        for &(reg, value) in registers {
            session.set_reg_f16(reg, value);
        }
        session.begin_loop(block.rows);
        session.begin_loop(walks[0].sizes[Dim::Col.index()]);
        body(&mut **session);
        session.end_loop();
        for id in ArrayId::ALL.into_iter().take(N) {
            session.postloop_incr_dim(id, Dim::Row);
        }
        session.end_loop();
        exec::issue(session, config)?;
    }
    Ok(())
}

fn col(reg: Reg, array: ArrayId) -> Stream {
    Stream::new(reg, array).incr(Dim::Col)
}

// ── fp16 add ─────────────────────────────────────────────────────────────────

/// `out[i] = a[i] + b[i]` over fp16 vectors.
///
/// # Errors
///
/// `InvalidParameter` for undersized or misaligned buffers.
pub fn add_f16(
    mvp: &mut Mvp,
    a: Buffer,
    b: Buffer,
    output: Buffer,
    len: usize,
    config: &KernelConfig,
) -> Result<()> {
    check_add_f16(a, b, output, len)?;
    info!("add_f16 x{len}");
    exec::run(mvp, "add_f16", |s| emit_add_f16(s, config, a, b, output, len))
}

/// True if [`add_f16`] accepts these operands.
pub fn add_f16_is_supported(
    a: Buffer,
    b: Buffer,
    output: Buffer,
    len: usize,
    config: &KernelConfig,
) -> bool {
    check_add_f16(a, b, output, len).is_ok()
        && exec::probe(|s| emit_add_f16(s, config, a, b, output, len)).is_ok()
}

fn check_add_f16(a: Buffer, b: Buffer, output: Buffer, len: usize) -> Result<()> {
    check_vector("a", a, len, 2)?;
    check_vector("b", b, len, 2)?;
    check_vector("output", output, len, 2)
}

fn emit_add_f16(
    session: &mut Session<'_>,
    config: &KernelConfig,
    a: Buffer,
    b: Buffer,
    output: Buffer,
    len: usize,
) -> Result<()> {
    for_each_block(
        session,
        config,
        len,
        [(a, DataType::Fp16), (b, DataType::Fp16), (output, DataType::Fp16)],
        &[],
        |ctx| {
            ctx.compute(
                AluOp::Addc,
                AluConfig::new().z(Reg::R2).x(Reg::R0).a(Reg::R1),
                LoadConfig::two(col(Reg::R0, ArrayId::A0), col(Reg::R1, ArrayId::A1)),
                StoreConfig::one(col(Reg::R2, ArrayId::A2)),
            );
        },
    )
}

// ── Quantized int8 add ───────────────────────────────────────────────────────

/// Quantized add registers.
#[derive(Debug, Clone, Copy)]
enum AddReg {
    /// Scale of the first operand.
    Mult1,
    /// All offsets folded into one constant.
    Offset,
    /// Scale of the second operand.
    Mult2,
    In1,
    In2,
    Sum,
    ActMin,
    ActMax,
}

impl AddReg {
    const fn reg(self) -> Reg {
        match self {
            Self::Mult1 => Reg::R0,
            Self::Offset => Reg::R1,
            Self::Mult2 => Reg::R2,
            Self::In1 => Reg::R3,
            Self::In2 => Reg::R4,
            Self::Sum => Reg::R5,
            Self::ActMin => Reg::R6,
            Self::ActMax => Reg::R7,
        }
    }
}

/// Quantized int8 addition with output clamp.
///
/// # Errors
///
/// `InvalidParameter` for bad parameters, `InvalidRange` when a multiplier
/// or the folded offset does not fit fp16.
pub fn add_s8(mvp: &mut Mvp, params: &AddS8Params, config: &KernelConfig) -> Result<()> {
    params.validate()?;
    info!("add_s8 x{}", params.len);
    exec::run(mvp, "add_s8", |s| emit_add_s8(s, config, params))
}

/// True if [`add_s8`] accepts `params`.
pub fn add_s8_is_supported(params: &AddS8Params, config: &KernelConfig) -> bool {
    params.validate().is_ok() && exec::probe(|s| emit_add_s8(s, config, params)).is_ok()
}

#[allow(clippy::cast_precision_loss)]
fn emit_add_s8(session: &mut Session<'_>, config: &KernelConfig, params: &AddS8Params) -> Result<()> {
    let m1 = check_fp16(params.input1_multiplier, "input1 multiplier")?;
    let m2 = check_fp16(params.input2_multiplier, "input2 multiplier")?;
    let offset = check_fp16(
        params.input1_offset as f32 * params.input1_multiplier
            + params.input2_offset as f32 * params.input2_multiplier
            + params.output_offset as f32,
        "folded offset",
    )?;
    let clip = !params.activation.is_full_range();
    let registers = [
        (AddReg::Mult1.reg(), m1.to_f32()),
        (AddReg::Offset.reg(), offset.to_f32()),
        (AddReg::Mult2.reg(), m2.to_f32()),
        (AddReg::ActMin.reg(), params.activation.min as f32),
        (AddReg::ActMax.reg(), params.activation.max as f32),
    ];
    let store = StoreConfig::one(col(AddReg::Sum.reg(), ArrayId::A2));

    for_each_block(
        session,
        config,
        params.len,
        [
            (params.input1, DataType::Int8),
            (params.input2, DataType::Int8),
            (params.output, DataType::Int8),
        ],
        &registers,
        |ctx| {
            ctx.compute(
                AluOp::Macr2a,
                AluConfig::new()
                    .z(AddReg::Sum.reg())
                    .x(AddReg::In1.reg())
                    .y(AddReg::Mult1.reg())
                    .a(AddReg::Offset.reg()),
                LoadConfig::two(
                    col(AddReg::In1.reg(), ArrayId::A0),
                    col(AddReg::In2.reg(), ArrayId::A1),
                ),
                StoreConfig::NONE,
            );
            ctx.compute(
                AluOp::Macr2a,
                AluConfig::new()
                    .z(AddReg::Sum.reg())
                    .x(AddReg::In2.reg())
                    .y(AddReg::Mult2.reg())
                    .a(AddReg::Sum.reg()),
                LoadConfig::NONE,
                if clip { StoreConfig::NONE } else { store },
            );
            if clip {
                ctx.compute(
                    AluOp::Clip2a,
                    AluConfig::new()
                        .z(AddReg::Sum.reg())
                        .x(AddReg::ActMin.reg())
                        .y(AddReg::ActMax.reg())
                        .a(AddReg::Sum.reg()),
                    LoadConfig::NONE,
                    store,
                );
            }
        },
    )
}

// ── Clamp ────────────────────────────────────────────────────────────────────

/// Clamp `len` int8 values of `buffer` in place.
///
/// Vectors shorter than `config.clamp_host_threshold` are clamped by the
/// CPU.
///
/// # Errors
///
/// `InvalidParameter` for an undersized buffer or a bad activation range.
pub fn clamp_i8(
    mvp: &mut Mvp,
    buffer: Buffer,
    len: usize,
    activation: Activation,
    config: &KernelConfig,
) -> Result<()> {
    check_vector("buffer", buffer, len, 1)?;
    activation.validate()?;
    info!("clamp_i8 x{len} to [{}, {}]", activation.min, activation.max);
    exec::run(mvp, "clamp_i8", |s| emit_clamp(s, config, buffer, len, activation))
}

/// True if [`clamp_i8`] accepts these arguments.
pub fn clamp_i8_is_supported(
    buffer: Buffer,
    len: usize,
    activation: Activation,
    config: &KernelConfig,
) -> bool {
    check_vector("buffer", buffer, len, 1).is_ok()
        && activation.validate().is_ok()
        && exec::probe(|s| emit_clamp(s, config, buffer, len, activation)).is_ok()
}

/// Clamp after every program issued so far has written `buffer`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn emit_clamp(
    session: &mut Session<'_>,
    config: &KernelConfig,
    buffer: Buffer,
    len: usize,
    activation: Activation,
) -> Result<()> {
    if activation.is_full_range() || len == 0 {
        return Ok(());
    }
    if len < config.clamp_host_threshold {
        if session.is_executing() {
            session.wait_for_completion()?;
            if let Some(memory) = session.memory_mut() {
                let region = buffer.slice(0, len);
                let clamped: Vec<i8> = memory
                    .read_i8(region)?
                    .into_iter()
                    .map(|v| activation.apply(v))
                    .collect();
                memory.write_i8(region, &clamped)?;
            }
            debug!("clamp_i8: {len} element(s) on the host");
        }
        return Ok(());
    }
    for_each_block(
        session,
        config,
        len,
        [(buffer, DataType::Int8), (buffer, DataType::Int8)],
        &[(Reg::R0, activation.min as f32), (Reg::R1, activation.max as f32)],
        |ctx| {
            ctx.compute(
                AluOp::Clip2a,
                AluConfig::new().z(Reg::R2).x(Reg::R0).y(Reg::R1).a(Reg::R2),
                LoadConfig::one(col(Reg::R2, ArrayId::A0)),
                StoreConfig::one(col(Reg::R2, ArrayId::A1)),
            );
        },
    )
}

// ── Helpers for the convolution kernels ──────────────────────────────────────

/// Zero `len` fp16 elements of `buffer`.
pub(crate) fn emit_zero_f16(
    session: &mut Session<'_>,
    config: &KernelConfig,
    buffer: Buffer,
    len: usize,
) -> Result<()> {
    for_each_block(session, config, len, [(buffer, DataType::Fp16)], &[], |ctx| {
        ctx.compute(
            AluOp::Clear,
            AluConfig::new().z(Reg::R0),
            LoadConfig::NONE,
            StoreConfig::one(col(Reg::R0, ArrayId::A0)),
        );
    })
}

/// `output[i] = (input[i] + offset) * ACCUMULATOR_SCALER` as fp16.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn emit_prescale(
    session: &mut Session<'_>,
    config: &KernelConfig,
    input: Buffer,
    output: Buffer,
    len: usize,
    offset: i32,
) -> Result<()> {
    let folded = check_fp16(offset as f32 * ACCUMULATOR_SCALER, "scaled input offset")?;
    for_each_block(
        session,
        config,
        len,
        [(input, DataType::Int8), (output, DataType::Fp16)],
        &[(Reg::R0, ACCUMULATOR_SCALER), (Reg::R1, folded.to_f32())],
        |ctx| {
            ctx.compute(
                AluOp::Macr2a,
                AluConfig::new().z(Reg::R3).x(Reg::R2).y(Reg::R0).a(Reg::R1),
                LoadConfig::one(col(Reg::R2, ArrayId::A0)),
                StoreConfig::one(col(Reg::R3, ArrayId::A1)),
            );
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_cover_vector() {
        for len in [1, 7, 1023, 1024, 1025, 3000, 1024 * 1024 + 5] {
            let bs = blocks(len);
            let mut next = 0;
            for b in &bs {
                assert_eq!(b.offset, next);
                assert!(b.cols <= MAX_DIM_SIZE && b.rows <= MAX_LOOP_ITERATIONS);
                next += b.rows * b.cols;
            }
            assert_eq!(next, len, "len {len}");
            assert!(bs.len() <= 3);
        }
        assert!(blocks(0).is_empty());
    }

    #[test]
    fn test_tail_block() {
        assert_eq!(
            blocks(2050),
            vec![
                Block { offset: 0, rows: 2, cols: 1024 },
                Block { offset: 2048, rows: 1, cols: 2 },
            ]
        );
    }

    #[test]
    fn test_packed_block_program() {
        let config = KernelConfig::default();
        let a = Buffer::new(0x1000, 64);
        let mut ctx = ProgramContext::new();
        let mut session = Session::probe(&mut ctx);
        emit_add_f16(&mut session, &config, a, a, a, 32).unwrap();
        let desc = session.program().arrays[0].unwrap();
        assert_eq!(desc.dtype(), DataType::ComplexFp16);
        assert_eq!(session.program().loops()[1].iterations, 16);
    }

    #[test]
    fn test_unpacked_when_misaligned() {
        let config = KernelConfig::default();
        let a = Buffer::new(0x1002, 64);
        let mut ctx = ProgramContext::new();
        let mut session = Session::probe(&mut ctx);
        emit_add_f16(&mut session, &config, a, a, a, 32).unwrap();
        assert_eq!(session.program().arrays[0].unwrap().dtype(), DataType::Fp16);
        assert_eq!(session.program().loops()[1].iterations, 32);
    }

    #[test]
    fn test_odd_add_f16_buffer_rejected() {
        let config = KernelConfig::default();
        let good = Buffer::new(0x1000, 16);
        let odd = Buffer::new(0x1001, 16);
        assert!(add_f16_is_supported(good, good, good, 8, &config));
        assert!(!add_f16_is_supported(good, odd, good, 8, &config));
    }

    #[test]
    fn test_full_range_clamp_emits_nothing() {
        let config = KernelConfig::default();
        let mut ctx = ProgramContext::new();
        let mut session = Session::probe(&mut ctx);
        emit_clamp(&mut session, &config, Buffer::new(0x1000, 256), 256, Activation::FULL).unwrap();
        assert_eq!(session.program().instr_count, 0);
    }
}
