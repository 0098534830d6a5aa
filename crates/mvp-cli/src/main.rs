//! `mvp`: run MVP tensor kernels on the software accelerator.
//!
//! ```text
//! USAGE:
//!   mvp limits                           Program limits of the accelerator
//!   mvp avg-pool <NxHxWxC> [options]     Average pooling
//!   mvp max-pool <NxHxWxC> [options]     Max pooling
//!   mvp conv <NxHxWxC> [options]         2-D convolution
//!   mvp transpose-conv <NxHxWxC> [opts]  Transposed convolution
//! ```
//!
//! Kernel inputs are filled with a deterministic pattern. `--probe` only
//! reports whether the parameters are supported; `--disasm` prints every
//! program handed to the accelerator.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mvp_driver::limits::{
    MAX_DIM_SIZE, MAX_LOOP_ITERATIONS, MAX_STRIDE, MIN_STRIDE, NUM_ARRAYS, NUM_INSTRUCTIONS,
    NUM_LOOPS, NUM_REGISTERS,
};
use mvp_driver::{
    select_backend, BackendSelection, Buffer, DeviceMemory, Mvp, TraceBackend, TraceLog,
};
use mvp_ml::{
    average_pooling_s8, average_pooling_s8_is_supported, average_pooling_s8_with, conv2d_s8,
    conv2d_s8_is_supported, conv2d_scratch_size, max_pooling_s8, max_pooling_s8_is_supported,
    transpose_conv2d_s8, transpose_conv2d_s8_is_supported, transpose_conv2d_scratch_size,
    Activation, Conv2dParams, KernelConfig, PoolingKind, PoolingParams, Quantization, Shape,
    TransposeConv2dParams, Window,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvp", about = "MVP matrix/vector processor kernels", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the accelerator's program limits.
    Limits,
    /// Int8 average pooling.
    AvgPool {
        /// Input shape NxHxWxC.
        #[arg(value_parser = parse_shape)]
        input: Shape,
        #[command(flatten)]
        window: WindowArgs,
        /// Force one algorithm instead of the policy with fallback.
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Int8 max pooling.
    MaxPool {
        /// Input shape NxHxWxC.
        #[arg(value_parser = parse_shape)]
        input: Shape,
        #[command(flatten)]
        window: WindowArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Int8 2-D convolution.
    Conv {
        /// Input shape NxHxWxC.
        #[arg(value_parser = parse_shape)]
        input: Shape,
        /// Output channels.
        #[arg(long, default_value_t = 4)]
        out_channels: usize,
        #[command(flatten)]
        window: WindowArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Int8 transposed 2-D convolution.
    TransposeConv {
        /// Input shape NxHxWxC.
        #[arg(value_parser = parse_shape)]
        input: Shape,
        /// Output channels.
        #[arg(long, default_value_t = 4)]
        out_channels: usize,
        #[command(flatten)]
        window: WindowArgs,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct WindowArgs {
    /// Filter size HxW.
    #[arg(long, default_value = "2x2", value_parser = parse_pair)]
    filter: (usize, usize),
    /// Stride HxW.
    #[arg(long, default_value = "1x1", value_parser = parse_pair)]
    stride: (usize, usize),
    /// Top/left padding HxW.
    #[arg(long, value_parser = parse_pair)]
    pad: Option<(usize, usize)>,
    /// Dilation HxW (convolution only).
    #[arg(long, default_value = "1x1", value_parser = parse_pair)]
    dilation: (usize, usize),
}

impl WindowArgs {
    fn window(&self) -> Window {
        let window = Window::new(self.filter.0, self.filter.1, self.stride.0, self.stride.1)
            .with_dilation(self.dilation.0, self.dilation.1);
        match self.pad {
            Some((h, w)) => window.with_padding(h, w),
            None => window,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Only report whether the parameters are supported.
    #[arg(long)]
    probe: bool,
    /// Print every program handed to the accelerator.
    #[arg(long)]
    disasm: bool,
    /// Disable paired-lane walks.
    #[arg(long)]
    no_packing: bool,
    /// Wait for each program before building the next.
    #[arg(long)]
    wait_each: bool,
    /// Pre-scale convolution input into scratch.
    #[arg(long)]
    speed: bool,
    /// Output clamp MIN:MAX.
    #[arg(long, value_parser = parse_activation)]
    activation: Option<Activation>,
    /// Device memory in KiB.
    #[arg(long, default_value_t = 4096)]
    memory_kib: usize,
}

impl RunArgs {
    fn config(&self) -> KernelConfig {
        KernelConfig::new()
            .with_lane_packing(!self.no_packing)
            .with_wait_each_program(self.wait_each)
            .with_optimize_for_speed(self.speed)
    }

    fn activation(&self) -> Activation {
        self.activation.unwrap_or(Activation::FULL)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Generic,
    Optimized,
}

impl From<StrategyArg> for PoolingKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Generic => Self::Generic,
            StrategyArg::Optimized => Self::Optimized,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Limits => cmd_limits(),
        Cmd::AvgPool {
            input,
            window,
            strategy,
            run,
        } => cmd_pool(input, &window, Some(strategy), &run)?,
        Cmd::MaxPool { input, window, run } => cmd_pool(input, &window, None, &run)?,
        Cmd::Conv {
            input,
            out_channels,
            window,
            run,
        } => cmd_conv(input, out_channels, &window, &run)?,
        Cmd::TransposeConv {
            input,
            out_channels,
            window,
            run,
        } => cmd_transpose_conv(input, out_channels, &window, &run)?,
    }

    Ok(())
}

// ── Argument parsing ─────────────────────────────────────────────────────────

fn parse_dims(s: &str, count: usize) -> Result<Vec<usize>, String> {
    let dims = s
        .split('x')
        .map(|d| d.trim().parse::<usize>().map_err(|e| format!("{d:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    if dims.len() != count {
        return Err(format!("expected {count} dimensions separated by 'x', got {s:?}"));
    }
    Ok(dims)
}

fn parse_shape(s: &str) -> Result<Shape, String> {
    let d = parse_dims(s, 4)?;
    Ok(Shape::new(d[0], d[1], d[2], d[3]))
}

fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let d = parse_dims(s, 2)?;
    Ok((d[0], d[1]))
}

fn parse_activation(s: &str) -> Result<Activation, String> {
    let (min, max) = s
        .split_once(':')
        .ok_or_else(|| format!("expected MIN:MAX, got {s:?}"))?;
    let min = min.trim().parse().map_err(|e| format!("{min:?}: {e}"))?;
    let max = max.trim().parse().map_err(|e| format!("{max:?}: {e}"))?;
    Ok(Activation::new(min, max))
}

// ── Device and data ──────────────────────────────────────────────────────────

struct Device {
    mvp: Mvp,
    log: Option<TraceLog>,
}

impl Device {
    fn new(run: &RunArgs) -> Self {
        let memory = DeviceMemory::new(run.memory_kib * 1024);
        if run.disasm {
            let (backend, log) =
                TraceBackend::forwarding(select_backend(BackendSelection::Software));
            Self {
                mvp: Mvp::with_backend(Box::new(backend), memory),
                log: Some(log),
            }
        } else {
            Self {
                mvp: Mvp::with_backend(select_backend(BackendSelection::Software), memory),
                log: None,
            }
        }
    }

    /// Allocate `len` bytes filled with values in `[lo, hi]`.
    fn filled(&mut self, len: usize, seed: u32, lo: i8, hi: i8) -> Result<Buffer> {
        let buffer = self.mvp.memory_mut().alloc(len, 4)?;
        self.mvp.memory_mut().write_i8(buffer, &pattern(len, seed, lo, hi))?;
        Ok(buffer)
    }

    fn zeroed(&mut self, len: usize) -> Result<Buffer> {
        Ok(self.mvp.memory_mut().alloc(len, 4)?)
    }

    fn report(&self, output: Buffer, shape: Shape) -> Result<()> {
        if let Some(log) = &self.log {
            for (i, program) in log.programs()?.iter().enumerate() {
                println!("program {i}:");
                print!("{program}");
            }
        }
        let stats = self.mvp.engine().stats();
        println!(
            "{} program(s), {} instruction(s) on {}",
            stats.programs,
            stats.instructions,
            self.mvp.engine().backend_type()
        );
        print_tensor(&self.mvp.memory().read_i8(output)?, shape);
        Ok(())
    }
}

fn pattern(len: usize, seed: u32, lo: i8, hi: i8) -> Vec<i8> {
    let span = i32::from(hi) - i32::from(lo) + 1;
    let mut state = seed.wrapping_mul(2_654_435_761) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = i32::from(lo) + (state % span.unsigned_abs()) as i32;
            i8::try_from(v).unwrap_or(hi)
        })
        .collect()
}

fn print_tensor(values: &[i8], shape: Shape) {
    println!("output {shape}");
    if values.len() > 256 {
        let sum: i64 = values.iter().map(|&v| i64::from(v)).sum();
        let min = values.iter().min().copied().unwrap_or_default();
        let max = values.iter().max().copied().unwrap_or_default();
        println!("  sum {sum}  min {min}  max {max}");
        return;
    }
    for row in values.chunks(shape.row_elements().max(1)) {
        let cells: Vec<String> = row.iter().map(|v| format!("{v:4}")).collect();
        println!("  {}", cells.join(""));
    }
}

fn out_extent(input: usize, filter: usize, stride: usize, pad: usize, dilation: usize) -> Result<usize> {
    let span = dilation * (filter.max(1) - 1) + 1;
    let padded = input + 2 * pad;
    if padded < span || stride == 0 {
        bail!("window of {span} does not fit {input} inputs with padding {pad}");
    }
    Ok((padded - span) / stride + 1)
}

fn forward_output(input: Shape, window: &Window, channels: usize) -> Result<Shape> {
    Ok(Shape::new(
        input.batches,
        out_extent(
            input.height,
            window.filter_height,
            window.stride_height,
            window.pad_height,
            window.dilation_height,
        )
        .context("height")?,
        out_extent(
            input.width,
            window.filter_width,
            window.stride_width,
            window.pad_width,
            window.dilation_width,
        )
        .context("width")?,
        channels,
    ))
}

fn print_support(kernel: &str, supported: bool) {
    println!(
        "{kernel}: {}",
        if supported { "supported" } else { "unsupported" }
    );
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn cmd_limits() {
    println!("Registers      : {NUM_REGISTERS}");
    println!("Arrays         : {NUM_ARRAYS} (3 dimensions each)");
    println!("Instructions   : {NUM_INSTRUCTIONS}");
    println!("Loops          : {NUM_LOOPS} x up to {MAX_LOOP_ITERATIONS}");
    println!("Dimension size : 1..={MAX_DIM_SIZE}");
    println!("Stride         : {MIN_STRIDE}..={MAX_STRIDE} elements");
}

/// `average` is `Some(strategy)` for average pooling, `None` for max.
fn cmd_pool(
    input_shape: Shape,
    window: &WindowArgs,
    average: Option<Option<StrategyArg>>,
    run: &RunArgs,
) -> Result<()> {
    let window = window.window();
    let output_shape = forward_output(input_shape, &window, input_shape.channels)?;
    let mut device = Device::new(run);
    let params = PoolingParams {
        input_shape,
        output_shape,
        window,
        activation: run.activation(),
        input: device.filled(input_shape.element_count(), 1, i8::MIN, i8::MAX)?,
        output: device.zeroed(output_shape.element_count())?,
    };
    let config = run.config();

    if run.probe {
        match average {
            Some(_) => print_support(
                "average_pooling_s8",
                average_pooling_s8_is_supported(&params, &config),
            ),
            None => print_support("max_pooling_s8", max_pooling_s8_is_supported(&params, &config)),
        }
        return Ok(());
    }

    info!("pooling {input_shape} -> {output_shape}");
    match average {
        Some(Some(strategy)) => {
            let kind = PoolingKind::from(strategy);
            average_pooling_s8_with(&mut device.mvp, &params, &config, kind.strategy())?;
        }
        Some(None) => average_pooling_s8(&mut device.mvp, &params, &config)?,
        None => max_pooling_s8(&mut device.mvp, &params, &config)?,
    }
    device.report(params.output, output_shape)
}

fn cmd_conv(input_shape: Shape, out_channels: usize, window: &WindowArgs, run: &RunArgs) -> Result<()> {
    let window = window.window();
    let output_shape = forward_output(input_shape, &window, out_channels)?;
    let filter_shape = Shape::new(
        out_channels,
        window.filter_height,
        window.filter_width,
        input_shape.channels,
    );
    let mut device = Device::new(run);
    let mut params = Conv2dParams {
        input_shape,
        filter_shape,
        output_shape,
        window,
        quant: Quantization::uniform(out_channels, 0.25),
        activation: run.activation(),
        input: device.filled(input_shape.element_count(), 1, -8, 7)?,
        filter: device.filled(filter_shape.element_count(), 2, -4, 4)?,
        output: device.zeroed(output_shape.element_count())?,
        scratch: Buffer::new(0, 0),
    };
    let config = run.config();
    params.scratch = device.zeroed(conv2d_scratch_size(&params, &config))?;

    if run.probe {
        print_support("conv2d_s8", conv2d_s8_is_supported(&params, &config));
        return Ok(());
    }
    conv2d_s8(&mut device.mvp, &params, &config)?;
    device.report(params.output, output_shape)
}

fn cmd_transpose_conv(
    input_shape: Shape,
    out_channels: usize,
    window: &WindowArgs,
    run: &RunArgs,
) -> Result<()> {
    let window = window.window();
    let extent = |input: usize, filter: usize, stride: usize, pad: usize| {
        ((input - 1) * stride + filter)
            .checked_sub(2 * pad)
            .filter(|&e| e > 0)
            .context("padding removes the whole output")
    };
    if !input_shape.is_populated() {
        bail!("input shape {input_shape} has a zero dimension");
    }
    let output_shape = Shape::new(
        input_shape.batches,
        extent(
            input_shape.height,
            window.filter_height,
            window.stride_height,
            window.pad_height,
        )?,
        extent(
            input_shape.width,
            window.filter_width,
            window.stride_width,
            window.pad_width,
        )?,
        out_channels,
    );
    let filter_shape = Shape::new(
        out_channels,
        window.filter_height,
        window.filter_width,
        input_shape.channels,
    );
    let mut device = Device::new(run);
    let mut params = TransposeConv2dParams {
        input_shape,
        filter_shape,
        output_shape,
        window,
        quant: Quantization::uniform(out_channels, 0.25),
        activation: run.activation(),
        input: device.filled(input_shape.element_count(), 1, -8, 7)?,
        filter: device.filled(filter_shape.element_count(), 2, -4, 4)?,
        output: device.zeroed(output_shape.element_count())?,
        scratch: Buffer::new(0, 0),
    };
    params.scratch = device.zeroed(transpose_conv2d_scratch_size(&params))?;
    let config = run.config();

    if run.probe {
        print_support(
            "transpose_conv2d_s8",
            transpose_conv2d_s8_is_supported(&params, &config),
        );
        return Ok(());
    }
    transpose_conv2d_s8(&mut device.mvp, &params, &config)?;
    device.report(params.output, output_shape)
}
