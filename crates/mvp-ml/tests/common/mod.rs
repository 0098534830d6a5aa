//! Host reference loops and fixtures shared by the kernel tests

#![allow(dead_code)]

use half::f16;
use mvp_driver::{Buffer, Mvp};
use mvp_ml::{
    saturate_i8, Activation, Quantization, Shape, Window, ACCUMULATOR_MULTIPLIER,
    ACCUMULATOR_SCALER,
};

/// Deterministic values in `[lo, hi]`.
pub fn pattern(len: usize, seed: u32, lo: i8, hi: i8) -> Vec<i8> {
    let span = u32::try_from(i32::from(hi) - i32::from(lo) + 1).expect("hi >= lo");
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let v = i32::from(lo) + i32::try_from((state >> 16) % span).expect("small");
            i8::try_from(v).expect("in range")
        })
        .collect()
}

/// Copy `data` into freshly allocated device memory `offset` bytes past a
/// 4-byte boundary.
pub fn upload(mvp: &mut Mvp, data: &[i8], offset: usize) -> Buffer {
    let buffer = mvp
        .memory_mut()
        .alloc_offset(data.len(), 4, offset)
        .expect("alloc input");
    mvp.memory_mut().write_i8(buffer, data).expect("write input");
    buffer
}

/// Allocate `len` bytes filled with `fill`.
pub fn alloc_filled(mvp: &mut Mvp, len: usize, offset: usize, fill: i8) -> Buffer {
    upload(mvp, &vec![fill; len], offset)
}

pub fn download(mvp: &Mvp, buffer: Buffer) -> Vec<i8> {
    mvp.memory().read_i8(buffer).expect("read output")
}

fn taps(out: usize, stride: usize, pad: usize, filter: usize, input: usize) -> Vec<usize> {
    (0..filter)
        .filter_map(|f| {
            let i = (out * stride + f).checked_sub(pad)?;
            (i < input).then_some(i)
        })
        .collect()
}

/// Average pooling with the fp16 accumulation the accelerator performs.
pub fn avg_pool_ref(
    input: &[i8],
    in_shape: Shape,
    out_shape: Shape,
    window: &Window,
    activation: Activation,
) -> Vec<i8> {
    let mut out = vec![0i8; out_shape.element_count()];
    for n in 0..out_shape.batches {
        for oy in 0..out_shape.height {
            let ys = taps(
                oy,
                window.stride_height,
                window.pad_height,
                window.filter_height,
                in_shape.height,
            );
            for ox in 0..out_shape.width {
                let xs = taps(
                    ox,
                    window.stride_width,
                    window.pad_width,
                    window.filter_width,
                    in_shape.width,
                );
                for c in 0..out_shape.channels {
                    let mut acc = f16::ZERO;
                    for &y in &ys {
                        for &x in &xs {
                            let v = f32::from(input[in_shape.offset(n, y, x, c)]);
                            acc = f16::from_f32(v.mul_add(ACCUMULATOR_SCALER, acc.to_f32()));
                        }
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let scale =
                        f16::from_f32(ACCUMULATOR_MULTIPLIER / (ys.len() * xs.len()) as f32);
                    let value = f16::from_f32(acc.to_f32() * scale.to_f32());
                    out[out_shape.offset(n, oy, ox, c)] =
                        activation.apply(saturate_i8(value.to_f32()));
                }
            }
        }
    }
    out
}

/// Max pooling over the valid part of each window.
pub fn max_pool_ref(
    input: &[i8],
    in_shape: Shape,
    out_shape: Shape,
    window: &Window,
    activation: Activation,
) -> Vec<i8> {
    let mut out = vec![0i8; out_shape.element_count()];
    for n in 0..out_shape.batches {
        for oy in 0..out_shape.height {
            let ys = taps(
                oy,
                window.stride_height,
                window.pad_height,
                window.filter_height,
                in_shape.height,
            );
            for ox in 0..out_shape.width {
                let xs = taps(
                    ox,
                    window.stride_width,
                    window.pad_width,
                    window.filter_width,
                    in_shape.width,
                );
                for c in 0..out_shape.channels {
                    let mut best = i8::MIN;
                    for &y in &ys {
                        for &x in &xs {
                            best = best.max(input[in_shape.offset(n, y, x, c)]);
                        }
                    }
                    out[out_shape.offset(n, oy, ox, c)] = activation.apply(best);
                }
            }
        }
    }
    out
}

fn requantize(acc: i64, oc: usize, quant: &Quantization, activation: Activation) -> i8 {
    let m = f64::from(quant.output_multiplier[oc]);
    #[allow(clippy::cast_precision_loss)]
    let value = acc as f64 * m + f64::from(quant.bias[oc]) * m + f64::from(quant.output_offset);
    #[allow(clippy::cast_possible_truncation)]
    activation.apply(saturate_i8(value as f32))
}

/// Convolution in exact integer arithmetic.
#[allow(clippy::too_many_arguments)]
pub fn conv_ref(
    input: &[i8],
    in_shape: Shape,
    filter: &[i8],
    filter_shape: Shape,
    out_shape: Shape,
    window: &Window,
    quant: &Quantization,
    activation: Activation,
) -> Vec<i8> {
    let mut out = vec![0i8; out_shape.element_count()];
    for n in 0..out_shape.batches {
        for oy in 0..out_shape.height {
            for ox in 0..out_shape.width {
                for oc in 0..out_shape.channels {
                    let mut acc = 0i64;
                    for fy in 0..filter_shape.height {
                        let Some(y) = (oy * window.stride_height + fy * window.dilation_height)
                            .checked_sub(window.pad_height)
                            .filter(|&y| y < in_shape.height)
                        else {
                            continue;
                        };
                        for fx in 0..filter_shape.width {
                            let Some(x) = (ox * window.stride_width + fx * window.dilation_width)
                                .checked_sub(window.pad_width)
                                .filter(|&x| x < in_shape.width)
                            else {
                                continue;
                            };
                            for ic in 0..in_shape.channels {
                                let v = i64::from(input[in_shape.offset(n, y, x, ic)])
                                    + i64::from(quant.input_offset);
                                let w = i64::from(filter[filter_shape.offset(oc, fy, fx, ic)]);
                                acc += v * w;
                            }
                        }
                    }
                    out[out_shape.offset(n, oy, ox, oc)] = requantize(acc, oc, quant, activation);
                }
            }
        }
    }
    out
}

/// Transposed convolution in exact integer arithmetic.
#[allow(clippy::too_many_arguments)]
pub fn transpose_conv_ref(
    input: &[i8],
    in_shape: Shape,
    filter: &[i8],
    filter_shape: Shape,
    out_shape: Shape,
    window: &Window,
    quant: &Quantization,
    activation: Activation,
) -> Vec<i8> {
    let mut acc = vec![0i64; out_shape.element_count()];
    for n in 0..in_shape.batches {
        for iy in 0..in_shape.height {
            for ix in 0..in_shape.width {
                for fy in 0..filter_shape.height {
                    let Some(oy) = (iy * window.stride_height + fy)
                        .checked_sub(window.pad_height)
                        .filter(|&oy| oy < out_shape.height)
                    else {
                        continue;
                    };
                    for fx in 0..filter_shape.width {
                        let Some(ox) = (ix * window.stride_width + fx)
                            .checked_sub(window.pad_width)
                            .filter(|&ox| ox < out_shape.width)
                        else {
                            continue;
                        };
                        for oc in 0..out_shape.channels {
                            for ic in 0..in_shape.channels {
                                let v = i64::from(input[in_shape.offset(n, iy, ix, ic)])
                                    + i64::from(quant.input_offset);
                                let w = i64::from(filter[filter_shape.offset(oc, fy, fx, ic)]);
                                acc[out_shape.offset(n, oy, ox, oc)] += v * w;
                            }
                        }
                    }
                }
            }
        }
    }
    acc.iter()
        .enumerate()
        .map(|(i, &a)| requantize(a, i % out_shape.channels, quant, activation))
        .collect()
}
