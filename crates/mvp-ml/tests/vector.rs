//! Elementwise kernels on the software MVP

mod common;

use common::{download, pattern, upload};
use half::f16;
use mvp_driver::{ErrorKind, Mvp};
use mvp_ml::{
    add_f16, add_f16_is_supported, add_s8, clamp_i8, clamp_i8_is_supported, saturate_i8,
    Activation, AddS8Params, KernelConfig,
};

fn f16_buffer(mvp: &mut Mvp, values: &[f16]) -> mvp_driver::Buffer {
    let buffer = mvp.memory_mut().alloc(2 * values.len(), 4).expect("alloc");
    mvp.memory_mut().write_f16(buffer, values).expect("write");
    buffer
}

fn halves(len: usize, seed: u32) -> Vec<f16> {
    pattern(len, seed, -100, 100)
        .into_iter()
        .map(|v| f16::from_f32(f32::from(v) * 0.25))
        .collect()
}

#[test]
fn test_add_f16() {
    for len in [1, 7, 64, 1023, 1500, 2048 + 3] {
        let mut mvp = Mvp::software(1 << 16);
        let a = halves(len, 1);
        let b = halves(len, 2);
        let a_buf = f16_buffer(&mut mvp, &a);
        let b_buf = f16_buffer(&mut mvp, &b);
        let out = f16_buffer(&mut mvp, &vec![f16::ZERO; len]);

        add_f16(&mut mvp, a_buf, b_buf, out, len, &KernelConfig::new()).expect("add_f16 runs");
        let got = mvp.memory().read_f16(out).expect("read");
        let expected: Vec<f16> = a.iter().zip(&b).map(|(x, y)| *x + *y).collect();
        assert_eq!(got, expected, "len {len}");
    }
}

#[test]
fn test_add_f16_in_place() {
    let mut mvp = Mvp::software(1 << 16);
    let a = halves(100, 3);
    let b = halves(100, 4);
    let a_buf = f16_buffer(&mut mvp, &a);
    let b_buf = f16_buffer(&mut mvp, &b);
    add_f16(&mut mvp, a_buf, b_buf, a_buf, 100, &KernelConfig::new()).expect("add_f16 runs");
    let got = mvp.memory().read_f16(a_buf).expect("read");
    let expected: Vec<f16> = a.iter().zip(&b).map(|(x, y)| *x + *y).collect();
    assert_eq!(got, expected);
}

#[test]
fn test_add_f16_rejects_misaligned() {
    let mut mvp = Mvp::software(1 << 16);
    let buf = mvp.memory_mut().alloc(64, 4).expect("alloc");
    let odd = buf.slice(1, 32);
    let config = KernelConfig::new();
    assert!(!add_f16_is_supported(odd, buf, buf, 16, &config));
    let err = add_f16(&mut mvp, odd, buf, buf, 16, &config).expect_err("odd address");
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_add_s8_matches_host() {
    for (len, offset) in [(5, 0), (37, 1), (1024, 0), (1031, 3)] {
        let mut mvp = Mvp::software(1 << 16);
        let a = pattern(len, 10, -128, 127);
        let b = pattern(len, 11, -128, 127);
        let a_buf = upload(&mut mvp, &a, offset);
        let b_buf = upload(&mut mvp, &b, offset);
        let out = upload(&mut mvp, &vec![0; len], offset);

        let mut params = AddS8Params::new(a_buf, b_buf, out, len);
        params.input1_offset = 3;
        params.input1_multiplier = 0.5;
        params.input2_offset = -1;
        params.input2_multiplier = 0.25;
        params.output_offset = -2;
        params.activation = Activation::new(-100, 90);
        add_s8(&mut mvp, &params, &KernelConfig::new()).expect("add_s8 runs");

        let expected: Vec<i8> = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| {
                let v = (f32::from(x) + 3.0) * 0.5 + (f32::from(y) - 1.0) * 0.25 - 2.0;
                params.activation.apply(saturate_i8(v))
            })
            .collect();
        assert_eq!(download(&mvp, out), expected, "len {len} offset {offset}");
    }
}

#[test]
fn test_add_s8_saturates() {
    let mut mvp = Mvp::software(1 << 16);
    let a = upload(&mut mvp, &[127, -128, 100, -100], 0);
    let b = upload(&mut mvp, &[127, -128, 100, -100], 0);
    let out = upload(&mut mvp, &[0; 4], 0);
    add_s8(&mut mvp, &AddS8Params::new(a, b, out, 4), &KernelConfig::new()).expect("add_s8 runs");
    assert_eq!(download(&mvp, out), vec![127, -128, 127, -128]);
}

#[test]
fn test_clamp_host_and_device_paths() {
    let activation = Activation::new(-20, 35);
    for (len, offset) in [(3, 1), (63, 0), (64, 0), (1000, 2), (3000, 1)] {
        let mut mvp = Mvp::software(1 << 16);
        let data = pattern(len, 7, -128, 127);
        let buf = upload(&mut mvp, &data, offset);
        let config = KernelConfig::new();
        assert!(clamp_i8_is_supported(buf, len, activation, &config));
        clamp_i8(&mut mvp, buf, len, activation, &config).expect("clamp runs");

        let expected: Vec<i8> = data.iter().map(|&v| activation.apply(v)).collect();
        assert_eq!(download(&mvp, buf), expected, "len {len}");
        let on_host = len < config.clamp_host_threshold;
        assert_eq!(mvp.engine().stats().programs == 0, on_host, "len {len}");
    }
}

#[test]
fn test_clamp_threshold_zero_forces_device() {
    let mut mvp = Mvp::software(1 << 16);
    let data = pattern(5, 8, -128, 127);
    let buf = upload(&mut mvp, &data, 0);
    let config = KernelConfig::new().with_clamp_host_threshold(0);
    clamp_i8(&mut mvp, buf, 5, Activation::new(0, 10), &config).expect("clamp runs");
    assert_eq!(mvp.engine().stats().programs, 1);
    let expected: Vec<i8> = data.iter().map(|&v| v.clamp(0, 10)).collect();
    assert_eq!(download(&mvp, buf), expected);
}

#[test]
fn test_clamp_only_touches_len() {
    let mut mvp = Mvp::software(1 << 16);
    let buf = upload(&mut mvp, &[-50, 50, -50, 50], 0);
    clamp_i8(&mut mvp, buf, 2, Activation::new(-5, 5), &KernelConfig::new()).expect("clamp runs");
    assert_eq!(download(&mvp, buf), vec![-5, 5, -50, 50]);
}

#[test]
fn test_clamp_rejects_inverted_range() {
    let mut mvp = Mvp::software(1 << 16);
    let buf = upload(&mut mvp, &[0; 8], 0);
    let err = clamp_i8(&mut mvp, buf, 8, Activation::new(5, -5), &KernelConfig::new())
        .expect_err("min above max");
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}
