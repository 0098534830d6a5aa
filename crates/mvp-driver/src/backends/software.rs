// SPDX-License-Identifier: AGPL-3.0-only

//! Software (virtual MVP) backend
//!
//! Implements the `MvpBackend` trait by decoding the program register image
//! and interpreting it instruction by instruction against [`DeviceMemory`].
//! This enables:
//!
//! 1. **CI without hardware**: every kernel runs end to end on the host and
//!    is compared against plain reference loops.
//!
//! 2. **Program validation**: malformed programs fault the same way the
//!    accelerator does (bus, alignment, array, loop and ALU faults), so tiling
//!    bugs surface as errors rather than silent corruption.
//!
//! ## Execution model
//!
//! ```text
//! for each instruction at pc:
//!     loads      (register ← array, then auto-increment)
//!     ALU        (Z = op(X, Y, A), fp16 result)
//!     store      (array ← register with saturating conversion, then increment)
//!     loop ends  (innermost first: count down, jump back or complete)
//! ```
//!
//! When a loop completes its counter reloads and its post-loop increments
//! are applied before its resets. Array indices wrap independently per
//! dimension. Arithmetic is evaluated in `f32` and rounded once to fp16.

use crate::array::{ArrayDescriptor, DataType, Dim};
use crate::backend::{BackendType, Completion, MvpBackend};
use crate::error::{FaultKind, MvpError, Result};
use crate::memory::DeviceMemory;
use crate::program::{AluInput, ArrayId, Instruction, Program, RegValue, Stream};
use half::f16;
use mvp_chip::image::ProgramImage;
use mvp_chip::limits::{NUM_ARRAYS, NUM_LOOPS};
use mvp_chip::opcode::AluOp;
use mvp_chip::regs::{irq, loopcfg};
use tracing::{debug, trace};

/// Default bound on executed instructions per program.
pub const DEFAULT_INSTRUCTION_LIMIT: u64 = 1 << 32;

/// Software (virtual MVP) backend.
#[derive(Debug)]
pub struct SoftwareBackend {
    pending: Option<Program>,
    instruction_limit: u64,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    /// Create an idle backend.
    pub fn new() -> Self {
        Self {
            pending: None,
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
        }
    }

    /// Fault with a loop fault after `limit` executed instructions.
    #[must_use]
    pub fn with_instruction_limit(mut self, limit: u64) -> Self {
        self.instruction_limit = limit;
        self
    }
}

impl MvpBackend for SoftwareBackend {
    fn start(&mut self, image: &ProgramImage) -> Result<()> {
        if self.pending.is_some() {
            return Err(MvpError::invalid_state("software MVP is already running a program"));
        }
        self.pending = Some(Program::from_image(image)?);
        Ok(())
    }

    fn wait(&mut self, memory: &mut DeviceMemory) -> Result<Completion> {
        let Some(program) = self.pending.take() else {
            return Ok(Completion::default());
        };
        let completion = Machine::new(&program).run(memory, self.instruction_limit)?;
        trace!(
            "software MVP: {} instructions, flags {:#x}",
            completion.instructions,
            completion.flags
        );
        Ok(completion)
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }
}

/// Register value widened for arithmetic.
#[derive(Debug, Clone, Copy, Default)]
struct Lanes {
    re: f32,
    im: f32,
}

impl Lanes {
    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            re: f(self.re),
            im: f(self.im),
        }
    }

    fn zip(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Self {
            re: f(self.re, other.re),
            im: f(self.im, other.im),
        }
    }
}

/// Interpreter state for one program run.
struct Machine<'p> {
    program: &'p Program,
    regs: [RegValue; 8],
    index: [[usize; 3]; NUM_ARRAYS],
    counters: [usize; NUM_LOOPS],
    flags: u32,
}

impl<'p> Machine<'p> {
    fn new(program: &'p Program) -> Self {
        let mut counters = [0; NUM_LOOPS];
        for (c, l) in counters.iter_mut().zip(program.loops()) {
            *c = l.iterations;
        }
        Self {
            program,
            regs: program.regs,
            index: [[0; 3]; NUM_ARRAYS],
            counters,
            flags: 0,
        }
    }

    fn fault(kind: FaultKind, pc: usize, address: u32) -> MvpError {
        debug!("software MVP fault: {kind} at pc {pc} ({address:#010x})");
        MvpError::Fault { kind, pc, address }
    }

    fn run(mut self, memory: &mut DeviceMemory, limit: u64) -> Result<Completion> {
        let program = self.program;
        let count = program.instr_count;

        // Loops ending at each pc, innermost (latest begin, highest id) first.
        let mut ends_at: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (n, l) in program.loops().iter().enumerate() {
            if l.iterations == 0 || l.begin > l.end || l.end >= count {
                return Err(Self::fault(FaultKind::Loop, l.end, 0));
            }
            ends_at[l.end].push(n);
        }
        for list in &mut ends_at {
            list.sort_by_key(|&n| std::cmp::Reverse((program.loops[n].begin, n)));
        }

        let mut pc = 0;
        let mut executed: u64 = 0;
        loop {
            let ins = &program.instructions[pc];
            self.step(pc, ins, memory)?;
            executed += 1;
            if executed > limit {
                return Err(Self::fault(FaultKind::Loop, pc, 0));
            }

            let mut next = pc + 1;
            for &n in &ends_at[pc] {
                self.counters[n] -= 1;
                if self.counters[n] > 0 {
                    next = program.loops[n].begin;
                    break;
                }
                self.counters[n] = program.loops[n].iterations;
                self.complete_loop(n);
            }

            if next == pc + 1 && ins.end_program {
                break;
            }
            if next >= count {
                return Err(Self::fault(FaultKind::Loop, pc, 0));
            }
            pc = next;
        }

        Ok(Completion {
            instructions: executed,
            flags: self.flags | irq::PROGDONE,
        })
    }

    fn complete_loop(&mut self, n: usize) {
        let l = &self.program.loops[n];
        for (a, slot) in self.program.arrays.iter().enumerate() {
            let Some(desc) = slot else { continue };
            for d in 0..3 {
                let bit = loopcfg::array_dim_bit(a, d);
                if l.incr & bit != 0 {
                    self.index[a][d] = (self.index[a][d] + 1) % desc_size(desc, d);
                }
                if l.reset & bit != 0 {
                    self.index[a][d] = 0;
                }
            }
        }
    }

    fn advance(&mut self, stream: &Stream, desc: &ArrayDescriptor) {
        let a = stream.array.index();
        for (d, on) in stream.incr.iter().enumerate() {
            if *on {
                self.index[a][d] = (self.index[a][d] + 1) % desc_size(desc, d);
            }
        }
    }

    fn locate(&self, pc: usize, stream: &Stream) -> Result<(ArrayDescriptor, u32)> {
        let desc = self.program.arrays[stream.array.index()]
            .ok_or_else(|| Self::fault(FaultKind::Array, pc, 0))?;
        let address = desc
            .address_of(self.index[stream.array.index()])
            .ok_or_else(|| Self::fault(FaultKind::BusError, pc, desc.base()))?;
        let align = desc.dtype().element_bytes().min(4) as u32;
        if address % align != 0 {
            return Err(Self::fault(FaultKind::BusAlignment, pc, address));
        }
        Ok((desc, address))
    }

    fn step(&mut self, pc: usize, ins: &Instruction, memory: &mut DeviceMemory) -> Result<()> {
        for stream in ins.load.streams.iter().flatten() {
            let (desc, address) = self.locate(pc, stream)?;
            let bytes = memory
                .read_bytes(address, desc.dtype().element_bytes())
                .map_err(|_| Self::fault(FaultKind::BusError, pc, address))?;
            self.regs[stream.reg.index()] = decode_element(desc.dtype(), bytes);
            self.advance(stream, &desc);
        }

        if ins.op != AluOp::Noop {
            let value = self.alu(pc, ins)?;
            self.regs[ins.alu.z.index()] = value;
        }

        if let Some(stream) = ins.store.stream {
            let (desc, address) = self.locate(pc, &stream)?;
            let bytes = encode_element(desc.dtype(), self.regs[stream.reg.index()], &mut self.flags);
            memory
                .write_bytes(address, &bytes)
                .map_err(|_| Self::fault(FaultKind::BusError, pc, address))?;
            self.advance(&stream, &desc);
        }
        Ok(())
    }

    fn input(&self, input: AluInput) -> Lanes {
        let r = self.regs[input.reg.index()];
        let lane = |v: f16, zero: bool, negate: bool| {
            if zero {
                0.0
            } else if negate {
                -v.to_f32()
            } else {
                v.to_f32()
            }
        };
        Lanes {
            re: lane(r.re, input.real_zero, input.real_negate),
            im: lane(r.im, input.imag_zero, input.imag_negate),
        }
    }

    fn alu(&mut self, pc: usize, ins: &Instruction) -> Result<RegValue> {
        let x = self.input(ins.alu.x);
        let y = self.input(ins.alu.y);
        let a = self.input(ins.alu.a);
        let r = match ins.op {
            AluOp::Clear => Lanes::default(),
            AluOp::Copy => a,
            AluOp::Swap => Lanes { re: a.im, im: a.re },
            AluOp::Dbl => a.map(|v| v + v),
            AluOp::Relu2 => a.map(|v| v.max(0.0)),
            AluOp::Nrelu2 => a.map(|v| v.min(0.0)),
            AluOp::Inc2 => a.map(|v| v + 1.0),
            AluOp::Dec2 => a.map(|v| v - 1.0),
            AluOp::Addr => Lanes { re: a.re + a.im, im: 0.0 },
            AluOp::Max => Lanes { re: a.re.max(a.im), im: 0.0 },
            AluOp::Min => Lanes { re: a.re.min(a.im), im: 0.0 },
            AluOp::Addc => x.zip(a, |p, q| p + q),
            AluOp::Max2a => x.zip(a, f32::max),
            AluOp::Min2a => x.zip(a, f32::min),
            AluOp::Addr2b => x.zip(y, |p, q| p + q),
            AluOp::Max2b => x.zip(y, f32::max),
            AluOp::Min2b => x.zip(y, f32::min),
            AluOp::Mulc => Lanes {
                re: x.re * y.re - x.im * y.im,
                im: x.re * y.im + x.im * y.re,
            },
            AluOp::Mulr2a => x.zip(y, |p, q| p * q),
            AluOp::Macc => Lanes {
                re: x.re * y.re - x.im * y.im + a.re,
                im: x.re * y.im + x.im * y.re + a.im,
            },
            AluOp::Macr2a => Lanes {
                re: x.re.mul_add(y.re, a.re),
                im: x.im.mul_add(y.im, a.im),
            },
            AluOp::Clip2a => Lanes {
                re: a.re.max(x.re).min(y.re),
                im: a.im.max(x.im).min(y.im),
            },
            _ => return Err(Self::fault(FaultKind::Alu, pc, 0)),
        };
        Ok(self.round(r))
    }

    fn round(&mut self, r: Lanes) -> RegValue {
        for v in [r.re, r.im] {
            if v.is_nan() {
                self.flags |= irq::ALUNAN;
            } else if v.abs() > f16::MAX.to_f32() {
                self.flags |= irq::ALUOF;
            }
        }
        RegValue {
            re: f16::from_f32(r.re),
            im: f16::from_f32(r.im),
        }
    }
}

fn desc_size(desc: &ArrayDescriptor, d: usize) -> usize {
    desc.size(Dim::ALL[d])
}

fn decode_element(dtype: DataType, bytes: &[u8]) -> RegValue {
    let lane = |i: usize| -> f16 {
        match dtype {
            DataType::Uint8 | DataType::ComplexUint8 => f16::from_f32(f32::from(bytes[i])),
            DataType::Int8 | DataType::ComplexInt8 => {
                f16::from_f32(f32::from(i8::from_ne_bytes([bytes[i]])))
            }
            DataType::Fp16 | DataType::ComplexFp16 => {
                f16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]])
            }
        }
    };
    RegValue {
        re: lane(0),
        im: if dtype.is_complex() { lane(1) } else { f16::ZERO },
    }
}

/// Saturating round-to-nearest-even conversion of one lane.
fn convert_int(value: f16, lo: f32, hi: f32, flags: &mut u32) -> f32 {
    let v = value.to_f32();
    if v.is_nan() {
        *flags |= irq::STORECONVERTNAN;
        return 0.0;
    }
    if v.is_infinite() {
        *flags |= irq::STORECONVERTINF;
    }
    let r = v.round_ties_even();
    if r > hi {
        *flags |= irq::STORECONVERTOF;
        hi
    } else if r < lo {
        *flags |= irq::STORECONVERTOF;
        lo
    } else {
        r
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_element(dtype: DataType, value: RegValue, flags: &mut u32) -> Vec<u8> {
    let lanes = if dtype.is_complex() {
        vec![value.re, value.im]
    } else {
        vec![value.re]
    };
    let mut out = Vec::with_capacity(dtype.element_bytes());
    for lane in lanes {
        match dtype {
            DataType::Uint8 | DataType::ComplexUint8 => {
                out.push(convert_int(lane, 0.0, 255.0, flags) as u8);
            }
            DataType::Int8 | DataType::ComplexInt8 => {
                let v = convert_int(lane, -128.0, 127.0, flags) as i8;
                out.extend_from_slice(&v.to_ne_bytes());
            }
            DataType::Fp16 | DataType::ComplexFp16 => out.extend_from_slice(&lane.to_le_bytes()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramContext;
    use crate::program::{AluConfig, LoadConfig, Reg, StoreConfig};
    use crate::ErrorKind;

    fn run(ctx: &ProgramContext, memory: &mut DeviceMemory) -> Result<Completion> {
        let mut backend = SoftwareBackend::new();
        backend.start(&ctx.program().encode())?;
        assert!(backend.is_busy());
        backend.wait(memory)
    }

    #[test]
    fn copy_with_saturating_store() {
        let mut mem = DeviceMemory::new(64);
        let src = mem.alloc(8, 2).unwrap();
        let dst = mem.alloc(4, 1).unwrap();
        let values: Vec<f16> = [1.5, 2.5, -300.0, 127.4].iter().map(|v| f16::from_f32(*v)).collect();
        mem.write_f16(src, &values).unwrap();

        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.config_array(ArrayId::A0, src.addr, DataType::Fp16, [1, 1, 4], [0, 0, 1]);
        ctx.config_array(ArrayId::A1, dst.addr, DataType::Int8, [1, 1, 4], [0, 0, 1]);
        ctx.begin_loop(4);
        ctx.compute(
            AluOp::Copy,
            AluConfig::new().z(Reg::R1).a(Reg::R0),
            LoadConfig::one(Stream::new(Reg::R0, ArrayId::A0).incr(Dim::Col)),
            StoreConfig::one(Stream::new(Reg::R1, ArrayId::A1).incr(Dim::Col)),
        );
        ctx.end_loop();
        ctx.seal().unwrap();

        let done = run(&ctx, &mut mem).unwrap();
        assert_eq!(done.instructions, 4);
        assert_ne!(done.flags & irq::STORECONVERTOF, 0);
        assert_eq!(mem.read_i8(dst).unwrap(), vec![2, 2, -128, 127]);
    }

    #[test]
    fn nested_loops_with_postloop_actions_sum_rows() {
        // 3x4 int8 matrix, one output per row
        let mut mem = DeviceMemory::new(64);
        let src = mem.alloc(12, 1).unwrap();
        let dst = mem.alloc(3, 1).unwrap();
        mem.write_i8(src, &[1, 2, 3, 4, 5, 6, 7, 8, -1, -2, -3, -4]).unwrap();

        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.config_array(ArrayId::A0, src.addr, DataType::Int8, [1, 3, 4], [0, 4, 1]);
        ctx.config_array(ArrayId::A1, dst.addr, DataType::Int8, [1, 1, 3], [0, 0, 1]);
        ctx.set_reg_f16(Reg::R1, 1.0);
        ctx.begin_loop(3);
        ctx.compute(AluOp::Clear, AluConfig::new().z(Reg::R2), LoadConfig::NONE, StoreConfig::NONE);
        ctx.begin_loop(4);
        ctx.compute(
            AluOp::Macr2a,
            AluConfig::new().z(Reg::R2).x(Reg::R3).y(Reg::R1).a(Reg::R2),
            LoadConfig::one(Stream::new(Reg::R3, ArrayId::A0).incr(Dim::Col)),
            StoreConfig::NONE,
        );
        ctx.end_loop();
        ctx.postloop_incr_dim(ArrayId::A0, Dim::Row);
        ctx.compute(
            AluOp::Noop,
            AluConfig::new(),
            LoadConfig::NONE,
            StoreConfig::one(Stream::new(Reg::R2, ArrayId::A1).incr(Dim::Col)),
        );
        ctx.end_loop();
        ctx.seal().unwrap();

        let done = run(&ctx, &mut mem).unwrap();
        assert_eq!(done.instructions, 3 * (1 + 4 + 1));
        assert_eq!(mem.read_i8(dst).unwrap(), vec![10, 26, -10]);
    }

    #[test]
    fn packed_lanes_are_independent() {
        let mut mem = DeviceMemory::new(64);
        let a = mem.alloc(4, 2).unwrap();
        let b = mem.alloc(4, 2).unwrap();
        mem.write_i8(a, &[1, -2, 3, -4]).unwrap();
        mem.write_i8(b, &[5, 5, 5, 5]).unwrap();

        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.config_array(ArrayId::A0, a.addr, DataType::ComplexInt8, [1, 1, 2], [0, 0, 1]);
        ctx.config_array(ArrayId::A1, b.addr, DataType::ComplexInt8, [1, 1, 2], [0, 0, 1]);
        ctx.begin_loop(2);
        ctx.compute(
            AluOp::Max2a,
            AluConfig::new().z(Reg::R2).x(Reg::R0).a(Reg::R1),
            LoadConfig::two(
                Stream::new(Reg::R0, ArrayId::A0).incr(Dim::Col),
                Stream::new(Reg::R1, ArrayId::A1),
            ),
            StoreConfig::one(Stream::new(Reg::R2, ArrayId::A1).incr(Dim::Col)),
        );
        ctx.end_loop();
        ctx.seal().unwrap();

        run(&ctx, &mut mem).unwrap();
        assert_eq!(mem.read_i8(b).unwrap(), vec![5, 5, 5, 5]);
        mem.write_i8(b, &[0, -3, 9, -9]).unwrap();
        run(&ctx, &mut mem).unwrap();
        assert_eq!(mem.read_i8(b).unwrap(), vec![1, -2, 9, -4]);
    }

    #[test]
    fn misaligned_paired_access_faults() {
        let mut mem = DeviceMemory::new(64);
        let a = mem.alloc_offset(4, 2, 1).unwrap();

        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.config_array(ArrayId::A0, a.addr, DataType::ComplexInt8, [1, 1, 1], [0, 0, 1]);
        ctx.compute(
            AluOp::Noop,
            AluConfig::new(),
            LoadConfig::one(Stream::new(Reg::R0, ArrayId::A0)),
            StoreConfig::NONE,
        );
        ctx.seal().unwrap();

        let err = run(&ctx, &mut mem).unwrap_err();
        assert!(matches!(
            err,
            MvpError::Fault {
                kind: FaultKind::BusAlignment,
                pc: 0,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Fail);
    }

    #[test]
    fn unconfigured_array_faults() {
        let mut mem = DeviceMemory::new(16);
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.compute(
            AluOp::Noop,
            AluConfig::new(),
            LoadConfig::one(Stream::new(Reg::R0, ArrayId::A3)),
            StoreConfig::NONE,
        );
        ctx.seal().unwrap();
        assert!(matches!(
            run(&ctx, &mut mem),
            Err(MvpError::Fault {
                kind: FaultKind::Array,
                ..
            })
        ));
    }

    #[test]
    fn instruction_limit_stops_runaway_programs() {
        let mut mem = DeviceMemory::new(16);
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        ctx.begin_loop(1024);
        ctx.begin_loop(1024);
        ctx.compute(AluOp::Noop, AluConfig::new(), LoadConfig::NONE, StoreConfig::NONE);
        ctx.end_loop();
        ctx.end_loop();
        ctx.seal().unwrap();

        let mut backend = SoftwareBackend::new().with_instruction_limit(1000);
        backend.start(&ctx.program().encode()).unwrap();
        assert!(backend.wait(&mut mem).is_err());
        assert!(!backend.is_busy());
    }
}
