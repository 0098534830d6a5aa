//! Instruction, loop and register model of one MVP micro-program.
//!
//! A [`Program`] mirrors the program register window: 8 registers, 5 array
//! descriptors, 8 loops and 8 instructions. [`Program::encode`] produces the
//! [`ProgramImage`] a backend consumes and [`Program::from_image`] reverses
//! it.

use crate::array::{ArrayDescriptor, Dim};
use crate::error::{MvpError, Result};
use half::f16;
use mvp_chip::image::ProgramImage;
use mvp_chip::limits::{NUM_ARRAYS, NUM_INSTRUCTIONS, NUM_LOOPS, NUM_REGISTERS};
use mvp_chip::opcode::AluOp;
use mvp_chip::regs::{cmd, instrcfg0, instrcfg1, instrcfg2, loopcfg};

// ── Registers and array slots ────────────────────────────────────────────────

/// ALU register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum Reg {
    #[default]
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

impl Reg {
    /// All registers in index order.
    pub const ALL: [Self; NUM_REGISTERS] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
    ];

    /// Register index.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Register for a 3-bit id.
    pub const fn from_index(index: usize) -> Self {
        Self::ALL[index & 7]
    }
}

/// Array descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ArrayId {
    A0 = 0,
    A1,
    A2,
    A3,
    A4,
}

impl ArrayId {
    /// All slots in index order.
    pub const ALL: [Self; NUM_ARRAYS] = [Self::A0, Self::A1, Self::A2, Self::A3, Self::A4];

    /// Slot index.
    pub const fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Register contents: one fp16 value per lane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegValue {
    /// Real lane.
    pub re: f16,
    /// Imaginary lane.
    pub im: f16,
}

impl RegValue {
    /// Both lanes from `f32`, rounded to fp16.
    pub fn new(re: f32, im: f32) -> Self {
        Self {
            re: f16::from_f32(re),
            im: f16::from_f32(im),
        }
    }

    /// Same value in both lanes.
    pub fn splat(value: f32) -> Self {
        Self::new(value, value)
    }

    /// `REGSTATE` word: real lane low, imaginary lane high.
    pub fn to_bits(self) -> u32 {
        u32::from(self.re.to_bits()) | u32::from(self.im.to_bits()) << 16
    }

    /// Inverse of [`RegValue::to_bits`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            re: f16::from_bits(bits as u16),
            im: f16::from_bits((bits >> 16) as u16),
        }
    }
}

// ── ALU operand routing ──────────────────────────────────────────────────────

/// One ALU input binding with its lane modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AluInput {
    /// Source register.
    pub reg: Reg,
    /// Force the real lane to zero.
    pub real_zero: bool,
    /// Negate the real lane.
    pub real_negate: bool,
    /// Force the imaginary lane to zero.
    pub imag_zero: bool,
    /// Negate the imaginary lane.
    pub imag_negate: bool,
}

impl AluInput {
    /// Plain register input.
    pub const fn new(reg: Reg) -> Self {
        Self {
            reg,
            real_zero: false,
            real_negate: false,
            imag_zero: false,
            imag_negate: false,
        }
    }

    /// Negate both lanes.
    #[must_use]
    pub const fn negate(mut self) -> Self {
        self.real_negate = true;
        self.imag_negate = true;
        self
    }

    /// Zero the imaginary lane.
    #[must_use]
    pub const fn real_only(mut self) -> Self {
        self.imag_zero = true;
        self
    }

    fn encode(self) -> u32 {
        let mut field = self.reg.index() as u32;
        if self.real_zero {
            field |= instrcfg0::REALZERO;
        }
        if self.real_negate {
            field |= instrcfg0::REALNEGATE;
        }
        if self.imag_zero {
            field |= instrcfg0::IMAGZERO;
        }
        if self.imag_negate {
            field |= instrcfg0::IMAGNEGATE;
        }
        field
    }

    fn decode(field: u32) -> Self {
        Self {
            reg: Reg::from_index((field & instrcfg0::REGID_MASK) as usize),
            real_zero: field & instrcfg0::REALZERO != 0,
            real_negate: field & instrcfg0::REALNEGATE != 0,
            imag_zero: field & instrcfg0::IMAGZERO != 0,
            imag_negate: field & instrcfg0::IMAGNEGATE != 0,
        }
    }
}

impl std::fmt::Display for AluInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.reg)?;
        let flags: Vec<&str> = [
            (self.real_zero, "0re"),
            (self.real_negate, "-re"),
            (self.imag_zero, "0im"),
            (self.imag_negate, "-im"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect();
        if !flags.is_empty() {
            write!(f, "{{{}}}", flags.join(","))?;
        }
        Ok(())
    }
}

/// ALU routing: inputs X, Y, A and output Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AluConfig {
    /// Input X.
    pub x: AluInput,
    /// Input Y.
    pub y: AluInput,
    /// Input A.
    pub a: AluInput,
    /// Output Z.
    pub z: Reg,
}

impl AluConfig {
    /// All operands on `R0`.
    pub const fn new() -> Self {
        Self {
            x: AluInput::new(Reg::R0),
            y: AluInput::new(Reg::R0),
            a: AluInput::new(Reg::R0),
            z: Reg::R0,
        }
    }

    /// Route X.
    #[must_use]
    pub const fn x(mut self, reg: Reg) -> Self {
        self.x = AluInput::new(reg);
        self
    }

    /// Route Y.
    #[must_use]
    pub const fn y(mut self, reg: Reg) -> Self {
        self.y = AluInput::new(reg);
        self
    }

    /// Route A.
    #[must_use]
    pub const fn a(mut self, reg: Reg) -> Self {
        self.a = AluInput::new(reg);
        self
    }

    /// Route Z.
    #[must_use]
    pub const fn z(mut self, reg: Reg) -> Self {
        self.z = reg;
        self
    }

    /// Route X with lane modifiers.
    #[must_use]
    pub const fn x_input(mut self, input: AluInput) -> Self {
        self.x = input;
        self
    }

    /// Route A with lane modifiers.
    #[must_use]
    pub const fn a_input(mut self, input: AluInput) -> Self {
        self.a = input;
        self
    }
}

// ── Load and store streams ───────────────────────────────────────────────────

/// A register bound to an array, with optional auto-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    /// Register loaded or stored.
    pub reg: Reg,
    /// Array walked.
    pub array: ArrayId,
    /// Dimensions incremented after the access, `[vec, row, col]`.
    pub incr: [bool; 3],
}

impl Stream {
    /// Stream without auto-increment.
    pub const fn new(reg: Reg, array: ArrayId) -> Self {
        Self {
            reg,
            array,
            incr: [false; 3],
        }
    }

    /// Increment `dim` after each access.
    #[must_use]
    pub const fn incr(mut self, dim: Dim) -> Self {
        self.incr[dim as usize] = true;
        self
    }

    fn encode(self) -> u32 {
        let mut field = self.reg.index() as u32
            | instrcfg1::ENABLE
            | (self.array.index() as u32) << instrcfg1::ARRAYID_SHIFT;
        for (d, on) in self.incr.iter().enumerate() {
            if *on {
                field |= 1 << (instrcfg1::INCRDIM_SHIFT + d as u32);
            }
        }
        field
    }

    fn decode(field: u32) -> Result<Option<Self>> {
        if field & instrcfg1::ENABLE == 0 {
            return Ok(None);
        }
        let array_index = ((field >> instrcfg1::ARRAYID_SHIFT) & instrcfg1::ARRAYID_MASK) as usize;
        let array = ArrayId::from_index(array_index)
            .ok_or_else(|| MvpError::fail(format!("stream references array {array_index}")))?;
        let mut incr = [false; 3];
        for (d, on) in incr.iter_mut().enumerate() {
            *on = field & (1 << (instrcfg1::INCRDIM_SHIFT + d as u32)) != 0;
        }
        Ok(Some(Self {
            reg: Reg::from_index((field & instrcfg1::REGID_MASK) as usize),
            array,
            incr,
        }))
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{:?}", self.reg, self.array)?;
        for (dim, on) in Dim::ALL.iter().zip(self.incr) {
            if on {
                write!(f, "+{dim:?}")?;
            }
        }
        Ok(())
    }
}

/// Up to two load streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadConfig {
    /// Load stream 0 and 1.
    pub streams: [Option<Stream>; 2],
}

impl LoadConfig {
    /// No loads.
    pub const NONE: Self = Self { streams: [None, None] };

    /// One load on stream 0.
    pub const fn one(stream: Stream) -> Self {
        Self {
            streams: [Some(stream), None],
        }
    }

    /// Loads on both streams.
    pub const fn two(first: Stream, second: Stream) -> Self {
        Self {
            streams: [Some(first), Some(second)],
        }
    }
}

/// Optional store stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreConfig {
    /// The store stream.
    pub stream: Option<Stream>,
}

impl StoreConfig {
    /// No store.
    pub const NONE: Self = Self { stream: None };

    /// Store `stream`.
    pub const fn one(stream: Stream) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

// ── Instructions and loops ───────────────────────────────────────────────────

/// One instruction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// ALU operation.
    pub op: AluOp,
    /// Operand routing.
    pub alu: AluConfig,
    /// Loads, performed before the ALU.
    pub load: LoadConfig,
    /// Store, performed after the ALU.
    pub store: StoreConfig,
    /// Loops beginning here (bit per loop).
    pub loop_begin: u8,
    /// Loops ending here (bit per loop).
    pub loop_end: u8,
    /// Last instruction of the program.
    pub end_program: bool,
}

impl Default for Instruction {
    fn default() -> Self {
        Self {
            op: AluOp::Noop,
            alu: AluConfig::new(),
            load: LoadConfig::NONE,
            store: StoreConfig::NONE,
            loop_begin: 0,
            loop_end: 0,
            end_program: false,
        }
    }
}

impl Instruction {
    fn encode(&self) -> [u32; 3] {
        let cfg0 = self.alu.x.encode()
            | self.alu.y.encode() << instrcfg0::INPUT_FIELD_WIDTH
            | self.alu.a.encode() << (2 * instrcfg0::INPUT_FIELD_WIDTH)
            | (self.alu.z.index() as u32) << instrcfg0::ALUOUT_SHIFT;

        let mut cfg1 = 0;
        if let Some(s) = self.load.streams[0] {
            cfg1 |= s.encode() << instrcfg1::LOAD0_SHIFT;
        }
        if let Some(s) = self.load.streams[1] {
            cfg1 |= s.encode() << instrcfg1::LOAD1_SHIFT;
        }
        if let Some(s) = self.store.stream {
            cfg1 |= s.encode() << instrcfg1::STORE_SHIFT;
        }

        let mut cfg2 = self.op.code() << instrcfg2::ALUOP_SHIFT;
        for n in 0..NUM_LOOPS {
            if self.loop_begin & (1 << n) != 0 {
                cfg2 |= instrcfg2::loop_begin(n);
            }
            if self.loop_end & (1 << n) != 0 {
                cfg2 |= instrcfg2::loop_end(n);
            }
        }
        if self.end_program {
            cfg2 |= instrcfg2::ENDPROG;
        }
        [cfg0, cfg1, cfg2]
    }

    fn decode(words: [u32; 3]) -> Result<Self> {
        let [cfg0, cfg1, cfg2] = words;
        let field = |shift: u32| (cfg0 >> shift) & 0xFF;
        let alu = AluConfig {
            x: AluInput::decode(field(0)),
            y: AluInput::decode(field(instrcfg0::INPUT_FIELD_WIDTH)),
            a: AluInput::decode(field(2 * instrcfg0::INPUT_FIELD_WIDTH)),
            z: Reg::from_index((cfg0 >> instrcfg0::ALUOUT_SHIFT) as usize),
        };
        let stream = |shift: u32| Stream::decode((cfg1 >> shift) & 0x3FF);
        let load = LoadConfig {
            streams: [stream(instrcfg1::LOAD0_SHIFT)?, stream(instrcfg1::LOAD1_SHIFT)?],
        };
        let store = StoreConfig {
            stream: stream(instrcfg1::STORE_SHIFT)?,
        };
        let code = (cfg2 >> instrcfg2::ALUOP_SHIFT) & instrcfg2::ALUOP_MASK;
        let op = AluOp::from_code(code)
            .ok_or_else(|| MvpError::fail(format!("unknown ALU operation {code:#05x}")))?;
        let mut loop_begin = 0u8;
        let mut loop_end = 0u8;
        for n in 0..NUM_LOOPS {
            if cfg2 & instrcfg2::loop_begin(n) != 0 {
                loop_begin |= 1 << n;
            }
            if cfg2 & instrcfg2::loop_end(n) != 0 {
                loop_end |= 1 << n;
            }
        }
        Ok(Self {
            op,
            alu,
            load,
            store,
            loop_begin,
            loop_end,
            end_program: cfg2 & instrcfg2::ENDPROG != 0,
        })
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<7}", self.op.mnemonic())?;
        let used = self.op.operands();
        let writes_z = self.op != AluOp::Noop;
        if writes_z {
            write!(f, " Z={:?}", self.alu.z)?;
        }
        if used.x {
            write!(f, " X={}", self.alu.x)?;
        }
        if used.y {
            write!(f, " Y={}", self.alu.y)?;
        }
        if used.a {
            write!(f, " A={}", self.alu.a)?;
        }
        for s in self.load.streams.iter().flatten() {
            write!(f, " | ld {s}")?;
        }
        if let Some(s) = self.store.stream {
            write!(f, " | st {s}")?;
        }
        for n in 0..NUM_LOOPS {
            if self.loop_begin & (1 << n) != 0 {
                write!(f, " [L{n}")?;
            }
        }
        for n in 0..NUM_LOOPS {
            if self.loop_end & (1 << n) != 0 {
                write!(f, " L{n}]")?;
            }
        }
        if self.end_program {
            write!(f, " END")?;
        }
        Ok(())
    }
}

/// One loop counter with its post-loop array actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopConfig {
    /// Iteration count, 1..=1024.
    pub iterations: usize,
    /// First instruction of the body.
    pub begin: usize,
    /// Last instruction of the body.
    pub end: usize,
    /// Array dimensions incremented each time the loop completes
    /// (`loopcfg::array_dim_bit` layout).
    pub incr: u32,
    /// Array dimensions reset each time the loop completes.
    pub reset: u32,
}

impl LoopConfig {
    /// True if the loop increments `dim` of `array` on completion.
    pub const fn increments(&self, array: ArrayId, dim: Dim) -> bool {
        self.incr & loopcfg::array_dim_bit(array as usize, dim as usize) != 0
    }

    /// True if the loop resets `dim` of `array` on completion.
    pub const fn resets(&self, array: ArrayId, dim: Dim) -> bool {
        self.reset & loopcfg::array_dim_bit(array as usize, dim as usize) != 0
    }
}

// ── Program ──────────────────────────────────────────────────────────────────

/// A complete micro-program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// Initial register values.
    pub regs: [RegValue; NUM_REGISTERS],
    /// Array descriptors; unused slots are `None`.
    pub arrays: [Option<ArrayDescriptor>; NUM_ARRAYS],
    /// Loop table; the first `loop_count` entries are live.
    pub loops: [LoopConfig; NUM_LOOPS],
    /// Live loops.
    pub loop_count: usize,
    /// Instruction table; the first `instr_count` entries are live.
    pub instructions: [Instruction; NUM_INSTRUCTIONS],
    /// Live instructions.
    pub instr_count: usize,
}

impl Program {
    /// Live loops.
    pub fn loops(&self) -> &[LoopConfig] {
        &self.loops[..self.loop_count]
    }

    /// Live instructions.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions[..self.instr_count]
    }

    /// Encode into the program register image with `CMD = INIT | START`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> ProgramImage {
        let mut image = ProgramImage::new();
        for (i, r) in self.regs.iter().enumerate() {
            image.set_alu(i, r.to_bits());
        }
        for (i, a) in self.arrays.iter().enumerate() {
            if let Some(a) = a {
                for (w, value) in a.encode().into_iter().enumerate() {
                    image.set_array(i, w, value);
                }
            }
        }
        for (i, l) in self.loops().iter().enumerate() {
            let iters = (l.iterations.saturating_sub(1) as u32) & loopcfg::NUMITERS_MASK;
            image.set_loop(i, iters | l.incr, l.reset);
        }
        for (i, instr) in self.instructions().iter().enumerate() {
            for (w, value) in instr.encode().into_iter().enumerate() {
                image.set_instr(i, w, value);
            }
        }
        image.set_cmd(cmd::INIT | cmd::START);
        image
    }

    /// Decode a program image.
    ///
    /// # Errors
    ///
    /// Returns `Fail` for an unknown ALU operation or array type, a missing
    /// end-of-program flag, or loop markers that do not form a loop.
    pub fn from_image(image: &ProgramImage) -> Result<Self> {
        let mut program = Self::default();
        for (i, r) in program.regs.iter_mut().enumerate() {
            *r = RegValue::from_bits(image.alu(i));
        }
        for (i, slot) in program.arrays.iter_mut().enumerate() {
            let words = [
                image.array(i, 0),
                image.array(i, 1),
                image.array(i, 2),
                image.array(i, 3),
            ];
            if words != [0; 4] {
                let a = ArrayDescriptor::decode(words)
                    .ok_or_else(|| MvpError::fail(format!("array {i} has a reserved type")))?;
                *slot = Some(a);
            }
        }
        for i in 0..NUM_INSTRUCTIONS {
            let instr = Instruction::decode([image.instr(i, 0), image.instr(i, 1), image.instr(i, 2)])?;
            program.instructions[i] = instr;
            if instr.end_program {
                program.instr_count = i + 1;
                break;
            }
        }
        if program.instr_count == 0 {
            return Err(MvpError::fail("program has no end-of-program instruction"));
        }
        for n in 0..NUM_LOOPS {
            let bit = 1u8 << n;
            let live = program.instructions();
            let begin = live.iter().position(|ins| ins.loop_begin & bit != 0);
            let end = live.iter().position(|ins| ins.loop_end & bit != 0);
            match (begin, end) {
                (None, None) => {}
                (Some(begin), Some(end)) if begin <= end && n == program.loop_count => {
                    let cfg = image.loop_cfg(n);
                    program.loops[n] = LoopConfig {
                        iterations: (cfg & loopcfg::NUMITERS_MASK) as usize + 1,
                        begin,
                        end,
                        incr: cfg & !loopcfg::NUMITERS_MASK,
                        reset: image.loop_rst(n),
                    };
                    program.loop_count += 1;
                }
                _ => return Err(MvpError::fail(format!("loop {n} markers are inconsistent"))),
            }
        }
        Ok(program)
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (reg, value) in Reg::ALL.iter().zip(&self.regs) {
            if *value != RegValue::default() {
                writeln!(f, "  {reg:?} = ({}, {})", value.re, value.im)?;
            }
        }
        for (id, a) in ArrayId::ALL.iter().zip(&self.arrays) {
            if let Some(a) = a {
                writeln!(f, "  {id:?} {a}")?;
            }
        }
        for (n, l) in self.loops().iter().enumerate() {
            write!(f, "  L{n} x{} [{}..={}]", l.iterations, l.begin, l.end)?;
            for id in ArrayId::ALL {
                for dim in Dim::ALL {
                    if l.increments(id, dim) {
                        write!(f, " +{id:?}.{dim:?}")?;
                    }
                    if l.resets(id, dim) {
                        write!(f, " 0{id:?}.{dim:?}")?;
                    }
                }
            }
            writeln!(f)?;
        }
        for (i, instr) in self.instructions().iter().enumerate() {
            writeln!(f, "  {i}: {instr}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DataType;

    fn sample() -> Program {
        let mut p = Program::default();
        p.regs[1] = RegValue::new(0.5, -2.0);
        p.arrays[0] =
            Some(ArrayDescriptor::new(0x2000_0000, DataType::Int8, [2, 3, 4], [12, 4, 1]).unwrap());
        p.loops[0] = LoopConfig {
            iterations: 1024,
            begin: 0,
            end: 1,
            incr: loopcfg::array_dim_bit(0, 1),
            reset: loopcfg::array_dim_bit(0, 2),
        };
        p.loop_count = 1;
        p.instructions[0] = Instruction {
            op: AluOp::Macr2a,
            alu: AluConfig::new().z(Reg::R2).x(Reg::R3).y(Reg::R1).a(Reg::R2),
            load: LoadConfig::one(Stream::new(Reg::R3, ArrayId::A0).incr(Dim::Col)),
            loop_begin: 1,
            ..Instruction::default()
        };
        p.instructions[1] = Instruction {
            op: AluOp::Clip2a,
            alu: AluConfig::new()
                .z(Reg::R6)
                .x_input(AluInput::new(Reg::R4).negate())
                .y(Reg::R5)
                .a(Reg::R2),
            store: StoreConfig::one(Stream::new(Reg::R6, ArrayId::A4).incr(Dim::Vec).incr(Dim::Row)),
            loop_end: 1,
            end_program: true,
            ..Instruction::default()
        };
        p.instr_count = 2;
        p
    }

    #[test]
    fn image_round_trip() {
        let p = sample();
        let image = p.encode();
        assert_eq!(image.cmd(), cmd::INIT | cmd::START);
        assert_eq!(Program::from_image(&image).unwrap(), p);
    }

    #[test]
    fn missing_end_of_program_is_rejected() {
        let mut p = sample();
        p.instructions[1].end_program = false;
        assert!(Program::from_image(&p.encode()).is_err());
    }

    #[test]
    fn reg_value_bits() {
        let v = RegValue::new(1.0, -1.0);
        assert_eq!(v.to_bits(), 0xBC00_3C00);
        assert_eq!(RegValue::from_bits(v.to_bits()), v);
    }

    #[test]
    fn disassembly_lists_streams_and_loops() {
        let text = sample().to_string();
        assert!(text.contains("MACR2A  Z=R2 X=R3 Y=R1 A=R2 | ld R3:A0+Col [L0"));
        assert!(text.contains("L0 x1024 [0..=1] +A0.Row 0A0.Col"));
        assert!(text.contains("X=R4{-re,-im}"));
    }
}
