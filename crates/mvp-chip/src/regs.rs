//! MVP register map.
//!
//! Offsets are byte offsets from the peripheral base. Every register also has
//! a SET alias at `+0x1000` and a CLR alias at `+0x2000` (bit-set / bit-clear
//! writes without read-modify-write).
//!
//! ```text
//! 0x000  IPVERSION            0x02C  PROGRAMSTATE
//! 0x004  EN                   0x030  ARRAYST[5]   (index state per array)
//! 0x008  SWRST                0x044  LOOPST[8]    (counter state per loop)
//! 0x00C  CFG                  0x064  ALU[8]       (REGSTATE, fp16 re/im)
//! 0x010  STATUS               0x084  ARRAY[5]     (ADDRCFG, DIM0..2CFG)
//! 0x014  PERF[2]              0x0D4  LOOP[8]      (CFG, RST)
//! 0x01C  IF / 0x020 IEN       0x114  INSTR[8]     (CFG0, CFG1, CFG2)
//! 0x024  FAULTSTATUS          0x174  CMD
//! 0x028  FAULTADDR
//! ```

// ── Control and status ───────────────────────────────────────────────────────

/// IP version register.
pub const IPVERSION: usize = 0x000;
/// Module enable.
pub const EN: usize = 0x004;
/// Software reset.
pub const SWRST: usize = 0x008;
/// Configuration (performance counter selection, loop error behaviour).
pub const CFG: usize = 0x00C;
/// Status (`RUNNING`, `PAUSED`, `IDLE`).
pub const STATUS: usize = 0x010;
/// Performance counters 0 and 1.
pub const PERF_BASE: usize = 0x014;
/// Interrupt flags.
pub const IF: usize = 0x01C;
/// Interrupt enables.
pub const IEN: usize = 0x020;
/// Fault status (faulting PC, array, bus access, loop).
pub const FAULTSTATUS: usize = 0x024;
/// Faulting bus address.
pub const FAULTADDR: usize = 0x028;
/// Program counter state.
pub const PROGRAMSTATE: usize = 0x02C;

// ── Run-time state ───────────────────────────────────────────────────────────

/// Array index state, one word per array.
pub const ARRAYST_BASE: usize = 0x030;
/// Loop counter state, one word per loop.
pub const LOOPST_BASE: usize = 0x044;

// ── Program registers ────────────────────────────────────────────────────────

/// ALU register state, one word per register (fp16 real low, imag high).
pub const ALU_BASE: usize = 0x064;
/// Array descriptor blocks.
pub const ARRAY_BASE: usize = 0x084;
/// Stride between array descriptor blocks.
pub const ARRAY_STRIDE: usize = 0x10;
/// Loop configuration blocks.
pub const LOOP_BASE: usize = 0x0D4;
/// Stride between loop blocks.
pub const LOOP_STRIDE: usize = 0x08;
/// Instruction blocks.
pub const INSTR_BASE: usize = 0x114;
/// Stride between instruction blocks.
pub const INSTR_STRIDE: usize = 0x0C;
/// Command register.
pub const CMD: usize = 0x174;

/// Offset of the bit-set alias.
pub const SET_OFFSET: usize = 0x1000;
/// Offset of the bit-clear alias.
pub const CLR_OFFSET: usize = 0x2000;

/// Offset of ALU register `index`.
#[must_use]
pub const fn alu(index: usize) -> usize {
    ALU_BASE + index * 4
}

/// Offset of word `word` (0 = ADDRCFG, 1..=3 = DIM0CFG..DIM2CFG) of array `index`.
#[must_use]
pub const fn array(index: usize, word: usize) -> usize {
    ARRAY_BASE + index * ARRAY_STRIDE + word * 4
}

/// Offset of loop `index` word `word` (0 = CFG, 1 = RST).
#[must_use]
pub const fn r#loop(index: usize, word: usize) -> usize {
    LOOP_BASE + index * LOOP_STRIDE + word * 4
}

/// Offset of instruction `index` word `word` (0 = CFG0, 1 = CFG1, 2 = CFG2).
#[must_use]
pub const fn instr(index: usize, word: usize) -> usize {
    INSTR_BASE + index * INSTR_STRIDE + word * 4
}

// ── Array descriptor fields ──────────────────────────────────────────────────

/// `DIMxCFG` fields.
pub mod dimcfg {
    /// Dimension size minus one.
    pub const SIZE_SHIFT: u32 = 0;
    /// Size field mask (after shift).
    pub const SIZE_MASK: u32 = 0x3FF;
    /// Base element type (DIM0CFG only).
    pub const BASETYPE_SHIFT: u32 = 12;
    /// Base type mask (after shift).
    pub const BASETYPE_MASK: u32 = 0x3;
    /// Complex element flag (DIM0CFG only).
    pub const COMPLEX: u32 = 1 << 14;
    /// Signed stride in elements.
    pub const STRIDE_SHIFT: u32 = 16;
    /// Stride field mask (after shift).
    pub const STRIDE_MASK: u32 = 0xFFF;

    /// `BASETYPE` value for unsigned 8-bit.
    pub const BASETYPE_UINT8: u32 = 0;
    /// `BASETYPE` value for signed 8-bit.
    pub const BASETYPE_INT8: u32 = 1;
    /// `BASETYPE` value for IEEE binary16.
    pub const BASETYPE_BINARY16: u32 = 2;
}

// ── Loop fields ──────────────────────────────────────────────────────────────

/// `LOOPCFG` and `LOOPRST` fields.
pub mod loopcfg {
    /// Iteration count minus one.
    pub const NUMITERS_MASK: u32 = 0x3FF;

    /// Bit for array `array`, dimension `dim` in `LOOPCFG` (increment) and
    /// `LOOPRST` (reset).
    #[must_use]
    pub const fn array_dim_bit(array: usize, dim: usize) -> u32 {
        1 << (12 + 4 * array + dim)
    }
}

// ── Instruction fields ───────────────────────────────────────────────────────

/// `INSTRCFG0`: ALU operand routing.
pub mod instrcfg0 {
    /// Width of one ALU input field (X, Y, A).
    pub const INPUT_FIELD_WIDTH: u32 = 8;
    /// Register id mask within an input field.
    pub const REGID_MASK: u32 = 0x7;
    /// Force the real lane to zero.
    pub const REALZERO: u32 = 1 << 4;
    /// Negate the real lane.
    pub const REALNEGATE: u32 = 1 << 5;
    /// Force the imaginary lane to zero.
    pub const IMAGZERO: u32 = 1 << 6;
    /// Negate the imaginary lane.
    pub const IMAGNEGATE: u32 = 1 << 7;
    /// Output register (Z) id.
    pub const ALUOUT_SHIFT: u32 = 28;
}

/// `INSTRCFG1`: load and store streams.
pub mod instrcfg1 {
    /// Bit offset of load stream 0.
    pub const LOAD0_SHIFT: u32 = 0;
    /// Bit offset of load stream 1.
    pub const LOAD1_SHIFT: u32 = 10;
    /// Bit offset of the store stream.
    pub const STORE_SHIFT: u32 = 20;

    /// Register id within a stream field.
    pub const REGID_MASK: u32 = 0x7;
    /// Stream enabled (LOAD or STORE bit).
    pub const ENABLE: u32 = 1 << 3;
    /// Array id within a stream field.
    pub const ARRAYID_SHIFT: u32 = 4;
    /// Array id mask (after shift).
    pub const ARRAYID_MASK: u32 = 0x7;
    /// First of three increment-dimension bits within a stream field.
    pub const INCRDIM_SHIFT: u32 = 7;
}

/// `INSTRCFG2`: loop markers, ALU operation, end of program.
pub mod instrcfg2 {
    /// Loop `n` begins at this instruction.
    #[must_use]
    pub const fn loop_begin(n: usize) -> u32 {
        1 << (2 * n)
    }
    /// Loop `n` ends at this instruction.
    #[must_use]
    pub const fn loop_end(n: usize) -> u32 {
        1 << (2 * n + 1)
    }
    /// ALU operation code.
    pub const ALUOP_SHIFT: u32 = 20;
    /// ALU operation mask (after shift).
    pub const ALUOP_MASK: u32 = 0x1FF;
    /// Last instruction of the program.
    pub const ENDPROG: u32 = 1 << 31;
}

// ── Command and status ───────────────────────────────────────────────────────

/// `CMD` bits.
pub mod cmd {
    /// Start program execution.
    pub const START: u32 = 1 << 0;
    /// Halt execution.
    pub const HALT: u32 = 1 << 1;
    /// Single step.
    pub const STEP: u32 = 1 << 2;
    /// Initialise loop and array state from the program registers.
    pub const INIT: u32 = 1 << 3;
}

/// `STATUS` bits.
pub mod status {
    /// Program running.
    pub const RUNNING: u32 = 1 << 0;
    /// Program paused (halted or stepping).
    pub const PAUSED: u32 = 1 << 1;
    /// Idle; reset value.
    pub const IDLE: u32 = 1 << 2;
}

/// `IF` / `IEN` bits.
pub mod irq {
    /// Program done.
    pub const PROGDONE: u32 = 1 << 0;
    /// Loop `n` done.
    #[must_use]
    pub const fn loop_done(n: usize) -> u32 {
        1 << (1 + n)
    }
    /// ALU produced a NaN.
    pub const ALUNAN: u32 = 1 << 10;
    /// R0 real lane positive.
    pub const R0POSREAL: u32 = 1 << 11;
    /// ALU overflow.
    pub const ALUOF: u32 = 1 << 12;
    /// ALU underflow.
    pub const ALUUF: u32 = 1 << 13;
    /// Store conversion overflow (value saturated).
    pub const STORECONVERTOF: u32 = 1 << 14;
    /// Store conversion underflow.
    pub const STORECONVERTUF: u32 = 1 << 15;
    /// Store conversion of an infinity.
    pub const STORECONVERTINF: u32 = 1 << 16;
    /// Store conversion of a NaN.
    pub const STORECONVERTNAN: u32 = 1 << 17;
    /// Loop fault.
    pub const LOOPFAULT: u32 = 1 << 24;
    /// Bus error fault.
    pub const BUSERRFAULT: u32 = 1 << 25;
    /// Bus alignment fault.
    pub const BUSALIGNFAULT: u32 = 1 << 26;
    /// ALU fault.
    pub const ALUFAULT: u32 = 1 << 27;
    /// Array fault.
    pub const ARRAYFAULT: u32 = 1 << 28;
    /// All fault bits.
    pub const FAULTS: u32 = LOOPFAULT | BUSERRFAULT | BUSALIGNFAULT | ALUFAULT | ARRAYFAULT;
}

/// `FAULTSTATUS` fields.
pub mod faultstatus {
    /// Faulting program counter.
    pub const FAULTPC_SHIFT: u32 = 0;
    /// Faulting array id.
    pub const FAULTARRAY_SHIFT: u32 = 8;
    /// Faulting bus access (see `BUS_*`).
    pub const FAULTBUS_SHIFT: u32 = 12;
    /// Faulting loop id.
    pub const FAULTLOOP_SHIFT: u32 = 16;

    /// No bus access involved.
    pub const BUS_NONE: u32 = 0;
    /// Load stream 0.
    pub const BUS_LOAD0: u32 = 1;
    /// Load stream 1.
    pub const BUS_LOAD1: u32 = 2;
    /// Store stream.
    pub const BUS_STORE: u32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout_is_contiguous() {
        assert_eq!(alu(8), ARRAY_BASE);
        assert_eq!(array(5, 0), LOOP_BASE);
        assert_eq!(r#loop(8, 0), INSTR_BASE);
        assert_eq!(instr(8, 0), CMD);
    }

    #[test]
    fn loop_array_bits() {
        assert_eq!(loopcfg::array_dim_bit(0, 0), 1 << 12);
        assert_eq!(loopcfg::array_dim_bit(4, 2), 1 << 30);
    }

    #[test]
    fn loop_markers_interleave() {
        assert_eq!(instrcfg2::loop_begin(0), 0b01);
        assert_eq!(instrcfg2::loop_end(0), 0b10);
        assert_eq!(instrcfg2::loop_end(7), 1 << 15);
        assert!(instrcfg2::loop_end(7) < 1 << instrcfg2::ALUOP_SHIFT);
    }
}
