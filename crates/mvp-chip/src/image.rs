//! Program image.
//!
//! A program is the contiguous register window from `ALU[0]` up to and
//! including `CMD`: 8 register words, 5 × 4 array words, 8 × 2 loop words,
//! 8 × 3 instruction words and the command word. The driver encodes a
//! program into this image and a backend writes (or interprets) it.
//!
//! ```text
//! word  0..8    ALU[n].REGSTATE
//! word  8..28   ARRAY[n].{ADDRCFG, DIM0CFG, DIM1CFG, DIM2CFG}
//! word 28..44   LOOP[n].{CFG, RST}
//! word 44..68   INSTR[n].{CFG0, CFG1, CFG2}
//! word 68       CMD
//! ```

use crate::regs;

/// Number of 32-bit words in a program image.
pub const WORDS: usize = (regs::CMD - regs::ALU_BASE) / 4 + 1;

const fn word(offset: usize) -> usize {
    (offset - regs::ALU_BASE) / 4
}

/// Encoded program registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    words: [u32; WORDS],
}

impl Default for ProgramImage {
    fn default() -> Self {
        Self { words: [0; WORDS] }
    }
}

impl ProgramImage {
    /// All-zero image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw words in register order.
    #[must_use]
    pub fn words(&self) -> &[u32; WORDS] {
        &self.words
    }

    /// Register offset of word `index`, for writing the image to hardware.
    #[must_use]
    pub const fn offset_of(index: usize) -> usize {
        regs::ALU_BASE + index * 4
    }

    /// `ALU[index].REGSTATE`.
    #[must_use]
    pub fn alu(&self, index: usize) -> u32 {
        self.words[word(regs::alu(index))]
    }

    /// Set `ALU[index].REGSTATE`.
    pub fn set_alu(&mut self, index: usize, value: u32) {
        self.words[word(regs::alu(index))] = value;
    }

    /// Array word (0 = ADDRCFG, 1..=3 = DIM0CFG..DIM2CFG).
    #[must_use]
    pub fn array(&self, index: usize, w: usize) -> u32 {
        self.words[word(regs::array(index, w))]
    }

    /// Set an array word.
    pub fn set_array(&mut self, index: usize, w: usize, value: u32) {
        self.words[word(regs::array(index, w))] = value;
    }

    /// `LOOP[index].CFG`.
    #[must_use]
    pub fn loop_cfg(&self, index: usize) -> u32 {
        self.words[word(regs::r#loop(index, 0))]
    }

    /// `LOOP[index].RST`.
    #[must_use]
    pub fn loop_rst(&self, index: usize) -> u32 {
        self.words[word(regs::r#loop(index, 1))]
    }

    /// Set `LOOP[index].CFG` and `LOOP[index].RST`.
    pub fn set_loop(&mut self, index: usize, cfg: u32, rst: u32) {
        self.words[word(regs::r#loop(index, 0))] = cfg;
        self.words[word(regs::r#loop(index, 1))] = rst;
    }

    /// Instruction word (0 = CFG0, 1 = CFG1, 2 = CFG2).
    #[must_use]
    pub fn instr(&self, index: usize, w: usize) -> u32 {
        self.words[word(regs::instr(index, w))]
    }

    /// Set an instruction word.
    pub fn set_instr(&mut self, index: usize, w: usize, value: u32) {
        self.words[word(regs::instr(index, w))] = value;
    }

    /// `CMD`.
    #[must_use]
    pub fn cmd(&self) -> u32 {
        self.words[WORDS - 1]
    }

    /// Set `CMD`.
    pub fn set_cmd(&mut self, value: u32) {
        self.words[WORDS - 1] = value;
    }
}
