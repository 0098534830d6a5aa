//! ALU operation codes.
//!
//! The 9-bit `ALUOP` field of `INSTRCFG2`. Naming follows the hardware
//! reference: a `C` suffix works on the complex pair, `R` on real values,
//! `2A`/`2B` on the two lanes independently. Operands are named X, Y, A
//! (inputs) and Z (output).
//!
//! | Op | Result |
//! |----|--------|
//! | `CLEAR` | Z = 0 |
//! | `COPY` | Z = A |
//! | `SWAP` | Z = (A.im, A.re) |
//! | `DBL` | Z = A + A |
//! | `RELU2` / `NRELU2` | Z = max(A, 0) / min(A, 0) per lane |
//! | `INC2` / `DEC2` | Z = A ± 1 per lane |
//! | `ADDR` | Z = (A.re + A.im, 0) |
//! | `MAX` / `MIN` | Z = (max/min(A.re, A.im), 0) |
//! | `ADDC` | Z = X + A |
//! | `MAX2A` / `MIN2A` | Z = max/min(X, A) per lane |
//! | `ADDR2B` | Z = X + Y per lane |
//! | `MAX2B` / `MIN2B` | Z = max/min(X, Y) per lane |
//! | `MULC` | Z = X × Y (complex) |
//! | `MULR2A` | Z = X × Y per lane |
//! | `MACC` | Z = X × Y + A (complex) |
//! | `MACR2A` | Z = X × Y + A per lane |
//! | `CLIP2A` | Z = min(max(A, X), Y) per lane |

/// ALU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum AluOp {
    Noop = 0x000,
    Clear = 0x001,
    Copy = 0x041,
    Swap = 0x042,
    Dbl = 0x043,
    Fana = 0x044,
    Fanb = 0x045,
    Relu2 = 0x046,
    Nrelu2 = 0x047,
    Inc2 = 0x048,
    Dec2 = 0x049,
    Addr = 0x04A,
    Max = 0x04B,
    Min = 0x04C,
    Rsqr2b = 0x124,
    Addc = 0x14E,
    Max2a = 0x153,
    Min2a = 0x154,
    Xrealc2 = 0x15E,
    Ximagc2 = 0x15F,
    Addr2b = 0x161,
    Max2b = 0x162,
    Min2b = 0x163,
    Mulc = 0x18D,
    Mulr2a = 0x197,
    Mulr2b = 0x198,
    Addr4 = 0x19A,
    Max4 = 0x19B,
    Min4 = 0x19C,
    Sqrmagc2 = 0x19D,
    Prelu2b = 0x1A0,
    Macc = 0x1CD,
    Aacc = 0x1CE,
    Elu2a = 0x1CF,
    Elu2b = 0x1D0,
    Ifr2a = 0x1D1,
    Ifr2b = 0x1D2,
    Maxac2 = 0x1D3,
    Minac2 = 0x1D4,
    Clip2a = 0x1D5,
    Clip2b = 0x1D6,
    Macr2a = 0x1D7,
    Macr2b = 0x1D8,
    Ifc = 0x1D9,
}

/// Which ALU inputs an operation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Operands {
    /// Reads X.
    pub x: bool,
    /// Reads Y.
    pub y: bool,
    /// Reads A.
    pub a: bool,
}

const ALL: [AluOp; 44] = [
    AluOp::Noop,
    AluOp::Clear,
    AluOp::Copy,
    AluOp::Swap,
    AluOp::Dbl,
    AluOp::Fana,
    AluOp::Fanb,
    AluOp::Relu2,
    AluOp::Nrelu2,
    AluOp::Inc2,
    AluOp::Dec2,
    AluOp::Addr,
    AluOp::Max,
    AluOp::Min,
    AluOp::Rsqr2b,
    AluOp::Addc,
    AluOp::Max2a,
    AluOp::Min2a,
    AluOp::Xrealc2,
    AluOp::Ximagc2,
    AluOp::Addr2b,
    AluOp::Max2b,
    AluOp::Min2b,
    AluOp::Mulc,
    AluOp::Mulr2a,
    AluOp::Mulr2b,
    AluOp::Addr4,
    AluOp::Max4,
    AluOp::Min4,
    AluOp::Sqrmagc2,
    AluOp::Prelu2b,
    AluOp::Macc,
    AluOp::Aacc,
    AluOp::Elu2a,
    AluOp::Elu2b,
    AluOp::Ifr2a,
    AluOp::Ifr2b,
    AluOp::Maxac2,
    AluOp::Minac2,
    AluOp::Clip2a,
    AluOp::Clip2b,
    AluOp::Macr2a,
    AluOp::Macr2b,
    AluOp::Ifc,
];

impl AluOp {
    /// 9-bit operation code.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decode an `ALUOP` field value.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        ALL.iter().copied().find(|op| op.code() == code)
    }

    /// Mnemonic as printed by disassemblers.
    #[must_use]
    pub fn mnemonic(self) -> String {
        format!("{self:?}").to_uppercase()
    }

    /// Inputs read by the operation.
    ///
    /// The code groups encode operand count: `0x04x` reads A only, the
    /// `0x1xx` codes read two or three inputs.
    #[must_use]
    pub const fn operands(self) -> Operands {
        match self {
            Self::Noop | Self::Clear => Operands { x: false, y: false, a: false },
            Self::Copy
            | Self::Swap
            | Self::Dbl
            | Self::Fana
            | Self::Fanb
            | Self::Relu2
            | Self::Nrelu2
            | Self::Inc2
            | Self::Dec2
            | Self::Addr
            | Self::Max
            | Self::Min => Operands { x: false, y: false, a: true },
            Self::Addc | Self::Max2a | Self::Min2a | Self::Xrealc2 | Self::Ximagc2 => {
                Operands { x: true, y: false, a: true }
            }
            Self::Rsqr2b
            | Self::Addr2b
            | Self::Max2b
            | Self::Min2b
            | Self::Mulc
            | Self::Mulr2a
            | Self::Mulr2b
            | Self::Addr4
            | Self::Max4
            | Self::Min4
            | Self::Sqrmagc2
            | Self::Prelu2b => Operands { x: true, y: true, a: false },
            _ => Operands { x: true, y: true, a: true },
        }
    }
}

impl std::fmt::Display for AluOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_fit_field() {
        for op in ALL {
            assert!(op.code() <= crate::regs::instrcfg2::ALUOP_MASK);
        }
    }

    #[test]
    fn codes_are_unique_and_decode() {
        for op in ALL {
            assert_eq!(AluOp::from_code(op.code()), Some(op));
        }
        assert_eq!(AluOp::from_code(0x1FF), None);
    }

    #[test]
    fn mnemonics() {
        assert_eq!(AluOp::Macr2a.mnemonic(), "MACR2A");
        assert_eq!(AluOp::Clip2a.to_string(), "CLIP2A");
    }

    #[test]
    fn operand_groups() {
        assert_eq!(AluOp::Copy.operands(), Operands { x: false, y: false, a: true });
        assert_eq!(AluOp::Macr2a.operands(), Operands { x: true, y: true, a: true });
        assert!(!AluOp::Mulr2a.operands().a);
    }
}
