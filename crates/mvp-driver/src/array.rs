//! Array descriptor model.
//!
//! An array is a bounded, three-dimensional strided view of device memory.
//! Dimensions are named after the way kernels use them: `Vec` (outermost),
//! `Row`, `Col` (innermost). Strides count elements, not bytes.

use crate::error::{MvpError, Result};
use mvp_chip::limits::{self, MAX_DIM_SIZE, MAX_STRIDE, MIN_STRIDE};
use mvp_chip::regs::dimcfg;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unsigned 8-bit.
    Uint8,
    /// Signed 8-bit.
    Int8,
    /// IEEE binary16.
    Fp16,
    /// Two unsigned 8-bit lanes.
    ComplexUint8,
    /// Two signed 8-bit lanes.
    ComplexInt8,
    /// Two binary16 lanes.
    ComplexFp16,
}

impl DataType {
    /// True for the paired (two-lane) types.
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::ComplexUint8 | Self::ComplexInt8 | Self::ComplexFp16)
    }

    /// Bytes per lane.
    pub const fn lane_bytes(self) -> usize {
        match self {
            Self::Fp16 | Self::ComplexFp16 => 2,
            _ => 1,
        }
    }

    /// Bytes per element (both lanes for complex types).
    pub const fn element_bytes(self) -> usize {
        if self.is_complex() {
            2 * self.lane_bytes()
        } else {
            self.lane_bytes()
        }
    }

    /// Paired form of a real type; complex types map to themselves.
    pub const fn to_complex(self) -> Self {
        match self {
            Self::Uint8 | Self::ComplexUint8 => Self::ComplexUint8,
            Self::Int8 | Self::ComplexInt8 => Self::ComplexInt8,
            Self::Fp16 | Self::ComplexFp16 => Self::ComplexFp16,
        }
    }

    const fn base_type(self) -> u32 {
        match self {
            Self::Uint8 | Self::ComplexUint8 => dimcfg::BASETYPE_UINT8,
            Self::Int8 | Self::ComplexInt8 => dimcfg::BASETYPE_INT8,
            Self::Fp16 | Self::ComplexFp16 => dimcfg::BASETYPE_BINARY16,
        }
    }

    fn from_fields(base_type: u32, complex: bool) -> Option<Self> {
        let real = match base_type {
            dimcfg::BASETYPE_UINT8 => Self::Uint8,
            dimcfg::BASETYPE_INT8 => Self::Int8,
            dimcfg::BASETYPE_BINARY16 => Self::Fp16,
            _ => return None,
        };
        Some(if complex { real.to_complex() } else { real })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uint8 => "u8",
            Self::Int8 => "i8",
            Self::Fp16 => "f16",
            Self::ComplexUint8 => "c.u8",
            Self::ComplexInt8 => "c.i8",
            Self::ComplexFp16 => "c.f16",
        };
        f.write_str(name)
    }
}

/// Array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Outermost dimension (`DIM0`).
    Vec = 0,
    /// Middle dimension (`DIM1`).
    Row = 1,
    /// Innermost dimension (`DIM2`).
    Col = 2,
}

impl Dim {
    /// All dimensions, outermost first.
    pub const ALL: [Self; 3] = [Self::Vec, Self::Row, Self::Col];

    /// Hardware dimension index.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A validated array descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDescriptor {
    base: u32,
    dtype: DataType,
    sizes: [usize; 3],
    strides: [i32; 3],
}

impl ArrayDescriptor {
    /// Build a descriptor. `sizes` and `strides` are ordered `[vec, row, col]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` if a size is 0 or above the per-dimension
    /// maximum, or a stride does not fit the signed stride field.
    pub fn new(base: u32, dtype: DataType, sizes: [usize; 3], strides: [i32; 3]) -> Result<Self> {
        for (dim, &size) in Dim::ALL.iter().zip(&sizes) {
            if !limits::dim_size_in_range(size) {
                return Err(MvpError::invalid_range(format!(
                    "array {dim:?} size {size} outside 1..={MAX_DIM_SIZE}"
                )));
            }
        }
        for (dim, &stride) in Dim::ALL.iter().zip(&strides) {
            if !limits::stride_in_range(stride) {
                return Err(MvpError::invalid_range(format!(
                    "array {dim:?} stride {stride} outside {MIN_STRIDE}..={MAX_STRIDE}"
                )));
            }
        }
        Ok(Self {
            base,
            dtype,
            sizes,
            strides,
        })
    }

    /// Base byte address.
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Element type.
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Size of one dimension.
    pub const fn size(&self, dim: Dim) -> usize {
        self.sizes[dim.index()]
    }

    /// Stride of one dimension, in elements.
    pub const fn stride(&self, dim: Dim) -> i32 {
        self.strides[dim.index()]
    }

    /// Number of elements the descriptor walks.
    pub fn element_count(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Byte address of the element at `index` (`[vec, row, col]`).
    ///
    /// Returns `None` if the address falls below zero or above `u32::MAX`.
    pub fn address_of(&self, index: [usize; 3]) -> Option<u32> {
        let elem = i64::try_from(self.dtype.element_bytes()).ok()?;
        let mut addr = i64::from(self.base);
        for d in 0..3 {
            let i = i64::try_from(index[d]).ok()?;
            addr += i * i64::from(self.strides[d]) * elem;
        }
        u32::try_from(addr).ok()
    }

    /// `[ADDRCFG, DIM0CFG, DIM1CFG, DIM2CFG]` register words.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn encode(&self) -> [u32; 4] {
        let dim = |d: usize| {
            ((self.sizes[d] as u32 - 1) & dimcfg::SIZE_MASK) << dimcfg::SIZE_SHIFT
                | ((self.strides[d] as u32) & dimcfg::STRIDE_MASK) << dimcfg::STRIDE_SHIFT
        };
        let mut dim0 = dim(0) | self.dtype.base_type() << dimcfg::BASETYPE_SHIFT;
        if self.dtype.is_complex() {
            dim0 |= dimcfg::COMPLEX;
        }
        [self.base, dim0, dim(1), dim(2)]
    }

    /// Decode register words written by [`ArrayDescriptor::encode`].
    ///
    /// Returns `None` for a reserved base type.
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(words: [u32; 4]) -> Option<Self> {
        let dtype = DataType::from_fields(
            (words[1] >> dimcfg::BASETYPE_SHIFT) & dimcfg::BASETYPE_MASK,
            words[1] & dimcfg::COMPLEX != 0,
        )?;
        let mut sizes = [0; 3];
        let mut strides = [0; 3];
        for d in 0..3 {
            let w = words[d + 1];
            sizes[d] = ((w >> dimcfg::SIZE_SHIFT) & dimcfg::SIZE_MASK) as usize + 1;
            // sign-extend the 12-bit stride
            let raw = (w >> dimcfg::STRIDE_SHIFT) & dimcfg::STRIDE_MASK;
            strides[d] = ((raw << 20) as i32) >> 20;
        }
        Some(Self {
            base: words[0],
            dtype,
            sizes,
            strides,
        })
    }
}

impl std::fmt::Display for ArrayDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "@{:#010x} {} [vec {}/{}, row {}/{}, col {}/{}]",
            self.base,
            self.dtype,
            self.sizes[0],
            self.strides[0],
            self.sizes[1],
            self.strides[1],
            self.sizes[2],
            self.strides[2]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_dimension() {
        let err = ArrayDescriptor::new(0, DataType::Int8, [1, 1025, 1], [1, 1, 1]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidRange);
        assert!(ArrayDescriptor::new(0, DataType::Int8, [0, 1, 1], [1, 1, 1]).is_err());
    }

    #[test]
    fn rejects_stride_out_of_range() {
        assert!(ArrayDescriptor::new(0, DataType::Int8, [1, 1, 1], [2048, 1, 1]).is_err());
        assert!(ArrayDescriptor::new(0, DataType::Int8, [1, 1, 1], [1, -2049, 1]).is_err());
        assert!(ArrayDescriptor::new(0, DataType::Int8, [1, 1, 1], [1, -2048, 2047]).is_ok());
    }

    #[test]
    fn encode_decode_keeps_negative_strides() {
        let a = ArrayDescriptor::new(0x2000_0100, DataType::ComplexInt8, [4, 1024, 3], [-5, 2047, -2048])
            .unwrap();
        let words = a.encode();
        assert_ne!(words[1] & dimcfg::COMPLEX, 0);
        assert_eq!(ArrayDescriptor::decode(words), Some(a));
    }

    #[test]
    fn addresses_scale_with_element_size() {
        let a = ArrayDescriptor::new(100, DataType::ComplexFp16, [2, 2, 2], [8, 4, 1]).unwrap();
        assert_eq!(a.address_of([0, 0, 1]), Some(104));
        assert_eq!(a.address_of([1, 1, 0]), Some(100 + 12 * 4));
        let neg = ArrayDescriptor::new(0, DataType::Int8, [1, 1, 2], [1, 1, -1]).unwrap();
        assert_eq!(neg.address_of([0, 0, 1]), None);
    }

    #[test]
    fn datatype_sizes() {
        assert_eq!(DataType::Int8.element_bytes(), 1);
        assert_eq!(DataType::ComplexInt8.element_bytes(), 2);
        assert_eq!(DataType::ComplexFp16.element_bytes(), 4);
        assert_eq!(DataType::Fp16.to_complex(), DataType::ComplexFp16);
    }
}
