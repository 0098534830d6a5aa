//! Device memory.
//!
//! A byte-addressed arena standing in for the RAM the accelerator's bus
//! masters read and write. Buffers are bump-allocated; kernels receive
//! [`Buffer`] handles (address + length) rather than host slices, exactly
//! like the accelerator sees them.

use crate::error::{MvpError, Result};
use half::f16;
use tracing::debug;

/// Default base address of the arena.
pub const DEFAULT_BASE: u32 = 0x2000_0000;

/// A region of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer {
    /// Start address.
    pub addr: u32,
    /// Length in bytes.
    pub len: usize,
}

impl Buffer {
    /// Buffer at a fixed address.
    pub const fn new(addr: u32, len: usize) -> Self {
        Self { addr, len }
    }

    /// Address of byte `offset`, saturating at the top of the address space.
    pub fn at(&self, offset: usize) -> u32 {
        u32::try_from(offset).map_or(u32::MAX, |o| self.addr.saturating_add(o))
    }

    /// Sub-buffer starting `offset` bytes in.
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        Self::new(self.at(offset), len)
    }

    /// True if the start address is even.
    pub const fn is_even(&self) -> bool {
        self.addr % 2 == 0
    }
}

/// Byte-addressed device memory arena.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    base: u32,
    bytes: Vec<u8>,
    next: usize,
}

impl DeviceMemory {
    /// Arena of `size` bytes at [`DEFAULT_BASE`].
    pub fn new(size: usize) -> Self {
        Self::with_base(DEFAULT_BASE, size)
    }

    /// Arena of `size` bytes at `base`.
    pub fn with_base(base: u32, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
            next: 0,
        }
    }

    /// Total arena size.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes not yet allocated.
    pub fn available(&self) -> usize {
        self.bytes.len() - self.next
    }

    /// Allocate `len` bytes aligned to `align` (a power of two).
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the arena is exhausted.
    pub fn alloc(&mut self, len: usize, align: usize) -> Result<Buffer> {
        self.alloc_offset(len, align, 0)
    }

    /// Allocate `len` bytes starting `offset` bytes past an `align` boundary.
    ///
    /// Used to place buffers on odd addresses.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the arena is exhausted.
    pub fn alloc_offset(&mut self, len: usize, align: usize, offset: usize) -> Result<Buffer> {
        let align = align.max(1);
        let base = self.base as usize;
        let start = (base + self.next).next_multiple_of(align) - base + offset;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(MvpError::OutOfMemory {
                requested: len,
                available: self.available(),
            });
        }
        self.next = end;
        let buffer = Buffer::new(self.address(start)?, len);
        debug!("alloc {len} bytes @ {:#010x}", buffer.addr);
        Ok(buffer)
    }

    /// Release every allocation and zero the arena.
    pub fn reset(&mut self) {
        self.bytes.fill(0);
        self.next = 0;
    }

    fn address(&self, index: usize) -> Result<u32> {
        u32::try_from(index)
            .ok()
            .and_then(|i| self.base.checked_add(i))
            .ok_or(MvpError::BadAddress {
                address: self.base,
                len: index,
            })
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let bad = MvpError::BadAddress { address, len };
        let start = address.checked_sub(self.base).ok_or_else(|| bad.clone())? as usize;
        let end = start.checked_add(len).ok_or_else(|| bad.clone())?;
        if end > self.bytes.len() {
            return Err(bad);
        }
        Ok(start..end)
    }

    /// Borrow `len` bytes at `address`.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the range leaves the arena.
    pub fn read_bytes(&self, address: u32, len: usize) -> Result<&[u8]> {
        let r = self.range(address, len)?;
        Ok(&self.bytes[r])
    }

    /// Copy `data` to `address`.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the range leaves the arena.
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let r = self.range(address, data.len())?;
        self.bytes[r].copy_from_slice(data);
        Ok(())
    }

    /// Fill a buffer with `value`.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the buffer leaves the arena.
    pub fn fill(&mut self, buffer: Buffer, value: u8) -> Result<()> {
        let r = self.range(buffer.addr, buffer.len)?;
        self.bytes[r].fill(value);
        Ok(())
    }

    /// Write signed bytes.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the data does not fit the buffer or arena.
    pub fn write_i8(&mut self, buffer: Buffer, data: &[i8]) -> Result<()> {
        check_fits(buffer, data.len())?;
        let raw: Vec<u8> = data.iter().map(|v| v.to_ne_bytes()[0]).collect();
        self.write_bytes(buffer.addr, &raw)
    }

    /// Read a buffer as signed bytes.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the buffer leaves the arena.
    pub fn read_i8(&self, buffer: Buffer) -> Result<Vec<i8>> {
        Ok(self
            .read_bytes(buffer.addr, buffer.len)?
            .iter()
            .map(|b| i8::from_ne_bytes([*b]))
            .collect())
    }

    /// Write fp16 values (little endian).
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the data does not fit the buffer or arena.
    pub fn write_f16(&mut self, buffer: Buffer, data: &[f16]) -> Result<()> {
        check_fits(buffer, data.len() * 2)?;
        let raw: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(buffer.addr, &raw)
    }

    /// Read a buffer as fp16 values.
    ///
    /// # Errors
    ///
    /// Returns `BadAddress` if the buffer leaves the arena.
    pub fn read_f16(&self, buffer: Buffer) -> Result<Vec<f16>> {
        Ok(self
            .read_bytes(buffer.addr, buffer.len)?
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]))
            .collect())
    }
}

fn check_fits(buffer: Buffer, len: usize) -> Result<()> {
    if len > buffer.len {
        return Err(MvpError::BadAddress {
            address: buffer.addr,
            len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_offset_allocation() {
        let mut mem = DeviceMemory::new(256);
        let a = mem.alloc(3, 1).unwrap();
        let b = mem.alloc(4, 4).unwrap();
        let c = mem.alloc_offset(4, 4, 1).unwrap();
        assert_eq!(a.addr, DEFAULT_BASE);
        assert_eq!(b.addr % 4, 0);
        assert!(b.addr >= a.addr + 3);
        assert_eq!(c.addr % 4, 1);
        assert!(!c.is_even());
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut mem = DeviceMemory::new(16);
        mem.alloc(10, 1).unwrap();
        let err = mem.alloc(10, 1).unwrap_err();
        assert_eq!(
            err,
            MvpError::OutOfMemory {
                requested: 10,
                available: 6
            }
        );
    }

    #[test]
    fn typed_access() {
        let mut mem = DeviceMemory::new(64);
        let ints = mem.alloc(4, 1).unwrap();
        mem.write_i8(ints, &[-128, -1, 0, 127]).unwrap();
        assert_eq!(mem.read_i8(ints).unwrap(), vec![-128, -1, 0, 127]);

        let halves = mem.alloc(4, 2).unwrap();
        mem.write_f16(halves, &[f16::from_f32(1.5), f16::from_f32(-0.25)]).unwrap();
        assert_eq!(
            mem.read_f16(halves).unwrap(),
            vec![f16::from_f32(1.5), f16::from_f32(-0.25)]
        );
        assert!(mem.write_i8(ints, &[0; 5]).is_err());
    }

    #[test]
    fn out_of_arena_access() {
        let mem = DeviceMemory::new(8);
        assert!(mem.read_bytes(DEFAULT_BASE - 1, 1).is_err());
        assert!(mem.read_bytes(DEFAULT_BASE + 7, 2).is_err());
        assert!(mem.read_bytes(DEFAULT_BASE + 7, 1).is_ok());
    }
}
