//! Bounds-checked view over a guest's linear memory.
//!
//! Pointers and lengths arriving from a guest are attacker controlled. Every
//! ABI function goes through [`GuestMemory`] before touching guest bytes, so
//! range validation lives in exactly one place.

use std::ops::Range;

use thiserror::Error;

/// A guest-supplied range that does not fit inside guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory access out of bounds: {len} bytes at offset {offset}, memory size is {size}")]
pub struct OutOfBounds {
    pub offset: u64,
    pub len: u64,
    pub size: usize,
}

/// Mutable, bounds-checked access to a guest's linear memory.
pub struct GuestMemory<'a> {
    data: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    /// Wrap the raw memory region of a guest instance.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Memory for a guest that exports none. Every non-empty access fails.
    pub fn empty() -> GuestMemory<'static> {
        GuestMemory { data: &mut [] }
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, ptr: u32, len: u32) -> Result<Range<usize>, OutOfBounds> {
        let start = u64::from(ptr);
        let end = start + u64::from(len);
        if end > self.data.len() as u64 {
            return Err(OutOfBounds {
                offset: start,
                len: u64::from(len),
                size: self.data.len(),
            });
        }
        Ok(start as usize..end as usize)
    }

    /// Borrow `len` bytes starting at `ptr`.
    pub fn slice(&self, ptr: u32, len: u32) -> Result<&[u8], OutOfBounds> {
        let range = self.range(ptr, len)?;
        Ok(&self.data[range])
    }

    /// Mutably borrow `len` bytes starting at `ptr`.
    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8], OutOfBounds> {
        let range = self.range(ptr, len)?;
        Ok(&mut self.data[range])
    }

    /// Copy `bytes` into guest memory at `ptr`.
    pub fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), OutOfBounds> {
        let len = u32::try_from(bytes.len()).map_err(|_| OutOfBounds {
            offset: u64::from(ptr),
            len: bytes.len() as u64,
            size: self.data.len(),
        })?;
        self.slice_mut(ptr, len)?.copy_from_slice(bytes);
        Ok(())
    }
}
