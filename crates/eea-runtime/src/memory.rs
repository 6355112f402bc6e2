//! Guest memory access
//!
//! Bounds-checked view over a guest's linear memory. Raw offsets coming from
//! the guest never index the region directly; every access goes through
//! [`MemoryView::read`] / [`MemoryView::write`].

use super::types::{EeaError, EeaResult};

/// Guest pointer type (32-bit address in WASM linear memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuestPtr(pub u32);

impl GuestPtr {
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn offset(&self, bytes: u32) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for GuestPtr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl From<i32> for GuestPtr {
    fn from(addr: i32) -> Self {
        // wasm32 pointers arrive as i32; reinterpret the bits
        Self(addr as u32)
    }
}

impl From<GuestPtr> for u32 {
    fn from(ptr: GuestPtr) -> Self {
        ptr.0
    }
}

/// Guest slice (pointer + length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestSlice {
    pub ptr: GuestPtr,
    pub len: u32,
}

impl GuestSlice {
    pub fn new(ptr: GuestPtr, len: u32) -> Self {
        Self { ptr, len }
    }

    pub fn from_raw(ptr: i32, len: i32) -> Self {
        Self {
            ptr: GuestPtr::from(ptr),
            len: len.max(0) as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> GuestPtr {
        self.ptr.offset(self.len)
    }
}

/// Bounds-checked window over guest linear memory
pub struct MemoryView<'a> {
    data: &'a mut [u8],
}

impl<'a> MemoryView<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Current size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, ptr: GuestPtr, len: usize) -> EeaResult<std::ops::Range<usize>> {
        let start = ptr.as_usize();
        let out_of_bounds = || EeaError::MemoryOutOfBounds {
            offset: ptr.0,
            size: len.min(u32::MAX as usize) as u32,
        };
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;

        if end > self.data.len() {
            return Err(out_of_bounds());
        }

        Ok(start..end)
    }

    /// Check that `[ptr, ptr + len)` lies inside memory
    pub fn check(&self, ptr: GuestPtr, len: u32) -> EeaResult<()> {
        self.range(ptr, len as usize).map(|_| ())
    }

    /// Read bytes from memory
    pub fn read(&self, ptr: GuestPtr, len: u32) -> EeaResult<&[u8]> {
        let range = self.range(ptr, len as usize)?;
        Ok(&self.data[range])
    }

    /// Read a guest slice
    pub fn read_slice(&self, slice: GuestSlice) -> EeaResult<&[u8]> {
        self.read(slice.ptr, slice.len)
    }

    /// Write bytes to memory
    pub fn write(&mut self, ptr: GuestPtr, bytes: &[u8]) -> EeaResult<()> {
        let range = self.range(ptr, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a fixed-size little-endian value
    pub fn read_array<const N: usize>(&self, ptr: GuestPtr) -> EeaResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(ptr, N as u32)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_ptr() {
        let ptr = GuestPtr::new(100);
        assert_eq!(ptr.0, 100);

        let offset_ptr = ptr.offset(50);
        assert_eq!(offset_ptr.0, 150);

        assert!(!ptr.is_null());
        assert!(GuestPtr::new(0).is_null());
        assert_eq!(GuestPtr::new(u32::MAX).offset(10).0, u32::MAX);
    }

    #[test]
    fn test_guest_slice_from_raw() {
        let slice = GuestSlice::from_raw(64, -5);
        assert!(slice.is_empty());

        let slice = GuestSlice::from_raw(64, 16);
        assert_eq!(slice.end(), GuestPtr::new(80));
    }

    #[test]
    fn test_memory_view_read_write() {
        let mut backing = vec![0u8; 4096];
        let mut view = MemoryView::new(&mut backing);

        let data = b"Hello, WASM!";
        let ptr = GuestPtr::new(1024);
        view.write(ptr, data).unwrap();

        let read = view.read(ptr, data.len() as u32).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_memory_bounds() {
        let mut backing = vec![0u8; 64];
        let mut view = MemoryView::new(&mut backing);

        assert!(view.read(GuestPtr::new(60), 4).is_ok());
        assert!(view.read(GuestPtr::new(60), 5).is_err());
        assert!(view.write(GuestPtr::new(64), &[1]).is_err());
        assert!(view.check(GuestPtr::new(u32::MAX), u32::MAX).is_err());

        match view.read(GuestPtr::new(100), 8) {
            Err(EeaError::MemoryOutOfBounds { offset, size }) => {
                assert_eq!(offset, 100);
                assert_eq!(size, 8);
            }
            other => panic!("expected out of bounds, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let mut backing = vec![0u8; 16];
        let mut view = MemoryView::new(&mut backing);

        assert!(view.write(GuestPtr::new(10), &[0xff; 8]).is_err());
        assert!(backing.iter().all(|b| *b == 0));
    }
}
