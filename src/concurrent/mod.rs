//! Aligned shared buffer: a contiguous region supporting atomic loads/stores
//! with explicit memory ordering, plus bulk copy/fill helpers. This is the
//! foundation every other primitive in this crate is built on top of (spec.md
//! §4.1, component A).
//!
//! Every load has three flavors (volatile, acquire, opaque) plus a plain,
//! non-atomic one; every store has four (volatile, release/ordered, opaque,
//! plain). Callers pick exactly the ordering they need rather than getting a
//! single "atomic" type that hides the choice — see the Design Notes in
//! spec.md §9 on why this is a flat method matrix rather than an inheritance
//! hierarchy of buffer types.
//!
//! All mutating operations take `&self`, not `&mut self`. That's not an
//! oversight: the whole point of a buffer like this is that multiple
//! producers write into it through a *shared* reference (the many-to-one
//! ring buffer's CAS-won producer, a counters store's concurrent wrapper,
//! and so on), the same way `AtomicI64::store` takes `&self`. Every store
//! here — atomic or plain — goes through a raw pointer derived from
//! `as_ptr()`, so the `unsafe` is concentrated in `overlay`/`overlay_mut`
//! and the bulk-copy helpers; callers are responsible for the same
//! external synchronization real atomics require (no two writers racing on
//! the same non-atomic field).

pub mod counters;
pub mod mpsc_ring_buffer;
pub mod record_descriptor;
pub mod ring_buffer;
pub mod spsc_ring_buffer;

use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::util::{IndexT, IpcError, Result};

use memmap2::MmapMut;

fn bounds_check_slice(slice: &[u8], offset: IndexT, size: IndexT) -> Result<()> {
    if offset < 0 || size < 0 || slice.len() as IndexT - offset < size {
        Err(IpcError::BoundsCheck)
    } else {
        Ok(())
    }
}

/// Atomic operations on a shared region of memory.
///
/// Implemented for anything that derefs to `[u8]`/`&mut [u8]`: a plain
/// `Vec<u8>` for single-process use and tests, a borrowed `&mut [u8]` over
/// someone else's allocation, or a `memmap2::MmapMut` for cross-process
/// sharing via a memory-mapped file.
pub trait AtomicBuffer: Deref<Target = [u8]> + DerefMut<Target = [u8]> {
    /// Check that `size` bytes starting at `offset` lie within the buffer.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buffer = &mut [0u8; 8][..];
    /// assert!(buffer.bounds_check(0, 8).is_ok());
    /// assert!(buffer.bounds_check(1, 7).is_ok());
    /// assert!(buffer.bounds_check(1, 8).is_err());
    /// assert!(buffer.bounds_check(-1, 8).is_err());
    /// ```
    fn bounds_check(&self, offset: IndexT, size: IndexT) -> Result<()> {
        bounds_check_slice(self.deref(), offset, size)
    }

    /// Fail unless the buffer's base address is 8-byte aligned. Misaligned
    /// 64-bit atomic access on architectures that require alignment is a
    /// precondition violation rather than something this trait can repair.
    fn verify_alignment(&self) -> Result<()> {
        if (self.as_ptr() as usize) % size_of::<i64>() == 0 {
            Ok(())
        } else {
            Err(IpcError::BoundsCheck)
        }
    }

    /// Overlay a shared, plain reference onto the buffer at `offset`.
    fn overlay<T>(&self, offset: IndexT) -> Result<&T>
    where
        T: Sized,
    {
        self.bounds_check(offset, size_of::<T>() as IndexT).map(|_| {
            let p = unsafe { self.as_ptr().offset(offset as isize) };
            unsafe { &*(p as *const T) }
        })
    }

    /// Overlay a raw mutable pointer onto the buffer at `offset`. Takes
    /// `&self`, not `&mut self`: the pointer is derived from the buffer's
    /// base address and cast past `const`, the same trick `AtomicI64`'s
    /// underlying intrinsics use. Safe to dereference for a write as long as
    /// no other in-process reader is concurrently aliasing the same bytes as
    /// a safe reference.
    fn overlay_mut<T>(&self, offset: IndexT) -> Result<*mut T>
    where
        T: Sized,
    {
        self.bounds_check(offset, size_of::<T>() as IndexT).map(|_| {
            let p = unsafe { self.as_ptr().offset(offset as isize) };
            p as *mut T
        })
    }

    // ---- i32 family -------------------------------------------------

    /// Plain (non-atomic, no ordering) read of an `i32`.
    fn get_i32(&self, offset: IndexT) -> Result<i32> {
        self.overlay::<i32>(offset).map(|v| *v)
    }

    /// Plain (non-atomic, no ordering) write of an `i32`.
    fn put_i32(&self, offset: IndexT, value: i32) -> Result<()> {
        self.overlay_mut::<i32>(offset).map(|p| unsafe { *p = value })
    }

    /// Sequentially-consistent read of an `i32`.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buffer = vec![12u8, 0, 0, 0];
    /// assert_eq!(buffer.get_i32_volatile(0), Ok(12));
    /// ```
    fn get_i32_volatile(&self, offset: IndexT) -> Result<i32> {
        self.overlay::<AtomicI32>(offset).map(|a| a.load(Ordering::SeqCst))
    }

    /// Sequentially-consistent write of an `i32`.
    fn put_i32_volatile(&self, offset: IndexT, value: i32) -> Result<()> {
        self.overlay::<AtomicI32>(offset).map(|a| a.store(value, Ordering::SeqCst))
    }

    /// Acquire read of an `i32`: happens-after a matching release store.
    fn get_i32_acquire(&self, offset: IndexT) -> Result<i32> {
        self.overlay::<AtomicI32>(offset).map(|a| a.load(Ordering::Acquire))
    }

    /// Release store of an `i32`: happens-before a matching acquire load.
    /// This is the "ordered"/"release" write named in spec.md §4.1; both
    /// names refer to the same store.
    fn put_i32_ordered(&self, offset: IndexT, value: i32) -> Result<()> {
        self.overlay::<AtomicI32>(offset).map(|a| a.store(value, Ordering::Release))
    }

    /// Single-copy-atomic read of an `i32` with no ordering relative to other
    /// accesses.
    fn get_i32_opaque(&self, offset: IndexT) -> Result<i32> {
        self.overlay::<AtomicI32>(offset).map(|a| a.load(Ordering::Relaxed))
    }

    /// Single-copy-atomic write of an `i32` with no ordering relative to
    /// other accesses.
    fn put_i32_opaque(&self, offset: IndexT, value: i32) -> Result<()> {
        self.overlay::<AtomicI32>(offset).map(|a| a.store(value, Ordering::Relaxed))
    }

    // ---- i64 family -------------------------------------------------

    /// Read an `i64` value from the buffer without performing any
    /// synchronization.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buffer = vec![12u8, 0, 0, 0, 0, 0, 0, 0];
    /// assert_eq!(buffer.get_i64(0), Ok(12));
    /// ```
    fn get_i64(&self, offset: IndexT) -> Result<i64> {
        self.overlay::<i64>(offset).map(|v| *v)
    }

    /// Write an `i64` value into the buffer without performing any
    /// synchronization.
    fn put_i64(&self, offset: IndexT, value: i64) -> Result<()> {
        self.overlay_mut::<i64>(offset).map(|p| unsafe { *p = value })
    }

    /// Sequentially-consistent read of an `i64`.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buffer = vec![12u8, 0, 0, 0, 0, 0, 0, 0];
    /// assert_eq!(buffer.get_i64_volatile(0), Ok(12));
    /// ```
    fn get_i64_volatile(&self, offset: IndexT) -> Result<i64> {
        self.overlay::<AtomicI64>(offset).map(|a| a.load(Ordering::SeqCst))
    }

    /// Sequentially-consistent write of an `i64`.
    fn put_i64_volatile(&self, offset: IndexT, value: i64) -> Result<()> {
        self.overlay::<AtomicI64>(offset).map(|a| a.store(value, Ordering::SeqCst))
    }

    /// Acquire read of an `i64`: happens-after a matching release store.
    fn get_i64_acquire(&self, offset: IndexT) -> Result<i64> {
        self.overlay::<AtomicI64>(offset).map(|a| a.load(Ordering::Acquire))
    }

    /// Release store of an `i64`. Named `put_i64_ordered` after the
    /// reference API ("putLongOrdered"); `put_i64_release` is an alias.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buffer = vec![0u8; 8];
    /// buffer.put_i64_ordered(0, 12).unwrap();
    /// assert_eq!(buffer.get_i64_acquire(0), Ok(12));
    /// ```
    fn put_i64_ordered(&self, offset: IndexT, value: i64) -> Result<()> {
        self.overlay::<AtomicI64>(offset).map(|a| a.store(value, Ordering::Release))
    }

    /// Alias for [`AtomicBuffer::put_i64_ordered`].
    fn put_i64_release(&self, offset: IndexT, value: i64) -> Result<()> {
        self.put_i64_ordered(offset, value)
    }

    /// Single-copy-atomic read of an `i64` with no ordering relative to other
    /// accesses.
    fn get_i64_opaque(&self, offset: IndexT) -> Result<i64> {
        self.overlay::<AtomicI64>(offset).map(|a| a.load(Ordering::Relaxed))
    }

    /// Single-copy-atomic write of an `i64` with no ordering relative to
    /// other accesses.
    fn put_i64_opaque(&self, offset: IndexT, value: i64) -> Result<()> {
        self.overlay::<AtomicI64>(offset).map(|a| a.store(value, Ordering::Relaxed))
    }

    /// Atomic compare-and-swap of an `i64`. Returns `Ok(true)` if `update` was
    /// stored, `Ok(false)` if `expected` didn't match the current value.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buf = vec![0u8; 8];
    /// assert_eq!(buf.compare_and_set_i64(0, 0, 1), Ok(true));
    /// assert_eq!(buf.compare_and_set_i64(0, 0, 2), Ok(false));
    /// assert_eq!(buf.get_i64_volatile(0), Ok(1));
    /// ```
    fn compare_and_set_i64(&self, offset: IndexT, expected: i64, update: i64) -> Result<bool> {
        self.overlay::<AtomicI64>(offset).map(|a| {
            a.compare_exchange(expected, update, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        })
    }

    /// Atomic fetch-and-add of an `i64`, returning the value before the add.
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let buf = vec![0u8; 8];
    /// assert_eq!(buf.get_and_add_i64(0, 1), Ok(0));
    /// assert_eq!(buf.get_and_add_i64(0, 1), Ok(1));
    /// ```
    fn get_and_add_i64(&self, offset: IndexT, delta: i64) -> Result<i64> {
        self.overlay::<AtomicI64>(offset).map(|a| a.fetch_add(delta, Ordering::SeqCst))
    }

    /// Atomic exchange of an `i64`, returning the previous value.
    fn get_and_set_i64(&self, offset: IndexT, value: i64) -> Result<i64> {
        self.overlay::<AtomicI64>(offset).map(|a| a.swap(value, Ordering::SeqCst))
    }

    // ---- bulk operations ---------------------------------------------

    /// Copy `len` bytes from `source` (starting at `source_index`) into this
    /// buffer at `index`. No synchronization is performed; the caller
    /// publishes visibility separately (typically via a release store of a
    /// record's length field).
    ///
    /// ```rust
    /// # use concurrent_ipc::concurrent::AtomicBuffer;
    /// let source = vec![1u8, 2, 3, 4];
    /// let dest = vec![0u8, 0, 0, 0];
    /// dest.put_bytes(1, &source, 1, 3).unwrap();
    /// assert_eq!(dest, [0u8, 2, 3, 4]);
    /// ```
    fn put_bytes<B>(&self, index: IndexT, source: &B, source_index: IndexT, len: IndexT) -> Result<()>
    where
        B: AtomicBuffer,
    {
        self.bounds_check(index, len)?;
        source.bounds_check(source_index, len)?;

        unsafe {
            let src = source.as_ptr().offset(source_index as isize);
            let dst = self.as_ptr().offset(index as isize) as *mut u8;
            ptr::copy_nonoverlapping(src, dst, len as usize);
        }
        Ok(())
    }

    /// As [`AtomicBuffer::put_bytes`], but copying from a plain byte slice.
    fn put_slice(&self, index: IndexT, source: &[u8], source_index: IndexT, len: IndexT) -> Result<()> {
        self.bounds_check(index, len)?;
        bounds_check_slice(source, source_index, len)?;

        unsafe {
            let src = source.as_ptr().offset(source_index as isize);
            let dst = self.as_ptr().offset(index as isize) as *mut u8;
            ptr::copy_nonoverlapping(src, dst, len as usize);
        }
        Ok(())
    }

    /// Fill `length` bytes starting at `offset` with `value`. Guaranteed to
    /// use `memset` rather than a byte-at-a-time loop.
    fn set_memory(&self, offset: IndexT, length: usize, value: u8) -> Result<()> {
        self.bounds_check(offset, length as IndexT).map(|_| unsafe {
            (self.as_ptr().offset(offset as isize) as *mut u8).write_bytes(value, length)
        })
    }

    /// Total number of bytes in this buffer.
    fn capacity(&self) -> IndexT {
        self.len() as IndexT
    }
}

impl AtomicBuffer for Vec<u8> {}

impl AtomicBuffer for &mut [u8] {}

impl AtomicBuffer for MmapMut {}

#[cfg(test)]
mod tests {
    use crate::concurrent::AtomicBuffer;
    use crate::util::IpcError;

    #[test]
    fn negative_offset() {
        let buf = vec![16u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(buf.get_and_add_i64(-1, 0), Err(IpcError::BoundsCheck));
    }

    #[test]
    fn opaque_roundtrip() {
        let buf = vec![0u8; 4];
        buf.put_i32_opaque(0, 42).unwrap();
        assert_eq!(buf.get_i32_opaque(0), Ok(42));
    }

    #[test]
    fn acquire_release_roundtrip() {
        let buf = vec![0u8; 8];
        buf.put_i64_ordered(0, 7).unwrap();
        assert_eq!(buf.get_i64_acquire(0), Ok(7));
    }

    #[test]
    fn get_and_set() {
        let buf = 5i64.to_ne_bytes().to_vec();
        assert_eq!(buf.get_and_set_i64(0, 9), Ok(5));
        assert_eq!(buf.get_i64(0), Ok(9));
    }

    #[test]
    fn alignment_check() {
        let buf = vec![0u8; 64];
        assert!(buf.verify_alignment().is_ok());
    }

    #[test]
    fn plain_roundtrip_through_shared_reference() {
        let buf = vec![0u8; 8];
        buf.put_i32(0, 11).unwrap();
        buf.put_i32(4, 22).unwrap();
        assert_eq!(buf.get_i32(0), Ok(11));
        assert_eq!(buf.get_i32(4), Ok(22));
    }
}
