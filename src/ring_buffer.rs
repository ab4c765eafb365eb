//! Wait-free single-producer / single-consumer byte ring.
//!
//! The backing pages are mapped *twice*, back to back, in the process's
//! virtual address space. Any read or write region of up to `capacity`
//! bytes is therefore contiguous no matter where the cursor sits, and the
//! consumer never splits a read at the wrap point. The double mapping is
//! an implementation detail: the public contract is the two-phase
//! begin/end API plus the `read`/`write` conveniences.
//!
//! Concurrency contract: exactly one producer and one consumer, which may
//! be the same thread. [`RingBuffer::split`] enforces this by
//! construction, handing out one [`RingWriter`] and one [`RingReader`],
//! each owning its index. Indices are published with release stores and
//! observed with acquire loads; there are no locks and no system calls on
//! the hot path.
//!
//! Effective storage is `capacity - 1` bytes: one slot distinguishes a
//! full ring from an empty one.

use std::cmp::min;
use std::ffi::{c_void, CString};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use crate::error::RingError;

/// The doubled virtual mapping. Unmapped as a whole on drop.
struct RingMap {
    base: NonNull<c_void>,
    capacity: usize,
}

// The map itself is plain memory; all synchronisation happens through the
// atomic indices in RingInner.
unsafe impl Send for RingMap {}
unsafe impl Sync for RingMap {}

impl Drop for RingMap {
    fn drop(&mut self) {
        // SAFETY: base covers exactly the 2 * capacity bytes reserved in new().
        unsafe {
            let _ = munmap(self.base.as_ptr(), self.capacity * 2);
        }
    }
}

struct RingInner {
    map: RingMap,
    capacity: i32,
    capacity_mask: i32,
    read_index: AtomicI32,
    write_index: AtomicI32,
}

impl RingInner {
    fn ptr(&self) -> *mut u8 {
        self.map.base.as_ptr() as *mut u8
    }
}

fn page_size() -> i32 {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) as i32 }
}

fn map_mirrored(capacity: usize) -> Result<RingMap, RingError> {
    let name = CString::new("lobbynet-ring-buffer").expect("static name contains no NUL");
    let fd = memfd_create(&name, MemFdCreateFlag::empty())?;
    ftruncate(&fd, capacity as nix::libc::off_t)?;

    let double = NonZeroUsize::new(capacity * 2).expect("capacity is never zero");
    let single = NonZeroUsize::new(capacity).expect("capacity is never zero");

    // Reserve address space for both copies, then map the file over each
    // half. MAP_FIXED replaces the reservation in place, so unmapping the
    // whole range on drop releases everything.
    //
    // SAFETY: the reservation is ours alone; the fixed mappings stay
    // within it.
    let raw_base = unsafe {
        mmap(
            None,
            double,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            None::<std::os::fd::BorrowedFd>,
            0,
        )
    }?;
    let base = NonNull::new(raw_base).expect("mmap does not return null on success");
    let map = RingMap { base, capacity };

    let first = unsafe {
        mmap(
            NonZeroUsize::new(base.as_ptr() as usize),
            single,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
            Some(&fd),
            0,
        )
    }?;

    let second = unsafe {
        mmap(
            NonZeroUsize::new(base.as_ptr() as usize + capacity),
            single,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
            Some(&fd),
            0,
        )
    }?;

    debug_assert_eq!(first, base.as_ptr());
    debug_assert_eq!(second as usize, base.as_ptr() as usize + capacity);

    Ok(map)
}

/// Producer half of the ring. Owns `write_index`.
pub struct RingWriter {
    inner: Arc<RingInner>,
}

impl RingWriter {
    pub fn capacity(&self) -> i32 {
        self.inner.capacity
    }

    /// Number of bytes that can currently be written.
    pub fn free(&self) -> i32 {
        let read = self.inner.read_index.load(Ordering::Acquire);
        let write = self.inner.write_index.load(Ordering::Relaxed);
        (read - write - 1) & self.inner.capacity_mask
    }

    /// Begin a write of up to `size` bytes. The granted size is written
    /// back through `size`; the returned slice is contiguous and exactly
    /// that long. Returns `None` when nothing can be written.
    pub fn begin_write(&mut self, size: &mut i32) -> Option<&mut [u8]> {
        *size = min(*size, self.free());

        if *size <= 0 {
            return None;
        }

        let write = self.inner.write_index.load(Ordering::Relaxed);

        // SAFETY: the mirrored mapping makes [write, write + size) valid
        // even across the wrap point, and the consumer never touches bytes
        // between the indices on this side.
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.inner.ptr().add(write as usize), *size as usize)
        })
    }

    /// Publish up to `size` previously written bytes. The clamped size is
    /// written back; returns the number of free bytes observed afterwards.
    pub fn end_write(&mut self, size: &mut i32) -> i32 {
        let free = self.free();
        *size = min(*size, free);

        let write = self.inner.write_index.load(Ordering::Relaxed);
        self.inner
            .write_index
            .store((write + *size) & self.inner.capacity_mask, Ordering::Release);

        free - *size
    }

    /// Copy as much of `source` into the ring as fits; returns the number
    /// of bytes written.
    pub fn write(&mut self, source: &[u8]) -> i32 {
        let mut size = min(source.len(), i32::MAX as usize) as i32;

        if let Some(region) = self.begin_write(&mut size) {
            region.copy_from_slice(&source[..size as usize]);
        }

        self.end_write(&mut size);
        size
    }
}

/// Consumer half of the ring. Owns `read_index`.
pub struct RingReader {
    inner: Arc<RingInner>,
}

impl RingReader {
    pub fn capacity(&self) -> i32 {
        self.inner.capacity
    }

    /// Number of bytes that can currently be read.
    pub fn available(&self) -> i32 {
        let read = self.inner.read_index.load(Ordering::Relaxed);
        let write = self.inner.write_index.load(Ordering::Acquire);
        (self.inner.capacity - (read - write)) & self.inner.capacity_mask
    }

    /// Begin a read of up to `size` bytes. The granted size is written
    /// back through `size`; the returned slice is contiguous and exactly
    /// that long. Returns `None` when nothing is available.
    pub fn begin_read(&mut self, size: &mut i32) -> Option<&[u8]> {
        *size = min(*size, self.available());

        if *size <= 0 {
            return None;
        }

        let read = self.inner.read_index.load(Ordering::Relaxed);

        // SAFETY: the producer published [read, read + size) with a
        // release store before it became available, and will not reuse it
        // until the read index advances.
        Some(unsafe {
            std::slice::from_raw_parts(self.inner.ptr().add(read as usize), *size as usize)
        })
    }

    /// Release up to `size` previously read bytes back to the producer.
    /// The clamped size is written back; returns the number of available
    /// bytes observed afterwards.
    pub fn end_read(&mut self, size: &mut i32) -> i32 {
        let available = self.available();
        *size = min(*size, available);

        let read = self.inner.read_index.load(Ordering::Relaxed);
        self.inner
            .read_index
            .store((read + *size) & self.inner.capacity_mask, Ordering::Release);

        available - *size
    }

    /// Copy as much of the ring into `destination` as is available;
    /// returns the number of bytes read.
    pub fn read(&mut self, destination: &mut [u8]) -> i32 {
        let mut size = min(destination.len(), i32::MAX as usize) as i32;

        if let Some(region) = self.begin_read(&mut size) {
            destination[..size as usize].copy_from_slice(region);
        }

        self.end_read(&mut size);
        size
    }
}

/// Both halves of the ring in one handle, for single-threaded use.
pub struct RingBuffer {
    writer: RingWriter,
    reader: RingReader,
}

impl RingBuffer {
    /// Create a ring of at least `capacity` bytes. The actual capacity is
    /// rounded up to the larger of the system page size and the next power
    /// of two.
    pub fn new(capacity: i32) -> Result<RingBuffer, RingError> {
        if capacity <= 1 || capacity > (1 << 30) {
            return Err(RingError::InvalidCapacity(capacity));
        }

        let mut rounded = (capacity as u32).next_power_of_two() as i32;
        rounded = rounded.max(page_size());

        let map = map_mirrored(rounded as usize)?;
        let inner = Arc::new(RingInner {
            map,
            capacity: rounded,
            capacity_mask: rounded - 1,
            read_index: AtomicI32::new(0),
            write_index: AtomicI32::new(0),
        });

        Ok(RingBuffer {
            writer: RingWriter {
                inner: inner.clone(),
            },
            reader: RingReader { inner },
        })
    }

    /// Separate the producer and consumer halves so they can move to
    /// their owning threads.
    pub fn split(self) -> (RingWriter, RingReader) {
        (self.writer, self.reader)
    }

    pub fn capacity(&self) -> i32 {
        self.writer.capacity()
    }

    pub fn free(&self) -> i32 {
        self.writer.free()
    }

    pub fn available(&self) -> i32 {
        self.reader.available()
    }

    pub fn begin_write(&mut self, size: &mut i32) -> Option<&mut [u8]> {
        self.writer.begin_write(size)
    }

    pub fn end_write(&mut self, size: &mut i32) -> i32 {
        self.writer.end_write(size)
    }

    pub fn write(&mut self, source: &[u8]) -> i32 {
        self.writer.write(source)
    }

    pub fn begin_read(&mut self, size: &mut i32) -> Option<&[u8]> {
        self.reader.begin_read(size)
    }

    pub fn end_read(&mut self, size: &mut i32) -> i32 {
        self.reader.end_read(size)
    }

    pub fn read(&mut self, destination: &mut [u8]) -> i32 {
        self.reader.read(destination)
    }
}
