//! Mapping bookkeeping over the raw OS map/unmap primitives.
//!
//! Every view handed out by [`MappingRegistry::map`] is recorded, and every
//! [`MappingRegistry::unmap`] is validated against those records before any
//! syscall is issued: the view must describe a live mapping in full, exactly
//! once. Records are keyed by the address of the region's *last* byte, so a
//! caller holding only a prefix of a mapping cannot key into the registry
//! and release the whole region by accident.

use crate::errors::Error;
use core::ops::Range;
use core::ptr::{self, NonNull};
use core::{fmt, slice};
use rustix::fd::{BorrowedFd, RawFd};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use spin::Mutex;

/// The raw map/unmap capability consumed by the registry.
///
/// Implemented by [`HostMem`] for the real OS; tests substitute a recording
/// fake to exercise the bookkeeping deterministically.
pub trait RawMem {
    /// Maps `len` bytes at an OS-chosen address.
    ///
    /// # Errors
    ///
    /// The OS error code of the failed map call, verbatim.
    ///
    /// # Safety
    ///
    /// Establishes a mapping the caller becomes responsible for; `prot`,
    /// `flags`, `fd` and `offset` are passed through to the OS unchanged.
    unsafe fn raw_map(
        &self,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: RawFd,
        offset: u64,
    ) -> Result<NonNull<u8>, Errno>;

    /// Unmaps `len` bytes starting at `base`.
    ///
    /// # Errors
    ///
    /// The OS error code of the failed unmap call, verbatim. Failure is
    /// non-destructive: the mapping is still live.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be a mapping previously returned by
    /// [`raw_map`](RawMem::raw_map); all views into it dangle afterwards.
    unsafe fn raw_unmap(&self, base: NonNull<u8>, len: usize) -> Result<(), Errno>;
}

/// [`RawMem`] backed by the host OS via `rustix::mm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMem;

impl RawMem for HostMem {
    unsafe fn raw_map(
        &self,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: RawFd,
        offset: u64,
    ) -> Result<NonNull<u8>, Errno> {
        // A negative descriptor selects the anonymous zero-filled source;
        // rustix models that as a separate entry point.
        let ptr = if fd < 0 {
            rustix::mm::mmap_anonymous(ptr::null_mut(), len, prot, flags)?
        } else {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                prot,
                flags,
                BorrowedFd::borrow_raw(fd),
                offset,
            )?
        };
        // The OS never returns a null address for a successful map.
        Ok(NonNull::new_unchecked(ptr.cast()))
    }

    unsafe fn raw_unmap(&self, base: NonNull<u8>, len: usize) -> Result<(), Errno> {
        rustix::mm::munmap(base.as_ptr().cast(), len)
    }
}

/// A caller-facing handle to a live mapping.
///
/// A view tracks its base address, its length, and the full allocated extent
/// it was cut from. [`subview`](MappingView::subview) narrows a view without
/// touching the mapping itself; only a view still covering its full extent is
/// accepted by [`MappingRegistry::unmap`].
pub struct MappingView {
    base: NonNull<u8>,
    len: usize,
    cap: usize,
}

// The view is plain metadata plus a pointer into an OS mapping; the unsafe
// accessors carry the aliasing obligations.
unsafe impl Send for MappingView {}
unsafe impl Sync for MappingView {}

impl MappingView {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr().cast_const()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The mapping must still be live and readable for the given range, and
    /// no concurrent writer may touch it for the borrow's duration.
    pub unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len);
        slice::from_raw_parts(self.as_ptr().add(range.start), range.end - range.start)
    }

    /// # Safety
    ///
    /// The mapping must still be live and writable for the given range, and
    /// this must be the only access to it for the borrow's duration.
    pub unsafe fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len);
        slice::from_raw_parts_mut(self.as_mut_ptr().add(range.start), range.end - range.start)
    }

    /// Narrows this view to `range`, like slicing.
    ///
    /// The result aliases the same mapping. Narrowing the tail end shrinks
    /// the recorded extent with it, so no sub-view ever passes the
    /// full-extent check in [`MappingRegistry::unmap`].
    pub fn subview(&self, range: Range<usize>) -> MappingView {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len);
        MappingView {
            // In-bounds offset from a mapping base stays non-null.
            base: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(range.start)) },
            len: range.end - range.start,
            cap: self.cap - range.start,
        }
    }

    /// The identity key: the address of the region's last byte.
    fn key(&self) -> usize {
        self.base.as_ptr() as usize + self.len - 1
    }
}

impl fmt::Debug for MappingView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingView")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

struct MappingRecord {
    base: NonNull<u8>,
    len: usize,
}

// Records only describe mappings, they never dereference them.
unsafe impl Send for MappingRecord {}

/// Process-wide bookkeeping of live OS mappings.
///
/// Generic over the [`RawMem`] capability so the bookkeeping can be driven
/// by a fake in tests; production code uses [`mapper`] or constructs one
/// over [`HostMem`].
pub struct MappingRegistry<M> {
    mem: M,
    active: Mutex<hashbrown::HashMap<usize, MappingRecord>>,
}

impl<M: RawMem> MappingRegistry<M> {
    pub fn new(mem: M) -> Self {
        Self {
            mem,
            active: Mutex::new(hashbrown::HashMap::new()),
        }
    }

    /// Maps `len` bytes at an OS-chosen address and registers the region.
    ///
    /// `prot`, `flags`, `fd` and `offset` pass through to the OS unchanged;
    /// a negative `fd` requests the anonymous zero-filled source.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for `len == 0` (no syscall is issued), or
    /// the OS error verbatim, in which case nothing was registered.
    pub fn map(
        &self,
        fd: RawFd,
        offset: u64,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<MappingView, Error> {
        if len == 0 {
            return Err(Error::InvalidArgument);
        }

        let base = unsafe { self.mem.raw_map(len, prot, flags, fd, offset)? };

        // Two in-flight maps touch disjoint OS addresses, so the raw call
        // stays outside the lock; only the insert needs it.
        let key = base.as_ptr() as usize + len - 1;
        self.active.lock().insert(key, MappingRecord { base, len });

        tracing::trace!(?base, len, "registered mapping");
        Ok(MappingView {
            base,
            len,
            cap: len,
        })
    }

    /// Releases the mapping described by `view` and drops its record.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the view is empty, narrowed below its
    /// full extent, or not registered; no syscall is issued in those cases.
    /// An OS failure is returned verbatim and leaves the record in place,
    /// so retrying the same unmap later is safe.
    ///
    /// # Safety
    ///
    /// On success every view into the region dangles; the caller must not
    /// use `view` (or any sub-view of it) again.
    pub unsafe fn unmap(&self, view: &MappingView) -> Result<(), Error> {
        if view.len == 0 || view.len != view.cap {
            return Err(Error::InvalidArgument);
        }

        // The lock is held across the raw unmap on purpose: a racing `map`
        // that is handed the freed range by the OS must not re-register it
        // before this entry is gone.
        let mut active = self.active.lock();

        let Some(record) = active.get(&view.key()) else {
            return Err(Error::InvalidArgument);
        };
        if record.base != view.base {
            // Key collision with unrelated data. The caller sees the
            // precondition error, but this firing at all means something
            // upstream handed us corrupted view metadata.
            tracing::warn!(key = view.key(), "mapping record disagrees with caller view");
            return Err(Error::InvalidArgument);
        }

        // Unmap the record's stored extent, not the caller's metadata.
        let (base, len) = (record.base, record.len);
        self.mem.raw_unmap(base, len)?;

        active.remove(&view.key());
        tracing::trace!(?base, len, "released mapping");
        Ok(())
    }

    /// Number of live registered mappings.
    pub fn active_mappings(&self) -> usize {
        self.active.lock().len()
    }
}

static MAPPER: spin::Once<MappingRegistry<HostMem>> = spin::Once::new();

/// The process-wide registry over the host OS.
pub fn mapper() -> &'static MappingRegistry<HostMem> {
    MAPPER.call_once(|| MappingRegistry::new(HostMem))
}

/// [`MappingRegistry::map`] on the process-wide registry.
///
/// # Errors
///
/// See [`MappingRegistry::map`].
pub fn mmap(
    fd: RawFd,
    offset: u64,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
) -> Result<MappingView, Error> {
    mapper().map(fd, offset, len, prot, flags)
}

/// [`MappingRegistry::unmap`] on the process-wide registry.
///
/// # Errors
///
/// See [`MappingRegistry::unmap`].
///
/// # Safety
///
/// See [`MappingRegistry::unmap`].
pub unsafe fn munmap(view: &MappingView) -> Result<(), Error> {
    mapper().unmap(view)
}
