//! Backing memory for the shared topology.
//!
//! Production uses a System V segment keyed by an integer so unrelated
//! processes can find it. Tests use a zeroed heap region shared through an
//! `Arc`, which behaves the same way from the topology's point of view.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::ShmError;

/// Heap stand-in for a shared segment. The first `Segment::heap` call on a
/// region creates it, later calls attach.
pub struct HeapRegion {
    words: Box<[AtomicU64]>,
    claimed: AtomicBool,
}

impl HeapRegion {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            words: (0..size.div_ceil(8)).map(|_| AtomicU64::new(0)).collect(),
            claimed: AtomicBool::new(false),
        })
    }

    fn len(&self) -> usize {
        self.words.len() * 8
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

enum Backing {
    SysV { id: i32, remove_on_drop: bool },
    Heap(Arc<HeapRegion>),
}

/// An attached region of memory.
pub struct Segment {
    base: *mut u8,
    len: usize,
    created: bool,
    backing: Backing,
}

// SAFETY: the region is only accessed through atomics and lock-guarded
// cells laid over it, never through plain references to its bytes.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::SysV { id, .. } => format!("sysv:{id}"),
            Backing::Heap(_) => "heap".to_string(),
        };
        f.debug_struct("Segment")
            .field("kind", &kind)
            .field("len", &self.len)
            .field("created", &self.created)
            .finish()
    }
}

impl Segment {
    /// Creates the System V segment for `key`, or attaches to an existing
    /// one. An existing segment smaller than `size` is refused.
    pub fn sysv(key: i32, size: usize, remove_on_drop: bool) -> Result<Self, ShmError> {
        // SAFETY: plain syscalls; every return value is checked.
        let mut id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o666) };
        let created = id >= 0;

        if !created {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(ShmError::Create {
                    key,
                    hint: create_hint(&err),
                    source: err,
                });
            }
            id = unsafe { libc::shmget(key, 0, 0o666) };
            if id < 0 {
                return Err(ShmError::Attach {
                    key,
                    source: io::Error::last_os_error(),
                });
            }
            let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
            if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } < 0 {
                return Err(ShmError::Attach {
                    key,
                    source: io::Error::last_os_error(),
                });
            }
            if ds.shm_segsz < size {
                return Err(ShmError::SegmentTooSmall {
                    expected: size,
                    found: ds.shm_segsz,
                });
            }
        }

        let base = unsafe { libc::shmat(id, ptr::null(), 0) };
        if base as isize == -1 {
            let source = io::Error::last_os_error();
            if created {
                unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            }
            return Err(ShmError::Attach { key, source });
        }

        debug!(key, id, size, created, "attached shared memory segment");
        Ok(Self {
            base: base.cast(),
            len: size,
            created,
            backing: Backing::SysV { id, remove_on_drop },
        })
    }

    /// Attaches to a heap region.
    pub fn heap(region: &Arc<HeapRegion>, size: usize) -> Result<Self, ShmError> {
        if region.len() < size {
            return Err(ShmError::SegmentTooSmall {
                expected: size,
                found: region.len(),
            });
        }
        let created = !region.claimed.swap(true, Ordering::AcqRel);
        Ok(Self {
            base: region.words.as_ptr() as *mut u8,
            len: size,
            created,
            backing: Backing::Heap(Arc::clone(region)),
        })
    }

    /// True for the process that created the memory.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reinterprets the bytes at `offset` as a `T`.
    ///
    /// # Safety
    ///
    /// `T` must be valid when zeroed, safe to share between threads, and
    /// `offset + size_of::<T>()` must lie within the segment at an offset
    /// aligned for `T`.
    pub unsafe fn at<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(offset % std::mem::align_of::<T>(), 0);
        &*self.base.add(offset).cast::<T>()
    }

    /// Reinterprets `len` consecutive `T`s starting at `offset`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Segment::at`], for the whole slice.
    pub unsafe fn slice_at<T>(&self, offset: usize, len: usize) -> &[T] {
        debug_assert!(offset + len * std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(offset % std::mem::align_of::<T>(), 0);
        std::slice::from_raw_parts(self.base.add(offset).cast::<T>(), len)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Backing::SysV { id, remove_on_drop } = self.backing {
            unsafe {
                libc::shmdt(self.base.cast());
                if remove_on_drop {
                    libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
                }
            }
        }
    }
}

fn create_hint(err: &io::Error) -> &'static str {
    match err.raw_os_error() {
        Some(libc::EINVAL) => "size exceeds kernel.shmmax",
        Some(libc::ENOMEM) | Some(libc::ENOSPC) => "raise kernel.shmall or kernel.shmmni",
        Some(libc::EACCES) | Some(libc::EPERM) => "segment exists with other permissions",
        _ => "",
    }
}
