//! Spinlocks that live inside shared memory.
//!
//! Both are plain atomics so they work across processes and are valid when
//! zero-initialized. Neither parks a thread in the kernel, so a process
//! that dies mid-section can't leave others blocked in a wait they never
//! return from. Critical sections are a handful of loads and stores.

use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

/// Test-and-set spinlock guarding the tend-master takeover sequence.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .state
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.state.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

const WRITER: u32 = 1 << 31;

/// Single-writer, multi-reader spinlock guarding one shared node record.
///
/// The high bit marks the writer; the low bits count readers. A writer
/// first claims the bit, then waits for readers to drain, so a steady
/// stream of readers can't starve it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SwLock {
    state: AtomicU32,
}

impl SwLock {
    pub fn read(&self) -> SwReadGuard<'_> {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return SwReadGuard { lock: self };
            }
            hint::spin_loop();
        }
    }

    pub fn write(&self) -> SwWriteGuard<'_> {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur | WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            hint::spin_loop();
        }
        while self.state.load(Ordering::Acquire) != WRITER {
            hint::spin_loop();
        }
        SwWriteGuard { lock: self }
    }
}

pub struct SwReadGuard<'a> {
    lock: &'a SwLock,
}

impl Drop for SwReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct SwWriteGuard<'a> {
    lock: &'a SwLock,
}

impl Drop for SwWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}
