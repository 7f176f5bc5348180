//! Seqlock guarding the arena snapshot.

use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Version counter using even/odd optimistic versioning (a seqlock).
///
/// The single writer moves the version to odd before it modifies the guarded
/// bytes and back to even afterwards. Readers copy the guarded bytes and
/// accept the copy only if the version was even and unchanged around it.
///
/// Lives inside the arena, hence `repr(transparent)`.
#[derive(Debug)]
#[repr(transparent)]
pub struct VersionCounter {
    counter: AtomicU64,
}

impl VersionCounter {
    /// Counter at version 0.
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Current version (acquire).
    #[inline]
    pub fn load(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Enter the write section: version becomes odd.
    ///
    /// Writer side only. The release fence keeps the guarded stores that
    /// follow from becoming visible before the odd version.
    #[inline]
    pub fn begin_write(&self) -> u64 {
        let next = self.counter.load(Ordering::Relaxed).wrapping_add(1);
        self.counter.store(next, Ordering::Relaxed);
        fence(Ordering::Release);
        next
    }

    /// Leave the write section: version becomes even again.
    #[inline]
    pub fn end_write(&self) -> u64 {
        let next = self.counter.load(Ordering::Relaxed).wrapping_add(1);
        self.counter.store(next, Ordering::Release);
        next
    }

    /// Run `read` under the seqlock, retrying up to `retries` times.
    ///
    /// Returns `None` when every attempt raced with the writer; the caller
    /// tries again on its next poll.
    pub fn read_consistent<T>(&self, retries: usize, mut read: impl FnMut() -> T) -> Option<T> {
        for _attempt in 0..retries.max(1) {
            let before = self.load();
            if !Self::is_stable(before) {
                std::thread::yield_now();
                continue;
            }

            let value = read();

            fence(Ordering::Acquire);
            let after = self.counter.load(Ordering::Relaxed);
            if before == after {
                return Some(value);
            }

            std::thread::yield_now();
        }
        None
    }

    /// No write in progress at `version`.
    #[inline]
    pub fn is_stable(version: u64) -> bool {
        version % 2 == 0
    }

    /// A write was in progress at `version`.
    #[inline]
    pub fn is_writing(version: u64) -> bool {
        version % 2 == 1
    }
}

impl Default for VersionCounter {
    fn default() -> Self {
        Self::new()
    }
}
