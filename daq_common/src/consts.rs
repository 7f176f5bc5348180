//! Transport constants.
//!
//! These constants define the fundamental parameters of the acquisition
//! transport. They are the single source of truth - all other crates should
//! import from here.

use static_assertions::const_assert;
use std::time::Duration;

/// Minimum arena size in bytes.
///
/// Set to 4KB (one memory page). Arenas are rounded up to a whole number of
/// pages before they are mapped.
pub const ARENA_MIN_SIZE: usize = 4096;

/// Maximum arena size in bytes.
///
/// Set to 1GB as a reasonable upper limit to prevent excessive memory usage.
pub const ARENA_MAX_SIZE: usize = 1_073_741_824; // 1GB

/// CPU cache line size in bytes.
///
/// Used for aligning arena sections to prevent false sharing between the
/// real-time writer and the session readers.
pub const CACHE_LINE_SIZE: usize = 64;

/// Alignment of every frame inside the frame ring.
///
/// Matches the widest primitive (8 bytes) so that value bytes of the widest
/// width class start naturally aligned.
pub const FRAME_ALIGN: usize = 8;

/// Minimum number of data frames a ring must hold.
///
/// Below three the producer would overwrite the frame it is about to link.
pub const MIN_RING_FRAMES: usize = 3;

/// Default seconds of history a frame ring keeps.
pub const DEFAULT_BUFFER_SECONDS: f64 = 2.0;

/// Default session poll interval (100 ms).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default sleep between mailbox enqueue attempts when the mailbox is full.
pub const DEFAULT_MAILBOX_RETRY_INTERVAL: Duration = Duration::from_micros(500);

/// Default number of mailbox enqueue attempts before giving up.
pub const DEFAULT_MAILBOX_MAX_ATTEMPTS: u32 = 200;

/// Bounded retries of a seqlock read before the reader gives up for this poll.
pub const SNAPSHOT_READ_RETRIES: usize = 10;

const_assert!(ARENA_MIN_SIZE.is_power_of_two());
const_assert!(CACHE_LINE_SIZE.is_power_of_two());
const_assert!(FRAME_ALIGN.is_power_of_two() && FRAME_ALIGN <= CACHE_LINE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_min_size_is_page_size() {
        assert_eq!(ARENA_MIN_SIZE, 4096);
    }

    #[test]
    fn test_size_constraints() {
        assert!(ARENA_MIN_SIZE < ARENA_MAX_SIZE);
        assert_eq!(ARENA_MIN_SIZE % CACHE_LINE_SIZE, 0);
        assert_eq!(CACHE_LINE_SIZE % FRAME_ALIGN, 0);
    }

    #[test]
    fn test_defaults_are_positive() {
        assert!(DEFAULT_BUFFER_SECONDS > 0.0);
        assert!(DEFAULT_MAILBOX_MAX_ATTEMPTS > 0);
        assert!(MIN_RING_FRAMES >= 3);
    }
}
