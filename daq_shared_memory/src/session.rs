//! Boundary towards protocol front ends.

use daq::timestamp::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One delivered value: `samples` consecutive samples of `signal`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalValue<'a> {
    /// Signal index
    pub signal: usize,
    /// Samples contained in `bytes`
    pub samples: usize,
    /// `samples * byte_size` raw bytes, oldest sample first
    pub bytes: &'a [u8],
}

/// Consumer of decoded frames. Owns all wire encoding.
///
/// Called from the session's own thread by its `SubscriptionManager`;
/// never from the real-time thread.
pub trait Session {
    /// Transmitted set of `task_id` changed (or was replayed on attach).
    fn new_signal_list(&mut self, task_id: usize, signals: &[u32]);

    /// Values that became due in data frame `seq` of `task_id`.
    fn new_signal_data(
        &mut self,
        task_id: usize,
        seq: u32,
        timestamp: Timestamp,
        values: &[SignalValue<'_>],
    );
}
