//! Per-task subscription mailbox.
//!
//! A bounded ring of packed instructions living in the arena. Sessions are the
//! producers (serialized by the task's control mutex), the real-time thread
//! is the single consumer. A slot holding [`InstructionKind::Clear`] is free.
//! The real-time side never waits: it applies what is there and stops at the
//! first free slot. A session that finds the next slot occupied sleeps and
//! retries within its [`RetryPolicy`].

use daq::config::MailboxConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Instruction kind stored in the upper half of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InstructionKind {
    /// Free slot
    Clear = 0,
    /// Add a signal to the transmitted set
    Insert = 1,
    /// Remove a signal from the transmitted set
    Remove = 2,
}

/// One mailbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// What to do
    pub kind: InstructionKind,
    /// Global signal index
    pub signal: u32,
}

impl Instruction {
    /// Insert `signal`.
    pub const fn insert(signal: u32) -> Self {
        Self {
            kind: InstructionKind::Insert,
            signal,
        }
    }

    /// Remove `signal`.
    pub const fn remove(signal: u32) -> Self {
        Self {
            kind: InstructionKind::Remove,
            signal,
        }
    }

    #[inline]
    fn encode(self) -> u64 {
        ((self.kind as u64) << 32) | self.signal as u64
    }

    #[inline]
    fn decode(raw: u64) -> Option<Self> {
        let kind = match (raw >> 32) as u32 {
            1 => InstructionKind::Insert,
            2 => InstructionKind::Remove,
            _ => return None,
        };
        Some(Self {
            kind,
            signal: raw as u32,
        })
    }
}

const CLEAR: u64 = 0;

/// Sleep/attempt budget of a blocked sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between attempts
    pub interval: Duration,
    /// Attempts including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// A single attempt, never sleeps.
    pub const NO_WAIT: Self = Self {
        interval: Duration::ZERO,
        max_attempts: 1,
    };

    /// Total time the policy may wait.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&MailboxConfig::default())
    }
}

impl From<&MailboxConfig> for RetryPolicy {
    fn from(cfg: &MailboxConfig) -> Self {
        Self {
            interval: cfg.retry_interval(),
            max_attempts: cfg.max_attempts.max(1),
        }
    }
}

/// Session-side end. Only one may exist per mailbox.
#[derive(Debug, Default)]
pub struct MailboxWriter {
    tail: usize,
}

impl MailboxWriter {
    /// Writer at slot 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue without waiting. Returns `false` if the next slot is taken.
    pub fn try_send(&mut self, slots: &[AtomicU64], instruction: Instruction) -> bool {
        let slot = &slots[self.tail];
        if slot.load(Ordering::Acquire) != CLEAR {
            return false;
        }
        slot.store(instruction.encode(), Ordering::Release);
        self.tail = (self.tail + 1) % slots.len();
        true
    }

    /// Enqueue, sleeping between attempts. Returns the attempts used, or
    /// `None` when the budget ran out.
    pub fn send_timeout(
        &mut self,
        slots: &[AtomicU64],
        instruction: Instruction,
        policy: &RetryPolicy,
    ) -> Option<u32> {
        for attempt in 1..=policy.max_attempts.max(1) {
            if self.try_send(slots, instruction) {
                return Some(attempt);
            }
            if attempt < policy.max_attempts {
                std::thread::sleep(policy.interval);
            }
        }
        None
    }
}

/// Real-time end.
#[derive(Debug, Default)]
pub struct MailboxReader {
    head: usize,
}

impl MailboxReader {
    /// Reader at slot 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the head instruction and free its slot. Never waits.
    ///
    /// Returns `None` at the first free slot.
    #[inline]
    pub fn try_apply(&mut self, slots: &[AtomicU64]) -> Option<Option<Instruction>> {
        let slot = &slots[self.head];
        let raw = slot.load(Ordering::Acquire);
        if raw == CLEAR {
            return None;
        }
        slot.store(CLEAR, Ordering::Release);
        self.head = (self.head + 1) % slots.len();
        // Inner None: unknown kind, slot freed and skipped.
        Some(Instruction::decode(raw))
    }

    /// Apply every pending instruction, at most one lap of the ring.
    pub fn drain(&mut self, slots: &[AtomicU64], mut apply: impl FnMut(Instruction)) -> usize {
        let mut taken = 0;
        while taken < slots.len() {
            match self.try_apply(slots) {
                None => break,
                Some(entry) => {
                    taken += 1;
                    if let Some(instruction) = entry {
                        apply(instruction);
                    }
                }
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(n: usize) -> Vec<AtomicU64> {
        (0..n).map(|_| AtomicU64::new(CLEAR)).collect()
    }

    #[test]
    fn test_fifo_order() {
        let slots = slots(4);
        let mut tx = MailboxWriter::new();
        let mut rx = MailboxReader::new();

        assert!(tx.try_send(&slots, Instruction::insert(3)));
        assert!(tx.try_send(&slots, Instruction::remove(3)));
        assert!(tx.try_send(&slots, Instruction::insert(0)));

        let mut seen = Vec::new();
        assert_eq!(rx.drain(&slots, |i| seen.push(i)), 3);
        assert_eq!(
            seen,
            vec![
                Instruction::insert(3),
                Instruction::remove(3),
                Instruction::insert(0)
            ]
        );
        assert!(slots.iter().all(|s| s.load(Ordering::Relaxed) == CLEAR));
    }

    #[test]
    fn test_full_mailbox_rejects() {
        let slots = slots(2);
        let mut tx = MailboxWriter::new();
        assert!(tx.try_send(&slots, Instruction::insert(1)));
        assert!(tx.try_send(&slots, Instruction::insert(2)));
        assert!(!tx.try_send(&slots, Instruction::insert(3)));

        let policy = RetryPolicy {
            interval: Duration::from_micros(10),
            max_attempts: 3,
        };
        assert_eq!(tx.send_timeout(&slots, Instruction::insert(3), &policy), None);

        let mut rx = MailboxReader::new();
        assert_eq!(rx.try_apply(&slots), Some(Some(Instruction::insert(1))));
        assert_eq!(tx.send_timeout(&slots, Instruction::insert(3), &policy), Some(1));
    }

    #[test]
    fn test_wraps_around() {
        let slots = slots(3);
        let mut tx = MailboxWriter::new();
        let mut rx = MailboxReader::new();
        for round in 0..10u32 {
            assert!(tx.try_send(&slots, Instruction::insert(round)));
            assert!(tx.try_send(&slots, Instruction::remove(round)));
            let mut n = 0;
            rx.drain(&slots, |_| n += 1);
            assert_eq!(n, 2);
        }
    }

    #[test]
    fn test_drain_is_bounded() {
        let slots = slots(3);
        for s in &slots {
            s.store(Instruction::insert(7).encode(), Ordering::Relaxed);
        }
        let mut rx = MailboxReader::new();
        assert_eq!(rx.drain(&slots, |_| {}), 3);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let cfg = MailboxConfig {
            retry_interval_us: 250,
            max_attempts: 0,
        };
        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.interval, Duration::from_micros(250));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.budget(), Duration::ZERO);
    }
}
