//! Per-task producer and its subscription control.
//!
//! [`create_task`] maps the task's arena and splits it into two halves:
//!
//! - [`TaskScheduler`]: owned by the real-time thread. `tick()` drains the
//!   mailbox, emits a `SignalList` frame when the transmitted set changed and
//!   a `SignalData` frame with the live values. No allocation, no locks, no
//!   waiting.
//! - [`TaskControl`]: cloneable session-side handle. Keeps the per-session
//!   interest and the per-signal reference counts under a mutex the
//!   real-time thread never touches, and turns first-interest/last-interest
//!   transitions into mailbox instructions.

use crate::arena::{Arena, ArenaLayout, DATA_HEADER_SIZE};
use crate::error::{SetupResult, SubscriptionError};
use crate::image::ProcessImage;
use crate::mailbox::{Instruction, InstructionKind, MailboxReader, MailboxWriter, RetryPolicy};
use crate::platform::ArenaMemoryConfig;
use crate::receiver::ReceiverCursor;
use crate::registry::VariableRegistry;
use crate::ring::{self, FrameKind, RingWriter};
use crate::session::SessionId;
use daq::config::ServerConfig;
use daq::timestamp::Timestamp;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const NO_SLOT: u32 = u32::MAX;

/// Setup parameters of one task.
#[derive(Debug, Clone)]
pub struct TaskSetup {
    /// Task id (index into the decimation table)
    pub task_id: usize,
    /// Seconds per task tick
    pub sample_time: f64,
    /// Seconds of history kept in the ring
    pub buffer_seconds: f64,
    /// Exact ring depth in full data frames, overriding the timing
    pub ring_frames: Option<usize>,
    /// Arena mapping options
    pub memory: ArenaMemoryConfig,
    /// Mailbox retry budget of session-side senders
    pub retry: RetryPolicy,
}

impl TaskSetup {
    /// Defaults for a task running every `sample_time` seconds.
    pub fn new(task_id: usize, sample_time: f64) -> Self {
        Self {
            task_id,
            sample_time,
            buffer_seconds: daq::consts::DEFAULT_BUFFER_SECONDS,
            ring_frames: None,
            memory: ArenaMemoryConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Setup of task `task_id` from the server configuration.
    pub fn from_config(config: &ServerConfig, task_id: usize) -> Option<Self> {
        let acq = &config.acquisition;
        Some(Self {
            task_id,
            sample_time: acq.sample_time(task_id)?,
            buffer_seconds: acq.buffer_seconds,
            ring_frames: None,
            memory: ArenaMemoryConfig {
                populate: true,
                locked: acq.lock_memory,
            },
            retry: RetryPolicy::from(&config.mailbox),
        })
    }

    /// Size the ring for exactly `frames` data frames.
    pub fn with_ring_frames(mut self, frames: usize) -> Self {
        self.ring_frames = Some(frames);
        self
    }
}

/// Map the arena of one task and return its real-time and session halves.
///
/// Fails before any real-time operation if the arena cannot be planned or
/// mapped.
pub fn create_task(
    registry: &Arc<VariableRegistry>,
    setup: &TaskSetup,
) -> SetupResult<(TaskScheduler, TaskControl)> {
    let task_id = setup.task_id;
    if task_id >= registry.task_count() {
        return Err(crate::error::SetupError::UnknownTask {
            path: format!("task {task_id}"),
            task_id,
        });
    }

    // Canonical order: width class 8/4/2/1, ascending index within a class.
    let mut local: Vec<LocalSignal> = registry
        .signals_of_task(task_id)
        .map(|s| LocalSignal {
            index: s.index as u32,
            width: s.info.layout.element_width(),
            offset: s.info.offset,
            size: s.info.layout.byte_size(),
        })
        .collect();
    local.sort_by_key(|l| (Reverse(l.width), l.index));

    let signal_bytes: usize = local.iter().map(|l| l.size).sum();
    let layout = match setup.ring_frames {
        Some(frames) => ArenaLayout::plan(local.len(), signal_bytes, frames),
        None => ArenaLayout::for_task(
            task_id,
            local.len(),
            signal_bytes,
            setup.sample_time,
            setup.buffer_seconds,
        ),
    }
    .inspect_err(|e| tracing::error!(task_id, "arena planning failed: {e}"))?;

    let arena = Arc::new(
        Arena::create(task_id, layout, &setup.memory)
            .inspect_err(|e| tracing::error!(task_id, "arena allocation failed: {e}"))?,
    );

    let mut slot_of = vec![NO_SLOT; registry.signals().len()];
    for (slot, l) in local.iter().enumerate() {
        slot_of[l.index as usize] = slot as u32;
    }
    let image_needed = local.iter().map(|l| l.offset + l.size).max().unwrap_or(0);

    tracing::info!(
        task_id,
        signals = local.len(),
        sample_time = setup.sample_time,
        ring_bytes = layout.ring_capacity,
        "task arena ready"
    );

    let n = local.len();
    let scheduler = TaskScheduler {
        task_id,
        arena: Arc::clone(&arena),
        mailbox: MailboxReader::new(),
        ring: RingWriter::new(),
        members: vec![false; n],
        local,
        slot_of,
        list: Vec::with_capacity(n),
        scratch: Vec::with_capacity(n),
        value_bytes: 0,
        image_needed,
        seq: 0,
        stats: TaskStats::default(),
    };

    let control = TaskControl {
        inner: Arc::new(ControlInner {
            task_id,
            sample_time: setup.sample_time,
            arena,
            registry: Arc::clone(registry),
            retry: setup.retry,
            state: Mutex::new(ControlState::default()),
        }),
    };

    Ok((scheduler, control))
}

#[derive(Debug, Clone, Copy)]
struct LocalSignal {
    index: u32,
    width: usize,
    offset: usize,
    size: usize,
}

/// Counters of one task, updated by `tick()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Calls to `tick()`
    pub ticks: u64,
    /// Insert instructions applied
    pub inserts: u64,
    /// Remove instructions applied
    pub removes: u64,
    /// Instructions naming a signal of another task
    pub rejected: u64,
    /// `SignalList` frames written
    pub list_frames: u64,
    /// `SignalData` frames written
    pub data_frames: u64,
    /// Ring laps
    pub wraps: u64,
}

/// Real-time half of a task.
pub struct TaskScheduler {
    task_id: usize,
    arena: Arc<Arena>,
    mailbox: MailboxReader,
    ring: RingWriter,
    /// Task signals in canonical order
    local: Vec<LocalSignal>,
    /// Global signal index -> position in `local`
    slot_of: Vec<u32>,
    /// Transmitted flag per `local` entry
    members: Vec<bool>,
    /// Transmitted set in canonical order
    list: Vec<u32>,
    scratch: Vec<u32>,
    value_bytes: usize,
    image_needed: usize,
    seq: u32,
    stats: TaskStats,
}

impl TaskScheduler {
    /// Task id.
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// Current transmitted set in canonical order.
    pub fn transmitted_signals(&self) -> &[u32] {
        &self.list
    }

    /// Counters.
    pub fn stats(&self) -> TaskStats {
        self.stats
    }

    /// The task's arena.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// One task cycle. Call from the real-time thread.
    ///
    /// Applies pending subscription changes, announces a changed transmitted
    /// set and copies the transmitted values out of `image`. A missing
    /// timestamp is written as zero.
    pub fn tick(&mut self, image: &ProcessImage, timestamp: Option<Timestamp>) {
        debug_assert!(image.len() >= self.image_needed);
        self.stats.ticks += 1;

        let dirty = self.drain_mailbox() > 0;
        let list_pos = if dirty && self.rebuild_list() {
            Some(self.write_list())
        } else {
            None
        };

        let data_pos = if self.list.is_empty() {
            None
        } else {
            Some(self.write_data(image, timestamp.unwrap_or(Timestamp::ZERO)))
        };

        if let Some(head) = data_pos.or(list_pos) {
            let list = list_pos.map(|_| self.list.as_slice());
            self.arena
                .publish_snapshot(head, list_pos, list, self.seq.wrapping_sub(1));
        }
        self.stats.wraps = self.ring.wraps();
    }

    fn drain_mailbox(&mut self) -> usize {
        let Self {
            arena,
            mailbox,
            slot_of,
            members,
            stats,
            ..
        } = self;

        mailbox.drain(arena.mailbox_slots(), |instruction| {
            let slot = slot_of
                .get(instruction.signal as usize)
                .copied()
                .unwrap_or(NO_SLOT);
            if slot == NO_SLOT {
                stats.rejected += 1;
                return;
            }
            match instruction.kind {
                InstructionKind::Insert => {
                    members[slot as usize] = true;
                    stats.inserts += 1;
                }
                InstructionKind::Remove => {
                    members[slot as usize] = false;
                    stats.removes += 1;
                }
                InstructionKind::Clear => {}
            }
        })
    }

    /// Rebuild the canonical list; `true` if it differs from the current one.
    fn rebuild_list(&mut self) -> bool {
        self.scratch.clear();
        let mut value_bytes = 0;
        for (l, _) in self.local.iter().zip(&self.members).filter(|(_, m)| **m) {
            self.scratch.push(l.index);
            value_bytes += l.size;
        }
        if self.scratch == self.list {
            return false;
        }
        std::mem::swap(&mut self.list, &mut self.scratch);
        self.value_bytes = value_bytes;
        true
    }

    fn write_list(&mut self) -> u64 {
        let list = &self.list;
        let pos = self.ring.append(
            &self.arena,
            FrameKind::SignalList,
            ring::list_payload_len(list.len()),
            |payload| ring::encode_list(payload, list),
        );
        self.stats.list_frames += 1;
        pos
    }

    fn write_data(&mut self, image: &ProcessImage, timestamp: Timestamp) -> u64 {
        let seq = self.seq;
        let value_bytes = self.value_bytes;
        let Self {
            arena,
            ring,
            list,
            local,
            slot_of,
            ..
        } = self;
        let bytes = image.bytes();

        let pos = ring.append(
            arena,
            FrameKind::SignalData,
            ring::data_payload_len(value_bytes),
            |payload| {
                ring::encode_data_header(payload, seq, timestamp);
                let mut at = DATA_HEADER_SIZE;
                for &index in list.iter() {
                    let l = &local[slot_of[index as usize] as usize];
                    payload[at..at + l.size].copy_from_slice(&bytes[l.offset..l.offset + l.size]);
                    at += l.size;
                }
            },
        );

        self.seq = seq.wrapping_add(1);
        self.stats.data_frames += 1;
        pos
    }
}

#[derive(Debug, Default)]
struct ControlState {
    mailbox: MailboxWriter,
    /// Interested sessions per signal
    refcount: HashMap<u32, usize>,
    /// Signals per session
    interest: HashMap<SessionId, BTreeSet<u32>>,
}

struct ControlInner {
    task_id: usize,
    sample_time: f64,
    arena: Arc<Arena>,
    registry: Arc<VariableRegistry>,
    retry: RetryPolicy,
    state: Mutex<ControlState>,
}

/// Session-side handle of a task. Cheap to clone.
#[derive(Clone)]
pub struct TaskControl {
    inner: Arc<ControlInner>,
}

impl TaskControl {
    /// Task id.
    pub fn task_id(&self) -> usize {
        self.inner.task_id
    }

    /// Seconds per task tick.
    pub fn sample_time(&self) -> f64 {
        self.inner.sample_time
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<VariableRegistry> {
        &self.inner.registry
    }

    /// New cursor positioned at the newest frame.
    pub fn attach(&self) -> ReceiverCursor {
        ReceiverCursor::attach(
            self.inner.task_id,
            Arc::clone(&self.inner.arena),
            Arc::clone(&self.inner.registry),
        )
    }

    fn check_signal(&self, signal: usize) -> Result<u32, SubscriptionError> {
        let s = self
            .inner
            .registry
            .signal(signal)
            .ok_or(SubscriptionError::UnknownSignal { signal })?;
        if s.task_id != self.inner.task_id {
            return Err(SubscriptionError::TaskNotServed {
                signal,
                task_id: s.task_id,
            });
        }
        Ok(signal as u32)
    }

    fn send(
        &self,
        mailbox: &mut MailboxWriter,
        instruction: Instruction,
        retry: &RetryPolicy,
    ) -> Result<(), SubscriptionError> {
        let task_id = self.inner.task_id;
        match mailbox.send_timeout(self.inner.arena.mailbox_slots(), instruction, retry) {
            Some(1) => Ok(()),
            Some(attempts) => {
                tracing::warn!(task_id, attempts, "mailbox was full, instruction delayed");
                Ok(())
            }
            None => {
                tracing::warn!(
                    task_id,
                    signal = instruction.signal,
                    budget_ms = retry.budget().as_millis() as u64,
                    "mailbox full, subscription change dropped"
                );
                Err(SubscriptionError::MailboxFull { task_id })
            }
        }
    }

    /// Add `signals` to the interest of `session`.
    ///
    /// The first interested session makes the signal transmitted. On
    /// `MailboxFull` the signals before the failing one stay subscribed.
    pub fn subscribe(&self, session: SessionId, signals: &[usize]) -> Result<(), SubscriptionError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let result = signals
            .iter()
            .try_for_each(|&signal| self.acquire(state, session, signal));
        if state.interest.get(&session).is_some_and(BTreeSet::is_empty) {
            state.interest.remove(&session);
        }
        result
    }

    fn acquire(&self, state: &mut ControlState, session: SessionId, signal: usize) -> Result<(), SubscriptionError> {
        let index = self.check_signal(signal)?;
        if !state.interest.entry(session).or_default().insert(index) {
            return Ok(());
        }
        let count = state.refcount.entry(index).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Err(e) = self.send(&mut state.mailbox, Instruction::insert(index), &self.inner.retry) {
                state.refcount.remove(&index);
                if let Some(set) = state.interest.get_mut(&session) {
                    set.remove(&index);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop `signals` from the interest of `session`.
    ///
    /// The last interested session makes the signal stop being transmitted.
    pub fn unsubscribe(&self, session: SessionId, signals: &[usize]) -> Result<(), SubscriptionError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        for &signal in signals {
            let index = self.check_signal(signal)?;
            self.release(state, session, index, &self.inner.retry)?;
        }
        if state.interest.get(&session).is_some_and(BTreeSet::is_empty) {
            state.interest.remove(&session);
        }
        Ok(())
    }

    /// Drop every signal of `session`. Keeps going after a failure and
    /// returns the first error.
    pub fn unsubscribe_all(&self, session: SessionId) -> Result<(), SubscriptionError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let signals: Vec<u32> = state
            .interest
            .get(&session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut first_err = None;
        for index in signals {
            if let Err(e) = self.release(state, session, index, &self.inner.retry) {
                first_err.get_or_insert(e);
            }
        }
        if state.interest.get(&session).is_some_and(BTreeSet::is_empty) {
            state.interest.remove(&session);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drop every signal of a departing session without waiting on a full
    /// mailbox. Returns the signals that stay transmitted because their
    /// removal could not be enqueued.
    pub fn disconnect(&self, session: SessionId) -> Vec<usize> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let signals: Vec<u32> = state
            .interest
            .get(&session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let kept: Vec<usize> = signals
            .into_iter()
            .filter(|&index| self.release(state, session, index, &RetryPolicy::NO_WAIT).is_err())
            .map(|index| index as usize)
            .collect();
        if state.interest.get(&session).is_some_and(BTreeSet::is_empty) {
            state.interest.remove(&session);
        }
        kept
    }

    fn release(
        &self,
        state: &mut ControlState,
        session: SessionId,
        index: u32,
        retry: &RetryPolicy,
    ) -> Result<(), SubscriptionError> {
        let Some(set) = state.interest.get_mut(&session) else {
            return Ok(());
        };
        if !set.remove(&index) {
            return Ok(());
        }
        let count = state.refcount.entry(index).or_insert(1);
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        state.refcount.remove(&index);
        if let Err(e) = self.send(&mut state.mailbox, Instruction::remove(index), retry) {
            state.refcount.insert(index, 1);
            set.insert(index);
            return Err(e);
        }
        Ok(())
    }

    /// Sessions currently interested in `signal`.
    pub fn interest_count(&self, signal: usize) -> usize {
        let state = self.inner.state.lock();
        state.refcount.get(&(signal as u32)).copied().unwrap_or(0)
    }

    /// Signals `session` is interested in.
    pub fn session_signals(&self, session: SessionId) -> Vec<usize> {
        let state = self.inner.state.lock();
        state
            .interest
            .get(&session)
            .map(|set| set.iter().map(|&i| i as usize).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskControl")
            .field("task_id", &self.inner.task_id)
            .field("sample_time", &self.inner.sample_time)
            .finish_non_exhaustive()
    }
}
