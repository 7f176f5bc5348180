//! Session-side subscriptions: decimation, blocking and event triggering.
//!
//! A [`SubscriptionManager`] belongs to one session. It holds a
//! [`ReceiverCursor`] per task, registers the session's interest with each
//! [`TaskControl`] and turns the raw per-tick values into the events the
//! session asked for.

use crate::error::SubscriptionError;
use crate::receiver::{CursorEvent, CursorStats, ReceiverCursor};
use crate::registry::Signal;
use crate::session::{Session, SessionId, SignalValue};
use crate::task::TaskControl;
use std::collections::BTreeMap;

/// Delivery mode of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Sample every `decimation` task ticks, deliver `block_size` samples at
    /// once. Zero counts as one for both.
    Periodic {
        /// Task ticks between samples
        decimation: u32,
        /// Samples per delivery
        block_size: u32,
    },
    /// Deliver whenever the value bytes change. The first value is always
    /// delivered.
    Event,
}

impl SubscriptionMode {
    /// One sample per tick, delivered immediately.
    pub const EVERY_TICK: Self = Self::Periodic {
        decimation: 1,
        block_size: 1,
    };
}

/// State of one (session, signal) pair.
#[derive(Debug, Clone)]
pub struct Subscription {
    signal: usize,
    mode: SubscriptionMode,
    decimation: u32,
    block_size: u32,
    countdown: u32,
    sample_size: usize,
    buffer: Vec<u8>,
    samples: usize,
    has_value: bool,
    ready: bool,
    active: bool,
}

impl Subscription {
    /// Subscription to `signal`.
    pub fn new(signal: &Signal, mode: SubscriptionMode) -> Self {
        let sample_size = signal.info.layout.byte_size();
        let (decimation, block_size) = match mode {
            SubscriptionMode::Periodic {
                decimation,
                block_size,
            } => (decimation.max(1), block_size.max(1)),
            SubscriptionMode::Event => (1, 1),
        };
        Self {
            signal: signal.index,
            mode,
            decimation,
            block_size,
            countdown: decimation,
            sample_size,
            buffer: vec![0; sample_size * block_size as usize],
            samples: 0,
            has_value: false,
            ready: false,
            active: false,
        }
    }

    /// Signal index.
    pub fn signal(&self) -> usize {
        self.signal
    }

    /// Requested mode.
    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Task ticks between samples.
    pub fn decimation(&self) -> u32 {
        self.decimation
    }

    /// Samples per delivery.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Feed one tick's value. Returns `true` when a delivery is due.
    ///
    /// A due periodic block that was never consumed is superseded by the
    /// next one.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != self.sample_size {
            return false;
        }
        match self.mode {
            SubscriptionMode::Periodic { .. } => {
                self.countdown -= 1;
                if self.countdown > 0 {
                    return false;
                }
                self.countdown = self.decimation;
                if self.ready {
                    self.ready = false;
                    self.samples = 0;
                }

                let at = self.samples * self.sample_size;
                self.buffer[at..at + self.sample_size].copy_from_slice(bytes);
                self.samples += 1;
                if self.samples == self.block_size as usize {
                    self.ready = true;
                }
            }
            SubscriptionMode::Event => {
                if self.has_value && self.buffer == bytes {
                    return false;
                }
                self.buffer.copy_from_slice(bytes);
                self.has_value = true;
                self.samples = 1;
                self.ready = true;
            }
        }
        self.ready
    }

    /// The due delivery, if any.
    pub fn pending(&self) -> Option<SignalValue<'_>> {
        self.ready.then(|| SignalValue {
            signal: self.signal,
            samples: self.samples,
            bytes: &self.buffer[..self.samples * self.sample_size],
        })
    }

    /// Mark the due delivery as sent.
    pub fn consume(&mut self) {
        if !self.ready {
            return;
        }
        self.ready = false;
        if let SubscriptionMode::Periodic { .. } = self.mode {
            self.samples = 0;
        }
    }

    /// Restart the countdown, drop partial blocks and forget the last event
    /// value.
    pub fn sync(&mut self) {
        self.countdown = self.decimation;
        self.samples = 0;
        self.has_value = false;
        self.ready = false;
    }
}

struct TaskLink {
    control: TaskControl,
    cursor: ReceiverCursor,
    subscriptions: BTreeMap<usize, Subscription>,
}

/// All subscriptions of one session.
pub struct SubscriptionManager {
    id: SessionId,
    links: Vec<TaskLink>,
}

impl SubscriptionManager {
    /// Manager for a new session, attached to every task in `tasks`.
    pub fn new<'a>(tasks: impl IntoIterator<Item = &'a TaskControl>) -> Self {
        let id = SessionId::next();
        let links: Vec<TaskLink> = tasks
            .into_iter()
            .map(|control| TaskLink {
                cursor: control.attach(),
                control: control.clone(),
                subscriptions: BTreeMap::new(),
            })
            .collect();
        tracing::info!(session = %id, tasks = links.len(), "session attached");
        Self { id, links }
    }

    /// Session identity used towards the tasks.
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn link_of(&mut self, signal: usize) -> Result<&mut TaskLink, SubscriptionError> {
        let task_id = self
            .links
            .first()
            .and_then(|l| l.control.registry().signal(signal))
            .map(|s| s.task_id)
            .ok_or(SubscriptionError::UnknownSignal { signal })?;
        self.links
            .iter_mut()
            .find(|l| l.control.task_id() == task_id)
            .ok_or(SubscriptionError::TaskNotServed { signal, task_id })
    }

    /// Subscribe to `signal`, or change the mode of an existing subscription.
    pub fn subscribe(&mut self, signal: usize, mode: SubscriptionMode) -> Result<(), SubscriptionError> {
        let id = self.id;
        let link = self.link_of(signal)?;
        let Some(sig) = link.control.registry().signal(signal) else {
            return Err(SubscriptionError::UnknownSignal { signal });
        };
        let mut sub = Subscription::new(sig, mode);

        if let Some(existing) = link.subscriptions.get(&signal) {
            sub.active = existing.active;
        } else {
            link.control.subscribe(id, &[signal])?;
            sub.active = link.cursor.signal_list().contains(&(signal as u32));
        }
        tracing::debug!(session = %id, signal, ?mode, "subscribed");
        link.subscriptions.insert(signal, sub);
        Ok(())
    }

    /// Drop the subscription to `signal`.
    pub fn unsubscribe(&mut self, signal: usize) -> Result<(), SubscriptionError> {
        let id = self.id;
        let link = self.link_of(signal)?;
        if link.subscriptions.contains_key(&signal) {
            link.control.unsubscribe(id, &[signal])?;
            link.subscriptions.remove(&signal);
        }
        Ok(())
    }

    /// Drop every subscription. Returns the first failure.
    pub fn unsubscribe_all(&mut self) -> Result<(), SubscriptionError> {
        let mut first_err = None;
        for link in &mut self.links {
            match link.control.unsubscribe_all(self.id) {
                Ok(()) => link.subscriptions.clear(),
                Err(e) => {
                    let kept = link.control.session_signals(self.id);
                    link.subscriptions.retain(|s, _| kept.contains(s));
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Restart every subscription so that deliveries line up again.
    pub fn sync(&mut self) {
        for sub in self.links.iter_mut().flat_map(|l| l.subscriptions.values_mut()) {
            sub.sync();
        }
    }

    /// Subscription to `signal`, if any.
    pub fn subscription(&self, signal: usize) -> Option<&Subscription> {
        self.links.iter().find_map(|l| l.subscriptions.get(&signal))
    }

    /// Cursor counters of `task_id`.
    pub fn cursor_stats(&self, task_id: usize) -> Option<CursorStats> {
        self.links
            .iter()
            .find(|l| l.control.task_id() == task_id)
            .map(|l| l.cursor.stats())
    }

    /// Read every task's new frames and deliver what became due.
    ///
    /// Returns the number of frames consumed.
    pub fn poll(&mut self, session: &mut dyn Session) -> usize {
        let mut consumed = 0;
        for link in &mut self.links {
            let task_id = link.control.task_id();
            let TaskLink {
                cursor,
                subscriptions,
                ..
            } = link;

            consumed += cursor.poll(|event| match event {
                CursorEvent::List(list) => {
                    for sub in subscriptions.values_mut() {
                        let present = list.contains(&(sub.signal as u32));
                        if present && !sub.active {
                            sub.sync();
                        }
                        sub.active = present;
                    }
                    session.new_signal_list(task_id, list);
                }
                CursorEvent::Data(frame) => {
                    let mut due = false;
                    for sub in subscriptions.values_mut() {
                        if let Some(bytes) = frame.value(sub.signal) {
                            due |= sub.feed(bytes);
                        }
                    }
                    if due {
                        let values: Vec<SignalValue<'_>> =
                            subscriptions.values().filter_map(Subscription::pending).collect();
                        session.new_signal_data(task_id, frame.seq, frame.timestamp, &values);
                        drop(values);
                        subscriptions.values_mut().for_each(Subscription::consume);
                    }
                }
            });
        }
        consumed
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for link in &mut self.links {
            let kept = link.control.disconnect(self.id);
            if !kept.is_empty() {
                tracing::warn!(
                    session = %self.id,
                    task_id = link.control.task_id(),
                    signals = ?kept,
                    "mailbox full, signals not released on disconnect"
                );
            }
            link.subscriptions.clear();
        }
        tracing::info!(session = %self.id, "session detached");
    }
}
