//! Parameter write path.
//!
//! ```text
//! session thread                         real-time thread
//! ──────────────                         ────────────────
//! lock parameter
//! access + range check
//! callback(check_only = true)
//! write staging, req += 1      ───────►  req != reply ?
//!                                        callback(check_only = false) into image
//! wait for reply == req        ◄───────  result, reply = req
//! adopt value, unlock
//! ```
//!
//! Writers of the same parameter are serialized by a per-parameter mutex the
//! real-time side never takes. The real-time side only sees the staging
//! buffer while `req != reply`, and the writer only touches it while
//! `req == reply`.

use crate::error::ParameterError;
use crate::image::ProcessImage;
use crate::mailbox::RetryPolicy;
use crate::registry::{AccessMode, ParameterUpdate, VariableRegistry};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Value a session knows the parameter has, plus a commit that timed out.
#[derive(Debug)]
struct Shadow {
    value: Vec<u8>,
    unconfirmed: Option<Vec<u8>>,
}

struct ParameterSlot {
    req: AtomicU32,
    reply: AtomicU32,
    result: AtomicI32,
    staging: UnsafeCell<Box<[u8]>>,
    shadow: Mutex<Shadow>,
}

// SAFETY: `staging` is handed back and forth through the req/reply tokens;
// see the module docs.
unsafe impl Sync for ParameterSlot {}

impl ParameterSlot {
    #[inline]
    fn idle(&self) -> bool {
        self.reply.load(Ordering::Acquire) == self.req.load(Ordering::Relaxed)
    }
}

struct Shared {
    registry: Arc<VariableRegistry>,
    slots: Vec<ParameterSlot>,
}

/// One element range of a batch write.
#[derive(Debug, Clone, Copy)]
pub struct ParameterWrite<'a> {
    /// Parameter index
    pub parameter: usize,
    /// First element
    pub start: usize,
    /// Elements
    pub count: usize,
    /// `count * element_width` bytes
    pub bytes: &'a [u8],
}

/// Create the session and real-time halves of the parameter path. Initial
/// values are taken from `image`.
pub fn parameter_channel(
    registry: &Arc<VariableRegistry>,
    image: &ProcessImage,
    retry: RetryPolicy,
) -> (ParameterClient, ParameterCommitter) {
    let slots = registry
        .parameters()
        .iter()
        .map(|p| {
            let current = image.bytes()[p.info.range()].to_vec();
            ParameterSlot {
                req: AtomicU32::new(0),
                reply: AtomicU32::new(0),
                result: AtomicI32::new(0),
                staging: UnsafeCell::new(current.clone().into_boxed_slice()),
                shadow: Mutex::new(Shadow {
                    value: current,
                    unconfirmed: None,
                }),
            }
        })
        .collect();

    let shared = Arc::new(Shared {
        registry: Arc::clone(registry),
        slots,
    });
    (
        ParameterClient {
            shared: Arc::clone(&shared),
            retry,
        },
        ParameterCommitter { shared },
    )
}

/// Session-side handle. Cheap to clone.
#[derive(Clone)]
pub struct ParameterClient {
    shared: Arc<Shared>,
    retry: RetryPolicy,
}

impl ParameterClient {
    /// Last committed value of `parameter`.
    pub fn value(&self, parameter: usize) -> Result<Vec<u8>, ParameterError> {
        let slot = self
            .shared
            .slots
            .get(parameter)
            .ok_or(ParameterError::UnknownParameter { parameter })?;
        let mut shadow = slot.shadow.lock();
        Self::settle(slot, &mut shadow);
        Ok(shadow.value.clone())
    }

    /// Adopt a commit that was acknowledged after its writer gave up.
    fn settle(slot: &ParameterSlot, shadow: &mut Shadow) {
        if shadow.unconfirmed.is_some() && slot.idle() {
            if let Some(value) = shadow.unconfirmed.take() {
                if slot.result.load(Ordering::Relaxed) == 0 {
                    shadow.value = value;
                }
            }
        }
    }

    /// Write `count` elements starting at element `start`.
    ///
    /// Blocks the calling thread until the real-time side committed the
    /// value, or the retry budget ran out.
    pub fn set_value(
        &self,
        parameter: usize,
        bytes: &[u8],
        start: usize,
        count: usize,
    ) -> Result<(), ParameterError> {
        let registry = &self.shared.registry;
        let (Some(param), Some(slot)) = (registry.parameter(parameter), self.shared.slots.get(parameter)) else {
            return Err(ParameterError::UnknownParameter { parameter });
        };
        if !param.access.contains(AccessMode::WRITE) {
            return Err(ParameterError::AccessDenied { parameter });
        }
        let layout = &param.info.layout;
        let width = layout.element_width();
        if count == 0
            || start.checked_add(count).is_none_or(|end| end > layout.element_count())
            || bytes.len() != count * width
        {
            return Err(ParameterError::InvalidRange {
                parameter,
                start,
                count,
            });
        }

        let mut shadow = slot.shadow.lock();
        Self::settle(slot, &mut shadow);
        if !self.wait_idle(slot) {
            return Err(ParameterError::CommitTimeout { parameter });
        }
        Self::settle(slot, &mut shadow);

        let mut staged = shadow.value.clone();
        staged[start * width..(start + count) * width].copy_from_slice(bytes);

        let mut current = shadow.value.clone();
        let code = param.update(&mut ParameterUpdate {
            task_id: 0,
            check_only: true,
            dst: &mut current,
            src: &staged,
        });
        if code != 0 {
            return Err(ParameterError::Rejected { parameter, code });
        }

        // SAFETY: req == reply, the real-time side does not read staging.
        unsafe {
            (*slot.staging.get()).copy_from_slice(&staged);
        }
        slot.result.store(0, Ordering::Relaxed);
        let req = slot.req.load(Ordering::Relaxed).wrapping_add(1);
        slot.req.store(req, Ordering::Release);

        if !self.wait_idle(slot) {
            tracing::warn!(parameter, path = %param.info.path, "parameter commit not acknowledged");
            shadow.unconfirmed = Some(staged);
            return Err(ParameterError::CommitTimeout { parameter });
        }

        match slot.result.load(Ordering::Relaxed) {
            0 => {
                shadow.value = staged;
                Ok(())
            }
            code => Err(ParameterError::Rejected { parameter, code }),
        }
    }

    /// Apply several writes, reporting each one separately.
    pub fn set_values(&self, writes: &[ParameterWrite<'_>]) -> Vec<Result<(), ParameterError>> {
        writes
            .iter()
            .map(|w| self.set_value(w.parameter, w.bytes, w.start, w.count))
            .collect()
    }

    fn wait_idle(&self, slot: &ParameterSlot) -> bool {
        for attempt in 0..self.retry.max_attempts.max(1) {
            if slot.idle() {
                return true;
            }
            if attempt + 1 < self.retry.max_attempts {
                std::thread::sleep(self.retry.interval);
            }
        }
        slot.idle()
    }
}

/// Real-time half: applies staged writes to the process image.
pub struct ParameterCommitter {
    shared: Arc<Shared>,
}

impl ParameterCommitter {
    /// Commit every pending write. Call from the real-time thread once per
    /// base tick, before the tasks run. Returns the number of commits.
    pub fn apply(&mut self, image: &mut ProcessImage, task_id: usize) -> usize {
        let shared = &*self.shared;
        let mut applied = 0;
        for (param, slot) in shared.registry.parameters().iter().zip(&shared.slots) {
            let req = slot.req.load(Ordering::Acquire);
            if req == slot.reply.load(Ordering::Relaxed) {
                continue;
            }
            // SAFETY: req != reply, the writer waits for the reply.
            let staging = unsafe { &*slot.staging.get() };
            let code = param.update(&mut ParameterUpdate {
                task_id,
                check_only: false,
                dst: &mut image.bytes_mut()[param.info.range()],
                src: staging,
            });
            slot.result.store(code, Ordering::Relaxed);
            slot.reply.store(req, Ordering::Release);
            applied += 1;
        }
        applied
    }
}
