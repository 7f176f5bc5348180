//! Per-session read cursor over one task's frame ring.
//!
//! The cursor follows frame links from its last consumed frame. List frames
//! rebuild the placement table (signal -> byte range in the next data
//! payload), data frames are handed out through it. When the writer lapped
//! the cursor, it jumps to the newest frame recorded in the arena snapshot,
//! replays the snapshot's list if it differs from the one in use and
//! delivers that newest frame. Frames in between are lost and only counted.

use crate::arena::{Arena, Snapshot};
use crate::registry::VariableRegistry;
use crate::ring::{self, FrameKind, Link};
use daq::timestamp::Timestamp;
use std::sync::Arc;

/// Snapshot jumps allowed per poll before giving up until the next poll.
const MAX_RESYNCS_PER_POLL: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Attached before the first frame; the next frame is position 0
    Origin,
    /// Needs a snapshot to find "now"
    Unpositioned,
    /// Last consumed frame
    At(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    offset: u32,
    size: u32,
}

const UNPLACED: Placement = Placement {
    offset: u32::MAX,
    size: 0,
};

/// A data frame as seen through the current signal list.
#[derive(Debug, Clone, Copy)]
pub struct DataFrame<'a> {
    /// Per-task data frame sequence number
    pub seq: u32,
    /// Producer timestamp
    pub timestamp: Timestamp,
    values: &'a [u8],
    placement: &'a [Placement],
}

impl<'a> DataFrame<'a> {
    /// Bytes of `signal` in this frame, if it is transmitted.
    #[inline]
    pub fn value(&self, signal: usize) -> Option<&'a [u8]> {
        let p = self.placement.get(signal).copied()?;
        if p == UNPLACED {
            return None;
        }
        let start = p.offset as usize;
        self.values.get(start..start + p.size as usize)
    }

    /// Concatenated values in list order.
    pub fn raw_values(&self) -> &'a [u8] {
        self.values
    }
}

/// What a poll hands to its caller, in ring order.
#[derive(Debug, Clone, Copy)]
pub enum CursorEvent<'a> {
    /// New transmitted set (also replayed after attach and after a jump)
    List(&'a [u32]),
    /// Values decoded with the most recent list
    Data(DataFrame<'a>),
}

/// Cursor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorStats {
    /// List frames consumed
    pub list_frames: u64,
    /// Data frames delivered
    pub data_frames: u64,
    /// Jumps to the snapshot after being lapped
    pub resyncs: u64,
    /// Data frames skipped, from sequence number gaps
    pub lost_frames: u64,
    /// Frames that did not match the current list
    pub malformed: u64,
}

/// Read cursor of one session on one task.
pub struct ReceiverCursor {
    task_id: usize,
    arena: Arc<Arena>,
    registry: Arc<VariableRegistry>,
    position: Position,
    list: Vec<u32>,
    placement: Vec<Placement>,
    data_len: usize,
    replay: bool,
    last_seq: Option<u32>,
    scratch: Vec<u8>,
    decoded: Vec<u32>,
    snapshot: Snapshot,
    stats: CursorStats,
}

impl ReceiverCursor {
    /// Position a new cursor at the newest frame. Only frames written after
    /// it are delivered; the current list is replayed on the first poll.
    pub fn attach(task_id: usize, arena: Arc<Arena>, registry: Arc<VariableRegistry>) -> Self {
        let placement = vec![UNPLACED; registry.signals().len()];
        let mut cursor = Self {
            task_id,
            arena,
            registry,
            position: Position::Unpositioned,
            list: Vec::new(),
            placement,
            data_len: 0,
            replay: false,
            last_seq: None,
            scratch: Vec::new(),
            decoded: Vec::new(),
            snapshot: Snapshot::default(),
            stats: CursorStats::default(),
        };

        if cursor.arena.read_snapshot(&mut cursor.snapshot) {
            match cursor.snapshot.head {
                Some(head) => {
                    cursor.position = Position::At(head);
                    cursor.last_seq = Some(cursor.snapshot.last_seq);
                    cursor.adopt_snapshot_list();
                    cursor.replay = true;
                }
                None => cursor.position = Position::Origin,
            }
        }

        tracing::debug!(task_id, position = ?cursor.position, "cursor attached");
        cursor
    }

    /// Task id.
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// List currently used to decode data frames.
    pub fn signal_list(&self) -> &[u32] {
        &self.list
    }

    /// Counters.
    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Deliver every frame written since the last poll. Never blocks.
    ///
    /// Returns the number of frames consumed from the ring.
    pub fn poll(&mut self, mut on_event: impl FnMut(CursorEvent<'_>)) -> usize {
        let mut consumed = 0;
        let mut resyncs_left = MAX_RESYNCS_PER_POLL;

        if self.replay {
            self.replay = false;
            on_event(CursorEvent::List(&self.list));
        }

        loop {
            let next = match self.position {
                Position::Unpositioned => {
                    if self.resync(false, &mut on_event) {
                        continue;
                    }
                    break;
                }
                Position::Origin => {
                    if !self.arena.read_snapshot(&mut self.snapshot) || self.snapshot.head.is_none() {
                        break;
                    }
                    0
                }
                Position::At(pos) => match ring::next_link(&self.arena, pos) {
                    Link::End => break,
                    Link::Next(next) => next,
                    Link::Lost => {
                        if self.recover(&mut resyncs_left, &mut on_event) {
                            continue;
                        }
                        break;
                    }
                },
            };

            match ring::read_frame(&self.arena, next, &mut self.scratch) {
                Some(kind) => {
                    self.position = Position::At(next);
                    consumed += 1;
                    self.dispatch(kind, &mut on_event);
                }
                None => {
                    if !self.recover(&mut resyncs_left, &mut on_event) {
                        break;
                    }
                }
            }
        }

        consumed
    }

    /// Release the cursor. The arena stays with its task.
    pub fn detach(self) -> CursorStats {
        tracing::debug!(task_id = self.task_id, stats = ?self.stats, "cursor detached");
        self.stats
    }

    fn recover(&mut self, budget: &mut u32, on_event: &mut impl FnMut(CursorEvent<'_>)) -> bool {
        if *budget == 0 {
            return false;
        }
        *budget -= 1;
        self.stats.resyncs += 1;
        let before = self.stats.lost_frames;
        let ok = self.resync(true, on_event);
        tracing::warn!(
            task_id = self.task_id,
            lost = self.stats.lost_frames - before,
            "cursor lapped by writer, frames lost"
        );
        ok
    }

    /// Jump to the snapshot head. Replays the list when it changed and, if
    /// `deliver_head`, delivers the head frame itself.
    fn resync(&mut self, deliver_head: bool, on_event: &mut impl FnMut(CursorEvent<'_>)) -> bool {
        if !self.arena.read_snapshot(&mut self.snapshot) {
            return false;
        }
        let Some(head) = self.snapshot.head else {
            self.position = Position::Origin;
            return false;
        };

        if self.snapshot.list != self.list || !deliver_head {
            self.adopt_snapshot_list();
            on_event(CursorEvent::List(&self.list));
        }
        self.position = Position::At(head);
        tracing::debug!(task_id = self.task_id, head, "cursor resynchronized");

        if deliver_head {
            if let Some(FrameKind::SignalData) = ring::read_frame(&self.arena, head, &mut self.scratch) {
                self.deliver_data(on_event);
            }
        } else {
            self.last_seq = Some(self.snapshot.last_seq);
        }
        true
    }

    fn dispatch(&mut self, kind: FrameKind, on_event: &mut impl FnMut(CursorEvent<'_>)) {
        match kind {
            FrameKind::SignalList => {
                if !ring::decode_list(&self.scratch, &mut self.decoded) {
                    self.stats.malformed += 1;
                    return;
                }
                std::mem::swap(&mut self.list, &mut self.decoded);
                self.rebuild_placement();
                self.stats.list_frames += 1;
                on_event(CursorEvent::List(&self.list));
            }
            FrameKind::SignalData => self.deliver_data(on_event),
        }
    }

    fn deliver_data(&mut self, on_event: &mut impl FnMut(CursorEvent<'_>)) {
        let Some((seq, timestamp, values)) = ring::decode_data(&self.scratch) else {
            self.stats.malformed += 1;
            return;
        };
        if values.len() != self.data_len {
            self.stats.malformed += 1;
            tracing::warn!(
                task_id = self.task_id,
                seq,
                got = values.len(),
                expected = self.data_len,
                "data frame does not match signal list"
            );
            return;
        }

        if let Some(last) = self.last_seq {
            let gap = seq.wrapping_sub(last).wrapping_sub(1);
            if gap != 0 && gap < u32::MAX / 2 {
                self.stats.lost_frames += gap as u64;
            }
        }
        self.last_seq = Some(seq);
        self.stats.data_frames += 1;

        on_event(CursorEvent::Data(DataFrame {
            seq,
            timestamp,
            values,
            placement: &self.placement,
        }));
    }

    fn adopt_snapshot_list(&mut self) {
        self.list.clear();
        self.list.extend_from_slice(&self.snapshot.list);
        self.rebuild_placement();
    }

    fn rebuild_placement(&mut self) {
        self.placement.fill(UNPLACED);
        let mut offset = 0usize;
        for &index in &self.list {
            let Some(signal) = self.registry.signal(index as usize) else {
                self.stats.malformed += 1;
                continue;
            };
            let size = signal.info.layout.byte_size();
            self.placement[index as usize] = Placement {
                offset: offset as u32,
                size: size as u32,
            };
            offset += size;
        }
        self.data_len = offset;
    }
}

impl std::fmt::Debug for ReceiverCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverCursor")
            .field("task_id", &self.task_id)
            .field("position", &self.position)
            .field("list", &self.list)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ProcessImage;
    use crate::session::SessionId;
    use crate::task::{TaskSetup, create_task};
    use daq::layout::{ElementLayout, Primitive, PrimitiveType};

    #[derive(Debug, PartialEq)]
    enum Seen {
        List(Vec<u32>),
        Data(u32, Vec<u8>),
    }

    fn collect(cursor: &mut ReceiverCursor, signal: usize) -> Vec<Seen> {
        let mut seen = Vec::new();
        cursor.poll(|ev| match ev {
            CursorEvent::List(l) => seen.push(Seen::List(l.to_vec())),
            CursorEvent::Data(d) => {
                seen.push(Seen::Data(d.seq, d.value(signal).unwrap_or_default().to_vec()))
            }
        });
        seen
    }

    fn setup(frames: usize) -> (crate::task::TaskScheduler, crate::task::TaskControl, ProcessImage) {
        let mut reg = VariableRegistry::new(1);
        reg.register_signal("/a", 0, 1, ElementLayout::scalar(PrimitiveType::U32), 0)
            .unwrap();
        reg.register_signal("/b", 0, 1, ElementLayout::scalar(PrimitiveType::F64), 8)
            .unwrap();
        reg.finalize();
        let reg = Arc::new(reg);
        let image = ProcessImage::for_registry(&reg);
        let (sched, ctl) = create_task(&reg, &TaskSetup::new(0, 0.01).with_ring_frames(frames)).unwrap();
        (sched, ctl, image)
    }

    #[test]
    fn test_attach_before_first_frame_sees_everything() {
        let (mut sched, ctl, mut image) = setup(8);
        let mut cursor = ctl.attach();
        ctl.subscribe(SessionId::next(), &[0]).unwrap();

        image.write(0, 7u32);
        sched.tick(&image, None);

        let seen = collect(&mut cursor, 0);
        assert_eq!(
            seen,
            vec![Seen::List(vec![0]), Seen::Data(0, 7u32.to_ne_bytes().to_vec())]
        );
        assert!(collect(&mut cursor, 0).is_empty());
    }

    #[test]
    fn test_attach_replays_list_and_skips_history() {
        let (mut sched, ctl, mut image) = setup(8);
        ctl.subscribe(SessionId::next(), &[0, 1]).unwrap();
        for v in 0..3u32 {
            image.write(0, v);
            sched.tick(&image, None);
        }

        let mut cursor = ctl.attach();
        assert!(collect(&mut cursor, 0) == vec![Seen::List(vec![1, 0])]);

        image.write(0, 99u32);
        sched.tick(&image, None);
        assert_eq!(
            collect(&mut cursor, 0),
            vec![Seen::Data(3, 99u32.to_ne_bytes().to_vec())]
        );
        assert_eq!(cursor.stats().lost_frames, 0);
    }

    #[test]
    fn test_list_change_precedes_data() {
        let (mut sched, ctl, image) = setup(8);
        let mut cursor = ctl.attach();
        let s = SessionId::next();
        ctl.subscribe(s, &[0]).unwrap();
        sched.tick(&image, None);
        ctl.subscribe(s, &[1]).unwrap();
        sched.tick(&image, None);

        let seen = collect(&mut cursor, 1);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2], Seen::List(vec![1, 0]));
        assert_eq!(seen[3], Seen::Data(1, 0f64.to_ne_bytes().to_vec()));
    }

    #[test]
    fn test_lapped_cursor_resyncs_to_newest() {
        let (mut sched, ctl, mut image) = setup(3);
        ctl.subscribe(SessionId::next(), &[1]).unwrap();
        sched.tick(&image, None);
        let mut cursor = ctl.attach();

        for v in 1..=10 {
            image.write(8, v as f64);
            sched.tick(&image, None);
        }

        let seen = collect(&mut cursor, 1);
        let Some(Seen::Data(seq, bytes)) = seen.last() else {
            panic!("expected data, got {seen:?}");
        };
        assert_eq!(*seq, 10);
        assert_eq!(f64::read_ne(bytes), 10.0);
        let stats = cursor.stats();
        assert!(stats.resyncs >= 1);
        assert!(stats.lost_frames > 0);
        assert_eq!(stats.malformed, 0);
    }
}
