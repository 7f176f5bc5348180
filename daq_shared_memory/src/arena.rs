//! Per-task arena: one mapped region holding the mailbox, the list snapshot
//! and the frame ring.
//!
//! ```text
//! ┌──────────────┬──────────────────┬───────────────────────┬──────────────────────┐
//! │ ArenaHeader  │ Mailbox slots    │ Snapshot              │ Frame ring           │
//! │ (64 B)       │ (n+1) x u64      │ seqlock, head, list   │ ring_capacity bytes  │
//! └──────────────┴──────────────────┴───────────────────────┴──────────────────────┘
//! ```
//!
//! Every section starts on a cache line. All cross-thread state is either an
//! atomic or frame bytes validated through the ring's lap check, so the arena
//! is handed out as `Arc<Arena>` to the producer and to every cursor.

use crate::error::{SetupError, SetupResult};
use crate::platform::{ArenaMemoryConfig, map_arena};
use crate::version::VersionCounter;
use daq::consts::{
    ARENA_MAX_SIZE, ARENA_MIN_SIZE, CACHE_LINE_SIZE, FRAME_ALIGN, MIN_RING_FRAMES,
    SNAPSHOT_READ_RETRIES,
};
use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic bytes identifying an initialized arena: `"DAQ_ARN\0"`.
pub const ARENA_MAGIC: [u8; 8] = *b"DAQ_ARN\0";

/// Bytes of the per-frame header in the ring.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Bytes of the fixed part of a `SignalData` payload (seq, nsec, sec).
pub const DATA_HEADER_SIZE: usize = 16;

/// Bytes of the fixed part of a `SignalList` payload (count).
pub const LIST_HEADER_SIZE: usize = 4;

/// Round `size` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Arena header with cache-line alignment
#[repr(C, align(64))]
pub struct ArenaHeader {
    /// Magic number for validation
    pub magic: [u8; 8],
    /// Owning task
    pub task_id: u32,
    /// Mailbox slots
    pub mailbox_capacity: u32,
    /// Maximum entries of a signal list
    pub list_capacity: u32,
    _pad: u32,
    /// Frame ring size in bytes
    pub ring_capacity: u64,
    /// Logical end position of the frame being (or last) written.
    /// Readers compare it against their frame position to detect overwrite.
    pub reserved: AtomicU64,
    /// Frames written since creation
    pub frames_written: AtomicU64,
    _padding: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<ArenaHeader>(), 64);
const_assert_eq!(core::mem::align_of::<ArenaHeader>(), CACHE_LINE_SIZE);

impl ArenaHeader {
    fn new(task_id: usize, layout: &ArenaLayout) -> Self {
        Self {
            magic: ARENA_MAGIC,
            task_id: task_id as u32,
            mailbox_capacity: layout.mailbox_capacity as u32,
            list_capacity: layout.list_capacity as u32,
            _pad: 0,
            ring_capacity: layout.ring_capacity as u64,
            reserved: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            _padding: [0; 16],
        }
    }

    /// Validate the magic bytes.
    #[inline]
    pub fn is_magic_valid(&self) -> bool {
        self.magic == ARENA_MAGIC
    }
}

/// Seqlock-guarded state the producer republishes after every tick.
///
/// `head` and `list_pos` store a ring position plus one; zero means "none".
/// The list entries follow the header in the arena.
#[repr(C, align(64))]
pub struct SnapshotHeader {
    /// Seqlock version
    pub version: VersionCounter,
    /// Newest frame position + 1
    pub head: AtomicU64,
    /// Newest `SignalList` frame position + 1
    pub list_pos: AtomicU64,
    /// Entries in the transmitted list
    pub list_count: AtomicU32,
    /// Sequence number of the newest data frame
    pub last_seq: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<SnapshotHeader>(), 64);

/// Consistent copy of the snapshot taken by a reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Newest frame position
    pub head: Option<u64>,
    /// Newest list frame position
    pub list_pos: Option<u64>,
    /// Transmitted signal indices in canonical order
    pub list: Vec<u32>,
    /// Sequence number of the newest data frame
    pub last_seq: u32,
}

/// Byte layout of one arena, computed once at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    /// Mailbox slots (task signal count + 1)
    pub mailbox_capacity: usize,
    /// Maximum signal list entries (task signal count)
    pub list_capacity: usize,
    /// Frame ring bytes
    pub ring_capacity: usize,
    /// Offset of the mailbox section
    pub mailbox_offset: usize,
    /// Offset of the snapshot section
    pub snapshot_offset: usize,
    /// Offset of the frame ring
    pub ring_offset: usize,
    /// Mapped size (page multiple)
    pub total_size: usize,
}

impl ArenaLayout {
    /// Plan an arena for a task with `signal_count` signals whose values
    /// total `signal_bytes`, keeping at least `frames` full data frames.
    pub fn plan(signal_count: usize, signal_bytes: usize, frames: usize) -> SetupResult<Self> {
        let frames = frames.max(MIN_RING_FRAMES);
        let data_frame = data_frame_size(signal_bytes);
        let list_frame = list_frame_size(signal_count);

        let ring_capacity = frames
            .checked_mul(data_frame)
            .and_then(|b| b.checked_add(2 * list_frame))
            .map(|b| align_up(b, FRAME_ALIGN))
            .ok_or(SetupError::InvalidSize { size: usize::MAX })?;

        let mailbox_capacity = signal_count + 1;

        let mut planner = LayoutPlanner::new();
        planner.add_section(core::mem::size_of::<ArenaHeader>(), CACHE_LINE_SIZE);
        let mailbox_offset = planner.add_section(mailbox_capacity * 8, CACHE_LINE_SIZE);
        let snapshot_offset = planner.add_section(
            core::mem::size_of::<SnapshotHeader>() + signal_count * 4,
            CACHE_LINE_SIZE,
        );
        let ring_offset = planner.add_section(ring_capacity, CACHE_LINE_SIZE);
        let total_size = planner.finalize(ARENA_MIN_SIZE);

        if total_size > ARENA_MAX_SIZE {
            return Err(SetupError::InvalidSize { size: total_size });
        }

        Ok(Self {
            mailbox_capacity,
            list_capacity: signal_count,
            ring_capacity,
            mailbox_offset,
            snapshot_offset,
            ring_offset,
            total_size,
        })
    }

    /// Plan from timing: the ring keeps `buffer_seconds / sample_time` frames.
    pub fn for_task(
        task_id: usize,
        signal_count: usize,
        signal_bytes: usize,
        sample_time: f64,
        buffer_seconds: f64,
    ) -> SetupResult<Self> {
        if !(sample_time.is_finite() && sample_time > 0.0) {
            return Err(SetupError::InvalidSampleTime {
                task_id,
                sample_time,
            });
        }
        let frames = (buffer_seconds.max(0.0) / sample_time).ceil();
        let frames = if frames.is_finite() && frames < usize::MAX as f64 {
            frames as usize
        } else {
            return Err(SetupError::InvalidSize { size: usize::MAX });
        };
        Self::plan(signal_count, signal_bytes, frames)
    }
}

/// Total ring bytes of a data frame carrying `value_bytes` of values.
#[inline]
pub const fn data_frame_size(value_bytes: usize) -> usize {
    align_up(FRAME_HEADER_SIZE + DATA_HEADER_SIZE + value_bytes, FRAME_ALIGN)
}

/// Total ring bytes of a list frame with `count` entries.
#[inline]
pub const fn list_frame_size(count: usize) -> usize {
    align_up(FRAME_HEADER_SIZE + LIST_HEADER_SIZE + 4 * count, FRAME_ALIGN)
}

/// Sequential section planner with automatic alignment
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutPlanner {
    /// Current offset in layout
    pub offset: usize,
}

impl LayoutPlanner {
    /// Create new planner
    pub fn new() -> Self {
        Self { offset: 0 }
    }

    /// Add a section, returning its aligned offset
    pub fn add_section(&mut self, size: usize, align: usize) -> usize {
        self.offset = align_up(self.offset, align);
        let section_offset = self.offset;
        self.offset += size;
        section_offset
    }

    /// Total size rounded up to `granule`
    pub fn finalize(&self, granule: usize) -> usize {
        align_up(self.offset.max(1), granule)
    }
}

/// One task's mapped arena.
pub struct Arena {
    task_id: usize,
    layout: ArenaLayout,
    /// Owns the mapping; all access goes through `base`.
    _mmap: MmapMut,
    base: *mut u8,
}

// SAFETY: the mapping lives as long as the Arena. Shared state is accessed
// through atomics; ring bytes are written only by the single producer and
// readers validate every copy with the lap check before using it.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map and initialize an arena.
    pub fn create(task_id: usize, layout: ArenaLayout, memory: &ArenaMemoryConfig) -> SetupResult<Self> {
        let mut mmap = map_arena(layout.total_size, memory)
            .map_err(|source| SetupError::ArenaAllocation { task_id, source })?;
        let base = mmap.as_mut_ptr();

        // Fresh anonymous mapping: zeroed, so every mailbox slot reads Clear
        // and the snapshot reads "no head, empty list".
        unsafe {
            std::ptr::write(base as *mut ArenaHeader, ArenaHeader::new(task_id, &layout));
        }

        tracing::debug!(
            task_id,
            total_size = layout.total_size,
            ring_capacity = layout.ring_capacity,
            mailbox_capacity = layout.mailbox_capacity,
            "arena mapped"
        );

        Ok(Self {
            task_id,
            layout,
            _mmap: mmap,
            base,
        })
    }

    /// Owning task id.
    #[inline]
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// Byte layout.
    #[inline]
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Arena header.
    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.base as *const ArenaHeader) }
    }

    /// Mailbox slots.
    #[inline]
    pub fn mailbox_slots(&self) -> &[AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(self.layout.mailbox_offset) as *const AtomicU64,
                self.layout.mailbox_capacity,
            )
        }
    }

    /// Snapshot header.
    #[inline]
    pub fn snapshot_header(&self) -> &SnapshotHeader {
        unsafe { &*(self.base.add(self.layout.snapshot_offset) as *const SnapshotHeader) }
    }

    /// Snapshot list entries (capacity = task signal count).
    #[inline]
    pub fn snapshot_entries(&self) -> &[AtomicU32] {
        unsafe {
            std::slice::from_raw_parts(
                self.base
                    .add(self.layout.snapshot_offset + core::mem::size_of::<SnapshotHeader>())
                    as *const AtomicU32,
                self.layout.list_capacity,
            )
        }
    }

    /// Publish the producer's state. Writer side only, allocation free.
    pub fn publish_snapshot(&self, head: u64, list_pos: Option<u64>, list: Option<&[u32]>, last_seq: u32) {
        let snap = self.snapshot_header();
        snap.version.begin_write();
        snap.head.store(head + 1, Ordering::Relaxed);
        snap.last_seq.store(last_seq, Ordering::Relaxed);
        if let Some(list) = list {
            let entries = self.snapshot_entries();
            for (slot, &index) in entries.iter().zip(list) {
                slot.store(index, Ordering::Relaxed);
            }
            snap.list_count.store(list.len() as u32, Ordering::Relaxed);
            snap.list_pos
                .store(list_pos.map_or(0, |p| p + 1), Ordering::Relaxed);
        }
        snap.version.end_write();
    }

    /// Take a consistent copy of the snapshot into `out`.
    ///
    /// Returns `false` if the producer kept racing the read; `out` is then
    /// unspecified and the caller retries on its next poll.
    pub fn read_snapshot(&self, out: &mut Snapshot) -> bool {
        let snap = self.snapshot_header();
        let entries = self.snapshot_entries();
        snap.version
            .read_consistent(SNAPSHOT_READ_RETRIES, || {
                let head = snap.head.load(Ordering::Relaxed);
                let list_pos = snap.list_pos.load(Ordering::Relaxed);
                let count = (snap.list_count.load(Ordering::Relaxed) as usize).min(entries.len());
                out.head = head.checked_sub(1);
                out.list_pos = list_pos.checked_sub(1);
                out.last_seq = snap.last_seq.load(Ordering::Relaxed);
                out.list.clear();
                out.list
                    .extend(entries[..count].iter().map(|e| e.load(Ordering::Relaxed)));
            })
            .is_some()
    }

    /// Frame ring size in bytes.
    #[inline]
    pub fn ring_capacity(&self) -> usize {
        self.layout.ring_capacity
    }

    /// Base pointer of the frame ring.
    #[inline]
    pub(crate) fn ring_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(self.layout.ring_offset) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sections_are_cache_aligned() {
        let layout = ArenaLayout::plan(5, 40, 10).unwrap();
        assert_eq!(layout.mailbox_capacity, 6);
        assert_eq!(layout.mailbox_offset % CACHE_LINE_SIZE, 0);
        assert_eq!(layout.snapshot_offset % CACHE_LINE_SIZE, 0);
        assert_eq!(layout.ring_offset % CACHE_LINE_SIZE, 0);
        assert_eq!(layout.total_size % ARENA_MIN_SIZE, 0);
        assert!(layout.ring_offset + layout.ring_capacity <= layout.total_size);
    }

    #[test]
    fn test_ring_holds_requested_frames() {
        let layout = ArenaLayout::plan(1, 8, 3).unwrap();
        assert_eq!(
            layout.ring_capacity,
            3 * data_frame_size(8) + 2 * list_frame_size(1)
        );
    }

    #[test]
    fn test_frames_from_timing() {
        let layout = ArenaLayout::for_task(0, 1, 8, 0.001, 2.0).unwrap();
        assert_eq!(
            layout.ring_capacity,
            2000 * data_frame_size(8) + 2 * list_frame_size(1)
        );
        assert!(matches!(
            ArenaLayout::for_task(3, 1, 8, 0.0, 2.0),
            Err(SetupError::InvalidSampleTime { task_id: 3, .. })
        ));
    }

    #[test]
    fn test_minimum_frame_count() {
        let small = ArenaLayout::plan(1, 8, 1).unwrap();
        let three = ArenaLayout::plan(1, 8, MIN_RING_FRAMES).unwrap();
        assert_eq!(small, three);
    }

    #[test]
    fn test_oversized_arena_rejected() {
        assert!(matches!(
            ArenaLayout::plan(1, 1 << 20, 2048),
            Err(SetupError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_frame_sizes_are_aligned() {
        assert_eq!(data_frame_size(1) % FRAME_ALIGN, 0);
        assert_eq!(list_frame_size(3) % FRAME_ALIGN, 0);
        assert_eq!(data_frame_size(0), FRAME_HEADER_SIZE + DATA_HEADER_SIZE);
    }

    #[test]
    fn test_fresh_arena_state() {
        let layout = ArenaLayout::plan(4, 32, 4).unwrap();
        let arena = Arena::create(2, layout, &ArenaMemoryConfig::default()).unwrap();
        assert!(arena.header().is_magic_valid());
        assert_eq!(arena.header().task_id, 2);
        assert_eq!(arena.mailbox_slots().len(), 5);
        assert!(
            arena
                .mailbox_slots()
                .iter()
                .all(|s| s.load(Ordering::Relaxed) == 0)
        );

        let mut snap = Snapshot::default();
        assert!(arena.read_snapshot(&mut snap));
        assert_eq!(snap.head, None);
        assert!(snap.list.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let layout = ArenaLayout::plan(4, 32, 4).unwrap();
        let arena = Arena::create(0, layout, &ArenaMemoryConfig::default()).unwrap();

        arena.publish_snapshot(96, Some(48), Some(&[7, 2, 9]), 11);
        let mut snap = Snapshot::default();
        assert!(arena.read_snapshot(&mut snap));
        assert_eq!(snap.head, Some(96));
        assert_eq!(snap.list_pos, Some(48));
        assert_eq!(snap.list, vec![7, 2, 9]);
        assert_eq!(snap.last_seq, 11);

        // Head-only update keeps the list.
        arena.publish_snapshot(144, None, None, 12);
        assert!(arena.read_snapshot(&mut snap));
        assert_eq!(snap.head, Some(144));
        assert_eq!(snap.list, vec![7, 2, 9]);
    }
}
