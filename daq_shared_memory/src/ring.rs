//! Frame ring: variable-length frames chained by logical position.
//!
//! A position is a monotonically increasing byte count; the physical offset
//! of a frame is `pos % ring_capacity`. A frame never straddles the end of the
//! ring: when it does not fit in the remaining contiguous space the writer
//! skips to the start of the next lap, so a link that jumps back to the ring
//! base is the wrap discontinuity.
//!
//! Frame bytes are overwritten in place. Before touching a frame the writer
//! publishes the end of that frame in [`ArenaHeader::reserved`]; a reader that
//! copied a frame at `pos` accepts the copy only if `reserved <= pos + capacity`
//! afterwards. Otherwise the frame was (possibly partially) reused and the
//! reader resynchronizes from the snapshot.
//!
//! [`ArenaHeader::reserved`]: crate::arena::ArenaHeader::reserved

use crate::arena::{Arena, DATA_HEADER_SIZE, FRAME_HEADER_SIZE, LIST_HEADER_SIZE, align_up};
use daq::consts::FRAME_ALIGN;
use daq::timestamp::Timestamp;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Kind tag of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    /// `{count: u32, indices: [u32; count]}`
    SignalList = 1,
    /// `{seq: u32, nsec: u32, sec: i64, values...}`
    SignalData = 2,
}

impl FrameKind {
    /// Decode a raw tag.
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::SignalList),
            2 => Some(Self::SignalData),
            _ => None,
        }
    }
}

/// In-ring frame header.
#[repr(C)]
struct FrameHeader {
    /// Position + 1 of the following frame, 0 while this is the newest frame
    next: AtomicU64,
    /// Own position, for validation
    pos: u64,
    kind: u32,
    /// Payload bytes
    len: u32,
}

const_assert_eq!(core::mem::size_of::<FrameHeader>(), FRAME_HEADER_SIZE);
const_assert_eq!(FRAME_HEADER_SIZE % FRAME_ALIGN, 0);

#[inline]
fn header_ptr(arena: &Arena, pos: u64) -> *mut FrameHeader {
    let phys = (pos % arena.ring_capacity() as u64) as usize;
    debug_assert!(phys + FRAME_HEADER_SIZE <= arena.ring_capacity());
    debug_assert_eq!(phys % FRAME_ALIGN, 0);
    unsafe { arena.ring_ptr().add(phys) as *mut FrameHeader }
}

/// Whether the frame at `pos` has not been reused yet.
///
/// Must be called after the frame bytes were read.
#[inline]
fn is_intact(arena: &Arena, pos: u64) -> bool {
    fence(Ordering::Acquire);
    let reserved = arena.header().reserved.load(Ordering::Relaxed);
    reserved <= pos + arena.ring_capacity() as u64
}

/// Producer side of the ring. Owned by the task's real-time thread.
#[derive(Debug, Default)]
pub struct RingWriter {
    write_pos: u64,
    last: Option<u64>,
    wraps: u64,
}

impl RingWriter {
    /// Writer starting at position 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of the newest frame.
    #[inline]
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Times the writer skipped back to the ring base.
    #[inline]
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Append one frame and link it behind the previous one.
    ///
    /// `fill` receives exactly `payload_len` bytes. Never blocks and never
    /// allocates. Returns the new frame's position.
    pub fn append(
        &mut self,
        arena: &Arena,
        kind: FrameKind,
        payload_len: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> u64 {
        let capacity = arena.ring_capacity() as u64;
        let total = align_up(FRAME_HEADER_SIZE + payload_len, FRAME_ALIGN) as u64;
        debug_assert!(total <= capacity, "frame larger than ring");

        let mut pos = self.write_pos;
        let phys = pos % capacity;
        if phys + total > capacity {
            pos += capacity - phys;
            self.wraps += 1;
        }

        // Claim the bytes before touching them.
        let header = arena.header();
        header.reserved.store(pos + total, Ordering::Relaxed);
        fence(Ordering::Release);

        let frame = header_ptr(arena, pos);
        unsafe {
            (*frame).next.store(0, Ordering::Relaxed);
            std::ptr::addr_of_mut!((*frame).pos).write(pos);
            std::ptr::addr_of_mut!((*frame).kind).write(kind as u32);
            std::ptr::addr_of_mut!((*frame).len).write(payload_len as u32);
            let payload = std::slice::from_raw_parts_mut(
                (frame as *mut u8).add(FRAME_HEADER_SIZE),
                payload_len,
            );
            fill(payload);
        }

        // The previous frame's header is gone if this frame reused its bytes.
        if let Some(prev) = self.last {
            if pos + total <= prev + capacity {
                unsafe {
                    (*header_ptr(arena, prev))
                        .next
                        .store(pos + 1, Ordering::Release);
                }
            }
        }

        let written = header.frames_written.load(Ordering::Relaxed);
        header.frames_written.store(written + 1, Ordering::Relaxed);

        self.last = Some(pos);
        self.write_pos = pos + total;
        pos
    }
}

/// Result of following a frame's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// No newer frame yet
    End,
    /// Position of the next frame
    Next(u64),
    /// The frame was overwritten; its link is meaningless
    Lost,
}

/// Read the `next` link of the frame at `pos`.
pub fn next_link(arena: &Arena, pos: u64) -> Link {
    let next = unsafe { (*header_ptr(arena, pos)).next.load(Ordering::Acquire) };
    if !is_intact(arena, pos) {
        return Link::Lost;
    }
    match next {
        0 => Link::End,
        n if n - 1 > pos => Link::Next(n - 1),
        _ => Link::Lost,
    }
}

/// Copy the frame at `pos` into `scratch` (payload only).
///
/// Returns `None` when the frame was overwritten during or before the copy.
pub fn read_frame(arena: &Arena, pos: u64, scratch: &mut Vec<u8>) -> Option<FrameKind> {
    let capacity = arena.ring_capacity();
    let frame = header_ptr(arena, pos);
    let phys = (pos % capacity as u64) as usize;

    let (own_pos, raw_kind, len) = unsafe {
        (
            std::ptr::addr_of!((*frame).pos).read_volatile(),
            std::ptr::addr_of!((*frame).kind).read_volatile(),
            std::ptr::addr_of!((*frame).len).read_volatile() as usize,
        )
    };

    // A torn header shows up as garbage here; the lap check below decides.
    let plausible = own_pos == pos && phys + FRAME_HEADER_SIZE + len <= capacity;
    if plausible {
        scratch.clear();
        scratch.resize(len, 0);
        unsafe {
            std::ptr::copy_nonoverlapping(
                (frame as *const u8).add(FRAME_HEADER_SIZE),
                scratch.as_mut_ptr(),
                len,
            );
        }
    }

    if !is_intact(arena, pos) || !plausible {
        return None;
    }
    FrameKind::from_raw(raw_kind)
}

/// Write the fixed part of a `SignalData` payload.
#[inline]
pub fn encode_data_header(out: &mut [u8], seq: u32, timestamp: Timestamp) {
    out[0..4].copy_from_slice(&seq.to_ne_bytes());
    out[4..8].copy_from_slice(&timestamp.nsec.to_ne_bytes());
    out[8..16].copy_from_slice(&timestamp.sec.to_ne_bytes());
}

/// Split a `SignalData` payload into sequence number, timestamp and values.
pub fn decode_data(payload: &[u8]) -> Option<(u32, Timestamp, &[u8])> {
    if payload.len() < DATA_HEADER_SIZE {
        return None;
    }
    let seq = u32::from_ne_bytes(payload[0..4].try_into().ok()?);
    let nsec = u32::from_ne_bytes(payload[4..8].try_into().ok()?);
    let sec = i64::from_ne_bytes(payload[8..16].try_into().ok()?);
    Some((seq, Timestamp { sec, nsec }, &payload[DATA_HEADER_SIZE..]))
}

/// Write a `SignalList` payload.
#[inline]
pub fn encode_list(out: &mut [u8], list: &[u32]) {
    out[0..4].copy_from_slice(&(list.len() as u32).to_ne_bytes());
    for (chunk, index) in out[LIST_HEADER_SIZE..].chunks_exact_mut(4).zip(list) {
        chunk.copy_from_slice(&index.to_ne_bytes());
    }
}

/// Decode a `SignalList` payload into `out`.
pub fn decode_list(payload: &[u8], out: &mut Vec<u32>) -> bool {
    if payload.len() < LIST_HEADER_SIZE {
        return false;
    }
    let count = u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let body = &payload[LIST_HEADER_SIZE..];
    if body.len() < count * 4 {
        return false;
    }
    out.clear();
    out.extend(
        body.chunks_exact(4)
            .take(count)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
    );
    true
}

/// Payload bytes of a list frame with `count` entries.
#[inline]
pub const fn list_payload_len(count: usize) -> usize {
    LIST_HEADER_SIZE + 4 * count
}

/// Payload bytes of a data frame carrying `value_bytes`.
#[inline]
pub const fn data_payload_len(value_bytes: usize) -> usize {
    DATA_HEADER_SIZE + value_bytes
}
