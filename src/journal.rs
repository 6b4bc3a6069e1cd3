//! Metadata journal: log segments, safe-commit waiters, trim and expiry.
//!
//! The journal appends events to an open segment backed by the object
//! store. Flushing advances the safe position and completes registered
//! safe-waiters strictly in registration order. Sealed segments move
//! through expiring → expired → trimmed; the journal header records the
//! trim point for readers.

use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::debug;

/// Segments are trimmed down to this count by the periodic trim.
const DEFAULT_MAX_SEGMENTS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Open,
    Sealed,
    Expiring,
    Expired,
}

/// One journal segment.
pub struct LogSegment {
    seq: u64,
    start_pos: u64,
    end_pos: u64,
    events: u64,
    state: SegmentState,
    expiry_waiters: Vec<oneshot::Sender<()>>,
}

impl LogSegment {
    fn new(seq: u64, start_pos: u64) -> Self {
        Self {
            seq,
            start_pos,
            end_pos: start_pos,
            events: 0,
            state: SegmentState::Open,
            expiry_waiters: Vec::new(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// The metadata journal.
pub struct Journal {
    segments: VecDeque<LogSegment>,
    next_seq: u64,
    write_pos: u64,
    safe_pos: u64,
    expire_pos: u64,
    trim_pos: u64,
    header_pos: u64,
    safe_waiters: VecDeque<oneshot::Sender<i32>>,
    max_segments: usize,
    flushes: u64,
    created: bool,
    stopped: bool,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            next_seq: 1,
            write_pos: 0,
            safe_pos: 0,
            expire_pos: 0,
            trim_pos: 0,
            header_pos: 0,
            safe_waiters: VecDeque::new(),
            max_segments: DEFAULT_MAX_SEGMENTS,
            flushes: 0,
            created: false,
            stopped: false,
        }
    }

    /// Write an empty journal with its first segment.
    pub fn create(&mut self) {
        if self.created {
            return;
        }
        self.created = true;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.segments.push_back(LogSegment::new(seq, self.write_pos));
        debug!("journal created");
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Append one event of `len` bytes to the open segment.
    pub fn submit_event(&mut self, len: u64) {
        if self.stopped {
            return;
        }
        if !self.created {
            self.create();
        }
        self.write_pos += len;
        if let Some(seg) = self.segments.back_mut() {
            seg.events += 1;
            seg.end_pos = self.write_pos;
        }
    }

    /// Seal the open segment and start a new one.
    pub fn start_new_segment(&mut self) {
        if self.stopped {
            return;
        }
        if !self.created {
            self.create();
            return;
        }
        if let Some(seg) = self.segments.back_mut() {
            seg.state = SegmentState::Sealed;
            seg.end_pos = self.write_pos;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.segments.push_back(LogSegment::new(seq, self.write_pos));
    }

    /// Register for completion of the next safe-commit.
    ///
    /// Waiters complete strictly in registration order, carrying the usual
    /// zero-or-negative-errno result.
    pub fn wait_for_safe(&mut self) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        if self.stopped {
            let _ = tx.send(-libc::ESHUTDOWN);
        } else {
            self.safe_waiters.push_back(tx);
        }
        rx
    }

    /// Commit everything written so far and complete safe-waiters in order.
    pub fn flush(&mut self) {
        if self.stopped {
            return;
        }
        self.flushes += 1;
        self.safe_pos = self.write_pos;
        while let Some(tx) = self.safe_waiters.pop_front() {
            let _ = tx.send(0);
        }
        self.advance_expiry();
    }

    /// Move every sealed segment into the expiring state; already-safe
    /// segments expire immediately.
    pub fn trim_all(&mut self) -> i32 {
        if self.stopped {
            return -libc::ESHUTDOWN;
        }
        for seg in self.segments.iter_mut() {
            if seg.state == SegmentState::Sealed {
                seg.state = SegmentState::Expiring;
            }
        }
        self.advance_expiry();
        0
    }

    fn advance_expiry(&mut self) {
        let safe_pos = self.safe_pos;
        let mut expire_pos = self.expire_pos;
        for seg in self.segments.iter_mut() {
            if seg.state == SegmentState::Expiring && seg.end_pos <= safe_pos {
                seg.state = SegmentState::Expired;
                expire_pos = expire_pos.max(seg.end_pos);
                for tx in seg.expiry_waiters.drain(..) {
                    let _ = tx.send(());
                }
            }
        }
        self.expire_pos = expire_pos;
    }

    /// Sequence numbers of segments still expiring.
    pub fn expiring_segments(&self) -> Vec<u64> {
        self.segments
            .iter()
            .filter(|s| s.state == SegmentState::Expiring)
            .map(|s| s.seq)
            .collect()
    }

    /// Register for a segment's expiry. Completes immediately if the
    /// segment has already expired or been trimmed. Expiry cannot fail.
    pub fn wait_for_expiry(&mut self, seq: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        match self.segments.iter_mut().find(|s| s.seq == seq) {
            Some(seg) if seg.state != SegmentState::Expired => {
                seg.expiry_waiters.push(tx);
            }
            _ => {
                let _ = tx.send(());
            }
        }
        rx
    }

    /// Drop expired segments from the front, advancing the trim position.
    pub fn trim_expired_segments(&mut self) {
        while let Some(front) = self.segments.front() {
            if front.state != SegmentState::Expired {
                break;
            }
            let seg = self.segments.pop_front().expect("front exists");
            self.trim_pos = self.trim_pos.max(seg.end_pos);
            debug!(seq = seg.seq, trim_pos = self.trim_pos, "journal segment trimmed");
        }
    }

    /// Write the journal header so readers start after the trimmed region.
    pub fn write_head(&mut self) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        if self.stopped {
            let _ = tx.send(-libc::ESHUTDOWN);
        } else {
            self.header_pos = self.trim_pos;
            let _ = tx.send(0);
        }
        rx
    }

    /// Periodic trim: expire and drop what we can, respecting the segment cap.
    pub fn trim(&mut self) {
        if self.stopped {
            return;
        }
        if self.segments.len() > self.max_segments {
            self.trim_all();
        }
        self.advance_expiry();
        self.trim_expired_segments();
    }

    pub fn shutdown(&mut self) {
        self.stopped = true;
        while let Some(tx) = self.safe_waiters.pop_front() {
            let _ = tx.send(-libc::ESHUTDOWN);
        }
        for seg in self.segments.iter_mut() {
            for tx in seg.expiry_waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    pub fn safe_pos(&self) -> u64 {
        self.safe_pos
    }

    pub fn expire_pos(&self) -> u64 {
        self.expire_pos
    }

    pub fn trim_pos(&self) -> u64 {
        self.trim_pos
    }

    pub fn header_pos(&self) -> u64 {
        self.header_pos
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}
