use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

#[derive(Debug)]
struct Ring {
    next_seq: u64,
    capacity: usize,
    lines: VecDeque<(u64, String)>,
}

/// Bounded FIFO of the most recent console lines.
///
/// Pushed from synchronous lifecycle hooks, so it uses a blocking mutex; the
/// critical sections never await.
#[derive(Debug)]
pub struct OutputHistory {
    inner: Mutex<Ring>,
}

impl OutputHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Ring {
                next_seq: 1,
                capacity,
                lines: VecDeque::with_capacity(capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // A panicking writer cannot leave the ring half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a line, evicting the oldest once capacity is reached. Returns
    /// the sequence number assigned to the line.
    pub fn push(&self, line: impl Into<String>) -> u64 {
        let mut ring = self.lock();
        let seq = ring.next_seq;
        ring.next_seq = ring.next_seq.saturating_add(1);
        ring.lines.push_back((seq, line.into()));
        while ring.lines.len() > ring.capacity {
            ring.lines.pop_front();
        }
        seq
    }

    /// Point-in-time copy, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().lines.iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Lines newer than `cursor`, at most `limit`, plus the cursor to pass next
    /// time. A zero cursor returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let ring = self.lock();
        if cursor == 0 {
            let start = ring.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in ring.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in ring.lines.iter().filter(|(seq, _)| *seq > cursor) {
            out.push(line.clone());
            last = *seq;
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }
}
