//! Send queue entry (component C): one pending outbound buffer plus how
//! much of it has already been drained to the kernel.

use std::collections::VecDeque;

use bytes::Bytes;

/// One buffer sitting in a connection's outbound queue. `drained` never
/// exceeds `buf.len()`; once it does, `is_drained` is true and the entry is
/// dropped by the queue.
pub(crate) struct SendQueueEntry {
    buf: Bytes,
    drained: usize,
}

impl SendQueueEntry {
    pub(crate) fn new(buf: Bytes) -> SendQueueEntry {
        SendQueueEntry { buf, drained: 0 }
    }

    /// The bytes not yet handed to the kernel.
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.buf[self.drained..]
    }

    /// Record that `n` more bytes were accepted by the kernel.
    pub(crate) fn advance(&mut self, n: usize) {
        self.drained += n;
        debug_assert!(self.drained <= self.buf.len());
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.drained >= self.buf.len()
    }
}

/// FIFO of entries the kernel would not yet accept.
#[derive(Default)]
pub(crate) struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
}

impl SendQueue {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, buf: Bytes) {
        self.entries.push_back(SendQueueEntry::new(buf));
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut SendQueueEntry> {
        self.entries.front_mut()
    }

    pub(crate) fn pop_front(&mut self) {
        self.entries.pop_front();
    }

    /// Total unsent bytes across every queued entry; used by tests and by
    /// callers inspecting backpressure.
    #[cfg(test)]
    pub(crate) fn len_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.remaining().len()).sum()
    }
}
