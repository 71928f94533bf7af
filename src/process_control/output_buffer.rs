/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::Notify;

/// Default number of lines retained per stream before the oldest lines are discarded.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct BufferState {
    lines: VecDeque<String>,
    /// Absolute index of `lines.front()` counted from the first line ever pushed.
    base: u64,
}

/// Line buffer fed by one stream reader. Bounded: once `capacity` lines are held the oldest is
/// dropped. Draining removes lines, so a later reader never sees them again.
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    notify: Notify,
}

/// Position in a buffer's absolute line numbering, used to scan for new lines without draining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(u64);

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BufferState {
                lines: VecDeque::new(),
                base: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        // a panicking writer cannot leave the deque half-updated, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, line: String) {
        {
            let mut state = self.state();
            state.lines.push_back(line);
            if state.lines.len() > self.capacity {
                state.lines.pop_front();
                state.base += 1;
            }
        }
        self.notify.notify_waiters();
    }

    /// Wakes anyone waiting on `changed` once the stream has ended.
    pub fn close(&self) {
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every buffered line in arrival order.
    pub fn drain(&self) -> Vec<String> {
        let mut state = self.state();
        let drained = state.lines.len() as u64;
        state.base += drained;
        state.lines.drain(..).collect()
    }

    /// Returns the lines pushed since `cursor` that are still buffered, without removing them,
    /// and advances the cursor past them.
    pub fn scan_from(&self, cursor: &mut Cursor) -> Vec<String> {
        let state = self.state();
        let start = cursor.0.max(state.base);
        let skip = (start - state.base) as usize;
        let lines: Vec<String> = state.lines.iter().skip(skip).cloned().collect();
        cursor.0 = state.base + state.lines.len() as u64;
        lines
    }

    /// Resolves when a new line is pushed or the stream closes.
    pub async fn changed(&self) {
        self.notify.notified().await
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_lines_are_dropped_once_capacity_is_reached() {
        let buffer = OutputBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }

        assert_eq!(buffer.drain(), ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn drained_lines_are_not_returned_twice() {
        let buffer = OutputBuffer::new(10);
        buffer.push("a".to_string());
        buffer.push("b".to_string());

        assert_eq!(buffer.drain(), ["a", "b"]);
        assert!(buffer.drain().is_empty());

        buffer.push("c".to_string());
        assert_eq!(buffer.drain(), ["c"]);
    }

    #[test]
    fn scanning_does_not_consume_lines() {
        let buffer = OutputBuffer::new(10);
        let mut cursor = Cursor::default();
        buffer.push("a".to_string());

        assert_eq!(buffer.scan_from(&mut cursor), ["a"]);
        assert!(buffer.scan_from(&mut cursor).is_empty());

        buffer.push("b".to_string());
        assert_eq!(buffer.scan_from(&mut cursor), ["b"]);
        assert_eq!(buffer.drain(), ["a", "b"]);
    }

    #[test]
    fn scan_skips_lines_that_were_drained_or_evicted() {
        let buffer = OutputBuffer::new(2);
        let mut cursor = Cursor::default();
        buffer.push("a".to_string());
        buffer.push("b".to_string());
        buffer.push("c".to_string());

        assert_eq!(buffer.scan_from(&mut cursor), ["b", "c"]);

        buffer.push("d".to_string());
        buffer.drain();
        buffer.push("e".to_string());
        assert_eq!(buffer.scan_from(&mut cursor), ["e"]);
    }
}
