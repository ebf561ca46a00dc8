use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

use crate::event::{Buffer, Event};

#[derive(Debug)]
pub(crate) enum QueueItem {
    Buffer(Buffer),
    Event(Event),
}

/// Byte/buffer/time limits; 0 means unlimited on that axis.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QueueLimits {
    pub max_bytes: u64,
    pub max_buffers: u64,
    pub max_time: u64,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    bytes: u64,
    buffers: u64,
    time: u64,
    limits: QueueLimits,
    flushing: bool,
}

/// The bounded FIFO shared by the queueing elements: producers block when
/// full, the pump thread blocks when empty, flushing releases both sides.
pub(crate) struct QueueCell {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Ok,
    Flushing,
}

impl QueueCell {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                bytes: 0,
                buffers: 0,
                time: 0,
                limits,
                flushing: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn set_limits(&self, limits: QueueLimits) {
        self.state.lock().limits = limits;
        self.not_full.notify_all();
    }

    pub fn limits(&self) -> QueueLimits {
        self.state.lock().limits
    }

    fn is_full(state: &QueueState) -> bool {
        let l = &state.limits;
        (l.max_bytes > 0 && state.bytes >= l.max_bytes)
            || (l.max_buffers > 0 && state.buffers >= l.max_buffers)
            || (l.max_time > 0 && state.time >= l.max_time)
    }

    /// Fill level as a fraction of the tightest limit; unlimited axes do
    /// not contribute.
    pub fn fill_fraction(&self) -> f64 {
        let state = self.state.lock();
        let l = &state.limits;
        let mut fraction: f64 = 0.0;
        if l.max_bytes > 0 {
            fraction = fraction.max(state.bytes as f64 / l.max_bytes as f64);
        }
        if l.max_buffers > 0 {
            fraction = fraction.max(state.buffers as f64 / l.max_buffers as f64);
        }
        if l.max_time > 0 {
            fraction = fraction.max(state.time as f64 / l.max_time as f64);
        }
        fraction.min(1.0)
    }

    /// True when the next buffer push would have to wait.
    pub fn would_overrun(&self) -> bool {
        let state = self.state.lock();
        Self::is_full(&state)
    }

    /// Blocks until the queue has room, then enqueues.
    pub fn push_buffer_wait(&self, buffer: Buffer) -> PushOutcome {
        let mut state = self.state.lock();
        while Self::is_full(&state) && !state.flushing {
            self.not_full.wait(&mut state);
        }
        if state.flushing {
            return PushOutcome::Flushing;
        }
        state.bytes += buffer.data.len() as u64;
        state.buffers += 1;
        state.time += buffer.duration.unwrap_or(0);
        state.items.push_back(QueueItem::Buffer(buffer));
        drop(state);
        self.not_empty.notify_all();
        PushOutcome::Ok
    }

    /// Events are never refused.
    pub fn push_event(&self, event: Event) {
        let mut state = self.state.lock();
        if state.flushing && event != Event::FlushStop {
            return;
        }
        state.items.push_back(QueueItem::Event(event));
        drop(state);
        self.not_empty.notify_all();
    }

    /// Pops the next item, blocking until one arrives or the cell flushes.
    pub fn pop(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                if let QueueItem::Buffer(b) = &item {
                    state.bytes -= b.data.len() as u64;
                    state.buffers -= 1;
                    state.time = state.time.saturating_sub(b.duration.unwrap_or(0));
                }
                drop(state);
                self.not_full.notify_all();
                return Some(item);
            }
            if state.flushing {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock();
        state.flushing = flushing;
        if flushing {
            state.items.clear();
            state.bytes = 0;
            state.buffers = 0;
            state.time = 0;
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_limits_block_and_release() {
        let cell = Arc::new(QueueCell::new(QueueLimits {
            max_buffers: 2,
            ..Default::default()
        }));
        assert_eq!(cell.push_buffer_wait(Buffer::new(vec![0])), PushOutcome::Ok);
        assert_eq!(cell.push_buffer_wait(Buffer::new(vec![1])), PushOutcome::Ok);
        assert!(cell.would_overrun());

        let c = cell.clone();
        let handle = std::thread::spawn(move || c.push_buffer_wait(Buffer::new(vec![2])));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!handle.is_finished());

        cell.pop();
        assert_eq!(handle.join().unwrap(), PushOutcome::Ok);
    }

    #[test]
    fn test_flush_releases_producer() {
        let cell = Arc::new(QueueCell::new(QueueLimits {
            max_bytes: 1,
            ..Default::default()
        }));
        cell.push_buffer_wait(Buffer::new(vec![0, 1]));
        let c = cell.clone();
        let handle = std::thread::spawn(move || c.push_buffer_wait(Buffer::new(vec![2])));
        std::thread::sleep(Duration::from_millis(10));
        cell.set_flushing(true);
        assert_eq!(handle.join().unwrap(), PushOutcome::Flushing);
        assert!(cell.is_empty());
    }

    #[test]
    fn test_fill_fraction() {
        let cell = QueueCell::new(QueueLimits {
            max_bytes: 100,
            ..Default::default()
        });
        cell.push_buffer_wait(Buffer::new(vec![0u8; 50]));
        assert!((cell.fill_fraction() - 0.5).abs() < f64::EPSILON);
    }
}
