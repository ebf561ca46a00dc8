use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caps::Caps;
use crate::error::DecodeError;

/// One alternative location offered by a redirecting source.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectCandidate {
    pub uri: String,
    pub minimum_bitrate: Option<u64>,
}

/// Asynchronous messages crossing the engine boundary.
#[derive(Debug, Clone)]
pub enum Message {
    Error {
        src: String,
        error: DecodeError,
    },
    Warning {
        src: String,
        text: String,
    },
    Buffering {
        src: String,
        percent: u32,
    },
    AsyncStart {
        src: String,
    },
    AsyncDone {
        src: String,
    },
    HaveType {
        src: String,
        caps: Caps,
    },
    Redirect {
        src: String,
        candidates: Vec<RedirectCandidate>,
    },
    /// Element-specific payload, e.g. the stream topology.
    Element {
        src: String,
        name: String,
        payload: serde_json::Value,
    },
    Eos {
        src: String,
    },
}

impl Message {
    pub fn src(&self) -> &str {
        match self {
            Message::Error { src, .. }
            | Message::Warning { src, .. }
            | Message::Buffering { src, .. }
            | Message::AsyncStart { src }
            | Message::AsyncDone { src }
            | Message::HaveType { src, .. }
            | Message::Redirect { src, .. }
            | Message::Element { src, .. }
            | Message::Eos { src } => src,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

/// Returns true to swallow the message before it reaches the queue.
type Interceptor = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

struct BusInner {
    queue: Mutex<VecDeque<Message>>,
    cond: Condvar,
    interceptors: Mutex<Vec<(InterceptorId, Interceptor)>>,
    next_interceptor: AtomicU64,
}

/// Message bus: unbounded queue plus sync interceptors used by the
/// autoplug error filter.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                interceptors: Mutex::new(Vec::new()),
                next_interceptor: AtomicU64::new(1),
            }),
        }
    }

    pub fn post(&self, message: Message) {
        let interceptors: Vec<Interceptor> = {
            let guard = self.inner.interceptors.lock();
            guard.iter().map(|(_, i)| i.clone()).collect()
        };
        for interceptor in interceptors {
            if interceptor(&message) {
                return;
            }
        }
        self.inner.queue.lock().push_back(message);
        self.inner.cond.notify_all();
    }

    pub fn pop(&self) -> Option<Message> {
        self.inner.queue.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn clear(&self) {
        self.inner.queue.lock().clear();
    }

    /// All currently queued messages, without consuming them.
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.queue.lock().iter().cloned().collect()
    }

    pub fn timed_pop(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.inner.cond.wait_for(&mut queue, deadline - now);
        }
    }

    /// Pops the first message matching `pred`, discarding nothing else.
    /// Non-matching messages stay queued in order.
    pub fn timed_pop_filtered<F>(&self, timeout: Duration, pred: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(pos) = queue.iter().position(&pred) {
                return queue.remove(pos);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.inner.cond.wait_for(&mut queue, deadline - now);
        }
    }

    /// Installs a sync interceptor; returns its handle for removal.
    pub fn add_interceptor<F>(&self, f: F) -> InterceptorId
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let id = InterceptorId(self.inner.next_interceptor.fetch_add(1, Ordering::Relaxed));
        self.inner.interceptors.lock().push((id, Arc::new(f)));
        id
    }

    pub fn remove_interceptor(&self, id: InterceptorId) {
        self.inner.interceptors.lock().retain(|(i, _)| *i != id);
    }
}
