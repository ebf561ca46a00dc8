use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::element::{Element, ElementCore, ElementState, StateChange};
use crate::error::Result;
use crate::event::{Buffer, Event};
use crate::pad::{FlowReturn, Pad, PadDirection};

/// Records everything it receives. Test aid.
pub struct FakeSink {
    core: ElementCore,
    sink: Pad,
    buffers: Arc<Mutex<Vec<Buffer>>>,
    events: Arc<Mutex<Vec<Event>>>,
    eos: Arc<AtomicBool>,
}

impl FakeSink {
    pub fn new(name: &str) -> Arc<Self> {
        let buffers = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let eos = Arc::new(AtomicBool::new(false));
        let element = Arc::new(Self {
            core: ElementCore::new(name, "fakesink"),
            sink: Pad::new("sink", PadDirection::Sink),
            buffers: buffers.clone(),
            events: events.clone(),
            eos: eos.clone(),
        });
        element.core.add_pad(&element.sink);

        let b = buffers.clone();
        element.sink.set_chain_fn(move |_, buffer| {
            b.lock().push(buffer);
            FlowReturn::Ok
        });
        let e = events.clone();
        let flag = eos.clone();
        element.sink.set_event_fn(move |_, event| {
            if matches!(event, Event::Eos) {
                flag.store(true, Ordering::SeqCst);
            }
            e.lock().push(event);
            true
        });
        element
    }

    pub fn sink_pad(&self) -> &Pad {
        &self.sink
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn byte_count(&self) -> usize {
        self.buffers.lock().iter().map(|b| b.len()).sum()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn eos_received(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    pub fn wait_buffers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.buffer_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.buffer_count() >= count
    }

    pub fn wait_eos(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.eos_received() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.eos_received()
    }
}

impl Element for FakeSink {
    fn name(&self) -> String {
        self.core.name().to_string()
    }

    fn factory_name(&self) -> String {
        self.core.factory_name().to_string()
    }

    fn set_state(&self, state: ElementState) -> Result<StateChange> {
        self.core.store_state(state);
        Ok(StateChange::Success)
    }

    fn state(&self) -> ElementState {
        self.core.state()
    }

    fn pads(&self) -> Vec<Pad> {
        self.core.pads()
    }
}
