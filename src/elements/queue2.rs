use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use super::queuecell::{PushOutcome, QueueCell, QueueItem, QueueLimits};
use crate::element::{Element, ElementCore, ElementState, PropertyValue, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::Event;
use crate::messages::{Bus, Message};
use crate::pad::{FlowReturn, Pad, PadDirection};

#[derive(Debug, Clone, Copy)]
struct Q2Options {
    use_buffering: bool,
    low_watermark: f64,
    high_watermark: f64,
    use_tags_bitrate: bool,
    use_rate_estimate: bool,
    ring_buffer_max_size: u64,
}

impl Default for Q2Options {
    fn default() -> Self {
        Self {
            use_buffering: false,
            low_watermark: 0.1,
            high_watermark: 0.99,
            use_tags_bitrate: false,
            use_rate_estimate: true,
            ring_buffer_max_size: 0,
        }
    }
}

/// Single-input single-output buffering queue with level reporting.
pub struct Queue2 {
    core: ElementCore,
    weak_self: Weak<Queue2>,
    sink: Pad,
    src: Pad,
    cell: Arc<QueueCell>,
    opts: Mutex<Q2Options>,
    bitrate: Mutex<Option<u64>>,
    eos: AtomicBool,
    last_percent: Mutex<Option<u32>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Queue2 {
    pub fn new(name: &str) -> Arc<Self> {
        let element = Arc::new_cyclic(|weak| Self {
            core: ElementCore::new(name, "queue2"),
            weak_self: weak.clone(),
            sink: Pad::new("sink", PadDirection::Sink),
            src: Pad::new("src", PadDirection::Src),
            cell: Arc::new(QueueCell::new(QueueLimits::default())),
            opts: Mutex::new(Q2Options::default()),
            bitrate: Mutex::new(None),
            eos: AtomicBool::new(false),
            last_percent: Mutex::new(None),
            thread: Mutex::new(None),
        });
        element.core.add_pad(&element.sink);
        element.core.add_pad(&element.src);

        let weak = element.weak_self.clone();
        element.sink.set_chain_fn(move |_pad, buffer| {
            let this = match weak.upgrade() {
                Some(t) => t,
                None => return FlowReturn::Flushing,
            };
            match this.cell.push_buffer_wait(buffer) {
                PushOutcome::Ok => {
                    this.maybe_post_buffering();
                    FlowReturn::Ok
                }
                PushOutcome::Flushing => FlowReturn::Flushing,
            }
        });

        let weak = element.weak_self.clone();
        element.sink.set_event_fn(move |_pad, event| {
            let this = match weak.upgrade() {
                Some(t) => t,
                None => return false,
            };
            if let Event::Tag(tags) = &event {
                if this.opts.lock().use_tags_bitrate {
                    if let Some(bitrate) = tags.bitrate {
                        *this.bitrate.lock() = Some(bitrate);
                    }
                }
            }
            match &event {
                Event::FlushStart => {
                    this.cell.set_flushing(true);
                    this.src.push_event(event.clone());
                }
                Event::FlushStop => {
                    this.cell.set_flushing(false);
                    this.cell.push_event(event.clone());
                }
                _ => this.cell.push_event(event.clone()),
            }
            true
        });
        element
    }

    pub fn sink_pad(&self) -> &Pad {
        &self.sink
    }

    pub fn src_pad(&self) -> &Pad {
        &self.src
    }

    /// Last bitrate learned from stream tags, when `use-tags-bitrate` is on.
    pub fn bitrate(&self) -> Option<u64> {
        *self.bitrate.lock()
    }

    pub fn set_use_buffering(&self, value: bool) {
        self.opts.lock().use_buffering = value;
    }

    pub fn set_watermarks(&self, low: f64, high: f64) {
        let mut opts = self.opts.lock();
        opts.low_watermark = low.clamp(0.0, 1.0);
        opts.high_watermark = high.clamp(0.0, 1.0).max(0.01);
    }

    pub fn watermarks(&self) -> (f64, f64) {
        let opts = self.opts.lock();
        (opts.low_watermark, opts.high_watermark)
    }

    pub fn uses_rate_estimate(&self) -> bool {
        self.opts.lock().use_rate_estimate
    }

    pub(crate) fn set_limits(&self, limits: QueueLimits) {
        self.cell.set_limits(limits);
    }

    pub(crate) fn current_limits(&self) -> QueueLimits {
        self.cell.limits()
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    pub fn current_percent(&self) -> Option<u32> {
        let opts = *self.opts.lock();
        if !opts.use_buffering {
            return None;
        }
        let fraction = self.cell.fill_fraction() / opts.high_watermark;
        Some((fraction * 100.0).min(100.0) as u32)
    }

    fn maybe_post_buffering(&self) {
        let percent = match self.current_percent() {
            Some(p) => p,
            None => return,
        };
        let percent = if self.eos.load(Ordering::SeqCst) { 100 } else { percent };
        let mut last = self.last_percent.lock();
        if *last != Some(percent) {
            *last = Some(percent);
            self.core.post_message(Message::Buffering {
                src: self.core.name().to_string(),
                percent,
            });
        }
    }

    fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        self.cell.set_flushing(false);
        let weak = self.weak_self.clone();
        let cell = self.cell.clone();
        let src = self.src.clone();
        let name = self.core.name().to_string();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match cell.pop() {
                    None => break,
                    Some(QueueItem::Buffer(buffer)) => {
                        let flow = src.push(buffer);
                        if let Some(this) = weak.upgrade() {
                            this.maybe_post_buffering();
                        }
                        if flow == FlowReturn::Flushing || flow == FlowReturn::Error {
                            break;
                        }
                    }
                    Some(QueueItem::Event(event)) => {
                        let is_eos = matches!(event, Event::Eos);
                        src.push_event(event);
                        if is_eos {
                            if let Some(this) = weak.upgrade() {
                                this.eos.store(true, Ordering::SeqCst);
                                this.maybe_post_buffering();
                            }
                            break;
                        }
                    }
                }
            })
            .expect("spawn queue2 pump thread");
        *guard = Some(handle);
    }

    fn stop(&self) {
        self.cell.set_flushing(true);
        self.src.set_active(false);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Element for Queue2 {
    fn name(&self) -> String {
        self.core.name().to_string()
    }

    fn factory_name(&self) -> String {
        self.core.factory_name().to_string()
    }

    fn set_state(&self, state: ElementState) -> Result<StateChange> {
        match state {
            ElementState::Paused | ElementState::Playing => {
                if let Some(this) = self.weak_self.upgrade() {
                    this.start();
                }
            }
            ElementState::Null => self.stop(),
            ElementState::Ready => {}
        }
        self.core.store_state(state);
        Ok(StateChange::Success)
    }

    fn state(&self) -> ElementState {
        self.core.state()
    }

    fn pads(&self) -> Vec<Pad> {
        self.core.pads()
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
        let mut limits = self.cell.limits();
        match name {
            "max-size-bytes" => limits.max_bytes = value.as_u64().unwrap_or(0),
            "max-size-buffers" => limits.max_buffers = value.as_u64().unwrap_or(0),
            "max-size-time" => limits.max_time = value.as_u64().unwrap_or(0),
            "use-buffering" => {
                self.set_use_buffering(value.as_bool().unwrap_or(false));
                return Ok(());
            }
            "use-tags-bitrate" => {
                self.opts.lock().use_tags_bitrate = value.as_bool().unwrap_or(false);
                return Ok(());
            }
            "use-rate-estimate" => {
                self.opts.lock().use_rate_estimate = value.as_bool().unwrap_or(true);
                return Ok(());
            }
            "ring-buffer-max-size" => {
                self.opts.lock().ring_buffer_max_size = value.as_u64().unwrap_or(0);
                return Ok(());
            }
            _ => {
                return Err(DecodeError::PropertySetting {
                    element: self.name(),
                    property: name.to_string(),
                })
            }
        }
        self.cell.set_limits(limits);
        Ok(())
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        let limits = self.cell.limits();
        match name {
            "max-size-bytes" => Some(PropertyValue::UInt64(limits.max_bytes)),
            "max-size-buffers" => Some(PropertyValue::UInt64(limits.max_buffers)),
            "max-size-time" => Some(PropertyValue::UInt64(limits.max_time)),
            "ring-buffer-max-size" => {
                Some(PropertyValue::UInt64(self.opts.lock().ring_buffer_max_size))
            }
            _ => None,
        }
    }

    fn set_bus(&self, bus: Option<Bus>) {
        self.core.set_bus(bus);
    }
}
