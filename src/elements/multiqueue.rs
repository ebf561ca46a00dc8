use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use super::queuecell::{PushOutcome, QueueCell, QueueItem, QueueLimits};
use crate::element::{Element, ElementCore, ElementState, PropertyValue, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::Event;
use crate::messages::{Bus, Message};
use crate::pad::{FlowReturn, Pad, PadDirection};

#[derive(Debug, Clone, Copy)]
struct MqOptions {
    use_buffering: bool,
    low_watermark: f64,
    high_watermark: f64,
    use_interleave: bool,
    sync_by_running_time: bool,
}

impl Default for MqOptions {
    fn default() -> Self {
        Self {
            use_buffering: false,
            low_watermark: 0.1,
            high_watermark: 0.99,
            use_interleave: false,
            sync_by_running_time: false,
        }
    }
}

pub struct MqSlot {
    id: usize,
    sink: Pad,
    src: Pad,
    cell: Arc<QueueCell>,
    eos: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// N-in N-out queue: each requested sink pad gets a paired src pad fed by
/// its own pump thread, with aggregated buffering reporting and an overrun
/// signal.
pub struct MultiQueue {
    core: ElementCore,
    weak_self: Weak<MultiQueue>,
    slots: Mutex<Vec<Arc<MqSlot>>>,
    limits: Mutex<QueueLimits>,
    opts: Mutex<MqOptions>,
    overrun_cbs: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    next_slot: AtomicUsize,
    last_percent: Mutex<Option<u32>>,
}

impl MultiQueue {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: ElementCore::new(name, "multiqueue"),
            weak_self: weak.clone(),
            slots: Mutex::new(Vec::new()),
            limits: Mutex::new(QueueLimits::default()),
            opts: Mutex::new(MqOptions::default()),
            overrun_cbs: Mutex::new(Vec::new()),
            next_slot: AtomicUsize::new(0),
            last_percent: Mutex::new(None),
        })
    }

    pub fn on_overrun<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.overrun_cbs.lock().push(Box::new(cb));
    }

    pub fn clear_overrun_callbacks(&self) {
        self.overrun_cbs.lock().clear();
    }

    fn fire_overrun(&self) {
        log::debug!("{}: overrun", self.core.name());
        let cbs = self.overrun_cbs.lock();
        for cb in cbs.iter() {
            cb();
        }
    }

    pub(crate) fn set_limits(&self, limits: QueueLimits) {
        *self.limits.lock() = limits;
        for slot in self.slots.lock().iter() {
            slot.cell.set_limits(limits);
        }
    }


    pub fn set_use_buffering(&self, value: bool) {
        self.opts.lock().use_buffering = value;
    }

    pub fn set_watermarks(&self, low: f64, high: f64) {
        let mut opts = self.opts.lock();
        opts.low_watermark = low.clamp(0.0, 1.0);
        opts.high_watermark = high.clamp(0.0, 1.0).max(0.01);
    }

    pub fn set_use_interleave(&self, value: bool) {
        self.opts.lock().use_interleave = value;
    }

    pub fn is_interleaved(&self) -> bool {
        self.opts.lock().use_interleave
    }

    pub fn set_sync_by_running_time(&self, value: bool) {
        self.opts.lock().sync_by_running_time = value;
    }

    pub fn syncs_by_running_time(&self) -> bool {
        self.opts.lock().sync_by_running_time
    }

    pub fn watermarks(&self) -> (f64, f64) {
        let opts = self.opts.lock();
        (opts.low_watermark, opts.high_watermark)
    }

    /// Requests a new sink/src slot pair.
    pub fn request_slot(self: &Arc<Self>) -> Arc<MqSlot> {
        let id = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let sink = Pad::new(format!("sink_{}", id), PadDirection::Sink);
        let src = Pad::new(format!("src_{}", id), PadDirection::Src);
        sink.set_parent_name(self.core.name());
        src.set_parent_name(self.core.name());
        let cell = Arc::new(QueueCell::new(*self.limits.lock()));
        let slot = Arc::new(MqSlot {
            id,
            sink: sink.clone(),
            src,
            cell: cell.clone(),
            eos: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(self);
        let chain_cell = cell.clone();
        sink.set_chain_fn(move |_pad, buffer| {
            if chain_cell.would_overrun() {
                if let Some(mq) = weak.upgrade() {
                    mq.fire_overrun();
                }
            }
            match chain_cell.push_buffer_wait(buffer) {
                PushOutcome::Ok => {
                    if let Some(mq) = weak.upgrade() {
                        mq.maybe_post_buffering();
                    }
                    FlowReturn::Ok
                }
                PushOutcome::Flushing => FlowReturn::Flushing,
            }
        });

        let event_cell = cell.clone();
        let event_src = slot.src.clone();
        sink.set_event_fn(move |_pad, event| {
            match &event {
                Event::FlushStart => {
                    event_cell.set_flushing(true);
                    event_src.push_event(event.clone());
                }
                Event::FlushStop => {
                    event_cell.set_flushing(false);
                    event_cell.push_event(event.clone());
                }
                _ => event_cell.push_event(event.clone()),
            }
            true
        });

        self.slots.lock().push(slot.clone());
        if self.state() >= ElementState::Paused {
            self.start_slot(&slot);
        }
        slot
    }

    fn start_slot(self: &Arc<Self>, slot: &Arc<MqSlot>) {
        let mut guard = slot.thread.lock();
        if guard.is_some() {
            return;
        }
        let cell = slot.cell.clone();
        let src = slot.src.clone();
        let slot_ref = slot.clone();
        let weak = Arc::downgrade(self);
        let name = format!("{}:src_{}", self.core.name(), slot.id);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                // Hold delivery until the pad is wired into the chain being
                // built downstream (or held by a probe), or queued data
                // would be lost.
                if !src.is_linked() && !src.is_flushing() && src.num_probes() == 0 {
                    if cell.is_empty() && slot_ref.eos.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                match cell.pop() {
                    None => break,
                    Some(QueueItem::Buffer(buffer)) => {
                        let flow = src.push(buffer);
                        if let Some(mq) = weak.upgrade() {
                            mq.maybe_post_buffering();
                        }
                        if flow == FlowReturn::Flushing || flow == FlowReturn::Error {
                            break;
                        }
                    }
                    Some(QueueItem::Event(event)) => {
                        let is_eos = matches!(event, Event::Eos);
                        src.push_event(event);
                        if is_eos {
                            slot_ref.eos.store(true, Ordering::SeqCst);
                            if let Some(mq) = weak.upgrade() {
                                mq.maybe_post_buffering();
                            }
                            break;
                        }
                    }
                }
            })
            .expect("spawn multiqueue pump thread");
        *guard = Some(handle);
    }

    fn stop_slots(&self) {
        let slots = self.slots.lock().clone();
        for slot in &slots {
            slot.cell.set_flushing(true);
            slot.src.set_active(false);
        }
        for slot in &slots {
            if let Some(handle) = slot.thread.lock().take() {
                let _ = handle.join();
            }
        }
    }

    /// Aggregated buffering level: the lowest fill among slots that have
    /// not seen EOS.
    fn aggregate_percent(&self) -> Option<u32> {
        let opts = *self.opts.lock();
        if !opts.use_buffering {
            return None;
        }
        let slots = self.slots.lock();
        let mut min_percent: Option<u32> = None;
        for slot in slots.iter() {
            if slot.eos.load(Ordering::SeqCst) {
                continue;
            }
            let fraction = slot.cell.fill_fraction() / opts.high_watermark;
            let percent = (fraction * 100.0).min(100.0) as u32;
            min_percent = Some(match min_percent {
                Some(p) => p.min(percent),
                None => percent,
            });
        }
        min_percent
    }

    fn maybe_post_buffering(&self) {
        if let Some(percent) = self.aggregate_percent() {
            let mut last = self.last_percent.lock();
            if *last != Some(percent) {
                *last = Some(percent);
                self.core.post_message(Message::Buffering {
                    src: self.core.name().to_string(),
                    percent,
                });
            }
        }
    }

    pub fn slot_for_sink(&self, sink: &Pad) -> Option<Arc<MqSlot>> {
        self.slots.lock().iter().find(|s| &s.sink == sink).cloned()
    }

    pub fn src_for_sink(&self, sink: &Pad) -> Option<Pad> {
        self.slot_for_sink(sink).map(|s| s.src.clone())
    }

    pub fn slots(&self) -> Vec<Arc<MqSlot>> {
        self.slots.lock().clone()
    }
}

impl MqSlot {
    pub fn sink_pad(&self) -> &Pad {
        &self.sink
    }

    pub fn src_pad(&self) -> &Pad {
        &self.src
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }
}

impl Element for MultiQueue {
    fn name(&self) -> String {
        self.core.name().to_string()
    }

    fn factory_name(&self) -> String {
        self.core.factory_name().to_string()
    }

    fn set_state(&self, state: ElementState) -> Result<StateChange> {
        match state {
            ElementState::Paused | ElementState::Playing => {
                if let Some(mq) = self.weak_self.upgrade() {
                    for slot in mq.slots.lock().clone() {
                        slot.cell.set_flushing(false);
                        mq.start_slot(&slot);
                    }
                }
            }
            ElementState::Null => self.stop_slots(),
            ElementState::Ready => {}
        }
        self.core.store_state(state);
        Ok(StateChange::Success)
    }

    fn state(&self) -> ElementState {
        self.core.state()
    }

    fn pads(&self) -> Vec<Pad> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flat_map(|s| [s.sink.clone(), s.src.clone()])
            .collect()
    }

    fn request_pad(&self, template: &str) -> Option<Pad> {
        if !template.starts_with("sink") {
            return None;
        }
        let mq = self.weak_self.upgrade()?;
        Some(mq.request_slot().sink.clone())
    }

    fn release_request_pad(&self, pad: &Pad) {
        let slot = {
            let mut slots = self.slots.lock();
            let pos = slots.iter().position(|s| &s.sink == pad);
            pos.map(|p| slots.remove(p))
        };
        if let Some(slot) = slot {
            slot.cell.set_flushing(true);
            slot.src.set_active(false);
            if let Some(handle) = slot.thread.lock().take() {
                let _ = handle.join();
            }
        }
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
        let mut limits = *self.limits.lock();
        match name {
            "max-size-bytes" => {
                limits.max_bytes = value.as_u64().unwrap_or(0);
            }
            "max-size-buffers" => {
                limits.max_buffers = value.as_u64().unwrap_or(0);
            }
            "max-size-time" => {
                limits.max_time = value.as_u64().unwrap_or(0);
            }
            "use-buffering" => {
                self.set_use_buffering(value.as_bool().unwrap_or(false));
                return Ok(());
            }
            _ => {
                return Err(DecodeError::PropertySetting {
                    element: self.name(),
                    property: name.to_string(),
                })
            }
        }
        self.set_limits(limits);
        Ok(())
    }

    fn set_bus(&self, bus: Option<Bus>) {
        self.core.set_bus(bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Buffer;

    #[test]
    fn test_slot_flow() {
        let mq = MultiQueue::new("mq0");
        let slot = mq.request_slot();
        mq.set_state(ElementState::Paused).unwrap();

        let out = Pad::new("out", PadDirection::Sink);
        let got = Arc::new(Mutex::new(0usize));
        let g = got.clone();
        out.set_chain_fn(move |_, _| {
            *g.lock() += 1;
            FlowReturn::Ok
        });
        slot.src_pad().link(&out).unwrap();

        slot.sink_pad().chain(Buffer::new(vec![0u8; 16]));
        slot.sink_pad().chain(Buffer::new(vec![0u8; 16]));
        for _ in 0..100 {
            if *got.lock() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(*got.lock(), 2);
        mq.set_state(ElementState::Null).unwrap();
    }

    #[test]
    fn test_overrun_signal_fires() {
        let mq = MultiQueue::new("mq0");
        mq.set_limits(QueueLimits {
            max_buffers: 1,
            ..Default::default()
        });
        let slot = mq.request_slot();
        // No pump thread: element stays in Ready so the queue fills up.
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        mq.on_overrun(move || {
            f.store(true, Ordering::SeqCst);
        });

        slot.sink_pad().chain(Buffer::new(vec![0u8; 4]));
        assert!(!fired.load(Ordering::SeqCst));

        // The second push overruns; release it from another thread.
        let sink = slot.sink_pad().clone();
        let handle = std::thread::spawn(move || sink.chain(Buffer::new(vec![0u8; 4])));
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));
        slot.cell.set_flushing(true);
        let _ = handle.join();
        mq.set_state(ElementState::Null).unwrap();
    }

    #[test]
    fn test_eos_marks_slot() {
        let mq = MultiQueue::new("mq0");
        let slot = mq.request_slot();
        mq.set_state(ElementState::Paused).unwrap();
        let out = Pad::new("out", PadDirection::Sink);
        slot.src_pad().link(&out).unwrap();
        slot.sink_pad().send_event(Event::Eos);
        for _ in 0..100 {
            if slot.is_eos() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(slot.is_eos());
        assert!(out.is_eos());
        mq.set_state(ElementState::Null).unwrap();
    }
}
