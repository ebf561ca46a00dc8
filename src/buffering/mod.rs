//! The slot layer between exposable end pads and the outside world:
//! optional buffering elements, aggregated buffering reporting, bitrate
//! rebalancing and the internal EOS surrogate handling.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DecodeBinConfig;
use crate::element::{Element, ElementRef, ElementState};
use crate::elements::queuecell::QueueLimits;
use crate::elements::{DownloadBuffer, MultiQueue, Queue2};
use crate::error::Result;
use crate::event::Event;
use crate::messages::{Bus, Message};
use crate::pad::{GhostPad, Pad, ProbeData, ProbeMask, ProbeReturn};

/// 10 MiB: byte bound for network stream buffering.
pub const STREAM_BUFFER_SIZE_BYTES: u64 = 10 * 1024 * 1024;
/// 5 seconds, in nanoseconds.
pub const STREAM_BUFFER_SIZE_TIME: u64 = 5_000_000_000;

/// How a slot bridges its end pad to the exposed ghost pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    /// No buffering element, the ghost targets the end pad directly.
    Direct,
    /// Streaming source: bounded queue with buffering reporting.
    Stream,
    /// Streaming source with known duration: progressive download cache.
    Download,
    /// Output of an adaptive demuxer: bitrate-driven queue.
    Adaptive,
    /// Parse mode: all slots share one interleaved multi-queue.
    Parse,
}

pub struct OutputSlot {
    pub id: usize,
    pub mode: SlotMode,
    /// The interposed element, if the mode has one.
    pub queue: Option<ElementRef>,
    queue2: Option<Arc<Queue2>>,
    download: Option<Arc<DownloadBuffer>>,
    pub ghost: GhostPad,
    /// Where a replacement upstream must link: the queue sink, the shared
    /// parse-queue sink, or None when the ghost targets upstream directly.
    pub input_pad: Mutex<Option<Pad>>,
    /// Upstream end pad currently feeding the slot; None after its chain
    /// was torn down (a replacement may be relinked during a switch).
    pub upstream: Mutex<Option<Pad>>,
    pub bitrate: Mutex<Option<u64>>,
    /// Not yet visible to the outside.
    pub pending: Mutex<bool>,
    pub eos: Mutex<bool>,
    queue_name: Option<String>,
}

pub type SlotRef = Arc<OutputSlot>;

impl OutputSlot {
    pub fn queue_src_pad(&self) -> Option<Pad> {
        if let Some(q) = &self.queue2 {
            return Some(q.src_pad().clone());
        }
        if let Some(d) = &self.download {
            return Some(d.src_pad().clone());
        }
        None
    }

    pub fn queue_sink_pad(&self) -> Option<Pad> {
        if let Some(q) = &self.queue2 {
            return Some(q.sink_pad().clone());
        }
        if let Some(d) = &self.download {
            return Some(d.sink_pad().clone());
        }
        None
    }

    fn set_byte_limit(&self, bytes: u64) {
        if let Some(q) = &self.queue2 {
            let mut limits = q.current_limits();
            limits.max_bytes = bytes;
            q.set_limits(limits);
        }
    }
}

/// Aggregation state, guarded by the buffering lock: the last level
/// reported by each still-active slot queue.
#[derive(Default)]
struct BufferingLevels {
    levels: HashMap<String, u32>,
    last_posted: Option<u32>,
}

/// Owns the output slots and the buffering aggregation of the engine.
pub struct SlotManager {
    name: String,
    slots: Mutex<Vec<SlotRef>>,
    next_id: AtomicUsize,
    levels: Mutex<BufferingLevels>,
    /// Shared multi-queue for parse mode, created on first use.
    parse_mq: Mutex<Option<Arc<MultiQueue>>>,
}

impl SlotManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            levels: Mutex::new(BufferingLevels::default()),
            parse_mq: Mutex::new(None),
        }
    }

    pub fn slots(&self) -> Vec<SlotRef> {
        self.slots.lock().clone()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Builds a slot of the given mode around `endpad` and returns it with
    /// the ghost pad targeted at the slot output.
    pub fn build_slot(
        &self,
        ghost_name: &str,
        endpad: &Pad,
        mode: SlotMode,
        config: &DecodeBinConfig,
        bus: &Bus,
    ) -> Result<SlotRef> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ghost = GhostPad::new(ghost_name);
        let (queue, queue2, download, queue_name) = match mode {
            SlotMode::Direct | SlotMode::Parse => (None, None, None, None),
            SlotMode::Stream | SlotMode::Adaptive => {
                let q = Queue2::new(&format!("{}-queue-{}", self.name, id));
                q.set_bus(Some(bus.clone()));
                q.set_use_buffering(config.use_buffering || mode == SlotMode::Stream);
                q.set_watermarks(config.low_watermark, config.high_watermark);
                let mut limits = QueueLimits {
                    max_bytes: if config.max_size_bytes != 0 {
                        config.max_size_bytes
                    } else {
                        STREAM_BUFFER_SIZE_BYTES
                    },
                    max_buffers: config.max_size_buffers,
                    max_time: if config.max_size_time != 0 {
                        config.max_size_time
                    } else {
                        STREAM_BUFFER_SIZE_TIME
                    },
                };
                if mode == SlotMode::Adaptive {
                    q.set_property(
                        "use-tags-bitrate",
                        crate::element::PropertyValue::Bool(true),
                    )?;
                    q.set_property(
                        "use-rate-estimate",
                        crate::element::PropertyValue::Bool(false),
                    )?;
                    limits.max_time = config.max_size_time;
                }
                if config.ring_buffer_max_size > 0 {
                    q.set_property(
                        "ring-buffer-max-size",
                        crate::element::PropertyValue::UInt64(config.ring_buffer_max_size),
                    )?;
                }
                q.set_limits(limits);
                let name = q.name();
                (
                    Some(q.clone() as ElementRef),
                    Some(q),
                    None,
                    Some(name),
                )
            }
            SlotMode::Download => {
                let d = DownloadBuffer::new(&format!("{}-download-{}", self.name, id));
                d.set_bus(Some(bus.clone()));
                d.set_limits(QueueLimits {
                    max_bytes: if config.max_size_bytes != 0 {
                        config.max_size_bytes
                    } else {
                        STREAM_BUFFER_SIZE_BYTES
                    },
                    max_buffers: 0,
                    max_time: if config.max_size_time != 0 {
                        config.max_size_time
                    } else {
                        STREAM_BUFFER_SIZE_TIME
                    },
                });
                let name = d.name();
                (
                    Some(d.clone() as ElementRef),
                    None,
                    Some(d),
                    Some(name),
                )
            }
        };

        let slot = Arc::new(OutputSlot {
            id,
            mode,
            queue,
            queue2,
            download,
            ghost,
            input_pad: Mutex::new(None),
            upstream: Mutex::new(Some(endpad.clone())),
            bitrate: Mutex::new(None),
            pending: Mutex::new(true),
            eos: Mutex::new(false),
            queue_name,
        });

        match mode {
            SlotMode::Direct => {
                slot.ghost.set_target(Some(endpad))?;
            }
            SlotMode::Parse => {
                let mq = self.parse_multiqueue(config, bus);
                let mq_slot = mq.request_slot();
                endpad.link(mq_slot.sink_pad())?;
                *slot.input_pad.lock() = Some(mq_slot.sink_pad().clone());
                slot.ghost.set_target(Some(mq_slot.src_pad()))?;
            }
            _ => {
                let queue_sink = slot.queue_sink_pad().expect("buffered slot has a queue");
                let queue_src = slot.queue_src_pad().expect("buffered slot has a queue");
                self.install_eos_conversion(&slot, &queue_sink);
                self.install_output_watch(&slot, &queue_src);
                self.install_bitrate_watch(&slot, &queue_sink);
                endpad.link(&queue_sink)?;
                *slot.input_pad.lock() = Some(queue_sink.clone());
                if let Some(element) = &slot.queue {
                    element.set_state(ElementState::Paused)?;
                }
                slot.ghost.set_target(Some(&queue_src))?;
            }
        }

        if let Some(name) = &slot.queue_name {
            self.levels.lock().levels.insert(name.clone(), 0);
        }
        self.slots.lock().push(slot.clone());
        Ok(slot)
    }

    /// Shared parse-mode multi-queue: all parse outputs interleave through
    /// one element.
    fn parse_multiqueue(&self, config: &DecodeBinConfig, bus: &Bus) -> Arc<MultiQueue> {
        let mut guard = self.parse_mq.lock();
        if let Some(mq) = guard.as_ref() {
            return mq.clone();
        }
        let mq = MultiQueue::new(&format!("{}-parse-mq", self.name));
        mq.set_bus(Some(bus.clone()));
        mq.set_use_interleave(true);
        mq.set_sync_by_running_time(true);
        mq.set_use_buffering(config.use_buffering);
        mq.set_watermarks(config.low_watermark, config.high_watermark);
        let _ = mq.set_state(ElementState::Paused);
        *guard = Some(mq.clone());
        mq
    }

    pub fn parse_mq(&self) -> Option<Arc<MultiQueue>> {
        self.parse_mq.lock().clone()
    }

    /// EOS arriving on a pending slot, or on a slot whose upstream was
    /// removed, is turned into the internal surrogate so the queue drains
    /// without marking the output EOS.
    fn install_eos_conversion(&self, slot: &SlotRef, queue_sink: &Pad) {
        let slot = slot.clone();
        queue_sink.add_probe(ProbeMask::event_downstream(), move |pad, data| {
            if let ProbeData::Event(Event::Eos) = data {
                let convert = *slot.pending.lock() || slot.upstream.lock().is_none();
                if convert {
                    log::debug!("slot {}: converting EOS to custom surrogate", slot.id);
                    pad.send_event(Event::CustomEos);
                    return ProbeReturn::Handled;
                }
            }
            ProbeReturn::Pass
        });
    }

    /// When the surrogate comes out of the queue the slot is reclaimed
    /// asynchronously; a real EOS goes out only if nothing was relinked.
    fn install_output_watch(&self, slot: &SlotRef, queue_src: &Pad) {
        let slot = slot.clone();
        queue_src.add_probe(ProbeMask::event_downstream(), move |_pad, data| {
            if let ProbeData::Event(Event::CustomEos) = data {
                *slot.eos.lock() = true;
                let slot = slot.clone();
                std::thread::spawn(move || {
                    if slot.upstream.lock().is_none() {
                        slot.ghost.pad().push_event(Event::Eos);
                    }
                });
                return ProbeReturn::Handled;
            }
            ProbeReturn::Pass
        });
    }

    fn install_bitrate_watch(&self, slot: &SlotRef, queue_sink: &Pad) {
        let slot_ref = slot.clone();
        queue_sink.add_probe(ProbeMask::event_downstream(), move |_pad, data| {
            if let ProbeData::Event(Event::Tag(tags)) = data {
                if let Some(bitrate) = tags.bitrate {
                    let changed = {
                        let mut current = slot_ref.bitrate.lock();
                        if *current != Some(bitrate) {
                            *current = Some(bitrate);
                            true
                        } else {
                            false
                        }
                    };
                    if changed {
                        log::debug!("slot {}: bitrate now {}", slot_ref.id, bitrate);
                    }
                }
            }
            ProbeReturn::Pass
        });
    }

    /// Redistributes the total byte budget across buffered slots in
    /// proportion to their bitrates; equal split when any is unknown.
    pub fn rebalance(&self, config: &DecodeBinConfig) {
        let slots = self.slots.lock();
        let buffered: Vec<&SlotRef> = slots
            .iter()
            .filter(|s| s.queue2.is_some())
            .collect();
        if buffered.is_empty() {
            return;
        }
        let total_budget = if config.max_size_bytes != 0 {
            config.max_size_bytes
        } else {
            STREAM_BUFFER_SIZE_BYTES * buffered.len() as u64
        };
        let bitrates: Vec<Option<u64>> = buffered.iter().map(|s| *s.bitrate.lock()).collect();
        if bitrates.iter().any(|b| b.is_none()) {
            let share = total_budget / buffered.len() as u64;
            for slot in &buffered {
                slot.set_byte_limit(share.max(1));
            }
            return;
        }
        let sum: u64 = bitrates.iter().map(|b| b.unwrap()).sum();
        if sum == 0 {
            return;
        }
        for (slot, bitrate) in buffered.iter().zip(bitrates) {
            let share = total_budget.saturating_mul(bitrate.unwrap()) / sum;
            slot.set_byte_limit(share.max(1));
        }
    }

    /// Routes a buffering message from one of the slot queues into the
    /// aggregate. Returns the externally visible percentage when it
    /// changed.
    pub fn on_queue_buffering(&self, src: &str, percent: u32) -> Option<u32> {
        if !self.owns_queue(src) {
            return None;
        }
        let mut levels = self.levels.lock();
        levels.levels.insert(src.to_string(), percent);
        let aggregated = levels.levels.values().copied().min()?;
        if levels.last_posted == Some(aggregated) {
            return None;
        }
        levels.last_posted = Some(aggregated);
        Some(aggregated)
    }

    pub(crate) fn owns_queue(&self, src: &str) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| s.queue_name.as_deref() == Some(src))
    }

    /// An EOS'd slot leaves the aggregation and drops its last message.
    pub fn mark_slot_eos(&self, slot: &SlotRef) -> Option<u32> {
        *slot.eos.lock() = true;
        let mut levels = self.levels.lock();
        if let Some(name) = &slot.queue_name {
            levels.levels.remove(name);
        }
        let aggregated = levels.levels.values().copied().min();
        match aggregated {
            Some(value) if levels.last_posted != Some(value) => {
                levels.last_posted = Some(value);
                Some(value)
            }
            None if levels.last_posted != Some(100) => {
                // Nothing left buffering: report completion and clear.
                levels.last_posted = Some(100);
                Some(100)
            }
            _ => None,
        }
    }

    pub fn mark_exposed(&self, slot: &SlotRef) {
        *slot.pending.lock() = false;
    }

    pub fn slot_for_ghost(&self, ghost: &Pad) -> Option<SlotRef> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.ghost.pad() == ghost)
            .cloned()
    }

    pub fn remove_slot(&self, slot: &SlotRef) {
        self.slots.lock().retain(|s| s.id != slot.id);
        let mut levels = self.levels.lock();
        if let Some(name) = &slot.queue_name {
            levels.levels.remove(name);
        }
        if let Some(element) = &slot.queue {
            let _ = element.set_state(ElementState::Null);
        }
    }

    pub fn clear(&self) {
        let slots = std::mem::take(&mut *self.slots.lock());
        for slot in slots {
            if let Some(element) = &slot.queue {
                let _ = element.set_state(ElementState::Null);
            }
            let _ = slot.ghost.set_target(None);
        }
        if let Some(mq) = self.parse_mq.lock().take() {
            let _ = mq.set_state(ElementState::Null);
        }
        let mut levels = self.levels.lock();
        levels.levels.clear();
        levels.last_posted = None;
    }

    /// Posts the aggregated percentage on behalf of the owning bin.
    pub fn post_aggregated(&self, bus: &Bus, owner: &str, percent: u32) {
        bus.post(Message::Buffering {
            src: owner.to_string(),
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::PadDirection;

    fn endpad() -> Pad {
        Pad::new("endpad", PadDirection::Src)
    }

    #[test]
    fn test_direct_slot_targets_endpad() {
        let manager = SlotManager::new("bin");
        let bus = Bus::new();
        let config = DecodeBinConfig::default();
        let pad = endpad();
        let slot = manager
            .build_slot("src_0", &pad, SlotMode::Direct, &config, &bus)
            .unwrap();
        assert!(slot.queue.is_none());
        assert_eq!(slot.ghost.target().unwrap(), pad);
    }

    #[test]
    fn test_stream_slot_defaults() {
        let manager = SlotManager::new("bin");
        let bus = Bus::new();
        let config = DecodeBinConfig::default();
        let slot = manager
            .build_slot("src_0", &endpad(), SlotMode::Stream, &config, &bus)
            .unwrap();
        let q = slot.queue2.as_ref().unwrap();
        let limits = q.current_limits();
        assert_eq!(limits.max_bytes, STREAM_BUFFER_SIZE_BYTES);
        assert_eq!(limits.max_time, STREAM_BUFFER_SIZE_TIME);
        let _ = slot.queue.as_ref().unwrap().set_state(ElementState::Null);
    }

    #[test]
    fn test_aggregation_is_min_and_eos_excludes() {
        let manager = SlotManager::new("bin");
        let bus = Bus::new();
        let config = DecodeBinConfig::default();
        let a = manager
            .build_slot("src_0", &endpad(), SlotMode::Stream, &config, &bus)
            .unwrap();
        let b = manager
            .build_slot("src_1", &endpad(), SlotMode::Stream, &config, &bus)
            .unwrap();
        let a_name = a.queue_name.clone().unwrap();
        let b_name = b.queue_name.clone().unwrap();

        assert_eq!(manager.on_queue_buffering(&a_name, 40), Some(0));
        // Aggregate is min(40, 0): the second queue has not reported past 0.
        assert_eq!(manager.on_queue_buffering(&b_name, 80), Some(40));
        assert_eq!(manager.on_queue_buffering(&a_name, 90), Some(80));
        // Unknown queue names are not ours.
        assert_eq!(manager.on_queue_buffering("other", 5), None);

        // EOS on the lowest slot removes it from aggregation.
        assert_eq!(manager.mark_slot_eos(&b), Some(90));
        assert_eq!(manager.mark_slot_eos(&a), Some(100));
        for slot in manager.slots() {
            let _ = slot.queue.as_ref().unwrap().set_state(ElementState::Null);
        }
    }

    #[test]
    fn test_rebalance_proportional_and_equal() {
        let manager = SlotManager::new("bin");
        let bus = Bus::new();
        let config = DecodeBinConfig::default();
        let a = manager
            .build_slot("src_0", &endpad(), SlotMode::Adaptive, &config, &bus)
            .unwrap();
        let b = manager
            .build_slot("src_1", &endpad(), SlotMode::Adaptive, &config, &bus)
            .unwrap();

        // Unknown bitrates: equal split of the doubled default budget.
        manager.rebalance(&config);
        assert_eq!(
            a.queue2.as_ref().unwrap().current_limits().max_bytes,
            STREAM_BUFFER_SIZE_BYTES
        );

        *a.bitrate.lock() = Some(3_000_000);
        *b.bitrate.lock() = Some(1_000_000);
        manager.rebalance(&config);
        let total = STREAM_BUFFER_SIZE_BYTES * 2;
        assert_eq!(
            a.queue2.as_ref().unwrap().current_limits().max_bytes,
            total * 3 / 4
        );
        assert_eq!(
            b.queue2.as_ref().unwrap().current_limits().max_bytes,
            total / 4
        );
        for slot in manager.slots() {
            let _ = slot.queue.as_ref().unwrap().set_state(ElementState::Null);
        }
    }
}
