//! Play-item management: sequential URIs decoded through one set of output
//! pads, switched either instantly (flushing) or gaplessly at the EOS
//! boundary with stream-type pad matching.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::caps::MediaCategory;
use crate::config::DecodeBinConfig;
use crate::element::{ElementState, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::Event;
use crate::lifecycle::DecodeBin;
use crate::messages::Bus;
use crate::pad::{FlowReturn, Pad, PadDirection};
use crate::registry::Registry;

/// One queued input: a main URI, an optional subtitle URI, and the group
/// id stamped onto its outgoing stream-start events.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayItem {
    pub uri: String,
    pub suburi: Option<String>,
    pub group_id: u32,
}

/// An externally visible output pad surviving across play items.
struct OutputPad {
    pad: Pad,
    internal: Pad,
    stream_type: &'static str,
    /// Group id stamped on forwarded stream-starts.
    group: Arc<Mutex<u32>>,
    /// Last group id actually pushed out.
    seen_group: Arc<Mutex<Option<u32>>>,
}

struct Items {
    list: Vec<PlayItem>,
    /// Index currently feeding the engine.
    input: Option<usize>,
    /// Index whose pads are externally visible.
    output: Option<usize>,
}

struct UriInner {
    name: String,
    weak_self: Weak<UriInner>,
    registry: Arc<Registry>,
    bus: Bus,
    config: Mutex<DecodeBinConfig>,
    items: Mutex<Items>,
    current: Mutex<Option<DecodeBin>>,
    /// Pre-built next input, waiting for the current one to drain.
    next: Mutex<Option<DecodeBin>>,
    /// New-input pads parked until the switch happens.
    parked: Mutex<Vec<Pad>>,
    outputs: Mutex<Vec<OutputPad>>,
    state: Mutex<ElementState>,
    next_group_id: AtomicU32,
    signals: crate::lifecycle::Signals,
}

/// URI-level coordinator: queue URIs, get a stable set of decoded output
/// pads, with instant or gapless transitions between items.
pub struct UriDecodeBin {
    inner: Arc<UriInner>,
}

impl UriDecodeBin {
    pub fn new(name: &str, registry: Arc<Registry>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<UriInner>| UriInner {
            name: name.to_string(),
            weak_self: weak.clone(),
            registry,
            bus: Bus::new(),
            config: Mutex::new(DecodeBinConfig::default()),
            items: Mutex::new(Items {
                list: Vec::new(),
                input: None,
                output: None,
            }),
            current: Mutex::new(None),
            next: Mutex::new(None),
            parked: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            state: Mutex::new(ElementState::Null),
            next_group_id: AtomicU32::new(1),
            signals: crate::lifecycle::Signals::default(),
        });
        UriDecodeBin { inner }
    }

    pub fn bus(&self) -> Bus {
        self.inner.bus.clone()
    }

    pub fn update_config<F: FnOnce(&mut DecodeBinConfig)>(&self, f: F) {
        let mut config = self.inner.config.lock();
        f(&mut config);
    }

    /// Queues a URI. While idle, re-setting the identical URI without
    /// `instant-uri` is a no-op. While playing, the item either replaces
    /// the input immediately (instant) or follows at the EOS boundary.
    pub fn set_uri(&self, uri: &str) {
        let instant = self.inner.config.lock().instant_uri;
        let playing = *self.inner.state.lock() >= ElementState::Paused;
        {
            let mut items = self.inner.items.lock();
            if !playing && !instant {
                let duplicate = items
                    .list
                    .last()
                    .map(|item| item.uri == uri)
                    .unwrap_or(false);
                if duplicate {
                    log::debug!("{}: uri unchanged, ignoring", self.inner.name);
                    return;
                }
            }
            let group_id = self.inner.next_group_id.fetch_add(1, Ordering::SeqCst);
            items.list.push(PlayItem {
                uri: uri.to_string(),
                suburi: None,
                group_id,
            });
        }
        if playing {
            if instant {
                if let Err(err) = self.inner.instant_switch() {
                    log::warn!("{}: instant switch failed: {}", self.inner.name, err);
                }
            }
            // Gapless: the queued item is picked up at about-to-finish.
        }
    }

    /// Best-effort: applies to the most recently queued, not yet active
    /// item. Changes to the running item may not propagate.
    pub fn set_suburi(&self, suburi: Option<&str>) {
        let mut items = self.inner.items.lock();
        if let Some(item) = items.list.last_mut() {
            item.suburi = suburi.map(|s| s.to_string());
        }
    }

    pub fn play_items(&self) -> Vec<PlayItem> {
        self.inner.items.lock().list.clone()
    }

    /// The play item whose pads are currently visible outside.
    pub fn output_item(&self) -> Option<PlayItem> {
        let items = self.inner.items.lock();
        items.output.and_then(|i| items.list.get(i).cloned())
    }

    pub fn src_pads(&self) -> Vec<Pad> {
        self.inner.outputs.lock().iter().map(|o| o.pad.clone()).collect()
    }

    pub fn on_pad_added<F: Fn(&Pad) + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.pad_added.lock().push(Box::new(f));
    }

    pub fn on_pad_removed<F: Fn(&Pad) + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.pad_removed.lock().push(Box::new(f));
    }

    pub fn on_about_to_finish<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.about_to_finish.lock().push(Box::new(f));
    }

    pub fn on_drained<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.drained.lock().push(Box::new(f));
    }

    pub fn set_state(&self, target: ElementState) -> Result<StateChange> {
        let current = *self.inner.state.lock();
        match (current, target) {
            (ElementState::Null, t) if t >= ElementState::Paused => {
                self.inner.activate_next_input()?;
                *self.inner.state.lock() = target;
                Ok(StateChange::Async)
            }
            (_, ElementState::Null) | (_, ElementState::Ready) => {
                self.inner.teardown();
                *self.inner.state.lock() = target;
                Ok(StateChange::Success)
            }
            _ => {
                *self.inner.state.lock() = target;
                Ok(StateChange::Success)
            }
        }
    }

    pub fn state(&self) -> ElementState {
        *self.inner.state.lock()
    }
}

impl Drop for UriDecodeBin {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl UriInner {
    /// Builds the engine for the next queued play item and marks it as the
    /// input.
    fn activate_next_input(self: &Arc<Self>) -> Result<()> {
        let (index, item) = {
            let items = self.items.lock();
            let next_index = match items.input {
                None => 0,
                Some(i) => i + 1,
            };
            match items.list.get(next_index) {
                Some(item) => (next_index, item.clone()),
                None => {
                    return Err(DecodeError::NotInitialized(format!(
                        "{}: no play item queued",
                        self.name
                    )))
                }
            }
        };
        log::info!(
            "{}: activating play item {} ({})",
            self.name,
            index,
            item.uri
        );

        let bin = DecodeBin::with_bus(
            &format!("{}-decode-{}", self.name, item.group_id),
            self.registry.clone(),
            self.bus.clone(),
        );
        {
            let template = self.config.lock().clone();
            bin.update_config(|c| *c = template);
        }
        bin.set_uri(Some(&item.uri));

        let weak = self.weak_self.clone();
        let group_id = item.group_id;
        bin.on_pad_added(move |pad| {
            if let Some(inner) = weak.upgrade() {
                inner.input_pad_added(group_id, pad);
            }
        });
        let weak = self.weak_self.clone();
        bin.on_drained(move || {
            if let Some(inner) = weak.upgrade() {
                inner.input_drained();
            }
        });

        // Bookkeeping first: the engine's callbacks may fire the moment it
        // goes to Paused, and they classify pads by these markers.
        {
            let mut items = self.items.lock();
            items.input = Some(index);
            if items.output.is_none() {
                items.output = Some(index);
            }
        }
        let is_first = self.current.lock().is_none();
        if is_first {
            let mut current = self.current.lock();
            *current = Some(bin);
            if let Some(bin) = current.as_ref() {
                bin.set_state(ElementState::Paused)?;
            }
        } else {
            let mut next = self.next.lock();
            *next = Some(bin);
            if let Some(bin) = next.as_ref() {
                bin.set_state(ElementState::Paused)?;
            }
        }
        Ok(())
    }

    /// A decoded pad appeared on the input engine. Either it belongs to
    /// the visible item (attach or create outputs) or to a pre-building
    /// next item (park it, blocked, until the switch).
    fn input_pad_added(self: &Arc<Self>, group_id: u32, pad: &Pad) {
        let is_pending = {
            let items = self.items.lock();
            let output_group = items.output.and_then(|i| items.list.get(i)).map(|it| it.group_id);
            output_group.map(|g| g != group_id).unwrap_or(false)
        };
        if is_pending && self.next.lock().is_some() {
            log::debug!("{}: parking pad {:?} of future item", self.name, pad);
            self.parked.lock().push(pad.clone());
            return;
        }
        self.attach_output(group_id, pad, true);
    }

    /// Wires an input pad to an output, reusing a stream-type match when
    /// one is free.
    fn attach_output(self: &Arc<Self>, group_id: u32, pad: &Pad, announce: bool) {
        let category = pad
            .current_caps()
            .map(|c| MediaCategory::from_caps(&c))
            .unwrap_or(MediaCategory::Other);
        let stream_type = category.stream_type();

        // Reuse a free output of the same stream type. The link replays
        // sticky events through the output's handlers, so the list lock
        // must not be held across it.
        let candidate = {
            let outputs = self.outputs.lock();
            outputs
                .iter()
                .find(|o| o.stream_type == stream_type && !o.internal.is_linked())
                .map(|o| (o.internal.clone(), o.group.clone()))
        };
        if let Some((internal, group)) = candidate {
            *group.lock() = group_id;
            if pad.link(&internal).is_ok() {
                log::debug!("{}: relinked {} output", self.name, stream_type);
                return;
            }
        }

        let index = self.outputs.lock().len();
        let external = Pad::new(format!("src_{}", index), PadDirection::Src);
        external.set_parent_name(&self.name);
        let internal = Pad::new(format!("proxy_{}", index), PadDirection::Sink);
        let group = Arc::new(Mutex::new(group_id));
        let seen_group = Arc::new(Mutex::new(None));

        let ext = external.clone();
        internal.set_chain_fn(move |_pad, buffer| {
            let flow = ext.push(buffer);
            if flow == FlowReturn::NotLinked {
                FlowReturn::Ok
            } else {
                flow
            }
        });
        let ext = external.clone();
        let group_for_events = group.clone();
        let seen = seen_group.clone();
        let weak = self.weak_self.clone();
        internal.set_event_fn(move |_pad, event| {
            match event {
                // Outgoing stream-starts carry the play item's group id.
                Event::StreamStart { stream_id, .. } => {
                    let gid = *group_for_events.lock();
                    *seen.lock() = Some(gid);
                    let res = ext.push_event(Event::StreamStart {
                        stream_id,
                        group_id: Some(gid),
                    });
                    if let Some(inner) = weak.upgrade() {
                        inner.check_output_transition();
                    }
                    res
                }
                Event::Eos => {
                    if let Some(inner) = weak.upgrade() {
                        if inner.has_queued_successor() {
                            log::debug!("{}: holding EOS, successor queued", inner.name);
                            return true;
                        }
                    }
                    ext.push_event(Event::Eos)
                }
                other => ext.push_event(other),
            }
        });

        if pad.link(&internal).is_err() {
            log::warn!("{}: could not attach output for {:?}", self.name, pad);
            return;
        }
        self.outputs.lock().push(OutputPad {
            pad: external.clone(),
            internal,
            stream_type,
            group,
            seen_group,
        });
        if announce {
            let callbacks = self.signals.pad_added.lock();
            for cb in callbacks.iter() {
                cb(&external);
            }
        }
    }

    fn has_queued_successor(&self) -> bool {
        let items = self.items.lock();
        match items.input {
            Some(i) => items.list.len() > i + 1,
            None => false,
        }
    }

    /// The input item fully drained: give the caller a chance to queue the
    /// next URI, then switch to it (gapless) or let the EOS stand.
    fn input_drained(self: &Arc<Self>) {
        {
            let callbacks = self.signals.about_to_finish.lock();
            for cb in callbacks.iter() {
                cb();
            }
        }
        if !self.has_queued_successor() {
            let callbacks = self.signals.drained.lock();
            for cb in callbacks.iter() {
                cb();
            }
            return;
        }
        if self.next.lock().is_none() {
            if let Err(err) = self.activate_next_input() {
                log::warn!("{}: could not activate next item: {}", self.name, err);
                return;
            }
        }
        self.perform_switch();
    }

    /// Swaps the old input out: detach its pads, promote the pre-built
    /// engine, relink parked pads by stream type, release leftovers.
    fn perform_switch(self: &Arc<Self>) {
        log::info!("{}: switching play items", self.name);
        let old = self.current.lock().take();
        if let Some(old) = old {
            for output in self.outputs.lock().iter() {
                if let Some(peer) = output.internal.peer() {
                    peer.unlink();
                }
            }
            // The switch may run on one of the old engine's own streaming
            // threads; tear it down from a worker.
            std::thread::Builder::new()
                .name(format!("{}-dispose", self.name))
                .spawn(move || {
                    let _ = old.set_state(ElementState::Null);
                })
                .ok();
        }

        let next = self.next.lock().take();
        let group_id = {
            let mut items = self.items.lock();
            let input = items.input;
            items.output = input;
            input
                .and_then(|i| items.list.get(i))
                .map(|item| item.group_id)
                .unwrap_or(0)
        };
        if let Some(bin) = next {
            let parked = std::mem::take(&mut *self.parked.lock());
            for pad in parked {
                self.attach_output(group_id, &pad, true);
            }
            *self.current.lock() = Some(bin);
        }
    }

    /// Instant URI change: flush the running input and start the new item
    /// right away.
    fn instant_switch(self: &Arc<Self>) -> Result<()> {
        log::info!("{}: instant uri switch", self.name);
        if let Some(old) = self.current.lock().take() {
            old.sink_pad().send_event(Event::FlushStart);
            for output in self.outputs.lock().iter() {
                if let Some(peer) = output.internal.peer() {
                    peer.unlink();
                }
            }
            old.sink_pad().send_event(Event::FlushStop);
            let _ = old.set_state(ElementState::Null);
        }
        self.activate_next_input()?;
        {
            let mut items = self.items.lock();
            items.output = items.input;
        }
        Ok(())
    }

    /// When every output carries the new group id, the output item marker
    /// moves.
    fn check_output_transition(self: &Arc<Self>) {
        let outputs = self.outputs.lock();
        if outputs.is_empty() {
            return;
        }
        let first = match *outputs[0].seen_group.lock() {
            Some(g) => g,
            None => return,
        };
        if !outputs
            .iter()
            .all(|o| *o.seen_group.lock() == Some(first))
        {
            return;
        }
        drop(outputs);
        let mut items = self.items.lock();
        if let Some(pos) = items.list.iter().position(|item| item.group_id == first) {
            items.output = Some(pos);
        }
    }

    fn teardown(&self) {
        if let Some(bin) = self.current.lock().take() {
            let _ = bin.set_state(ElementState::Null);
        }
        if let Some(bin) = self.next.lock().take() {
            let _ = bin.set_state(ElementState::Null);
        }
        self.parked.lock().clear();
        let outputs = std::mem::take(&mut *self.outputs.lock());
        for output in outputs {
            let callbacks = self.signals.pad_removed.lock();
            for cb in callbacks.iter() {
                cb(&output.pad);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_same_uri_twice_idle_is_noop() {
        let registry = Arc::new(Registry::new());
        let bin = UriDecodeBin::new("uridecodebin0", registry);
        bin.set_uri("file:///tmp/a.ogg");
        bin.set_uri("file:///tmp/a.ogg");
        assert_eq!(bin.play_items().len(), 1);

        bin.set_uri("file:///tmp/b.ogg");
        assert_eq!(bin.play_items().len(), 2);
    }

    #[test]
    fn test_group_ids_are_unique() {
        let registry = Arc::new(Registry::new());
        let bin = UriDecodeBin::new("uridecodebin0", registry);
        bin.set_uri("file:///tmp/a.ogg");
        bin.set_uri("file:///tmp/b.ogg");
        let items = bin.play_items();
        assert_ne!(items[0].group_id, items[1].group_id);
    }

    #[test]
    fn test_suburi_applies_to_last_item() {
        let registry = Arc::new(Registry::new());
        let bin = UriDecodeBin::new("uridecodebin0", registry);
        bin.set_uri("file:///tmp/a.ogg");
        bin.set_suburi(Some("file:///tmp/a.srt"));
        assert_eq!(
            bin.play_items()[0].suburi.as_deref(),
            Some("file:///tmp/a.srt")
        );
    }
}
