//! The expose procedure: once the whole tree is complete, turn the blocked
//! end pads into externally visible output pads, in a stable order, and
//! release the held producer threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffering::{SlotMode, SlotRef};
use crate::caps::MediaCategory;
use crate::chain::{configure_multiqueue, ChainId};
use crate::error::DecodeError;
use crate::event::Event;
use crate::lifecycle::{BinInner, ExposedPad};
use crate::messages::Message;
use crate::pad::{Pad, ProbeData, ProbeId, ProbeMask, ProbeReturn};

impl BinInner {
    /// Installs the downstream block probe holding an end pad until
    /// exposure. Not installed during shutdown; the pad is flushed
    /// instead.
    pub(crate) fn block_endpad(self: &Arc<Self>, pad: &Pad, chain_id: ChainId) -> Option<ProbeId> {
        let mut dyn_state = self.dyn_state.lock();
        if dyn_state.shutdown {
            pad.set_active(false);
            return None;
        }
        let weak = self.weak_self.clone();
        let probe = pad.add_probe(ProbeMask::block_downstream(), move |p, data| {
            let inner = match weak.upgrade() {
                Some(i) => i,
                None => return ProbeReturn::Remove,
            };
            match data {
                ProbeData::Event(event) => {
                    let is_caps = matches!(event, Event::Caps(_));
                    let is_eos = matches!(event, Event::Eos);
                    // Sticky and out-of-band events pass without waking
                    // anything, so downstream can initialize and upstream
                    // state changes cannot deadlock on us.
                    if !is_caps && !is_eos && (event.is_sticky() || !event.is_serialized()) {
                        return ProbeReturn::Pass;
                    }
                    inner.endpad_blocked(chain_id);
                    if is_eos {
                        let last = inner.handle_endpad_eos(chain_id, p);
                        return if last {
                            ProbeReturn::Pass
                        } else {
                            ProbeReturn::Drop
                        };
                    }
                    ProbeReturn::Pass
                }
                ProbeData::Buffer(_) => {
                    inner.endpad_blocked(chain_id);
                    ProbeReturn::Pass
                }
                ProbeData::Query(_) => ProbeReturn::Pass,
            }
        });
        dyn_state.blocked_pads.push((pad.clone(), probe));
        Some(probe)
    }

    /// First data reached a parked end pad: the chain may now be complete.
    fn endpad_blocked(self: &Arc<Self>, chain_id: ChainId) {
        let newly = match self.store.chain(chain_id) {
            Some(chain) => {
                let mut chain = chain.lock();
                match chain.end_pad.as_mut() {
                    Some(ep) if !ep.blocked => {
                        ep.blocked = true;
                        true
                    }
                    _ => false,
                }
            }
            None => false,
        };
        if newly {
            self.expose_if_complete();
        }
    }

    pub(crate) fn expose_if_complete(self: &Arc<Self>) {
        let _guard = self.expose_lock.lock();
        if self.is_shutdown() {
            return;
        }
        let root = match *self.root_chain.lock() {
            Some(r) => r,
            None => return,
        };
        if self.store.chain_is_complete(root) {
            if !self.expose(root) {
                log::warn!("{}: could not expose streams", self.name);
            }
        }
    }

    /// The actual exposure. Called with the expose lock held.
    fn expose(self: &Arc<Self>, root: ChainId) -> bool {
        let collected = self.store.collect_exposable(root);
        let config = self.config.read().clone();
        let seekable = self.upstream.lock().seekable;

        // Completed groups leave the preroll regime: no more overrun
        // notifications, play-sized limits.
        for group_id in &collected.complete_groups {
            if let Some(group) = self.store.group(*group_id) {
                let mq = group.lock().multiqueue.clone();
                mq.clear_overrun_callbacks();
                configure_multiqueue(&mq, &config, false, seekable);
            }
        }

        if collected.endpads.is_empty() {
            let mut details = collected.missing_plugin_details.clone();
            details.extend(self.drain_filtered_errors());
            let error = if !details.is_empty() {
                DecodeError::MissingPlugin {
                    details: details.join("; "),
                }
            } else {
                DecodeError::NoBuffers
            };
            log::warn!("{}: nothing to expose: {}", self.name, error);
            self.bus.post(Message::Error {
                src: self.name.clone(),
                error,
            });
            self.do_async_done();
            return false;
        }

        // Split into already-exposed and new end pads.
        let mut new_pads: Vec<(ChainId, Pad, MediaCategory, Option<String>)> = Vec::new();
        let mut live_chains: Vec<ChainId> = Vec::new();
        for (chain_id, pad) in &collected.endpads {
            live_chains.push(*chain_id);
            let (exposed, caps) = match self.store.chain(*chain_id) {
                Some(chain) => {
                    let chain = chain.lock();
                    (
                        chain.end_pad.as_ref().map(|ep| ep.exposed).unwrap_or(false),
                        chain.end_caps.clone(),
                    )
                }
                None => continue,
            };
            if !exposed {
                let category = caps
                    .as_ref()
                    .map(MediaCategory::from_caps)
                    .unwrap_or(MediaCategory::Other);
                let stream_id = pad.stream_start().map(|(id, _)| id);
                new_pads.push((*chain_id, pad.clone(), category, stream_id));
            }
        }

        let stale: Vec<ExposedPad> = {
            let mut exposed = self.exposed.lock();
            let mut keep = Vec::new();
            let mut stale = Vec::new();
            for entry in exposed.drain(..) {
                if live_chains.contains(&entry.chain) {
                    keep.push(entry);
                } else {
                    stale.push(entry);
                }
            }
            *exposed = keep;
            stale
        };

        if new_pads.is_empty() && stale.is_empty() {
            self.do_async_done();
            return true;
        }

        // Stable output order: media category first, stream-id breaks ties.
        new_pads.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.3.cmp(&b.3)));

        let mut stale = stale;
        let mut added: Vec<Pad> = Vec::new();
        for (chain_id, endpad, category, _) in new_pads {
            // A stale pad of the same stream type is reused in place, so
            // the outside never sees a remove/add cycle on a switch.
            let reuse_pos = stale
                .iter()
                .position(|e| e.category.stream_type() == category.stream_type());
            if let Some(pos) = reuse_pos {
                let mut entry = stale.remove(pos);
                if self.relink_slot(&entry.slot, &endpad) {
                    log::debug!(
                        "{}: reusing output {} for {}",
                        self.name,
                        entry.name,
                        chain_id
                    );
                    entry.chain = chain_id;
                    entry.category = category;
                    self.mark_endpad_exposed(chain_id);
                    self.exposed.lock().push(entry);
                    continue;
                }
                stale.insert(pos, entry);
            }

            let name = format!("src_{}", self.pad_serial.fetch_add(1, Ordering::SeqCst));
            let mode = self.slot_mode();
            let slot = match self.slots.build_slot(&name, &endpad, mode, &config, &self.bus) {
                Ok(slot) => slot,
                Err(err) => {
                    log::warn!("{}: slot construction failed: {}", self.name, err);
                    continue;
                }
            };
            log::info!("{}: exposing {} ({:?})", self.name, name, mode);
            self.exposed.lock().push(ExposedPad {
                name,
                chain: chain_id,
                category,
                slot: slot.clone(),
            });
            self.mark_endpad_exposed(chain_id);
            added.push(slot.ghost.pad().clone());
        }

        // Whatever could not be reused goes away.
        for entry in stale {
            log::debug!("{}: removing stale output {}", self.name, entry.name);
            *entry.slot.upstream.lock() = None;
            self.slots.remove_slot(&entry.slot);
            let _ = entry.slot.ghost.set_target(None);
            let callbacks = self.signals.pad_removed.lock();
            for cb in callbacks.iter() {
                cb(entry.slot.ghost.pad());
            }
        }

        for pad in &added {
            let callbacks = self.signals.pad_added.lock();
            for cb in callbacks.iter() {
                cb(pad);
            }
        }

        {
            let callbacks = self.signals.no_more_pads.lock();
            for cb in callbacks.iter() {
                cb();
            }
        }

        if config.post_stream_topology {
            self.bus.post(Message::Element {
                src: self.name.clone(),
                name: "stream-topology".to_string(),
                payload: self.store.topology(root),
            });
        }

        // Finally let the held producers run.
        for (chain_id, _) in &collected.endpads {
            self.unblock_endpad(*chain_id);
        }
        for entry in self.exposed.lock().iter() {
            self.slots.mark_exposed(&entry.slot);
        }

        self.do_async_done();
        true
    }

    /// Swaps a replacement upstream into an existing slot.
    fn relink_slot(&self, slot: &SlotRef, endpad: &Pad) -> bool {
        let input = slot.input_pad.lock().clone();
        if let Some(old) = slot.upstream.lock().take() {
            old.unlink();
        }
        let ok = match input {
            Some(input) => endpad.link(&input).is_ok(),
            None => slot.ghost.set_target(Some(endpad)).is_ok(),
        };
        if ok {
            *slot.upstream.lock() = Some(endpad.clone());
        }
        ok
    }

    fn mark_endpad_exposed(&self, chain_id: ChainId) {
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            if let Some(ep) = chain.end_pad.as_mut() {
                ep.exposed = true;
            }
        }
    }

    /// Slot interposition by upstream classification.
    pub(crate) fn slot_mode(&self) -> SlotMode {
        let config = self.config.read();
        let upstream = *self.upstream.lock();
        if config.parse_streams && config.use_buffering {
            SlotMode::Parse
        } else if upstream.is_adaptive {
            SlotMode::Adaptive
        } else if upstream.is_stream {
            if config.download && upstream.duration_known {
                SlotMode::Download
            } else {
                SlotMode::Stream
            }
        } else {
            SlotMode::Direct
        }
    }

    /// Removes the block probe and arms the drain watch.
    fn unblock_endpad(self: &Arc<Self>, chain_id: ChainId) {
        let chain = match self.store.chain(chain_id) {
            Some(c) => c,
            None => return,
        };
        let (pad, block_probe, needs_eos_probe) = {
            let mut chain = chain.lock();
            match chain.end_pad.as_mut() {
                Some(ep) => {
                    ep.blocked = false;
                    ep.exposed = true;
                    (ep.pad.clone(), ep.block_probe.take(), ep.eos_probe.is_none())
                }
                None => return,
            }
        };
        if let Some(probe) = block_probe {
            pad.remove_probe(probe);
        }
        self.forget_blocked_pad(&pad);
        if needs_eos_probe {
            let weak = self.weak_self.clone();
            let probe = pad.add_probe(ProbeMask::event_downstream(), move |p, data| {
                if let ProbeData::Event(Event::Eos) = data {
                    if let Some(inner) = weak.upgrade() {
                        let last = inner.handle_endpad_eos(chain_id, p);
                        return if last {
                            ProbeReturn::Pass
                        } else {
                            ProbeReturn::Drop
                        };
                    }
                }
                ProbeReturn::Pass
            });
            if let Some(ep) = chain.lock().end_pad.as_mut() {
                ep.eos_probe = Some(probe);
            }
        }
    }
}
