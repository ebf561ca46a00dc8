//! The recursive plugging engine: for every new pad decide whether to
//! expose it, give up on it, park it until its caps settle, or plug the
//! next best factory and recurse.

mod policy;

pub use policy::{AutoplugPolicy, AutoplugSelect, DefaultPolicy};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::caps::{Caps, DEFAULT_RAW_CAPS};
use crate::chain::{ChainElement, ChainId, EndPad, GroupId, PendingPad, configure_multiqueue};
use crate::element::{Element, ElementRef, ElementState, PropertyValue, element_id, try_set_property};
use crate::elements::{CapsFilter, MultiQueue};
use crate::error::DecodeError;
use crate::event::Event;
use crate::lifecycle::BinInner;
use crate::messages::Message;
use crate::pad::{Pad, ProbeData, ProbeMask, ProbeReturn, Query};
use crate::registry::{Factory, PadPresence};

impl BinInner {
    /// Entry point from the type finder.
    pub(crate) fn type_found(self: &Arc<Self>, caps: &Caps, probability: u32) {
        // A second type-found for the same stream is ignored once the
        // first has begun building the chain.
        if self.have_type.swap(true, Ordering::SeqCst) {
            log::debug!("{}: already typed, ignoring {}", self.name, caps);
            return;
        }
        log::debug!("{}: typed as {} ({}%)", self.name, caps, probability);

        if caps.media_type() == Some("text/plain") {
            self.bus.post(Message::Error {
                src: self.name.clone(),
                error: DecodeError::WrongType("stream is plain text".to_string()),
            });
            self.do_async_done();
            return;
        }

        let typefind = match self.typefind.lock().clone() {
            Some(tf) => tf,
            None => return,
        };
        let pad = typefind.src_pad().clone();
        let chain_id = self.store.new_chain(None, pad.clone());
        *self.root_chain.lock() = Some(chain_id);

        // Adaptive formats get their demuxer directly, outside the factory
        // loop; everything downstream of it is bitrate-managed.
        if let Some(adaptive) = self.registry.adaptive_demuxer_for(caps) {
            self.upstream.lock().is_adaptive = true;
            self.plug_adaptive(&adaptive, &pad, caps, chain_id);
            return;
        }

        let element: ElementRef = typefind;
        self.analyze_new_pad(&element, &pad, Some(caps.clone()), chain_id);
    }

    fn plug_adaptive(
        self: &Arc<Self>,
        factory: &Arc<Factory>,
        pad: &Pad,
        caps: &Caps,
        chain_id: ChainId,
    ) {
        log::debug!("{}: plugging adaptive demuxer {}", self.name, factory.name());
        let element = factory.create(&self.next_element_name(factory.name()));
        self.add_element(&element);
        let sink = match element.sink_pads().into_iter().next() {
            Some(s) => s,
            None => {
                self.remove_element(&element);
                self.unknown_type(pad, caps, chain_id, true);
                return;
            }
        };
        if pad.link(&sink).is_err() || element.set_state(ElementState::Paused).is_err() {
            self.remove_element(&element);
            self.unknown_type(pad, caps, chain_id, true);
            return;
        }
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            chain.elements.push(ChainElement {
                element: element.clone(),
                capsfilter: None,
            });
            chain.demuxer = true;
        }
        self.connect_element(&element, chain_id);
    }

    pub(crate) fn next_element_name(&self, factory_name: &str) -> String {
        let n = self.elem_serial.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}{}", self.name, factory_name, n)
    }

    /// Registry query with the documented sort, cached until the registry
    /// cookie moves or the caps change.
    fn cached_factories(&self, caps: &Caps) -> Vec<Arc<Factory>> {
        let cookie = self.registry.cookie();
        {
            let cache = self.factories_cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.cookie == cookie && cached.caps.equals(caps) {
                    return cached.factories.clone();
                }
            }
        }
        let factories = self.registry.decodable_factories(caps);
        *self.factories_cache.lock() = Some(crate::lifecycle::FactoriesCache {
            cookie,
            caps: caps.clone(),
            factories: factories.clone(),
        });
        factories
    }

    /// Decides the fate of one new pad. Mirrors the documented ordering
    /// exactly; every early exit lands in one of the labelled helpers.
    pub(crate) fn analyze_new_pad(
        self: &Arc<Self>,
        src: &ElementRef,
        pad: &Pad,
        caps: Option<Caps>,
        chain_id: ChainId,
    ) {
        let mut pad = pad.clone();
        let mut chain_id = chain_id;
        log::debug!(
            "{}: analyzing pad {:?} caps {:?}",
            self.name,
            pad,
            caps.as_ref().map(|c| c.to_string())
        );

        let chain = match self.store.chain(chain_id) {
            Some(c) => c,
            None => return,
        };
        {
            let chain = chain.lock();
            if let Some(last) = chain.last_element() {
                let matches_last = element_id(&last.element) == element_id(src)
                    || last
                        .capsfilter
                        .as_ref()
                        .map(|cf| cf.name() == src.name())
                        .unwrap_or(false);
                if !matches_last {
                    log::error!("{}: new pad from not the last element in chain", self.name);
                    return;
                }
            }
            if chain.end_pad.is_some() {
                log::error!("{}: new pad in an already complete chain", self.name);
                return;
            }
        }

        // A demuxer pad starts a new child chain inside the current group.
        let is_demuxer_chain = chain.lock().demuxer;
        if is_demuxer_chain {
            let group = match self.select_current_group(chain_id) {
                Some(g) => g,
                None => {
                    log::warn!("{}: no current group, dropping pad {:?}", self.name, pad);
                    return;
                }
            };
            chain_id = self.store.new_chain(Some(group), pad.clone());
        }

        // No caps at all behaves like ANY: wait for them to appear.
        let caps = caps
            .or_else(|| get_pad_caps(&pad))
            .unwrap_or_else(Caps::new_any);
        if caps.is_empty() {
            self.unknown_type(&pad, &caps, chain_id, src_is_typefind(self, src));
            return;
        }

        if caps.is_any() {
            self.setup_caps_delay(src, &pad, chain_id);
            return;
        }

        let policy = self.policy.read().clone();

        // Fixed caps consult the continue hook; non-fixed caps assume
        // continue and are delayed below.
        let apcontinue = if caps.is_fixed() {
            policy.autoplug_continue(&pad, &caps)
        } else {
            true
        };
        let stop_caps = self.config.read().caps.clone();
        if !apcontinue || caps.is_subset(&stop_caps) {
            self.expose_pad(src, &pad, &caps, chain_id);
            return;
        }

        let is_parser_converter = self
            .registry
            .find(&src.factory_name())
            .map(|f| f.is_parser() && f.is_converter())
            .unwrap_or(false);

        if !is_parser_converter && !caps.is_fixed() {
            self.setup_caps_delay(src, &pad, chain_id);
            return;
        }

        let default = self.cached_factories(&caps);
        let factories = match policy.autoplug_factories(&pad, &caps, default) {
            None => {
                self.expose_pad(src, &pad, &caps, chain_id);
                return;
            }
            Some(list) => list,
        };

        let expose_all = self.config.read().expose_all_streams;
        if factories.is_empty() {
            if !expose_all && DEFAULT_RAW_CAPS.can_intersect(&caps) {
                self.discarded_type(&caps, chain_id);
            } else {
                self.unknown_type(&pad, &caps, chain_id, src_is_typefind(self, src));
            }
            return;
        }

        let mut factories = policy
            .autoplug_sort(&pad, &caps, &factories)
            .unwrap_or(factories);

        // Parse mode: only containers and parsers are plugged; a pad no
        // (fresh) parser or demuxer can take is a finished elementary
        // stream.
        if self.config.read().parse_streams {
            factories.retain(|f| f.is_parser() || f.has_demux_klass());
            let usable = factories
                .iter()
                .any(|f| !(f.is_parser() && self.factory_used_in_chain(chain_id, f)));
            if factories.is_empty() || !usable {
                if let Some(chain) = self.store.chain(chain_id) {
                    chain.lock().parsed = true;
                }
                self.expose_pad(src, &pad, &caps, chain_id);
                return;
            }
        }

        // Early skip: candidate decoders whose output would be raw but
        // outside the stop-set mean this stream is unwanted.
        if !expose_all && caps.is_fixed() {
            let mut dontuse = false;
            for factory in &factories {
                if !factory.is_decoder() {
                    continue;
                }
                for template in factory.src_templates() {
                    let tcaps = &template.caps;
                    if policy.autoplug_continue(&pad, tcaps) && !tcaps.is_subset(&stop_caps) {
                        dontuse = true;
                        break;
                    }
                }
                if dontuse {
                    break;
                }
            }
            if dontuse {
                self.discarded_type(&caps, chain_id);
                return;
            }
        }

        // Parser/Converter: constrain its output to what the candidates
        // can take, then continue from the filter's src pad.
        if is_parser_converter {
            pad = self.insert_parser_capsfilter(src, &pad, &caps, &factories, chain_id);
            if !caps.is_fixed() {
                self.setup_caps_delay(src, &pad, chain_id);
                return;
            }
        }

        if !self.connect_pad(src, &pad, &caps, factories, chain_id) {
            self.unknown_type(&pad, &caps, chain_id, src_is_typefind(self, src));
        }
    }

    /// Union of the candidates' sink templates intersected with the
    /// current caps, plus the caps themselves as fallback.
    fn insert_parser_capsfilter(
        self: &Arc<Self>,
        src: &ElementRef,
        pad: &Pad,
        caps: &Caps,
        factories: &[Arc<Factory>],
        chain_id: ChainId,
    ) -> Pad {
        let own_factory = src.factory_name();
        let mut filter_caps = Caps::new_empty();
        for factory in factories {
            if factory.name() == own_factory {
                continue;
            }
            for template in factory.sink_templates() {
                if template.presence != PadPresence::Always {
                    continue;
                }
                filter_caps.merge(&template.caps.intersect(caps));
            }
        }
        filter_caps.merge(caps);

        let filter = CapsFilter::new(&self.next_element_name("capsfilter"));
        filter.set_filter_caps(Some(filter_caps));
        let filter_ref: ElementRef = filter.clone();
        self.add_element(&filter_ref);
        let _ = filter.set_state(ElementState::Paused);
        if pad.link(filter.sink_pad()).is_err() {
            log::warn!("{}: could not insert parser capsfilter", self.name);
            self.remove_element(&filter_ref);
            return pad.clone();
        }
        let out = filter.src_pad().clone();
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            if let Some(last) = chain.elements.last_mut() {
                last.capsfilter = Some(filter);
            }
        }
        out
    }

    /// The factory loop: try candidates in order until one sticks.
    pub(crate) fn connect_pad(
        self: &Arc<Self>,
        src: &ElementRef,
        pad: &Pad,
        caps: &Caps,
        factories: Vec<Arc<Factory>>,
        chain_id: ChainId,
    ) -> bool {
        let mut src = src.clone();
        let mut pad = pad.clone();
        let policy = self.policy.read().clone();

        // First pad of a group child chain is rerouted through the
        // group's multi-queue.
        if self.needs_multiqueue_reroute(chain_id, &src) {
            match self.reroute_through_multiqueue(chain_id, &pad) {
                Some((mq, mq_src)) => {
                    src = mq;
                    pad = mq_src;
                }
                None => return false,
            }
        }

        for factory in factories {
            if caps.is_fixed() && !factory.accepts_subset(caps) {
                log::debug!(
                    "{}: {} templates do not take {}",
                    self.name,
                    factory.name(),
                    caps
                );
                continue;
            }

            // A parser accepting its own output would loop forever; other
            // classes may legitimately repeat (nested tag demuxers).
            if factory.is_parser() && self.factory_used_in_chain(chain_id, &factory) {
                log::debug!(
                    "{}: skipping {}: already used in this chain",
                    self.name,
                    factory.name()
                );
                continue;
            }

            match policy.autoplug_select(&pad, caps, &factory) {
                AutoplugSelect::Try => {}
                AutoplugSelect::Expose => {
                    self.expose_pad(&src, &pad, caps, chain_id);
                    return true;
                }
                AutoplugSelect::Skip => continue,
            }

            if self.try_factory(&src, &pad, caps, &factory, chain_id) {
                return true;
            }
        }
        false
    }

    fn needs_multiqueue_reroute(&self, chain_id: ChainId, src: &ElementRef) -> bool {
        let chain = match self.store.chain(chain_id) {
            Some(c) => c,
            None => return false,
        };
        let (parent_group, empty) = {
            let chain = chain.lock();
            (chain.parent_group, chain.elements.is_empty())
        };
        let group_id = match parent_group {
            Some(g) if empty => g,
            _ => return false,
        };
        match self.store.group(group_id) {
            Some(group) => {
                let mq: ElementRef = group.lock().multiqueue.clone();
                element_id(&mq) != element_id(src)
            }
            None => false,
        }
    }

    pub(crate) fn reroute_through_multiqueue(
        self: &Arc<Self>,
        chain_id: ChainId,
        pad: &Pad,
    ) -> Option<(ElementRef, Pad)> {
        let group_id = self.store.chain(chain_id)?.lock().parent_group?;
        let mq = self.store.group(group_id)?.lock().multiqueue.clone();
        let slot = mq.request_slot();
        if let Err(err) = pad.link(slot.sink_pad()) {
            log::warn!("{}: multiqueue link failed: {}", self.name, err);
            return None;
        }
        log::debug!(
            "{}: routed {:?} through {}",
            self.name,
            pad,
            slot.sink_pad().name()
        );
        Some((mq as ElementRef, slot.src_pad().clone()))
    }

    fn factory_used_in_chain(&self, chain_id: ChainId, factory: &Arc<Factory>) -> bool {
        let chain = match self.store.chain(chain_id) {
            Some(c) => c,
            None => return false,
        };
        let (used, parent_group, parse_streams) = {
            let chain = chain.lock();
            let used = chain
                .elements
                .iter()
                .any(|e| e.element.factory_name() == factory.name());
            (used, chain.parent_group, self.config.read().parse_streams)
        };
        if used {
            return true;
        }
        // Parse variant: also guard against the parent chain's demuxer
        // position.
        if parse_streams {
            if let Some(group_id) = parent_group {
                if let Some(group) = self.store.group(group_id) {
                    let parent_chain = group.lock().parent_chain;
                    if let Some(parent) = self.store.chain(parent_chain) {
                        return parent
                            .lock()
                            .last_element()
                            .map(|e| e.element.factory_name() == factory.name())
                            .unwrap_or(false);
                    }
                }
            }
        }
        false
    }

    /// Instantiate, link and bring up one candidate; on any failure the
    /// attempt is rolled back and the next factory gets its turn.
    fn try_factory(
        self: &Arc<Self>,
        _src: &ElementRef,
        pad: &Pad,
        caps: &Caps,
        factory: &Arc<Factory>,
        chain_id: ChainId,
    ) -> bool {
        log::debug!("{}: trying factory {}", self.name, factory.name());
        let element = factory.create(&self.next_element_name(factory.name()));

        // Swallow anything the candidate posts while we probe it.
        self.add_error_filter(&element);
        self.add_element(&element);

        let sink = match element.sink_pads().into_iter().next() {
            Some(s) => s,
            None => {
                log::warn!("{}: {} has no sink pad", self.name, element.name());
                self.remove_error_filter(&element);
                self.remove_element(&element);
                return false;
            }
        };
        if let Err(err) = pad.link(&sink) {
            log::warn!("{}: link failed: {}", self.name, err);
            self.remove_error_filter(&element);
            self.remove_element(&element);
            return false;
        }
        if element.set_state(ElementState::Ready).is_err() {
            log::warn!("{}: {} refused READY", self.name, element.name());
            pad.unlink();
            self.remove_error_filter(&element);
            self.remove_element(&element);
            return false;
        }
        // The sink may still refuse the exact caps once in READY.
        if caps.is_fixed() && !sink.query_accept_caps(caps) {
            log::warn!(
                "{}: {} rejected caps {} after READY",
                self.name,
                element.name(),
                caps
            );
            let _ = element.set_state(ElementState::Null);
            pad.unlink();
            self.remove_error_filter(&element);
            self.remove_element(&element);
            self.filter.lock().errors.push((
                element.name(),
                DecodeError::NegotiationFailed {
                    element: element.name(),
                },
            ));
            return false;
        }

        self.remove_error_filter(&element);

        let is_demuxer = factory.is_demuxer();
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            chain.elements.push(ChainElement {
                element: element.clone(),
                capsfilter: None,
            });
            chain.demuxer = is_demuxer;
        }

        if is_demuxer {
            let speed = self.config.read().connection_speed;
            try_set_property(&element, "connection-speed", &PropertyValue::UInt64(speed));
        }
        if element.property_spec("subtitle-encoding").is_some() {
            self.register_subtitle_element(&element);
        }

        self.connect_element(&element, chain_id);

        if element.set_state(ElementState::Paused).is_err() {
            log::warn!("{}: {} refused PAUSED, rolling back", self.name, element.name());
            self.rollback_chain_to(chain_id, &element);
            return false;
        }
        true
    }

    /// Removes every element added to the chain during a failed attempt,
    /// most-downstream first, including their pending pads.
    fn rollback_chain_to(self: &Arc<Self>, chain_id: ChainId, element: &ElementRef) {
        let chain = match self.store.chain(chain_id) {
            Some(c) => c,
            None => return,
        };
        loop {
            let entry = {
                let mut chain = chain.lock();
                match chain.elements.pop() {
                    Some(e) => {
                        let name = e.element.name();
                        let removed: Vec<PendingPad> = {
                            let mut kept = Vec::new();
                            let mut dropped = Vec::new();
                            for pp in chain.pending_pads.drain(..) {
                                if pp.pad.parent_name() == name {
                                    dropped.push(pp);
                                } else {
                                    kept.push(pp);
                                }
                            }
                            chain.pending_pads = kept;
                            dropped
                        };
                        Some((e, removed))
                    }
                    None => None,
                }
            };
            let (entry, dropped_pads) = match entry {
                Some(e) => e,
                None => break,
            };
            for pp in dropped_pads {
                pp.pad.remove_probe(pp.probe);
            }
            if let Some(capsfilter) = &entry.capsfilter {
                let cf: ElementRef = capsfilter.clone();
                self.remove_element(&cf);
            }
            for sink in entry.element.sink_pads() {
                if let Some(peer) = sink.peer() {
                    peer.unlink();
                }
            }
            self.remove_element(&entry.element);
            let done = element_id(&entry.element) == element_id(element);
            if done {
                break;
            }
        }
    }

    /// Walks the new element's source pad templates: Always pads must
    /// exist and are analyzed, Sometimes pads subscribe the dynamic
    /// signals, Request pads are ignored.
    pub(crate) fn connect_element(self: &Arc<Self>, element: &ElementRef, chain_id: ChainId) {
        let factory = self.registry.find(&element.factory_name());
        let mut dynamic = false;
        let mut to_connect: Vec<Pad> = Vec::new();

        if let Some(factory) = &factory {
            for template in factory.src_templates() {
                match template.presence {
                    PadPresence::Always => {
                        match element.static_pad(&template.name_template) {
                            Some(pad) => to_connect.push(pad),
                            None => log::warn!(
                                "{}: {} lacks always pad {}",
                                self.name,
                                element.name(),
                                template.name_template
                            ),
                        }
                    }
                    PadPresence::Sometimes => {
                        // The pad may exist already; otherwise the element
                        // will announce it.
                        let existing: Vec<Pad> = element
                            .src_pads()
                            .into_iter()
                            .filter(|p| !p.is_linked())
                            .collect();
                        if existing.is_empty() {
                            dynamic = true;
                        } else {
                            to_connect.extend(existing);
                        }
                    }
                    PadPresence::Request => {}
                }
            }
        } else {
            // Unregistered helper elements: take their unlinked src pads.
            to_connect.extend(
                element
                    .src_pads()
                    .into_iter()
                    .filter(|p| !p.is_linked()),
            );
        }

        to_connect.dedup_by_key(|p| p.id());

        if dynamic {
            let weak = self.weak_self.clone();
            let element_ref = element.clone();
            element.connect_pad_added(Box::new(move |pad| {
                if let Some(inner) = weak.upgrade() {
                    if inner.is_shutdown() {
                        return;
                    }
                    inner.analyze_new_pad(&element_ref, pad, get_pad_caps(pad), chain_id);
                }
            }));
            let weak = self.weak_self.clone();
            element.connect_pad_removed(Box::new(move |pad| {
                if let Some(inner) = weak.upgrade() {
                    inner.pending_pad_removed(chain_id, pad);
                }
            }));
            let weak = self.weak_self.clone();
            element.connect_no_more_pads(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.no_more_pads(chain_id);
                }
            }));
        }

        for pad in to_connect {
            let caps = get_pad_caps(&pad);
            self.analyze_new_pad(element, &pad, caps, chain_id);
        }
    }

    /// Demuxer finished announcing pads: latch the current group closed
    /// and see whether the tree can be exposed.
    pub(crate) fn no_more_pads(self: &Arc<Self>, chain_id: ChainId) {
        log::debug!("{}: no more pads on {}", self.name, chain_id);
        let group_id = self.current_open_group(chain_id);
        if let Some(group_id) = group_id {
            if let Some(group) = self.store.group(group_id) {
                group.lock().no_more_pads = true;
            }
        }
        self.expose_if_complete();
    }

    fn current_open_group(&self, chain_id: ChainId) -> Option<GroupId> {
        let chain = self.store.chain(chain_id)?;
        let (active, next) = {
            let chain = chain.lock();
            (chain.active_group, chain.next_groups.clone())
        };
        if let Some(active) = active {
            if self.store.group_is_open(active) {
                return Some(active);
            }
        }
        next.into_iter()
            .rev()
            .find(|g| self.store.group_is_open(*g))
            .or(active)
    }

    pub(crate) fn pending_pad_removed(&self, chain_id: ChainId, pad: &Pad) {
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            if let Some(pos) = chain.pending_pads.iter().position(|pp| &pp.pad == pad) {
                let pp = chain.pending_pads.remove(pos);
                pp.pad.remove_probe(pp.probe);
            }
        }
    }

    /// Group selection when a demuxer adds a pad: reuse the open group,
    /// or start a pending one; pads after completion without
    /// no-more-pads are refused.
    pub(crate) fn select_current_group(self: &Arc<Self>, chain_id: ChainId) -> Option<GroupId> {
        let chain = self.store.chain(chain_id)?;
        let (active, next_groups) = {
            let chain = chain.lock();
            (chain.active_group, chain.next_groups.clone())
        };

        if let Some(active_id) = active {
            let (overrun, no_more_pads) = match self.store.group(active_id) {
                Some(g) => {
                    let g = g.lock();
                    (g.overrun, g.no_more_pads)
                }
                None => (false, false),
            };
            if next_groups.is_empty() && overrun && !no_more_pads {
                log::warn!(
                    "{}: demuxer added pads after group overrun without no-more-pads",
                    self.name
                );
                return None;
            }
            if !overrun && !no_more_pads {
                return Some(active_id);
            }
            if let Some(open) = next_groups.iter().find(|g| self.store.group_is_open(**g)) {
                return Some(*open);
            }
            // All groups closed: a chained stream begins a new group.
            let group_id = self.make_group(chain_id)?;
            chain.lock().next_groups.insert(0, group_id);
            Some(group_id)
        } else {
            let group_id = self.make_group(chain_id)?;
            chain.lock().active_group = Some(group_id);
            Some(group_id)
        }
    }

    fn make_group(self: &Arc<Self>, parent_chain: ChainId) -> Option<GroupId> {
        let mq = MultiQueue::new(&self.next_element_name("multiqueue"));
        let seekable = self.upstream.lock().seekable;
        {
            let config = self.config.read();
            configure_multiqueue(&mq, &config, true, seekable);
        }
        let mq_ref: ElementRef = mq.clone();
        self.add_element(&mq_ref);
        let group_id = self.store.new_group(parent_chain, mq.clone());

        let weak = self.weak_self.clone();
        mq.on_overrun(move || {
            if let Some(inner) = weak.upgrade() {
                inner.group_overrun(group_id);
            }
        });
        let _ = mq.set_state(ElementState::Paused);
        log::debug!("{}: created {} for {}", self.name, group_id, parent_chain);
        Some(group_id)
    }

    fn group_overrun(self: &Arc<Self>, group_id: GroupId) {
        if let Some(group) = self.store.group(group_id) {
            let mut group = group.lock();
            if group.overrun {
                return;
            }
            group.overrun = true;
        }
        log::debug!("{}: {} overran", self.name, group_id);
        self.expose_if_complete();
    }

    /// Parks a pad whose caps are not usable yet. Fixed caps re-enter
    /// analysis; EOS without caps dead-ends the chain.
    pub(crate) fn setup_caps_delay(self: &Arc<Self>, src: &ElementRef, pad: &Pad, chain_id: ChainId) {
        log::debug!("{}: delaying {:?} until caps settle", self.name, pad);
        let weak = self.weak_self.clone();
        let src = src.clone();
        let probe_pad = pad.clone();
        let probe = pad.add_probe(ProbeMask::event_downstream(), move |_p, data| {
            let inner = match weak.upgrade() {
                Some(i) => i,
                None => return ProbeReturn::Remove,
            };
            match data {
                ProbeData::Event(Event::Caps(caps)) if caps.is_fixed() => {
                    let caps = caps.clone();
                    inner.pending_pad_fixed(&src, &probe_pad, caps, chain_id);
                    ProbeReturn::Remove
                }
                ProbeData::Event(Event::Eos) => {
                    inner.pending_pad_eos(&probe_pad, chain_id);
                    ProbeReturn::Pass
                }
                _ => ProbeReturn::Pass,
            }
        });
        if let Some(chain) = self.store.chain(chain_id) {
            chain.lock().pending_pads.push(PendingPad {
                pad: pad.clone(),
                probe,
            });
        }
    }

    fn pending_pad_fixed(self: &Arc<Self>, src: &ElementRef, pad: &Pad, caps: Caps, chain_id: ChainId) {
        log::debug!("{}: pending pad {:?} fixed to {}", self.name, pad, caps);
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            if let Some(pos) = chain.pending_pads.iter().position(|pp| &pp.pad == pad) {
                chain.pending_pads.remove(pos);
            }
        }
        self.analyze_new_pad(src, pad, Some(caps), chain_id);
    }

    /// A stream that announced a format but ended without data.
    fn pending_pad_eos(self: &Arc<Self>, pad: &Pad, chain_id: ChainId) {
        log::debug!("{}: pending pad {:?} saw EOS before data", self.name, pad);
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            if let Some(pos) = chain.pending_pads.iter().position(|pp| &pp.pad == pad) {
                let pp = chain.pending_pads.remove(pos);
                pp.pad.remove_probe(pp.probe);
            }
            chain.deadend = true;
            chain.end_caps = None;
        }
        self.expose_if_complete();
    }

    /// Terminal: nothing can handle this stream.
    pub(crate) fn unknown_type(
        self: &Arc<Self>,
        pad: &Pad,
        caps: &Caps,
        chain_id: ChainId,
        from_typefind: bool,
    ) {
        log::info!("{}: unknown type {} on {:?}", self.name, caps, pad);
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            chain.deadend = true;
            chain.end_caps = Some(caps.clone());
            chain.deadend_details = Some(caps.to_string());
        }

        self.bus.post(Message::Element {
            src: self.name.clone(),
            name: "missing-decoder".to_string(),
            payload: serde_json::json!({ "caps": caps.to_string() }),
        });
        {
            let policy = self.policy.read().clone();
            policy.unknown_type(pad, caps);
            let callbacks = self.signals.unknown_type.lock();
            for cb in callbacks.iter() {
                cb(pad, caps);
            }
        }

        self.expose_if_complete();

        if from_typefind {
            let error = if !caps.is_empty() {
                DecodeError::MissingPlugin {
                    details: format!("no decoder for media type {}", caps),
                }
            } else {
                DecodeError::WrongType("could not determine type of stream".to_string())
            };
            self.bus.post(Message::Error {
                src: self.name.clone(),
                error,
            });
            self.do_async_done();
        }
    }

    /// Silent dead end: a known but unwanted stream.
    fn discarded_type(self: &Arc<Self>, caps: &Caps, chain_id: ChainId) {
        log::debug!("{}: discarding stream {}", self.name, caps);
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            chain.deadend = true;
            chain.end_caps = Some(caps.clone());
        }
        self.expose_if_complete();
        self.do_async_done();
    }

    /// Final pad of a chain: reroute through the group queue if needed,
    /// then block it until the whole tree is ready.
    pub(crate) fn expose_pad(self: &Arc<Self>, src: &ElementRef, pad: &Pad, caps: &Caps, chain_id: ChainId) {
        let mut pad = pad.clone();
        if self.needs_multiqueue_reroute(chain_id, src) {
            if let Some((_, mq_src)) = self.reroute_through_multiqueue(chain_id, &pad) {
                pad = mq_src;
            }
        }
        log::debug!("{}: exposing {:?} with caps {}", self.name, pad, caps);

        let block_probe = self.block_endpad(&pad, chain_id);
        if let Some(chain) = self.store.chain(chain_id) {
            let mut chain = chain.lock();
            let mut endpad = EndPad::new(pad.clone());
            endpad.block_probe = block_probe;
            chain.end_pad = Some(endpad);
            chain.end_caps = Some(caps.clone());
        }
        self.expose_if_complete();
    }
}

pub(crate) fn get_pad_caps(pad: &Pad) -> Option<Caps> {
    if let Some(caps) = pad.current_caps() {
        return Some(caps);
    }
    let mut query = Query::Caps {
        filter: None,
        result: None,
    };
    if pad.query(&mut query) {
        if let Query::Caps { result: Some(caps), .. } = query {
            return Some(caps);
        }
    }
    None
}

fn src_is_typefind(inner: &BinInner, src: &ElementRef) -> bool {
    inner
        .typefind
        .lock()
        .as_ref()
        .map(|tf| tf.name() == src.name())
        .unwrap_or(false)
}
