//! Lifecycle coordination: state transitions, the async handshake, pad
//! exposure, drain propagation and shutdown of the whole engine.

mod drain;
mod expose;
pub mod playitem;

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::autoplug::{AutoplugPolicy, DefaultPolicy};
use crate::buffering::{SlotManager, SlotRef};
use crate::caps::{Caps, MediaCategory};
use crate::chain::{ChainId, ChainStore};
use crate::config::DecodeBinConfig;
use crate::element::{Element, ElementRef, ElementState, StateChange, element_id};
use crate::error::{DecodeError, Result};
use crate::event::Buffer;
use crate::messages::{Bus, InterceptorId, Message};
use crate::pad::{FlowReturn, Pad, PadDirection, ProbeId};
use crate::registry::Registry;
use crate::source::SourceBin;
use crate::typefind::TypeFind;

/// What the engine learned about its upstream; drives slot mode selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamInfo {
    pub is_stream: bool,
    pub is_adaptive: bool,
    pub duration_known: bool,
    pub seekable: bool,
}

/// Shutdown flag plus the set of pads currently held by block probes,
/// guarded by the dyn lock.
pub(crate) struct DynState {
    pub shutdown: bool,
    pub blocked_pads: Vec<(Pad, ProbeId)>,
}

/// Elements whose errors are being swallowed while they are probed,
/// plus the messages collected from them. Keyed by element name, which the
/// engine keeps unique.
pub(crate) struct FilterState {
    pub elements: HashSet<String>,
    pub errors: Vec<(String, DecodeError)>,
    pub interceptor: Option<InterceptorId>,
}

/// An externally visible output pad and the slot delivering it.
pub(crate) struct ExposedPad {
    pub name: String,
    pub chain: ChainId,
    pub category: MediaCategory,
    pub slot: SlotRef,
}

type PadSignal = Box<dyn Fn(&Pad) + Send + Sync>;
type PlainSignal = Box<dyn Fn() + Send + Sync>;
type UnknownTypeSignal = Box<dyn Fn(&Pad, &Caps) + Send + Sync>;
type SourceSignal = Box<dyn Fn(&ElementRef) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Signals {
    pub pad_added: Mutex<Vec<PadSignal>>,
    pub pad_removed: Mutex<Vec<PadSignal>>,
    pub no_more_pads: Mutex<Vec<PlainSignal>>,
    pub unknown_type: Mutex<Vec<UnknownTypeSignal>>,
    pub drained: Mutex<Vec<PlainSignal>>,
    pub about_to_finish: Mutex<Vec<PlainSignal>>,
    pub source_setup: Mutex<Vec<SourceSignal>>,
}

pub(crate) struct FactoriesCache {
    pub cookie: u64,
    pub caps: Caps,
    pub factories: Vec<Arc<crate::registry::Factory>>,
}

pub(crate) struct BinInner {
    pub name: String,
    pub weak_self: Weak<BinInner>,
    pub bus: Bus,
    pub registry: Arc<Registry>,
    pub config: RwLock<DecodeBinConfig>,
    pub policy: RwLock<Arc<dyn AutoplugPolicy>>,
    /// State-change lock: held across a whole transition.
    pub state: Mutex<ElementState>,
    /// Serializes exposure and group switching.
    pub expose_lock: Mutex<()>,
    pub dyn_state: Mutex<DynState>,
    pub factories_cache: Mutex<Option<FactoriesCache>>,
    /// Subtitle lock: encoding string plus the elements it applies to.
    pub subtitle: Mutex<(Option<String>, Vec<ElementRef>)>,
    pub store: ChainStore,
    pub root_chain: Mutex<Option<ChainId>>,
    pub typefind: Mutex<Option<Arc<TypeFind>>>,
    pub sink: Pad,
    pub children: Mutex<Vec<ElementRef>>,
    pub filter: Mutex<FilterState>,
    pub slots: SlotManager,
    pub exposed: Mutex<Vec<ExposedPad>>,
    pub pad_serial: AtomicU32,
    pub elem_serial: AtomicU32,
    pub async_pending: AtomicBool,
    pub have_type: AtomicBool,
    pub upstream: Mutex<UpstreamInfo>,
    pub signals: Signals,
    pub uri: Mutex<Option<String>>,
    pub source: Mutex<Option<SourceBin>>,
}

/// The auto-plugging decode engine: feed it typed or untyped data on its
/// sink pad (or give it a URI) and it exposes decoded output pads.
pub struct DecodeBin {
    pub(crate) inner: Arc<BinInner>,
}

impl DecodeBin {
    pub fn new(name: &str, registry: Arc<Registry>) -> Self {
        Self::with_bus(name, registry, Bus::new())
    }

    /// Shares an existing bus; used when this bin is a building block of a
    /// larger coordinator.
    pub fn with_bus(name: &str, registry: Arc<Registry>, bus: Bus) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<BinInner>| BinInner {
            name: name.to_string(),
            weak_self: weak.clone(),
            bus: bus.clone(),
            registry,
            config: RwLock::new(DecodeBinConfig::default()),
            policy: RwLock::new(Arc::new(DefaultPolicy)),
            state: Mutex::new(ElementState::Null),
            expose_lock: Mutex::new(()),
            dyn_state: Mutex::new(DynState {
                shutdown: false,
                blocked_pads: Vec::new(),
            }),
            factories_cache: Mutex::new(None),
            subtitle: Mutex::new((None, Vec::new())),
            store: ChainStore::new(),
            root_chain: Mutex::new(None),
            typefind: Mutex::new(None),
            sink: Pad::new("sink", PadDirection::Sink),
            children: Mutex::new(Vec::new()),
            filter: Mutex::new(FilterState {
                elements: HashSet::new(),
                errors: Vec::new(),
                interceptor: None,
            }),
            slots: SlotManager::new(name),
            exposed: Mutex::new(Vec::new()),
            pad_serial: AtomicU32::new(0),
            elem_serial: AtomicU32::new(0),
            async_pending: AtomicBool::new(false),
            have_type: AtomicBool::new(false),
            upstream: Mutex::new(UpstreamInfo::default()),
            signals: Signals::default(),
            uri: Mutex::new(None),
            source: Mutex::new(None),
        });
        inner.sink.set_parent_name(name);
        inner.install_sink_forwarding();
        inner.install_buffering_interceptor();
        DecodeBin { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn bus(&self) -> Bus {
        self.inner.bus.clone()
    }

    /// The untyped byte input; link an external source here, or use
    /// `set_uri` instead.
    pub fn sink_pad(&self) -> Pad {
        self.inner.sink.clone()
    }

    pub fn set_uri(&self, uri: Option<&str>) {
        *self.inner.uri.lock() = uri.map(|u| u.to_string());
    }

    pub fn uri(&self) -> Option<String> {
        self.inner.uri.lock().clone()
    }

    pub fn config(&self) -> DecodeBinConfig {
        self.inner.config.read().clone()
    }

    pub fn update_config<F: FnOnce(&mut DecodeBinConfig)>(&self, f: F) {
        let mut config = self.inner.config.write();
        f(&mut config);
    }

    /// Replaces the stop-set caps.
    pub fn set_caps(&self, caps: Caps) {
        self.inner.config.write().caps = caps;
    }

    /// Applies the encoding to every chain element carrying the property.
    pub fn set_subtitle_encoding(&self, encoding: Option<&str>) {
        self.inner.config.write().subtitle_encoding = encoding.map(|e| e.to_string());
        let mut subtitle = self.inner.subtitle.lock();
        subtitle.0 = encoding.map(|e| e.to_string());
        let value = crate::element::PropertyValue::Str(encoding.unwrap_or("").to_string());
        for element in subtitle.1.iter() {
            let _ = element.set_property("subtitle-encoding", value.clone());
        }
    }

    pub fn set_connection_speed(&self, kbps: u64) {
        self.inner.config.write().connection_speed = kbps;
    }

    pub fn set_policy(&self, policy: Arc<dyn AutoplugPolicy>) {
        *self.inner.policy.write() = policy;
    }

    pub fn set_upstream_info(&self, info: UpstreamInfo) {
        *self.inner.upstream.lock() = info;
    }

    pub fn on_pad_added<F: Fn(&Pad) + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.pad_added.lock().push(Box::new(f));
    }

    pub fn on_pad_removed<F: Fn(&Pad) + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.pad_removed.lock().push(Box::new(f));
    }

    pub fn on_no_more_pads<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.no_more_pads.lock().push(Box::new(f));
    }

    pub fn on_unknown_type<F: Fn(&Pad, &Caps) + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.unknown_type.lock().push(Box::new(f));
    }

    pub fn on_drained<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.drained.lock().push(Box::new(f));
    }

    pub fn on_about_to_finish<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.about_to_finish.lock().push(Box::new(f));
    }

    /// Observer called with the source element right after construction,
    /// before data flows.
    pub fn on_source_setup<F: Fn(&ElementRef) + Send + Sync + 'static>(&self, f: F) {
        self.inner.signals.source_setup.lock().push(Box::new(f));
    }

    /// The buffering slot layer behind the exposed pads.
    pub fn slot_manager(&self) -> &SlotManager {
        &self.inner.slots
    }

    /// Currently exposed output pads, in exposure order.
    pub fn src_pads(&self) -> Vec<Pad> {
        self.inner
            .exposed
            .lock()
            .iter()
            .map(|e| e.slot.ghost.pad().clone())
            .collect()
    }

    pub fn set_state(&self, target: ElementState) -> Result<StateChange> {
        self.inner.change_state(target)
    }

    pub fn state(&self) -> ElementState {
        *self.inner.state.lock()
    }
}

impl Drop for DecodeBin {
    fn drop(&mut self) {
        let _ = self.inner.change_state(ElementState::Null);
    }
}

impl BinInner {
    /// The external sink pad forwards into the type finder once one exists.
    fn install_sink_forwarding(self: &Arc<Self>) {
        let weak = self.weak_self.clone();
        self.sink.set_chain_fn(move |_pad, buffer: Buffer| {
            let inner = match weak.upgrade() {
                Some(i) => i,
                None => return FlowReturn::Flushing,
            };
            let typefind = inner.typefind.lock().clone();
            match typefind {
                Some(tf) => tf.sink_pad().chain(buffer),
                None => FlowReturn::Flushing,
            }
        });
        let weak = self.weak_self.clone();
        self.sink.set_event_fn(move |_pad, event| {
            let inner = match weak.upgrade() {
                Some(i) => i,
                None => return false,
            };
            let typefind = inner.typefind.lock().clone();
            match typefind {
                Some(tf) => tf.sink_pad().send_event(event),
                None => false,
            }
        });
    }

    /// Buffering messages from slot queues never leave the bin raw; the
    /// aggregate is posted instead.
    fn install_buffering_interceptor(self: &Arc<Self>) {
        let weak = self.weak_self.clone();
        self.bus.add_interceptor(move |message| {
            let inner = match weak.upgrade() {
                Some(i) => i,
                None => return false,
            };
            if let Message::Buffering { src, percent } = message {
                // Only this bin's own slot queues are aggregated; anything
                // else (including another bin on a shared bus) passes.
                if src == &inner.name || !inner.slots.owns_queue(src) {
                    return false;
                }
                if let Some(aggregated) = inner.slots.on_queue_buffering(src, *percent) {
                    inner
                        .slots
                        .post_aggregated(&inner.bus, &inner.name, aggregated);
                }
                return true;
            }
            false
        });
    }

    pub(crate) fn change_state(self: &Arc<Self>, target: ElementState) -> Result<StateChange> {
        // The state-change lock is held across the whole transition.
        let mut state = self.state.lock();
        let current = *state;
        if current == target {
            return Ok(StateChange::Success);
        }
        log::debug!("{}: state {:?} -> {:?}", self.name, current, target);
        let result = match (current, target) {
            (ElementState::Null, ElementState::Ready) => self.null_to_ready(),
            (ElementState::Null, ElementState::Paused)
            | (ElementState::Null, ElementState::Playing) => {
                self.null_to_ready()?;
                *state = ElementState::Ready;
                self.ready_to_paused()
            }
            (ElementState::Ready, ElementState::Paused)
            | (ElementState::Ready, ElementState::Playing) => self.ready_to_paused(),
            (ElementState::Paused, ElementState::Playing) => Ok(StateChange::Success),
            (ElementState::Playing, ElementState::Paused) => Ok(StateChange::Success),
            (ElementState::Paused, ElementState::Ready)
            | (ElementState::Playing, ElementState::Ready) => self.paused_to_ready(),
            (_, ElementState::Null) => {
                if current >= ElementState::Paused {
                    self.paused_to_ready()?;
                }
                self.ready_to_null()
            }
            (from, to) => Err(DecodeError::StateChange(format!(
                "{}: invalid transition {:?} -> {:?}",
                self.name, from, to
            ))),
        }?;
        *state = target;
        Ok(result)
    }

    /// Null -> Ready: the type finder must exist.
    fn null_to_ready(self: &Arc<Self>) -> Result<StateChange> {
        let mut guard = self.typefind.lock();
        if guard.is_none() {
            let tf = TypeFind::new(&format!("{}-typefind", self.name));
            tf.set_bus(Some(self.bus.clone()));
            let weak = self.weak_self.clone();
            tf.on_have_type(move |caps, probability| {
                if let Some(inner) = weak.upgrade() {
                    inner.type_found(caps, probability);
                }
            });
            *guard = Some(tf);
        }
        Ok(StateChange::Success)
    }

    /// Ready -> Paused: clear shutdown, start the async handshake, run the
    /// source acquirer when a URI is set. Completion is reported via
    /// async-done once exposure finishes.
    fn ready_to_paused(self: &Arc<Self>) -> Result<StateChange> {
        {
            let mut dyn_state = self.dyn_state.lock();
            dyn_state.shutdown = false;
        }
        self.have_type.store(false, Ordering::SeqCst);
        self.do_async_start();

        if let Some(tf) = self.typefind.lock().clone() {
            let force = self.config.read().sink_caps.clone();
            tf.set_force_caps(force);
            tf.set_state(ElementState::Paused)?;
        }

        let uri = self.uri.lock().clone();
        if let Some(uri) = uri {
            match self.start_source(&uri) {
                Ok(()) => {}
                Err(err) => {
                    self.bus.post(Message::Error {
                        src: self.name.clone(),
                        error: err.clone(),
                    });
                    self.do_async_done();
                    return Err(err);
                }
            }
        }
        Ok(StateChange::Async)
    }

    fn start_source(self: &Arc<Self>, uri: &str) -> Result<()> {
        let source = SourceBin::build(self, uri)?;
        *self.source.lock() = Some(source);
        Ok(())
    }

    /// Paused -> Ready: flag shutdown, force every blocked pad open, then
    /// free the chain tree. Teardown flushes outside-in so no producer is
    /// left waiting inside a queue that nobody will drain.
    fn paused_to_ready(self: &Arc<Self>) -> Result<StateChange> {
        let blocked = {
            let mut dyn_state = self.dyn_state.lock();
            dyn_state.shutdown = true;
            std::mem::take(&mut dyn_state.blocked_pads)
        };
        for (pad, probe) in blocked {
            pad.remove_probe(probe);
            pad.set_active(false);
        }

        // Slot queues first: flushing them releases any chain thread
        // blocked pushing into a full output queue.
        self.slots.clear();

        // Then the chain tree, whose multi-queues release the producers.
        let root = self.root_chain.lock().take();
        if let Some(root) = root {
            self.free_chain(root);
        }

        // Only now can the source thread be joined safely.
        if let Some(source) = self.source.lock().take() {
            source.shutdown();
        }
        self.teardown_exposed();

        for element in std::mem::take(&mut *self.children.lock()) {
            let _ = element.set_state(ElementState::Null);
        }
        self.subtitle.lock().1.clear();
        if let Some(tf) = self.typefind.lock().clone() {
            let _ = tf.set_state(ElementState::Null);
        }
        self.sink.unlink();
        self.sink.reset();
        self.have_type.store(false, Ordering::SeqCst);
        if self.async_pending.swap(false, Ordering::SeqCst) {
            self.bus.post(Message::AsyncDone {
                src: self.name.clone(),
            });
        }
        Ok(StateChange::Success)
    }

    fn ready_to_null(self: &Arc<Self>) -> Result<StateChange> {
        *self.typefind.lock() = None;
        Ok(StateChange::Success)
    }

    pub(crate) fn do_async_start(&self) {
        if !self.async_pending.swap(true, Ordering::SeqCst) {
            self.bus.post(Message::AsyncStart {
                src: self.name.clone(),
            });
        }
    }

    pub(crate) fn do_async_done(&self) {
        if self.async_pending.swap(false, Ordering::SeqCst) {
            self.bus.post(Message::AsyncDone {
                src: self.name.clone(),
            });
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.dyn_state.lock().shutdown
    }

    /// Adds an element to the bin: bookkeeping plus bus attachment.
    pub(crate) fn add_element(&self, element: &ElementRef) {
        element.set_bus(Some(self.bus.clone()));
        self.children.lock().push(element.clone());
    }

    pub(crate) fn remove_element(&self, element: &ElementRef) {
        let id = element_id(element);
        self.children.lock().retain(|e| element_id(e) != id);
        element.set_bus(None);
        let _ = element.set_state(ElementState::Null);
    }

    /// Installs the bus interceptor that swallows errors from elements
    /// under probe. Only active while the filtered set is non-empty.
    pub(crate) fn add_error_filter(self: &Arc<Self>, element: &ElementRef) {
        let mut filter = self.filter.lock();
        filter.elements.insert(element.name());
        if filter.interceptor.is_none() {
            let weak = self.weak_self.clone();
            let id = self.bus.add_interceptor(move |message| {
                let inner = match weak.upgrade() {
                    Some(i) => i,
                    None => return false,
                };
                if let Message::Error { src, error } = message {
                    let mut filter = inner.filter.lock();
                    if filter.elements.contains(src) {
                        log::debug!("{}: swallowing error from {}: {}", inner.name, src, error);
                        filter.errors.push((src.clone(), error.clone()));
                        return true;
                    }
                }
                false
            });
            filter.interceptor = Some(id);
        }
    }

    pub(crate) fn remove_error_filter(&self, element: &ElementRef) {
        let mut filter = self.filter.lock();
        filter.elements.remove(&element.name());
        if filter.elements.is_empty() {
            if let Some(id) = filter.interceptor.take() {
                self.bus.remove_interceptor(id);
            }
        }
    }

    /// Swallowed error summaries for missing-plugin diagnostics.
    pub(crate) fn drain_filtered_errors(&self) -> Vec<String> {
        let mut filter = self.filter.lock();
        filter
            .errors
            .drain(..)
            .map(|(src, error)| format!("{}: {}", src, error))
            .collect()
    }

    /// Registers an element for subtitle-encoding propagation and applies
    /// the current value.
    pub(crate) fn register_subtitle_element(&self, element: &ElementRef) {
        let mut subtitle = self.subtitle.lock();
        let encoding = subtitle
            .0
            .clone()
            .or_else(|| self.config.read().subtitle_encoding.clone());
        if let Some(encoding) = encoding {
            let _ = element.set_property(
                "subtitle-encoding",
                crate::element::PropertyValue::Str(encoding),
            );
        }
        subtitle.1.push(element.clone());
    }

    /// Recursively frees a chain: probes off, elements to Null,
    /// store entries dropped.
    pub(crate) fn free_chain(self: &Arc<Self>, id: ChainId) {
        let chain = match self.store.chain(id) {
            Some(c) => c,
            None => return,
        };
        let (groups, elements, pending, end_pad) = {
            let mut chain = chain.lock();
            let mut groups = Vec::new();
            groups.extend(chain.active_group.take());
            groups.append(&mut chain.next_groups);
            groups.append(&mut chain.old_groups);
            let elements: Vec<_> = chain.elements.drain(..).collect();
            let pending: Vec<_> = chain.pending_pads.drain(..).collect();
            let end_pad = chain.end_pad.take();
            (groups, elements, pending, end_pad)
        };
        for pp in pending {
            pp.pad.remove_probe(pp.probe);
        }
        if let Some(ep) = end_pad {
            if let Some(probe) = ep.block_probe {
                ep.pad.remove_probe(probe);
            }
            if let Some(probe) = ep.eos_probe {
                ep.pad.remove_probe(probe);
            }
            self.forget_blocked_pad(&ep.pad);
        }
        for group_id in groups {
            self.free_group(group_id);
        }
        for chain_element in elements.into_iter().rev() {
            if let Some(filter) = &chain_element.capsfilter {
                let as_ref: ElementRef = filter.clone();
                self.remove_element(&as_ref);
            }
            self.remove_element(&chain_element.element);
        }
        self.store.remove_chain(id);
    }

    pub(crate) fn free_group(self: &Arc<Self>, id: crate::chain::GroupId) {
        let group = match self.store.group(id) {
            Some(g) => g,
            None => return,
        };
        let (children, mq) = {
            let group = group.lock();
            (group.children.clone(), group.multiqueue.clone())
        };
        for child in children {
            self.free_chain(child);
        }
        mq.clear_overrun_callbacks();
        let mq_ref: ElementRef = mq;
        self.remove_element(&mq_ref);
        self.store.remove_group(id);
    }

    /// Deferred disposal used when hiding groups during a switch: the
    /// elements keep running until a worker tears them down.
    pub(crate) fn dispose_group_async(self: &Arc<Self>, id: crate::chain::GroupId) {
        let inner = self.clone();
        std::thread::Builder::new()
            .name(format!("{}-dispose", self.name))
            .spawn(move || {
                inner.free_group(id);
            })
            .ok();
    }

    pub(crate) fn forget_blocked_pad(&self, pad: &Pad) {
        let mut dyn_state = self.dyn_state.lock();
        dyn_state.blocked_pads.retain(|(p, _)| p != pad);
    }

    fn teardown_exposed(&self) {
        let exposed = std::mem::take(&mut *self.exposed.lock());
        for entry in exposed {
            let _ = entry.slot.ghost.set_target(None);
            let callbacks = self.signals.pad_removed.lock();
            for cb in callbacks.iter() {
                cb(entry.slot.ghost.pad());
            }
        }
    }

    pub(crate) fn fire_drained(&self) {
        let callbacks = self.signals.drained.lock();
        for cb in callbacks.iter() {
            cb();
        }
    }

    pub(crate) fn fire_about_to_finish(&self) {
        let callbacks = self.signals.about_to_finish.lock();
        for cb in callbacks.iter() {
            cb();
        }
    }
}
