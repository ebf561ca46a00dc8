use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::caps::Caps;
use crate::error::{DecodeError, Result};
use crate::event::{Buffer, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    Src,
    Sink,
}

/// Result of pushing data through a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowReturn {
    Ok,
    NotLinked,
    Flushing,
    Eos,
    Error,
}

/// Scheduling capabilities reported by a source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SchedulingFlags {
    pub seekable: bool,
    pub sequential: bool,
    pub bandwidth_limited: bool,
}

/// Queries are answered by the element owning the queried pad.
#[derive(Debug, Clone)]
pub enum Query {
    AcceptCaps { caps: Caps, result: bool },
    Caps { filter: Option<Caps>, result: Option<Caps> },
    Scheduling { flags: SchedulingFlags, answered: bool },
    Duration { nanos: Option<u64> },
    Seeking { seekable: bool, answered: bool },
}

/// Which data a probe observes. `block` additionally suspends the producing
/// thread for blockable data until the probe is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeMask {
    pub block: bool,
    pub buffer: bool,
    pub event: bool,
    pub query: bool,
}

impl ProbeMask {
    /// Downstream blocking probe: observes buffers and events, blocks.
    pub fn block_downstream() -> Self {
        Self {
            block: true,
            buffer: true,
            event: true,
            query: false,
        }
    }

    pub fn event_downstream() -> Self {
        Self {
            block: false,
            buffer: false,
            event: true,
            query: false,
        }
    }

    pub fn buffers() -> Self {
        Self {
            block: false,
            buffer: true,
            event: false,
            query: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Let the data through (for a blocking probe: after the block lifts).
    Pass,
    /// Swallow the data; upstream sees a successful flow.
    Drop,
    /// Remove this probe, then pass the data.
    Remove,
    /// The probe consumed the data and upstream must not process it further.
    Handled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(pub u64);

pub enum ProbeData<'a> {
    Buffer(&'a Buffer),
    Event(&'a Event),
    Query(&'a mut Query),
}

pub type ProbeCallback = Arc<dyn Fn(&Pad, &mut ProbeData<'_>) -> ProbeReturn + Send + Sync>;

type ChainFn = Arc<dyn Fn(&Pad, Buffer) -> FlowReturn + Send + Sync>;
type EventFn = Arc<dyn Fn(&Pad, Event) -> bool + Send + Sync>;
type QueryFn = Arc<dyn Fn(&Pad, &mut Query) -> bool + Send + Sync>;

struct ProbeEntry {
    id: ProbeId,
    mask: ProbeMask,
    callback: ProbeCallback,
}

struct PadState {
    peer: Option<Weak<PadInner>>,
    sticky: Vec<Event>,
    probes: Vec<ProbeEntry>,
    flushing: bool,
    active: bool,
    eos: bool,
}

pub struct PadInner {
    name: String,
    direction: PadDirection,
    parent_name: Mutex<String>,
    state: Mutex<PadState>,
    cond: Condvar,
    chain_fn: Mutex<Option<ChainFn>>,
    event_fn: Mutex<Option<EventFn>>,
    query_fn: Mutex<Option<QueryFn>>,
}

static NEXT_PROBE_ID: AtomicU64 = AtomicU64::new(1);

/// A directional connection point on an element. Cheap to clone.
#[derive(Clone)]
pub struct Pad {
    inner: Arc<PadInner>,
}

impl fmt::Debug for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pad({}:{})",
            self.inner.parent_name.lock(),
            self.inner.name
        )
    }
}

impl PartialEq for Pad {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pad {}

impl Pad {
    pub fn new(name: impl Into<String>, direction: PadDirection) -> Self {
        Self {
            inner: Arc::new(PadInner {
                name: name.into(),
                direction,
                parent_name: Mutex::new(String::new()),
                state: Mutex::new(PadState {
                    peer: None,
                    sticky: Vec::new(),
                    probes: Vec::new(),
                    flushing: false,
                    active: true,
                    eos: false,
                }),
                cond: Condvar::new(),
                chain_fn: Mutex::new(None),
                event_fn: Mutex::new(None),
                query_fn: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn direction(&self) -> PadDirection {
        self.inner.direction
    }

    pub fn parent_name(&self) -> String {
        self.inner.parent_name.lock().clone()
    }

    pub fn set_parent_name(&self, name: &str) {
        *self.inner.parent_name.lock() = name.to_string();
    }

    /// Stable identity for set/map membership.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn set_chain_fn<F>(&self, f: F)
    where
        F: Fn(&Pad, Buffer) -> FlowReturn + Send + Sync + 'static,
    {
        *self.inner.chain_fn.lock() = Some(Arc::new(f));
    }

    pub fn set_event_fn<F>(&self, f: F)
    where
        F: Fn(&Pad, Event) -> bool + Send + Sync + 'static,
    {
        *self.inner.event_fn.lock() = Some(Arc::new(f));
    }

    pub fn set_query_fn<F>(&self, f: F)
    where
        F: Fn(&Pad, &mut Query) -> bool + Send + Sync + 'static,
    {
        *self.inner.query_fn.lock() = Some(Arc::new(f));
    }

    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    pub fn peer(&self) -> Option<Pad> {
        let state = self.inner.state.lock();
        state
            .peer
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|inner| Pad { inner })
    }

    /// Links a src pad to a sink pad and replays the src pad's sticky events
    /// into the new peer.
    pub fn link(&self, sink: &Pad) -> Result<()> {
        if self.direction() != PadDirection::Src || sink.direction() != PadDirection::Sink {
            return Err(DecodeError::LinkFailed(format!(
                "{:?} -> {:?}: wrong directions",
                self, sink
            )));
        }
        {
            let mut src_state = self.inner.state.lock();
            if src_state.peer.as_ref().and_then(|w| w.upgrade()).is_some() {
                return Err(DecodeError::LinkFailed(format!("{:?} already linked", self)));
            }
            src_state.peer = Some(Arc::downgrade(&sink.inner));
        }
        {
            let mut sink_state = sink.inner.state.lock();
            if sink_state.peer.as_ref().and_then(|w| w.upgrade()).is_some() {
                let mut src_state = self.inner.state.lock();
                src_state.peer = None;
                return Err(DecodeError::LinkFailed(format!("{:?} already linked", sink)));
            }
            sink_state.peer = Some(Arc::downgrade(&self.inner));
        }
        let sticky = self.sticky_events();
        for event in sticky {
            sink.send_event(event);
        }
        Ok(())
    }

    pub fn unlink(&self) {
        let peer = self.peer();
        {
            let mut state = self.inner.state.lock();
            state.peer = None;
        }
        if let Some(peer) = peer {
            let mut state = peer.inner.state.lock();
            state.peer = None;
        }
    }

    /// Sticky events in replay order.
    pub fn sticky_events(&self) -> Vec<Event> {
        let state = self.inner.state.lock();
        let mut events = state.sticky.clone();
        events.sort_by_key(|e| e.sticky_kind());
        events
    }

    pub fn clear_sticky(&self) {
        self.inner.state.lock().sticky.clear();
    }

    pub fn current_caps(&self) -> Option<Caps> {
        let state = self.inner.state.lock();
        state.sticky.iter().find_map(|e| match e {
            Event::Caps(caps) => Some(caps.clone()),
            _ => None,
        })
    }

    pub fn stream_start(&self) -> Option<(String, Option<u32>)> {
        let state = self.inner.state.lock();
        state.sticky.iter().find_map(|e| match e {
            Event::StreamStart { stream_id, group_id } => {
                Some((stream_id.clone(), *group_id))
            }
            _ => None,
        })
    }

    pub fn is_eos(&self) -> bool {
        self.inner.state.lock().eos
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.state.lock().flushing
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Returns the pad to its pristine state for reuse after a teardown.
    pub(crate) fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.sticky.clear();
        state.eos = false;
        state.flushing = false;
        state.active = true;
    }

    /// Deactivating flushes the pad and wakes any blocked producer.
    pub fn set_active(&self, active: bool) {
        {
            let mut state = self.inner.state.lock();
            state.active = active;
            state.flushing = !active;
        }
        self.inner.cond.notify_all();
    }

    pub fn add_probe<F>(&self, mask: ProbeMask, callback: F) -> ProbeId
    where
        F: Fn(&Pad, &mut ProbeData<'_>) -> ProbeReturn + Send + Sync + 'static,
    {
        let id = ProbeId(NEXT_PROBE_ID.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state.lock();
        state.probes.push(ProbeEntry {
            id,
            mask,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn remove_probe(&self, id: ProbeId) {
        {
            let mut state = self.inner.state.lock();
            state.probes.retain(|p| p.id != id);
        }
        self.inner.cond.notify_all();
    }

    pub fn has_probe(&self, id: ProbeId) -> bool {
        self.inner.state.lock().probes.iter().any(|p| p.id == id)
    }

    pub fn num_probes(&self) -> usize {
        self.inner.state.lock().probes.len()
    }

    fn matching_probes(&self, data: &ProbeData<'_>) -> Vec<(ProbeId, ProbeMask, ProbeCallback)> {
        let state = self.inner.state.lock();
        state
            .probes
            .iter()
            .filter(|p| match data {
                ProbeData::Buffer(_) => p.mask.buffer,
                ProbeData::Event(_) => p.mask.event,
                ProbeData::Query(_) => p.mask.query,
            })
            .map(|p| (p.id, p.mask, p.callback.clone()))
            .collect()
    }

    /// Whether this datum is subject to blocking. Sticky events pass through
    /// so downstream can initialize; EOS and its internal surrogate are
    /// handled by their own probes; out-of-band events never block.
    fn is_blockable(data: &ProbeData<'_>) -> bool {
        match data {
            ProbeData::Buffer(_) => true,
            ProbeData::Event(event) => {
                event.is_serialized()
                    && !event.is_sticky()
                    && !matches!(event, Event::Eos | Event::CustomEos | Event::FlushStop)
            }
            ProbeData::Query(_) => false,
        }
    }

    /// Runs matching probes; blocks the calling thread while a BLOCK probe is
    /// installed and the datum is blockable. Returns what to do with the
    /// datum, or `Err(Flushing)` when the pad flushed while blocked.
    fn run_probes(&self, data: &mut ProbeData<'_>) -> std::result::Result<ProbeReturn, FlowReturn> {
        let blockable = Self::is_blockable(data);
        let probes = self.matching_probes(data);
        for (id, mask, callback) in probes {
            // The probe may have been removed while an earlier one ran.
            if !self.has_probe(id) {
                continue;
            }
            let ret = callback(self, data);
            match ret {
                ProbeReturn::Remove => {
                    self.remove_probe(id);
                }
                ProbeReturn::Drop => return Ok(ProbeReturn::Drop),
                ProbeReturn::Handled => return Ok(ProbeReturn::Handled),
                ProbeReturn::Pass => {}
            }
            if mask.block && blockable && ret == ProbeReturn::Pass {
                self.block_until_unblocked_or_shutdown(id)?;
            }
        }
        // A block probe may have been installed by one of the callbacks.
        if blockable {
            loop {
                let blocking = {
                    let state = self.inner.state.lock();
                    state.probes.iter().find(|p| p.mask.block).map(|p| p.id)
                };
                match blocking {
                    Some(id) => self.block_until_unblocked_or_shutdown(id)?,
                    None => break,
                }
            }
        }
        Ok(ProbeReturn::Pass)
    }

    /// The single blocking primitive: suspend until the probe is removed or
    /// the pad starts flushing.
    fn block_until_unblocked_or_shutdown(&self, id: ProbeId) -> std::result::Result<(), FlowReturn> {
        let mut state = self.inner.state.lock();
        loop {
            if state.flushing {
                return Err(FlowReturn::Flushing);
            }
            if !state.probes.iter().any(|p| p.id == id) {
                return Ok(());
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Pushes a buffer downstream from a src pad.
    pub fn push(&self, buffer: Buffer) -> FlowReturn {
        if self.is_flushing() {
            return FlowReturn::Flushing;
        }
        {
            let mut data = ProbeData::Buffer(&buffer);
            match self.run_probes(&mut data) {
                Ok(ProbeReturn::Drop) | Ok(ProbeReturn::Handled) => return FlowReturn::Ok,
                Ok(_) => {}
                Err(flow) => return flow,
            }
        }
        match self.peer() {
            Some(peer) => peer.chain(buffer),
            None => FlowReturn::NotLinked,
        }
    }

    /// Delivers a buffer into a sink pad.
    pub fn chain(&self, buffer: Buffer) -> FlowReturn {
        if self.is_flushing() {
            return FlowReturn::Flushing;
        }
        if self.is_eos() {
            return FlowReturn::Eos;
        }
        {
            let mut data = ProbeData::Buffer(&buffer);
            match self.run_probes(&mut data) {
                Ok(ProbeReturn::Drop) | Ok(ProbeReturn::Handled) => return FlowReturn::Ok,
                Ok(_) => {}
                Err(flow) => return flow,
            }
        }
        let chain_fn = self.inner.chain_fn.lock().clone();
        match chain_fn {
            Some(f) => f(self, buffer),
            None => FlowReturn::Ok,
        }
    }

    /// Pushes an event downstream from a src pad. Sticky events are retained
    /// on the pad even when it is not linked yet.
    pub fn push_event(&self, event: Event) -> bool {
        match &event {
            Event::FlushStart => {
                self.set_flushing_downstream(true);
                if let Some(peer) = self.peer() {
                    return peer.send_event(event);
                }
                return true;
            }
            Event::FlushStop => {
                self.set_flushing_downstream(false);
            }
            _ => {}
        }
        if event.is_sticky() {
            self.store_sticky(event.clone());
        }
        if matches!(event, Event::Eos) {
            self.inner.state.lock().eos = true;
        }
        {
            let mut data = ProbeData::Event(&event);
            match self.run_probes(&mut data) {
                Ok(ProbeReturn::Drop) | Ok(ProbeReturn::Handled) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        match self.peer() {
            Some(peer) => peer.send_event(event),
            None => event.is_sticky(),
        }
    }

    /// Delivers an event into a sink pad.
    pub fn send_event(&self, event: Event) -> bool {
        match &event {
            Event::FlushStart => {
                let mut state = self.inner.state.lock();
                state.flushing = true;
                drop(state);
                self.inner.cond.notify_all();
            }
            Event::FlushStop => {
                let mut state = self.inner.state.lock();
                state.flushing = false;
                state.eos = false;
            }
            _ => {}
        }
        if event.is_sticky() {
            self.store_sticky(event.clone());
        }
        if matches!(event, Event::Eos) {
            self.inner.state.lock().eos = true;
        }
        {
            let mut data = ProbeData::Event(&event);
            match self.run_probes(&mut data) {
                Ok(ProbeReturn::Drop) | Ok(ProbeReturn::Handled) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        let event_fn = self.inner.event_fn.lock().clone();
        match event_fn {
            Some(f) => f(self, event),
            None => true,
        }
    }

    fn set_flushing_downstream(&self, flushing: bool) {
        let mut state = self.inner.state.lock();
        state.flushing = flushing;
        if !flushing {
            state.eos = false;
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    fn store_sticky(&self, event: Event) {
        let kind = event.sticky_kind();
        let mut state = self.inner.state.lock();
        state.sticky.retain(|e| e.sticky_kind() != kind);
        state.sticky.push(event);
    }

    /// Asks the element owning this pad. Query probes observe the exchange.
    pub fn query(&self, query: &mut Query) -> bool {
        {
            let mut data = ProbeData::Query(query);
            match self.run_probes(&mut data) {
                Ok(ProbeReturn::Handled) => return true,
                Ok(ProbeReturn::Drop) => return false,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        let query_fn = self.inner.query_fn.lock().clone();
        match query_fn {
            Some(f) => f(self, query),
            None => false,
        }
    }

    pub fn query_accept_caps(&self, caps: &Caps) -> bool {
        let mut query = Query::AcceptCaps {
            caps: caps.clone(),
            result: false,
        };
        if self.query(&mut query) {
            matches!(query, Query::AcceptCaps { result: true, .. })
        } else {
            // An element without an accept-caps handler accepts what its
            // current caps or template would.
            true
        }
    }

    /// Waits until this pad has seen a caps sticky event.
    pub fn wait_caps(&self, timeout: Duration) -> Option<Caps> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(caps) = self.current_caps() {
                return Some(caps);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Proxies an internal target pad to an externally visible src pad.
/// Retargeting clears the external sticky cache and replays the new
/// target's sticky events.
#[derive(Clone)]
pub struct GhostPad {
    external: Pad,
    internal: Pad,
    target: Arc<Mutex<Option<Pad>>>,
}

impl GhostPad {
    pub fn new(name: impl Into<String>) -> Self {
        let external = Pad::new(name, PadDirection::Src);
        let internal = Pad::new("proxy", PadDirection::Sink);
        let ext = external.clone();
        internal.set_chain_fn(move |_pad, buffer| ext.push(buffer));
        let ext = external.clone();
        internal.set_event_fn(move |_pad, event| ext.push_event(event));
        Self {
            external,
            internal,
            target: Arc::new(Mutex::new(None)),
        }
    }

    pub fn pad(&self) -> &Pad {
        &self.external
    }

    pub fn target(&self) -> Option<Pad> {
        self.target.lock().clone()
    }

    pub fn set_target(&self, target: Option<&Pad>) -> Result<()> {
        let old = self.target.lock().take();
        if let Some(old) = old {
            old.unlink();
        }
        self.external.clear_sticky();
        if let Some(target) = target {
            target.link(&self.internal)?;
            *self.target.lock() = Some(target.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Caps;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn linked_pair() -> (Pad, Pad) {
        let src = Pad::new("src", PadDirection::Src);
        let sink = Pad::new("sink", PadDirection::Sink);
        src.link(&sink).unwrap();
        (src, sink)
    }

    #[test]
    fn test_link_and_push() {
        let (src, sink) = linked_pair();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sink.set_chain_fn(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            FlowReturn::Ok
        });
        assert_eq!(src.push(Buffer::new(vec![0u8; 4])), FlowReturn::Ok);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        src.unlink();
        assert_eq!(src.push(Buffer::new(vec![0u8; 4])), FlowReturn::NotLinked);
    }

    #[test]
    fn test_sticky_replay_on_link() {
        let src = Pad::new("src", PadDirection::Src);
        src.push_event(Event::StreamStart {
            stream_id: "s0".into(),
            group_id: Some(1),
        });
        src.push_event(Event::Caps(Caps::simple("audio/mpeg")));

        let sink = Pad::new("sink", PadDirection::Sink);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sink.set_event_fn(move |_, event| {
            s.lock().push(event.name().to_string());
            true
        });
        src.link(&sink).unwrap();
        let names = seen.lock().clone();
        assert_eq!(names, vec!["stream-start", "caps"]);
        assert!(sink.current_caps().is_some());
    }

    #[test]
    fn test_block_probe_blocks_buffers_passes_sticky() {
        let (src, sink) = linked_pair();
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();
        sink.set_chain_fn(move |_, _| {
            g.fetch_add(1, Ordering::SeqCst);
            FlowReturn::Ok
        });
        let probe = src.add_probe(ProbeMask::block_downstream(), |_, _| ProbeReturn::Pass);

        // Sticky events pass through a blocked pad.
        assert!(src.push_event(Event::Caps(Caps::simple("audio/mpeg"))));
        assert!(sink.current_caps().is_some());

        let src2 = src.clone();
        let handle = std::thread::spawn(move || src2.push(Buffer::new(vec![1, 2, 3])));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(got.load(Ordering::SeqCst), 0);

        src.remove_probe(probe);
        assert_eq!(handle.join().unwrap(), FlowReturn::Ok);
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocked_producer_released_by_flush() {
        let (src, _sink) = linked_pair();
        let _probe = src.add_probe(ProbeMask::block_downstream(), |_, _| ProbeReturn::Pass);
        let src2 = src.clone();
        let handle = std::thread::spawn(move || src2.push(Buffer::new(vec![0])));
        std::thread::sleep(Duration::from_millis(20));
        src.set_active(false);
        assert_eq!(handle.join().unwrap(), FlowReturn::Flushing);
    }

    #[test]
    fn test_probe_drop() {
        let (src, sink) = linked_pair();
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();
        sink.set_chain_fn(move |_, _| {
            g.fetch_add(1, Ordering::SeqCst);
            FlowReturn::Ok
        });
        src.add_probe(ProbeMask::buffers(), |_, _| ProbeReturn::Drop);
        assert_eq!(src.push(Buffer::new(vec![0])), FlowReturn::Ok);
        assert_eq!(got.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ghost_pad_retarget_replays_sticky() {
        let ghost = GhostPad::new("src_0");
        let out = Pad::new("consumer", PadDirection::Sink);
        ghost.pad().link(&out).unwrap();

        let target_a = Pad::new("a", PadDirection::Src);
        target_a.push_event(Event::Caps(Caps::simple("audio/x-raw")));
        ghost.set_target(Some(&target_a)).unwrap();
        assert_eq!(
            ghost.pad().current_caps().unwrap().media_type(),
            Some("audio/x-raw")
        );

        let target_b = Pad::new("b", PadDirection::Src);
        target_b.push_event(Event::Caps(Caps::simple("video/x-raw")));
        ghost.set_target(Some(&target_b)).unwrap();
        assert_eq!(
            ghost.pad().current_caps().unwrap().media_type(),
            Some("video/x-raw")
        );
    }
}
