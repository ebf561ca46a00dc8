//! Shared fixtures: scriptable demuxers, pass-through decoders and source
//! factories driving the engine without any real media framework.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use decodebin::{
    Buffer, Bus, Caps, DecodeBin, Element, ElementCore, ElementRef, ElementState, Event, FakeSink,
    Factory, FlowReturn, Message, Pad, PadDirection, PadPresence, PadTemplate, PushSource, Query,
    Registry, Result, SchedulingFlags, StateChange, rank,
};

/// One elementary stream a scripted demuxer produces.
#[derive(Clone)]
pub struct StreamSpec {
    pub id: String,
    pub caps: Caps,
    pub payload: Vec<Vec<u8>>,
}

impl StreamSpec {
    pub fn new(id: &str, caps: Caps, buffers: usize, buffer_len: usize) -> Self {
        Self {
            id: id.to_string(),
            caps,
            payload: (0..buffers).map(|i| vec![i as u8; buffer_len]).collect(),
        }
    }
}

/// Scripted demuxer: on the first input buffer it plays out its segments,
/// each being a set of streams. Segments after the first model chained
/// containers: new pads are announced before the previous segment ends.
pub struct TestDemuxer {
    core: ElementCore,
    sink: Pad,
    segments: Vec<Vec<StreamSpec>>,
    started: AtomicBool,
}

impl TestDemuxer {
    pub fn new(name: &str, factory_name: &str, segments: Vec<Vec<StreamSpec>>) -> Arc<Self> {
        let element = Arc::new_cyclic(|weak: &std::sync::Weak<TestDemuxer>| {
            let sink = Pad::new("sink", PadDirection::Sink);
            let w = weak.clone();
            sink.set_chain_fn(move |_pad, _buffer| {
                if let Some(demux) = w.upgrade() {
                    if !demux.started.swap(true, Ordering::SeqCst) {
                        demux.run();
                    }
                }
                FlowReturn::Ok
            });
            sink.set_event_fn(|_pad, _event| true);
            TestDemuxer {
                core: ElementCore::new(name, factory_name),
                sink,
                segments,
                started: AtomicBool::new(false),
            }
        });
        element.core.add_pad(&element.sink);
        element
    }

    fn run(&self) {
        let mut previous: Vec<Pad> = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            let mut pads = Vec::new();
            for (j, spec) in segment.iter().enumerate() {
                let pad = Pad::new(format!("src_{}_{}", i, j), PadDirection::Src);
                pad.push_event(Event::StreamStart {
                    stream_id: spec.id.clone(),
                    group_id: None,
                });
                pad.push_event(Event::Caps(spec.caps.clone()));
                pad.push_event(Event::Segment {
                    start: 0,
                    stop: None,
                });
                self.core.add_dynamic_pad(&pad);
                pads.push(pad);
            }
            self.core.fire_no_more_pads();
            for (pad, spec) in pads.iter().zip(segment) {
                for chunk in &spec.payload {
                    pad.push(Buffer::new(chunk.clone()));
                }
            }
            // Chained boundary: the old streams end only after the new
            // ones were announced and primed.
            for pad in &previous {
                pad.push_event(Event::Eos);
            }
            previous = pads;
        }
        for pad in &previous {
            pad.push_event(Event::Eos);
        }
    }
}

impl Element for TestDemuxer {
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

    fn connect_pad_added(&self, cb: decodebin::element::PadCallback) {
        self.core.on_pad_added(cb);
    }

    fn connect_pad_removed(&self, cb: decodebin::element::PadCallback) {
        self.core.on_pad_removed(cb);
    }

    fn connect_no_more_pads(&self, cb: decodebin::element::SignalCallback) {
        self.core.on_no_more_pads(cb);
    }

    fn set_bus(&self, bus: Option<Bus>) {
        self.core.set_bus(bus);
    }
}

/// Pass-through transform: forwards buffers, converts the caps event to
/// its fixed output format. Stands in for decoders and parsers.
pub struct TestTransform {
    core: ElementCore,
    sink: Pad,
    src: Pad,
}

impl TestTransform {
    pub fn new(name: &str, factory_name: &str, accept: Caps, out_caps: Caps) -> Arc<Self> {
        let sink = Pad::new("sink", PadDirection::Sink);
        let src = Pad::new("src", PadDirection::Src);

        let out = src.clone();
        sink.set_chain_fn(move |_pad, buffer| out.push(buffer));
        let out = src.clone();
        let converted = out_caps.clone();
        sink.set_event_fn(move |_pad, event| match event {
            Event::Caps(_) => out.push_event(Event::Caps(converted.clone())),
            other => out.push_event(other),
        });
        let accepted = accept.clone();
        sink.set_query_fn(move |_pad, query| match query {
            Query::AcceptCaps { caps, result } => {
                *result = caps.can_intersect(&accepted);
                true
            }
            _ => false,
        });
        let announced = out_caps.clone();
        src.set_query_fn(move |_pad, query| match query {
            Query::Caps { result, .. } => {
                *result = Some(announced.clone());
                true
            }
            _ => false,
        });

        let element = Arc::new(TestTransform {
            core: ElementCore::new(name, factory_name),
            sink,
            src,
        });
        element.core.add_pad(&element.sink);
        element.core.add_pad(&element.src);
        element
    }
}

impl Element for TestTransform {
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

    fn set_bus(&self, bus: Option<Bus>) {
        self.core.set_bus(bus);
    }
}

/// Registers a demuxer factory playing out `segments`.
pub fn register_demuxer(
    registry: &Registry,
    name: &str,
    sink_caps: Caps,
    segments: Vec<Vec<StreamSpec>>,
) {
    register_demuxer_with_klass(registry, name, "Codec/Demuxer", sink_caps, segments)
}

pub fn register_adaptive_demuxer(
    registry: &Registry,
    name: &str,
    sink_caps: Caps,
    segments: Vec<Vec<StreamSpec>>,
) {
    register_demuxer_with_klass(registry, name, "Codec/Demuxer/Adaptive", sink_caps, segments)
}

fn register_demuxer_with_klass(
    registry: &Registry,
    name: &str,
    klass: &str,
    sink_caps: Caps,
    segments: Vec<Vec<StreamSpec>>,
) {
    let factory_name = name.to_string();
    let factory = Factory::builder(name)
        .rank(rank::PRIMARY)
        .klass(klass)
        .sink_caps(sink_caps)
        .template(PadTemplate::new(
            "src_%u",
            PadDirection::Src,
            PadPresence::Sometimes,
            Caps::new_any(),
        ))
        .build(move |instance| {
            TestDemuxer::new(instance, &factory_name, segments.clone()) as ElementRef
        });
    registry.register(factory);
}

/// Registers a decoder factory and returns its instantiation counter.
pub fn register_decoder(
    registry: &Registry,
    name: &str,
    sink_caps: Caps,
    out_caps: Caps,
) -> Arc<AtomicUsize> {
    register_transform(registry, name, "Codec/Decoder", sink_caps, out_caps)
}

pub fn register_parser(
    registry: &Registry,
    name: &str,
    sink_caps: Caps,
    out_caps: Caps,
) -> Arc<AtomicUsize> {
    register_transform(registry, name, "Codec/Parser", sink_caps, out_caps)
}

fn register_transform(
    registry: &Registry,
    name: &str,
    klass: &str,
    sink_caps: Caps,
    out_caps: Caps,
) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let count = counter.clone();
    let factory_name = name.to_string();
    let factory = Factory::builder(name)
        .rank(rank::PRIMARY)
        .klass(klass)
        .sink_caps(sink_caps.clone())
        .src_caps(out_caps.clone())
        .build(move |instance| {
            count.fetch_add(1, Ordering::SeqCst);
            TestTransform::new(instance, &factory_name, sink_caps.clone(), out_caps.clone())
                as ElementRef
        });
    registry.register(factory);
    counter
}

/// Registers an in-memory network source for `scheme`, serving `data`.
pub fn register_net_source(
    registry: &Registry,
    name: &str,
    scheme: &str,
    data: Vec<u8>,
    flags: SchedulingFlags,
    duration: Option<u64>,
) {
    let factory = Factory::builder(name)
        .rank(rank::PRIMARY)
        .klass("Source/Network")
        .scheme(scheme)
        .template(PadTemplate::new(
            "src",
            PadDirection::Src,
            PadPresence::Always,
            Caps::new_any(),
        ))
        .build(move |instance| {
            let source = PushSource::from_bytes(instance, data.clone());
            source.set_scheduling_flags(flags);
            source.set_duration(duration);
            source as ElementRef
        });
    registry.register(factory);
}

/// Registers a source producing already-typed raw data.
pub fn register_raw_source(registry: &Registry, scheme: &str, data: Vec<u8>, caps: Caps) {
    let factory = Factory::builder("rawsrc")
        .rank(rank::PRIMARY)
        .klass("Source/Test")
        .scheme(scheme)
        .template(PadTemplate::new(
            "src",
            PadDirection::Src,
            PadPresence::Always,
            Caps::new_any(),
        ))
        .build(move |instance| {
            let source = PushSource::from_bytes(instance, data.clone());
            source.set_caps(Some(caps.clone()));
            source as ElementRef
        });
    registry.register(factory);
}

pub fn base_registry() -> Arc<Registry> {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = Arc::new(Registry::new());
    decodebin::init(&registry);
    registry
}

/// Writes a temp file and returns its `file://` URI together with the
/// guard keeping it alive.
pub fn temp_media_file(content: &[u8]) -> (tempfile::NamedTempFile, String) {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content).expect("write media");
    let uri = format!("file://{}", file.path().display());
    (file, uri)
}

/// Ogg-looking container payload the built-in typefind recognizes.
pub fn ogg_bytes(len: usize) -> Vec<u8> {
    let mut data = b"OggS\x00".to_vec();
    data.resize(len.max(5), 0x5A);
    data
}

pub fn mp3_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0xFF, 0xFB];
    data.resize(len.max(2), 0x11);
    data
}

pub fn hls_bytes() -> Vec<u8> {
    b"#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n".to_vec()
}

/// Auto-links a FakeSink to every pad the bin exposes.
pub struct SinkHarness {
    pub sinks: Arc<Mutex<Vec<(String, Arc<FakeSink>)>>>,
    pub pads_added: Arc<AtomicUsize>,
    pub pads_removed: Arc<AtomicUsize>,
    pub no_more_pads: Arc<AtomicUsize>,
}

impl SinkHarness {
    pub fn attach(bin: &DecodeBin) -> Self {
        let sinks = Arc::new(Mutex::new(Vec::new()));
        let pads_added = Arc::new(AtomicUsize::new(0));
        let pads_removed = Arc::new(AtomicUsize::new(0));
        let no_more_pads = Arc::new(AtomicUsize::new(0));

        let s = sinks.clone();
        let added = pads_added.clone();
        bin.on_pad_added(move |pad| {
            added.fetch_add(1, Ordering::SeqCst);
            let sink = FakeSink::new(&format!("sink-{}", pad.name()));
            pad.link(sink.sink_pad()).expect("link sink");
            s.lock().push((pad.name().to_string(), sink));
        });
        let removed = pads_removed.clone();
        bin.on_pad_removed(move |_pad| {
            removed.fetch_add(1, Ordering::SeqCst);
        });
        let nmp = no_more_pads.clone();
        bin.on_no_more_pads(move || {
            nmp.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            sinks,
            pads_added,
            pads_removed,
            no_more_pads,
        }
    }

    pub fn sink(&self, pad_name: &str) -> Option<Arc<FakeSink>> {
        self.sinks
            .lock()
            .iter()
            .find(|(name, _)| name == pad_name)
            .map(|(_, sink)| sink.clone())
    }

    pub fn wait_all_eos(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let sinks = self.sinks.lock();
            if sinks.len() >= count && sinks.iter().all(|(_, s)| s.eos_received()) {
                return true;
            }
            drop(sinks);
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

/// Polls the bus snapshot for a matching message without consuming it.
pub fn wait_for_message<F: Fn(&Message) -> bool>(bus: &Bus, timeout: Duration, pred: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if bus.snapshot().iter().any(&pred) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

pub fn wait_async_done(bus: &Bus, timeout: Duration) -> bool {
    wait_for_message(bus, timeout, |m| matches!(m, Message::AsyncDone { .. }))
}
