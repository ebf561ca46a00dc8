pub mod error;
pub mod caps;
pub mod event;
pub mod pad;
pub mod element;
pub mod messages;
pub mod registry;
pub mod typefind;
pub mod elements;
pub mod config;
pub mod chain;
pub mod autoplug;
pub mod buffering;
pub mod source;
pub mod lifecycle;

pub use autoplug::{AutoplugPolicy, AutoplugSelect, DefaultPolicy};
pub use buffering::{OutputSlot, SlotManager, SlotMode};
pub use caps::{Caps, FieldValue, MediaCategory, Structure, DEFAULT_RAW_CAPS};
pub use chain::{ChainId, ChainStore, DecodeChain, GroupId, StreamGroup};
pub use config::DecodeBinConfig;
pub use element::{
    Element, ElementCore, ElementRef, ElementState, PropertyKind, PropertySpec, PropertyValue,
    StateChange,
};
pub use elements::{CapsFilter, DownloadBuffer, FakeSink, MultiQueue, PushSource, Queue2};
pub use error::{DecodeError, Result};
pub use event::{Buffer, Event, StickyKind, TagList};
pub use lifecycle::playitem::{PlayItem, UriDecodeBin};
pub use lifecycle::{DecodeBin, UpstreamInfo};
pub use messages::{Bus, Message, RedirectCandidate};
pub use pad::{
    FlowReturn, GhostPad, Pad, PadDirection, ProbeData, ProbeId, ProbeMask, ProbeReturn, Query,
    SchedulingFlags,
};
pub use registry::{rank, Factory, PadPresence, PadTemplate, Registry};
pub use source::{sort_redirect_candidates, SourceBin, SourceKind};
pub use typefind::TypeFind;

/// Installs a stdout logger and the stock source factories into `registry`.
/// Optional; embedders with their own logging just register factories
/// directly.
pub fn init(registry: &Registry) {
    let _ = log::set_logger(&SimpleLogger);
    log::set_max_level(log::LevelFilter::Info);
    elements::register_default_sources(registry);
}

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!("{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}
