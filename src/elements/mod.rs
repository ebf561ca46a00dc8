//! Built-in collaborator elements the engine inserts around the chains it
//! builds: queues, the caps filter, the download cache and basic sources.

mod capsfilter;
mod downloadbuffer;
mod fakesink;
mod multiqueue;
mod pushsrc;
pub(crate) mod queuecell;
mod queue2;

pub use capsfilter::CapsFilter;
pub use downloadbuffer::DownloadBuffer;
pub use fakesink::FakeSink;
pub use multiqueue::{MqSlot, MultiQueue};
pub use pushsrc::PushSource;
pub use queue2::Queue2;

use crate::caps::Caps;
use crate::element::ElementRef;
use crate::registry::{rank, Factory, PadTemplate, PadPresence, Registry};
use crate::pad::PadDirection;

/// Registers the stock `file://` source so local URIs work out of the box.
pub fn register_default_sources(registry: &Registry) {
    let filesrc = Factory::builder("filesrc")
        .rank(rank::PRIMARY)
        .klass("Source/File")
        .scheme("file")
        .template(PadTemplate::new(
            "src",
            PadDirection::Src,
            PadPresence::Always,
            Caps::new_any(),
        ))
        .build(|name| PushSource::from_file(name) as ElementRef);
    registry.register(filesrc);
}

/// Strips the scheme and host part of a `file://` URI.
pub fn file_uri_to_path(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("file://")?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}
