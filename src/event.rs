use crate::caps::Caps;

/// A unit of media data flowing downstream.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    pub data: Vec<u8>,
    pub pts: Option<u64>,
    pub duration: Option<u64>,
}

impl Buffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pts: None,
            duration: None,
        }
    }

    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Stream tags. Only the fields the engine actually consumes are modeled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagList {
    /// Nominal bitrate in bits per second.
    pub bitrate: Option<u64>,
    /// Minimum bitrate, used by redirect candidate sorting.
    pub minimum_bitrate: Option<u64>,
    pub title: Option<String>,
}

/// Events travelling with the data flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StreamStart {
        stream_id: String,
        group_id: Option<u32>,
    },
    Caps(Caps),
    StreamCollection {
        stream_ids: Vec<String>,
    },
    Segment {
        start: u64,
        stop: Option<u64>,
    },
    Tag(TagList),
    Eos,
    /// Internal surrogate for EOS on pending or replaced slots. Flows through
    /// buffering elements without marking the downstream pad EOS.
    CustomEos,
    FlushStart,
    FlushStop,
}

/// The kinds of events a pad retains as sticky, in replay order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StickyKind {
    StreamStart,
    Caps,
    StreamCollection,
    Segment,
    Tag,
}

impl Event {
    pub fn sticky_kind(&self) -> Option<StickyKind> {
        match self {
            Event::StreamStart { .. } => Some(StickyKind::StreamStart),
            Event::Caps(_) => Some(StickyKind::Caps),
            Event::StreamCollection { .. } => Some(StickyKind::StreamCollection),
            Event::Segment { .. } => Some(StickyKind::Segment),
            Event::Tag(_) => Some(StickyKind::Tag),
            _ => None,
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky_kind().is_some()
    }

    /// Serialized events travel in-band with buffers; `FlushStart` is the
    /// only out-of-band event in this model.
    pub fn is_serialized(&self) -> bool {
        !matches!(self, Event::FlushStart)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::StreamStart { .. } => "stream-start",
            Event::Caps(_) => "caps",
            Event::StreamCollection { .. } => "stream-collection",
            Event::Segment { .. } => "segment",
            Event::Tag(_) => "tag",
            Event::Eos => "eos",
            Event::CustomEos => "custom-eos",
            Event::FlushStart => "flush-start",
            Event::FlushStop => "flush-stop",
        }
    }
}
