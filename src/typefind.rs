use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::caps::{Caps, Structure};
use crate::element::{Element, ElementCore, ElementState, PropertyValue, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::{Buffer, Event};
use crate::messages::{Bus, Message};
use crate::pad::{FlowReturn, Pad, PadDirection};

pub const PROB_MAXIMUM: u32 = 100;
pub const PROB_LIKELY: u32 = 80;
pub const PROB_POSSIBLE: u32 = 50;
pub const PROB_MINIMUM: u32 = 1;

/// Bytes accumulated before giving up on a confident match and taking the
/// best candidate seen so far.
const TYPE_FIND_LIMIT: usize = 4096;

type FinderFn = fn(&[u8]) -> Option<(Caps, u32)>;

/// Built-in stream signatures, checked in order.
static TYPE_FINDERS: Lazy<Vec<(&'static str, FinderFn)>> = Lazy::new(|| {
    vec![
        ("ogg", find_ogg as FinderFn),
        ("matroska", find_matroska),
        ("wav", find_wav),
        ("mp4", find_mp4),
        ("hls", find_hls),
        ("mp3", find_mp3),
        ("text", find_text),
    ]
});

fn find_ogg(data: &[u8]) -> Option<(Caps, u32)> {
    if data.starts_with(b"OggS") {
        Some((Caps::simple("application/ogg"), PROB_MAXIMUM))
    } else {
        None
    }
}

fn find_matroska(data: &[u8]) -> Option<(Caps, u32)> {
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some((Caps::simple("video/x-matroska"), PROB_MAXIMUM))
    } else {
        None
    }
}

fn find_wav(data: &[u8]) -> Option<(Caps, u32)> {
    if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WAVE" {
        Some((Caps::simple("audio/x-wav"), PROB_MAXIMUM))
    } else {
        None
    }
}

fn find_mp4(data: &[u8]) -> Option<(Caps, u32)> {
    if data.len() >= 8 && &data[4..8] == b"ftyp" {
        Some((Caps::simple("video/quicktime"), PROB_MAXIMUM))
    } else {
        None
    }
}

fn find_hls(data: &[u8]) -> Option<(Caps, u32)> {
    if data.starts_with(b"#EXTM3U") {
        Some((Caps::simple("application/x-hls"), PROB_LIKELY + 10))
    } else {
        None
    }
}

fn find_mp3(data: &[u8]) -> Option<(Caps, u32)> {
    let caps: Caps = Structure::new("audio/mpeg")
        .field("mpegversion", 1)
        .field("layer", 3)
        .into();
    if data.starts_with(b"ID3") {
        return Some((caps, PROB_MAXIMUM));
    }
    if data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xE0) == 0xE0 {
        return Some((caps, PROB_LIKELY));
    }
    None
}

fn find_text(data: &[u8]) -> Option<(Caps, u32)> {
    if data.is_empty() {
        return None;
    }
    let printable = data
        .iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7F).contains(&b));
    if printable {
        Some((Caps::simple("text/plain"), PROB_POSSIBLE))
    } else {
        None
    }
}

/// Runs all type finders over `data` and returns the best match.
pub fn find_type(data: &[u8]) -> Option<(Caps, u32)> {
    let mut best: Option<(Caps, u32)> = None;
    for (_, finder) in TYPE_FINDERS.iter() {
        if let Some((caps, prob)) = finder(data) {
            let better = match &best {
                Some((_, best_prob)) => prob > *best_prob,
                None => true,
            };
            if better {
                best = Some((caps, prob));
            }
        }
    }
    best
}

type HaveTypeCallback = Box<dyn Fn(&Caps, u32) + Send + Sync>;

struct TypeFindState {
    accumulated: Vec<u8>,
    force_caps: Option<Caps>,
    callbacks: Vec<HaveTypeCallback>,
}

/// Determines the media type of an untyped byte stream, then becomes a
/// pass-through.
pub struct TypeFind {
    core: ElementCore,
    sink: Pad,
    src: Pad,
    typed: AtomicBool,
    state: Mutex<TypeFindState>,
}

impl TypeFind {
    pub fn new(name: &str) -> Arc<Self> {
        let element = Arc::new(Self {
            core: ElementCore::new(name, "typefind"),
            sink: Pad::new("sink", PadDirection::Sink),
            src: Pad::new("src", PadDirection::Src),
            typed: AtomicBool::new(false),
            state: Mutex::new(TypeFindState {
                accumulated: Vec::new(),
                force_caps: None,
                callbacks: Vec::new(),
            }),
        });
        element.core.add_pad(&element.sink);
        element.core.add_pad(&element.src);

        let this = element.clone();
        element.sink.set_chain_fn(move |_pad, buffer| this.chain(buffer));
        let this = element.clone();
        element
            .sink
            .set_event_fn(move |_pad, event| this.sink_event(event));
        element
    }

    pub fn sink_pad(&self) -> &Pad {
        &self.sink
    }

    pub fn src_pad(&self) -> &Pad {
        &self.src
    }

    pub fn set_force_caps(&self, caps: Option<Caps>) {
        self.state.lock().force_caps = caps;
    }

    pub fn on_have_type<F>(&self, cb: F)
    where
        F: Fn(&Caps, u32) + Send + Sync + 'static,
    {
        self.state.lock().callbacks.push(Box::new(cb));
    }

    fn announce(&self, caps: &Caps, probability: u32) {
        // Re-entrant have-type for the same stream is ignored.
        if self.typed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(
            "{}: found type {} (probability {})",
            self.core.name(),
            caps,
            probability
        );
        self.src.push_event(Event::Caps(caps.clone()));
        self.core.post_message(Message::HaveType {
            src: self.core.name().to_string(),
            caps: caps.clone(),
        });
        let callbacks = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.callbacks)
        };
        for cb in &callbacks {
            cb(caps, probability);
        }
        self.state.lock().callbacks = callbacks;
    }

    fn chain(&self, buffer: Buffer) -> FlowReturn {
        if self.typed.load(Ordering::SeqCst) {
            return self.src.push(buffer);
        }
        let decision = {
            let mut state = self.state.lock();
            if let Some(forced) = state.force_caps.clone() {
                state.accumulated.extend_from_slice(&buffer.data);
                Some((forced, PROB_MAXIMUM))
            } else {
                state.accumulated.extend_from_slice(&buffer.data);
                let found = find_type(&state.accumulated);
                match found {
                    Some((caps, prob))
                        if prob >= PROB_LIKELY || state.accumulated.len() >= TYPE_FIND_LIMIT =>
                    {
                        Some((caps, prob))
                    }
                    Some(_) if state.accumulated.len() < TYPE_FIND_LIMIT => None,
                    other => {
                        if state.accumulated.len() >= TYPE_FIND_LIMIT {
                            other
                        } else {
                            None
                        }
                    }
                }
            }
        };
        match decision {
            Some((caps, prob)) => {
                self.announce(&caps, prob);
                let pending = std::mem::take(&mut self.state.lock().accumulated);
                self.src.push(Buffer::new(pending))
            }
            None => {
                let over_limit = self.state.lock().accumulated.len() >= TYPE_FIND_LIMIT;
                if over_limit {
                    self.core.post_error(DecodeError::WrongType(
                        "could not determine stream type".to_string(),
                    ));
                    return FlowReturn::Error;
                }
                FlowReturn::Ok
            }
        }
    }

    fn sink_event(&self, event: Event) -> bool {
        // Upstream already negotiated a type: adopt it, no sniffing needed.
        if let Event::Caps(caps) = &event {
            if !self.typed.load(Ordering::SeqCst) && caps.is_fixed() {
                self.announce(&caps.clone(), PROB_MAXIMUM);
                return true;
            }
        }
        if matches!(event, Event::Eos) && !self.typed.load(Ordering::SeqCst) {
            let pending = {
                let state = self.state.lock();
                state.accumulated.clone()
            };
            match find_type(&pending) {
                Some((caps, prob)) if prob >= PROB_MINIMUM => {
                    self.announce(&caps, prob);
                    let pending = std::mem::take(&mut self.state.lock().accumulated);
                    if !pending.is_empty() {
                        self.src.push(Buffer::new(pending));
                    }
                }
                _ => {
                    self.core.post_error(DecodeError::WrongType(
                        "stream ended before its type could be determined".to_string(),
                    ));
                }
            }
        }
        self.src.push_event(event)
    }
}

impl Element for TypeFind {
    fn name(&self) -> String {
        self.core.name().to_string()
    }

    fn factory_name(&self) -> String {
        self.core.factory_name().to_string()
    }

    fn set_state(&self, state: ElementState) -> Result<StateChange> {
        if state == ElementState::Null {
            self.typed.store(false, Ordering::SeqCst);
            self.state.lock().accumulated.clear();
            self.src.unlink();
            self.src.reset();
            self.sink.reset();
        }
        self.core.store_state(state);
        Ok(StateChange::Success)
    }

    fn state(&self) -> ElementState {
        self.core.state()
    }

    fn pads(&self) -> Vec<Pad> {
        self.core.pads()
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
        match name {
            "force-caps" => {
                let caps = match value.as_str() {
                    Some(s) if !s.is_empty() => Some(s.parse()?),
                    _ => None,
                };
                self.set_force_caps(caps);
                Ok(())
            }
            _ => Err(DecodeError::PropertySetting {
                element: self.name(),
                property: name.to_string(),
            }),
        }
    }

    fn set_bus(&self, bus: Option<Bus>) {
        self.core.set_bus(bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[test]
    fn test_find_type_signatures() {
        assert_eq!(
            find_type(b"OggS\x00rest").unwrap().0.media_type(),
            Some("application/ogg")
        );
        assert_eq!(
            find_type(b"#EXTM3U\n#EXT-X-VERSION:3").unwrap().0.media_type(),
            Some("application/x-hls")
        );
        assert_eq!(
            find_type(b"ID3\x04\x00rest").unwrap().0.media_type(),
            Some("audio/mpeg")
        );
        assert_eq!(
            find_type(b"hello plain text").unwrap().0.media_type(),
            Some("text/plain")
        );
        assert!(find_type(&[0u8, 1, 2, 3]).is_none());
    }

    #[test]
    fn test_typefind_announces_and_flushes() {
        let tf = TypeFind::new("typefind0");
        let found = Arc::new(PMutex::new(None));
        let f = found.clone();
        tf.on_have_type(move |caps, prob| {
            *f.lock() = Some((caps.clone(), prob));
        });

        let out = Pad::new("out", PadDirection::Sink);
        let received = Arc::new(PMutex::new(Vec::new()));
        let r = received.clone();
        out.set_chain_fn(move |_, buffer| {
            r.lock().push(buffer.data);
            FlowReturn::Ok
        });
        tf.src_pad().link(&out).unwrap();

        tf.sink_pad().chain(Buffer::new(b"OggS\x00data".to_vec()));
        let (caps, prob) = found.lock().clone().unwrap();
        assert_eq!(caps.media_type(), Some("application/ogg"));
        assert_eq!(prob, PROB_MAXIMUM);
        assert_eq!(received.lock().len(), 1);
        assert_eq!(out.current_caps().unwrap().media_type(), Some("application/ogg"));

        // Subsequent buffers pass straight through.
        tf.sink_pad().chain(Buffer::new(b"more".to_vec()));
        assert_eq!(received.lock().len(), 2);
    }

    #[test]
    fn test_force_caps_wins() {
        let tf = TypeFind::new("typefind0");
        tf.set_force_caps(Some(Caps::simple("video/x-custom")));
        let out = Pad::new("out", PadDirection::Sink);
        tf.src_pad().link(&out).unwrap();
        tf.sink_pad().chain(Buffer::new(b"OggS\x00".to_vec()));
        assert_eq!(out.current_caps().unwrap().media_type(), Some("video/x-custom"));
    }

    #[test]
    fn test_eos_before_type_posts_wrong_type() {
        let bus = Bus::new();
        let tf = TypeFind::new("typefind0");
        tf.set_bus(Some(bus.clone()));
        let out = Pad::new("out", PadDirection::Sink);
        tf.src_pad().link(&out).unwrap();
        tf.sink_pad().send_event(Event::Eos);
        let msg = bus.pop().unwrap();
        match msg {
            Message::Error { error, .. } => {
                assert!(matches!(error, DecodeError::WrongType(_)))
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
