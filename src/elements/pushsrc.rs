use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crate::element::{Element, ElementCore, ElementState, PropertyValue, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::{Buffer, Event};
use crate::messages::Bus;
use crate::pad::{FlowReturn, Pad, PadDirection, Query, SchedulingFlags};

const DEFAULT_CHUNK_SIZE: usize = 1024;

enum Provider {
    Bytes(Vec<u8>),
    File(Option<PathBuf>),
}

struct SourceConfig {
    provider: Provider,
    chunk: usize,
    live: bool,
    flags: SchedulingFlags,
    duration: Option<u64>,
    stream_id: String,
    group_id: Option<u32>,
    caps: Option<crate::caps::Caps>,
}

/// Push-mode byte source: a producer thread feeds the src pad with
/// stream-start, segment, data chunks and EOS.
pub struct PushSource {
    core: ElementCore,
    weak_self: Weak<PushSource>,
    src: Pad,
    config: Mutex<SourceConfig>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PushSource {
    fn build(name: &str, factory_name: &str, provider: Provider) -> Arc<Self> {
        let element = Arc::new_cyclic(|weak| Self {
            core: ElementCore::new(name, factory_name),
            weak_self: weak.clone(),
            src: Pad::new("src", PadDirection::Src),
            config: Mutex::new(SourceConfig {
                provider,
                chunk: DEFAULT_CHUNK_SIZE,
                live: false,
                flags: SchedulingFlags {
                    seekable: true,
                    sequential: false,
                    bandwidth_limited: false,
                },
                duration: None,
                stream_id: format!("{}/stream", name),
                group_id: None,
                caps: None,
            }),
            thread: Mutex::new(None),
        });
        element.core.add_pad(&element.src);

        let weak = element.weak_self.clone();
        element.src.set_query_fn(move |_pad, query| {
            let this = match weak.upgrade() {
                Some(t) => t,
                None => return false,
            };
            let config = this.config.lock();
            match query {
                Query::Scheduling { flags, answered } => {
                    *flags = config.flags;
                    *answered = true;
                    true
                }
                Query::Duration { nanos } => {
                    *nanos = config.duration;
                    config.duration.is_some()
                }
                Query::Seeking { seekable, answered } => {
                    *seekable = config.flags.seekable;
                    *answered = true;
                    true
                }
                _ => false,
            }
        });
        element
    }

    pub fn from_bytes(name: &str, data: Vec<u8>) -> Arc<Self> {
        Self::build(name, "memsrc", Provider::Bytes(data))
    }

    pub fn from_file(name: &str) -> Arc<Self> {
        Self::build(name, "filesrc", Provider::File(None))
    }

    pub fn src_pad(&self) -> &Pad {
        &self.src
    }

    pub fn set_location(&self, path: impl Into<PathBuf>) {
        let mut config = self.config.lock();
        // Only file-backed sources take a location; byte sources already
        // carry their payload.
        if matches!(config.provider, Provider::File(_)) {
            config.provider = Provider::File(Some(path.into()));
        }
    }

    /// Caps announced on the pad before data, for sources producing an
    /// already-typed stream.
    pub fn set_caps(&self, caps: Option<crate::caps::Caps>) {
        self.config.lock().caps = caps;
    }

    pub fn set_chunk_size(&self, chunk: usize) {
        self.config.lock().chunk = chunk.max(1);
    }

    pub fn set_live(&self, live: bool) {
        self.config.lock().live = live;
    }

    pub fn is_live(&self) -> bool {
        self.config.lock().live
    }

    pub fn set_scheduling_flags(&self, flags: SchedulingFlags) {
        self.config.lock().flags = flags;
    }

    pub fn set_duration(&self, duration: Option<u64>) {
        self.config.lock().duration = duration;
    }

    pub fn set_stream_id(&self, stream_id: impl Into<String>) {
        self.config.lock().stream_id = stream_id.into();
    }

    pub fn set_group_id(&self, group_id: Option<u32>) {
        self.config.lock().group_id = group_id;
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return Ok(());
        }
        let (bytes, chunk, stream_id, group_id, caps) = {
            let config = self.config.lock();
            let bytes = match &config.provider {
                Provider::Bytes(data) => data.clone(),
                Provider::File(Some(path)) => std::fs::read(path).map_err(|e| {
                    DecodeError::SourceConstruction {
                        uri: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?,
                Provider::File(None) => {
                    return Err(DecodeError::NotInitialized(format!(
                        "{}: no location set",
                        self.core.name()
                    )))
                }
            };
            (
                bytes,
                config.chunk,
                config.stream_id.clone(),
                config.group_id,
                config.caps.clone(),
            )
        };
        self.src.set_active(true);
        let src = self.src.clone();
        let name = self.core.name().to_string();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                src.push_event(Event::StreamStart {
                    stream_id,
                    group_id,
                });
                if let Some(caps) = caps {
                    src.push_event(Event::Caps(caps));
                }
                src.push_event(Event::Segment {
                    start: 0,
                    stop: None,
                });
                for piece in bytes.chunks(chunk) {
                    match src.push(Buffer::new(piece.to_vec())) {
                        FlowReturn::Flushing | FlowReturn::Error => return,
                        _ => {}
                    }
                }
                src.push_event(Event::Eos);
            })
            .expect("spawn source thread");
        *guard = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.src.set_active(false);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Element for PushSource {
    fn name(&self) -> String {
        self.core.name().to_string()
    }

    fn factory_name(&self) -> String {
        self.core.factory_name().to_string()
    }

    fn set_state(&self, state: ElementState) -> Result<StateChange> {
        match state {
            ElementState::Paused | ElementState::Playing => {
                if self.core.state() < ElementState::Paused {
                    if let Some(this) = self.weak_self.upgrade() {
                        this.start()?;
                    }
                }
            }
            ElementState::Null => self.stop(),
            ElementState::Ready => {}
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
            "location" => {
                if let Some(path) = value.as_str() {
                    self.set_location(path);
                }
                Ok(())
            }
            "is-live" => {
                self.set_live(value.as_bool().unwrap_or(false));
                Ok(())
            }
            "blocksize" => {
                if let Some(v) = value.as_u64() {
                    self.set_chunk_size(v as usize);
                }
                Ok(())
            }
            _ => Err(DecodeError::PropertySetting {
                element: self.name(),
                property: name.to_string(),
            }),
        }
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "is-live" => Some(PropertyValue::Bool(self.config.lock().live)),
            _ => None,
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
    fn test_pushes_stream_then_eos() {
        let src = PushSource::from_bytes("src0", vec![1u8; 2500]);
        src.set_chunk_size(1000);
        let sink = Pad::new("sink", PadDirection::Sink);
        let log = Arc::new(PMutex::new(Vec::<String>::new()));
        let l = log.clone();
        sink.set_chain_fn(move |_, b| {
            l.lock().push(format!("buf:{}", b.len()));
            FlowReturn::Ok
        });
        let l = log.clone();
        sink.set_event_fn(move |_, e| {
            l.lock().push(e.name().to_string());
            true
        });
        src.src_pad().link(&sink).unwrap();
        src.set_state(ElementState::Paused).unwrap();
        for _ in 0..200 {
            if log.lock().iter().any(|e| e == "eos") {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        src.set_state(ElementState::Null).unwrap();
        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec!["stream-start", "segment", "buf:1000", "buf:1000", "buf:500", "eos"]
        );
    }

    #[test]
    fn test_missing_location_fails() {
        let src = PushSource::from_file("src0");
        assert!(src.set_state(ElementState::Paused).is_err());
    }
}
