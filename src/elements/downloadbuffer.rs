use parking_lot::Mutex;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use super::queuecell::{PushOutcome, QueueCell, QueueItem, QueueLimits};
use crate::element::{Element, ElementCore, ElementState, PropertyValue, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::Event;
use crate::messages::{Bus, Message};
use crate::pad::{FlowReturn, Pad, PadDirection};

/// Resolves the user cache directory the way the download cache expects it.
fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".cache");
        }
    }
    std::env::temp_dir()
}

fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "decodebin".to_string())
}

/// Expands the trailing `XXXXXX` of a temp-file template.
fn expand_template(template: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            chars[rng.random_range(0..chars.len())] as char
        })
        .collect();
    match template.strip_suffix("XXXXXX") {
        Some(prefix) => format!("{}{}", prefix, suffix),
        None => format!("{}-{}", template, suffix),
    }
}

struct DownloadState {
    temp_template: String,
    temp_location: Option<PathBuf>,
    file: Option<File>,
    use_buffering: bool,
    high_watermark: f64,
}

/// Progressive download buffer: queue semantics, with every byte mirrored
/// into a bounded cache file under the user cache directory.
pub struct DownloadBuffer {
    core: ElementCore,
    weak_self: Weak<DownloadBuffer>,
    sink: Pad,
    src: Pad,
    cell: Arc<QueueCell>,
    state: Mutex<DownloadState>,
    last_percent: Mutex<Option<u32>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadBuffer {
    pub fn new(name: &str) -> Arc<Self> {
        let element = Arc::new_cyclic(|weak| Self {
            core: ElementCore::new(name, "downloadbuffer"),
            weak_self: weak.clone(),
            sink: Pad::new("sink", PadDirection::Sink),
            src: Pad::new("src", PadDirection::Src),
            cell: Arc::new(QueueCell::new(QueueLimits::default())),
            state: Mutex::new(DownloadState {
                temp_template: format!("{}-XXXXXX", program_name()),
                temp_location: None,
                file: None,
                use_buffering: true,
                high_watermark: 0.99,
            }),
            last_percent: Mutex::new(None),
            thread: Mutex::new(None),
        });
        element.core.add_pad(&element.sink);
        element.core.add_pad(&element.src);

        let weak = element.weak_self.clone();
        element.sink.set_chain_fn(move |_pad, buffer| {
            let this = match weak.upgrade() {
                Some(t) => t,
                None => return FlowReturn::Flushing,
            };
            this.write_to_cache(&buffer.data);
            match this.cell.push_buffer_wait(buffer) {
                PushOutcome::Ok => {
                    this.maybe_post_buffering();
                    FlowReturn::Ok
                }
                PushOutcome::Flushing => FlowReturn::Flushing,
            }
        });

        let weak = element.weak_self.clone();
        element.sink.set_event_fn(move |_pad, event| {
            let this = match weak.upgrade() {
                Some(t) => t,
                None => return false,
            };
            match &event {
                Event::FlushStart => {
                    this.cell.set_flushing(true);
                    this.src.push_event(event.clone());
                }
                Event::FlushStop => {
                    this.cell.set_flushing(false);
                    this.cell.push_event(event.clone());
                }
                _ => this.cell.push_event(event.clone()),
            }
            true
        });
        element
    }

    pub fn sink_pad(&self) -> &Pad {
        &self.sink
    }

    pub fn src_pad(&self) -> &Pad {
        &self.src
    }

    pub fn temp_location(&self) -> Option<PathBuf> {
        self.state.lock().temp_location.clone()
    }

    pub(crate) fn set_limits(&self, limits: QueueLimits) {
        self.cell.set_limits(limits);
    }

    fn ensure_cache_file(&self) {
        let mut state = self.state.lock();
        if state.file.is_some() {
            return;
        }
        let dir = cache_dir();
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(expand_template(&state.temp_template));
        match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
            Ok(file) => {
                log::debug!("{}: caching to {}", self.core.name(), path.display());
                state.file = Some(file);
                state.temp_location = Some(path);
            }
            Err(err) => {
                log::warn!(
                    "{}: could not open cache file {}: {}",
                    self.core.name(),
                    path.display(),
                    err
                );
            }
        }
    }

    fn write_to_cache(&self, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(file) = state.file.as_mut() {
            if let Err(err) = file.write_all(data) {
                log::warn!("{}: cache write failed: {}", self.core.name(), err);
            }
        }
    }

    fn maybe_post_buffering(&self) {
        let (use_buffering, high) = {
            let state = self.state.lock();
            (state.use_buffering, state.high_watermark)
        };
        if !use_buffering {
            return;
        }
        let percent = ((self.cell.fill_fraction() / high) * 100.0).min(100.0) as u32;
        let mut last = self.last_percent.lock();
        if *last != Some(percent) {
            *last = Some(percent);
            self.core.post_message(Message::Buffering {
                src: self.core.name().to_string(),
                percent,
            });
        }
    }

    fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        self.ensure_cache_file();
        self.cell.set_flushing(false);
        let cell = self.cell.clone();
        let src = self.src.clone();
        let weak = self.weak_self.clone();
        let handle = std::thread::Builder::new()
            .name(self.core.name().to_string())
            .spawn(move || loop {
                match cell.pop() {
                    None => break,
                    Some(QueueItem::Buffer(buffer)) => {
                        let flow = src.push(buffer);
                        if let Some(this) = weak.upgrade() {
                            this.maybe_post_buffering();
                        }
                        if flow == FlowReturn::Flushing || flow == FlowReturn::Error {
                            break;
                        }
                    }
                    Some(QueueItem::Event(event)) => {
                        let is_eos = matches!(event, Event::Eos);
                        src.push_event(event);
                        if is_eos {
                            break;
                        }
                    }
                }
            })
            .expect("spawn downloadbuffer pump thread");
        *guard = Some(handle);
    }

    fn stop(&self) {
        self.cell.set_flushing(true);
        self.src.set_active(false);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DownloadBuffer {
    fn drop(&mut self) {
        let state = self.state.lock();
        if let Some(path) = &state.temp_location {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Element for DownloadBuffer {
    fn name(&self) -> String {
        self.core.name().to_string()
    }

    fn factory_name(&self) -> String {
        self.core.factory_name().to_string()
    }

    fn set_state(&self, state: ElementState) -> Result<StateChange> {
        match state {
            ElementState::Paused | ElementState::Playing => {
                if let Some(this) = self.weak_self.upgrade() {
                    this.start();
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
            "temp-template" => {
                if let Some(s) = value.as_str() {
                    self.state.lock().temp_template = s.to_string();
                }
                Ok(())
            }
            "max-size-bytes" => {
                let mut limits = self.cell.limits();
                limits.max_bytes = value.as_u64().unwrap_or(0);
                self.cell.set_limits(limits);
                Ok(())
            }
            "max-size-time" => {
                let mut limits = self.cell.limits();
                limits.max_time = value.as_u64().unwrap_or(0);
                self.cell.set_limits(limits);
                Ok(())
            }
            "use-buffering" => {
                self.state.lock().use_buffering = value.as_bool().unwrap_or(true);
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
