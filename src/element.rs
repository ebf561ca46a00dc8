use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DecodeError, Result};
use crate::event::Event;
use crate::messages::{Bus, Message};
use crate::pad::{Pad, PadDirection};

/// Element state machine. Ordered so comparisons express "at least Paused".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Successful outcomes of a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Success,
    /// The transition completes asynchronously; an async-done message
    /// follows on the bus.
    Async,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    UInt(u32),
    UInt64(u64),
    Int(i32),
    Int64(i64),
    Bool(bool),
    Str(String),
}

impl PropertyValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(v) => Some(*v as u64),
            PropertyValue::UInt64(v) => Some(*v),
            PropertyValue::Int(v) if *v >= 0 => Some(*v as u64),
            PropertyValue::Int64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    UInt,
    UInt64,
    Int,
    Int64,
    Bool,
    Str,
}

/// Property description with numeric bounds, used to clamp values copied
/// onto chain elements (e.g. `connection-speed`).
#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub min: i128,
    pub max: i128,
}

impl PropertySpec {
    pub fn uint(name: &'static str, min: u32, max: u32) -> Self {
        Self {
            name,
            kind: PropertyKind::UInt,
            min: min as i128,
            max: max as i128,
        }
    }

    pub fn uint64(name: &'static str, min: u64, max: u64) -> Self {
        Self {
            name,
            kind: PropertyKind::UInt64,
            min: min as i128,
            max: max as i128,
        }
    }

    pub fn int64(name: &'static str, min: i64, max: i64) -> Self {
        Self {
            name,
            kind: PropertyKind::Int64,
            min: min as i128,
            max: max as i128,
        }
    }

    pub fn bool(name: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Bool,
            min: 0,
            max: 1,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Str,
            min: 0,
            max: 0,
        }
    }

    /// Converts `value` to this spec's kind, clamping numerics into bounds.
    pub fn coerce(&self, value: &PropertyValue) -> Option<PropertyValue> {
        match self.kind {
            PropertyKind::Bool => value.as_bool().map(PropertyValue::Bool),
            PropertyKind::Str => value.as_str().map(|s| PropertyValue::Str(s.to_string())),
            _ => {
                let raw: i128 = match value {
                    PropertyValue::UInt(v) => *v as i128,
                    PropertyValue::UInt64(v) => *v as i128,
                    PropertyValue::Int(v) => *v as i128,
                    PropertyValue::Int64(v) => *v as i128,
                    _ => return None,
                };
                let clamped = raw.clamp(self.min, self.max);
                Some(match self.kind {
                    PropertyKind::UInt => PropertyValue::UInt(clamped as u32),
                    PropertyKind::UInt64 => PropertyValue::UInt64(clamped as u64),
                    PropertyKind::Int => PropertyValue::Int(clamped as i32),
                    PropertyKind::Int64 => PropertyValue::Int64(clamped as i64),
                    _ => unreachable!(),
                })
            }
        }
    }
}

pub type PadCallback = Box<dyn Fn(&Pad) + Send + Sync>;
pub type SignalCallback = Box<dyn Fn() + Send + Sync>;

/// An instantiated processing element.
pub trait Element: Send + Sync {
    fn name(&self) -> String;

    /// Name of the factory that produced this element; used for the
    /// parser-loop check.
    fn factory_name(&self) -> String;

    fn set_state(&self, state: ElementState) -> Result<StateChange>;

    fn state(&self) -> ElementState;

    fn pads(&self) -> Vec<Pad>;

    fn src_pads(&self) -> Vec<Pad> {
        self.pads()
            .into_iter()
            .filter(|p| p.direction() == PadDirection::Src)
            .collect()
    }

    fn sink_pads(&self) -> Vec<Pad> {
        self.pads()
            .into_iter()
            .filter(|p| p.direction() == PadDirection::Sink)
            .collect()
    }

    fn static_pad(&self, name: &str) -> Option<Pad> {
        self.pads().into_iter().find(|p| p.name() == name)
    }

    /// Allocates a pad from a Request template, if the element has one.
    fn request_pad(&self, _template: &str) -> Option<Pad> {
        None
    }

    fn release_request_pad(&self, _pad: &Pad) {}

    fn property_spec(&self, _name: &str) -> Option<PropertySpec> {
        None
    }

    fn set_property(&self, name: &str, _value: PropertyValue) -> Result<()> {
        Err(DecodeError::PropertySetting {
            element: self.name(),
            property: name.to_string(),
        })
    }

    fn property(&self, _name: &str) -> Option<PropertyValue> {
        None
    }

    fn set_bus(&self, _bus: Option<Bus>) {}

    /// Sends an event into the element (delivered to its sink pads).
    fn send_event(&self, event: Event) -> bool {
        let mut res = false;
        for pad in self.sink_pads() {
            res |= pad.send_event(event.clone());
        }
        res
    }

    /// Subscribes to dynamically added pads. Elements with only static pads
    /// ignore these.
    fn connect_pad_added(&self, _cb: PadCallback) {}

    fn connect_pad_removed(&self, _cb: PadCallback) {}

    fn connect_no_more_pads(&self, _cb: SignalCallback) {}
}

pub type ElementRef = Arc<dyn Element>;

/// Stable identity of an element instance, for filter sets.
pub fn element_id(element: &ElementRef) -> usize {
    Arc::as_ptr(element) as *const () as usize
}

/// Shared plumbing for concrete elements: name, state, pad list, bus,
/// dynamic-pad signals and a property store.
pub struct ElementCore {
    name: String,
    factory_name: String,
    state: Mutex<ElementState>,
    pads: Mutex<Vec<Pad>>,
    bus: Mutex<Option<Bus>>,
    properties: Mutex<HashMap<String, PropertyValue>>,
    pad_added: Mutex<Vec<PadCallback>>,
    pad_removed: Mutex<Vec<PadCallback>>,
    no_more_pads: Mutex<Vec<SignalCallback>>,
    no_more_pads_fired: AtomicBool,
}

impl ElementCore {
    pub fn new(name: impl Into<String>, factory_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory_name: factory_name.into(),
            state: Mutex::new(ElementState::Null),
            pads: Mutex::new(Vec::new()),
            bus: Mutex::new(None),
            properties: Mutex::new(HashMap::new()),
            pad_added: Mutex::new(Vec::new()),
            pad_removed: Mutex::new(Vec::new()),
            no_more_pads: Mutex::new(Vec::new()),
            no_more_pads_fired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    pub fn state(&self) -> ElementState {
        *self.state.lock()
    }

    pub fn store_state(&self, state: ElementState) {
        *self.state.lock() = state;
    }

    pub fn pads(&self) -> Vec<Pad> {
        self.pads.lock().clone()
    }

    /// Registers a pad without firing signals (static pads).
    pub fn add_pad(&self, pad: &Pad) {
        pad.set_parent_name(&self.name);
        self.pads.lock().push(pad.clone());
    }

    /// Registers a pad and fires `pad-added`.
    pub fn add_dynamic_pad(&self, pad: &Pad) {
        self.add_pad(pad);
        let callbacks = self.pad_added.lock();
        for cb in callbacks.iter() {
            cb(pad);
        }
    }

    pub fn remove_pad(&self, pad: &Pad) {
        self.pads.lock().retain(|p| p != pad);
        let callbacks = self.pad_removed.lock();
        for cb in callbacks.iter() {
            cb(pad);
        }
    }

    /// Fires `no-more-pads`. Chained-container demuxers legitimately fire
    /// this once per stream sequence.
    pub fn fire_no_more_pads(&self) {
        self.no_more_pads_fired.store(true, Ordering::SeqCst);
        let callbacks = self.no_more_pads.lock();
        for cb in callbacks.iter() {
            cb();
        }
    }

    pub fn no_more_pads_fired(&self) -> bool {
        self.no_more_pads_fired.load(Ordering::SeqCst)
    }

    pub fn reset_no_more_pads(&self) {
        self.no_more_pads_fired.store(false, Ordering::SeqCst);
    }

    pub fn on_pad_added(&self, cb: PadCallback) {
        self.pad_added.lock().push(cb);
    }

    pub fn on_pad_removed(&self, cb: PadCallback) {
        self.pad_removed.lock().push(cb);
    }

    pub fn on_no_more_pads(&self, cb: SignalCallback) {
        self.no_more_pads.lock().push(cb);
    }

    pub fn set_bus(&self, bus: Option<Bus>) {
        *self.bus.lock() = bus;
    }

    pub fn bus(&self) -> Option<Bus> {
        self.bus.lock().clone()
    }

    pub fn post_message(&self, message: Message) {
        if let Some(bus) = self.bus() {
            bus.post(message);
        }
    }

    pub fn post_error(&self, error: DecodeError) {
        log::error!("{}: {}", self.name, error);
        self.post_message(Message::Error {
            src: self.name.clone(),
            error,
        });
    }

    pub fn set_raw_property(&self, name: &str, value: PropertyValue) {
        self.properties.lock().insert(name.to_string(), value);
    }

    pub fn raw_property(&self, name: &str) -> Option<PropertyValue> {
        self.properties.lock().get(name).cloned()
    }
}

/// Sets a property if the element exposes it, coercing and clamping the
/// value against the element's spec. Elements without the property are
/// skipped silently.
pub fn try_set_property(element: &ElementRef, name: &str, value: &PropertyValue) -> bool {
    match element.property_spec(name) {
        Some(spec) => match spec.coerce(value) {
            Some(coerced) => element.set_property(name, coerced).is_ok(),
            None => false,
        },
        None => false,
    }
}
