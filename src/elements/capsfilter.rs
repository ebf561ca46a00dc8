use parking_lot::Mutex;
use std::sync::Arc;

use crate::caps::Caps;
use crate::element::{Element, ElementCore, ElementState, PropertyValue, StateChange};
use crate::error::{DecodeError, Result};
use crate::event::Event;
use crate::messages::Bus;
use crate::pad::{Pad, PadDirection, Query};

/// Pass-through element constraining the caps negotiated across it.
pub struct CapsFilter {
    core: ElementCore,
    sink: Pad,
    src: Pad,
    filter: Arc<Mutex<Option<Caps>>>,
}

impl CapsFilter {
    pub fn new(name: &str) -> Arc<Self> {
        let filter = Arc::new(Mutex::new(None::<Caps>));
        let element = Arc::new(Self {
            core: ElementCore::new(name, "capsfilter"),
            sink: Pad::new("sink", PadDirection::Sink),
            src: Pad::new("src", PadDirection::Src),
            filter,
        });
        element.core.add_pad(&element.sink);
        element.core.add_pad(&element.src);

        let src = element.src.clone();
        element
            .sink
            .set_chain_fn(move |_pad, buffer| src.push(buffer));

        let src = element.src.clone();
        let filter = element.filter.clone();
        element.sink.set_event_fn(move |_pad, event| match event {
            Event::Caps(caps) => {
                let filtered = match filter.lock().as_ref() {
                    Some(f) => {
                        let out = caps.intersect(f);
                        if out.is_empty() {
                            log::debug!("capsfilter: {} does not pass {}", caps, f);
                            return false;
                        }
                        out
                    }
                    None => caps,
                };
                src.push_event(Event::Caps(filtered))
            }
            other => src.push_event(other),
        });

        let filter = element.filter.clone();
        element.sink.set_query_fn(move |_pad, query| match query {
            Query::AcceptCaps { caps, result } => {
                *result = match filter.lock().as_ref() {
                    Some(f) => caps.can_intersect(f),
                    None => true,
                };
                true
            }
            Query::Caps { filter: qf, result } => {
                let own = filter.lock().clone().unwrap_or_else(Caps::new_any);
                *result = Some(match qf {
                    Some(qf) => own.intersect(qf),
                    None => own,
                });
                true
            }
            _ => false,
        });
        element
    }

    pub fn sink_pad(&self) -> &Pad {
        &self.sink
    }

    pub fn src_pad(&self) -> &Pad {
        &self.src
    }

    pub fn set_filter_caps(&self, caps: Option<Caps>) {
        *self.filter.lock() = caps;
    }

    pub fn filter_caps(&self) -> Option<Caps> {
        self.filter.lock().clone()
    }
}

impl Element for CapsFilter {
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

    fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
        match name {
            "caps" => {
                let caps = match value.as_str() {
                    Some(s) if !s.is_empty() => Some(s.parse()?),
                    _ => None,
                };
                self.set_filter_caps(caps);
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
