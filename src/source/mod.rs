//! Source acquisition: build a byte source from a URI, classify it, wire
//! it into the type finder, and keep redirect candidates ordered by what
//! the connection can sustain.

use std::sync::Arc;

use crate::element::{Element, ElementRef, ElementState, PropertyValue};
use crate::elements::file_uri_to_path;
use crate::error::{DecodeError, Result};
use crate::lifecycle::{BinInner, UpstreamInfo};
use crate::messages::{Message, RedirectCandidate};
use crate::pad::{Query, SchedulingFlags};
use crate::registry::uri_scheme;

/// Coarse classification of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Needs real buffering (slow or bandwidth-limited byte streams).
    Stream,
    /// Needs only a small decoupling queue (live-ish packetized input).
    Queue,
    /// Adaptive streaming manifest; the demuxer manages its own buffering.
    Adaptive,
    /// Fast local input.
    Plain,
}

const STREAM_SCHEMES: &[&str] = &["http", "https", "ftp", "ftps"];
const QUEUE_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "mms", "udp"];

/// A constructed source wired into the engine.
pub struct SourceBin {
    element: ElementRef,
    kind: SourceKind,
}

impl SourceBin {
    /// Creates the source for `uri`, classifies it, applies configuration,
    /// and links its output into the bin's type finder.
    pub(crate) fn build(inner: &Arc<BinInner>, uri: &str) -> Result<SourceBin> {
        let factory = inner.registry.source_for_uri(uri)?;
        let element = factory.create(&inner.next_element_name(factory.name()));
        log::info!("{}: created source {} for {}", inner.name, element.name(), uri);

        // Location: file URIs get a path, everything else the raw URI.
        let location = match uri_scheme(uri).as_deref() {
            Some("file") => file_uri_to_path(uri).ok_or_else(|| DecodeError::SourceConstruction {
                uri: uri.to_string(),
                reason: "invalid file URI".to_string(),
            })?,
            _ => uri.to_string(),
        };
        let _ = element.set_property("location", PropertyValue::Str(location));

        {
            let speed = inner.config.read().connection_speed;
            if speed > 0 {
                crate::element::try_set_property(
                    &element,
                    "connection-speed",
                    &PropertyValue::UInt64(speed),
                );
            }
        }

        // Let the caller adjust the source before anything flows.
        {
            let callbacks = inner.signals.source_setup.lock();
            for cb in callbacks.iter() {
                cb(&element);
            }
        }

        inner.add_element(&element);

        // Sources without static output pads announce them later; hook the
        // first dynamic pad straight into the type finder.
        let static_pad = element.src_pads().into_iter().next();
        if static_pad.is_none() {
            let weak = inner.weak_self.clone();
            element.connect_pad_added(Box::new(move |pad| {
                if let Some(inner) = weak.upgrade() {
                    if inner.sink.is_linked() {
                        log::warn!(
                            "{}: ignoring extra source pad {:?}",
                            inner.name,
                            pad
                        );
                        return;
                    }
                    if let Err(err) = pad.link(&inner.sink) {
                        log::warn!("{}: could not link source pad: {}", inner.name, err);
                    }
                }
            }));
        }

        // Classification: scheme list first, then what the source itself
        // answers to a scheduling query; live sources are never `stream`.
        let scheme = uri_scheme(uri).unwrap_or_default();
        let mut kind = if STREAM_SCHEMES.contains(&scheme.as_str()) {
            SourceKind::Stream
        } else if QUEUE_SCHEMES.contains(&scheme.as_str()) {
            SourceKind::Queue
        } else {
            SourceKind::Plain
        };

        let mut flags = SchedulingFlags::default();
        if let Some(src_pad) = &static_pad {
            let mut query = Query::Scheduling {
                flags: SchedulingFlags::default(),
                answered: false,
            };
            if src_pad.query(&mut query) {
                if let Query::Scheduling { flags: f, answered: true } = query {
                    flags = f;
                }
            }
        }
        if flags.bandwidth_limited {
            kind = SourceKind::Stream;
        }
        let is_live = element
            .property("is-live")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if is_live && kind == SourceKind::Stream {
            kind = SourceKind::Queue;
        }

        let duration_known = match &static_pad {
            Some(src_pad) => {
                let mut query = Query::Duration { nanos: None };
                src_pad.query(&mut query) && matches!(query, Query::Duration { nanos: Some(_) })
            }
            None => false,
        };

        *inner.upstream.lock() = UpstreamInfo {
            is_stream: kind == SourceKind::Stream,
            is_adaptive: false,
            duration_known,
            seekable: flags.seekable,
        };

        // Redirect messages from the source get their candidates reordered
        // before anyone else sees them.
        {
            let weak = inner.weak_self.clone();
            let source_name = element.name();
            inner.bus.add_interceptor(move |message| {
                let inner = match weak.upgrade() {
                    Some(i) => i,
                    None => return false,
                };
                if let Message::Redirect { src, candidates } = message {
                    if src == &source_name {
                        let speed = inner.config.read().connection_speed;
                        let sorted = sort_redirect_candidates(candidates.clone(), speed);
                        inner.bus.post(Message::Redirect {
                            src: inner.name.clone(),
                            candidates: sorted,
                        });
                        return true;
                    }
                }
                false
            });
        }

        if let Some(src_pad) = &static_pad {
            src_pad.link(&inner.sink)?;
        }
        element.set_state(ElementState::Paused)?;

        Ok(SourceBin { element, kind })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn element(&self) -> &ElementRef {
        &self.element
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.element.set_state(ElementState::Null);
    }
}

/// Reorders redirect candidates: those whose minimum bitrate fits the
/// configured connection speed first, then those without bitrate info,
/// then those over the limit; each partition keeps its input order.
pub fn sort_redirect_candidates(
    candidates: Vec<RedirectCandidate>,
    connection_speed_kbps: u64,
) -> Vec<RedirectCandidate> {
    if connection_speed_kbps == 0 {
        return candidates;
    }
    let limit = connection_speed_kbps * 1000;
    let mut fitting = Vec::new();
    let mut unknown = Vec::new();
    let mut over = Vec::new();
    for candidate in candidates {
        match candidate.minimum_bitrate {
            Some(bitrate) if bitrate <= limit => fitting.push(candidate),
            None => unknown.push(candidate),
            Some(_) => over.push(candidate),
        }
    }
    fitting.extend(unknown);
    fitting.extend(over);
    fitting
}
