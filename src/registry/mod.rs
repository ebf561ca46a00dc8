use parking_lot::RwLock;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::caps::Caps;
use crate::element::ElementRef;
use crate::error::{DecodeError, Result};
use crate::pad::PadDirection;

/// Factory ranks; higher is preferred.
pub mod rank {
    pub const NONE: u32 = 0;
    pub const MARGINAL: u32 = 64;
    pub const SECONDARY: u32 = 128;
    pub const PRIMARY: u32 = 256;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadPresence {
    Always,
    Sometimes,
    Request,
}

/// A pad an element of this factory may expose.
#[derive(Debug, Clone)]
pub struct PadTemplate {
    pub name_template: String,
    pub direction: PadDirection,
    pub presence: PadPresence,
    pub caps: Caps,
}

impl PadTemplate {
    pub fn new(
        name_template: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
        caps: Caps,
    ) -> Self {
        Self {
            name_template: name_template.into(),
            direction,
            presence,
            caps,
        }
    }
}

type Constructor = Arc<dyn Fn(&str) -> ElementRef + Send + Sync>;

/// Description of an installable handler.
pub struct Factory {
    name: String,
    rank: u32,
    klass: String,
    templates: Vec<PadTemplate>,
    schemes: Vec<String>,
    constructor: Constructor,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("klass", &self.klass)
            .finish()
    }
}

impl Factory {
    pub fn builder(name: impl Into<String>) -> FactoryBuilder {
        FactoryBuilder {
            name: name.into(),
            rank: rank::NONE,
            klass: String::new(),
            templates: Vec::new(),
            schemes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn klass(&self) -> &str {
        &self.klass
    }

    pub fn templates(&self) -> &[PadTemplate] {
        &self.templates
    }

    pub fn schemes(&self) -> &[String] {
        &self.schemes
    }

    pub fn sink_templates(&self) -> impl Iterator<Item = &PadTemplate> {
        self.templates
            .iter()
            .filter(|t| t.direction == PadDirection::Sink)
    }

    pub fn src_templates(&self) -> impl Iterator<Item = &PadTemplate> {
        self.templates
            .iter()
            .filter(|t| t.direction == PadDirection::Src)
    }

    fn has_klass_token(&self, token: &str) -> bool {
        self.klass.split('/').any(|t| t.contains(token))
    }

    pub fn is_parser(&self) -> bool {
        self.has_klass_token("Parser")
    }

    pub fn is_converter(&self) -> bool {
        self.has_klass_token("Converter")
    }

    pub fn is_decoder(&self) -> bool {
        self.has_klass_token("Decoder")
    }

    pub fn is_source(&self) -> bool {
        self.has_klass_token("Source")
    }

    pub fn is_sink(&self) -> bool {
        self.has_klass_token("Sink")
    }

    pub fn has_demux_klass(&self) -> bool {
        self.klass.contains("Demux")
    }

    /// Factories eligible for auto-plugging.
    pub fn is_decodable(&self) -> bool {
        self.has_demux_klass()
            || self.is_decoder()
            || self.is_parser()
            || self.has_klass_token("Depayloader")
    }

    /// Compatibility test against this factory's sink templates.
    pub fn accepts(&self, caps: &Caps) -> bool {
        self.sink_templates().any(|t| t.caps.can_intersect(caps))
    }

    /// Stricter test used before instantiation: fixed caps must fit inside
    /// one of the sink templates.
    pub fn accepts_subset(&self, caps: &Caps) -> bool {
        self.sink_templates().any(|t| caps.is_subset(&t.caps))
    }

    /// Demuxers: "Demux" in the class string AND at least two potential
    /// source pads. Always/Sometimes templates count one each, Sometimes
    /// templates with a name substitution count two, Request templates
    /// count two.
    pub fn is_demuxer(&self) -> bool {
        if !self.has_demux_klass() {
            return false;
        }
        let mut potential = 0usize;
        for template in self.src_templates() {
            potential += match template.presence {
                PadPresence::Always => 1,
                PadPresence::Sometimes => {
                    if template.name_template.contains('%') {
                        2
                    } else {
                        1
                    }
                }
                PadPresence::Request => 2,
            };
            if potential >= 2 {
                return true;
            }
        }
        false
    }

    pub fn create(self: &Arc<Self>, name: &str) -> ElementRef {
        (self.constructor)(name)
    }
}

pub struct FactoryBuilder {
    name: String,
    rank: u32,
    klass: String,
    templates: Vec<PadTemplate>,
    schemes: Vec<String>,
}

impl FactoryBuilder {
    pub fn rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn klass(mut self, klass: impl Into<String>) -> Self {
        self.klass = klass.into();
        self
    }

    pub fn template(mut self, template: PadTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn sink_caps(self, caps: Caps) -> Self {
        self.template(PadTemplate::new(
            "sink",
            PadDirection::Sink,
            PadPresence::Always,
            caps,
        ))
    }

    pub fn src_caps(self, caps: Caps) -> Self {
        self.template(PadTemplate::new(
            "src",
            PadDirection::Src,
            PadPresence::Always,
            caps,
        ))
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.schemes.push(scheme.into());
        self
    }

    pub fn build<F>(self, constructor: F) -> Arc<Factory>
    where
        F: Fn(&str) -> ElementRef + Send + Sync + 'static,
    {
        Arc::new(Factory {
            name: self.name,
            rank: self.rank,
            klass: self.klass,
            templates: self.templates,
            schemes: self.schemes,
            constructor: Arc::new(constructor),
        })
    }
}

/// Enumerates candidate handler factories. The cookie changes on every
/// mutation so cached factory lists can be invalidated.
pub struct Registry {
    factories: RwLock<Vec<Arc<Factory>>>,
    cookie: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
            cookie: AtomicU64::new(1),
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie.load(Ordering::SeqCst)
    }

    pub fn register(&self, factory: Arc<Factory>) {
        self.factories.write().push(factory);
        self.cookie.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Factory>> {
        let mut factories = self.factories.write();
        let pos = factories.iter().position(|f| f.name() == name)?;
        let removed = factories.remove(pos);
        self.cookie.fetch_add(1, Ordering::SeqCst);
        Some(removed)
    }

    pub fn find(&self, name: &str) -> Option<Arc<Factory>> {
        self.factories
            .read()
            .iter()
            .find(|f| f.name() == name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Factory>> {
        self.factories.read().clone()
    }

    /// All decodable factories accepting `caps` on sink, sorted
    /// parser-first, then rank descending, then name ascending.
    pub fn decodable_factories(&self, caps: &Caps) -> Vec<Arc<Factory>> {
        let mut list: Vec<Arc<Factory>> = self
            .factories
            .read()
            .iter()
            .filter(|f| f.is_decodable() && f.accepts(caps))
            .cloned()
            .collect();
        list.sort_by(|a, b| compare_factories(a, b));
        list
    }

    /// Adaptive demuxers are plugged directly after type-finding instead of
    /// going through the factory loop.
    pub fn adaptive_demuxer_for(&self, caps: &Caps) -> Option<Arc<Factory>> {
        self.factories
            .read()
            .iter()
            .filter(|f| f.has_demux_klass() && f.klass().contains("Adaptive"))
            .find(|f| f.accepts(caps))
            .cloned()
    }

    /// Finds a source factory for the URI scheme.
    pub fn source_for_uri(&self, uri: &str) -> Result<Arc<Factory>> {
        let scheme = uri_scheme(uri).ok_or_else(|| DecodeError::SourceConstruction {
            uri: uri.to_string(),
            reason: "invalid URI".to_string(),
        })?;
        self.factories
            .read()
            .iter()
            .filter(|f| f.is_source())
            .find(|f| f.schemes().iter().any(|s| s == &scheme))
            .cloned()
            .ok_or_else(|| DecodeError::SourceConstruction {
                uri: uri.to_string(),
                reason: format!("no source handler for scheme \"{}\"", scheme),
            })
    }
}

pub fn compare_factories(a: &Arc<Factory>, b: &Arc<Factory>) -> CmpOrdering {
    b.is_parser()
        .cmp(&a.is_parser())
        .then_with(|| b.rank().cmp(&a.rank()))
        .then_with(|| a.name().cmp(b.name()))
}

pub fn uri_scheme(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once(':')?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    if !scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, ElementCore, ElementRef, StateChange};
    use crate::error::Result as DResult;
    use crate::pad::Pad;

    struct Dummy {
        core: ElementCore,
    }

    impl Element for Dummy {
        fn name(&self) -> String {
            self.core.name().to_string()
        }
        fn factory_name(&self) -> String {
            self.core.factory_name().to_string()
        }
        fn set_state(&self, state: crate::element::ElementState) -> DResult<StateChange> {
            self.core.store_state(state);
            Ok(StateChange::Success)
        }
        fn state(&self) -> crate::element::ElementState {
            self.core.state()
        }
        fn pads(&self) -> Vec<Pad> {
            self.core.pads()
        }
    }

    fn dummy_factory(name: &str, rank: u32, klass: &str, sink: &str) -> Arc<Factory> {
        let factory_name = name.to_string();
        Factory::builder(name)
            .rank(rank)
            .klass(klass)
            .sink_caps(Caps::simple(sink))
            .build(move |instance| {
                Arc::new(Dummy {
                    core: ElementCore::new(instance, factory_name.clone()),
                }) as ElementRef
            })
    }

    #[test]
    fn test_sort_order_parser_first_then_rank_then_name() {
        let registry = Registry::new();
        registry.register(dummy_factory("bdec", rank::PRIMARY, "Codec/Decoder/Audio", "audio/mpeg"));
        registry.register(dummy_factory("adec", rank::PRIMARY, "Codec/Decoder/Audio", "audio/mpeg"));
        registry.register(dummy_factory("mpegparse", rank::MARGINAL, "Codec/Parser/Audio", "audio/mpeg"));
        registry.register(dummy_factory("lowdec", rank::SECONDARY, "Codec/Decoder/Audio", "audio/mpeg"));

        let list = registry.decodable_factories(&Caps::simple("audio/mpeg"));
        let names: Vec<&str> = list.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["mpegparse", "adec", "bdec", "lowdec"]);
    }

    #[test]
    fn test_demuxer_detection() {
        let single = Factory::builder("onesrc")
            .klass("Codec/Demuxer")
            .template(PadTemplate::new(
                "src",
                PadDirection::Src,
                PadPresence::Always,
                Caps::new_any(),
            ))
            .build(|_| unreachable!());
        assert!(!single.is_demuxer());

        let multi = Factory::builder("oggdemux")
            .klass("Codec/Demuxer")
            .template(PadTemplate::new(
                "src_%u",
                PadDirection::Src,
                PadPresence::Sometimes,
                Caps::new_any(),
            ))
            .build(|_| unreachable!());
        assert!(multi.is_demuxer());

        let not_demux = Factory::builder("decoder")
            .klass("Codec/Decoder")
            .template(PadTemplate::new(
                "src_%u",
                PadDirection::Src,
                PadPresence::Request,
                Caps::new_any(),
            ))
            .build(|_| unreachable!());
        assert!(!not_demux.is_demuxer());
    }

    #[test]
    fn test_cookie_changes_and_reregistration() {
        let registry = Registry::new();
        let before = registry.cookie();
        let factory = dummy_factory("adec", rank::PRIMARY, "Codec/Decoder/Audio", "audio/mpeg");
        registry.register(factory);
        assert_ne!(registry.cookie(), before);

        let removed = registry.remove("adec").unwrap();
        assert!(registry.decodable_factories(&Caps::simple("audio/mpeg")).is_empty());
        registry.register(removed);
        let list = registry.decodable_factories(&Caps::simple("audio/mpeg"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_uri_scheme() {
        assert_eq!(uri_scheme("http://host/x").as_deref(), Some("http"));
        assert_eq!(uri_scheme("FILE:///x").as_deref(), Some("file"));
        assert_eq!(uri_scheme("not a uri"), None);
        assert_eq!(uri_scheme(":///"), None);
    }

    #[test]
    fn test_source_for_uri_unknown_scheme() {
        let registry = Registry::new();
        let err = registry.source_for_uri("gopher://host/x").unwrap_err();
        assert!(matches!(
            err,
            crate::error::DecodeError::SourceConstruction { .. }
        ));
    }
}
