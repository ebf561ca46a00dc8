use std::sync::Arc;

use crate::caps::Caps;
use crate::element::ElementRef;
use crate::pad::{Pad, Query};
use crate::registry::Factory;

/// Verdict of the `autoplug-select` hook for one candidate factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoplugSelect {
    /// Instantiate and try to link the factory.
    Try,
    /// Stop here and expose the current pad.
    Expose,
    /// Skip this factory and continue with the next.
    Skip,
}

/// The factory-selection policy consulted while plugging. Every method has
/// the documented default behavior; callers override only what they need.
pub trait AutoplugPolicy: Send + Sync {
    /// Whether to keep plugging beyond a pad with these caps. Only called
    /// for fixed caps.
    fn autoplug_continue(&self, _pad: &Pad, _caps: &Caps) -> bool {
        true
    }

    /// Candidate factories for the pad. `default` is the registry match,
    /// already sorted. Returning None exposes the pad as-is; returning an
    /// empty list marks the stream unknown.
    fn autoplug_factories(
        &self,
        _pad: &Pad,
        _caps: &Caps,
        default: Vec<Arc<Factory>>,
    ) -> Option<Vec<Arc<Factory>>> {
        Some(default)
    }

    /// Optional reorder of the candidate list. None keeps the order.
    fn autoplug_sort(
        &self,
        _pad: &Pad,
        _caps: &Caps,
        _factories: &[Arc<Factory>],
    ) -> Option<Vec<Arc<Factory>>> {
        None
    }

    fn autoplug_select(&self, _pad: &Pad, _caps: &Caps, _factory: &Arc<Factory>) -> AutoplugSelect {
        AutoplugSelect::Try
    }

    /// Lets the caller answer queries for elements that are not linked yet.
    fn autoplug_query(&self, _pad: &Pad, _element: &ElementRef, _query: &mut Query) -> bool {
        false
    }

    /// Observer for streams nothing could handle.
    fn unknown_type(&self, _pad: &Pad, _caps: &Caps) {}
}

/// The built-in policy: plug everything the registry offers.
pub struct DefaultPolicy;

impl AutoplugPolicy for DefaultPolicy {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::PadDirection;
    use crate::registry::rank;

    #[test]
    fn test_default_policy_passthrough() {
        let policy = DefaultPolicy;
        let pad = Pad::new("src", PadDirection::Src);
        let caps = Caps::simple("audio/mpeg");
        assert!(policy.autoplug_continue(&pad, &caps));

        let factory = Factory::builder("dec")
            .rank(rank::PRIMARY)
            .klass("Codec/Decoder")
            .build(|_| unreachable!());
        let list = vec![factory.clone()];
        assert_eq!(
            policy
                .autoplug_factories(&pad, &caps, list.clone())
                .unwrap()
                .len(),
            1
        );
        assert!(policy.autoplug_sort(&pad, &caps, &list).is_none());
        assert_eq!(
            policy.autoplug_select(&pad, &caps, &factory),
            AutoplugSelect::Try
        );
    }
}
