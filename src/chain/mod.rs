//! The dynamic data model of the engine: a tree of chains (linear element
//! cascades) and groups (sibling chains sharing a multi-queue below one
//! demuxer), held in an id-keyed store so back-links never carry ownership.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::caps::Caps;
use crate::config::DecodeBinConfig;
use crate::element::ElementRef;
use crate::elements::queuecell::QueueLimits;
use crate::elements::{CapsFilter, MultiQueue};
use crate::pad::{Pad, ProbeId};

pub const AUTO_PREROLL_SIZE_BYTES: u64 = 2 * 1024 * 1024;
pub const AUTO_PREROLL_SIZE_BUFFERS: u64 = 0;
pub const AUTO_PREROLL_NOT_SEEKABLE_SIZE_TIME: u64 = 10_000_000_000;
pub const AUTO_PREROLL_SEEKABLE_SIZE_TIME: u64 = 0;

pub const AUTO_PLAY_SIZE_BYTES: u64 = 2 * 1024 * 1024;
pub const AUTO_PLAY_SIZE_BUFFERS: u64 = 5;
pub const AUTO_PLAY_SIZE_TIME: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// The exposable leaf pad of a completed chain.
pub struct EndPad {
    pub pad: Pad,
    pub blocked: bool,
    pub exposed: bool,
    pub drained: bool,
    pub block_probe: Option<ProbeId>,
    pub eos_probe: Option<ProbeId>,
}

impl EndPad {
    pub fn new(pad: Pad) -> Self {
        Self {
            pad,
            blocked: false,
            exposed: false,
            drained: false,
            block_probe: None,
            eos_probe: None,
        }
    }
}

/// A non-fixed pad parked with an event probe until its caps settle.
pub struct PendingPad {
    pub pad: Pad,
    pub probe: ProbeId,
}

/// One inserted element and its optional paired caps filter.
pub struct ChainElement {
    pub element: ElementRef,
    pub capsfilter: Option<Arc<CapsFilter>>,
}

/// A linear cascade of elements ending in an exposable pad, a demuxer
/// spawning a group, or a dead end.
pub struct DecodeChain {
    pub id: ChainId,
    pub parent_group: Option<GroupId>,
    pub origin_pad: Pad,
    /// Last entry is the most-downstream element.
    pub elements: Vec<ChainElement>,
    pub demuxer: bool,
    pub active_group: Option<GroupId>,
    /// Pending future groups, newest first.
    pub next_groups: Vec<GroupId>,
    /// Groups hidden for deferred disposal.
    pub old_groups: Vec<GroupId>,
    pub pending_pads: Vec<PendingPad>,
    pub end_pad: Option<EndPad>,
    pub deadend: bool,
    pub deadend_details: Option<String>,
    pub end_caps: Option<Caps>,
    pub parsed: bool,
    pub drained: bool,
}

impl DecodeChain {
    /// The most-downstream element, if any.
    pub fn last_element(&self) -> Option<&ChainElement> {
        self.elements.last()
    }

    /// At most one of end pad / active group / dead end may be set.
    pub fn invariant_holds(&self) -> bool {
        let set = [self.end_pad.is_some(), self.active_group.is_some(), self.deadend];
        set.iter().filter(|v| **v).count() <= 1
    }
}

/// Sibling chains fed by one demuxer through a shared multi-queue.
pub struct StreamGroup {
    pub id: GroupId,
    pub parent_chain: ChainId,
    pub multiqueue: Arc<MultiQueue>,
    pub children: Vec<ChainId>,
    pub overrun: bool,
    pub no_more_pads: bool,
    pub drained: bool,
}

pub type ChainRef = Arc<Mutex<DecodeChain>>;
pub type GroupRef = Arc<Mutex<StreamGroup>>;

/// Id-keyed store for the tree. Handles stay valid until explicit removal;
/// lock order is strictly parent before child.
pub struct ChainStore {
    chains: Mutex<HashMap<ChainId, ChainRef>>,
    groups: Mutex<HashMap<GroupId, GroupRef>>,
    next_id: AtomicU64,
}

impl Default for ChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore {
    pub fn new() -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn new_chain(&self, parent_group: Option<GroupId>, origin_pad: Pad) -> ChainId {
        let id = ChainId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let chain = DecodeChain {
            id,
            parent_group,
            origin_pad,
            elements: Vec::new(),
            demuxer: false,
            active_group: None,
            next_groups: Vec::new(),
            old_groups: Vec::new(),
            pending_pads: Vec::new(),
            end_pad: None,
            deadend: false,
            deadend_details: None,
            end_caps: None,
            parsed: false,
            drained: false,
        };
        self.chains.lock().insert(id, Arc::new(Mutex::new(chain)));
        if let Some(group_id) = parent_group {
            if let Some(group) = self.group(group_id) {
                group.lock().children.push(id);
            }
        }
        id
    }

    pub fn new_group(&self, parent_chain: ChainId, multiqueue: Arc<MultiQueue>) -> GroupId {
        let id = GroupId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let group = StreamGroup {
            id,
            parent_chain,
            multiqueue,
            children: Vec::new(),
            overrun: false,
            no_more_pads: false,
            drained: false,
        };
        self.groups.lock().insert(id, Arc::new(Mutex::new(group)));
        id
    }

    pub fn chain(&self, id: ChainId) -> Option<ChainRef> {
        self.chains.lock().get(&id).cloned()
    }

    pub fn group(&self, id: GroupId) -> Option<GroupRef> {
        self.groups.lock().get(&id).cloned()
    }

    pub fn remove_chain(&self, id: ChainId) -> Option<ChainRef> {
        self.chains.lock().remove(&id)
    }

    pub fn remove_group(&self, id: GroupId) -> Option<GroupRef> {
        self.groups.lock().remove(&id)
    }

    pub fn chain_count(&self) -> usize {
        self.chains.lock().len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// A chain is complete when it dead-ended, its end pad is blocked or
    /// exposed, its demuxer's active group completed, or (parse mode) it
    /// finished as a parsed leaf.
    pub fn chain_is_complete(&self, id: ChainId) -> bool {
        let chain = match self.chain(id) {
            Some(c) => c,
            None => return false,
        };
        let (deadend, parsed, end_pad_done, demuxer, active_group) = {
            let chain = chain.lock();
            let end_pad_done = chain
                .end_pad
                .as_ref()
                .map(|ep| ep.blocked || ep.exposed)
                .unwrap_or(false);
            (
                chain.deadend,
                chain.parsed,
                end_pad_done,
                chain.demuxer,
                chain.active_group,
            )
        };
        if deadend || parsed || end_pad_done {
            return true;
        }
        if demuxer {
            if let Some(group_id) = active_group {
                return self.group_is_complete(group_id);
            }
        }
        false
    }

    /// A group is complete when it overran or saw no-more-pads AND every
    /// child chain is complete.
    pub fn group_is_complete(&self, id: GroupId) -> bool {
        let group = match self.group(id) {
            Some(g) => g,
            None => return false,
        };
        let (closed, children) = {
            let group = group.lock();
            (group.overrun || group.no_more_pads, group.children.clone())
        };
        if !closed {
            return false;
        }
        children.iter().all(|&c| self.chain_is_complete(c))
    }

    /// Whether the group is still accepting new pads.
    pub fn group_is_open(&self, id: GroupId) -> bool {
        match self.group(id) {
            Some(group) => {
                let group = group.lock();
                !group.overrun && !group.no_more_pads
            }
            None => false,
        }
    }

    /// Collects every end pad below `root` in depth-first order, together
    /// with dead-end diagnostics and the completed groups crossed on the
    /// way.
    pub fn collect_exposable(&self, root: ChainId) -> ExposeCollection {
        let mut out = ExposeCollection::default();
        self.collect_into(root, &mut out);
        out
    }

    fn collect_into(&self, id: ChainId, out: &mut ExposeCollection) {
        let chain = match self.chain(id) {
            Some(c) => c,
            None => return,
        };
        let (end_pad, deadend, details, end_caps, active_group) = {
            let chain = chain.lock();
            (
                chain.end_pad.as_ref().map(|ep| ep.pad.clone()),
                chain.deadend,
                chain.deadend_details.clone(),
                chain.end_caps.clone(),
                chain.active_group,
            )
        };
        if let Some(pad) = end_pad {
            out.endpads.push((id, pad));
            return;
        }
        if deadend {
            if let Some(details) = details {
                out.missing_plugin_details.push(details);
            }
            out.deadends.push((id, end_caps));
            return;
        }
        if let Some(group_id) = active_group {
            if self.group_is_complete(group_id) {
                out.complete_groups.push(group_id);
            }
            let children = self
                .group(group_id)
                .map(|g| g.lock().children.clone())
                .unwrap_or_default();
            for child in children {
                self.collect_into(child, out);
            }
        }
    }

    /// Serializes the tree below `root` for the stream-topology message.
    pub fn topology(&self, root: ChainId) -> serde_json::Value {
        let chain = match self.chain(root) {
            Some(c) => c,
            None => return serde_json::Value::Null,
        };
        let (elements, end_caps, origin_caps, active_group, deadend) = {
            let chain = chain.lock();
            (
                chain
                    .elements
                    .iter()
                    .map(|e| e.element.name())
                    .collect::<Vec<_>>(),
                chain.end_caps.clone(),
                chain.origin_pad.current_caps(),
                chain.active_group,
                chain.deadend,
            )
        };
        let mut node = serde_json::json!({
            "type": "container",
            "elements": elements,
        });
        if let Some(caps) = origin_caps {
            node["caps"] = serde_json::Value::String(caps.to_string());
        }
        if let Some(group_id) = active_group {
            let children: Vec<serde_json::Value> = self
                .group(group_id)
                .map(|g| g.lock().children.clone())
                .unwrap_or_default()
                .into_iter()
                .map(|c| self.topology(c))
                .collect();
            node["children"] = serde_json::Value::Array(children);
        } else {
            node["type"] = serde_json::Value::String(
                if deadend { "unknown" } else { "stream" }.to_string(),
            );
            if let Some(caps) = end_caps {
                node["pad-caps"] = serde_json::Value::String(caps.to_string());
            }
        }
        node
    }

    /// All chain ids below `root`, root first.
    pub fn descendant_chains(&self, root: ChainId) -> Vec<ChainId> {
        let mut out = vec![root];
        let mut index = 0;
        while index < out.len() {
            let id = out[index];
            index += 1;
            let groups = match self.chain(id) {
                Some(chain) => {
                    let chain = chain.lock();
                    let mut groups = Vec::new();
                    groups.extend(chain.active_group);
                    groups.extend(chain.next_groups.iter().copied());
                    groups.extend(chain.old_groups.iter().copied());
                    groups
                }
                None => continue,
            };
            for group_id in groups {
                if let Some(group) = self.group(group_id) {
                    out.extend(group.lock().children.iter().copied());
                }
            }
        }
        out
    }
}

#[derive(Default)]
pub struct ExposeCollection {
    pub endpads: Vec<(ChainId, Pad)>,
    pub deadends: Vec<(ChainId, Option<Caps>)>,
    pub missing_plugin_details: Vec<String>,
    pub complete_groups: Vec<GroupId>,
}

/// Multi-queue limits for the pre-expose regime: tight byte budget,
/// unlimited buffers, time bounded only for non-seekable sources. User
/// overrides replace the automatic values.
pub fn preroll_limits(config: &DecodeBinConfig, seekable: bool) -> QueueLimits {
    QueueLimits {
        max_bytes: if config.max_size_bytes != 0 {
            config.max_size_bytes
        } else {
            AUTO_PREROLL_SIZE_BYTES
        },
        max_buffers: if config.max_size_buffers != 0 {
            config.max_size_buffers
        } else {
            AUTO_PREROLL_SIZE_BUFFERS
        },
        max_time: if config.max_size_time != 0 {
            config.max_size_time
        } else if seekable {
            AUTO_PREROLL_SEEKABLE_SIZE_TIME
        } else {
            AUTO_PREROLL_NOT_SEEKABLE_SIZE_TIME
        },
    }
}

/// Multi-queue limits once a group is exposed and playing.
pub fn play_limits(config: &DecodeBinConfig) -> QueueLimits {
    QueueLimits {
        max_bytes: if config.max_size_bytes != 0 {
            config.max_size_bytes
        } else {
            AUTO_PLAY_SIZE_BYTES
        },
        max_buffers: if config.max_size_buffers != 0 {
            config.max_size_buffers
        } else {
            AUTO_PLAY_SIZE_BUFFERS
        },
        max_time: if config.max_size_time != 0 {
            config.max_size_time
        } else {
            AUTO_PLAY_SIZE_TIME
        },
    }
}

/// Applies a regime to a group's multi-queue and propagates buffering
/// options.
pub fn configure_multiqueue(
    mq: &MultiQueue,
    config: &DecodeBinConfig,
    preroll: bool,
    seekable: bool,
) {
    let limits = if preroll {
        preroll_limits(config, seekable)
    } else {
        play_limits(config)
    };
    mq.set_limits(limits);
    mq.set_use_buffering(config.use_buffering);
    mq.set_watermarks(config.low_watermark, config.high_watermark);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::PadDirection;

    fn test_pad() -> Pad {
        Pad::new("src", PadDirection::Src)
    }

    #[test]
    fn test_chain_invariant() {
        let store = ChainStore::new();
        let id = store.new_chain(None, test_pad());
        let chain = store.chain(id).unwrap();
        assert!(chain.lock().invariant_holds());

        chain.lock().end_pad = Some(EndPad::new(test_pad()));
        assert!(chain.lock().invariant_holds());

        chain.lock().deadend = true;
        assert!(!chain.lock().invariant_holds());
    }

    #[test]
    fn test_completion_rules() {
        let store = ChainStore::new();
        let root = store.new_chain(None, test_pad());
        assert!(!store.chain_is_complete(root));

        // Dead end completes a chain.
        store.chain(root).unwrap().lock().deadend = true;
        assert!(store.chain_is_complete(root));
        store.chain(root).unwrap().lock().deadend = false;

        // A blocked end pad completes a chain.
        {
            let chain = store.chain(root).unwrap();
            let mut chain = chain.lock();
            let mut ep = EndPad::new(test_pad());
            ep.blocked = true;
            chain.end_pad = Some(ep);
        }
        assert!(store.chain_is_complete(root));
    }

    #[test]
    fn test_group_completion_requires_closure_and_children() {
        let store = ChainStore::new();
        let root = store.new_chain(None, test_pad());
        let mq = MultiQueue::new("mq");
        let group_id = store.new_group(root, mq);
        {
            let chain = store.chain(root).unwrap();
            let mut chain = chain.lock();
            chain.demuxer = true;
            chain.active_group = Some(group_id);
        }
        let child = store.new_chain(Some(group_id), test_pad());

        // Open group: not complete even with complete children.
        store.chain(child).unwrap().lock().deadend = true;
        assert!(!store.group_is_complete(group_id));
        assert!(store.group_is_open(group_id));

        // Closed group with complete children: complete, and the parent
        // chain completes through it.
        store.group(group_id).unwrap().lock().no_more_pads = true;
        assert!(store.group_is_complete(group_id));
        assert!(store.chain_is_complete(root));

        // Incomplete child reopens nothing but blocks completion.
        let late = store.new_chain(Some(group_id), test_pad());
        assert!(!store.group_is_complete(group_id));
        store.chain(late).unwrap().lock().deadend = true;
        assert!(store.group_is_complete(group_id));
    }

    #[test]
    fn test_collect_exposable() {
        let store = ChainStore::new();
        let root = store.new_chain(None, test_pad());
        let mq = MultiQueue::new("mq");
        let group_id = store.new_group(root, mq);
        {
            let chain = store.chain(root).unwrap();
            let mut chain = chain.lock();
            chain.demuxer = true;
            chain.active_group = Some(group_id);
        }
        let audio = store.new_chain(Some(group_id), test_pad());
        let video = store.new_chain(Some(group_id), test_pad());
        {
            let chain = store.chain(audio).unwrap();
            let mut ep = EndPad::new(test_pad());
            ep.blocked = true;
            chain.lock().end_pad = Some(ep);
        }
        {
            let chain = store.chain(video).unwrap();
            let mut chain = chain.lock();
            chain.deadend = true;
            chain.deadend_details = Some("video/x-unknown".to_string());
        }
        store.group(group_id).unwrap().lock().no_more_pads = true;

        let collected = store.collect_exposable(root);
        assert_eq!(collected.endpads.len(), 1);
        assert_eq!(collected.endpads[0].0, audio);
        assert_eq!(collected.deadends.len(), 1);
        assert_eq!(collected.missing_plugin_details, vec!["video/x-unknown"]);
        assert_eq!(collected.complete_groups, vec![group_id]);
    }

    #[test]
    fn test_limits_regimes() {
        let config = DecodeBinConfig::default();
        let preroll = preroll_limits(&config, true);
        assert_eq!(preroll.max_bytes, AUTO_PREROLL_SIZE_BYTES);
        assert_eq!(preroll.max_time, 0);
        let preroll = preroll_limits(&config, false);
        assert_eq!(preroll.max_time, AUTO_PREROLL_NOT_SEEKABLE_SIZE_TIME);

        let play = play_limits(&config);
        assert_eq!(play.max_buffers, AUTO_PLAY_SIZE_BUFFERS);

        let mut config = DecodeBinConfig::default();
        config.max_size_bytes = 777;
        assert_eq!(preroll_limits(&config, true).max_bytes, 777);
        assert_eq!(play_limits(&config).max_bytes, 777);
    }
}
