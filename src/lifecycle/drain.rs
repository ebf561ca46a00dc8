//! EOS draining and chained-stream group switching: walk the tree from the
//! root, mark the drained pad, aggregate upwards, and swap in the next
//! pending group when the active one has fully drained.

use std::sync::Arc;

use crate::chain::{ChainId, GroupId};
use crate::lifecycle::BinInner;
use crate::pad::Pad;

struct DrainCtx {
    /// False once any chain on the walk still has pending next groups.
    last_group: bool,
    /// The chain that performed a group switch, if any.
    switched: Option<ChainId>,
}

impl BinInner {
    /// An exposed (or about-to-be-exposed) end pad saw EOS. Returns
    /// whether the EOS belongs to the last group and may leave the bin.
    pub(crate) fn handle_endpad_eos(self: &Arc<Self>, _chain_id: ChainId, pad: &Pad) -> bool {
        let root = match *self.root_chain.lock() {
            Some(r) => r,
            None => return true,
        };
        let mut ctx = DrainCtx {
            last_group: true,
            switched: None,
        };
        let (_, root_drained) = self.drain_chain(root, pad, &mut ctx);
        log::debug!(
            "{}: drain walk done (last_group: {}, switched: {:?}, drained: {})",
            self.name,
            ctx.last_group,
            ctx.switched,
            root_drained
        );

        if let Some(switched_chain) = ctx.switched {
            // The promoted group may already be complete; rewire outputs.
            self.expose_if_complete();
            let hidden: Vec<GroupId> = match self.store.chain(switched_chain) {
                Some(chain) => std::mem::take(&mut chain.lock().old_groups),
                None => Vec::new(),
            };
            for group_id in hidden {
                self.dispose_group_async(group_id);
            }
        }

        if root_drained && ctx.last_group {
            // Callers wanting gapless continuation get their chance right
            // before the drained notification.
            self.fire_about_to_finish();
            self.fire_drained();
        }
        ctx.last_group
    }

    fn drain_chain(self: &Arc<Self>, id: ChainId, target: &Pad, ctx: &mut DrainCtx) -> (bool, bool) {
        let chain = match self.store.chain(id) {
            Some(c) => c,
            None => return (false, true),
        };
        let mut handled = false;
        let active = {
            let mut chain = chain.lock();
            if chain.drained {
                return (false, true);
            }
            if let Some(ep) = chain.end_pad.as_mut() {
                if &ep.pad == target {
                    ep.drained = true;
                    handled = true;
                }
                chain.drained = ep.drained;
                return (handled, chain.drained);
            }
            // Dead ends never produce EOS; they count as drained.
            if chain.deadend {
                chain.drained = true;
                return (false, true);
            }
            if !chain.next_groups.is_empty() {
                ctx.last_group = false;
            }
            chain.active_group
        };

        if let Some(group_id) = active {
            let (group_handled, subdrained) = self.drain_group(group_id, target, ctx);
            handled |= group_handled;
            if group_handled && subdrained && ctx.switched.is_none() {
                let mut chain = chain.lock();
                if !chain.next_groups.is_empty() {
                    if let Some(old) = chain.active_group.take() {
                        log::debug!("{}: hiding drained {}", self.name, old);
                        self.hide_group(old);
                        chain.old_groups.push(old);
                    }
                    let next = chain.next_groups.remove(0);
                    log::debug!("{}: switching to {}", self.name, next);
                    chain.active_group = Some(next);
                    chain.drained = false;
                    ctx.switched = Some(id);
                } else {
                    chain.drained = true;
                }
            }
        }

        let drained = chain.lock().drained;
        (handled, drained)
    }

    fn drain_group(self: &Arc<Self>, id: GroupId, target: &Pad, ctx: &mut DrainCtx) -> (bool, bool) {
        let group = match self.store.group(id) {
            Some(g) => g,
            None => return (false, true),
        };
        let children = {
            let group = group.lock();
            if group.drained {
                return (false, true);
            }
            group.children.clone()
        };
        let mut handled = false;
        let mut all_drained = true;
        for child in children {
            let (child_handled, subdrained) = self.drain_chain(child, target, ctx);
            handled |= child_handled;
            if !subdrained {
                all_drained = false;
            }
        }
        group.lock().drained = all_drained;
        (handled, all_drained)
    }

    /// Detaches a drained group from the outside world without tearing its
    /// elements down yet; disposal happens on a worker after the switch.
    fn hide_group(self: &Arc<Self>, id: GroupId) {
        let group = match self.store.group(id) {
            Some(g) => g,
            None => return,
        };
        let (children, mq) = {
            let group = group.lock();
            (group.children.clone(), group.multiqueue.clone())
        };
        mq.clear_overrun_callbacks();
        for child in children {
            if let Some(chain) = self.store.chain(child) {
                let mut chain = chain.lock();
                if let Some(ep) = chain.end_pad.as_mut() {
                    if let Some(probe) = ep.eos_probe.take() {
                        ep.pad.remove_probe(probe);
                    }
                    if let Some(probe) = ep.block_probe.take() {
                        ep.pad.remove_probe(probe);
                    }
                    ep.exposed = false;
                }
            }
        }
    }
}
