// Shared simulation state
//
// Nodes and links see the world through this context while workers update
// them in parallel. The registry is read-only during the link and node
// phases; everything that changes topology is staged and applied by
// `upkeep`, which runs alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::sim_config::SimConfig;
use crate::sim_error::SimError;
use crate::sim_interface::{EventType, Inbound, LinkId, NodeId, SimEvent, SimId, Tick};
use crate::sim_link::SharedLink;
use crate::sim_node::{NodeHandle, SimNode};
use crate::sim_rng::SimRng;

/// Live objects, in admission order.
#[derive(Default)]
struct Registry {
    nodes: IndexMap<NodeId, Arc<NodeHandle>>,
    links: IndexMap<LinkId, SharedLink>,
    edges: HashMap<(NodeId, NodeId), LinkId>,
    outgoing: HashMap<NodeId, Vec<NodeId>>,
    incoming: HashMap<NodeId, Vec<NodeId>>,
}

impl Registry {
    fn remove_link(&mut self, id: LinkId) -> Option<(NodeId, NodeId)> {
        let link = self.links.shift_remove(&id)?;
        let (from, to) = {
            let link = link.lock();
            (link.from(), link.to())
        };
        self.edges.remove(&(from, to));
        if let Some(out) = self.outgoing.get_mut(&from) {
            out.retain(|n| *n != to);
        }
        if let Some(inc) = self.incoming.get_mut(&to) {
            inc.retain(|n| *n != from);
        }
        Some((from, to))
    }

    fn live_only(&self, ids: Option<&Vec<NodeId>>) -> Vec<NodeId> {
        ids.map(|ids| {
            ids.iter()
                .filter(|id| self.nodes.contains_key(*id))
                .copied()
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Topology changes requested during a phase, applied at upkeep.
#[derive(Default)]
struct Staged {
    dead_links: Mutex<Vec<LinkId>>,
    dead_nodes: Mutex<Vec<NodeId>>,
    new_links: Mutex<Vec<(NodeId, NodeId, SharedLink)>>,
    new_nodes: Mutex<Vec<Arc<NodeHandle>>>,
    proposals: Mutex<Vec<(NodeId, u64)>>,
}

pub struct SimContext {
    config: SimConfig,
    tick: AtomicU64,
    next_id: AtomicU64,
    rng: SimRng,
    registry: RwLock<Registry>,
    staged: Staged,
    proposal_seq: AtomicU64,
    consensus_threshold: AtomicU64,
}

impl SimContext {
    pub fn new(config: SimConfig, seed: u64) -> Arc<Self> {
        Self::with_rng(config, SimRng::seeded(seed))
    }

    pub fn with_rng(config: SimConfig, rng: SimRng) -> Arc<Self> {
        Arc::new(Self {
            config,
            tick: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            rng,
            registry: RwLock::new(Registry::default()),
            staged: Staged::default(),
            proposal_seq: AtomicU64::new(0),
            consensus_threshold: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::Acquire)
    }

    pub fn advance_tick(&self) -> Tick {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Process-wide id counter shared by nodes and links. Starts at 1.
    pub fn next_id(&self) -> SimId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn rng(&self) -> &SimRng {
        &self.rng
    }

    pub fn consensus_threshold(&self) -> u64 {
        self.consensus_threshold.load(Ordering::Acquire)
    }

    // ========================================================================
    // Registry reads
    // ========================================================================

    pub fn node_exists(&self, id: NodeId) -> bool {
        self.registry.read().nodes.contains_key(&id)
    }

    pub fn get_node(&self, id: NodeId) -> Result<Arc<NodeHandle>, SimError> {
        self.registry
            .read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or(SimError::NodeNotFound(id))
    }

    pub fn get_link(&self, id: LinkId) -> Result<SharedLink, SimError> {
        self.registry
            .read()
            .links
            .get(&id)
            .cloned()
            .ok_or(SimError::LinkNotFound(id))
    }

    /// Live link from `from` to `to`.
    pub fn get_link_between(&self, from: NodeId, to: NodeId) -> Result<SharedLink, SimError> {
        let registry = self.registry.read();
        registry
            .edges
            .get(&(from, to))
            .and_then(|id| registry.links.get(id))
            .cloned()
            .ok_or(SimError::NoLinkBetween { from, to })
    }

    /// Live or staged link from `from` to `to`.
    pub fn find_link(&self, from: NodeId, to: NodeId) -> Option<SharedLink> {
        if let Ok(link) = self.get_link_between(from, to) {
            return Some(link);
        }
        self.staged
            .new_links
            .lock()
            .iter()
            .find(|(f, t, _)| *f == from && *t == to)
            .map(|(_, _, link)| link.clone())
    }

    pub fn outgoing_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        let registry = self.registry.read();
        registry.live_only(registry.outgoing.get(&id))
    }

    pub fn incoming_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        let registry = self.registry.read();
        registry.live_only(registry.incoming.get(&id))
    }

    /// Uniform pick over live nodes using the caller's stream.
    pub fn pick_random_node<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<NodeId> {
        let registry = self.registry.read();
        if registry.nodes.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..registry.nodes.len());
        registry.nodes.get_index(index).map(|(id, _)| *id)
    }

    pub fn node_count(&self) -> usize {
        self.registry.read().nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.registry.read().links.len()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.registry.read().nodes.keys().copied().collect()
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.registry.read().links.keys().copied().collect()
    }

    /// Live nodes in admission order, for handing slices to workers.
    pub fn node_snapshot(&self) -> Vec<Arc<NodeHandle>> {
        self.registry.read().nodes.values().cloned().collect()
    }

    pub fn link_snapshot(&self) -> Vec<SharedLink> {
        self.registry.read().links.values().cloned().collect()
    }

    // ========================================================================
    // Staging
    // ========================================================================

    /// Stages the node and returns its id. It becomes visible at the next upkeep.
    pub fn add_node(&self, node: SimNode) -> NodeId {
        let id = node.id();
        self.staged.new_nodes.lock().push(Arc::new(NodeHandle::new(node)));
        id
    }

    pub fn add_link(&self, link: SharedLink) {
        let (from, to) = {
            let l = link.lock();
            (l.from(), l.to())
        };
        self.staged.new_links.lock().push((from, to, link));
    }

    pub fn drop_link(&self, id: LinkId) {
        self.staged.dead_links.lock().push(id);
    }

    pub fn drop_node(&self, id: NodeId) {
        self.staged.dead_nodes.lock().push(id);
    }

    pub fn stage_proposal(&self, node: NodeId, transactions: u64) {
        self.staged.proposals.lock().push((node, transactions));
    }

    // ========================================================================
    // Upkeep
    // ========================================================================

    /// Applies every staged change in a fixed order and returns the events
    /// produced, in the order they happened.
    pub fn upkeep(&self) -> Vec<SimEvent> {
        let tick = self.current_tick();
        let mut events = Vec::new();
        let mut registry = self.registry.write();

        let mut dead_links = std::mem::take(&mut *self.staged.dead_links.lock());
        dead_links.sort_unstable();
        dead_links.dedup();
        for id in dead_links {
            if let Some((from, to)) = registry.remove_link(id) {
                events.push(SimEvent::new(
                    tick,
                    EventType::NetLinkDisconnected,
                    format!("link {}", id),
                    format!("Network link disconnected: ({} -|-> {})", from, to),
                ));
            }
        }

        let mut dead_nodes = std::mem::take(&mut *self.staged.dead_nodes.lock());
        dead_nodes.sort_unstable();
        dead_nodes.dedup();
        for id in dead_nodes {
            if let Some(handle) = registry.nodes.shift_remove(&id) {
                registry.outgoing.remove(&id);
                registry.incoming.remove(&id);
                events.push(SimEvent::new(
                    tick,
                    EventType::NodeRemoved,
                    handle.lock().description(),
                    "Node went offline.",
                ));
            }
        }

        let new_nodes = std::mem::take(&mut *self.staged.new_nodes.lock());
        for handle in new_nodes {
            events.push(SimEvent::new(
                tick,
                EventType::NodeAdded,
                handle.lock().description(),
                "Node came online.",
            ));
            registry.nodes.insert(handle.id(), handle);
        }

        let mut new_links = std::mem::take(&mut *self.staged.new_links.lock());
        new_links.sort_by_key(|(from, to, _)| (*from, *to));
        for (from, to, link) in new_links {
            if from == to
                || registry.edges.contains_key(&(from, to))
                || !registry.nodes.contains_key(&from)
                || !registry.nodes.contains_key(&to)
            {
                link.lock().discard(tick, &mut events);
                events.push(SimEvent::new(
                    tick,
                    EventType::NetLinkRejected,
                    format!("link {} -> {}", from, to),
                    format!("Network link rejected: ({} -x-> {})", from, to),
                ));
                continue;
            }

            let id = self.next_id();
            link.lock().assign_id(id);
            registry.links.insert(id, link);
            registry.edges.insert((from, to), id);
            registry.outgoing.entry(from).or_default().push(to);
            registry.incoming.entry(to).or_default().push(from);
            events.push(SimEvent::new(
                tick,
                EventType::NetLinkConnected,
                format!("link {}", id),
                format!("Network link connected: ({} ---> {})", from, to),
            ));
        }

        let proposals = std::mem::take(&mut *self.staged.proposals.lock());
        for (node, transactions) in proposals {
            match registry.nodes.get(&node) {
                Some(handle) => {
                    let seq = self.proposal_seq.fetch_add(1, Ordering::Relaxed);
                    handle.deliver(Inbound::Proposal { seq, transactions });
                }
                None => debug!("proposal for missing node {} dropped", node),
            }
        }

        let live = registry.nodes.len() as f64;
        let threshold = ((live * self.config.consensus_fraction).ceil() as u64).max(1);
        self.consensus_threshold.store(threshold, Ordering::Release);

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_interface::NetworkMessage;
    use crate::sim_link::{LinkParams, SimLink};

    fn link(ctx: &SimContext, from: NodeId, to: NodeId) -> SharedLink {
        ctx.rng()
            .with(|rng| SimLink::new(ctx.config(), from, to, LinkParams::fixed(1, 1.0), rng))
            .into_shared()
    }

    fn nodes(ctx: &SimContext, count: usize) -> Vec<NodeId> {
        let ids = (0..count)
            .map(|_| ctx.add_node(SimNode::create(ctx, false, Some(1.0))))
            .collect();
        ctx.upkeep();
        ids
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let first = ctx.next_id();
        let second = ctx.next_id();
        assert_eq!(first, 1);
        assert!(second > first);
    }

    #[test]
    fn test_staged_nodes_invisible_until_upkeep() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let id = ctx.add_node(SimNode::create(&ctx, false, None));
        assert!(!ctx.node_exists(id));

        let events = ctx.upkeep();
        assert!(ctx.node_exists(id));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::NodeAdded);
        assert_eq!(events[0].message, "Node came online.");
    }

    #[test]
    fn test_duplicate_and_self_links_rejected() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 2);
        let (a, b) = (ids[0], ids[1]);

        ctx.add_link(link(&ctx, a, b));
        ctx.add_link(link(&ctx, a, b));
        ctx.add_link(link(&ctx, a, a));
        let events = ctx.upkeep();

        assert_eq!(ctx.link_count(), 1);
        let rejected = events
            .iter()
            .filter(|e| e.event_type == EventType::NetLinkRejected)
            .count();
        assert_eq!(rejected, 2);
        assert_eq!(ctx.outgoing_neighbors(a), vec![b]);
        assert_eq!(ctx.incoming_neighbors(b), vec![a]);
        assert!(ctx.get_link_between(b, a).is_err());
    }

    #[test]
    fn test_link_to_missing_node_rejected() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 2);
        let (a, b) = (ids[0], ids[1]);

        ctx.add_link(link(&ctx, a, 999));
        ctx.add_link(link(&ctx, 999, a));
        ctx.add_link(link(&ctx, a, b));
        ctx.drop_node(b);
        let events = ctx.upkeep();

        assert_eq!(ctx.link_count(), 0);
        assert!(ctx.get_link_between(a, 999).is_err());
        assert!(ctx.outgoing_neighbors(a).is_empty());
        let rejected: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::NetLinkRejected)
            .map(|e| e.object_name.as_str())
            .collect();
        assert_eq!(
            rejected,
            vec![
                format!("link {} -> {}", a, b),
                format!("link {} -> {}", a, 999),
                format!("link {} -> {}", 999, a),
            ]
        );
    }

    #[test]
    fn test_link_admitted_with_its_endpoints() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let a = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        let b = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        ctx.add_link(link(&ctx, a, b));
        let events = ctx.upkeep();

        assert_eq!(ctx.link_count(), 1);
        assert_eq!(ctx.outgoing_neighbors(a), vec![b]);
        assert!(events
            .iter()
            .all(|e| e.event_type != EventType::NetLinkRejected));
    }

    #[test]
    fn test_rejected_link_loses_queued_messages() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 2);
        let (a, b) = (ids[0], ids[1]);
        ctx.add_link(link(&ctx, a, b));
        ctx.upkeep();

        let duplicate = link(&ctx, a, b);
        {
            let mut sink = Vec::<SimEvent>::new();
            let mut staged = duplicate.lock();
            assert!(staged.send_message(0, NetworkMessage::Hello, &mut sink));
            assert!(staged.send_message(0, NetworkMessage::GetBlock { height: 3 }, &mut sink));
        }
        ctx.add_link(Arc::clone(&duplicate));
        let events = ctx.upkeep();

        let lost: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::NetworkMessageLost)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(
            lost,
            vec![
                format!("Hello lost ({} -x-> {})", a, b),
                format!("GetBlock(3) lost ({} -x-> {})", a, b),
            ]
        );
        let link = duplicate.lock();
        assert_eq!(link.in_flight(), 0);
        assert!(link.is_disconnected());
    }

    #[test]
    fn test_link_ids_follow_endpoint_order() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 3);

        // staged out of order, admitted sorted by (from, to)
        ctx.add_link(link(&ctx, ids[2], ids[0]));
        ctx.add_link(link(&ctx, ids[0], ids[1]));
        ctx.upkeep();

        let first = ctx.get_link_between(ids[0], ids[1]).unwrap().lock().id();
        let second = ctx.get_link_between(ids[2], ids[0]).unwrap().lock().id();
        assert!(first < second);
    }

    #[test]
    fn test_removed_node_hidden_from_neighbors() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 3);
        ctx.add_link(link(&ctx, ids[0], ids[1]));
        ctx.add_link(link(&ctx, ids[0], ids[2]));
        ctx.upkeep();

        ctx.drop_node(ids[1]);
        let events = ctx.upkeep();
        assert_eq!(events[0].event_type, EventType::NodeRemoved);
        assert_eq!(ctx.outgoing_neighbors(ids[0]), vec![ids[2]]);
        assert!(matches!(
            ctx.get_node(ids[1]),
            Err(SimError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_evicted_node_leaves_no_adjacency() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 3);
        ctx.add_link(link(&ctx, ids[0], ids[1]));
        ctx.add_link(link(&ctx, ids[1], ids[2]));
        ctx.upkeep();

        ctx.drop_node(ids[1]);
        ctx.upkeep();
        {
            let registry = ctx.registry.read();
            assert!(!registry.outgoing.contains_key(&ids[1]));
            assert!(!registry.incoming.contains_key(&ids[1]));
        }

        // the surviving endpoints' links are dropped later without trouble
        for id in ctx.link_ids() {
            ctx.drop_link(id);
        }
        ctx.upkeep();
        assert_eq!(ctx.link_count(), 0);
        assert!(ctx.outgoing_neighbors(ids[0]).is_empty());
        assert!(ctx.incoming_neighbors(ids[2]).is_empty());
    }

    #[test]
    fn test_find_link_sees_staged() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 2);
        ctx.add_link(link(&ctx, ids[0], ids[1]));

        assert!(ctx.find_link(ids[0], ids[1]).is_some());
        assert!(ctx.find_link(ids[1], ids[0]).is_none());
        assert!(ctx.get_link_between(ids[0], ids[1]).is_err());
    }

    #[test]
    fn test_consensus_threshold_tracks_population() {
        let config = SimConfig {
            consensus_fraction: 0.5,
            ..SimConfig::default()
        };
        let ctx = SimContext::new(config, 1);
        assert_eq!(ctx.consensus_threshold(), 1);

        nodes(&ctx, 5);
        assert_eq!(ctx.consensus_threshold(), 3);
    }

    #[test]
    fn test_proposal_delivered_to_live_node() {
        let ctx = SimContext::new(SimConfig::default(), 1);
        let ids = nodes(&ctx, 1);
        ctx.stage_proposal(ids[0], 12);
        ctx.stage_proposal(999, 12);
        ctx.upkeep();
        assert_eq!(ctx.get_node(ids[0]).unwrap().inbox_len(), 1);
    }
}
