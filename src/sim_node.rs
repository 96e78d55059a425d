// Protocol participant
//
// A node joins the network (Connecting), pulls the retained window of the
// chain from its neighbors (Synchronizing), then verifies and appends new
// blocks as they are gossiped (Operating). Losing every outgoing neighbor
// sends it back to Connecting.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use log::warn;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::sim_context::SimContext;
use crate::sim_interface::{
    BlockHeight, EventSink, EventType, Inbound, NetworkMessage, NodeId, SignerSet, SimEvent, Tick,
};
use crate::sim_link::{LinkParams, SharedLink, SimLink};
use crate::sim_rng::uniform_in;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Connecting,
    Synchronizing,
    Operating,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Block currently undergoing local verification.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkingBlock {
    pub height: BlockHeight,
    pub transactions: u64,
    pub signers: SignerSet,
    pub processing_until: Tick,
    // own signature added once verification completes
    signed: bool,
}

impl WorkingBlock {
    fn announcement(&self) -> NetworkMessage {
        NetworkMessage::BlockData {
            height: self.height,
            transactions: self.transactions,
            signers: self.signers.clone(),
        }
    }
}

pub struct SimNode {
    id: NodeId,
    processing_speed: f64,
    full_history: bool,

    // retained window (redacted_bottom, redacted_top]
    redacted_bottom: BlockHeight,
    redacted_top: BlockHeight,
    transactions_per_block: BTreeMap<BlockHeight, u64>,
    signatures_per_block: BTreeMap<BlockHeight, SignerSet>,

    // State == Synchronizing
    blocks_to_sync: BTreeSet<BlockHeight>,
    wait_retry_tick: Tick,

    // State == Operating
    working: Option<WorkingBlock>,

    state: NodeState,
    pending: VecDeque<Inbound>,
    rng: StdRng,
}

impl SimNode {
    /// `processing_speed` of `None` draws from the configured range.
    pub fn new(
        id: NodeId,
        ctx: &SimContext,
        full_history: bool,
        processing_speed: Option<f64>,
        mut rng: StdRng,
    ) -> Self {
        let config = ctx.config();
        let processing_speed = processing_speed
            .unwrap_or_else(|| {
                uniform_in(
                    &mut rng,
                    config.node_processing_speed_min,
                    config.node_processing_speed_max,
                )
            })
            .max(0.0);

        Self {
            id,
            processing_speed,
            full_history,
            redacted_bottom: 0,
            redacted_top: 0,
            transactions_per_block: BTreeMap::new(),
            signatures_per_block: BTreeMap::new(),
            blocks_to_sync: BTreeSet::new(),
            wait_retry_tick: 0,
            working: None,
            state: NodeState::Connecting,
            pending: VecDeque::new(),
            rng,
        }
    }

    /// Allocates an id and a private random stream from the context.
    pub fn create(ctx: &SimContext, full_history: bool, processing_speed: Option<f64>) -> Self {
        let id = ctx.next_id();
        let rng = ctx.rng().fork();
        Self::new(id, ctx, full_history, processing_speed, rng)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn processing_speed(&self) -> f64 {
        self.processing_speed
    }

    pub fn full_history(&self) -> bool {
        self.full_history
    }

    pub fn redacted_bottom(&self) -> BlockHeight {
        self.redacted_bottom
    }

    pub fn redacted_top(&self) -> BlockHeight {
        self.redacted_top
    }

    pub fn blocks_to_sync(&self) -> &BTreeSet<BlockHeight> {
        &self.blocks_to_sync
    }

    pub fn transactions_per_block(&self) -> &BTreeMap<BlockHeight, u64> {
        &self.transactions_per_block
    }

    pub fn signatures_per_block(&self) -> &BTreeMap<BlockHeight, SignerSet> {
        &self.signatures_per_block
    }

    pub fn working_block(&self) -> Option<&WorkingBlock> {
        self.working.as_ref()
    }

    /// Height under verification, 0 when idle.
    pub fn working_on_block(&self) -> BlockHeight {
        self.working.as_ref().map_or(0, |w| w.height)
    }

    pub fn total_transactions(&self) -> u64 {
        self.transactions_per_block.values().sum()
    }

    pub fn description(&self) -> String {
        format!(
            "node {} @{:.4} FH:{} State:{}",
            self.id,
            self.processing_speed,
            if self.full_history { "Y" } else { "N" },
            self.state
        )
    }

    pub fn state_report(&self, indent: usize) -> String {
        let ws = " ".repeat(indent);
        let working = match &self.working {
            Some(w) => format!("{} ({} signatures)", w.height, w.signers.len()),
            None => "none".to_string(),
        };
        format!(
            "{ws}State: {}\n{ws}Speed: {:.4}\n{ws}Full history: {}\n{ws}Blocks: {} - {}\n\
             {ws}Blocks to sync: {}\n{ws}Working on block: {}\n{ws}Transactions in pool: {}",
            self.state,
            self.processing_speed,
            if self.full_history { "Yes" } else { "No" },
            self.redacted_bottom,
            self.redacted_top,
            self.blocks_to_sync.len(),
            working,
            self.total_transactions(),
            ws = ws
        )
    }

    /// Queues messages handed over from the node's inbox, in the order given.
    pub fn receive(&mut self, inbound: impl IntoIterator<Item = Inbound>) {
        self.pending.extend(inbound);
    }

    pub fn update(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        match self.state {
            NodeState::Connecting => self.update_connecting(ctx, events),
            NodeState::Synchronizing => self.update_synchronizing(ctx, events),
            NodeState::Operating => self.update_operating(ctx, events),
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    fn update_connecting(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        let config = ctx.config();
        let outgoing = ctx.outgoing_neighbors(self.id);

        if (outgoing.len() as u64) < config.node_links_outgoing {
            if let Some(target) = ctx.pick_random_node(&mut self.rng) {
                let eligible = target != self.id
                    && ctx.find_link(self.id, target).is_none()
                    && (ctx.incoming_neighbors(target).len() as u64)
                        < config.node_links_incoming_max;
                if eligible {
                    let link = self.open_link(ctx, target);
                    link.lock()
                        .send_message(ctx.current_tick(), NetworkMessage::Hello, events);
                }
            }
        }

        while let Some(inbound) = self.pending.pop_front() {
            match inbound {
                Inbound::Delivered {
                    message: NetworkMessage::HelloReply { top },
                    ..
                } => {
                    self.begin_sync(top, ctx, events);
                    // whatever is left is handled by the new state
                    return;
                }
                other => self.handle_common(other, ctx, events),
            }
        }
    }

    fn begin_sync(&mut self, reported_top: BlockHeight, ctx: &SimContext, events: &mut dyn EventSink) {
        self.clear_sync_state();

        let top = self.redacted_top.max(reported_top);
        self.redacted_top = top;
        self.redacted_bottom = top.saturating_sub(ctx.config().redacted_window_size);
        self.blocks_to_sync.extend(self.redacted_bottom + 1..=top);

        self.change_state(NodeState::Synchronizing, ctx, events);
    }

    // ========================================================================
    // Synchronizing
    // ========================================================================

    fn update_synchronizing(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        let neighbors = ctx.outgoing_neighbors(self.id);
        if neighbors.is_empty() {
            self.lose_neighbors(ctx, events);
            return;
        }

        while let Some(inbound) = self.pending.pop_front() {
            self.handle_synchronizing(inbound, ctx, events);
        }

        if self.sync_complete() {
            events.log(SimEvent::new(
                ctx.current_tick(),
                EventType::NodeSyncSuccess,
                self.description(),
                "Synchronization completed.",
            ));
            self.change_state(NodeState::Operating, ctx, events);
            return;
        }

        let tick = ctx.current_tick();
        if self.wait_retry_tick <= tick {
            self.request_missing(&neighbors, ctx, events);
            self.wait_retry_tick = tick + ctx.config().request_delay;
        }
    }

    fn handle_synchronizing(&mut self, inbound: Inbound, ctx: &SimContext, events: &mut dyn EventSink) {
        match inbound {
            Inbound::Delivered {
                message: NetworkMessage::HelloReply { top },
                ..
            } => {
                self.sync_height(top, None, ctx, events);
            }
            Inbound::Delivered {
                message: NetworkMessage::BlockData {
                    height, signers, ..
                },
                ..
            } => {
                self.sync_height(height, Some(signers), ctx, events);
            }
            Inbound::Delivered {
                message:
                    NetworkMessage::TransactionData {
                        height,
                        transactions,
                    },
                ..
            } => {
                if self.in_window(height)
                    && self
                        .transactions_per_block
                        .insert(height, transactions)
                        .is_none()
                {
                    events.log(SimEvent::new(
                        ctx.current_tick(),
                        EventType::NodeProcessingEvent,
                        self.description(),
                        format!(
                            "Synchronized transactions for block {}: {} TXs",
                            height, transactions
                        ),
                    ));
                }
            }
            other => self.handle_common(other, ctx, events),
        }
    }

    fn sync_height(
        &mut self,
        height: BlockHeight,
        signers: Option<SignerSet>,
        ctx: &SimContext,
        events: &mut dyn EventSink,
    ) {
        if height > self.redacted_top {
            events.log(SimEvent::new(
                ctx.current_tick(),
                EventType::NodeProcessingEvent,
                self.description(),
                format!("Sync target changes: {} -> {}", self.redacted_top, height),
            ));
            self.raise_top(height, ctx);
        }

        if self.blocks_to_sync.remove(&height) {
            if let Some(signers) = signers {
                self.signatures_per_block.insert(height, signers);
            }
            events.log(SimEvent::new(
                ctx.current_tick(),
                EventType::NodeProcessingEvent,
                self.description(),
                format!("Synchronized block {}", height),
            ));
        }
    }

    fn sync_complete(&self) -> bool {
        self.blocks_to_sync.is_empty()
            && (self.redacted_bottom + 1..=self.redacted_top)
                .all(|h| self.transactions_per_block.contains_key(&h))
    }

    /// One retry round: up to `max_requests` block requests for missing
    /// heights and as many transaction requests for synced blocks.
    fn request_missing(&mut self, neighbors: &[NodeId], ctx: &SimContext, events: &mut dyn EventSink) {
        let max = ctx.config().max_requests as usize;

        let missing_blocks: Vec<BlockHeight> = self.blocks_to_sync.iter().take(max).copied().collect();
        for height in missing_blocks {
            self.request_from_random(neighbors, NetworkMessage::GetBlock { height }, ctx, events);
        }

        let missing_transactions: Vec<BlockHeight> = (self.redacted_bottom + 1..=self.redacted_top)
            .filter(|h| {
                !self.blocks_to_sync.contains(h) && !self.transactions_per_block.contains_key(h)
            })
            .take(max)
            .collect();
        for height in missing_transactions {
            self.request_from_random(
                neighbors,
                NetworkMessage::GetTransactions { height },
                ctx,
                events,
            );
        }
    }

    fn request_from_random(
        &mut self,
        neighbors: &[NodeId],
        message: NetworkMessage,
        ctx: &SimContext,
        events: &mut dyn EventSink,
    ) {
        let target = match neighbors.choose(&mut self.rng) {
            Some(target) => *target,
            None => return,
        };
        match ctx.get_link_between(self.id, target) {
            Ok(link) => {
                link.lock().send_message(ctx.current_tick(), message, events);
            }
            Err(e) => warn!("node {} cannot request from {}: {}", self.id, target, e),
        }
    }

    // ========================================================================
    // Operating
    // ========================================================================

    fn update_operating(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        if ctx.outgoing_neighbors(self.id).is_empty() {
            self.lose_neighbors(ctx, events);
            return;
        }

        let tick = ctx.current_tick();
        let mut gossip = false;

        while let Some(inbound) = self.pending.pop_front() {
            match inbound {
                Inbound::Delivered {
                    message:
                        NetworkMessage::BlockData {
                            height,
                            transactions,
                            signers,
                        },
                    ..
                } => {
                    if height > self.redacted_top + 1 {
                        self.fall_behind(height, signers, ctx, events);
                        return;
                    }
                    if self.working.is_none()
                        && height == self.redacted_top + 1
                        && !self.transactions_per_block.contains_key(&height)
                    {
                        events.log(SimEvent::new(
                            tick,
                            EventType::NodeProcessingEvent,
                            self.description(),
                            format!("Received new block {}. Starting verification.", height),
                        ));
                        self.working = Some(WorkingBlock {
                            height,
                            transactions,
                            signers: SignerSet::new(),
                            processing_until: tick
                                + processing_ticks(ctx, self.processing_speed),
                            signed: false,
                        });
                    }
                    gossip |= self.merge_signers(height, signers, tick, ctx);
                }
                Inbound::Proposal { transactions, .. } => {
                    gossip |= self.propose(transactions, ctx, events);
                }
                other => self.handle_common(other, ctx, events),
            }
        }

        let mut accept = false;
        if let Some(working) = self.working.as_mut() {
            if working.processing_until <= tick {
                if !working.signed {
                    working.signed = true;
                    working.signers.insert(self.id);
                    gossip = true;
                }
                accept = working.signers.len() as u64 >= ctx.consensus_threshold();
            }
        }

        if gossip {
            if let Some(announcement) = self.working.as_ref().map(WorkingBlock::announcement) {
                self.broadcast(announcement, ctx, events);
            }
        }

        if accept {
            if let Some(working) = &self.working {
                events.log(SimEvent::new(
                    tick,
                    EventType::NodeProcessingEvent,
                    self.description(),
                    format!(
                        "Processing for block {} finished. Transactions: {}. Signatures: {}",
                        working.height,
                        working.transactions,
                        working.signers.len()
                    ),
                ));
            }
            self.append_block(ctx, events);
        }
    }

    /// Unions signers into the working block; every growth restarts the
    /// verification timer scaled by this node's speed.
    fn merge_signers(
        &mut self,
        height: BlockHeight,
        signers: SignerSet,
        tick: Tick,
        ctx: &SimContext,
    ) -> bool {
        let speed = self.processing_speed;
        let working = match self.working.as_mut() {
            Some(w) if w.height == height => w,
            _ => return false,
        };

        let before = working.signers.len();
        working.signers.extend(signers);
        if working.signers.len() == before {
            return false;
        }

        working.processing_until = tick + processing_ticks(ctx, speed);
        true
    }

    fn propose(&mut self, transactions: u64, ctx: &SimContext, events: &mut dyn EventSink) -> bool {
        let tick = ctx.current_tick();
        if self.working.is_some() {
            events.log(SimEvent::new(
                tick,
                EventType::NodeProcessingEvent,
                self.description(),
                format!(
                    "Block proposal with {} TXs dropped, already verifying block {}",
                    transactions,
                    self.working_on_block()
                ),
            ));
            return false;
        }

        let height = self.redacted_top + 1;
        let mut signers = SignerSet::new();
        signers.insert(self.id);

        events.log(SimEvent::new(
            tick,
            EventType::NodeProcessingEvent,
            self.description(),
            format!("Proposing block {} with {} TXs", height, transactions),
        ));
        self.working = Some(WorkingBlock {
            height,
            transactions,
            signers,
            processing_until: tick + processing_ticks(ctx, self.processing_speed),
            signed: true,
        });
        true
    }

    fn fall_behind(
        &mut self,
        height: BlockHeight,
        signers: SignerSet,
        ctx: &SimContext,
        events: &mut dyn EventSink,
    ) {
        events.log(SimEvent::new(
            ctx.current_tick(),
            EventType::NodeProcessingEvent,
            self.description(),
            format!(
                "Fell behind: at block {}, neighbor announced {}",
                self.redacted_top, height
            ),
        ));

        self.working = None;
        self.wait_retry_tick = 0;
        self.raise_top(height, ctx);
        if self.blocks_to_sync.remove(&height) {
            self.signatures_per_block.insert(height, signers);
        }
        self.change_state(NodeState::Synchronizing, ctx, events);
    }

    fn append_block(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        let working = match self.working.take() {
            Some(w) => w,
            None => return,
        };

        self.redacted_top = working.height;
        self.transactions_per_block
            .insert(working.height, working.transactions);
        self.signatures_per_block
            .insert(working.height, working.signers);
        self.prune(ctx);

        events.log(SimEvent::new(
            ctx.current_tick(),
            EventType::NodeAcceptedBlock,
            self.description(),
            format!("Accepted block {}", working.height),
        ));
    }

    fn broadcast(&mut self, message: NetworkMessage, ctx: &SimContext, events: &mut dyn EventSink) {
        for neighbor in ctx.outgoing_neighbors(self.id) {
            match ctx.get_link_between(self.id, neighbor) {
                Ok(link) => {
                    link.lock()
                        .send_message(ctx.current_tick(), message.clone(), events);
                }
                Err(e) => warn!("node {} cannot gossip to {}: {}", self.id, neighbor, e),
            }
        }
    }

    // ========================================================================
    // Shared handling
    // ========================================================================

    /// Messages every state reacts to the same way.
    fn handle_common(&mut self, inbound: Inbound, ctx: &SimContext, events: &mut dyn EventSink) {
        match inbound {
            Inbound::Delivered { from, message, .. } => {
                // a connecting node has nothing to serve except introductions
                if message == NetworkMessage::Hello
                    || (is_request(&message) && self.state != NodeState::Connecting)
                {
                    self.serve(from, message, ctx, events);
                }
            }
            Inbound::Proposal { transactions, .. } => {
                events.log(SimEvent::new(
                    ctx.current_tick(),
                    EventType::NodeProcessingEvent,
                    self.description(),
                    format!(
                        "Block proposal with {} TXs dropped, node is {}",
                        transactions, self.state
                    ),
                ));
            }
        }
    }

    /// Answers a request from `from` with whatever this node holds.
    fn serve(&mut self, from: NodeId, request: NetworkMessage, ctx: &SimContext, events: &mut dyn EventSink) {
        let reply = match request {
            NetworkMessage::Hello => Some(NetworkMessage::HelloReply {
                top: self.redacted_top,
            }),
            NetworkMessage::GetBlock { height } => {
                self.transactions_per_block
                    .get(&height)
                    .map(|transactions| NetworkMessage::BlockData {
                        height,
                        transactions: *transactions,
                        signers: self
                            .signatures_per_block
                            .get(&height)
                            .cloned()
                            .unwrap_or_default(),
                    })
            }
            NetworkMessage::GetTransactions { height } => self
                .transactions_per_block
                .get(&height)
                .map(|transactions| NetworkMessage::TransactionData {
                    height,
                    transactions: *transactions,
                }),
            _ => None,
        };

        if let Some(reply) = reply {
            self.reply(from, reply, ctx, events);
        }
    }

    fn reply(&mut self, to: NodeId, message: NetworkMessage, ctx: &SimContext, events: &mut dyn EventSink) {
        let link = match ctx.find_link(self.id, to) {
            Some(link) => link,
            None => self.open_link(ctx, to),
        };
        link.lock().send_message(ctx.current_tick(), message, events);
    }

    /// Creates a link to `to` with a stream forked from this node and stages it.
    fn open_link(&mut self, ctx: &SimContext, to: NodeId) -> SharedLink {
        let link = SimLink::new(ctx.config(), self.id, to, LinkParams::default(), &mut self.rng)
            .into_shared();
        ctx.add_link(link.clone());
        link
    }

    fn lose_neighbors(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        events.log(SimEvent::new(
            ctx.current_tick(),
            EventType::NodeSyncFailed,
            self.description(),
            "All neighbors lost.",
        ));
        self.clear_sync_state();
        self.pending.clear();
        self.change_state(NodeState::Connecting, ctx, events);
    }

    fn clear_sync_state(&mut self) {
        self.transactions_per_block.clear();
        self.signatures_per_block.clear();
        self.blocks_to_sync.clear();
        self.wait_retry_tick = 0;
        self.working = None;
    }

    /// Extends the missing set up to `height` and raises the top.
    fn raise_top(&mut self, height: BlockHeight, ctx: &SimContext) {
        if height <= self.redacted_top {
            return;
        }
        // heights that would be pruned right away are never queued
        let mut first = self.redacted_top + 1;
        if !self.full_history {
            let window = ctx.config().redacted_window_size;
            first = first.max(height.saturating_sub(window) + 1);
        }
        self.blocks_to_sync.extend(first..=height);
        self.redacted_top = height;
        self.prune(ctx);
    }

    /// Slides the bottom of the window up for nodes without full history.
    fn prune(&mut self, ctx: &SimContext) {
        if self.full_history {
            return;
        }
        let window = ctx.config().redacted_window_size;
        if self.redacted_top - self.redacted_bottom <= window {
            return;
        }

        self.redacted_bottom = self.redacted_top - window;
        let keep_from = self.redacted_bottom + 1;
        self.transactions_per_block = self.transactions_per_block.split_off(&keep_from);
        self.signatures_per_block = self.signatures_per_block.split_off(&keep_from);
        self.blocks_to_sync = self.blocks_to_sync.split_off(&keep_from);
    }

    fn in_window(&self, height: BlockHeight) -> bool {
        height > self.redacted_bottom && height <= self.redacted_top
    }

    fn change_state(&mut self, new_state: NodeState, ctx: &SimContext, events: &mut dyn EventSink) {
        events.log(SimEvent::new(
            ctx.current_tick(),
            EventType::NodeStateChange,
            self.description(),
            format!("Changing state: {} -> {}", self.state, new_state),
        ));
        self.state = new_state;
    }
}

/// Verification time for one block at the given speed multiplier.
fn processing_ticks(ctx: &SimContext, speed: f64) -> Tick {
    (ctx.config().block_processing_ticks() as f64 * speed) as Tick
}

fn is_request(message: &NetworkMessage) -> bool {
    matches!(
        message,
        NetworkMessage::Hello | NetworkMessage::GetBlock { .. } | NetworkMessage::GetTransactions { .. }
    )
}

// ============================================================================
// Registry Handle
// ============================================================================

/// Registry entry for a node. Links deliver into `inbox` during the link
/// phase; the node itself is only locked by the worker that owns its slice.
pub struct NodeHandle {
    id: NodeId,
    node: Mutex<SimNode>,
    inbox: Mutex<Vec<Inbound>>,
}

impl NodeHandle {
    pub fn new(node: SimNode) -> Self {
        Self {
            id: node.id(),
            node: Mutex::new(node),
            inbox: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, SimNode> {
        self.node.lock()
    }

    pub fn deliver(&self, inbound: Inbound) {
        self.inbox.lock().push(inbound);
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Node phase: hands the inbox over in a stable order, then runs the state machine.
    pub fn update(&self, ctx: &SimContext, events: &mut dyn EventSink) {
        let mut node = self.node.lock();
        let mut arrived = std::mem::take(&mut *self.inbox.lock());
        arrived.sort_by_key(Inbound::order_key);
        node.receive(arrived);
        node.update(ctx, events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_config::SimConfig;
    use std::sync::Arc;

    fn config() -> SimConfig {
        SimConfig {
            redacted_window_size: 40,
            block_processing_time_ms: 10,
            consensus_fraction: 1.0,
            link_reliability_min: 1.0,
            link_reliability_max: 1.0,
            link_latency_ms_min: 1.0,
            link_latency_ms_max: 1.0,
            ..SimConfig::default()
        }
    }

    /// Two nodes `a` and `b` with links both ways.
    fn pair(config: SimConfig) -> (Arc<SimContext>, NodeId, NodeId) {
        let ctx = SimContext::new(config, 21);
        let a = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        let b = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        ctx.upkeep();
        connect(&ctx, a, b);
        connect(&ctx, b, a);
        ctx.upkeep();
        (ctx, a, b)
    }

    fn connect(ctx: &SimContext, from: NodeId, to: NodeId) {
        let link = ctx.rng().with(|rng| {
            SimLink::new(ctx.config(), from, to, LinkParams::fixed(1, 1.0), rng)
        });
        ctx.add_link(link.into_shared());
    }

    fn delivered(from: NodeId, seq: u64, message: NetworkMessage) -> Inbound {
        Inbound::Delivered {
            from,
            link: 1,
            seq,
            message,
        }
    }

    fn update(ctx: &SimContext, id: NodeId, events: &mut Vec<SimEvent>) {
        ctx.get_node(id).unwrap().update(ctx, events);
    }

    #[test]
    fn test_hello_reply_opens_sync_window() {
        let (ctx, a, b) = pair(config());
        let handle = ctx.get_node(a).unwrap();
        handle.lock().redacted_top = 100;

        handle.deliver(delivered(b, 0, NetworkMessage::HelloReply { top: 100 }));
        let mut events = Vec::new();
        update(&ctx, a, &mut events);

        let node = handle.lock();
        assert_eq!(node.state(), NodeState::Synchronizing);
        assert_eq!(node.redacted_bottom(), 60);
        assert_eq!(node.redacted_top(), 100);
        assert_eq!(node.blocks_to_sync().len(), 40);
        assert_eq!(node.blocks_to_sync().first(), Some(&61));
        assert_eq!(node.blocks_to_sync().last(), Some(&100));
    }

    #[test]
    fn test_sync_requests_are_throttled() {
        let (ctx, a, b) = pair(config());
        let handle = ctx.get_node(a).unwrap();
        handle.deliver(delivered(b, 0, NetworkMessage::HelloReply { top: 30 }));
        let mut events = Vec::new();
        update(&ctx, a, &mut events);

        let link = ctx.get_link_between(a, b).unwrap();
        update(&ctx, a, &mut events);
        // max_requests GetBlock, no GetTransactions while blocks are missing
        assert_eq!(link.lock().in_flight(), 10);

        ctx.advance_tick();
        update(&ctx, a, &mut events);
        assert_eq!(link.lock().in_flight(), 10);
    }

    #[test]
    fn test_sync_completes_into_operating() {
        let (ctx, a, b) = pair(config());
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        handle.deliver(delivered(b, 0, NetworkMessage::HelloReply { top: 3 }));
        update(&ctx, a, &mut events);

        let mut seq = 1;
        for height in 1..=3 {
            handle.deliver(delivered(
                b,
                seq,
                NetworkMessage::BlockData {
                    height,
                    transactions: height * 10,
                    signers: SignerSet::new(),
                },
            ));
            handle.deliver(delivered(
                b,
                seq + 1,
                NetworkMessage::TransactionData {
                    height,
                    transactions: height * 10,
                },
            ));
            seq += 2;
        }
        update(&ctx, a, &mut events);

        let node = handle.lock();
        assert_eq!(node.state(), NodeState::Operating);
        assert!(node.blocks_to_sync().is_empty());
        assert_eq!(node.total_transactions(), 60);
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::NodeSyncSuccess));
    }

    #[test]
    fn test_sync_target_extends_window() {
        let (ctx, a, b) = pair(config());
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        handle.deliver(delivered(b, 0, NetworkMessage::HelloReply { top: 10 }));
        update(&ctx, a, &mut events);
        handle.deliver(delivered(b, 1, NetworkMessage::HelloReply { top: 15 }));
        update(&ctx, a, &mut events);

        let node = handle.lock();
        assert_eq!(node.redacted_top(), 15);
        // 15 itself was announced, so only 1..=14 are missing
        assert_eq!(node.blocks_to_sync().len(), 14);
        assert!(node
            .blocks_to_sync()
            .iter()
            .all(|h| *h > node.redacted_bottom() && *h <= node.redacted_top()));
    }

    #[test]
    fn test_far_announcement_queues_only_the_window() {
        let (ctx, a, b) = pair(config());
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        handle.deliver(delivered(b, 0, NetworkMessage::HelloReply { top: 10 }));
        update(&ctx, a, &mut events);
        handle.deliver(delivered(b, 1, NetworkMessage::HelloReply { top: 5_000_000 }));
        update(&ctx, a, &mut events);

        let node = handle.lock();
        assert_eq!(node.redacted_top(), 5_000_000);
        assert_eq!(node.redacted_bottom(), 5_000_000 - 40);
        // the announced top itself is not missing
        assert_eq!(node.blocks_to_sync().len(), 39);
        assert_eq!(node.blocks_to_sync().first(), Some(&(5_000_000 - 39)));
        assert!(node
            .blocks_to_sync()
            .iter()
            .all(|h| *h > node.redacted_bottom() && *h <= node.redacted_top()));
    }

    #[test]
    fn test_full_history_node_queues_whole_gap() {
        let ctx = SimContext::new(config(), 5);
        let id = ctx.add_node(SimNode::create(&ctx, true, Some(1.0)));
        ctx.upkeep();

        let handle = ctx.get_node(id).unwrap();
        let mut node = handle.lock();
        node.raise_top(100, &ctx);
        assert_eq!(node.redacted_bottom(), 0);
        assert_eq!(node.blocks_to_sync().len(), 100);
    }

    #[test]
    fn test_lost_neighbors_revert_to_connecting() {
        let (ctx, a, b) = pair(config());
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        handle.deliver(delivered(b, 0, NetworkMessage::HelloReply { top: 5 }));
        update(&ctx, a, &mut events);
        handle.deliver(delivered(
            b,
            1,
            NetworkMessage::TransactionData {
                height: 2,
                transactions: 4,
            },
        ));
        update(&ctx, a, &mut events);
        assert!(!handle.lock().transactions_per_block().is_empty());

        let link = ctx.get_link_between(a, b).unwrap();
        let link_id = link.lock().id();
        ctx.drop_link(link_id);
        ctx.upkeep();

        update(&ctx, a, &mut events);
        let node = handle.lock();
        assert_eq!(node.state(), NodeState::Connecting);
        assert!(node.blocks_to_sync().is_empty());
        assert!(node.transactions_per_block().is_empty());
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::NodeSyncFailed));
    }

    fn operating_at(ctx: &SimContext, id: NodeId, top: BlockHeight) {
        let handle = ctx.get_node(id).unwrap();
        let mut node = handle.lock();
        node.state = NodeState::Operating;
        node.redacted_top = top;
        node.redacted_bottom = top.saturating_sub(ctx.config().redacted_window_size);
        for h in node.redacted_bottom + 1..=top {
            node.transactions_per_block.insert(h, 1);
        }
    }

    #[test]
    fn test_block_accepted_only_after_processing() {
        // three nodes, threshold = all three
        let (ctx, a, b) = pair(config());
        let c = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        ctx.upkeep();
        operating_at(&ctx, a, 100);

        let handle = ctx.get_node(a).unwrap();
        let mut signers = SignerSet::new();
        signers.insert(b);
        signers.insert(c);
        handle.deliver(delivered(
            b,
            0,
            NetworkMessage::BlockData {
                height: 101,
                transactions: 7,
                signers,
            },
        ));

        let mut events = Vec::new();
        update(&ctx, a, &mut events);
        {
            let node = handle.lock();
            assert_eq!(node.working_on_block(), 101);
            assert_eq!(node.redacted_top(), 100);
            // processing = 10 ticks at speed 1.0
            assert_eq!(node.working_block().unwrap().processing_until, 10);
        }

        for _ in 0..9 {
            ctx.advance_tick();
            update(&ctx, a, &mut events);
            assert_eq!(handle.lock().redacted_top(), 100);
        }

        ctx.advance_tick();
        update(&ctx, a, &mut events);
        ctx.advance_tick();
        update(&ctx, a, &mut events);

        let node = handle.lock();
        assert_eq!(node.redacted_top(), 101);
        assert_eq!(node.working_on_block(), 0);
        assert_eq!(node.transactions_per_block().get(&101), Some(&7));
        assert_eq!(node.signatures_per_block().get(&101).map(|s| s.len()), Some(3));
        let accepted = events
            .iter()
            .filter(|e| e.event_type == EventType::NodeAcceptedBlock)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_unsigned_block_waits_for_processing() {
        let (ctx, a, b) = pair(config());
        operating_at(&ctx, a, 5);
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        handle.deliver(delivered(
            b,
            0,
            NetworkMessage::BlockData {
                height: 6,
                transactions: 4,
                signers: SignerSet::new(),
            },
        ));
        update(&ctx, a, &mut events);
        {
            let node = handle.lock();
            let working = node.working_block().unwrap();
            assert_eq!(working.processing_until, 10);
            assert!(!working.signed);
            assert!(working.signers.is_empty());
        }
        let link = ctx.get_link_between(a, b).unwrap();
        assert_eq!(link.lock().in_flight(), 0);

        for _ in 0..10 {
            ctx.advance_tick();
        }
        update(&ctx, a, &mut events);
        let node = handle.lock();
        let working = node.working_block().unwrap();
        assert!(working.signed);
        assert!(working.signers.contains(&a));
    }

    #[test]
    fn test_new_signers_restart_processing() {
        let (ctx, a, b) = pair(config());
        operating_at(&ctx, a, 5);
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        let mut first = SignerSet::new();
        first.insert(b);
        handle.deliver(delivered(
            b,
            0,
            NetworkMessage::BlockData {
                height: 6,
                transactions: 2,
                signers: first.clone(),
            },
        ));
        update(&ctx, a, &mut events);
        assert_eq!(handle.lock().working_block().unwrap().processing_until, 10);

        for _ in 0..4 {
            ctx.advance_tick();
        }
        // same signer again: no growth, timer untouched
        handle.deliver(delivered(
            b,
            1,
            NetworkMessage::BlockData {
                height: 6,
                transactions: 2,
                signers: first,
            },
        ));
        update(&ctx, a, &mut events);
        assert_eq!(handle.lock().working_block().unwrap().processing_until, 10);

        let mut second = SignerSet::new();
        second.insert(999);
        handle.deliver(delivered(
            b,
            2,
            NetworkMessage::BlockData {
                height: 6,
                transactions: 2,
                signers: second,
            },
        ));
        update(&ctx, a, &mut events);
        assert_eq!(handle.lock().working_block().unwrap().processing_until, 14);
    }

    #[test]
    fn test_serves_requests_over_reverse_link() {
        let (ctx, a, b) = pair(config());
        operating_at(&ctx, a, 8);
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        handle.deliver(delivered(b, 0, NetworkMessage::GetBlock { height: 8 }));
        handle.deliver(delivered(b, 1, NetworkMessage::GetTransactions { height: 7 }));
        // not held: no answer
        handle.deliver(delivered(b, 2, NetworkMessage::GetBlock { height: 50 }));
        update(&ctx, a, &mut events);

        let link = ctx.get_link_between(a, b).unwrap();
        assert_eq!(link.lock().in_flight(), 2);
    }

    #[test]
    fn test_connecting_node_opens_link_and_says_hello() {
        let ctx = SimContext::new(config(), 4);
        let a = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        let b = ctx.add_node(SimNode::create(&ctx, false, Some(1.0)));
        ctx.upkeep();

        let mut events = Vec::new();
        // with two nodes a random pick hits b within a few tries
        for _ in 0..32 {
            update(&ctx, a, &mut events);
            if ctx.find_link(a, b).is_some() {
                break;
            }
        }
        let link = ctx.find_link(a, b).expect("link staged");
        assert_eq!(link.lock().in_flight(), 1);
        // staged only: not in the live registry yet
        assert!(ctx.get_link_between(a, b).is_err());

        ctx.upkeep();
        assert!(ctx.get_link_between(a, b).is_ok());
        assert_eq!(ctx.outgoing_neighbors(a), vec![b]);
    }

    #[test]
    fn test_pruning_slides_window() {
        let (ctx, a, b) = pair(config());
        operating_at(&ctx, a, 40);
        let handle = ctx.get_node(a).unwrap();
        let mut events = Vec::new();

        let mut signers = SignerSet::new();
        signers.insert(b);
        signers.insert(12345);
        handle.deliver(delivered(
            b,
            0,
            NetworkMessage::BlockData {
                height: 41,
                transactions: 3,
                signers,
            },
        ));
        for _ in 0..12 {
            update(&ctx, a, &mut events);
            ctx.advance_tick();
        }

        let node = handle.lock();
        assert_eq!(node.redacted_top(), 41);
        assert_eq!(node.redacted_bottom(), 1);
        assert!(!node.transactions_per_block().contains_key(&1));
        assert_eq!(node.transactions_per_block().len(), 40);
    }
}
