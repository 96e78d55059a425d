use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;

use crate::sim_config::SimConfig;
use crate::sim_context::SimContext;
use crate::sim_interface::{
    EventSink, EventType, Inbound, LinkId, NetworkMessage, NodeId, SimEvent, Tick,
};
use crate::sim_rng::{fork_from, uniform_in};

pub type SharedLink = Arc<Mutex<SimLink>>;

/// Explicit link parameters; `None` draws from the configured range.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LinkParams {
    pub reliability: Option<f64>,
    pub latency_ticks: Option<Tick>,
}

impl LinkParams {
    pub fn fixed(latency_ticks: Tick, reliability: f64) -> Self {
        Self {
            reliability: Some(reliability),
            latency_ticks: Some(latency_ticks),
        }
    }
}

#[derive(Clone, Debug)]
struct InFlight {
    seq: u64,
    arrives_on_tick: Tick,
    message: NetworkMessage,
}

/// One directed connection. Bidirectional traffic needs a second link.
///
/// Latency is fixed for the lifetime of the link, so enqueue order is also
/// arrival order and delivery only ever scans a prefix of the queue.
pub struct SimLink {
    // 0 until the link is admitted during upkeep
    id: LinkId,
    from: NodeId,
    to: NodeId,
    latency_ticks: Tick,
    reliability: f64,
    tick_seconds: f64,
    in_flight: VecDeque<InFlight>,
    next_seq: u64,
    disconnected: bool,
    rng: StdRng,
}

impl SimLink {
    pub fn new<R: Rng + ?Sized>(
        config: &SimConfig,
        from: NodeId,
        to: NodeId,
        params: LinkParams,
        rng: &mut R,
    ) -> Self {
        let reliability = params
            .reliability
            .unwrap_or_else(|| {
                uniform_in(
                    rng,
                    config.link_reliability_min,
                    config.link_reliability_max,
                )
            })
            .clamp(0.0, 1.0);

        let latency_ticks = params
            .latency_ticks
            .unwrap_or_else(|| {
                let latency_ms =
                    uniform_in(rng, config.link_latency_ms_min, config.link_latency_ms_max);
                config.ms_to_ticks(latency_ms)
            })
            // a message never arrives in the tick it was sent
            .max(1);

        Self {
            id: 0,
            from,
            to,
            latency_ticks,
            reliability,
            tick_seconds: config.tick_seconds,
            in_flight: VecDeque::new(),
            next_seq: 0,
            disconnected: false,
            rng: fork_from(rng),
        }
    }

    pub fn into_shared(self) -> SharedLink {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: LinkId) {
        self.id = id;
    }

    pub fn from(&self) -> NodeId {
        self.from
    }

    pub fn to(&self) -> NodeId {
        self.to
    }

    pub fn latency_ticks(&self) -> Tick {
        self.latency_ticks
    }

    pub fn reliability(&self) -> f64 {
        self.reliability
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn description(&self) -> String {
        format!(
            "link {}: {} -> {}, Latency: {} ({:.4} s), Reliability: {:.4}",
            self.id,
            self.from,
            self.to,
            self.latency_ticks,
            self.latency_ticks as f64 * self.tick_seconds,
            self.reliability
        )
    }

    /// Per-send Bernoulli trial: the message is either lost (and logged) or
    /// queued to arrive `latency_ticks` after `tick`. Returns whether it was queued.
    pub fn send_message(
        &mut self,
        tick: Tick,
        message: NetworkMessage,
        events: &mut dyn EventSink,
    ) -> bool {
        let draw: f64 = self.rng.gen();
        if draw > self.reliability || self.disconnected {
            events.log(SimEvent::new(
                tick,
                EventType::NetworkMessageLost,
                self.description(),
                format!("{} lost ({} -x-> {})", message, self.from, self.to),
            ));
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push_back(InFlight {
            seq,
            arrives_on_tick: tick + self.latency_ticks,
            message,
        });
        true
    }

    /// Closes a link that upkeep refused. Anything already queued on it is
    /// logged as lost.
    pub(crate) fn discard(&mut self, tick: Tick, events: &mut dyn EventSink) {
        self.disconnected = true;
        let description = self.description();
        for InFlight { message, .. } in self.in_flight.drain(..) {
            events.log(SimEvent::new(
                tick,
                EventType::NetworkMessageLost,
                description.clone(),
                format!("{} lost ({} -x-> {})", message, self.from, self.to),
            ));
        }
    }

    /// Link phase: drop the link if an endpoint is gone, otherwise hand every
    /// due message to the destination node.
    pub fn update(&mut self, ctx: &SimContext, events: &mut dyn EventSink) {
        if self.disconnected {
            return;
        }

        let tick = ctx.current_tick();
        let target = match (ctx.node_exists(self.from), ctx.get_node(self.to)) {
            (true, Ok(target)) => target,
            _ => {
                self.disconnected = true;
                self.in_flight.clear();
                ctx.drop_link(self.id);
                return;
            }
        };

        while let Some(next) = self.in_flight.front() {
            if next.arrives_on_tick > tick {
                break;
            }
            let InFlight { seq, message, .. } = match self.in_flight.pop_front() {
                Some(m) => m,
                None => break,
            };

            events.log(SimEvent::new(
                tick,
                EventType::NetworkMessageTransmitted,
                self.description(),
                format!("{} delivered ({} ---> {})", message, self.from, self.to),
            ));
            target.deliver(Inbound::Delivered {
                from: self.from,
                link: self.id,
                seq,
                message,
            });
        }
    }
}
