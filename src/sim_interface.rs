use std::collections::BTreeSet;
use std::fmt;

// all ids share one process-wide counter, so they are the same numeric type
pub type SimId = u64;
pub type NodeId = SimId;
pub type LinkId = SimId;

/// Discrete unit of simulated time.
pub type Tick = u64;
pub type BlockHeight = u64;

/// Signer ids are kept ordered so gossip and log output are reproducible.
pub type SignerSet = BTreeSet<NodeId>;

// ============================================================================
// Protocol Messages
// ============================================================================

/// Message exchanged over a link. Each kind carries exactly the payload it
/// needs, so a mismatched payload cannot be constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkMessage {
    Hello,
    HelloReply {
        top: BlockHeight,
    },
    GetBlock {
        height: BlockHeight,
    },
    BlockData {
        height: BlockHeight,
        transactions: u64,
        signers: SignerSet,
    },
    GetTransactions {
        height: BlockHeight,
    },
    TransactionData {
        height: BlockHeight,
        transactions: u64,
    },
}

impl NetworkMessage {
    /// Height the message refers to, if any.
    pub fn height(&self) -> Option<BlockHeight> {
        match self {
            NetworkMessage::Hello => None,
            NetworkMessage::HelloReply { top } => Some(*top),
            NetworkMessage::GetBlock { height }
            | NetworkMessage::BlockData { height, .. }
            | NetworkMessage::GetTransactions { height }
            | NetworkMessage::TransactionData { height, .. } => Some(*height),
        }
    }
}

impl fmt::Display for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMessage::Hello => write!(f, "Hello"),
            NetworkMessage::HelloReply { top } => write!(f, "HelloReply(top {})", top),
            NetworkMessage::GetBlock { height } => write!(f, "GetBlock({})", height),
            NetworkMessage::BlockData {
                height,
                transactions,
                signers,
            } => write!(
                f,
                "BlockData({}, {} TXs, {} signers)",
                height,
                transactions,
                signers.len()
            ),
            NetworkMessage::GetTransactions { height } => write!(f, "GetTransactions({})", height),
            NetworkMessage::TransactionData {
                height,
                transactions,
            } => write!(f, "TransactionData({}, {} TXs)", height, transactions),
        }
    }
}

/// What a node finds in its inbound queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Handed over by a link during the link phase.
    Delivered {
        from: NodeId,
        link: LinkId,
        seq: u64,
        message: NetworkMessage,
    },
    /// Staged by the driver, handed over during upkeep.
    Proposal { seq: u64, transactions: u64 },
}

impl Inbound {
    /// Links deliver into the same inbox from different workers, so arrival
    /// order is not stable. This key is.
    pub fn order_key(&self) -> (LinkId, u64) {
        match self {
            Inbound::Proposal { seq, .. } => (0, *seq),
            Inbound::Delivered { link, seq, .. } => (*link, *seq),
        }
    }
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Categories of simulation events
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    NetLinkConnected,
    NetLinkDisconnected,
    NetLinkRejected,
    NodeAdded,
    NodeRemoved,
    NetworkMessageLost,
    NetworkMessageTransmitted,
    NodeStateChange,
    NodeSyncSuccess,
    NodeSyncFailed,
    NodeProcessingEvent,
    NodeAcceptedBlock,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An immutable fact about something that happened. Consumed only by the log.
#[derive(Clone, Debug, PartialEq)]
pub struct SimEvent {
    pub tick: Tick,
    pub event_type: EventType,
    pub object_name: String,
    pub message: String,
}

impl SimEvent {
    pub fn new(
        tick: Tick,
        event_type: EventType,
        object_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tick,
            event_type,
            object_name: object_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SimEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}| {} - ({}): {}",
            self.tick, self.event_type, self.object_name, self.message
        )
    }
}

/// Trait for consuming events produced while updating nodes and links
pub trait EventSink {
    fn log(&mut self, event: SimEvent);
}

/// Collects events in memory; workers hand these batches to the log in slice order.
impl EventSink for Vec<SimEvent> {
    fn log(&mut self, event: SimEvent) {
        self.push(event);
    }
}
