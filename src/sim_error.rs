use thiserror::Error;

use crate::sim_interface::{LinkId, NodeId};

/// Usage and configuration errors. Simulated failures (loss, disconnection,
/// neighbor loss) are events, never errors.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Simulation is already running")]
    AlreadyRunning,

    #[error("Operation requires the simulation to be stopped")]
    NotStopped,

    #[error("Simulation is not running")]
    NotRunning,

    #[error("Worker count must be at least 1")]
    InvalidWorkerCount,

    #[error("Node {0} does not exist")]
    NodeNotFound(NodeId),

    #[error("Link {0} does not exist")]
    LinkNotFound(LinkId),

    #[error("No link from {from} to {to}")]
    NoLinkBetween { from: NodeId, to: NodeId },

    #[error("Network has no nodes")]
    EmptyNetwork,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A simulation worker panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
