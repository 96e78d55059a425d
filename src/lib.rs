//! # ledger-sim - Discrete-event simulator for a P2P ledger network
//!
//! Simulates a peer-to-peer ledger network in discrete ticks. Nodes join,
//! open directed links to random peers, synchronize the retained window of
//! the chain and then verify, sign and accept new blocks gossiped through
//! the network. Links add latency and lose messages at random.
//!
//! ## Core Components
//!
//! - **SimController**: engine lifecycle, tick scheduling and the public API
//! - **SimContext**: registry of live nodes and links plus staged changes
//! - **SimNode**: the protocol state machine (Connecting, Synchronizing, Operating)
//! - **SimLink**: directed, lossy, delayed message transport
//! - **EventLog**: asynchronous text log of everything that happens
//!
//! ## Tick Structure
//!
//! Each tick runs three phases: all links deliver due messages, all nodes
//! process their inbox, then a single-threaded upkeep applies topology
//! changes requested during the tick. Links and nodes are updated by a pool
//! of workers; a fixed seed yields the same log for any worker count.
//!
//! ```no_run
//! use ledger_sim::{SimConfig, SimController};
//!
//! let controller = SimController::new(SimConfig::default()).unwrap();
//! controller.set_seed(7);
//! controller.set_output_file("sim.log").unwrap();
//! for _ in 0..controller.config().nodes {
//!     controller.new_node(false, None);
//! }
//!
//! controller.start(4).unwrap();
//! controller.run_ticks(5000).unwrap();
//! controller.stop();
//! controller.write_network_file("network.txt").unwrap();
//! ```

pub mod sim_config;
pub mod sim_context;
pub mod sim_controller;
pub mod sim_dump;
pub mod sim_error;
pub mod sim_event_log;
pub mod sim_interface;
pub mod sim_link;
pub mod sim_node;
pub mod sim_pool;
pub mod sim_rng;
pub mod sim_scenario;

pub use sim_config::SimConfig;
pub use sim_controller::{EnginePhase, SimController};
pub use sim_error::SimError;
pub use sim_interface::{
    BlockHeight, EventSink, EventType, Inbound, LinkId, NetworkMessage, NodeId, SimEvent, Tick,
};
pub use sim_link::{LinkParams, SimLink};
pub use sim_node::{NodeState, SimNode};
pub use sim_scenario::{ScenarioFile, ScenarioRunner};
