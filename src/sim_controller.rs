// Simulation engine
//
// The controller owns the shared context, the event log and a master thread.
// The master sleeps until a tick is requested, runs the link phase, the node
// phase and upkeep in that order, then reports the tick as finished.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::sim_config::SimConfig;
use crate::sim_context::SimContext;
use crate::sim_dump;
use crate::sim_error::SimError;
use crate::sim_event_log::EventLog;
use crate::sim_interface::{LinkId, NetworkMessage, NodeId, SimEvent, Tick};
use crate::sim_link::{LinkParams, SharedLink, SimLink};
use crate::sim_node::{NodeHandle, SimNode};
use crate::sim_pool::WorkerPool;
use crate::sim_rng::SimRng;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    Stopped,
    Idle,
    RunningLinks,
    RunningNodes,
    Upkeep,
    Terminating,
}

struct EngineState {
    running: bool,
    tick_requested: bool,
    stop_requested: bool,
    phase: EnginePhase,
}

struct Engine {
    state: Mutex<EngineState>,
    // master waits here for tick and stop requests
    wake: Condvar,
    // callers wait here for ticks to finish
    progress: Condvar,
}

impl Engine {
    fn set_phase(&self, phase: EnginePhase) {
        self.state.lock().phase = phase;
        self.progress.notify_all();
    }
}

pub struct SimController {
    ctx: Arc<SimContext>,
    log: Arc<EventLog>,
    engine: Arc<Engine>,
    master: Mutex<Option<JoinHandle<()>>>,
}

impl SimController {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self {
            ctx: SimContext::with_rng(config, SimRng::from_entropy()),
            log: Arc::new(EventLog::new()?),
            engine: Arc::new(Engine {
                state: Mutex::new(EngineState {
                    running: false,
                    tick_requested: false,
                    stop_requested: false,
                    phase: EnginePhase::Stopped,
                }),
                wake: Condvar::new(),
                progress: Condvar::new(),
            }),
            master: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SimConfig {
        self.ctx.config()
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn next_id(&self) -> u64 {
        self.ctx.next_id()
    }

    /// Restarts the shared random sequence. Streams already handed to nodes
    /// and links are unaffected, so seed before populating the network.
    pub fn set_seed(&self, seed: u64) {
        self.ctx.rng().reseed(seed);
    }

    pub fn set_output_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        self.log.set_output_file(path)
    }

    pub fn set_output(&self, output: Box<dyn Write + Send>) {
        self.log.set_output(output);
    }

    pub fn flush_log(&self) {
        self.log.flush();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn start(&self, workers: usize) -> Result<(), SimError> {
        if workers == 0 {
            return Err(SimError::InvalidWorkerCount);
        }

        let mut master = self.master.lock();
        {
            let mut state = self.engine.state.lock();
            if state.running {
                return Err(SimError::AlreadyRunning);
            }
            state.running = true;
            state.tick_requested = false;
            state.stop_requested = false;
            state.phase = EnginePhase::Idle;
        }

        let pool = match WorkerPool::spawn(workers, Arc::clone(&self.ctx)) {
            Ok(pool) => pool,
            Err(e) => {
                self.mark_stopped();
                return Err(e);
            }
        };

        let ctx = Arc::clone(&self.ctx);
        let log = Arc::clone(&self.log);
        let engine = Arc::clone(&self.engine);
        let spawned = std::thread::Builder::new()
            .name("sim-master".to_string())
            .spawn(move || master_loop(ctx, log, engine, pool));

        match spawned {
            Ok(handle) => {
                *master = Some(handle);
                info!("simulation started with {} workers", workers);
                Ok(())
            }
            Err(e) => {
                self.mark_stopped();
                Err(e.into())
            }
        }
    }

    /// Lets the current tick finish, then tears down the workers. No-op when stopped.
    pub fn stop(&self) {
        let handle = self.master.lock().take();
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };

        {
            let mut state = self.engine.state.lock();
            state.stop_requested = true;
        }
        self.engine.wake.notify_all();

        if handle.join().is_err() {
            error!("simulation master thread panicked");
            self.mark_stopped();
        }
        info!("simulation stopped at tick {}", self.current_tick());
    }

    fn mark_stopped(&self) {
        let mut state = self.engine.state.lock();
        state.running = false;
        state.tick_requested = false;
        state.phase = EnginePhase::Stopped;
        drop(state);
        self.engine.progress.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.engine.state.lock().running
    }

    pub fn phase(&self) -> EnginePhase {
        self.engine.state.lock().phase
    }

    pub fn current_tick(&self) -> Tick {
        self.ctx.current_tick()
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    /// Asks for one more tick. Requests made while one is pending collapse into it.
    pub fn request_tick(&self) -> Result<(), SimError> {
        let mut state = self.engine.state.lock();
        if !state.running {
            return Err(SimError::NotRunning);
        }
        state.tick_requested = true;
        drop(state);
        self.engine.wake.notify_all();
        Ok(())
    }

    /// Blocks until the tick counter reaches `tick` or the engine stops.
    pub fn wait_for_tick(&self, tick: Tick) {
        let mut state = self.engine.state.lock();
        while state.running && self.ctx.current_tick() < tick {
            self.engine.progress.wait(&mut state);
        }
    }

    /// Blocks until no tick is pending or running.
    fn wait_idle(&self) {
        let mut state = self.engine.state.lock();
        while state.running && (state.tick_requested || state.phase != EnginePhase::Idle) {
            self.engine.progress.wait(&mut state);
        }
    }

    /// Runs exactly `ticks` ticks and returns once the last one has finished.
    pub fn run_ticks(&self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.wait_idle();
            let target = self.current_tick() + 1;
            self.request_tick()?;
            self.wait_for_tick(target);
        }
        self.wait_idle();
        Ok(())
    }

    // ========================================================================
    // Network changes (applied at the next upkeep)
    // ========================================================================

    pub fn new_node(&self, full_history: bool, processing_speed: Option<f64>) -> NodeId {
        self.add_node(SimNode::create(&self.ctx, full_history, processing_speed))
    }

    pub fn add_node(&self, node: SimNode) -> NodeId {
        self.ctx.add_node(node)
    }

    pub fn add_link(&self, link: SimLink) -> SharedLink {
        let link = link.into_shared();
        self.ctx.add_link(link.clone());
        link
    }

    /// Creates a directed link with parameters drawn from the shared stream.
    pub fn connect(&self, from: NodeId, to: NodeId, params: LinkParams) -> SharedLink {
        let link = self
            .ctx
            .rng()
            .with(|rng| SimLink::new(self.ctx.config(), from, to, params, rng));
        self.add_link(link)
    }

    pub fn drop_link(&self, id: LinkId) {
        self.ctx.drop_link(id);
    }

    pub fn drop_node(&self, id: NodeId) {
        self.ctx.drop_node(id);
    }

    /// Hands a new block with `transactions` to `node` at the next upkeep.
    pub fn propose_block(&self, node: NodeId, transactions: u64) -> Result<(), SimError> {
        if !self.ctx.node_exists(node) {
            return Err(SimError::NodeNotFound(node));
        }
        self.ctx.stage_proposal(node, transactions);
        Ok(())
    }

    /// Sends on a live link at the current tick. Returns whether the message was queued.
    pub fn send_message(&self, link: LinkId, message: NetworkMessage) -> Result<bool, SimError> {
        let link = self.ctx.get_link(link)?;
        let mut events: Vec<SimEvent> = Vec::new();
        let queued = link
            .lock()
            .send_message(self.ctx.current_tick(), message, &mut events);
        self.log.add_events(events);
        Ok(queued)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn node_exists(&self, id: NodeId) -> bool {
        self.ctx.node_exists(id)
    }

    pub fn get_node(&self, id: NodeId) -> Result<Arc<NodeHandle>, SimError> {
        self.ctx.get_node(id)
    }

    pub fn get_link(&self, id: LinkId) -> Result<SharedLink, SimError> {
        self.ctx.get_link(id)
    }

    pub fn get_link_between(&self, from: NodeId, to: NodeId) -> Result<SharedLink, SimError> {
        self.ctx.get_link_between(from, to)
    }

    pub fn outgoing_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.ctx.outgoing_neighbors(id)
    }

    pub fn incoming_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.ctx.incoming_neighbors(id)
    }

    pub fn pick_random_node(&self) -> Result<NodeId, SimError> {
        self.ctx
            .rng()
            .with(|rng| self.ctx.pick_random_node(rng))
            .ok_or(SimError::EmptyNetwork)
    }

    /// Random live node, drawn from the caller's generator.
    pub fn pick_random_node_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<NodeId, SimError> {
        self.ctx.pick_random_node(rng).ok_or(SimError::EmptyNetwork)
    }

    pub fn node_count(&self) -> usize {
        self.ctx.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.ctx.link_count()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.ctx.node_ids()
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.ctx.link_ids()
    }

    // ========================================================================
    // Dump
    // ========================================================================

    pub fn write_network(&self, out: &mut dyn Write) -> Result<(), SimError> {
        if self.is_running() {
            return Err(SimError::NotStopped);
        }
        sim_dump::write_network(&self.ctx, out)?;
        Ok(())
    }

    pub fn write_network_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        if self.is_running() {
            return Err(SimError::NotStopped);
        }
        let mut out = BufWriter::new(File::create(path)?);
        sim_dump::write_network(&self.ctx, &mut out)?;
        out.flush()?;
        Ok(())
    }
}

impl Drop for SimController {
    fn drop(&mut self) {
        self.stop();
        self.log.stop();
    }
}

// ============================================================================
// Master thread
// ============================================================================

fn master_loop(ctx: Arc<SimContext>, log: Arc<EventLog>, engine: Arc<Engine>, pool: WorkerPool) {
    loop {
        {
            let mut state = engine.state.lock();
            loop {
                // a stop observed while idle wins over a pending tick
                if state.stop_requested {
                    state.tick_requested = false;
                    state.phase = EnginePhase::Terminating;
                    break;
                }
                if state.tick_requested {
                    state.tick_requested = false;
                    state.phase = EnginePhase::RunningLinks;
                    break;
                }
                engine.wake.wait(&mut state);
            }
            if state.phase == EnginePhase::Terminating {
                break;
            }
        }

        if let Err(e) = run_tick(&ctx, &log, &engine, &pool) {
            error!("tick {} aborted: {}", ctx.current_tick(), e);
            engine.set_phase(EnginePhase::Terminating);
            break;
        }

        let finished = ctx.advance_tick();
        debug!("tick {} finished", finished - 1);
        engine.set_phase(EnginePhase::Idle);
    }

    pool.terminate();
    log.flush();

    let mut state = engine.state.lock();
    state.running = false;
    state.stop_requested = false;
    state.tick_requested = false;
    state.phase = EnginePhase::Stopped;
    drop(state);
    engine.progress.notify_all();
}

fn run_tick(
    ctx: &SimContext,
    log: &EventLog,
    engine: &Engine,
    pool: &WorkerPool,
) -> Result<(), SimError> {
    let events = pool.update_links(ctx.link_snapshot())?;
    log.add_events(events);

    engine.set_phase(EnginePhase::RunningNodes);
    let events = pool.update_nodes(ctx.node_snapshot())?;
    log.add_events(events);

    engine.set_phase(EnginePhase::Upkeep);
    let events = ctx.upkeep();
    if !events.is_empty() {
        debug!("upkeep at tick {}: {} changes", ctx.current_tick(), events.len());
    }
    log.add_events(events);

    if log.buffered_events() > 100_000 {
        warn!("event log is {} records behind", log.buffered_events());
    }
    Ok(())
}
