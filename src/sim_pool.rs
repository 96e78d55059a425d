// Worker pool for the parallel phases
//
// Each worker owns one contiguous slice of the link or node list per phase
// and buffers the events it produces. The master waits for every slice
// before moving on, then concatenates the buffers in slice order.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, warn};

use crate::sim_context::SimContext;
use crate::sim_error::SimError;
use crate::sim_interface::SimEvent;
use crate::sim_link::SharedLink;
use crate::sim_node::NodeHandle;

enum Job {
    Links {
        links: Arc<Vec<SharedLink>>,
        range: Range<usize>,
    },
    Nodes {
        nodes: Arc<Vec<Arc<NodeHandle>>>,
        range: Range<usize>,
    },
    Terminate,
}

struct Done {
    worker: usize,
    events: Vec<SimEvent>,
    panicked: bool,
}

pub struct WorkerPool {
    jobs: Vec<Sender<Job>>,
    done: Receiver<Done>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, ctx: Arc<SimContext>) -> Result<Self, SimError> {
        if workers == 0 {
            return Err(SimError::InvalidWorkerCount);
        }

        let (done_tx, done) = channel::unbounded();
        let mut jobs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (job_tx, job_rx) = channel::unbounded();
            let ctx = Arc::clone(&ctx);
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sim-worker-{}", worker))
                .spawn(move || worker_loop(worker, ctx, job_rx, done_tx))?;
            jobs.push(job_tx);
            handles.push(handle);
        }
        debug!("spawned {} simulation workers", workers);

        Ok(Self {
            jobs,
            done,
            handles,
        })
    }

    pub fn workers(&self) -> usize {
        self.jobs.len()
    }

    pub fn update_links(&self, links: Vec<SharedLink>) -> Result<Vec<SimEvent>, SimError> {
        let links = Arc::new(links);
        self.run_phase(links.len(), |range| Job::Links {
            links: Arc::clone(&links),
            range,
        })
    }

    pub fn update_nodes(&self, nodes: Vec<Arc<NodeHandle>>) -> Result<Vec<SimEvent>, SimError> {
        let nodes = Arc::new(nodes);
        self.run_phase(nodes.len(), |range| Job::Nodes {
            nodes: Arc::clone(&nodes),
            range,
        })
    }

    /// Hands one slice to each worker and blocks until all of them report.
    fn run_phase(
        &self,
        len: usize,
        make_job: impl Fn(Range<usize>) -> Job,
    ) -> Result<Vec<SimEvent>, SimError> {
        let mut dispatched = 0;
        for (worker, range) in partition(len, self.workers()).into_iter().enumerate() {
            if range.is_empty() {
                continue;
            }
            self.jobs[worker]
                .send(make_job(range))
                .map_err(|_| SimError::WorkerPanicked)?;
            dispatched += 1;
        }

        let mut batches: Vec<Option<Vec<SimEvent>>> = vec![None; self.workers()];
        let mut panicked = false;
        for _ in 0..dispatched {
            let done = self.done.recv().map_err(|_| SimError::WorkerPanicked)?;
            panicked |= done.panicked;
            batches[done.worker] = Some(done.events);
        }
        if panicked {
            return Err(SimError::WorkerPanicked);
        }

        Ok(batches.into_iter().flatten().flatten().collect())
    }

    pub fn terminate(self) {
        for job in &self.jobs {
            let _ = job.send(Job::Terminate);
        }
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("simulation worker exited abnormally");
            }
        }
    }
}

fn worker_loop(worker: usize, ctx: Arc<SimContext>, jobs: Receiver<Job>, done: Sender<Done>) {
    while let Ok(job) = jobs.recv() {
        let mut events = Vec::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| match job {
            Job::Links { links, range } => {
                for link in &links[range] {
                    link.lock().update(&ctx, &mut events);
                }
                true
            }
            Job::Nodes { nodes, range } => {
                for node in &nodes[range] {
                    node.update(&ctx, &mut events);
                }
                true
            }
            Job::Terminate => false,
        }));

        let panicked = match result {
            Ok(true) => false,
            Ok(false) => return,
            Err(_) => {
                error!("simulation worker {} panicked", worker);
                true
            }
        };
        if done
            .send(Done {
                worker,
                events,
                panicked,
            })
            .is_err()
        {
            return;
        }
    }
}

/// Splits `0..len` into `parts` contiguous ranges whose sizes differ by at most one.
pub fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = len / parts;
    let extra = len % parts;

    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}
