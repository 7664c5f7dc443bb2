//! In-process collective backend.
//!
//! Each rank is a thread holding a `LocalBackend`. Groups created through it
//! share buffers and a timed barrier, so collectives behave like their
//! multi-process counterparts: they block until every member arrives and
//! fail with a coordination error when a peer never shows up.

use super::{CollectiveCommunicator, CommunicationBackend};
use crate::utils::config::DistributedConfig;
use crate::utils::error::{MeshError, Result};
use candle_core::Tensor;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Default time a collective waits for its peers.
pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(1800);

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MeshError::Coordination("collective state poisoned by a failed peer".to_string()))
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Reusable barrier whose waits expire.
struct TimedBarrier {
    parties: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl TimedBarrier {
    fn new(parties: usize, timeout: Duration) -> Self {
        Self {
            parties,
            timeout,
            state: Mutex::new(BarrierState { arrived: 0, generation: 0 }),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        let (mut state, wait) = self
            .cvar
            .wait_timeout_while(state, self.timeout, |s| s.generation == generation)
            .map_err(|_| MeshError::Coordination("barrier poisoned".to_string()))?;
        if wait.timed_out() && state.generation == generation {
            let arrived = state.arrived;
            // Withdraw so the next round counts only live waiters
            state.arrived -= 1;
            return Err(MeshError::Coordination(format!(
                "collective timed out after {:?} with {}/{} members arrived",
                self.timeout, arrived, self.parties
            )));
        }
        Ok(())
    }
}

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    barrier: TimedBarrier,
}

impl SharedState {
    fn new(size: usize, timeout: Duration) -> Self {
        Self {
            buffers: Mutex::new((0..size).map(|_| None).collect()),
            barrier: TimedBarrier::new(size, timeout),
        }
    }
}

pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    /// Standalone group of `world_size` communicators, one per thread.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        Self::new_group_with_timeout(world_size, DEFAULT_COLLECTIVE_TIMEOUT)
    }

    pub fn new_group_with_timeout(world_size: usize, timeout: Duration) -> Vec<Self> {
        let shared = Arc::new(SharedState::new(world_size, timeout));

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn publish(&self, tensor: &Tensor) -> Result<()> {
        let mut buffers = lock(&self.shared.buffers)?;
        buffers[self.rank] = Some(tensor.clone());
        Ok(())
    }

    fn collect(&self) -> Result<Vec<Tensor>> {
        let buffers = lock(&self.shared.buffers)?;
        buffers
            .iter()
            .enumerate()
            .map(|(rank, t)| {
                t.clone().ok_or_else(|| {
                    MeshError::Coordination(format!("group rank {} published no tensor", rank))
                })
            })
            .collect()
    }
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait()
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.shared.barrier.wait()?;

        // Everyone sums in rank order so results are bit-identical.
        let tensors = self.collect()?;
        let mut sum = tensors[0].clone();
        for t in &tensors[1..] {
            sum = sum.add(t)?;
        }

        // Wait for all to read before the buffers are reused
        self.shared.barrier.wait()?;
        Ok(sum)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.shared.barrier.wait()?;

        let tensors = self.collect()?;
        let gathered = Tensor::cat(&tensors, 0)?;

        self.shared.barrier.wait()?;
        Ok(gathered)
    }

    fn reduce_scatter_ranges(
        &self,
        tensor: &Tensor,
        ranges: &[Range<usize>],
    ) -> Result<Option<Tensor>> {
        self.publish(tensor)?;
        self.shared.barrier.wait()?;

        let own = ranges.get(self.rank).cloned().unwrap_or(0..0);
        let reduced = if own.is_empty() {
            None
        } else {
            let tensors = self.collect()?;
            let mut sum = tensors[0].narrow(0, own.start, own.len())?;
            for t in &tensors[1..] {
                sum = sum.add(&t.narrow(0, own.start, own.len())?)?;
            }
            Some(sum)
        };

        self.shared.barrier.wait()?;
        Ok(reduced)
    }
}

struct GroupCreation {
    ranks: Vec<usize>,
    state: Arc<SharedState>,
}

/// Shared rendezvous for a world of in-process ranks.
///
/// Group creations are matched by sequence number: the k-th `new_group` call
/// of every rank must name the same members, otherwise the ranks have
/// diverged and the call fails instead of deadlocking later.
pub struct LocalWorld {
    world_size: usize,
    timeout: Duration,
    creations: Mutex<Vec<GroupCreation>>,
}

impl LocalWorld {
    pub fn new(world_size: usize, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            timeout,
            creations: Mutex::new(Vec::new()),
        })
    }

    /// Handle for one rank of this world.
    pub fn backend(self: &Arc<Self>, rank: usize) -> Result<LocalBackend> {
        if rank >= self.world_size {
            return Err(MeshError::Config(format!(
                "rank {} outside world of size {}",
                rank, self.world_size
            )));
        }
        Ok(LocalBackend {
            world: self.clone(),
            rank,
            calls: AtomicUsize::new(0),
        })
    }

    /// Run `f` once per rank, each on its own thread, and collect the results in rank order.
    pub fn spawn<F, R>(world_size: usize, timeout: Duration, f: F) -> Vec<R>
    where
        F: Fn(LocalBackend) -> R + Sync,
        R: Send,
    {
        let world = Self::new(world_size, timeout);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let backend = LocalBackend {
                        world: world.clone(),
                        rank,
                        calls: AtomicUsize::new(0),
                    };
                    let f = &f;
                    scope.spawn(move || f(backend))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of distinct communication contexts created so far.
    pub fn groups_created(&self) -> usize {
        self.creations.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// One rank's view of a `LocalWorld`.
pub struct LocalBackend {
    world: Arc<LocalWorld>,
    rank: usize,
    calls: AtomicUsize,
}

impl LocalBackend {
    pub fn world(&self) -> &Arc<LocalWorld> {
        &self.world
    }
}

impl CommunicationBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }

    fn new_group(&self, ranks: &[usize]) -> Result<Option<Arc<dyn CollectiveCommunicator>>> {
        let seq = self.calls.fetch_add(1, Ordering::SeqCst);

        let state = {
            let mut creations = lock(&self.world.creations)?;
            match creations.get(seq) {
                Some(existing) if existing.ranks != ranks => {
                    return Err(MeshError::Coordination(format!(
                        "group creation #{} diverged: rank {} asked for {:?}, peers created {:?}",
                        seq, self.rank, ranks, existing.ranks
                    )));
                }
                Some(existing) => existing.state.clone(),
                None if seq == creations.len() => {
                    validate_members(ranks, self.world.world_size)?;
                    let state = Arc::new(SharedState::new(ranks.len(), self.world.timeout));
                    creations.push(GroupCreation {
                        ranks: ranks.to_vec(),
                        state: state.clone(),
                    });
                    debug!(seq, ranks = ?ranks, "created local communication context");
                    state
                }
                None => {
                    return Err(MeshError::Coordination(format!(
                        "rank {} skipped group creations (call #{} with only {} recorded)",
                        self.rank,
                        seq,
                        creations.len()
                    )));
                }
            }
        };

        Ok(ranks.iter().position(|&r| r == self.rank).map(|group_rank| {
            Arc::new(LocalCommunicator {
                rank: group_rank,
                world_size: ranks.len(),
                shared: state,
            }) as Arc<dyn CollectiveCommunicator>
        }))
    }
}

fn validate_members(ranks: &[usize], world_size: usize) -> Result<()> {
    if ranks.is_empty() {
        return Err(MeshError::Coordination("cannot create an empty group".to_string()));
    }
    let mut sorted = ranks.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != ranks.len() || sorted[sorted.len() - 1] >= world_size {
        return Err(MeshError::Coordination(format!(
            "invalid group members {:?} for world of size {}",
            ranks, world_size
        )));
    }
    Ok(())
}

/// Resolve the configured backend identifier for this process.
///
/// Only single-rank `local` worlds can be created from configuration alone;
/// multi-rank in-process worlds are started with `LocalWorld::spawn`.
pub fn init_backend(config: &DistributedConfig) -> Result<Arc<dyn CommunicationBackend>> {
    info!(
        backend = %config.backend,
        rendezvous = %format!("{}:{}", config.master_addr, config.master_port),
        rank = config.rank,
        world_size = config.world_size,
        "Initializing communication backend"
    );

    match config.backend.as_str() {
        "local" => {
            if config.world_size != 1 {
                return Err(MeshError::Config(format!(
                    "local backend from config supports world_size 1, got {}; use LocalWorld::spawn",
                    config.world_size
                )));
            }
            let world = LocalWorld::new(1, Duration::from_secs(config.timeout_secs));
            Ok(Arc::new(world.backend(0)?))
        }
        "nccl" | "gloo" | "mpi" => Err(MeshError::NotImplemented(format!(
            "{} backend is not available in this build",
            config.backend
        ))),
        other => Err(MeshError::Config(format!("Unknown backend: {}", other))),
    }
}
