//! Stage worker: one partition, one thread, one scheduling loop.
//!
//! ```text
//!             subscribe_producer ─┐          ┌─► get_output_by_key (consumers)
//!   set_input ─────────────────┐  │          │
//!                              ▼  ▼          │
//!                         ┌───────────┐  ┌───────────┐
//!   next_key (policy) ──► │ work_list │─►│output_list│  refcount → evict
//!                         └───────────┘  └───────────┘
//!                               │ consume once
//!                               ▼
//!                     FORWARD / BACKWARD on the module
//! ```
//!
//! A work item enters the pending map when its inputs are known (futures on peer
//! outputs, or tensors injected by the engine). The loop asks its policy for the
//! next key, blocks until that key is pending, moves the item into the published
//! map, runs the phase and resolves the item's future. Peers read the result with
//! [`StageWorker::get_output_by_key`]; the published item is dropped after its
//! last expected reader.

use super::backward_cache::{BackwardCache, BackwardCacheStore};
use super::schedule::{ScheduleKind, SchedulePolicy, StageCounters, StagePosition};
use super::stage::{EngineOptions, PartitionArgs, PartitionFn, StageArgs, StageModule};
use super::topology::{DagRouting, InputRoute, Topology};
use super::work_item::{Payload, Phase, UniqueKey, WorkArgs, WorkItem};
use crate::error::{Error, Result};
use crate::optimizer::{GradBuffer, Optimizer, OptimizerKind, StageOptimizer};
use crate::rpc::{self, CancelToken, Monitor, RpcFuture};
use numr::autograd::{GradStore, Var};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Module plus everything that mutates its parameters.
struct Partition<R: Runtime> {
    module: Box<dyn StageModule<R>>,
    optimizer: Option<StageOptimizer<R>>,
    grads: GradBuffer<R>,
}

#[derive(Default)]
struct LoopState {
    counters: StageCounters,
    forwards: u64,
    backwards: u64,
    backward_triggers: u64,
    steps: u64,
    batch_order: Vec<UniqueKey>,
    last_batch_order: Vec<UniqueKey>,
}

/// Subscriptions already served for open batches.
///
/// Notifications for a batch at or below `finished` are stale and never admitted.
#[derive(Default)]
struct Subscriptions {
    seen: HashSet<(u64, usize, Phase)>,
    finished: Option<u64>,
}

impl Subscriptions {
    fn admit(&mut self, batch_id: u64, microbatch_id: usize, phase: Phase) -> bool {
        if self.finished.is_some_and(|done| batch_id <= done) {
            return false;
        }
        self.seen.insert((batch_id, microbatch_id, phase))
    }

    fn close(&mut self, batch_id: u64) {
        self.seen.retain(|&(batch, _, _)| batch > batch_id);
        self.finished = Some(self.finished.map_or(batch_id, |done| done.max(batch_id)));
    }
}

/// Snapshot of a stage's progress and map sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStats {
    pub rank: usize,
    /// Current-batch counters; zero between batches.
    pub forward_times: usize,
    pub backward_times: usize,
    pub outstanding: usize,
    pub total_forwards: u64,
    pub total_backwards: u64,
    /// Backward items the terminal stage enqueued for itself.
    pub backward_triggers: u64,
    pub optimizer_steps: u64,
    pub completed_batches: u64,
    pub pending: usize,
    pub published: usize,
    pub cached: usize,
    pub labels: usize,
    /// Keys executed during the most recently completed batch, in order.
    pub last_batch_order: Vec<UniqueKey>,
}

/// Construction parameters of a [`StageWorker`].
pub struct WorkerSpec<R: Runtime> {
    pub rank: usize,
    pub num_stages: usize,
    pub num_microbatches: usize,
    pub checkpoint: bool,
    pub schedule: ScheduleKind,
    pub options: EngineOptions<R>,
}

/// One pipeline stage.
pub struct StageWorker<R: Runtime> {
    rank: usize,
    num_stages: usize,
    num_microbatches: usize,
    checkpoint: bool,
    schedule: ScheduleKind,
    policy: Box<dyn SchedulePolicy>,
    options: EngineOptions<R>,
    token: CancelToken,
    peers: OnceLock<Vec<Weak<StageWorker<R>>>>,
    topology: Arc<Monitor<Option<Arc<Topology>>>>,
    work_list: Arc<Monitor<HashMap<UniqueKey, WorkItem<R>>>>,
    output_list: Arc<Monitor<HashMap<UniqueKey, WorkItem<R>>>>,
    labels: Arc<Monitor<HashMap<usize, Tensor<R>>>>,
    partition: Arc<Monitor<Option<Partition<R>>>>,
    cache: Arc<Monitor<BackwardCacheStore<R>>>,
    state: Arc<Monitor<LoopState>>,
    subscribed: Arc<Monitor<Subscriptions>>,
    completed_batches: Arc<Monitor<u64>>,
}

fn activations<R: Runtime>(stage: usize, payload: Payload<R>) -> Result<Vec<Tensor<R>>> {
    match payload {
        Payload::Activations(tensors) => Ok(tensors),
        other => Err(Error::UnexpectedPayload {
            stage,
            expected: "activations",
            found: other.kind(),
        }),
    }
}

fn gradients<R: Runtime>(stage: usize, payload: Payload<R>) -> Result<Vec<Option<Tensor<R>>>> {
    match payload {
        Payload::Gradients(grads) => Ok(grads),
        other => Err(Error::UnexpectedPayload {
            stage,
            expected: "gradients",
            found: other.kind(),
        }),
    }
}

/// Put the tensors a route picks from `source` into their argument slots.
fn place<R: Runtime>(
    slots: &mut [Option<Tensor<R>>],
    route: &InputRoute,
    source: &[Tensor<R>],
) -> Result<()> {
    let picked: Vec<&Tensor<R>> = match &route.pick {
        None => match source {
            [single] => vec![single],
            _ => {
                return Err(Error::Invariant {
                    reason: format!(
                        "route from {:?} expects one tensor, got {}",
                        route.source,
                        source.len()
                    ),
                });
            }
        },
        Some(offsets) => offsets
            .iter()
            .map(|&i| {
                source.get(i).ok_or_else(|| Error::Invariant {
                    reason: format!(
                        "route from {:?} picks offset {i} of {} tensors",
                        route.source,
                        source.len()
                    ),
                })
            })
            .collect::<Result<_>>()?,
    };
    if picked.len() != route.target.len() {
        return Err(Error::Invariant {
            reason: format!(
                "route from {:?} picks {} tensors for {} positions",
                route.source,
                picked.len(),
                route.target.len()
            ),
        });
    }
    for (tensor, &pos) in picked.into_iter().zip(&route.target) {
        let slot = slots.get_mut(pos).ok_or_else(|| Error::Invariant {
            reason: format!("argument position {pos} out of range"),
        })?;
        if slot.is_some() {
            return Err(Error::Invariant {
                reason: format!("argument position {pos} filled twice"),
            });
        }
        *slot = Some(tensor.clone());
    }
    Ok(())
}

fn empty_slots<R: Runtime>(n: usize) -> Vec<Option<Tensor<R>>> {
    (0..n).map(|_| None).collect()
}

fn filled<R: Runtime>(slots: Vec<Option<Tensor<R>>>) -> Result<Vec<Tensor<R>>> {
    slots
        .into_iter()
        .enumerate()
        .map(|(pos, slot)| {
            slot.ok_or_else(|| Error::Invariant {
                reason: format!("argument position {pos} was never filled"),
            })
        })
        .collect()
}

/// Arrange a batch's arguments in the order the graph declares its model inputs.
fn model_arguments<R: Runtime>(
    dag: &DagRouting,
    args: Vec<Tensor<R>>,
    mut kwargs: BTreeMap<String, Tensor<R>>,
) -> Result<Vec<Tensor<R>>> {
    if args.len() > dag.model_inputs.len() {
        return Err(Error::UnsupportedBatch {
            reason: format!(
                "{} positional inputs for {} model inputs",
                args.len(),
                dag.model_inputs.len()
            ),
        });
    }
    let mut ordered = args;
    for name in &dag.model_inputs[ordered.len()..] {
        let tensor = kwargs.remove(name).ok_or_else(|| Error::UnsupportedBatch {
            reason: format!("model input '{name}' missing from batch"),
        })?;
        ordered.push(tensor);
    }
    if let Some(extra) = kwargs.keys().next() {
        return Err(Error::UnsupportedBatch {
            reason: format!("'{extra}' is not a model input"),
        });
    }
    Ok(ordered)
}

fn scalar_of<R: Runtime<DType = DType>>(loss: &Var<R>) -> Result<f64> {
    let tensor = loss.tensor();
    let first = match tensor.dtype() {
        DType::F32 => tensor.to_vec::<f32>().first().map(|&v| f64::from(v)),
        DType::F64 => tensor.to_vec::<f64>().first().copied(),
        other => {
            return Err(Error::InvalidArgument {
                arg: "criterion",
                reason: format!("loss must be F32 or F64, got {other:?}"),
            });
        }
    };
    first.ok_or_else(|| Error::InvalidArgument {
        arg: "criterion",
        reason: "loss has no elements".to_string(),
    })
}

impl<R> StageWorker<R>
where
    R: Runtime<DType = DType>,
    R::Client: RuntimeClient<R>
        + TensorOps<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ReduceOps<R>
        + ScalarOps<R>,
{
    pub fn new(spec: WorkerSpec<R>, token: &CancelToken) -> Arc<Self> {
        let position = StagePosition {
            rank: spec.rank,
            num_stages: spec.num_stages,
            num_microbatches: spec.num_microbatches,
        };
        let policy = spec.schedule.policy();
        let counters = StageCounters::new(policy.initial_range(&position));
        Arc::new(Self {
            rank: spec.rank,
            num_stages: spec.num_stages,
            num_microbatches: spec.num_microbatches,
            checkpoint: spec.checkpoint,
            schedule: spec.schedule,
            policy,
            options: spec.options,
            token: token.clone(),
            peers: OnceLock::new(),
            topology: Monitor::new(None, token),
            work_list: Monitor::new(HashMap::new(), token),
            output_list: Monitor::new(HashMap::new(), token),
            labels: Monitor::new(HashMap::new(), token),
            partition: Monitor::new(None, token),
            cache: Monitor::new(BackwardCacheStore::new(spec.rank), token),
            state: Monitor::new(
                LoopState {
                    counters,
                    ..LoopState::default()
                },
                token,
            ),
            subscribed: Monitor::new(Subscriptions::default(), token),
            completed_batches: Monitor::new(0, token),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    fn position(&self) -> StagePosition {
        StagePosition {
            rank: self.rank,
            num_stages: self.num_stages,
            num_microbatches: self.num_microbatches,
        }
    }

    // ── setup ───────────────────────────────────────────────────────────

    /// Inject handles to every stage, indexed by rank. Allowed once.
    pub fn sync_peers(&self, peers: Vec<Weak<StageWorker<R>>>) -> Result<()> {
        if peers.len() != self.num_stages {
            return Err(Error::InvalidArgument {
                arg: "peers",
                reason: format!("{} peers for {} stages", peers.len(), self.num_stages),
            });
        }
        self.peers
            .set(peers)
            .map_err(|_| Error::PeersAlreadySynced { stage: self.rank })
    }

    fn peer(&self, rank: usize) -> Result<Arc<StageWorker<R>>> {
        let peers = self.peers.get().ok_or_else(|| Error::Invariant {
            reason: format!("stage {}: peers not synchronized", self.rank),
        })?;
        peers
            .get(rank)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Cancelled {
                reason: format!("stage {rank} is gone"),
            })
    }

    /// Build this stage's module.
    pub fn build_partition(&self, partition_fn: &PartitionFn<R>, args: PartitionArgs) -> Result<()> {
        let module = partition_fn(args)?;
        self.partition.update(|slot| {
            if slot.is_some() {
                return Err(Error::Invariant {
                    reason: format!("stage {}: partition built twice", self.rank),
                });
            }
            *slot = Some(Partition {
                module,
                optimizer: None,
                grads: GradBuffer::new(),
            });
            Ok(())
        })?;
        debug!(stage = self.rank, "partition built");
        Ok(())
    }

    fn with_partition<T>(&self, f: impl FnOnce(&mut Partition<R>) -> Result<T>) -> Result<T> {
        let mut guard = self.partition.lock();
        let partition = guard.as_mut().ok_or_else(|| Error::Invariant {
            reason: format!("stage {}: partition not built", self.rank),
        })?;
        f(partition)
    }

    /// Resolve and publish the topology. A second call fails.
    pub fn resolve_topology(&self) -> Result<Arc<Topology>> {
        let graph = self.with_partition(|p| Ok(p.module.partition_graph().cloned()))?;
        let topology = Arc::new(Topology::resolve(self.rank, self.num_stages, graph.as_ref())?);
        self.topology.update(|slot| {
            if slot.is_some() {
                return Err(Error::TopologyAlreadyResolved { stage: self.rank });
            }
            *slot = Some(Arc::clone(&topology));
            Ok(())
        })?;
        debug!(
            stage = self.rank,
            producers = ?topology.producers,
            consumers = ?topology.consumers,
            dag = topology.dag.is_some(),
            "topology resolved"
        );
        Ok(topology)
    }

    fn wait_topology(&self) -> Result<Arc<Topology>> {
        let guard = self.topology.wait_until(Option::is_some)?;
        guard.clone().ok_or_else(|| Error::Invariant {
            reason: "topology vanished after resolution".to_string(),
        })
    }

    /// Topology once resolved, blocking until then.
    pub fn topology(&self) -> Result<Arc<Topology>> {
        self.wait_topology()
    }

    pub fn initialize_optimizer(&self, kind: &OptimizerKind) -> Result<()> {
        self.with_partition(|p| {
            p.optimizer = Some(kind.build());
            Ok(())
        })
    }

    fn has_optimizer(&self) -> Result<bool> {
        self.with_partition(|p| Ok(p.optimizer.is_some()))
    }

    // ── loop ────────────────────────────────────────────────────────────

    /// Start the scheduling loop on its own thread.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let name = format!("pipr-stage-{}", self.rank);
        let worker = Arc::clone(self);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())
            .map_err(|e| Error::Remote {
                origin: name,
                reason: format!("failed to spawn stage thread: {e}"),
            })
    }

    fn run(&self) {
        match self.run_loop() {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!(stage = self.rank, reason = %e, "stage loop stopped");
            }
            Err(e) => {
                error!(stage = self.rank, error = %e, "stage failed");
                self.token.cancel(format!("stage {}: {e}", self.rank));
            }
        }
    }

    fn run_loop(&self) -> Result<()> {
        let topology = self.resolve_topology()?;
        let position = self.position();
        loop {
            if self.token.is_cancelled() {
                return Err(self.token.error());
            }
            let key = {
                let mut state = self.state.lock();
                self.policy.next_key(&mut state.counters, &position)?
            };

            let mut item = {
                let mut pending = self.work_list.wait_until(|m| m.contains_key(&key))?;
                pending.remove(&key).ok_or_else(|| Error::Invariant {
                    reason: format!("{key} vanished from the work list"),
                })?
            };
            let args = std::mem::take(&mut item.args);
            let output = item.output.clone();
            let batch_id = item.batch_id;
            let forward_only = item.forward_only;
            item.expected_readers = self.expected_readers(&topology, key);
            if item.expected_readers > 0 {
                self.output_list.update(|published| published.insert(key, item));
            }

            debug!(
                stage = self.rank,
                microbatch = key.microbatch_id,
                phase = %key.phase,
                batch = batch_id,
                "executing"
            );
            let result = match key.phase {
                Phase::Forward => {
                    self.forward_pass(&topology, key.microbatch_id, batch_id, forward_only, args)
                }
                Phase::Backward => self.backward_pass(&topology, key.microbatch_id, batch_id, args),
                Phase::Input => Err(Error::UnexpectedPhase {
                    stage: self.rank,
                    phase: key.phase.to_string(),
                }),
            };

            match result {
                Ok(payload) => output.set(payload)?,
                Err(e) => {
                    if let Err(set_err) = output.fail(format!("stage-{}", self.rank), &e) {
                        warn!(stage = self.rank, error = %set_err, "could not fail work item");
                    }
                    return Err(e);
                }
            }
            self.state.update(|st| st.batch_order.push(key));

            if self.is_last_step(key, forward_only) {
                self.finish_batch(batch_id, forward_only)?;
            }
        }
    }

    fn is_last_step(&self, key: UniqueKey, forward_only: bool) -> bool {
        let last_phase = if forward_only {
            Phase::Forward
        } else {
            Phase::Backward
        };
        key.microbatch_id + 1 == self.num_microbatches && key.phase == last_phase
    }

    fn finish_batch(&self, batch_id: u64, forward_only: bool) -> Result<()> {
        if let Some(hook) = &self.options.pre_step_hook {
            hook(self.rank);
        }
        if !forward_only && self.has_optimizer()? {
            self.step()?;
        }

        let leftover = self.cache.lock().len();
        if leftover > 0 {
            warn!(stage = self.rank, batch = batch_id, leftover, "backward caches left at batch end");
        }
        let initial = self.policy.initial_range(&self.position());
        self.state.update(|st| {
            st.counters = StageCounters::new(initial);
            st.last_batch_order = std::mem::take(&mut st.batch_order);
        });
        self.subscribed.update(|subs| subs.close(batch_id));
        self.completed_batches.update(|n| *n += 1);
        info!(stage = self.rank, batch = batch_id, forward_only, "batch complete");
        Ok(())
    }

    /// How many `get_output_by_key` calls will read a published item.
    ///
    /// Items nobody reads are not published.
    fn expected_readers(&self, topology: &Topology, key: UniqueKey) -> usize {
        match key.phase {
            Phase::Forward => topology.consumers.len() + usize::from(topology.is_last()),
            Phase::Backward if !topology.producers.is_empty() => topology.producers.len(),
            Phase::Backward => {
                usize::from(topology.is_first() && self.engine_reads_backward(key.microbatch_id))
            }
            Phase::Input => topology.input_consumers.len(),
        }
    }

    /// Entry-stage backward outputs the engine waits on: the 1F1B window and the last one.
    fn engine_reads_backward(&self, microbatch_id: usize) -> bool {
        microbatch_id + 1 == self.num_microbatches
            || (self.schedule == ScheduleKind::OneFOneB
                && microbatch_id + self.num_stages < self.num_microbatches)
    }

    fn enqueue(&self, item: WorkItem<R>) -> Result<()> {
        let key = item.key();
        self.work_list.update(|pending| {
            if pending.contains_key(&key) {
                return Err(Error::Invariant {
                    reason: format!("stage {}: {key} enqueued twice", self.rank),
                });
            }
            pending.insert(key, item);
            Ok(())
        })
    }

    fn new_item(
        &self,
        phase: Phase,
        microbatch_id: usize,
        batch_id: u64,
        forward_only: bool,
        args: WorkArgs<R>,
    ) -> WorkItem<R> {
        WorkItem {
            stage_id: self.rank,
            phase,
            args,
            output: RpcFuture::new(&self.token),
            microbatch_id,
            batch_id,
            num_microbatches: self.num_microbatches,
            forward_only,
            refcount: 0,
            expected_readers: 0,
        }
    }

    // ── phases ──────────────────────────────────────────────────────────

    fn forward_pass(
        &self,
        topology: &Topology,
        microbatch_id: usize,
        batch_id: u64,
        forward_only: bool,
        args: WorkArgs<R>,
    ) -> Result<Payload<R>> {
        for &consumer in &topology.consumers {
            let peer = self.peer(consumer)?;
            rpc::notify(
                format!("pipr-subscribe-{}-{consumer}", self.rank),
                &self.token,
                move || peer.subscribe_producer(microbatch_id, batch_id, forward_only),
            );
        }
        self.state.update(|st| {
            st.counters.record_forward(forward_only);
            st.forwards += 1;
        });

        let mut inputs = self.resolve_forward_args(topology, args)?;
        if let Some(process) = &self.options.data_process {
            inputs = process(self.rank, inputs)?;
        }

        let requires_grad = !forward_only && !topology.is_first();
        let args: Vec<Var<R>> = inputs
            .args
            .into_iter()
            .map(|t| Var::new(t, requires_grad))
            .collect();
        let kwargs: BTreeMap<String, Var<R>> = inputs
            .kwargs
            .into_iter()
            .map(|(k, t)| (k, Var::new(t, requires_grad)))
            .collect();

        let outputs = self.with_partition(|p| p.module.forward(&args, &kwargs))?;
        let terminal = topology.is_last();

        let (payload, graph_outputs) = match (&self.options.criterion, terminal) {
            (Some(criterion), true) => {
                let labels = self.take_labels(microbatch_id)?;
                let loss = criterion(&outputs, &labels)?;
                let metric = match &self.options.metric {
                    Some(metric) => Some(metric(&outputs, &labels)?),
                    None => None,
                };
                let value = scalar_of(&loss)?;
                (Payload::Loss { loss: value, metric }, vec![loss])
            }
            _ => {
                let tensors = outputs.iter().map(|v| v.tensor().clone()).collect();
                (Payload::Activations(tensors), outputs)
            }
        };

        // Forward-only drops the graph here; checkpointed stages keep only their inputs.
        if !forward_only {
            let cache = if self.checkpoint && !terminal {
                BackwardCache::checkpointed(args, kwargs)
            } else {
                BackwardCache::new(args, kwargs, graph_outputs)
            };
            self.cache.update(|store| store.insert(microbatch_id, cache))?;
        }

        if terminal && !forward_only {
            self.enqueue(self.new_item(
                Phase::Backward,
                microbatch_id,
                batch_id,
                false,
                WorkArgs::Empty,
            ))?;
            self.state.update(|st| st.backward_triggers += 1);
        }
        Ok(payload)
    }

    fn resolve_forward_args(&self, topology: &Topology, args: WorkArgs<R>) -> Result<StageArgs<R>> {
        match (args, &topology.dag) {
            (WorkArgs::Inline { args, kwargs }, None) => Ok(StageArgs::new(args, kwargs)),
            (WorkArgs::Inline { args, .. }, Some(dag)) => {
                let route = dag.relay.as_ref().ok_or_else(|| Error::Invariant {
                    reason: format!("stage {} was handed the model input it does not read", self.rank),
                })?;
                let mut slots = empty_slots(dag.input_arity);
                place(&mut slots, route, &args)?;
                Ok(StageArgs::new(filled(slots)?, BTreeMap::new()))
            }
            (WorkArgs::Subscribed(futures), dag) => {
                let mut upstream = Vec::with_capacity(futures.len());
                for future in &futures {
                    upstream.push(activations(self.rank, future.wait()?)?);
                }
                match dag {
                    None => Ok(StageArgs::new(
                        upstream.into_iter().flatten().collect(),
                        BTreeMap::new(),
                    )),
                    Some(dag) => {
                        if dag.inputs.len() != upstream.len() {
                            return Err(Error::Invariant {
                                reason: format!(
                                    "stage {}: {} upstream results for {} routes",
                                    self.rank,
                                    upstream.len(),
                                    dag.inputs.len()
                                ),
                            });
                        }
                        let mut slots = empty_slots(dag.input_arity);
                        for (route, tensors) in dag.inputs.iter().zip(&upstream) {
                            place(&mut slots, route, tensors)?;
                        }
                        Ok(StageArgs::new(filled(slots)?, BTreeMap::new()))
                    }
                }
            }
            (WorkArgs::Empty, _) => Err(Error::Invariant {
                reason: format!("stage {}: forward item has no inputs", self.rank),
            }),
        }
    }

    fn take_labels(&self, microbatch_id: usize) -> Result<Tensor<R>> {
        let mut labels = self.labels.wait_until(|m| m.contains_key(&microbatch_id))?;
        labels.remove(&microbatch_id).ok_or_else(|| Error::Invariant {
            reason: format!("labels for microbatch {microbatch_id} vanished"),
        })
    }

    fn backward_pass(
        &self,
        topology: &Topology,
        microbatch_id: usize,
        batch_id: u64,
        args: WorkArgs<R>,
    ) -> Result<Payload<R>> {
        for &producer in &topology.producers {
            let peer = self.peer(producer)?;
            rpc::notify(
                format!("pipr-subscribe-{}-{producer}", self.rank),
                &self.token,
                move || peer.subscribe_consumer(microbatch_id, batch_id),
            );
        }
        self.state.update(|st| -> Result<()> {
            st.counters.record_backward()?;
            st.backwards += 1;
            Ok(())
        })?;

        let cache = self.cache.update(|store| store.take(microbatch_id))?;
        let outputs = if cache.checkpoint {
            self.with_partition(|p| p.module.forward(&cache.args, &cache.kwargs))?
        } else {
            cache.outputs.clone()
        };

        let grads = if topology.is_last() {
            let roots: Vec<Var<R>> = outputs.into_iter().filter(|v| v.requires_grad()).collect();
            if roots.is_empty() {
                None
            } else {
                Some(self.options.differentiator.backward(&roots, None)?)
            }
        } else {
            let (roots, seeds) = self.seeded_outputs(topology, &outputs, args)?;
            if roots.is_empty() {
                None
            } else {
                Some(self.options.differentiator.backward(&roots, Some(seeds.as_slice()))?)
            }
        };

        if let Some(store) = &grads {
            self.accumulate(store)?;
        }

        let input_grads = if topology.is_first() {
            Vec::new()
        } else {
            cache
                .inputs()
                .map(|input| grads.as_ref().and_then(|store| store.get(input.id()).cloned()))
                .collect()
        };
        Ok(Payload::Gradients(input_grads))
    }

    /// Pair each output with its upstream gradient, dropping pairs that carry no gradient.
    fn seeded_outputs(
        &self,
        topology: &Topology,
        outputs: &[Var<R>],
        args: WorkArgs<R>,
    ) -> Result<(Vec<Var<R>>, Vec<Tensor<R>>)> {
        let WorkArgs::Subscribed(futures) = args else {
            return Err(Error::Invariant {
                reason: format!("stage {}: backward item has no gradient futures", self.rank),
            });
        };
        let mut per_consumer = Vec::with_capacity(futures.len());
        for future in &futures {
            per_consumer.push(gradients(self.rank, future.wait()?)?);
        }

        let mut pairs: Vec<(usize, Option<Tensor<R>>)> = Vec::new();
        match &topology.dag {
            None => {
                let grads: Vec<Option<Tensor<R>>> = per_consumer.into_iter().flatten().collect();
                if grads.len() != outputs.len() {
                    return Err(Error::Invariant {
                        reason: format!(
                            "stage {}: {} gradients for {} outputs",
                            self.rank,
                            grads.len(),
                            outputs.len()
                        ),
                    });
                }
                pairs.extend(grads.into_iter().enumerate());
            }
            Some(dag) => {
                if dag.grads.len() != per_consumer.len() {
                    return Err(Error::Invariant {
                        reason: format!(
                            "stage {}: {} gradient results for {} consumers",
                            self.rank,
                            per_consumer.len(),
                            dag.grads.len()
                        ),
                    });
                }
                for (route, grads) in dag.grads.iter().zip(&per_consumer) {
                    for (&position, &offset) in route.grad_positions.iter().zip(&route.output_offsets) {
                        pairs.push((offset, grads.get(position).cloned().flatten()));
                    }
                }
            }
        }

        let mut roots = Vec::with_capacity(pairs.len());
        let mut seeds = Vec::with_capacity(pairs.len());
        for (offset, grad) in pairs {
            let output = outputs.get(offset).ok_or_else(|| Error::Invariant {
                reason: format!("stage {}: output offset {offset} out of range", self.rank),
            })?;
            if let (true, Some(grad)) = (output.requires_grad(), grad) {
                roots.push(output.clone());
                seeds.push(grad);
            }
        }
        Ok((roots, seeds))
    }

    fn accumulate(&self, grads: &GradStore<R>) -> Result<()> {
        self.with_partition(|p| {
            let params = p.module.parameters();
            let Some((_, first)) = params.first() else {
                return Ok(());
            };
            let client = R::default_client(first.device());
            let ids: Vec<TensorId> = params.iter().map(|(id, _)| *id).collect();
            p.grads.accumulate(&client, &ids, grads)
        })
    }

    // ── remote surface ──────────────────────────────────────────────────

    /// Inject microbatch inputs on an entry stage.
    ///
    /// In DAG mode the inputs are also published as an INPUT relay for the other
    /// stages that read the model input.
    pub fn set_input(
        &self,
        microbatch_id: usize,
        batch_id: u64,
        args: Vec<Tensor<R>>,
        kwargs: BTreeMap<String, Tensor<R>>,
        forward_only: bool,
    ) -> Result<()> {
        let topology = self.wait_topology()?;
        let inline = match &topology.dag {
            None => WorkArgs::Inline { args, kwargs },
            Some(dag) => {
                let ordered = model_arguments(dag, args, kwargs)?;
                if !topology.input_consumers.is_empty() {
                    self.publish_input(&topology, microbatch_id, batch_id, forward_only, &ordered)?;
                }
                WorkArgs::Inline {
                    args: ordered,
                    kwargs: BTreeMap::new(),
                }
            }
        };
        self.enqueue(self.new_item(
            Phase::Forward,
            microbatch_id,
            batch_id,
            forward_only,
            inline,
        ))
    }

    fn publish_input(
        &self,
        topology: &Topology,
        microbatch_id: usize,
        batch_id: u64,
        forward_only: bool,
        ordered: &[Tensor<R>],
    ) -> Result<()> {
        let mut relay = self.new_item(
            Phase::Input,
            microbatch_id,
            batch_id,
            forward_only,
            WorkArgs::Empty,
        );
        relay.output = RpcFuture::ready(Payload::Activations(ordered.to_vec()), &self.token);
        relay.expected_readers = topology.input_consumers.len();
        self.output_list.update(|published| {
            published.insert(relay.key(), relay);
        });
        for &consumer in &topology.input_consumers {
            let peer = self.peer(consumer)?;
            rpc::notify(
                format!("pipr-input-{}-{consumer}", self.rank),
                &self.token,
                move || peer.subscribe_producer(microbatch_id, batch_id, forward_only),
            );
        }
        Ok(())
    }

    pub fn set_labels(&self, microbatch_id: usize, labels: Tensor<R>) {
        self.labels.update(|m| {
            m.insert(microbatch_id, labels);
        });
    }

    fn first_subscription(&self, batch_id: u64, microbatch_id: usize, phase: Phase) -> bool {
        let admitted = self
            .subscribed
            .update(|subs| subs.admit(batch_id, microbatch_id, phase));
        if !admitted {
            debug!(stage = self.rank, batch = batch_id, microbatch_id, %phase, "subscription ignored");
        }
        admitted
    }

    fn fetch(&self, peer: Arc<StageWorker<R>>, key: UniqueKey) -> RpcFuture<Payload<R>> {
        rpc::call_async(
            format!("pipr-fetch-{}-{}", self.rank, peer.rank),
            &self.token,
            move || peer.get_output_by_key(key),
        )
    }

    /// Called by a producer before it computes forward `microbatch_id`.
    pub fn subscribe_producer(&self, microbatch_id: usize, batch_id: u64, forward_only: bool) -> Result<()> {
        if !self.first_subscription(batch_id, microbatch_id, Phase::Forward) {
            return Ok(());
        }
        let topology = self.wait_topology()?;
        let mut futures = Vec::with_capacity(topology.producers.len() + 1);
        if topology.needs_model_input() {
            futures.push(self.fetch(self.peer(0)?, UniqueKey::input(microbatch_id)));
        }
        for &producer in &topology.producers {
            futures.push(self.fetch(self.peer(producer)?, UniqueKey::forward(microbatch_id)));
        }
        self.enqueue(self.new_item(
            Phase::Forward,
            microbatch_id,
            batch_id,
            forward_only,
            WorkArgs::Subscribed(futures),
        ))
    }

    /// Called by a consumer before it computes backward `microbatch_id`.
    pub fn subscribe_consumer(&self, microbatch_id: usize, batch_id: u64) -> Result<()> {
        if !self.first_subscription(batch_id, microbatch_id, Phase::Backward) {
            return Ok(());
        }
        let topology = self.wait_topology()?;
        let futures = topology
            .consumers
            .iter()
            .map(|&consumer| Ok(self.fetch(self.peer(consumer)?, UniqueKey::backward(microbatch_id))))
            .collect::<Result<Vec<_>>>()?;
        self.enqueue(self.new_item(
            Phase::Backward,
            microbatch_id,
            batch_id,
            false,
            WorkArgs::Subscribed(futures),
        ))
    }

    /// Block until `key` is published and resolved, then count one read.
    ///
    /// The item is evicted when its read count reaches its expected readers.
    pub fn get_output_by_key(&self, key: UniqueKey) -> Result<Payload<R>> {
        let future = {
            let published = self.output_list.wait_until(|m| m.contains_key(&key))?;
            match published.get(&key) {
                Some(item) => item.output.clone(),
                None => {
                    return Err(Error::Invariant {
                        reason: format!("{key} vanished from the output list"),
                    });
                }
            }
        };
        let payload = future.wait()?;
        self.output_list.update(|published| {
            let evict = match published.get_mut(&key) {
                Some(item) if item.output.ptr_eq(&future) => {
                    item.refcount += 1;
                    item.refcount >= item.expected_readers
                }
                _ => false,
            };
            if evict {
                published.remove(&key);
            }
        });
        Ok(payload)
    }

    /// Apply the optimizer to accumulated gradients and clear them.
    ///
    /// Stages without parameters or gradients only clear.
    pub fn step(&self) -> Result<()> {
        let stepped = self.with_partition(|p| {
            let optimizer = p.optimizer.as_mut().ok_or_else(|| Error::TrainingError {
                reason: format!("stage {}: optimizer not initialized", self.rank),
            })?;
            let params = p.module.parameters();
            let stepped = !params.is_empty() && !p.grads.is_empty();
            if let (true, Some((_, first))) = (stepped, params.first()) {
                let client = R::default_client(first.device());
                let mut values: HashMap<TensorId, Tensor<R>> = params.iter().cloned().collect();
                optimizer.step(&client, &mut values, p.grads.grads())?;
                p.module.update_parameters(&values)?;
            }
            p.grads.clear();
            Ok(stepped)
        })?;
        if stepped {
            let steps = self.state.update(|st| {
                st.steps += 1;
                st.steps
            });
            info!(stage = self.rank, steps, "optimizer step");
        }
        Ok(())
    }

    /// Block until this stage has completed `batches` batches.
    pub fn wait_for_batch(&self, batches: u64) -> Result<()> {
        self.completed_batches.wait_until(|&n| n >= batches)?;
        Ok(())
    }

    pub fn get_parameters(&self) -> Result<Vec<Tensor<R>>> {
        self.with_partition(|p| Ok(p.module.parameters().into_iter().map(|(_, t)| t).collect()))
    }

    pub fn get_parameter_gradients(&self) -> Result<Vec<Option<Tensor<R>>>> {
        self.with_partition(|p| {
            Ok(p.module
                .parameters()
                .iter()
                .map(|(id, _)| p.grads.get(*id).cloned())
                .collect())
        })
    }

    pub fn get_partition_state_dict(&self) -> Result<BTreeMap<String, Tensor<R>>> {
        self.with_partition(|p| Ok(p.module.state_dict()))
    }

    pub fn load_partition_state_dict(&self, state: &BTreeMap<String, Tensor<R>>) -> Result<()> {
        self.with_partition(|p| p.module.load_state_dict(state))
    }

    pub fn stats(&self) -> StageStats {
        let (counters, forwards, backwards, triggers, steps, order) = {
            let st = self.state.lock();
            (
                st.counters,
                st.forwards,
                st.backwards,
                st.backward_triggers,
                st.steps,
                st.last_batch_order.clone(),
            )
        };
        StageStats {
            rank: self.rank,
            forward_times: counters.forward_times,
            backward_times: counters.backward_times,
            outstanding: counters.outstanding,
            total_forwards: forwards,
            total_backwards: backwards,
            backward_triggers: triggers,
            optimizer_steps: steps,
            completed_batches: *self.completed_batches.lock(),
            pending: self.work_list.lock().len(),
            published: self.output_list.lock().len(),
            cached: self.cache.lock().len(),
            labels: self.labels.lock().len(),
            last_batch_order: order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::topology::{MODEL_INPUT, MODEL_OUTPUT, PartitionGraph, PartitionNode};
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    /// Returns its inputs unchanged; no parameters.
    struct Passthrough {
        graph: Option<PartitionGraph>,
    }

    impl StageModule<CpuRuntime> for Passthrough {
        fn forward(
            &mut self,
            args: &[Var<CpuRuntime>],
            _kwargs: &BTreeMap<String, Var<CpuRuntime>>,
        ) -> Result<Vec<Var<CpuRuntime>>> {
            Ok(args.to_vec())
        }

        fn parameters(&self) -> Vec<(TensorId, Tensor<CpuRuntime>)> {
            Vec::new()
        }

        fn update_parameters(&mut self, _: &HashMap<TensorId, Tensor<CpuRuntime>>) -> Result<()> {
            Ok(())
        }

        fn state_dict(&self) -> BTreeMap<String, Tensor<CpuRuntime>> {
            BTreeMap::new()
        }

        fn load_state_dict(&mut self, _: &BTreeMap<String, Tensor<CpuRuntime>>) -> Result<()> {
            Ok(())
        }

        fn partition_graph(&self) -> Option<&PartitionGraph> {
            self.graph.as_ref()
        }
    }

    fn worker(rank: usize, num_stages: usize, token: &CancelToken) -> Arc<StageWorker<CpuRuntime>> {
        let w = StageWorker::new(
            WorkerSpec {
                rank,
                num_stages,
                num_microbatches: 2,
                checkpoint: false,
                schedule: ScheduleKind::FillDrain,
                options: EngineOptions::default(),
            },
            token,
        );
        let build: PartitionFn<CpuRuntime> =
            Arc::new(|_| Ok(Box::new(Passthrough { graph: None }) as Box<dyn StageModule<CpuRuntime>>));
        w.build_partition(
            &build,
            PartitionArgs {
                partition_id: rank,
                chunk: 1,
                num_stages,
            },
        )
        .unwrap();
        w
    }

    fn tensor(data: &[f32]) -> Tensor<CpuRuntime> {
        let (_client, device) = cpu_setup();
        Tensor::<CpuRuntime>::from_slice(data, &[data.len()], &device)
    }

    #[test]
    fn test_topology_resolves_once() {
        let token = CancelToken::new();
        let w = worker(0, 2, &token);
        w.resolve_topology().unwrap();
        assert!(matches!(
            w.resolve_topology(),
            Err(Error::TopologyAlreadyResolved { stage: 0 })
        ));
    }

    #[test]
    fn test_peers_sync_once() {
        let token = CancelToken::new();
        let a = worker(0, 2, &token);
        let b = worker(1, 2, &token);
        let peers = vec![Arc::downgrade(&a), Arc::downgrade(&b)];
        a.sync_peers(peers.clone()).unwrap();
        assert!(matches!(
            a.sync_peers(peers),
            Err(Error::PeersAlreadySynced { stage: 0 })
        ));
    }

    #[test]
    fn test_output_evicted_after_expected_readers() {
        let token = CancelToken::new();
        let w = worker(0, 1, &token);
        let key = UniqueKey::forward(0);
        let mut item = w.new_item(Phase::Forward, 0, 0, true, WorkArgs::Empty);
        item.output = RpcFuture::ready(Payload::Activations(vec![tensor(&[1.0])]), &token);
        item.expected_readers = 2;
        w.output_list.update(|m| m.insert(key, item));

        w.get_output_by_key(key).unwrap();
        assert_eq!(w.stats().published, 1);
        let payload = w.get_output_by_key(key).unwrap();
        assert!(matches!(payload, Payload::Activations(ref t) if t.len() == 1));
        assert_eq!(w.stats().published, 0);
    }

    #[test]
    fn test_get_output_waits_for_publication() {
        let token = CancelToken::new();
        let w = worker(0, 1, &token);
        let key = UniqueKey::backward(1);

        let reader = Arc::clone(&w);
        let handle = thread::spawn(move || reader.get_output_by_key(key));

        let mut item = w.new_item(Phase::Backward, 1, 0, false, WorkArgs::Empty);
        item.expected_readers = 1;
        let output = item.output.clone();
        w.output_list.update(|m| m.insert(key, item));
        output.set(Payload::Gradients(vec![None])).unwrap();

        let payload = handle.join().unwrap().unwrap();
        assert!(matches!(payload, Payload::Gradients(ref g) if g.len() == 1));
        assert_eq!(w.stats().published, 0);
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let token = CancelToken::new();
        let w = worker(0, 1, &token);
        let reader = Arc::clone(&w);
        let handle = thread::spawn(move || reader.get_output_by_key(UniqueKey::forward(7)));
        token.cancel("shutdown");
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_failed_item_cancels_pipeline() {
        let token = CancelToken::new();
        let w = worker(0, 1, &token);
        // A forward item with no inputs cannot run.
        let item = w.new_item(Phase::Forward, 0, 0, true, WorkArgs::Empty);
        let output = item.output.clone();
        w.work_list.update(|m| m.insert(UniqueKey::forward(0), item));
        let handle = w.spawn().unwrap();
        handle.join().unwrap();
        assert!(token.is_cancelled());
        assert!(matches!(output.wait(), Err(Error::Remote { .. })));
    }

    #[test]
    fn test_duplicate_subscription_ignored() {
        let token = CancelToken::new();
        let a = worker(0, 2, &token);
        let b = worker(1, 2, &token);
        let peers = vec![Arc::downgrade(&a), Arc::downgrade(&b)];
        a.sync_peers(peers.clone()).unwrap();
        b.sync_peers(peers).unwrap();
        b.resolve_topology().unwrap();

        b.subscribe_producer(0, 0, true).unwrap();
        b.subscribe_producer(0, 0, true).unwrap();
        assert_eq!(b.stats().pending, 1);
        token.cancel("done");
    }

    #[test]
    fn test_notification_after_batch_end_ignored() {
        let token = CancelToken::new();
        let a = worker(0, 2, &token);
        let b = worker(1, 2, &token);
        let peers = vec![Arc::downgrade(&a), Arc::downgrade(&b)];
        a.sync_peers(peers.clone()).unwrap();
        b.sync_peers(peers).unwrap();
        b.resolve_topology().unwrap();

        b.finish_batch(1, true).unwrap();
        b.subscribe_producer(0, 1, true).unwrap();
        b.subscribe_producer(0, 0, true).unwrap();
        b.subscribe_consumer(0, 1).unwrap();
        assert_eq!(b.stats().pending, 0);

        // the next batch is still admitted
        b.subscribe_producer(0, 2, true).unwrap();
        assert_eq!(b.stats().pending, 1);
        token.cancel("done");
    }

    #[test]
    fn test_model_arguments_by_name() {
        let graph = PartitionGraph::new()
            .with_model_input("x", &["submod_0"])
            .with_model_input("mask", &["submod_0"])
            .with_partition(
                "submod_0",
                PartitionNode::new(1)
                    .input(MODEL_INPUT, [0, 1])
                    .output(MODEL_OUTPUT, [0]),
            );
        let topology = Topology::resolve(0, 1, Some(&graph)).unwrap();
        let dag = topology.dag.as_ref().unwrap();

        let kwargs = BTreeMap::from([("mask".to_string(), tensor(&[0.0]))]);
        let ordered = model_arguments(dag, vec![tensor(&[1.0])], kwargs).unwrap();
        assert_eq!(ordered[0].to_vec::<f32>(), vec![1.0]);
        assert_eq!(ordered[1].to_vec::<f32>(), vec![0.0]);

        let unknown = BTreeMap::from([
            ("mask".to_string(), tensor(&[0.0])),
            ("extra".to_string(), tensor(&[0.0])),
        ]);
        assert!(model_arguments(dag, vec![tensor(&[1.0])], unknown).is_err());
        assert!(model_arguments(dag, vec![tensor(&[1.0])], BTreeMap::new()).is_err());
    }

    #[test]
    fn test_place_respects_offsets() {
        let route = InputRoute {
            source: Some(1),
            pick: Some(vec![1, 0]),
            target: vec![0, 2],
        };
        let mut slots = empty_slots::<CpuRuntime>(3);
        place(&mut slots, &route, &[tensor(&[10.0]), tensor(&[20.0])]).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().to_vec::<f32>(), vec![20.0]);
        assert!(slots[1].is_none());
        assert_eq!(slots[2].as_ref().unwrap().to_vec::<f32>(), vec![10.0]);
        assert!(filled(slots).is_err());
    }

    #[test]
    fn test_scalar_of_reads_loss_dtype() {
        let (_client, device) = cpu_setup();
        let f32_loss = Var::new(tensor(&[1.5]), false);
        assert_eq!(scalar_of(&f32_loss).unwrap(), 1.5);

        let f64_loss = Var::new(Tensor::<CpuRuntime>::from_slice(&[2.25f64], &[1], &device), false);
        assert_eq!(scalar_of(&f64_loss).unwrap(), 2.25);

        let int_loss = Var::new(Tensor::<CpuRuntime>::from_slice(&[3i32], &[1], &device), false);
        assert!(matches!(
            scalar_of(&int_loss),
            Err(Error::InvalidArgument { arg: "criterion", .. })
        ));
    }

    #[test]
    fn test_last_stage_forward_counts_consumers_and_engine() {
        let token = CancelToken::new();
        let w = worker(1, 2, &token);
        let linear = Topology::linear(1, 2);
        assert_eq!(w.expected_readers(&linear, UniqueKey::forward(0)), 1);

        let mut feeding = Topology::linear(1, 2);
        feeding.consumers = vec![0];
        assert_eq!(w.expected_readers(&feeding, UniqueKey::forward(0)), 2);
        token.cancel("done");
    }
}
