//! Pipeline orchestrator.
//!
//! Owns one [`StageWorker`] per (virtual) stage, feeds microbatches to the entry
//! stage, collects terminal outputs and drives the per-batch optimizer step.

use super::batch::{Batch, microbatch_bounds};
use super::schedule::ScheduleKind;
use super::stage::{EngineOptions, PartitionArgs, PartitionFn};
use super::work_item::{OutputValue, Payload, UniqueKey};
use super::worker::{StageStats, StageWorker, WorkerSpec};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::optimizer::OptimizerKind;
use crate::rpc::{self, CancelToken, RpcFuture};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Terminal results of one `forward_backward` call.
///
/// For each exit rank: one `Vec` per output position, each holding one value per
/// microbatch. A stage with a criterion reports `[loss, metric]`.
#[derive(Debug)]
pub struct ForwardOutput<R: Runtime> {
    pub outputs: BTreeMap<usize, Vec<Vec<OutputValue<R>>>>,
}

impl<R: Runtime> ForwardOutput<R> {
    fn transpose(per_microbatch: BTreeMap<usize, Vec<Vec<OutputValue<R>>>>) -> Result<Self> {
        let mut outputs = BTreeMap::new();
        for (rank, microbatches) in per_microbatch {
            let width = microbatches.first().map_or(0, Vec::len);
            let mut positions: Vec<Vec<OutputValue<R>>> = (0..width)
                .map(|_| Vec::with_capacity(microbatches.len()))
                .collect();
            for (id, values) in microbatches.into_iter().enumerate() {
                if values.len() != width {
                    return Err(Error::Invariant {
                        reason: format!(
                            "stage {rank}: microbatch {id} returned {} values, expected {width}",
                            values.len()
                        ),
                    });
                }
                for (position, value) in positions.iter_mut().zip(values) {
                    position.push(value);
                }
            }
            outputs.insert(rank, positions);
        }
        Ok(Self { outputs })
    }

    pub fn stage(&self, rank: usize) -> Option<&[Vec<OutputValue<R>>]> {
        self.outputs.get(&rank).map(Vec::as_slice)
    }

    fn scalars_at(&self, position: usize) -> Vec<f64> {
        self.outputs
            .values()
            .next_back()
            .and_then(|positions| positions.get(position))
            .map(|values| values.iter().filter_map(OutputValue::as_scalar).collect())
            .unwrap_or_default()
    }

    /// Per-microbatch losses of the last exit stage; empty without a criterion.
    pub fn losses(&self) -> Vec<f64> {
        self.scalars_at(0)
    }

    pub fn metrics(&self) -> Vec<f64> {
        self.scalars_at(1)
    }

    pub fn mean_loss(&self) -> Option<f64> {
        let losses = self.losses();
        if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f64>() / losses.len() as f64)
        }
    }
}

/// Pipeline-parallel training engine.
///
/// ```ignore
/// let config = PipelineConfig::new(4, 8).with_schedule(ScheduleKind::OneFOneB);
/// let options = EngineOptions::default().with_criterion(mse_criterion());
/// let mut engine = PipelineEngine::new(config, partition_fn, options)?;
/// engine.initialize_optimizer(OptimizerKind::Sgd(SgdConfig::default()))?;
/// let out = engine.forward_backward(&inputs, Some(&labels), false)?;
/// println!("loss {:?}", out.mean_loss());
/// ```
pub struct PipelineEngine<R: Runtime> {
    config: PipelineConfig,
    options: EngineOptions<R>,
    token: CancelToken,
    workers: Vec<Arc<StageWorker<R>>>,
    handles: Vec<JoinHandle<()>>,
    batches: u64,
}

impl<R> PipelineEngine<R>
where
    R: Runtime<DType = DType>,
    R::Client: RuntimeClient<R>
        + TensorOps<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ReduceOps<R>
        + ScalarOps<R>,
{
    pub fn new(
        config: PipelineConfig,
        partition_fn: PartitionFn<R>,
        options: EngineOptions<R>,
    ) -> Result<Self> {
        config.validate()?;
        let num_stages = config.total_stages();
        let token = CancelToken::new();

        let workers: Vec<Arc<StageWorker<R>>> = (0..num_stages)
            .map(|rank| {
                StageWorker::new(
                    WorkerSpec {
                        rank,
                        num_stages,
                        num_microbatches: config.num_microbatches,
                        checkpoint: config.checkpoint,
                        schedule: config.schedule,
                        options: options.clone(),
                    },
                    &token,
                )
            })
            .collect();

        let peers: Vec<_> = workers.iter().map(Arc::downgrade).collect();
        for worker in &workers {
            worker.sync_peers(peers.clone())?;
        }

        let builds: Vec<RpcFuture<()>> = workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                let partition_fn = Arc::clone(&partition_fn);
                let args = PartitionArgs {
                    partition_id: worker.rank(),
                    chunk: config.chunk,
                    num_stages,
                };
                rpc::call_async(
                    format!("pipr-build-{}", worker.rank()),
                    &token,
                    move || worker.build_partition(&partition_fn, args),
                )
            })
            .collect();
        for build in &builds {
            build.wait()?;
        }

        if let Some(kind) = &config.optimizer {
            for worker in &workers {
                worker.initialize_optimizer(kind)?;
            }
        }

        let mut engine = Self {
            config,
            options,
            token,
            workers,
            handles: Vec::with_capacity(num_stages),
            batches: 0,
        };
        for worker in &engine.workers {
            match worker.spawn() {
                Ok(handle) => engine.handles.push(handle),
                Err(e) => {
                    engine.shutdown();
                    return Err(e);
                }
            }
        }
        info!(
            stages = num_stages,
            microbatches = engine.config.num_microbatches,
            schedule = engine.config.schedule.policy().name(),
            checkpoint = engine.config.checkpoint,
            "pipeline started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn num_stages(&self) -> usize {
        self.workers.len()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    fn input_ranks(&self) -> Vec<usize> {
        vec![0]
    }

    fn output_ranks(&self) -> Vec<usize> {
        vec![self.workers.len() - 1]
    }

    /// Run one batch through the pipeline.
    ///
    /// `labels` are required when a criterion is configured. With `forward_only`
    /// no backward runs and no optimizer step is taken.
    pub fn forward_backward(
        &mut self,
        batch: &Batch<R>,
        labels: Option<&Batch<R>>,
        forward_only: bool,
    ) -> Result<ForwardOutput<R>> {
        if self.token.is_cancelled() {
            return Err(self.token.error());
        }
        let batch_len = batch.batch_len()?;
        let labels = match (&self.options.criterion, labels) {
            (Some(_), None) => {
                return Err(Error::InvalidArgument {
                    arg: "labels",
                    reason: "a criterion is configured but no labels were given".to_string(),
                });
            }
            (Some(_), Some(labels)) => {
                let label_len = labels.batch_len()?;
                if label_len != batch_len {
                    return Err(Error::InvalidBatch {
                        reason: format!("{label_len} labels for a batch of {batch_len}"),
                    });
                }
                Some(labels)
            }
            (None, Some(_)) => {
                warn!("labels ignored: no criterion configured");
                None
            }
            (None, None) => None,
        };
        let bounds = microbatch_bounds(batch_len, self.config.num_microbatches)?;

        let batch_id = self.batches;
        self.batches += 1;
        debug!(batch = batch_id, rows = batch_len, forward_only, "forward_backward");

        let result = self.run_batch(batch_id, batch, labels, &bounds, forward_only);
        if let Err(e) = &result {
            if !e.is_cancelled() {
                self.token.cancel(format!("batch {batch_id}: {e}"));
            }
        }
        result
    }

    fn run_batch(
        &self,
        batch_id: u64,
        batch: &Batch<R>,
        labels: Option<&Batch<R>>,
        bounds: &[std::ops::Range<usize>],
        forward_only: bool,
    ) -> Result<ForwardOutput<R>> {
        let num_stages = self.workers.len();
        let input_ranks = self.input_ranks();
        let output_ranks = self.output_ranks();
        let one_f_one_b = !forward_only && self.config.schedule == ScheduleKind::OneFOneB;

        let mut ret_futures: Vec<Vec<(usize, RpcFuture<Payload<R>>)>> = Vec::with_capacity(bounds.len());
        for (id, range) in bounds.iter().enumerate() {
            if id >= num_stages {
                let earlier = id - num_stages;
                if one_f_one_b {
                    for &rank in &input_ranks {
                        let worker = Arc::clone(&self.workers[rank]);
                        rpc::call_sync(format!("pipr-window-{rank}"), &self.token, move || {
                            worker.get_output_by_key(UniqueKey::backward(earlier))
                        })?;
                    }
                } else {
                    for (_, future) in &ret_futures[earlier] {
                        future.wait()?;
                    }
                }
            }

            let (args, kwargs) = batch.slice(range.start, range.end)?.into_args_kwargs()?;
            for &rank in &input_ranks {
                self.workers[rank].set_input(id, batch_id, args.clone(), kwargs.clone(), forward_only)?;
            }
            if let Some(labels) = labels {
                let target: Tensor<R> = labels.slice(range.start, range.end)?.into_tensor()?;
                for &rank in &output_ranks {
                    self.workers[rank].set_labels(id, target.clone());
                }
            }

            let outputs = output_ranks
                .iter()
                .map(|&rank| {
                    let worker = Arc::clone(&self.workers[rank]);
                    let future = rpc::call_async(format!("pipr-output-{rank}"), &self.token, move || {
                        worker.get_output_by_key(UniqueKey::forward(id))
                    });
                    (rank, future)
                })
                .collect();
            ret_futures.push(outputs);
        }

        if !forward_only {
            let last = bounds.len() - 1;
            for &rank in &input_ranks {
                let worker = Arc::clone(&self.workers[rank]);
                rpc::call_sync(format!("pipr-drain-{rank}"), &self.token, move || {
                    worker.get_output_by_key(UniqueKey::backward(last))
                })?;
            }
        }

        let mut per_microbatch: BTreeMap<usize, Vec<Vec<OutputValue<R>>>> = BTreeMap::new();
        for outputs in &ret_futures {
            for (rank, future) in outputs {
                per_microbatch
                    .entry(*rank)
                    .or_default()
                    .push(future.wait()?.into_values());
            }
        }

        // Every stage finishes its batch, including its optimizer step, before returning.
        for worker in &self.workers {
            worker.wait_for_batch(batch_id + 1)?;
        }
        ForwardOutput::transpose(per_microbatch)
    }

    /// Install an optimizer on every stage, replacing any existing one.
    pub fn initialize_optimizer(&mut self, kind: OptimizerKind) -> Result<()> {
        let lr = kind.lr();
        if !lr.is_finite() || lr < 0.0 {
            return Err(Error::InvalidArgument {
                arg: "lr",
                reason: format!("must be finite and >= 0, got {lr}"),
            });
        }
        for worker in &self.workers {
            worker.initialize_optimizer(&kind)?;
        }
        info!(optimizer = kind.name(), lr, "optimizer initialized");
        self.config.optimizer = Some(kind);
        Ok(())
    }

    /// Apply accumulated gradients on every stage.
    pub fn step(&self) -> Result<()> {
        for worker in &self.workers {
            worker.step()?;
        }
        Ok(())
    }

    pub fn remote_parameters(&self) -> Result<BTreeMap<usize, Vec<Tensor<R>>>> {
        self.workers
            .iter()
            .map(|w| Ok((w.rank(), w.get_parameters()?)))
            .collect()
    }

    pub fn remote_grad(&self) -> Result<BTreeMap<usize, Vec<Option<Tensor<R>>>>> {
        self.workers
            .iter()
            .map(|w| Ok((w.rank(), w.get_parameter_gradients()?)))
            .collect()
    }

    pub fn state_dicts(&self) -> Result<BTreeMap<usize, BTreeMap<String, Tensor<R>>>> {
        self.workers
            .iter()
            .map(|w| Ok((w.rank(), w.get_partition_state_dict()?)))
            .collect()
    }

    pub fn load_state_dicts(&self, states: &BTreeMap<usize, BTreeMap<String, Tensor<R>>>) -> Result<()> {
        for (&rank, state) in states {
            let worker = self.workers.get(rank).ok_or_else(|| Error::InvalidArgument {
                arg: "states",
                reason: format!("no stage {rank} in a {}-stage pipeline", self.workers.len()),
            })?;
            worker.load_partition_state_dict(state)?;
        }
        Ok(())
    }

    pub fn stage_stats(&self) -> Vec<StageStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }

    /// Abort every blocked wait in the pipeline. Returns false if already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.token.cancel(reason)
    }
}

impl<R: Runtime> PipelineEngine<R> {
    /// Cancel the pipeline and join the stage threads.
    pub fn shutdown(&mut self) {
        self.token.cancel("pipeline shut down");
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("stage thread panicked");
            }
        }
    }
}

impl<R: Runtime> Drop for PipelineEngine<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::CpuRuntime;

    fn scalars(values: &[f64]) -> Vec<OutputValue<CpuRuntime>> {
        values.iter().map(|&v| OutputValue::Scalar(v)).collect()
    }

    #[test]
    fn test_transpose_groups_by_position() {
        let per_microbatch = BTreeMap::from([(
            3,
            vec![scalars(&[1.0, 10.0]), scalars(&[2.0, 20.0]), scalars(&[3.0, 30.0])],
        )]);
        let out = ForwardOutput::transpose(per_microbatch).unwrap();
        let positions = out.stage(3).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(out.losses(), vec![1.0, 2.0, 3.0]);
        assert_eq!(out.metrics(), vec![10.0, 20.0, 30.0]);
        assert_eq!(out.mean_loss(), Some(2.0));
    }

    #[test]
    fn test_transpose_rejects_ragged() {
        let per_microbatch = BTreeMap::from([(0, vec![scalars(&[1.0]), scalars(&[1.0, 2.0])])]);
        assert!(ForwardOutput::transpose(per_microbatch).is_err());
    }

    #[test]
    fn test_absent_metric_skipped() {
        let per_microbatch = BTreeMap::from([(
            1,
            vec![
                vec![OutputValue::Scalar(0.5), OutputValue::Absent],
                vec![OutputValue::Scalar(1.5), OutputValue::Absent],
            ],
        )]);
        let out = ForwardOutput::<CpuRuntime>::transpose(per_microbatch).unwrap();
        assert!(out.metrics().is_empty());
        assert_eq!(out.mean_loss(), Some(1.0));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let build: PartitionFn<CpuRuntime> = Arc::new(|_| {
            Err(Error::InvalidArgument {
                arg: "partition",
                reason: "never built".to_string(),
            })
        });
        let result = PipelineEngine::new(PipelineConfig::new(0, 2), build, EngineOptions::default());
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_partition_failure_surfaces() {
        let build: PartitionFn<CpuRuntime> = Arc::new(|args| {
            Err(Error::InvalidArgument {
                arg: "partition",
                reason: format!("cannot build {}", args.partition_id),
            })
        });
        let result = PipelineEngine::new(PipelineConfig::new(2, 2), build, EngineOptions::default());
        assert!(matches!(result, Err(Error::Remote { .. })));
    }
}
