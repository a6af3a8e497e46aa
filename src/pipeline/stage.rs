//! What a pipeline stage runs, and the hooks the pipeline calls around it.
//!
//! - [`StageModule`]: one partition of the model, owned by one stage worker.
//! - [`PartitionFn`]: builds the module for a rank.
//! - [`EngineOptions`]: criterion, metric, pre-step hook, input processing and the
//!   differentiation engine, shared by every stage.

use super::topology::PartitionGraph;
use crate::autograd::{Differentiator, NumrAutograd};
use crate::error::Result;
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One partition of the model.
///
/// The stage worker owns the module exclusively; every method runs on the stage
/// thread or under the stage's partition lock.
pub trait StageModule<R: Runtime>: Send {
    /// Run the partition. Outputs must be deterministic in the inputs, since a
    /// checkpointed stage recomputes them at backward time.
    fn forward(&mut self, args: &[Var<R>], kwargs: &BTreeMap<String, Var<R>>) -> Result<Vec<Var<R>>>;

    /// Trainable parameters in a stable order.
    fn parameters(&self) -> Vec<(TensorId, Tensor<R>)>;

    /// Replace parameter values by id, keeping the ids.
    fn update_parameters(&mut self, updated: &HashMap<TensorId, Tensor<R>>) -> Result<()>;

    fn state_dict(&self) -> BTreeMap<String, Tensor<R>>;

    fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor<R>>) -> Result<()>;

    /// Wiring of the whole model when partitions form a DAG; `None` means a linear chain.
    fn partition_graph(&self) -> Option<&PartitionGraph> {
        None
    }
}

/// Arguments handed to the [`PartitionFn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionArgs {
    /// Rank of the stage being built.
    pub partition_id: usize,
    /// Virtual stages per physical stage.
    pub chunk: usize,
    /// Total number of stages, including virtual ones.
    pub num_stages: usize,
}

/// Resolved inputs of a forward pass, before they are wrapped for autograd.
pub struct StageArgs<R: Runtime> {
    pub args: Vec<Tensor<R>>,
    pub kwargs: BTreeMap<String, Tensor<R>>,
}

impl<R: Runtime> StageArgs<R> {
    pub fn new(args: Vec<Tensor<R>>, kwargs: BTreeMap<String, Tensor<R>>) -> Self {
        Self { args, kwargs }
    }

    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type PartitionFn<R> =
    Arc<dyn Fn(PartitionArgs) -> Result<Box<dyn StageModule<R>>> + Send + Sync>;

/// Reduces terminal-stage outputs and labels to a scalar loss.
pub type Criterion<R> = Arc<dyn Fn(&[Var<R>], &Tensor<R>) -> Result<Var<R>> + Send + Sync>;

/// Reported alongside the loss; never differentiated.
pub type Metric<R> = Arc<dyn Fn(&[Var<R>], &Tensor<R>) -> Result<f64> + Send + Sync>;

/// Runs on each stage after its last backward of a batch, before the optimizer step.
pub type StepHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Rewrites a stage's resolved inputs; receives the stage rank.
pub type DataProcessFn<R> = Arc<dyn Fn(usize, StageArgs<R>) -> Result<StageArgs<R>> + Send + Sync>;

/// Hooks shared by every stage of a pipeline.
pub struct EngineOptions<R: Runtime> {
    pub criterion: Option<Criterion<R>>,
    pub metric: Option<Metric<R>>,
    pub pre_step_hook: Option<StepHook>,
    pub data_process: Option<DataProcessFn<R>>,
    pub differentiator: Arc<dyn Differentiator<R>>,
}

impl<R: Runtime> Clone for EngineOptions<R> {
    fn clone(&self) -> Self {
        Self {
            criterion: self.criterion.clone(),
            metric: self.metric.clone(),
            pre_step_hook: self.pre_step_hook.clone(),
            data_process: self.data_process.clone(),
            differentiator: Arc::clone(&self.differentiator),
        }
    }
}

impl<R> Default for EngineOptions<R>
where
    R: Runtime<DType = DType>,
    R::Client: RuntimeClient<R>
        + TensorOps<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ReduceOps<R>
        + ScalarOps<R>,
{
    fn default() -> Self {
        Self {
            criterion: None,
            metric: None,
            pre_step_hook: None,
            data_process: None,
            differentiator: Arc::new(NumrAutograd),
        }
    }
}

impl<R: Runtime> EngineOptions<R> {
    pub fn with_criterion(
        mut self,
        criterion: Criterion<R>,
    ) -> Self {
        self.criterion = Some(criterion);
        self
    }

    pub fn with_metric(
        mut self,
        metric: Metric<R>,
    ) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_pre_step_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.pre_step_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_data_process(
        mut self,
        f: impl Fn(usize, StageArgs<R>) -> Result<StageArgs<R>> + Send + Sync + 'static,
    ) -> Self {
        self.data_process = Some(Arc::new(f));
        self
    }

    pub fn with_differentiator(mut self, differentiator: Arc<dyn Differentiator<R>>) -> Self {
        self.differentiator = differentiator;
        self
    }
}
