//! Per-stage optimizers.
//!
//! The orchestrator picks the update rule with a serializable [`OptimizerKind`];
//! each stage builds its own [`StageOptimizer`] over its local parameters.

pub mod adamw;
pub mod grad_buffer;
pub mod sgd;
pub mod traits;

pub use adamw::{AdamW, AdamWConfig};
pub use grad_buffer::GradBuffer;
pub use sgd::{Sgd, SgdConfig};
pub use traits::Optimizer;

use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Optimizer selection, e.g. `{ kind: adamw, lr: 0.001 }` in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd(SgdConfig),
    #[serde(rename = "adamw")]
    AdamW(AdamWConfig),
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Sgd(SgdConfig::default())
    }
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd(_) => "sgd",
            OptimizerKind::AdamW(_) => "adamw",
        }
    }

    pub fn lr(&self) -> f64 {
        match self {
            OptimizerKind::Sgd(c) => c.lr,
            OptimizerKind::AdamW(c) => c.lr,
        }
    }

    pub fn build<R: Runtime<DType = DType>>(&self) -> StageOptimizer<R> {
        match self {
            OptimizerKind::Sgd(c) => StageOptimizer::Sgd(Sgd::new(c.clone())),
            OptimizerKind::AdamW(c) => StageOptimizer::AdamW(AdamW::new(c.clone())),
        }
    }
}

/// Optimizer owned by one stage.
pub enum StageOptimizer<R: Runtime> {
    Sgd(Sgd<R>),
    AdamW(AdamW<R>),
}

impl<R: Runtime<DType = DType>> StageOptimizer<R> {
    pub fn name(&self) -> &'static str {
        match self {
            StageOptimizer::Sgd(_) => "sgd",
            StageOptimizer::AdamW(_) => "adamw",
        }
    }
}

impl<R: Runtime<DType = DType>> Optimizer<R> for StageOptimizer<R> {
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>,
    {
        match self {
            StageOptimizer::Sgd(opt) => opt.step(client, params, grads),
            StageOptimizer::AdamW(opt) => opt.step(client, params, grads),
        }
    }

    fn set_lr(&mut self, lr: f64) {
        match self {
            StageOptimizer::Sgd(opt) => opt.set_lr(lr),
            StageOptimizer::AdamW(opt) => opt.set_lr(lr),
        }
    }

    fn lr(&self) -> f64 {
        match self {
            StageOptimizer::Sgd(opt) => opt.lr(),
            StageOptimizer::AdamW(opt) => opt.lr(),
        }
    }

    fn reset(&mut self) {
        match self {
            StageOptimizer::Sgd(opt) => opt.reset(),
            StageOptimizer::AdamW(opt) => opt.reset(),
        }
    }
}
