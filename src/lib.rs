//! # pipr
//!
//! **Pipeline-parallel training runtime built on numr.**
//!
//! A model is cut into partitions, one per stage. Each stage runs on its own
//! thread with its own scheduling loop; stages exchange activations and
//! gradients through futures on each other's published outputs. The engine
//! splits every batch into microbatches, keeps the pipeline window bounded and
//! runs the optimizer step once all microbatch gradients have accumulated.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ PipelineEngine   forward_backward / step / state dicts   │
//! ├──────────────────────────────────────────────────────────┤
//! │ StageWorker × S  schedule (fill-drain, 1F1B), checkpoint │
//! ├──────────────────────────────────────────────────────────┤
//! │ rpc              Monitor, RpcFuture, CancelToken         │
//! ├──────────────────────────────────────────────────────────┤
//! │ numr             tensors, autograd, runtime              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - Linear chains need nothing beyond a [`StageModule`] per rank; a
//!   [`PartitionGraph`] on the module switches the stage to DAG routing.
//! - [`PipelineConfig`] is plain data and loads from YAML or JSON; closures
//!   (criterion, metric, hooks) go in [`EngineOptions`].
//! - Every blocking wait observes the pipeline's [`CancelToken`], so a failing
//!   stage fails the whole pipeline instead of hanging it.

pub mod autograd;
pub mod config;
pub mod error;
pub mod nn;
pub mod optimizer;
pub mod pipeline;
pub mod rpc;

pub use autograd::{Differentiator, NumrAutograd};
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use optimizer::{AdamWConfig, OptimizerKind, SgdConfig};
pub use pipeline::{
    Batch, EngineOptions, ForwardOutput, OutputValue, PartitionArgs, PartitionFn, PartitionGraph,
    PartitionNode, PipelineEngine, ScheduleKind, StageArgs, StageModule, StageStats,
};
pub use rpc::{CancelToken, Monitor, RpcFuture};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
