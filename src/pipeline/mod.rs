//! Pipeline-parallel execution: work items, topology, stage workers and the engine.
//!
//! ```text
//!  PipelineEngine ──set_input──► stage 0 ──► stage 1 ──► … ──► stage S-1 ──► loss
//!        ▲                          ◄── gradients ───────────────┘
//!        └──── get_output_by_key (terminal outputs, backward window) ────
//! ```

pub mod backward_cache;
pub mod batch;
pub mod engine;
pub mod schedule;
pub mod stage;
pub mod topology;
pub mod work_item;
pub mod worker;

pub use backward_cache::{BackwardCache, BackwardCacheStore};
pub use batch::{Batch, microbatch_bounds};
pub use engine::{ForwardOutput, PipelineEngine};
pub use schedule::{FillDrain, OneFOneB, ScheduleKind, SchedulePolicy, StageCounters, StagePosition};
pub use stage::{
    Criterion, DataProcessFn, EngineOptions, Metric, PartitionArgs, PartitionFn, StageArgs,
    StageModule, StepHook,
};
pub use topology::{
    DagRouting, Edge, GradRoute, InputRoute, MODEL_INPUT, MODEL_OUTPUT, ModelInput, PartitionGraph,
    PartitionNode, Topology, partition_name, partition_rank,
};
pub use work_item::{OutputValue, Payload, Phase, UniqueKey, WorkArgs, WorkItem};
pub use worker::{StageStats, StageWorker, WorkerSpec};
