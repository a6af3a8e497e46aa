//! Units of schedulable work.
//!
//! A [`WorkItem`] is one microbatch × [`Phase`] on one stage. It is created when its
//! inputs become available (injected by the orchestrator or subscribed from peers),
//! consumed once by the stage loop, and then kept in the stage's output map under
//! the same [`UniqueKey`] until every expected reader has fetched its result.

use crate::rpc::RpcFuture;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of work a [`WorkItem`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Forward,
    Backward,
    /// Relay of the raw model input for DAG stages that consume it directly.
    Input,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Forward => "FORWARD",
            Phase::Backward => "BACKWARD",
            Phase::Input => "INPUT",
        };
        f.write_str(name)
    }
}

/// Index into a stage's pending-work and published-output maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueKey {
    pub microbatch_id: usize,
    pub phase: Phase,
}

impl UniqueKey {
    pub fn new(microbatch_id: usize, phase: Phase) -> Self {
        Self {
            microbatch_id,
            phase,
        }
    }

    pub fn forward(microbatch_id: usize) -> Self {
        Self::new(microbatch_id, Phase::Forward)
    }

    pub fn backward(microbatch_id: usize) -> Self {
        Self::new(microbatch_id, Phase::Backward)
    }

    pub fn input(microbatch_id: usize) -> Self {
        Self::new(microbatch_id, Phase::Input)
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(microbatch_id={}, phase={})", self.microbatch_id, self.phase)
    }
}

/// Result published by a work item.
pub enum Payload<R: Runtime> {
    /// Forward outputs, or the raw model input for an INPUT relay.
    Activations(Vec<Tensor<R>>),
    /// Terminal-stage forward reduced by the criterion.
    Loss { loss: f64, metric: Option<f64> },
    /// Gradients w.r.t. the stage inputs, in the order the inputs were supplied.
    Gradients(Vec<Option<Tensor<R>>>),
}

impl<R: Runtime> Clone for Payload<R> {
    fn clone(&self) -> Self {
        match self {
            Payload::Activations(t) => Payload::Activations(t.clone()),
            Payload::Loss { loss, metric } => Payload::Loss {
                loss: *loss,
                metric: *metric,
            },
            Payload::Gradients(g) => Payload::Gradients(g.clone()),
        }
    }
}

impl<R: Runtime> Payload<R> {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Activations(_) => "activations",
            Payload::Loss { .. } => "loss",
            Payload::Gradients(_) => "gradients",
        }
    }

    /// Flatten into per-position values as returned to the orchestrator caller.
    pub fn into_values(self) -> Vec<OutputValue<R>> {
        match self {
            Payload::Activations(tensors) => tensors.into_iter().map(OutputValue::Tensor).collect(),
            Payload::Loss { loss, metric } => vec![
                OutputValue::Scalar(loss),
                metric.map_or(OutputValue::Absent, OutputValue::Scalar),
            ],
            Payload::Gradients(grads) => grads
                .into_iter()
                .map(|g| g.map_or(OutputValue::Absent, OutputValue::Tensor))
                .collect(),
        }
    }
}

impl<R: Runtime> fmt::Debug for Payload<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Activations(t) => write!(f, "Activations(len={})", t.len()),
            Payload::Loss { loss, metric } => {
                write!(f, "Loss(loss={loss}, metric={metric:?})")
            }
            Payload::Gradients(g) => write!(f, "Gradients(len={})", g.len()),
        }
    }
}

/// One position of an exit stage's per-microbatch result.
pub enum OutputValue<R: Runtime> {
    Tensor(Tensor<R>),
    Scalar(f64),
    Absent,
}

impl<R: Runtime> Clone for OutputValue<R> {
    fn clone(&self) -> Self {
        match self {
            OutputValue::Tensor(t) => OutputValue::Tensor(t.clone()),
            OutputValue::Scalar(v) => OutputValue::Scalar(*v),
            OutputValue::Absent => OutputValue::Absent,
        }
    }
}

impl<R: Runtime> OutputValue<R> {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            OutputValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor<R>> {
        match self {
            OutputValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl<R: Runtime> fmt::Debug for OutputValue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Tensor(t) => write!(f, "Tensor(shape={:?})", t.shape()),
            OutputValue::Scalar(v) => write!(f, "Scalar({v})"),
            OutputValue::Absent => f.write_str("Absent"),
        }
    }
}

/// Inputs of a work item, moved out when the item is consumed.
pub enum WorkArgs<R: Runtime> {
    Empty,
    /// Tensors injected directly by the orchestrator (entry stages).
    Inline {
        args: Vec<Tensor<R>>,
        kwargs: BTreeMap<String, Tensor<R>>,
    },
    /// One future per producer (forward) or consumer (backward).
    Subscribed(Vec<RpcFuture<Payload<R>>>),
}

impl<R: Runtime> Default for WorkArgs<R> {
    fn default() -> Self {
        WorkArgs::Empty
    }
}

/// The unit of schedulable work on a stage.
pub struct WorkItem<R: Runtime> {
    pub stage_id: usize,
    pub phase: Phase,
    pub args: WorkArgs<R>,
    pub output: RpcFuture<Payload<R>>,
    pub microbatch_id: usize,
    pub batch_id: u64,
    pub num_microbatches: usize,
    pub forward_only: bool,
    /// Reads served by `get_output_by_key` since publication.
    pub refcount: usize,
    /// Reads after which the published item is evicted.
    pub expected_readers: usize,
}

impl<R: Runtime> WorkItem<R> {
    pub fn key(&self) -> UniqueKey {
        UniqueKey::new(self.microbatch_id, self.phase)
    }
}

impl<R: Runtime> fmt::Debug for WorkItem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("stage_id", &self.stage_id)
            .field("key", &self.key())
            .field("batch_id", &self.batch_id)
            .field("forward_only", &self.forward_only)
            .field("refcount", &self.refcount)
            .field("expected_readers", &self.expected_readers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use std::collections::HashMap;

    #[test]
    fn test_unique_key_identity() {
        let mut map = HashMap::new();
        map.insert(UniqueKey::forward(3), "f3");
        map.insert(UniqueKey::backward(3), "b3");
        assert_eq!(map.get(&UniqueKey::new(3, Phase::Forward)), Some(&"f3"));
        assert_eq!(map.get(&UniqueKey::new(3, Phase::Backward)), Some(&"b3"));
        assert!(map.get(&UniqueKey::input(3)).is_none());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(
            UniqueKey::backward(2).to_string(),
            "Key(microbatch_id=2, phase=BACKWARD)"
        );
    }

    #[test]
    fn test_loss_payload_values() {
        let values = Payload::<CpuRuntime>::Loss {
            loss: 0.5,
            metric: None,
        }
        .into_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].as_scalar(), Some(0.5));
        assert!(matches!(values[1], OutputValue::Absent));
    }

    #[test]
    fn test_activation_payload_values() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let values = Payload::Activations(vec![t.clone(), t]).into_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].as_tensor().unwrap().to_vec::<f32>(), vec![1.0, 2.0]);
    }
}
