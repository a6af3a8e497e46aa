//! Stage topology: who feeds a stage and who reads from it.
//!
//! Two modes:
//!
//! - **Linear**: ranks form a chain, producer = `rank - 1`, consumer = `rank + 1`.
//! - **DAG**: a [`PartitionGraph`] attached to the stage module declares, per
//!   partition, which peers feed which input positions and which output positions
//!   go to which peers. Partitions are named `submod_<rank>`; the pseudo-nodes
//!   [`MODEL_INPUT`] and [`MODEL_OUTPUT`] stand for the pipeline boundary.
//!
//! ```text
//!   MODEL_INPUT ──► submod_0 ──► submod_2 ──► MODEL_OUTPUT
//!        └────────► submod_1 ───────┘
//! ```
//!
//! A [`Topology`] is resolved once per stage and never changes afterwards. In DAG
//! mode resolution also precomputes the offset routes used to assemble forward
//! arguments and to route gradients back.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Pseudo-node feeding the raw model input.
pub const MODEL_INPUT: &str = "MODEL_INPUT";
/// Pseudo-node receiving the final model output.
pub const MODEL_OUTPUT: &str = "MODEL_OUTPUT";

const PARTITION_PREFIX: &str = "submod_";

/// Partition name for a pipeline rank.
pub fn partition_name(rank: usize) -> String {
    format!("{PARTITION_PREFIX}{rank}")
}

/// Pipeline rank encoded in a partition name, if it follows the naming convention.
pub fn partition_rank(name: &str) -> Option<usize> {
    name.strip_prefix(PARTITION_PREFIX)?.parse().ok()
}

/// Edge between a partition and one peer, with positional offsets.
///
/// On an input edge, `offsets` are positions in this partition's argument list.
/// On an output edge, `offsets` are positions in this partition's output list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub peer: String,
    pub offsets: Vec<usize>,
}

/// One partition of a [`PartitionGraph`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionNode {
    /// Input edges in positional producer order.
    #[serde(default)]
    pub inputs: Vec<Edge>,
    #[serde(default)]
    pub outputs: Vec<Edge>,
    /// Number of tensors the partition returns.
    pub output_len: usize,
}

impl PartitionNode {
    pub fn new(output_len: usize) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_len,
        }
    }

    pub fn input(mut self, peer: impl Into<String>, offsets: impl Into<Vec<usize>>) -> Self {
        self.inputs.push(Edge {
            peer: peer.into(),
            offsets: offsets.into(),
        });
        self
    }

    pub fn output(mut self, peer: impl Into<String>, offsets: impl Into<Vec<usize>>) -> Self {
        self.outputs.push(Edge {
            peer: peer.into(),
            offsets: offsets.into(),
        });
        self
    }

    fn input_edge(&self, peer: &str) -> Option<&Edge> {
        self.inputs.iter().find(|e| e.peer == peer)
    }

    fn output_edge(&self, peer: &str) -> Option<&Edge> {
        self.outputs.iter().find(|e| e.peer == peer)
    }

    /// Number of positional arguments the partition receives.
    pub fn input_arity(&self) -> usize {
        self.inputs.iter().map(|e| e.offsets.len()).sum()
    }
}

/// A model input argument and the partitions that read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInput {
    pub name: String,
    pub consumers: Vec<String>,
}

/// Typed description of how partitions are wired together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionGraph {
    /// Model input arguments in positional order.
    #[serde(default)]
    pub model_inputs: Vec<ModelInput>,
    pub partitions: BTreeMap<String, PartitionNode>,
}

impl PartitionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_input(mut self, name: impl Into<String>, consumers: &[&str]) -> Self {
        self.model_inputs.push(ModelInput {
            name: name.into(),
            consumers: consumers.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn with_partition(mut self, name: impl Into<String>, node: PartitionNode) -> Self {
        self.partitions.insert(name.into(), node);
        self
    }

    pub fn node(&self, name: &str) -> Option<&PartitionNode> {
        self.partitions.get(name)
    }

    /// Indices of the model input arguments read by `partition`, in argument order.
    pub fn model_input_offsets(&self, partition: &str) -> Vec<usize> {
        self.model_inputs
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.consumers.iter().any(|c| c == partition))
            .map(|(i, _)| i)
            .collect()
    }

    fn check_peer(&self, peer: &str, num_stages: usize) -> Result<()> {
        if peer == MODEL_INPUT || peer == MODEL_OUTPUT {
            return Ok(());
        }
        match partition_rank(peer) {
            Some(rank) if rank < num_stages && self.partitions.contains_key(peer) => Ok(()),
            _ => Err(Error::InvalidGraph {
                reason: format!("unknown partition '{peer}'"),
            }),
        }
    }

    /// Check edge names, offset bounds and producer/consumer agreement.
    pub fn validate(&self, num_stages: usize) -> Result<()> {
        for arg in &self.model_inputs {
            for consumer in &arg.consumers {
                self.check_peer(consumer, num_stages)?;
            }
        }

        for (name, node) in &self.partitions {
            let rank = match partition_rank(name) {
                Some(rank) if rank < num_stages => rank,
                _ => {
                    return Err(Error::InvalidGraph {
                        reason: format!(
                            "partition '{name}' does not map to a rank below {num_stages}"
                        ),
                    });
                }
            };

            let mut seen = BTreeSet::new();
            for edge in &node.inputs {
                self.check_peer(&edge.peer, num_stages)?;
                if edge.peer == MODEL_OUTPUT {
                    return Err(Error::InvalidGraph {
                        reason: format!("'{name}' reads from {MODEL_OUTPUT}"),
                    });
                }
                for &off in &edge.offsets {
                    if !seen.insert(off) {
                        return Err(Error::InvalidGraph {
                            reason: format!("'{name}' input position {off} is fed twice"),
                        });
                    }
                }
                if edge.peer == MODEL_INPUT {
                    let expected = self.model_input_offsets(name).len();
                    if expected != edge.offsets.len() {
                        return Err(Error::InvalidGraph {
                            reason: format!(
                                "'{name}' declares {} model inputs but reads {expected}",
                                edge.offsets.len()
                            ),
                        });
                    }
                    continue;
                }
                let producer = &self.partitions[&edge.peer];
                let sent = producer.output_edge(name).ok_or_else(|| Error::InvalidGraph {
                    reason: format!("'{}' has no output edge to '{name}'", edge.peer),
                })?;
                let expected = if producer.output_len == 1 {
                    1
                } else {
                    sent.offsets.len()
                };
                if expected != edge.offsets.len() {
                    return Err(Error::InvalidGraph {
                        reason: format!(
                            "'{}' sends {expected} tensors to '{name}' which expects {}",
                            edge.peer,
                            edge.offsets.len()
                        ),
                    });
                }
            }
            let arity = node.input_arity();
            if seen.iter().copied().ne(0..arity) {
                return Err(Error::InvalidGraph {
                    reason: format!("'{name}' input positions are not contiguous from 0"),
                });
            }

            for edge in &node.outputs {
                self.check_peer(&edge.peer, num_stages)?;
                if edge.peer == MODEL_INPUT {
                    return Err(Error::InvalidGraph {
                        reason: format!("'{name}' writes to {MODEL_INPUT}"),
                    });
                }
                if let Some(&off) = edge.offsets.iter().find(|&&off| off >= node.output_len) {
                    return Err(Error::InvalidGraph {
                        reason: format!(
                            "'{name}' output offset {off} out of range for output_len {}",
                            node.output_len
                        ),
                    });
                }
                if edge.peer != MODEL_OUTPUT
                    && self.partitions[&edge.peer].input_edge(name).is_none()
                {
                    return Err(Error::InvalidGraph {
                        reason: format!("'{}' has no input edge from '{name}'", edge.peer),
                    });
                }
            }

            // Only the last partition is seeded with a backward; every other one
            // must hand its outputs to a partition that will send gradients back.
            if rank + 1 != num_stages {
                if node.outputs.iter().any(|edge| edge.peer == MODEL_OUTPUT) {
                    return Err(Error::InvalidGraph {
                        reason: format!(
                            "'{name}' writes to {MODEL_OUTPUT} but only {} may",
                            partition_name(num_stages - 1)
                        ),
                    });
                }
                if node.outputs.is_empty() {
                    return Err(Error::InvalidGraph {
                        reason: format!("'{name}' has no consumer partition"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Where one upstream future's tensors land in this stage's argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRoute {
    /// Producing rank, `None` for the model input relay.
    pub source: Option<usize>,
    /// Indices to pick from the upstream tensors; `None` takes the single output whole.
    pub pick: Option<Vec<usize>>,
    /// Argument positions the picked tensors fill.
    pub target: Vec<usize>,
}

/// How one consumer's input gradients map back onto this stage's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradRoute {
    pub consumer: usize,
    /// Positions in the consumer's gradient list.
    pub grad_positions: Vec<usize>,
    /// This stage's output indices, aligned with `grad_positions`.
    pub output_offsets: Vec<usize>,
}

/// Precomputed DAG routing for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagRouting {
    pub partition: String,
    /// Names of all model input arguments, in positional order.
    pub model_inputs: Vec<String>,
    /// Model input indices this stage reads.
    pub model_input_offsets: Vec<usize>,
    /// Route from the full model input list into this stage's arguments, if it reads any.
    pub relay: Option<InputRoute>,
    /// One route per upstream future, in subscription order.
    pub inputs: Vec<InputRoute>,
    pub input_arity: usize,
    /// One route per consumer, in consumer order.
    pub grads: Vec<GradRoute>,
}

/// Resolved neighbours of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub rank: usize,
    pub num_stages: usize,
    /// Producer ranks in positional input order.
    pub producers: Vec<usize>,
    pub consumers: Vec<usize>,
    /// Stages other than this one that read the raw model input (entry stage, DAG only).
    pub input_consumers: BTreeSet<usize>,
    pub is_input: bool,
    pub is_output: bool,
    pub dag: Option<DagRouting>,
}

impl Topology {
    /// Linear chain topology from rank arithmetic.
    pub fn linear(rank: usize, num_stages: usize) -> Self {
        let producers = if rank > 0 { vec![rank - 1] } else { Vec::new() };
        let consumers = if rank + 1 < num_stages {
            vec![rank + 1]
        } else {
            Vec::new()
        };
        Self {
            rank,
            num_stages,
            producers,
            consumers,
            input_consumers: BTreeSet::new(),
            is_input: rank == 0,
            is_output: rank + 1 == num_stages,
            dag: None,
        }
    }

    /// Resolve from a partition graph if one is attached, otherwise linear.
    pub fn resolve(rank: usize, num_stages: usize, graph: Option<&PartitionGraph>) -> Result<Self> {
        match graph {
            None => Ok(Self::linear(rank, num_stages)),
            Some(graph) => Self::from_graph(rank, num_stages, graph),
        }
    }

    fn from_graph(rank: usize, num_stages: usize, graph: &PartitionGraph) -> Result<Self> {
        graph.validate(num_stages)?;
        let name = partition_name(rank);
        let node = graph.node(&name).ok_or_else(|| Error::InvalidGraph {
            reason: format!("no partition named '{name}' for rank {rank}"),
        })?;

        let mut producers = Vec::new();
        let mut producer_routes = Vec::new();
        let mut model_input_route = None;
        let mut is_input = false;
        for edge in &node.inputs {
            if edge.peer == MODEL_INPUT {
                is_input = true;
                model_input_route = Some(InputRoute {
                    source: None,
                    pick: Some(graph.model_input_offsets(&name)),
                    target: edge.offsets.clone(),
                });
                continue;
            }
            let producer_rank = partition_rank(&edge.peer).ok_or_else(|| Error::InvalidGraph {
                reason: format!("unknown partition '{}'", edge.peer),
            })?;
            let producer = &graph.partitions[&edge.peer];
            let pick = if producer.output_len == 1 {
                None
            } else {
                producer.output_edge(&name).map(|e| e.offsets.clone())
            };
            producers.push(producer_rank);
            producer_routes.push(InputRoute {
                source: Some(producer_rank),
                pick,
                target: edge.offsets.clone(),
            });
        }

        let mut consumers = Vec::new();
        let mut grads = Vec::new();
        let mut is_output = false;
        for edge in &node.outputs {
            if edge.peer == MODEL_OUTPUT {
                is_output = true;
                continue;
            }
            let consumer_rank = partition_rank(&edge.peer).ok_or_else(|| Error::InvalidGraph {
                reason: format!("unknown partition '{}'", edge.peer),
            })?;
            let consumer = &graph.partitions[&edge.peer];
            let grad_positions = consumer
                .input_edge(&name)
                .map(|e| e.offsets.clone())
                .unwrap_or_default();
            let output_offsets = if node.output_len == 1 {
                vec![0]
            } else {
                edge.offsets.clone()
            };
            consumers.push(consumer_rank);
            grads.push(GradRoute {
                consumer: consumer_rank,
                grad_positions,
                output_offsets,
            });
        }

        if rank == 0 && model_input_route.is_none() {
            return Err(Error::InvalidGraph {
                reason: format!("entry partition '{name}' reads no model input"),
            });
        }

        // Only non-entry stages fetch the relay; the entry stage is handed the input.
        let needs_relay = rank != 0 && is_input;
        let mut inputs = Vec::with_capacity(producer_routes.len() + 1);
        if needs_relay {
            if let Some(route) = &model_input_route {
                inputs.push(route.clone());
            }
        }
        inputs.extend(producer_routes);

        let input_consumers = if rank == 0 {
            graph
                .model_inputs
                .iter()
                .flat_map(|arg| arg.consumers.iter())
                .filter_map(|c| partition_rank(c))
                .filter(|&r| r != rank)
                .collect()
        } else {
            BTreeSet::new()
        };

        Ok(Self {
            rank,
            num_stages,
            producers,
            consumers,
            input_consumers,
            is_input: is_input || rank == 0,
            is_output,
            dag: Some(DagRouting {
                model_inputs: graph.model_inputs.iter().map(|arg| arg.name.clone()).collect(),
                model_input_offsets: graph.model_input_offsets(&name),
                partition: name,
                relay: model_input_route,
                inputs,
                input_arity: node.input_arity(),
                grads,
            }),
        })
    }

    pub fn is_first(&self) -> bool {
        self.rank == 0
    }

    pub fn is_last(&self) -> bool {
        self.rank + 1 == self.num_stages
    }

    /// Whether this stage must fetch the raw model input from the entry stage.
    pub fn needs_model_input(&self) -> bool {
        self.dag.is_some() && self.is_input && !self.is_first()
    }
}
