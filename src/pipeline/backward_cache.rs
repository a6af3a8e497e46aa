//! Per-microbatch activations kept between forward and backward.

use crate::error::{Error, Result};
use numr::autograd::Var;
use numr::runtime::Runtime;
use std::collections::{BTreeMap, HashMap};

/// What a stage needs to run backward (or recompute forward) for one microbatch.
pub struct BackwardCache<R: Runtime> {
    /// Outputs were detached at forward time; recompute from `args`/`kwargs`.
    pub checkpoint: bool,
    pub args: Vec<Var<R>>,
    pub kwargs: BTreeMap<String, Var<R>>,
    /// Differentiable outputs, empty when `checkpoint` is set.
    pub outputs: Vec<Var<R>>,
}

impl<R: Runtime> BackwardCache<R> {
    pub fn new(args: Vec<Var<R>>, kwargs: BTreeMap<String, Var<R>>, outputs: Vec<Var<R>>) -> Self {
        Self {
            checkpoint: false,
            args,
            kwargs,
            outputs,
        }
    }

    /// Cache entry that keeps only the inputs, for recompute at backward time.
    pub fn checkpointed(args: Vec<Var<R>>, kwargs: BTreeMap<String, Var<R>>) -> Self {
        Self {
            checkpoint: true,
            args,
            kwargs,
            outputs: Vec::new(),
        }
    }

    /// Cached inputs in supply order: positional first, then keyword in key order.
    pub fn inputs(&self) -> impl Iterator<Item = &Var<R>> {
        self.args.iter().chain(self.kwargs.values())
    }
}

/// Backward caches of one stage, keyed by microbatch id.
///
/// Each entry is inserted once by forward and removed once by backward.
pub struct BackwardCacheStore<R: Runtime> {
    stage: usize,
    entries: HashMap<usize, BackwardCache<R>>,
}

impl<R: Runtime> BackwardCacheStore<R> {
    pub fn new(stage: usize) -> Self {
        Self {
            stage,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, microbatch_id: usize, cache: BackwardCache<R>) -> Result<()> {
        if self.entries.contains_key(&microbatch_id) {
            return Err(Error::DuplicateBackwardCache {
                stage: self.stage,
                microbatch_id,
            });
        }
        self.entries.insert(microbatch_id, cache);
        Ok(())
    }

    /// Remove the entry for `microbatch_id`. Missing entries mean backward was
    /// scheduled before forward.
    pub fn take(&mut self, microbatch_id: usize) -> Result<BackwardCache<R>> {
        self.entries
            .remove(&microbatch_id)
            .ok_or(Error::MissingBackwardCache {
                stage: self.stage,
                microbatch_id,
            })
    }

    pub fn contains(&self, microbatch_id: usize) -> bool {
        self.entries.contains_key(&microbatch_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
