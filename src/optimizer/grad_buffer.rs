//! Parameter gradients accumulated across microbatches.
//!
//! Every backward pass on a stage adds its parameter gradients into the buffer;
//! the sum is consumed by the optimizer step and cleared afterwards.

use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::BinaryOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Summed gradients keyed by parameter id.
pub struct GradBuffer<R: Runtime> {
    grads: GradStore<R>,
    contributions: usize,
}

impl<R: Runtime<DType = DType>> GradBuffer<R> {
    pub fn new() -> Self {
        Self {
            grads: GradStore::new(),
            contributions: 0,
        }
    }

    /// Add the gradients of `ids` found in `fresh`; ids without a gradient are skipped.
    pub fn accumulate<C>(&mut self, client: &C, ids: &[TensorId], fresh: &GradStore<R>) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R>,
    {
        for &id in ids {
            let Some(grad) = fresh.get(id) else {
                continue;
            };
            let summed = match self.grads.get(id) {
                Some(existing) => client.add(existing, grad)?,
                None => grad.clone(),
            };
            self.grads.insert(id, summed);
        }
        self.contributions += 1;
        Ok(())
    }

    pub fn get(&self, id: TensorId) -> Option<&Tensor<R>> {
        self.grads.get(id)
    }

    pub fn grads(&self) -> &GradStore<R> {
        &self.grads
    }

    /// Number of backward passes folded in since the last clear.
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn is_empty(&self) -> bool {
        self.contributions == 0
    }

    pub fn clear(&mut self) {
        self.grads = GradStore::new();
        self.contributions = 0;
    }
}

impl<R: Runtime<DType = DType>> Default for GradBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}
