//! Regression loss and the matching criterion/metric for terminal stages.

use crate::error::{Error, Result};
use crate::pipeline::{Criterion, Metric};
use numr::autograd::{Var, var_mean, var_pow_scalar, var_sub};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use std::sync::Arc;

fn all_dims(ndim: usize) -> Vec<usize> {
    (0..ndim).collect()
}

/// Mean squared error loss: mean((predictions - targets)^2)
///
/// Returns a scalar loss.
pub fn mse_loss<R, C>(client: &C, predictions: &Var<R>, targets: &Var<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ReduceOps<R> + ScalarOps<R>,
    R::Client: BinaryOps<R> + UnaryOps<R> + ReduceOps<R> + ScalarOps<R>,
{
    let diff = var_sub(predictions, targets, client).map_err(Error::Numr)?;
    let sq = var_pow_scalar(&diff, 2.0, client).map_err(Error::Numr)?;
    var_mean(&sq, &all_dims(sq.shape().len()), false, client).map_err(Error::Numr)
}

fn first_output<R: Runtime>(outputs: &[Var<R>]) -> Result<&Var<R>> {
    outputs.first().ok_or_else(|| Error::InvalidArgument {
        arg: "outputs",
        reason: "terminal stage produced no outputs".to_string(),
    })
}

/// Criterion comparing the first stage output against the labels with [`mse_loss`].
pub fn mse_criterion<R>() -> Criterion<R>
where
    R: Runtime<DType = DType>,
    R::Client: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ReduceOps<R> + ScalarOps<R>,
{
    Arc::new(|outputs: &[Var<R>], labels: &Tensor<R>| {
        let prediction = first_output(outputs)?;
        let client = R::default_client(labels.device());
        mse_loss(&client, prediction, &Var::new(labels.clone(), false))
    })
}

/// Mean absolute error of the first stage output, computed on the host.
pub fn mae_metric<R: Runtime<DType = DType>>() -> Metric<R> {
    Arc::new(|outputs: &[Var<R>], labels: &Tensor<R>| {
        let prediction = first_output(outputs)?;
        if prediction.shape() != labels.shape() {
            return Err(Error::InvalidArgument {
                arg: "labels",
                reason: format!(
                    "shape {:?} does not match output {:?}",
                    labels.shape(),
                    prediction.shape()
                ),
            });
        }
        let pred = prediction.tensor().to_vec::<f32>();
        let target = labels.to_vec::<f32>();
        if pred.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = pred
            .iter()
            .zip(&target)
            .map(|(p, t)| f64::from((p - t).abs()))
            .sum();
        Ok(total / pred.len() as f64)
    })
}
