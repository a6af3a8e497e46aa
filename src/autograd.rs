//! Differentiation engine seam.
//!
//! The stage worker never calls numr's autograd directly; it hands aligned
//! `(outputs, grad_outputs)` lists to a [`Differentiator`]. [`NumrAutograd`] is
//! the default implementation on top of `numr::autograd::backward`.

use crate::error::{Error, Result};
use numr::autograd::{GradStore, Var, backward, var_add, var_mul, var_sum};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Computes gradients of graph leaves from stage outputs.
pub trait Differentiator<R: Runtime>: Send + Sync {
    /// Backpropagate from `outputs`.
    ///
    /// `grad_outputs`, when given, must be positionally aligned with `outputs`. An
    /// output listed more than once receives the sum of its gradients. `None`
    /// treats the outputs as a loss: each is summed to a scalar and the scalars
    /// are added.
    fn backward(
        &self,
        outputs: &[Var<R>],
        grad_outputs: Option<&[Tensor<R>]>,
    ) -> Result<GradStore<R>>;
}

/// [`Differentiator`] backed by numr's reverse-mode autograd.
///
/// Non-scalar outputs are reduced through the surrogate `sum(output * grad)`,
/// whose gradient w.r.t. `output` is exactly `grad`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumrAutograd;

fn all_dims(ndim: usize) -> Vec<usize> {
    (0..ndim).collect()
}

impl<R> Differentiator<R> for NumrAutograd
where
    R: Runtime<DType = DType>,
    R::Client: RuntimeClient<R>
        + TensorOps<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ReduceOps<R>
        + ScalarOps<R>,
{
    fn backward(
        &self,
        outputs: &[Var<R>],
        grad_outputs: Option<&[Tensor<R>]>,
    ) -> Result<GradStore<R>> {
        let first = outputs.first().ok_or_else(|| Error::InvalidArgument {
            arg: "outputs",
            reason: "nothing to differentiate".to_string(),
        })?;
        if let Some(grads) = grad_outputs {
            if grads.len() != outputs.len() {
                return Err(Error::InvalidArgument {
                    arg: "grad_outputs",
                    reason: format!(
                        "{} gradients for {} outputs",
                        grads.len(),
                        outputs.len()
                    ),
                });
            }
        }

        let client = R::default_client(first.tensor().device());
        let mut total: Option<Var<R>> = None;
        for (i, output) in outputs.iter().enumerate() {
            let weighted = match grad_outputs {
                Some(grads) => {
                    let grad = &grads[i];
                    if grad.shape() != output.shape() {
                        return Err(Error::InvalidArgument {
                            arg: "grad_outputs",
                            reason: format!(
                                "gradient {i} has shape {:?}, output has {:?}",
                                grad.shape(),
                                output.shape()
                            ),
                        });
                    }
                    var_mul(output, &Var::new(grad.clone(), false), &client)
                        .map_err(Error::Numr)?
                }
                None => output.clone(),
            };
            let term = if weighted.shape().is_empty() {
                weighted
            } else {
                var_sum(&weighted, &all_dims(weighted.shape().len()), false, &client)
                    .map_err(Error::Numr)?
            };
            total = Some(match total {
                None => term,
                Some(acc) => var_add(&acc, &term, &client).map_err(Error::Numr)?,
            });
        }

        let root = total.ok_or_else(|| Error::Invariant {
            reason: "no backward root built".to_string(),
        })?;
        backward(&root, &client).map_err(Error::Numr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::var_mul;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_grad_outputs_seed_backward() {
        let (client, device) = cpu_setup();
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0], &[3], &device),
            true,
        );
        let two = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[2.0f32, 2.0, 2.0], &[3], &device),
            false,
        );
        let y = var_mul(&x, &two, &client).unwrap();
        let g = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.5, -1.0], &[3], &device);

        let grads = NumrAutograd.backward(&[y], Some(&[g])).unwrap();
        let dx: Vec<f32> = grads.get(x.id()).unwrap().to_vec();
        // dy/dx = 2, seeded with g
        assert!((dx[0] - 2.0).abs() < 1e-5);
        assert!((dx[1] - 1.0).abs() < 1e-5);
        assert!((dx[2] + 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_repeated_output_sums_grads() {
        let (_client, device) = cpu_setup();
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0], &[2], &device),
            true,
        );
        let g1 = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let g2 = Tensor::<CpuRuntime>::from_slice(&[3.0f32, 4.0], &[2], &device);

        let grads = NumrAutograd
            .backward(&[x.clone(), x.clone()], Some(&[g1, g2]))
            .unwrap();
        let dx: Vec<f32> = grads.get(x.id()).unwrap().to_vec();
        assert!((dx[0] - 4.0).abs() < 1e-5);
        assert!((dx[1] - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_implicit_loss_sums_output() {
        let (_client, device) = cpu_setup();
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device),
            true,
        );
        let grads = NumrAutograd.backward(&[x.clone()], None).unwrap();
        let dx: Vec<f32> = grads.get(x.id()).unwrap().to_vec();
        assert_eq!(dx, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_misaligned_grads_rejected() {
        let (_client, device) = cpu_setup();
        let x = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device),
            true,
        );
        let err = NumrAutograd
            .backward(&[x], Some(&[]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_empty_outputs_rejected() {
        let result = <NumrAutograd as Differentiator<CpuRuntime>>::backward(&NumrAutograd, &[], None);
        assert!(result.is_err());
    }
}
