//! AdamW optimizer
//!
//! Decoupled weight decay regularization (Loshchilov & Hutter, 2019), composed from
//! numr tensor ops so it runs on any backend without host transfers.

use crate::error::Result;
use crate::optimizer::traits::Optimizer;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// AdamW configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

struct ParamState<R: Runtime> {
    m: Tensor<R>,
    v: Tensor<R>,
}

/// AdamW optimizer with decoupled weight decay
///
/// Moments are lazily initialized the first time a parameter receives a gradient.
///
/// Per step `t`:
/// - `param = param * (1 - lr * weight_decay)`
/// - `m = beta1 * m + (1 - beta1) * grad`
/// - `v = beta2 * v + (1 - beta2) * grad^2`
/// - `param = param - step_size * m / (sqrt(v) + eps * sqrt(1 - beta2^t))`
///
/// with `step_size = lr * sqrt(1 - beta2^t) / (1 - beta1^t)`.
pub struct AdamW<R: Runtime> {
    config: AdamWConfig,
    state: HashMap<TensorId, ParamState<R>>,
    timestep: u64,
}

impl<R: Runtime<DType = DType>> AdamW<R> {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
            timestep: 0,
        }
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }
}

impl<R: Runtime<DType = DType>> Optimizer<R> for AdamW<R> {
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>,
    {
        self.timestep += 1;
        let t = self.timestep as i32;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let step_size = lr * bc2.sqrt() / bc1;
        let eps_hat = eps * bc2.sqrt();

        let param_ids: Vec<TensorId> = params.keys().copied().collect();
        for id in param_ids {
            let (Some(param), Some(grad)) = (params.get(&id), grads.get(id)) else {
                continue;
            };

            let state = match self.state.remove(&id) {
                Some(state) => state,
                None => ParamState {
                    m: Tensor::<R>::zeros(param.shape(), param.dtype(), param.device()),
                    v: Tensor::<R>::zeros(param.shape(), param.dtype(), param.device()),
                },
            };

            let decayed = if weight_decay > 0.0 {
                client.mul_scalar(param, 1.0 - lr * weight_decay)?
            } else {
                param.clone()
            };

            let m_keep = client.mul_scalar(&state.m, beta1)?;
            let m_new = client.mul_scalar(grad, 1.0 - beta1)?;
            let m = client.add(&m_keep, &m_new)?;

            let grad_sq = client.mul(grad, grad)?;
            let v_keep = client.mul_scalar(&state.v, beta2)?;
            let v_new = client.mul_scalar(&grad_sq, 1.0 - beta2)?;
            let v = client.add(&v_keep, &v_new)?;

            let denom = client.add_scalar(&client.sqrt(&v)?, eps_hat)?;
            let direction = client.div(&m, &denom)?;
            let scaled = client.mul_scalar(&direction, step_size)?;
            let new_param = client.sub(&decayed, &scaled)?;

            self.state.insert(id, ParamState { m, v });
            params.insert(id, new_param);
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn reset(&mut self) {
        self.state.clear();
        self.timestep = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{Var, backward, var_mean, var_mul, var_sub};
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_adamw_default_config() {
        let config = AdamWConfig::default();
        assert_eq!(config.lr, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.eps, 1e-8);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32, -1.0], &[2], &device);
        let w_id = w.id();
        let mut grads = GradStore::new();
        grads.insert(w_id, Tensor::<CpuRuntime>::from_slice(&[0.3f32, -2.0], &[2], &device));
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = AdamW::<CpuRuntime>::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        });
        opt.step(&client, &mut params, &grads).unwrap();
        assert_eq!(opt.timestep(), 1);

        // the bias-corrected first step is lr * sign(grad)
        let updated = params[&w_id].to_vec::<f32>();
        assert!((updated[0] - 0.9).abs() < 1e-4, "got {}", updated[0]);
        assert!((updated[1] + 0.9).abs() < 1e-4, "got {}", updated[1]);
    }

    #[test]
    fn test_adamw_multiple_steps_decrease_loss() {
        let (client, device) = cpu_setup();
        let target = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], &device);
        let w_init = Tensor::<CpuRuntime>::zeros(&[2, 2], DType::F32, &device);
        let w_id = w_init.id();
        let mut params = HashMap::from([(w_id, w_init)]);

        let mut opt = AdamW::<CpuRuntime>::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        });

        let mut losses = Vec::new();
        for _ in 0..20 {
            let w = Var::with_id(params[&w_id].clone(), w_id, true);
            let t = Var::new(target.clone(), false);
            let diff = var_sub(&w, &t, &client).unwrap();
            let sq = var_mul(&diff, &diff, &client).unwrap();
            let loss = var_mean(&sq, &[0, 1], false, &client).unwrap();
            losses.push(loss.tensor().to_vec::<f32>()[0] as f64);

            let grads = backward(&loss, &client).unwrap();
            opt.step(&client, &mut params, &grads).unwrap();
        }

        let (first, last) = (losses[0], losses[losses.len() - 1]);
        assert!(last < first * 0.1, "first={first} last={last}");
        let final_w = params[&w_id].to_vec::<f32>();
        assert!((final_w[0] - 1.0).abs() < 0.3, "w[0]={}", final_w[0]);
    }

    #[test]
    fn test_adamw_weight_decay_with_zero_grad() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[5.0f32, 5.0], &[2], &device);
        let w_id = w.id();
        let mut grads = GradStore::new();
        grads.insert(w_id, Tensor::<CpuRuntime>::zeros(&[2], DType::F32, &device));
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = AdamW::<CpuRuntime>::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.1,
            ..Default::default()
        });
        opt.step(&client, &mut params, &grads).unwrap();

        // 5.0 * (1 - 0.1 * 0.1)
        let updated = params[&w_id].to_vec::<f32>();
        assert!((updated[0] - 4.95).abs() < 1e-4, "got {}", updated[0]);
    }

    #[test]
    fn test_adamw_skips_missing_grads_and_resets() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let w_id = w.id();
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = AdamW::<CpuRuntime>::new(AdamWConfig::default());
        opt.step(&client, &mut params, &GradStore::new()).unwrap();
        assert_eq!(params[&w_id].to_vec::<f32>(), vec![1.0, 2.0]);
        assert!(opt.state.is_empty());

        opt.set_lr(0.01);
        assert_eq!(opt.lr(), 0.01);
        opt.reset();
        assert_eq!(opt.timestep(), 0);
    }
}
