//! SGD optimizer with momentum
//!
//! Follows PyTorch's SGD semantics, including Nesterov momentum and L2 weight decay.

use crate::error::Result;
use crate::optimizer::traits::Optimizer;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// SGD configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub dampening: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
            dampening: 0.0,
            nesterov: false,
        }
    }
}

/// SGD optimizer with optional momentum
///
/// Update rules:
/// - L2 weight decay: `grad = grad + weight_decay * param`
/// - Momentum: `buf = momentum * buf + (1 - dampening) * grad` (first step: `buf = grad`)
/// - Nesterov: `update = grad + momentum * buf`, otherwise `update = buf`
/// - Parameter: `param = param - lr * update`
pub struct Sgd<R: Runtime> {
    config: SgdConfig,
    velocity: HashMap<TensorId, Tensor<R>>,
}

impl<R: Runtime<DType = DType>> Sgd<R> {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl<R: Runtime<DType = DType>> Optimizer<R> for Sgd<R> {
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>,
    {
        let SgdConfig {
            lr,
            momentum,
            weight_decay,
            dampening,
            nesterov,
        } = self.config;

        let param_ids: Vec<TensorId> = params.keys().copied().collect();
        for id in param_ids {
            let (Some(param), Some(grad)) = (params.get(&id), grads.get(id)) else {
                continue;
            };

            let grad = if weight_decay > 0.0 {
                let decay = client.mul_scalar(param, weight_decay)?;
                client.add(grad, &decay)?
            } else {
                grad.clone()
            };

            let update = if momentum > 0.0 {
                let buf = match self.velocity.get(&id) {
                    None => grad.clone(),
                    Some(prev) => {
                        let kept = client.mul_scalar(prev, momentum)?;
                        let fresh = client.mul_scalar(&grad, 1.0 - dampening)?;
                        client.add(&kept, &fresh)?
                    }
                };
                let update = if nesterov {
                    let lookahead = client.mul_scalar(&buf, momentum)?;
                    client.add(&grad, &lookahead)?
                } else {
                    buf.clone()
                };
                self.velocity.insert(id, buf);
                update
            } else {
                grad
            };

            let scaled = client.mul_scalar(&update, lr)?;
            let new_param = client.sub(param, &scaled)?;
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
        self.velocity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{Var, backward, var_mean, var_mul, var_sub};
    use numr::runtime::cpu::CpuRuntime;

    fn quadratic_descent(config: SgdConfig, steps: usize) -> (f64, f64) {
        let (client, device) = cpu_setup();
        let target = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], &device);
        let w_init = Tensor::<CpuRuntime>::zeros(&[2, 2], DType::F32, &device);
        let w_id = w_init.id();

        let mut params = HashMap::new();
        params.insert(w_id, w_init);
        let mut opt = Sgd::<CpuRuntime>::new(config);

        let mut losses = Vec::with_capacity(steps);
        for _ in 0..steps {
            let w = Var::with_id(params[&w_id].clone(), w_id, true);
            let t = Var::new(target.clone(), false);
            let diff = var_sub(&w, &t, &client).unwrap();
            let sq = var_mul(&diff, &diff, &client).unwrap();
            let loss = var_mean(&sq, &[0, 1], false, &client).unwrap();
            losses.push(loss.tensor().to_vec::<f32>()[0] as f64);

            let grads = backward(&loss, &client).unwrap();
            opt.step(&client, &mut params, &grads).unwrap();
        }
        (losses[0], losses[steps - 1])
    }

    #[test]
    fn test_sgd_config_yaml_defaults() {
        let config: SgdConfig = serde_yaml::from_str("lr: 0.5\nmomentum: 0.9").unwrap();
        assert_eq!(config.lr, 0.5);
        assert_eq!(config.momentum, 0.9);
        assert_eq!(config.dampening, 0.0);
        assert!(!config.nesterov);
    }

    #[test]
    fn test_sgd_vanilla_step() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device);
        let w_id = w.id();

        let mut grads = GradStore::new();
        grads.insert(
            w_id,
            Tensor::<CpuRuntime>::from_slice(&[0.1f32, 0.2, 0.3, 0.4], &[2, 2], &device),
        );
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = Sgd::<CpuRuntime>::new(SgdConfig {
            lr: 0.1,
            ..Default::default()
        });
        opt.step(&client, &mut params, &grads).unwrap();

        let updated = params[&w_id].to_vec::<f32>();
        for (got, want) in updated.iter().zip([0.99f32, 1.98, 2.97, 3.96]) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_sgd_momentum_converges() {
        let (first, last) = quadratic_descent(
            SgdConfig {
                lr: 0.1,
                momentum: 0.9,
                ..Default::default()
            },
            50,
        );
        assert!(last < first * 0.01, "first={first} last={last}");
    }

    #[test]
    fn test_sgd_nesterov_converges() {
        let (first, last) = quadratic_descent(
            SgdConfig {
                lr: 0.1,
                momentum: 0.9,
                nesterov: true,
                ..Default::default()
            },
            50,
        );
        assert!(last < first * 0.01, "first={first} last={last}");
    }

    #[test]
    fn test_sgd_weight_decay() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[5.0f32, 5.0], &[2], &device);
        let w_id = w.id();

        let mut grads = GradStore::new();
        grads.insert(w_id, Tensor::<CpuRuntime>::zeros(&[2], DType::F32, &device));
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = Sgd::<CpuRuntime>::new(SgdConfig {
            lr: 0.1,
            weight_decay: 0.1,
            ..Default::default()
        });
        opt.step(&client, &mut params, &grads).unwrap();

        // 5.0 - 0.1 * (0.1 * 5.0)
        let updated = params[&w_id].to_vec::<f32>();
        assert!((updated[0] - 4.95).abs() < 1e-5, "got {}", updated[0]);
    }

    #[test]
    fn test_sgd_skips_missing_grads() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let w_id = w.id();
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = Sgd::<CpuRuntime>::new(SgdConfig::default());
        opt.step(&client, &mut params, &GradStore::new()).unwrap();
        assert_eq!(params[&w_id].to_vec::<f32>(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_sgd_reset_clears_velocity() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device);
        let w_id = w.id();
        let mut grads = GradStore::new();
        grads.insert(w_id, Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device));
        let mut params = HashMap::from([(w_id, w)]);

        let mut opt = Sgd::<CpuRuntime>::new(SgdConfig {
            momentum: 0.9,
            ..Default::default()
        });
        opt.step(&client, &mut params, &grads).unwrap();
        assert_eq!(opt.velocity.len(), 1);
        opt.reset();
        assert!(opt.velocity.is_empty());

        opt.set_lr(0.05);
        assert_eq!(opt.lr(), 0.05);
    }
}
