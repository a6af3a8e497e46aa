//! Dense linear layer usable as a whole pipeline stage.

use crate::error::{Error, Result};
use crate::pipeline::StageModule;
use numr::autograd::{Var, var_add, var_matmul, var_transpose};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::{BTreeMap, HashMap};

/// Dense linear layer: output = input @ weight^T + bias
///
/// `weight` is `[out_features, in_features]`. As a stage it takes one positional
/// argument and returns one output.
pub struct Linear<R: Runtime> {
    weight: Var<R>,
    bias: Option<Var<R>>,
    trainable: bool,
}

impl<R: Runtime<DType = DType>> Linear<R> {
    pub fn new(weight: Tensor<R>, bias: Option<Tensor<R>>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
            bias: bias.map(|b| Var::new(b, trainable)),
            trainable,
        }
    }

    /// input: `[..., in_features]`, output: `[..., out_features]`
    pub fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let w_t = var_transpose(&self.weight).map_err(Error::Numr)?;
        let output = var_matmul(input, &w_t, client).map_err(Error::Numr)?;
        match &self.bias {
            Some(bias) => var_add(&output, bias, client).map_err(Error::Numr),
            None => Ok(output),
        }
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var<R>> {
        self.bias.as_ref()
    }

    fn named(&self) -> Vec<(&'static str, &Var<R>)> {
        let mut named = vec![("weight", &self.weight)];
        if let Some(bias) = &self.bias {
            named.push(("bias", bias));
        }
        named
    }
}

/// Swap in a new value for `var`, keeping its id so cached gradients still match.
fn replace<R: Runtime>(var: &mut Var<R>, value: Tensor<R>, trainable: bool) {
    *var = Var::with_id(value, var.id(), trainable);
}

impl<R> StageModule<R> for Linear<R>
where
    R: Runtime<DType = DType>,
    R::Client: RuntimeClient<R> + TensorOps<R>,
{
    fn forward(&mut self, args: &[Var<R>], kwargs: &BTreeMap<String, Var<R>>) -> Result<Vec<Var<R>>> {
        if args.len() != 1 || !kwargs.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "args",
                reason: format!(
                    "linear stage takes one positional input, got {} positional and {} keyword",
                    args.len(),
                    kwargs.len()
                ),
            });
        }
        let client = R::default_client(args[0].tensor().device());
        Ok(vec![Linear::forward(self, &client, &args[0])?])
    }

    fn parameters(&self) -> Vec<(TensorId, Tensor<R>)> {
        if !self.trainable {
            return Vec::new();
        }
        self.named()
            .into_iter()
            .map(|(_, var)| (var.id(), var.tensor().clone()))
            .collect()
    }

    fn update_parameters(&mut self, updated: &HashMap<TensorId, Tensor<R>>) -> Result<()> {
        let trainable = self.trainable;
        if let Some(w) = updated.get(&self.weight.id()) {
            replace(&mut self.weight, w.clone(), trainable);
        }
        if let Some(bias) = self.bias.as_mut() {
            if let Some(b) = updated.get(&bias.id()) {
                replace(bias, b.clone(), trainable);
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> BTreeMap<String, Tensor<R>> {
        self.named()
            .into_iter()
            .map(|(name, var)| (name.to_string(), var.tensor().clone()))
            .collect()
    }

    fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor<R>>) -> Result<()> {
        let trainable = self.trainable;
        let mut slots = vec![("weight", &mut self.weight)];
        if let Some(bias) = self.bias.as_mut() {
            slots.push(("bias", bias));
        }
        for (name, var) in slots {
            let value = state.get(name).ok_or_else(|| Error::InvalidArgument {
                arg: "state",
                reason: format!("missing '{name}'"),
            })?;
            if value.shape() != var.shape() {
                return Err(Error::InvalidArgument {
                    arg: "state",
                    reason: format!(
                        "'{name}' has shape {:?}, expected {:?}",
                        value.shape(),
                        var.shape()
                    ),
                });
            }
            replace(var, value.clone(), trainable);
        }
        Ok(())
    }
}
