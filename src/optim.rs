use anyhow::{bail, Result};
use ndarray::Zip;

use crate::model::Net;

/// Stochastic gradient descent with momentum:
/// `v = momentum * v + grad; param -= lr * v`.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: Option<Net>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: None,
        }
    }

    pub fn step(&mut self, model: &mut Net, grads: &Net) -> Result<()> {
        if !model.same_shape(grads) {
            bail!("gradient shapes do not match the model");
        }
        let lr = self.lr;
        let momentum = self.momentum;
        if self.velocity.as_ref().is_some_and(|v| !v.same_shape(model)) {
            self.velocity = None;
        }
        let velocity = self.velocity.get_or_insert_with(|| model.zeros_like());

        for ((param, grad), vel) in model
            .layers_mut()
            .into_iter()
            .zip(grads.layers())
            .zip(velocity.layers_mut())
        {
            Zip::from(&mut param.weight)
                .and(&mut vel.weight)
                .and(&grad.weight)
                .for_each(|p, v, &g| {
                    *v = momentum * *v + g;
                    *p -= lr * *v;
                });
            Zip::from(&mut param.bias)
                .and(&mut vel.bias)
                .and(&grad.bias)
                .for_each(|p, v, &g| {
                    *v = momentum * *v + g;
                    *p -= lr * *v;
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unit_grads(model: &Net) -> Net {
        let mut grads = model.zeros_like();
        for layer in grads.layers_mut() {
            layer.weight.fill(1.0);
            layer.bias.fill(1.0);
        }
        grads
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut model = Net::new(&mut StdRng::seed_from_u64(0));
        let before = model.fc2.bias[0];
        let grads = unit_grads(&model);
        let mut sgd = Sgd::new(0.1, 0.0);
        sgd.step(&mut model, &grads).unwrap();
        assert!((model.fc2.bias[0] - (before - 0.1)).abs() < 1e-6);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut model = Net::new(&mut StdRng::seed_from_u64(0));
        let before = model.conv1.weight[[0, 0]];
        let grads = unit_grads(&model);
        let mut sgd = Sgd::new(0.1, 0.5);
        sgd.step(&mut model, &grads).unwrap();
        sgd.step(&mut model, &grads).unwrap();
        // velocities 1.0 then 1.5
        assert!((model.conv1.weight[[0, 0]] - (before - 0.25)).abs() < 1e-5);
    }
}
