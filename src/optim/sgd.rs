use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::matrix::Matrix;
use crate::network::params::{Gradients, Module};

/// SGD with heavy-ball momentum and L2 weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    momentum_buffer: BTreeMap<String, Matrix>,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f64, weight_decay: f64) -> Sgd {
        Sgd { learning_rate, momentum, weight_decay, momentum_buffer: BTreeMap::new() }
    }

    /// Applies one update to every parameter of `model` that has a gradient.
    pub fn step<M: Module + ?Sized>(&mut self, model: &mut M, grads: &Gradients) {
        for (name, param) in model.parameters_mut() {
            let Some(grad) = grads.get(&name) else { continue };

            // d = g + wd·p
            let mut d = grad.clone();
            if self.weight_decay != 0.0 {
                d.add_assign(&param.scale(self.weight_decay));
            }

            if self.momentum != 0.0 {
                let buf = match self.momentum_buffer.remove(&name) {
                    Some(mut buf) => {
                        buf.scale_assign(self.momentum);
                        buf.add_assign(&d);
                        buf
                    }
                    None => d,
                };
                d = buf.clone();
                self.momentum_buffer.insert(name, buf);
            }

            param.add_assign(&d.scale(-self.learning_rate));
        }
    }
}
