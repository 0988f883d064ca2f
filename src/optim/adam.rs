use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::matrix::Matrix;
use crate::network::params::{Gradients, Module};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AdamSlot {
    step: u64,
    exp_avg: Matrix,
    exp_avg_sq: Matrix,
}

/// Adam with L2 weight decay folded into the gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    state: BTreeMap<String, AdamSlot>,
}

impl Adam {
    pub fn new(learning_rate: f64, weight_decay: f64) -> Adam {
        Adam {
            learning_rate,
            weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            state: BTreeMap::new(),
        }
    }

    pub fn step<M: Module + ?Sized>(&mut self, model: &mut M, grads: &Gradients) {
        for (name, param) in model.parameters_mut() {
            let Some(grad) = grads.get(&name) else { continue };
            let slot = self.state.entry(name).or_insert_with(|| AdamSlot {
                step: 0,
                exp_avg: Matrix::zeros(param.rows, param.cols),
                exp_avg_sq: Matrix::zeros(param.rows, param.cols),
            });
            slot.step += 1;

            let bias1 = 1.0 - self.beta1.powi(slot.step as i32);
            let bias2 = 1.0 - self.beta2.powi(slot.step as i32);
            let step_size = self.learning_rate / bias1;

            for i in 0..param.rows {
                for j in 0..param.cols {
                    let g = grad.data[i][j] + self.weight_decay * param.data[i][j];
                    let m = &mut slot.exp_avg.data[i][j];
                    *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                    let v = &mut slot.exp_avg_sq.data[i][j];
                    *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                    let denom = v.sqrt() / bias2.sqrt() + self.eps;
                    param.data[i][j] -= step_size * slot.exp_avg.data[i][j] / denom;
                }
            }
        }
    }
}
