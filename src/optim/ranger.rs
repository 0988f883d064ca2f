use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::matrix::Matrix;
use crate::network::params::{Gradients, Module};

const SMA_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RangerSlot {
    step: u64,
    exp_avg: Matrix,
    exp_avg_sq: Matrix,
    /// Lookahead slow weights.
    slow: Matrix,
}

/// RAdam wrapped in Lookahead: every `k` steps the fast weights are pulled
/// `alpha` of the way back towards the slow weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranger {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub alpha: f64,
    pub k: u64,
    state: BTreeMap<String, RangerSlot>,
}

impl Ranger {
    pub fn new(learning_rate: f64, weight_decay: f64) -> Ranger {
        Ranger {
            learning_rate,
            weight_decay,
            beta1: 0.95,
            beta2: 0.999,
            eps: 1e-5,
            alpha: 0.5,
            k: 6,
            state: BTreeMap::new(),
        }
    }

    pub fn step<M: Module + ?Sized>(&mut self, model: &mut M, grads: &Gradients) {
        for (name, param) in model.parameters_mut() {
            let Some(grad) = grads.get(&name) else { continue };
            let slot = self.state.entry(name).or_insert_with(|| RangerSlot {
                step: 0,
                exp_avg: Matrix::zeros(param.rows, param.cols),
                exp_avg_sq: Matrix::zeros(param.rows, param.cols),
                slow: param.clone(),
            });
            slot.step += 1;

            let t = slot.step as i32;
            let beta2_t = self.beta2.powi(t);
            let sma_max = 2.0 / (1.0 - self.beta2) - 1.0;
            let sma = sma_max - 2.0 * slot.step as f64 * beta2_t / (1.0 - beta2_t);
            let rectified = sma > SMA_THRESHOLD;
            let step_size = if rectified {
                ((1.0 - beta2_t) * (sma - 4.0) / (sma_max - 4.0) * (sma - 2.0) / sma * sma_max / (sma_max - 2.0)).sqrt()
                    / (1.0 - self.beta1.powi(t))
            } else {
                1.0 / (1.0 - self.beta1.powi(t))
            };

            for i in 0..param.rows {
                for j in 0..param.cols {
                    let g = grad.data[i][j];
                    let m = &mut slot.exp_avg.data[i][j];
                    *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                    let m = *m;
                    let v = &mut slot.exp_avg_sq.data[i][j];
                    *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                    let v = *v;

                    let p = &mut param.data[i][j];
                    if self.weight_decay != 0.0 {
                        *p -= self.weight_decay * self.learning_rate * *p;
                    }
                    if rectified {
                        *p -= step_size * self.learning_rate * m / (v.sqrt() + self.eps);
                    } else {
                        *p -= step_size * self.learning_rate * m;
                    }
                }
            }

            if slot.step % self.k == 0 {
                for i in 0..param.rows {
                    for j in 0..param.cols {
                        let slow = &mut slot.slow.data[i][j];
                        *slow += self.alpha * (param.data[i][j] - *slow);
                        param.data[i][j] = *slow;
                    }
                }
            }
        }
    }
}
