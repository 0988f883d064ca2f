use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::math::matrix::Matrix;

/// Parameter and buffer tensors of a model, keyed by dotted name.
pub type StateDict = BTreeMap<String, Matrix>;

/// Gradients keyed by parameter name. A parameter that received no gradient
/// (frozen, or not on the path of the loss) has no entry and is left alone by
/// the optimizers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gradients {
    grads: BTreeMap<String, Matrix>,
}

impl Gradients {
    pub fn new() -> Gradients {
        Gradients::default()
    }

    pub fn accumulate(&mut self, name: &str, grad: &Matrix) {
        match self.grads.get_mut(name) {
            Some(acc) => acc.add_assign(grad),
            None => {
                self.grads.insert(name.to_string(), grad.clone());
            }
        }
    }

    pub fn merge(&mut self, other: &Gradients) {
        for (name, grad) in &other.grads {
            self.accumulate(name, grad);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Matrix> {
        self.grads.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Matrix)> {
        self.grads.iter()
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn scale(&mut self, factor: f64) {
        for grad in self.grads.values_mut() {
            grad.scale_assign(factor);
        }
    }

    /// Global L2 norm over every gradient entry.
    pub fn norm(&self) -> f64 {
        self.grads.values().map(Matrix::norm_sq).sum::<f64>().sqrt()
    }
}

/// Rescales `grads` so that their global norm is at most `max_norm` and
/// returns the norm measured before clipping. A non-finite norm is returned
/// as-is and leaves the gradients untouched; callers skip the step then.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f64) -> f64 {
    let total = grads.norm();
    let coef = max_norm / (total + 1e-6);
    if total.is_finite() && coef < 1.0 {
        grads.scale(coef);
    }
    total
}

/// Something with named trainable parameters and a serializable state.
pub trait Module {
    /// Trainable parameters, in a stable order.
    fn parameters_mut(&mut self) -> Vec<(String, &mut Matrix)>;

    /// Parameters plus non-trainable buffers (normalization statistics).
    fn state_dict(&self) -> StateDict;

    /// Copies matching entries of `state` into the module and returns the
    /// names it expected but did not find. With `strict`, missing or unknown
    /// names are an error.
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<Vec<String>>;

    fn num_parameters(&mut self) -> usize {
        self.parameters_mut().iter().map(|(_, p)| p.rows * p.cols).sum()
    }
}

/// Shared body of `Module::load_state_dict`: `slots` lists every name the
/// module owns together with the tensor to overwrite.
pub fn load_slots(
    slots: Vec<(String, &mut Matrix)>,
    state: &StateDict,
    strict: bool,
) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    let mut known = Vec::with_capacity(slots.len());
    for (name, target) in slots {
        match state.get(&name) {
            Some(value) => {
                if !value.same_shape(target) {
                    return Err(Error::Checkpoint(format!(
                        "`{name}` has shape {}x{}, expected {}x{}",
                        value.rows, value.cols, target.rows, target.cols
                    )));
                }
                *target = value.clone();
            }
            None => missing.push(name.clone()),
        }
        known.push(name);
    }

    if strict {
        let unexpected: Vec<&String> = state.keys().filter(|k| !known.contains(k)).collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(Error::Checkpoint(format!(
                "state dict mismatch: missing {missing:?}, unexpected {unexpected:?}"
            )));
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_scales_to_max_norm() {
        let mut g = Gradients::new();
        g.accumulate("w", &Matrix::from_data(vec![vec![3.0, 4.0]]));
        let before = clip_grad_norm(&mut g, 1.0);
        assert!((before - 5.0).abs() < 1e-12);
        assert!((g.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clip_leaves_nan_alone() {
        let mut g = Gradients::new();
        g.accumulate("w", &Matrix::from_data(vec![vec![f64::NAN, 1.0]]));
        let norm = clip_grad_norm(&mut g, 1.0);
        assert!(norm.is_nan());
        assert_eq!(g.get("w").unwrap().data[0][1], 1.0);
    }

    #[test]
    fn accumulate_sums_repeated_names() {
        let mut g = Gradients::new();
        g.accumulate("b", &Matrix::filled(1, 2, 1.0));
        g.accumulate("b", &Matrix::filled(1, 2, 2.0));
        assert_eq!(g.get("b").unwrap().data, vec![vec![3.0, 3.0]]);
    }
}
