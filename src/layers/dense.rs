use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::{math::matrix::Matrix, activation::activation::ActivationFunction};

/// Fully connected layer applied row-wise: every row of the input (a frame,
/// or a pooled batch item) goes through the same `x·W + b` and activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer{
    pub size: usize,
    pub input_size: usize,
    pub weights: Matrix,
    pub biases: Matrix,
    pub activator: ActivationFunction
}

/// Values saved by `forward` for the matching `backward`.
#[derive(Debug, Clone)]
pub struct LayerCache {
    pub inputs: Matrix,
    pre_neurons: Matrix,  // pre-activation values (z = xW + b) needed for correct derivative
}

/// Gradients produced by one backward pass through a layer.
#[derive(Debug, Clone)]
pub struct LayerGrads {
    pub weights: Matrix,
    pub biases: Matrix,
    /// ∂L/∂input, same shape as the cached input.
    pub input: Matrix,
}

impl Layer {
    pub fn new<R: Rng + ?Sized>(size: usize, input_size: usize, activation: ActivationFunction, rng: &mut R) -> Layer {
        Layer {
            size,
            input_size,
            weights: Matrix::xavier(input_size, size, rng),
            biases: Matrix::zeros(1, size),
            activator: activation
        }
    }

    pub fn forward(&self, input: &Matrix) -> (Matrix, LayerCache) {
        let z = (input * &self.weights).add_row(&self.biases);
        let a = z.map(|x| self.activator.function(x));
        let cache = LayerCache { inputs: input.clone(), pre_neurons: z };
        (a, cache)
    }

    /// Backward pass. `delta` is ∂L/∂a for this layer (error in activation space).
    pub fn backward(&self, cache: &LayerCache, delta: &Matrix) -> LayerGrads {
        // Use pre-activation z so that derivative(z) = σ'(z) is computed correctly
        let act_derivative = cache.pre_neurons.map(|x| self.activator.derivative(x));
        // δ = error ⊙ σ'(z)
        let layer_delta = delta.hadamard(&act_derivative);

        let weights = &cache.inputs.transpose() * &layer_delta;
        let biases = layer_delta.sum_rows();
        let input = &layer_delta * &self.weights.transpose();

        LayerGrads { weights, biases, input }
    }

    /// Pre-activation of the last forward pass.
    pub fn pre_activation<'a>(&self, cache: &'a LayerCache) -> &'a Matrix {
        &cache.pre_neurons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Layer::new(3, 2, ActivationFunction::Sigmoid, &mut rng);
        let input = Matrix::from_data(vec![vec![0.3, -0.7], vec![1.1, 0.4]]);
        // L = sum(a)
        let (out, cache) = layer.forward(&input);
        let grads = layer.backward(&cache, &Matrix::filled(out.rows, out.cols, 1.0));

        let h = 1e-6;
        let mut bumped = layer.clone();
        bumped.weights.data[1][2] += h;
        let plus: f64 = bumped.forward(&input).0.data.iter().flatten().sum();
        bumped.weights.data[1][2] -= 2.0 * h;
        let minus: f64 = bumped.forward(&input).0.data.iter().flatten().sum();
        let numeric = (plus - minus) / (2.0 * h);
        assert!((numeric - grads.weights.data[1][2]).abs() < 1e-6);
    }
}
