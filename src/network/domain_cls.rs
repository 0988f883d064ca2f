//! Feature-level domain critic used by the adversarial loop.
//!
//! Features (`frames x N` per item) are mean-pooled over time, then scored by
//! a one-hidden-layer MLP that emits a single logit per item. Target domain
//! is label 1, source domain label 0.

use rand::Rng;

use crate::activation::activation::ActivationFunction;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::layers::dense::{Layer, LayerCache};
use crate::math::Matrix;
use crate::network::params::{load_slots, Gradients, Module, StateDict};

#[derive(Debug, Clone)]
pub struct DomainClassifier {
    hidden: Layer,
    out: Layer,
}

/// Values saved by `forward` for `backward`.
#[derive(Debug, Clone)]
pub struct DomainPass {
    pub logits: Vec<f64>,
    frames: Vec<usize>,
    hidden: LayerCache,
    out: LayerCache,
}

impl DomainClassifier {
    pub fn new<R: Rng + ?Sized>(feat_dim: usize, hidden: usize, rng: &mut R) -> DomainClassifier {
        DomainClassifier {
            hidden: Layer::new(hidden, feat_dim, ActivationFunction::ReLU, rng),
            out: Layer::new(1, hidden, ActivationFunction::Identity, rng),
        }
    }

    /// Builds from the `model.domain_cls` section.
    pub fn from_config<R: Rng + ?Sized>(feat_dim: usize, c: &Config, rng: &mut R) -> Result<DomainClassifier> {
        let hidden: usize = c.req("hidden_size")?;
        if hidden == 0 {
            return Err(Error::Config("domain classifier hidden_size must be positive".into()));
        }
        Ok(DomainClassifier::new(feat_dim, hidden, rng))
    }

    fn pool(features: &[Matrix]) -> Matrix {
        Matrix::from_data(features.iter().map(|f| f.mean_rows().data.remove(0)).collect())
    }

    pub fn forward(&self, features: &[Matrix]) -> DomainPass {
        let pooled = DomainClassifier::pool(features);
        let (h, hidden) = self.hidden.forward(&pooled);
        let (logits, out) = self.out.forward(&h);
        DomainPass {
            logits: logits.data.iter().map(|r| r[0]).collect(),
            frames: features.iter().map(|f| f.rows).collect(),
            hidden,
            out,
        }
    }

    /// `d_logits[b]` is ∂L/∂logit_b. Returns parameter gradients and ∂L/∂features.
    pub fn backward(&self, pass: &DomainPass, d_logits: &[f64]) -> (Gradients, Vec<Matrix>) {
        let delta = Matrix::from_data(d_logits.iter().map(|d| vec![*d]).collect());
        let out_g = self.out.backward(&pass.out, &delta);
        let hidden_g = self.hidden.backward(&pass.hidden, &out_g.input);

        let mut grads = Gradients::new();
        grads.accumulate("hidden.weight", &hidden_g.weights);
        grads.accumulate("hidden.bias", &hidden_g.biases);
        grads.accumulate("out.weight", &out_g.weights);
        grads.accumulate("out.bias", &out_g.biases);

        // mean-pool backward: every frame receives 1/frames of the pooled grad
        let feature_grads = pass.frames.iter().zip(hidden_g.input.data.iter())
            .map(|(&t, row)| {
                let share: Vec<f64> = row.iter().map(|g| g / t.max(1) as f64).collect();
                Matrix::from_data(vec![share; t])
            })
            .collect();
        (grads, feature_grads)
    }

    /// WGAN-GP penalty `mean_b (‖∂D/∂x_b‖ − 1)²` evaluated at `points`, and its
    /// gradient w.r.t. the critic parameters.
    ///
    /// With mean pooling the input gradient of item `b` is `g_b / T_b` in every
    /// frame, where `g_b = W1 · (w2 ⊙ relu'(z1))`, so `‖∂D/∂x_b‖ = ‖g_b‖ / √T_b`.
    /// The activation pattern is locally constant, so only `W1` and `w2`
    /// receive gradient.
    pub fn gradient_penalty(&self, points: &[Matrix]) -> (f64, Gradients) {
        let pass = self.forward(points);
        let w1 = &self.hidden.weights;
        let w2: Vec<f64> = self.out.weights.data.iter().map(|r| r[0]).collect();
        let z1 = self.hidden.pre_activation(&pass.hidden);
        let batch = points.len().max(1) as f64;

        let mut d_w1 = Matrix::zeros(w1.rows, w1.cols);
        let mut d_w2 = Matrix::zeros(w2.len(), 1);
        let mut penalty = 0.0;

        for (b, &t) in pass.frames.iter().enumerate() {
            let active: Vec<f64> = z1.data[b].iter().map(|&z| if z > 0.0 { 1.0 } else { 0.0 }).collect();
            let a: Vec<f64> = w2.iter().zip(active.iter()).map(|(w, m)| w * m).collect();
            let g: Vec<f64> = w1.data.iter()
                .map(|row| row.iter().zip(a.iter()).map(|(w, a)| w * a).sum())
                .collect();
            let g_norm = g.iter().map(|x| x * x).sum::<f64>().sqrt();
            let scale = (t.max(1) as f64).sqrt();
            let nu = g_norm / scale;
            penalty += (nu - 1.0).powi(2);

            if g_norm == 0.0 {
                continue;
            }
            let coef = 2.0 * (nu - 1.0) / (g_norm * scale * batch);
            let d_g: Vec<f64> = g.iter().map(|x| coef * x).collect();
            for (n, dg) in d_g.iter().enumerate() {
                for (h, ah) in a.iter().enumerate() {
                    d_w1.data[n][h] += dg * ah;
                }
            }
            for (h, m) in active.iter().enumerate() {
                let back: f64 = w1.data.iter().zip(d_g.iter()).map(|(row, dg)| row[h] * dg).sum();
                d_w2.data[h][0] += back * m;
            }
        }

        let mut grads = Gradients::new();
        grads.accumulate("hidden.weight", &d_w1);
        grads.accumulate("out.weight", &d_w2);
        (penalty / batch, grads)
    }
}

/// Random per-item convex combinations `α·a + (1 − α)·b`, truncated to the
/// shorter item. Pairs beyond the shorter batch are dropped.
pub fn interpolate<R: Rng + ?Sized>(a: &[Matrix], b: &[Matrix], rng: &mut R) -> Vec<Matrix> {
    a.iter().zip(b.iter())
        .map(|(x, y)| {
            let alpha: f64 = rng.gen();
            let rows = x.rows.min(y.rows);
            let data = x.data.iter().zip(y.data.iter()).take(rows)
                .map(|(rx, ry)| rx.iter().zip(ry.iter()).map(|(p, q)| alpha * p + (1.0 - alpha) * q).collect())
                .collect();
            Matrix::from_data(data)
        })
        .collect()
}

impl Module for DomainClassifier {
    fn parameters_mut(&mut self) -> Vec<(String, &mut Matrix)> {
        vec![
            ("hidden.weight".to_string(), &mut self.hidden.weights),
            ("hidden.bias".to_string(), &mut self.hidden.biases),
            ("out.weight".to_string(), &mut self.out.weights),
            ("out.bias".to_string(), &mut self.out.biases),
        ]
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("hidden.weight".to_string(), self.hidden.weights.clone());
        state.insert("hidden.bias".to_string(), self.hidden.biases.clone());
        state.insert("out.weight".to_string(), self.out.weights.clone());
        state.insert("out.bias".to_string(), self.out.biases.clone());
        state
    }

    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<Vec<String>> {
        load_slots(self.parameters_mut(), state, strict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn features() -> Vec<Matrix> {
        vec![
            Matrix::from_data(vec![vec![0.2, 0.9, -0.3], vec![0.5, 0.1, 0.4]]),
            Matrix::from_data(vec![vec![-0.6, 0.3, 0.8], vec![0.0, 0.7, 0.2], vec![0.4, -0.2, 0.1]]),
        ]
    }

    #[test]
    fn feature_gradient_matches_finite_difference() {
        let d = DomainClassifier::new(3, 4, &mut StdRng::seed_from_u64(5));
        let feats = features();
        let pass = d.forward(&feats);
        // L = sum of logits
        let (_, d_feat) = d.backward(&pass, &[1.0, 1.0]);

        let h = 1e-6;
        let mut bumped = feats.clone();
        bumped[1].data[2][1] += h;
        let plus: f64 = d.forward(&bumped).logits.iter().sum();
        bumped[1].data[2][1] -= 2.0 * h;
        let minus: f64 = d.forward(&bumped).logits.iter().sum();
        let numeric = (plus - minus) / (2.0 * h);
        assert!((numeric - d_feat[1].data[2][1]).abs() < 1e-6);
    }

    #[test]
    fn penalty_gradient_matches_finite_difference() {
        let d = DomainClassifier::new(3, 4, &mut StdRng::seed_from_u64(9));
        let feats = features();
        let (_, grads) = d.gradient_penalty(&feats);

        let h = 1e-6;
        for (name, i, j) in [("hidden.weight", 1, 2), ("out.weight", 3, 0)] {
            let mut bumped = d.clone();
            let nudge = |m: &mut DomainClassifier, delta: f64| {
                for (pname, p) in m.parameters_mut() {
                    if pname == name {
                        p.data[i][j] += delta;
                    }
                }
            };
            nudge(&mut bumped, h);
            let plus = bumped.gradient_penalty(&feats).0;
            nudge(&mut bumped, -2.0 * h);
            let minus = bumped.gradient_penalty(&feats).0;
            let numeric = (plus - minus) / (2.0 * h);
            let analytic = grads.get(name).unwrap().data[i][j];
            assert!((numeric - analytic).abs() < 1e-5, "{name}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn interpolation_truncates_to_shorter_item() {
        let feats = features();
        let mixed = interpolate(&feats, &feats[1..], &mut StdRng::seed_from_u64(1));
        assert_eq!(mixed.len(), 1);
        assert_eq!(mixed[0].rows, 2);
    }
}
