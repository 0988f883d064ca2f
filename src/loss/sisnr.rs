/// Floor added to every denominator (and inside the log) so silent or empty
/// signals stay finite.
pub const EPS: f64 = 1e-8;

struct SiSnrTerms {
    e: Vec<f64>,
    s: Vec<f64>,
    dot: f64,
    s_energy: f64,
    e_energy: f64,
}

impl SiSnrTerms {
    fn new(estimate: &[f64], reference: &[f64], len: usize) -> SiSnrTerms {
        let len = len.min(estimate.len()).min(reference.len());
        let e = zero_mean(&estimate[..len]);
        let s = zero_mean(&reference[..len]);
        let dot = e.iter().zip(s.iter()).map(|(x, y)| x * y).sum();
        let s_energy = s.iter().map(|x| x * x).sum();
        let e_energy = e.iter().map(|x| x * x).sum();
        SiSnrTerms { e, s, dot, s_energy, e_energy }
    }

    /// Target energy `‖proj‖²` and noise energy `‖e − proj‖²`.
    fn energies(&self) -> (f64, f64) {
        let b = self.s_energy + EPS;
        let a = self.dot;
        let target = a * a * self.s_energy / (b * b);
        let noise = self.e_energy - 2.0 * a * a / b + target;
        (target, noise.max(0.0))
    }
}

fn zero_mean(x: &[f64]) -> Vec<f64> {
    let mean = x.iter().sum::<f64>() / x.len().max(1) as f64;
    x.iter().map(|v| v - mean).collect()
}

/// Scale-invariant SNR (dB) of `estimate` against `reference`, computed over
/// the first `len` samples only.
pub fn si_snr(estimate: &[f64], reference: &[f64], len: usize) -> f64 {
    let terms = SiSnrTerms::new(estimate, reference, len);
    let (target, noise) = terms.energies();
    10.0 * (target / (noise + EPS) + EPS).log10()
}

/// Plain signal-to-distortion ratio (dB), `10·log10(‖s‖² / ‖s − ŝ‖²)`, over
/// the first `len` samples.
pub fn sdr(estimate: &[f64], reference: &[f64], len: usize) -> f64 {
    let len = len.min(estimate.len()).min(reference.len());
    let signal: f64 = reference[..len].iter().map(|x| x * x).sum();
    let distortion: f64 = reference[..len].iter().zip(&estimate[..len]).map(|(s, e)| (s - e).powi(2)).sum();
    10.0 * ((signal + EPS) / (distortion + EPS)).log10()
}

/// ∂ si_snr / ∂ estimate. Same length as `estimate`; zero past `len`.
pub fn si_snr_grad(estimate: &[f64], reference: &[f64], len: usize) -> Vec<f64> {
    let terms = SiSnrTerms::new(estimate, reference, len);
    let valid = terms.e.len();
    let mut grad = vec![0.0; estimate.len()];
    if valid == 0 {
        return grad;
    }

    let a = terms.dot;
    let c = terms.s_energy;
    let b = c + EPS;
    let (target, noise) = terms.energies();
    let denom = noise + EPS;
    let ratio = target / denom;
    let outer = 10.0 / (std::f64::consts::LN_10 * (ratio + EPS));

    let d_target_s = 2.0 * a * c / (b * b);
    let d_noise_s = -4.0 * a / b + d_target_s;
    for (g, (e, s)) in grad.iter_mut().zip(terms.e.iter().zip(terms.s.iter())) {
        let d_target = d_target_s * s;
        let d_noise = 2.0 * e + d_noise_s * s;
        *g = outer * (d_target / denom - target * d_noise / (denom * denom));
    }

    // back through the zero-mean step
    let mean = grad[..valid].iter().sum::<f64>() / valid as f64;
    for g in &mut grad[..valid] {
        *g -= mean;
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_copy_scores_high() {
        let s = [1.0, 0.0, -1.0, 0.0];
        let e = [2.0, 0.0, -2.0, 0.0];
        assert!(si_snr(&e, &s, 4) > 70.0);
    }

    #[test]
    fn sdr_is_not_scale_invariant() {
        let s = [1.0, 0.0, -1.0, 0.0];
        let halved = [0.5, 0.0, -0.5, 0.0];
        // ‖s‖² = 2, ‖s − ŝ‖² = 0.5
        assert!((sdr(&halved, &s, 4) - 10.0 * 4f64.log10()).abs() < 1e-6);
        assert!(sdr(&s, &s, 4) > 80.0);
    }

    #[test]
    fn silent_reference_is_finite() {
        let snr = si_snr(&[0.3, 0.1, -0.2], &[0.0; 3], 3);
        assert!(snr.is_finite());
        assert!(si_snr(&[], &[], 0).is_finite());
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let s = [0.5, -0.3, 0.8, 0.1, -0.6, 0.0];
        let e = [0.2, 0.4, 0.6, -0.1, -0.2, 0.9];
        let grad = si_snr_grad(&e, &s, 5);
        assert_eq!(grad[5], 0.0);

        let h = 1e-6;
        for i in 0..5 {
            let mut up = e;
            up[i] += h;
            let mut down = e;
            down[i] -= h;
            let numeric = (si_snr(&up, &s, 5) - si_snr(&down, &s, 5)) / (2.0 * h);
            assert!((numeric - grad[i]).abs() < 1e-5, "sample {i}: {numeric} vs {}", grad[i]);
        }
    }
}
