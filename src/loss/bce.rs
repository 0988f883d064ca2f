use crate::activation::activation::sigmoid;

pub struct BceLoss;

impl BceLoss {
    /// Binary cross-entropy on raw logits, averaged over the batch:
    /// `mean(max(x, 0) - x·y + ln(1 + e^{-|x|}))`.
    pub fn loss(logits: &[f64], target: f64) -> f64 {
        let n = logits.len().max(1) as f64;
        logits.iter()
            .map(|&x| x.max(0.0) - x * target + (-x.abs()).exp().ln_1p())
            .sum::<f64>() / n
    }

    /// Per-logit gradient of `loss`: `(σ(x) - y) / n`.
    pub fn derivative(logits: &[f64], target: f64) -> Vec<f64> {
        let n = logits.len().max(1) as f64;
        logits.iter().map(|&x| (sigmoid(x) - target) / n).collect()
    }

    /// Number of logits whose thresholded prediction equals `label`.
    pub fn correct(logits: &[f64], label: f64) -> usize {
        logits.iter()
            .filter(|&&x| {
                let predicted = if sigmoid(x) >= 0.5 { 1.0 } else { 0.0 };
                predicted == label
            })
            .count()
    }
}
