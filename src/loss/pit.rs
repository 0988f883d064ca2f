//! Permutation-invariant SI-SNR loss.
//!
//! Every batch item is scored under each one-to-one assignment of estimated
//! sources to references; the assignment with the highest total SI-SNR wins.

use crate::error::{Error, Result};
use crate::loss::sisnr::{si_snr, si_snr_grad};
use crate::math::Signals;

/// All permutations of `0..k` in lexicographic order, identity first.
pub fn permutations(k: usize) -> Vec<Vec<usize>> {
    fn extend(prefix: &mut Vec<usize>, used: &mut [bool], out: &mut Vec<Vec<usize>>) {
        if prefix.len() == used.len() {
            out.push(prefix.clone());
            return;
        }
        for i in 0..used.len() {
            if !used[i] {
                used[i] = true;
                prefix.push(i);
                extend(prefix, used, out);
                prefix.pop();
                used[i] = false;
            }
        }
    }
    let mut out = Vec::new();
    extend(&mut Vec::with_capacity(k), &mut vec![false; k], &mut out);
    out
}

#[derive(Debug, Clone)]
pub struct PitOutput {
    /// `-mean_b(max_snr[b])`.
    pub loss: f64,
    /// Mean SI-SNR over sources under the best assignment, per item.
    pub max_snr: Vec<f64>,
    /// `perms[b][r]` is the estimate assigned to reference `r`.
    pub perms: Vec<Vec<usize>>,
    /// Estimates reordered to line up with the references.
    pub reordered: Vec<Signals>,
}

fn check_shapes(references: &[Signals], estimates: &[Signals], lengths: &[usize]) -> Result<()> {
    if references.len() != estimates.len() || references.len() != lengths.len() {
        return Err(Error::Shape(format!(
            "batch mismatch: {} references, {} estimates, {} lengths",
            references.len(),
            estimates.len(),
            lengths.len()
        )));
    }
    for (b, ((refs, ests), &len)) in references.iter().zip(estimates).zip(lengths).enumerate() {
        if refs.len() != ests.len() || refs.is_empty() {
            return Err(Error::Shape(format!(
                "item {b}: {} references vs {} estimates",
                refs.len(),
                ests.len()
            )));
        }
        if refs.iter().chain(ests.iter()).any(|sig| sig.len() < len) {
            return Err(Error::Shape(format!("item {b}: signal shorter than length {len}")));
        }
    }
    Ok(())
}

/// `[K][K]` table, `scores[r][e]` = SI-SNR of estimate `e` against reference `r`.
pub fn pairwise_si_snr(references: &Signals, estimates: &Signals, len: usize) -> Vec<Vec<f64>> {
    references.iter()
        .map(|r| estimates.iter().map(|e| si_snr(e, r, len)).collect())
        .collect()
}

/// Best-permutation SI-SNR loss over a padded batch.
pub fn pit_loss(references: &[Signals], estimates: &[Signals], lengths: &[usize]) -> Result<PitOutput> {
    check_shapes(references, estimates, lengths)?;

    let mut max_snr = Vec::with_capacity(references.len());
    let mut perms = Vec::with_capacity(references.len());
    let mut reordered = Vec::with_capacity(references.len());

    for ((refs, ests), &len) in references.iter().zip(estimates).zip(lengths) {
        let k = refs.len();
        let scores = pairwise_si_snr(refs, ests, len);
        let mut best: Option<(f64, Vec<usize>)> = None;
        for perm in permutations(k) {
            let total: f64 = perm.iter().enumerate().map(|(r, &e)| scores[r][e]).sum();
            // strict comparison keeps the earliest (identity-first) winner on ties
            if best.as_ref().map_or(true, |(t, _)| total > *t) {
                best = Some((total, perm));
            }
        }
        let (total, perm) = best.unwrap_or_else(|| (0.0, (0..k).collect()));
        max_snr.push(total / k as f64);
        reordered.push(perm.iter().map(|&e| ests[e].clone()).collect());
        perms.push(perm);
    }

    let loss = -max_snr.iter().sum::<f64>() / max_snr.len().max(1) as f64;
    Ok(PitOutput { loss, max_snr, perms, reordered })
}

/// ∂ loss / ∂ estimates for a fixed assignment (the one `pit_loss` chose).
/// Padding positions get zero gradient.
pub fn pit_loss_grad(
    references: &[Signals],
    estimates: &[Signals],
    lengths: &[usize],
    perms: &[Vec<usize>],
) -> Vec<Signals> {
    let batch = references.len().max(1) as f64;
    references.iter().zip(estimates).zip(lengths).zip(perms)
        .map(|(((refs, ests), &len), perm)| {
            let scale = -1.0 / (batch * refs.len() as f64);
            let mut grads: Signals = ests.iter().map(|e| vec![0.0; e.len()]).collect();
            for (r, &e) in perm.iter().enumerate() {
                let g = si_snr_grad(&ests[e], &refs[r], len);
                for (acc, x) in grads[e].iter_mut().zip(g) {
                    *acc += scale * x;
                }
            }
            grads
        })
        .collect()
}

/// Mean SI-SNR of the unprocessed mixture against each reference, per item.
pub fn mixture_si_snr(references: &[Signals], mixtures: &[Vec<f64>], lengths: &[usize]) -> Result<Vec<f64>> {
    if references.len() != mixtures.len() || references.len() != lengths.len() {
        return Err(Error::Shape("mixture batch does not match references".into()));
    }
    Ok(references.iter().zip(mixtures).zip(lengths)
        .map(|((refs, mix), &len)| {
            refs.iter().map(|r| si_snr(mix, r, len)).sum::<f64>() / refs.len().max(1) as f64
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1() -> Vec<f64> { vec![1.0, 0.0, -1.0, 0.0] }
    fn s2() -> Vec<f64> { vec![0.0, 1.0, 0.0, -1.0] }

    #[test]
    fn permutations_are_complete_and_one_to_one() {
        let perms = permutations(3);
        assert_eq!(perms.len(), 6);
        assert_eq!(perms[0], vec![0, 1, 2]);
        for p in &perms {
            let mut sorted = p.clone();
            sorted.sort();
            assert_eq!(sorted, vec![0, 1, 2]);
        }
    }

    #[test]
    fn swapped_estimates_are_detected() {
        let refs = vec![vec![s1(), s2()]];
        let in_order = pit_loss(&refs, &[vec![s1(), s2()]], &[4]).unwrap();
        let swapped = pit_loss(&refs, &[vec![s2(), s1()]], &[4]).unwrap();
        assert_eq!(swapped.perms[0], vec![1, 0]);
        assert!((in_order.loss - swapped.loss).abs() < 1e-9);
        assert_eq!(swapped.reordered[0], vec![s1(), s2()]);
    }

    #[test]
    fn best_is_never_worse_than_identity() {
        let refs = vec![vec![vec![0.3, -0.2, 0.9, 0.4], vec![-0.5, 0.7, 0.1, 0.2]]];
        let ests = vec![vec![vec![0.1, 0.6, -0.3, 0.2], vec![0.4, -0.1, 0.8, 0.5]]];
        let out = pit_loss(&refs, &ests, &[4]).unwrap();
        let scores = pairwise_si_snr(&refs[0], &ests[0], 4);
        let identity = (scores[0][0] + scores[1][1]) / 2.0;
        let swapped = (scores[0][1] + scores[1][0]) / 2.0;
        assert!(out.max_snr[0] >= identity);
        assert!(out.max_snr[0] >= swapped);
    }

    #[test]
    fn padding_does_not_affect_loss() {
        let refs = vec![
            vec![s1(), s2()],
            vec![vec![0.5, -0.5, 0.0, 0.0], vec![0.2, 0.3, 0.0, 0.0]],
        ];
        let mut ests = vec![
            vec![s2(), s1()],
            vec![vec![0.4, -0.6, 0.0, 0.0], vec![0.1, 0.4, 0.0, 0.0]],
        ];
        let before = pit_loss(&refs, &ests, &[4, 2]).unwrap();
        ests[1][0][2] = 9.0;
        ests[1][1][3] = -4.0;
        let after = pit_loss(&refs, &ests, &[4, 2]).unwrap();
        assert_eq!(before.max_snr[1], after.max_snr[1]);
        assert_eq!(before.loss, after.loss);
    }

    #[test]
    fn loss_gradient_matches_finite_difference() {
        let refs = vec![vec![vec![0.3, -0.2, 0.9, 0.4, 0.0], vec![-0.5, 0.7, 0.1, 0.2, 0.0]]];
        let ests = vec![vec![vec![0.1, 0.6, -0.3, 0.2, 0.7], vec![0.4, -0.1, 0.8, 0.5, -0.2]]];
        let out = pit_loss(&refs, &ests, &[4]).unwrap();
        let grads = pit_loss_grad(&refs, &ests, &[4], &out.perms);
        assert_eq!(grads[0][0][4], 0.0);

        let h = 1e-6;
        let mut up = ests.clone();
        up[0][1][2] += h;
        let mut down = ests.clone();
        down[0][1][2] -= h;
        let numeric = (pit_loss(&refs, &up, &[4]).unwrap().loss - pit_loss(&refs, &down, &[4]).unwrap().loss) / (2.0 * h);
        assert!((numeric - grads[0][1][2]).abs() < 1e-5);
    }

    #[test]
    fn mismatched_batch_is_an_error() {
        let refs = vec![vec![s1(), s2()]];
        assert!(pit_loss(&refs, &[], &[4]).is_err());
        assert!(pit_loss(&refs, &[vec![s1()]], &[4]).is_err());
        assert!(pit_loss(&refs, &[vec![s1(), s2()]], &[5]).is_err());
    }

    #[test]
    fn mixture_baseline_averages_over_references() {
        let refs = vec![vec![s1(), s2()]];
        let mix: Vec<f64> = s1().iter().zip(s2()).map(|(a, b)| a + b).collect();
        let out = mixture_si_snr(&refs, &[mix.clone()], &[4]).unwrap();
        let expected = (si_snr(&mix, &s1(), 4) + si_snr(&mix, &s2(), 4)) / 2.0;
        assert!((out[0] - expected).abs() < 1e-12);
        // orthogonal equal-energy sources sit at 0 dB
        assert!(out[0].abs() < 1e-6);
        assert!(mixture_si_snr(&refs, &[], &[4]).is_err());
    }
}
