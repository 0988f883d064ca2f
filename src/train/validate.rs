use log::debug;

use crate::context::RunContext;
use crate::data::{DataLoader, GenderMapper, GenderStats};
use crate::error::{Error, Result};
use crate::logging::Scalars;
use crate::loss::{mixture_si_snr, pit_loss, BceLoss};
use crate::network::{Domain, DomainClassifier, TasNet};

/// Aggregate separation quality of one pass over a held-out loader.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub examples: usize,
    /// Mean PIT loss per example.
    pub loss: f64,
    /// Mean best-permutation SI-SNR.
    pub snr: f64,
    pub sisnri: f64,
    pub gender_sisnri: GenderStats,
    /// Share of items the domain classifier put in the expected domain.
    pub domain_acc: Option<f64>,
}

impl ValidationReport {
    /// `{prefix}_epoch_loss`, `{prefix}_epoch_sisnri` and one
    /// `{prefix}_epoch_{G}_sisnri` per non-empty gender category.
    pub fn epoch_scalars(&self, prefix: &str) -> Scalars {
        let mut meta = Scalars::new();
        meta.insert(format!("{prefix}_epoch_loss"), self.loss);
        meta.insert(format!("{prefix}_epoch_sisnri"), self.sisnri);
        for (g, value) in self.gender_sisnri.means() {
            meta.insert(format!("{prefix}_epoch_{g}_sisnri"), value);
        }
        meta
    }

    /// `valid_loss`, `valid_snr` and, when measured, `valid_domain_acc`.
    pub fn step_scalars(&self) -> Scalars {
        let mut meta = Scalars::new();
        meta.insert("valid_loss".to_string(), self.loss);
        meta.insert("valid_snr".to_string(), self.snr);
        if let Some(acc) = self.domain_acc {
            meta.insert("valid_domain_acc".to_string(), acc);
        }
        meta
    }
}

/// Runs `model` over every batch of `loader` without updating anything.
/// `classifier` pairs a domain classifier with the label this loader's
/// domain should receive.
pub fn run_validation(
    ctx: &RunContext,
    model: &TasNet,
    loader: &DataLoader,
    domain: Domain,
    gender: &GenderMapper,
    classifier: Option<(&DomainClassifier, f64)>,
) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let mut total_loss = 0.0;
    let mut total_snr = 0.0;
    let mut total_sisnri = 0.0;
    let mut correct = 0usize;
    let mut judged = 0usize;

    for batch in loader.iter(0) {
        let batch = batch?;
        let pass = model.forward(ctx, &batch.mixtures, domain);
        let pit = pit_loss(&batch.references, &pass.estimates, &batch.lengths)?;
        let mix_snr = mixture_si_snr(&batch.references, &batch.mixtures, &batch.lengths)?;

        for (b, uid) in batch.uids.iter().enumerate() {
            let sisnri = pit.max_snr[b] - mix_snr[b];
            total_loss -= pit.max_snr[b];
            total_snr += pit.max_snr[b];
            total_sisnri += sisnri;
            if let Some(g) = gender.category(uid) {
                report.gender_sisnri.add(g, sisnri);
            }
        }
        report.examples += batch.len();

        if let Some((cls, label)) = classifier {
            let logits = cls.forward(&pass.features).logits;
            correct += BceLoss::correct(&logits, label);
            judged += logits.len();
        }
    }

    if report.examples == 0 {
        return Err(Error::Data("validation set yields no examples".into()));
    }
    let n = report.examples as f64;
    report.loss = total_loss / n;
    report.snr = total_snr / n;
    report.sisnri = total_sisnri / n;
    if judged > 0 {
        report.domain_acc = Some(correct as f64 / judged as f64);
    }
    debug!("validated {} examples: loss {:.4}, SI-SNRi {:.3}", report.examples, report.loss, report.sisnri);
    Ok(report)
}
