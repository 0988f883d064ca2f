//! Domain-adversarial training: the separator is trained with PIT loss on a
//! labeled source corpus while a domain classifier on its encoder features
//! pushes source and target features together.

use log::info;
use rand::rngs::StdRng;
use serde::Deserialize;

use crate::checkpoint::{CheckpointRecord, SaveMode, Saver};
use crate::config::Config;
use crate::context::{RunContext, CRITIC_STREAM, MODEL_STREAM, PENALTY_STREAM, SOURCE_STREAM, TARGET_STREAM};
use crate::data::{Batch, InfiniteLoader};
use crate::error::{Error, Result};
use crate::logging::{Dashboard, Scalars};
use crate::loss::{pit_loss, pit_loss_grad, BceLoss};
use crate::network::domain_cls::interpolate;
use crate::network::{Domain, DomainClassifier, Module, TasNet, TasNetConfig, TasNetPass};
use crate::optim::Optimizer;
use crate::schedule::{LambdaScheduler, ReduceLROnPlateau};
use crate::train::experiment::{guarded_step, open_corpus, optional_record, CorpusSet, Experiment, LoaderSpec};
use crate::train::validate::run_validation;
use crate::train::TrainingLoop;

const SRC_LABEL: f64 = 0.0;
const TGT_LABEL: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AdvLoss {
    #[serde(rename = "gan")]
    Gan,
    #[serde(rename = "wgan-gp")]
    WganGp,
}

/// Loss and logit gradients of one adversarial objective.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvTerms {
    pub loss: f64,
    pub d_src: Vec<f64>,
    pub d_tgt: Vec<f64>,
}

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len().max(1) as f64
}

fn mean_grad(x: &[f64], sign: f64) -> Vec<f64> {
    vec![sign / x.len().max(1) as f64; x.len()]
}

/// Classifier objective, without the gradient penalty: the classifier should
/// tell source (label 0) from target (label 1).
pub fn critic_terms(adv: AdvLoss, src: &[f64], tgt: &[f64]) -> AdvTerms {
    match adv {
        AdvLoss::WganGp => AdvTerms {
            loss: mean(src) - mean(tgt),
            d_src: mean_grad(src, 1.0),
            d_tgt: mean_grad(tgt, -1.0),
        },
        AdvLoss::Gan => AdvTerms {
            loss: BceLoss::loss(src, SRC_LABEL) + BceLoss::loss(tgt, TGT_LABEL),
            d_src: BceLoss::derivative(src, SRC_LABEL),
            d_tgt: BceLoss::derivative(tgt, TGT_LABEL),
        },
    }
}

/// Separator objective: fool the classifier with flipped labels.
pub fn generator_terms(adv: AdvLoss, src: &[f64], tgt: &[f64]) -> AdvTerms {
    match adv {
        AdvLoss::WganGp => AdvTerms {
            loss: mean(tgt) - mean(src),
            d_src: mean_grad(src, -1.0),
            d_tgt: mean_grad(tgt, 1.0),
        },
        AdvLoss::Gan => AdvTerms {
            loss: BceLoss::loss(src, TGT_LABEL) + BceLoss::loss(tgt, SRC_LABEL),
            d_src: BceLoss::derivative(src, TGT_LABEL),
            d_tgt: BceLoss::derivative(tgt, SRC_LABEL),
        },
    }
}

fn scaled(g: &[f64], factor: f64) -> Vec<f64> {
    g.iter().map(|x| x * factor).collect()
}

pub struct DaganTrainer {
    config: Config,
    ctx: RunContext,
    experiment: Experiment,
    dashboard: Dashboard,
    saver: Saver,

    model: TasNet,
    classifier: DomainClassifier,
    g_optim: Optimizer,
    d_optim: Optimizer,
    lr_scheduler: Option<ReduceLROnPlateau>,
    lg_scheduler: LambdaScheduler,
    ld_scheduler: LambdaScheduler,
    penalty_rng: StdRng,

    source: CorpusSet,
    target: CorpusSet,
    src_stream: InfiniteLoader,
    tgt_stream: InfiniteLoader,

    adv_loss: AdvLoss,
    gp_lambda: f64,
    g_grad_clip: f64,
    d_grad_clip: f64,
    g_iters: usize,
    d_iters: usize,
    pretrain_d_step: u64,
    total_steps: u64,
    valid_step: u64,

    step: u64,
    last_step: Option<u64>,
    valid_time: u64,
}

impl DaganTrainer {
    pub fn new(config: Config, ctx: RunContext) -> Result<DaganTrainer> {
        let solver = config.section("solver")?;
        let data = config.section("data")?;

        let total_steps: u64 = solver.req("total_steps")?;
        let mut step: u64 = solver.or("start_step", 0)?;
        let batch_size: usize = solver.req("batch_size")?;
        let d_grad_clip: f64 = solver.req("D_grad_clip")?;
        let g_grad_clip: f64 = solver.req("G_grad_clip")?;
        let num_workers: usize = solver.or("num_workers", 0)?;
        let valid_step: u64 = solver.req("valid_step")?;
        let pretrain_d_step: u64 = solver.or("pretrain_d_step", 0)?;
        let g_iters: usize = solver.req("g_iters")?;
        let d_iters: usize = solver.req("d_iters")?;
        let adv_loss: AdvLoss = solver.req("adv_loss")?;
        let gp_lambda: f64 = solver.req("gp_lambda")?;
        let max_save_num: usize = solver.req("max_save_num")?;
        let resume: String = solver.or("resume", String::new())?;
        let resume_optim: bool = solver.or("resume_optim", false)?;
        if valid_step == 0 {
            return Err(Error::Config("solver.valid_step must be positive".into()));
        }

        let lg_scheduler = LambdaScheduler::from_config(&solver.section("Lg_scheduler")?)?;
        let ld_scheduler = LambdaScheduler::from_config(&solver.section("Ld_scheduler")?)?;
        let mut g_optim = Optimizer::from_config(&config.section("g_optim")?)?;
        let mut d_optim = Optimizer::from_config(&config.section("d_optim")?)?;
        let mut lr_scheduler = ReduceLROnPlateau::from_config(&solver)?;

        let model_config = TasNetConfig::from_config(&config.section("model.gen")?)?;
        let mut model = TasNet::new(model_config, &mut ctx.rng(MODEL_STREAM));
        let mut classifier = DomainClassifier::from_config(
            model.config.enc_dim,
            &config.section("model.domain_cls")?,
            &mut ctx.rng(CRITIC_STREAM),
        )?;

        let spec = LoaderSpec {
            batch_size,
            num_workers,
            num_spk: model.num_spk(),
            drop_last: true,
            chunked_valid: true,
        };
        let src_name: String = data.or("dset", "wsj0".to_string())?;
        let tgt_name: String = data.or("uns_dset", "vctk".to_string())?;
        let source = open_corpus(&data, &src_name, spec, &ctx, SOURCE_STREAM)?;
        let target = open_corpus(&data, &tgt_name, spec, &ctx, TARGET_STREAM)?;
        let src_stream = InfiniteLoader::new(source.train.clone());
        let tgt_stream = InfiniteLoader::new(target.train.clone());

        if let Some(record) = optional_record(&resume)? {
            info!("resuming from step {}, previous score {:?}", record.step, record.valid_score);
            model.load_state_dict(&record.state_dict, true)?;
            let aux = record.aux_state_dict.as_ref()
                .ok_or_else(|| Error::Checkpoint("checkpoint carries no domain classifier weights".into()))?;
            classifier.load_state_dict(aux, true)?;
            if resume_optim {
                match (&record.optim, &record.aux_optim) {
                    (Some(g), Some(d)) => {
                        g_optim.load_state_dict(g)?;
                        d_optim.load_state_dict(d)?;
                    }
                    _ => return Err(Error::Checkpoint("checkpoint carries no optimizer state".into())),
                }
            }
            if let (Some(sched), Some(saved)) = (lr_scheduler.as_mut(), record.lr_scheduler.as_ref()) {
                *sched = saved.clone();
            }
            step = record.step + 1;
        }

        let experiment = Experiment::open(&config, false)?;
        let dashboard = experiment.dashboard()?;
        let saver = Saver::new(max_save_num, &experiment.save_dir, SaveMode::Min)?;

        Ok(DaganTrainer {
            penalty_rng: ctx.rng(PENALTY_STREAM),
            config,
            ctx,
            experiment,
            dashboard,
            saver,
            model,
            classifier,
            g_optim,
            d_optim,
            lr_scheduler,
            lg_scheduler,
            ld_scheduler,
            source,
            target,
            src_stream,
            tgt_stream,
            adv_loss,
            gp_lambda,
            g_grad_clip,
            d_grad_clip,
            g_iters,
            d_iters,
            pretrain_d_step,
            total_steps,
            valid_step,
            step,
            last_step: None,
            valid_time: 0,
        })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    fn next_pair(&mut self) -> Result<(Batch, Batch)> {
        Ok((self.src_stream.next_batch()?, self.tgt_stream.next_batch()?))
    }

    fn forward_pair(&self, src: &Batch, tgt: &Batch) -> (TasNetPass, TasNetPass) {
        (
            self.model.forward(&self.ctx, &src.mixtures, Domain::Source),
            self.model.forward(&self.ctx, &tgt.mixtures, Domain::Target),
        )
    }

    // -----------------------------------------------------------------------
    // Separator: supervised step
    // -----------------------------------------------------------------------

    fn train_sup_once(&mut self, step: u64) -> Result<()> {
        let batch = self.src_stream.next_batch()?;
        let pass = self.model.forward(&self.ctx, &batch.mixtures, Domain::Source);
        let pit = pit_loss(&batch.references, &pass.estimates, &batch.lengths)?;
        let grad_est = pit_loss_grad(&batch.references, &pass.estimates, &batch.lengths, &pit.perms);
        let back = self.model.backward(&self.ctx, &pass, Some(&grad_est), None);
        self.dashboard.add_scalar("train/sup_loss", pit.loss, step)?;
        guarded_step(&mut self.g_optim, &mut self.model, back.grads, self.g_grad_clip, &mut self.dashboard, "sup", step)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Domain classifier
    // -----------------------------------------------------------------------

    fn train_dis_once(&mut self, step: u64, pretrain: bool) -> Result<()> {
        let prefix = if pretrain { "pretrain_" } else { "" };
        let mut total_d_loss = 0.0;
        let mut total_gp = 0.0;
        let mut correct = 0usize;
        let mut judged = 0usize;

        for _ in 0..self.d_iters {
            let (src, tgt) = self.next_pair()?;
            let (src_pass, tgt_pass) = self.forward_pair(&src, &tgt);
            let fake = self.classifier.forward(&src_pass.features);
            let real = self.classifier.forward(&tgt_pass.features);
            let terms = critic_terms(self.adv_loss, &fake.logits, &real.logits);

            let (mut grads, _) = self.classifier.backward(&fake, &terms.d_src);
            grads.merge(&self.classifier.backward(&real, &terms.d_tgt).0);
            let mut d_loss = terms.loss;

            match self.adv_loss {
                AdvLoss::WganGp => {
                    let points = interpolate(&tgt_pass.features, &src_pass.features, &mut self.penalty_rng);
                    let (gp, mut gp_grads) = self.classifier.gradient_penalty(&points);
                    gp_grads.scale(self.gp_lambda);
                    grads.merge(&gp_grads);
                    d_loss += self.gp_lambda * gp;
                    total_gp += gp;
                }
                AdvLoss::Gan => {
                    let src_ok = BceLoss::correct(&fake.logits, SRC_LABEL);
                    let tgt_ok = BceLoss::correct(&real.logits, TGT_LABEL);
                    self.dashboard.add_scalar(
                        &format!("train/{prefix}dis_src_domain_acc"),
                        src_ok as f64 / fake.logits.len().max(1) as f64,
                        step,
                    )?;
                    self.dashboard.add_scalar(
                        &format!("train/{prefix}dis_tgt_domain_acc"),
                        tgt_ok as f64 / real.logits.len().max(1) as f64,
                        step,
                    )?;
                    correct += src_ok + tgt_ok;
                    judged += fake.logits.len() + real.logits.len();
                }
            }

            let d_lambda = self.ld_scheduler.value(step);
            grads.scale(d_lambda);
            total_d_loss += d_loss;
            guarded_step(&mut self.d_optim, &mut self.classifier, grads, self.d_grad_clip, &mut self.dashboard, "d", step)?;
        }

        let iters = self.d_iters.max(1) as f64;
        self.dashboard.add_scalar(&format!("train/{prefix}d_loss"), total_d_loss / iters, step)?;
        match self.adv_loss {
            AdvLoss::WganGp => {
                self.dashboard.add_scalar(&format!("train/{prefix}gradient_penalty"), total_gp / iters, step)?;
            }
            AdvLoss::Gan if judged > 0 => {
                self.dashboard.add_scalar(&format!("train/{prefix}dis_domain_acc"), correct as f64 / judged as f64, step)?;
            }
            AdvLoss::Gan => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Separator: adversarial step
    // -----------------------------------------------------------------------

    fn train_gen_once(&mut self, step: u64) -> Result<()> {
        let mut total_g_loss = 0.0;
        let mut weighted_g_loss = 0.0;
        let mut correct = 0usize;
        let mut judged = 0usize;

        for _ in 0..self.g_iters {
            let (src, tgt) = self.next_pair()?;
            let (src_pass, tgt_pass) = self.forward_pair(&src, &tgt);
            let fake = self.classifier.forward(&src_pass.features);
            let real = self.classifier.forward(&tgt_pass.features);
            let terms = generator_terms(self.adv_loss, &fake.logits, &real.logits);
            if self.adv_loss == AdvLoss::Gan {
                correct += BceLoss::correct(&fake.logits, SRC_LABEL) + BceLoss::correct(&real.logits, TGT_LABEL);
                judged += fake.logits.len() + real.logits.len();
            }

            let g_lambda = self.lg_scheduler.value(step);
            let (_, d_src_feat) = self.classifier.backward(&fake, &scaled(&terms.d_src, g_lambda));
            let (_, d_tgt_feat) = self.classifier.backward(&real, &scaled(&terms.d_tgt, g_lambda));
            let mut grads = self.model.backward(&self.ctx, &src_pass, None, Some(&d_src_feat)).grads;
            grads.merge(&self.model.backward(&self.ctx, &tgt_pass, None, Some(&d_tgt_feat)).grads);

            guarded_step(&mut self.g_optim, &mut self.model, grads, self.g_grad_clip, &mut self.dashboard, "g", step)?;
            total_g_loss += terms.loss;
            weighted_g_loss += terms.loss * g_lambda;
        }

        let iters = self.g_iters.max(1) as f64;
        self.dashboard.add_scalar("train/g_loss", total_g_loss / iters, step)?;
        self.dashboard.add_scalar("train/weighted_g_loss", weighted_g_loss / iters, step)?;
        if judged > 0 {
            self.dashboard.add_scalar("train/gen_domain_acc", correct as f64 / judged as f64, step)?;
        }
        Ok(())
    }

    fn log_meta(&mut self, meta: &Scalars, dset: &str) -> Result<()> {
        for (key, value) in meta {
            self.dashboard.add_scalar(&format!("valid/{dset}_{key}"), *value, self.valid_time)?;
        }
        Ok(())
    }
}

impl TrainingLoop for DaganTrainer {
    fn setup(&mut self) -> Result<()> {
        if self.pretrain_d_step > 0 {
            info!("pre-training the domain classifier for {} steps", self.pretrain_d_step);
        }
        for step in 0..self.pretrain_d_step {
            self.train_dis_once(step, true)?;
        }
        info!("adversarial training steps {}..{}", self.step, self.total_steps);
        Ok(())
    }

    fn run_step(&mut self) -> Result<()> {
        let step = self.step;
        self.train_sup_once(step)?;
        self.train_dis_once(step, false)?;
        self.train_gen_once(step)?;
        self.last_step = Some(step);
        self.step += 1;
        Ok(())
    }

    fn should_validate(&self) -> bool {
        self.last_step.is_some_and(|s| s % self.valid_step == 0 && s != 0)
    }

    fn validate(&mut self) -> Result<Scalars> {
        let with_cls = |label| match self.adv_loss {
            AdvLoss::Gan => Some((&self.classifier, label)),
            AdvLoss::WganGp => None,
        };
        let src = run_validation(&self.ctx, &self.model, &self.source.valid, Domain::Source, &self.source.gender, with_cls(SRC_LABEL))?
            .step_scalars();
        let tgt = run_validation(&self.ctx, &self.model, &self.target.valid, Domain::Target, &self.target.gender, with_cls(TGT_LABEL))?
            .step_scalars();

        let (src_name, tgt_name) = (self.source.name.clone(), self.target.name.clone());
        self.log_meta(&src, &src_name)?;
        self.log_meta(&tgt, &tgt_name)?;
        self.dashboard.flush()?;

        let mut scores = Scalars::new();
        for (name, meta) in [(&src_name, &src), (&tgt_name, &tgt)] {
            for (key, value) in meta {
                scores.insert(format!("{name}_{key}"), *value);
            }
        }
        Ok(scores)
    }

    fn checkpoint(&mut self, scores: &Scalars) -> Result<()> {
        let Some(step) = self.last_step else { return Ok(()) };
        let src_loss = scores.get(&format!("{}_valid_loss", self.source.name)).copied();
        let tgt_loss = scores.get(&format!("{}_valid_loss", self.target.name)).copied().unwrap_or(f64::NAN);

        if let (Some(sched), Some(loss)) = (self.lr_scheduler.as_mut(), src_loss) {
            sched.step(loss, &mut self.g_optim);
        }

        let mut record = CheckpointRecord::new(self.model.state_dict())
            .with_config(&self.config)?
            .with_scores(scores);
        record.step = step;
        record.optim = Some(self.g_optim.state_dict()?);
        record.aux_state_dict = Some(self.classifier.state_dict());
        record.aux_optim = Some(self.d_optim.state_dict()?);
        record.lr_scheduler = self.lr_scheduler.clone();

        self.saver.update(&record, tgt_loss, &step.to_string())?;
        self.saver.force_save(&record, "latest")?;
        self.valid_time += 1;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.step >= self.total_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wgan_terms_are_mean_differences() {
        let t = critic_terms(AdvLoss::WganGp, &[1.0, 3.0], &[0.5, 0.5, 2.0]);
        assert!((t.loss - (2.0 - 1.0)).abs() < 1e-12);
        assert_eq!(t.d_src, vec![0.5, 0.5]);
        assert!(t.d_tgt.iter().all(|g| (g + 1.0 / 3.0).abs() < 1e-12));

        let g = generator_terms(AdvLoss::WganGp, &[1.0, 3.0], &[0.5, 0.5, 2.0]);
        assert!((g.loss + t.loss).abs() < 1e-12);
    }

    #[test]
    fn gan_terms_flip_labels_for_the_generator() {
        let src = [2.0, -1.0];
        let tgt = [0.3];
        let d = critic_terms(AdvLoss::Gan, &src, &tgt);
        let g = generator_terms(AdvLoss::Gan, &src, &tgt);
        assert!((d.loss - (BceLoss::loss(&src, 0.0) + BceLoss::loss(&tgt, 1.0))).abs() < 1e-12);
        assert!((g.loss - (BceLoss::loss(&src, 1.0) + BceLoss::loss(&tgt, 0.0))).abs() < 1e-12);
        // σ(x) − y differs by exactly 1/n between the two labelings
        for (a, b) in d.d_src.iter().zip(&g.d_src) {
            assert!((a - b - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn gan_terms_match_finite_differences() {
        let src = vec![0.4, -0.7, 1.1];
        let tgt = vec![-0.2, 0.9];
        let terms = critic_terms(AdvLoss::Gan, &src, &tgt);
        let h = 1e-6;
        for i in 0..src.len() {
            let mut p = src.clone();
            p[i] += h;
            let mut m = src.clone();
            m[i] -= h;
            let num = (critic_terms(AdvLoss::Gan, &p, &tgt).loss - critic_terms(AdvLoss::Gan, &m, &tgt).loss) / (2.0 * h);
            assert!((num - terms.d_src[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn adv_loss_parses_config_names() {
        let c = Config::from_yaml_str("a: gan\nb: wgan-gp\nc: hinge").unwrap();
        assert_eq!(c.req::<AdvLoss>("a").unwrap(), AdvLoss::Gan);
        assert_eq!(c.req::<AdvLoss>("b").unwrap(), AdvLoss::WganGp);
        assert!(matches!(c.req::<AdvLoss>("c"), Err(Error::Config(_))));
    }
}
