//! Unsupervised separation training (mixture invariance through remixing).
//!
//! The separator's outputs for the two halves of a batch are summed source by
//! source into new mixtures ("remixes"). A multi-scale waveform critic learns
//! to tell remixes from real mixtures, and the separator learns to make them
//! indistinguishable. An energy term keeps the estimates from drifting in
//! scale and an optional cyclic term asks the remixes to separate back into
//! the original mixtures.

use log::info;
use serde::Deserialize;

use crate::checkpoint::{CheckpointRecord, SaveMode, Saver};
use crate::config::Config;
use crate::context::{RunContext, CRITIC_STREAM, MODEL_STREAM, SOURCE_STREAM};
use crate::data::InfiniteLoader;
use crate::error::{Error, Result};
use crate::logging::{scalars, Dashboard, Scalars};
use crate::math::Signals;
use crate::network::critic::{hinge_critic_loss, hinge_generator_loss};
use crate::network::{CriticConfig, Domain, Gradients, Module, MultiScaleCritic, TasNet, TasNetConfig};
use crate::optim::Optimizer;
use crate::schedule::ReduceLROnPlateau;
use crate::train::experiment::{guarded_step, open_corpus, optional_record, CorpusSet, Experiment, LoaderSpec};
use crate::train::validate::run_validation;
use crate::train::TrainingLoop;

const EPS: f64 = 1e-8;

/// How re-separated remixes are matched back to the original mixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleAssign {
    /// Cheaper of the identity and swapped assignment, identity on ties.
    Min,
    /// Always the identity assignment.
    Fixed,
}

/// Remix `i·K + k` is `estimates[i][k] + estimates[i + B/2][k]`.
pub fn remix(estimates: &[Signals]) -> Signals {
    let half = estimates.len() / 2;
    let mut out = Vec::new();
    for i in 0..half {
        for (a, b) in estimates[i].iter().zip(&estimates[i + half]) {
            out.push(a.iter().zip(b).map(|(x, y)| x + y).collect());
        }
    }
    out
}

/// Adds the gradient w.r.t. each remix onto both estimates it was built from.
pub fn remix_backward(d_remix: &Signals, num_spk: usize, d_estimates: &mut [Signals]) {
    let half = d_estimates.len() / 2;
    for (r, d) in d_remix.iter().enumerate() {
        let (i, k) = (r / num_spk, r % num_spk);
        for j in [i, i + half] {
            for (acc, g) in d_estimates[j][k].iter_mut().zip(d) {
                *acc += g;
            }
        }
    }
}

fn energy(x: &[f64], len: usize) -> f64 {
    x.iter().take(len).map(|v| v * v).sum()
}

/// `Le = mean_b ((Σ_k E(est_bk) − E(mix_b)) / (E(mix_b) + ε))²` over the
/// unpadded region, and its gradient w.r.t. every estimate sample.
pub fn energy_term(mixtures: &[Vec<f64>], estimates: &[Signals], lengths: &[usize]) -> (f64, Vec<Signals>) {
    let batch = mixtures.len().max(1) as f64;
    let mut loss = 0.0;
    let mut grads = Vec::with_capacity(estimates.len());
    for ((mix, est), &len) in mixtures.iter().zip(estimates).zip(lengths) {
        let e_mix = energy(mix, len);
        let e_est: f64 = est.iter().map(|s| energy(s, len)).sum();
        let ratio = (e_est - e_mix) / (e_mix + EPS);
        loss += ratio * ratio;
        let coef = 4.0 * ratio / (batch * (e_mix + EPS));
        grads.push(
            est.iter()
                .map(|s| s.iter().enumerate().map(|(t, x)| if t < len { coef * x } else { 0.0 }).collect())
                .collect(),
        );
    }
    (loss / batch, grads)
}

/// `‖x − y‖² / (‖x‖² + ε)` over `len` samples and its gradient w.r.t. `y`.
fn nmse(x: &[f64], y: &[f64], len: usize) -> (f64, Vec<f64>) {
    let norm = energy(x, len) + EPS;
    let mut dist = 0.0;
    let grad = y.iter().enumerate()
        .map(|(t, &yt)| {
            if t >= len {
                return 0.0;
            }
            let diff = yt - x.get(t).copied().unwrap_or(0.0);
            dist += diff * diff;
            2.0 * diff / norm
        })
        .collect();
    (dist / norm, grad)
}

fn summed(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Cyclic-consistency term for two-speaker models. `reseparated[r]` is the
/// separation of remix `r`; for pair `i` (mixtures `i` and `i + B/2`) the
/// remixes are `2i` and `2i + 1`, whose outputs `a_{r,c}` must add back up to
/// the original mixtures. Returns the loss averaged over pairs and its
/// gradient w.r.t. `reseparated`.
pub fn cycle_term(
    mixtures: &[Vec<f64>],
    lengths: &[usize],
    reseparated: &[Signals],
    assign: CycleAssign,
) -> (f64, Vec<Signals>) {
    let half = mixtures.len() / 2;
    let mut grads: Vec<Signals> = reseparated.iter()
        .map(|s| s.iter().map(|c| vec![0.0; c.len()]).collect())
        .collect();
    let mut total = 0.0;

    for i in 0..half {
        let j = i + half;
        let (r0, r1) = (2 * i, 2 * i + 1);
        let (a0, a1) = (&reseparated[r0], &reseparated[r1]);

        // identity: x_i ≈ a00 + a10, x_j ≈ a01 + a11
        let (id_i, g_id_i) = nmse(&mixtures[i], &summed(&a0[0], &a1[0]), lengths[i]);
        let (id_j, g_id_j) = nmse(&mixtures[j], &summed(&a0[1], &a1[1]), lengths[j]);
        // swapped: x_i ≈ a00 + a11, x_j ≈ a01 + a10
        let (sw_i, g_sw_i) = nmse(&mixtures[i], &summed(&a0[0], &a1[1]), lengths[i]);
        let (sw_j, g_sw_j) = nmse(&mixtures[j], &summed(&a0[1], &a1[0]), lengths[j]);

        let identity = id_i + id_j;
        let swapped = sw_i + sw_j;
        let use_swap = assign == CycleAssign::Min && swapped < identity;

        let routes: [(usize, usize, &Vec<f64>); 4] = if use_swap {
            [(r0, 0, &g_sw_i), (r1, 1, &g_sw_i), (r0, 1, &g_sw_j), (r1, 0, &g_sw_j)]
        } else {
            [(r0, 0, &g_id_i), (r1, 0, &g_id_i), (r0, 1, &g_id_j), (r1, 1, &g_id_j)]
        };
        for (r, c, g) in routes {
            for (acc, x) in grads[r][c].iter_mut().zip(g) {
                *acc += x / half as f64;
            }
        }
        total += if use_swap { swapped } else { identity };
    }
    (total / half.max(1) as f64, grads)
}

fn zeros_like(signals: &[Signals]) -> Vec<Signals> {
    signals.iter().map(|s| s.iter().map(|c| vec![0.0; c.len()]).collect()).collect()
}

fn add_scaled(acc: &mut [Signals], g: &[Signals], factor: f64) {
    for (a, b) in acc.iter_mut().zip(g) {
        for (ac, bc) in a.iter_mut().zip(b) {
            for (x, y) in ac.iter_mut().zip(bc) {
                *x += factor * y;
            }
        }
    }
}

pub struct UnsTrainer {
    config: Config,
    ctx: RunContext,
    experiment: Experiment,
    dashboard: Dashboard,
    saver: Saver,

    model: TasNet,
    critic: MultiScaleCritic,
    g_optim: Optimizer,
    d_optim: Optimizer,
    lr_scheduler: Option<ReduceLROnPlateau>,

    corpus: CorpusSet,
    stream: InfiniteLoader,

    g_grad_clip: f64,
    d_grad_clip: f64,
    g_iters: usize,
    d_iters: usize,
    le_lambda: f64,
    lc_lambda: f64,
    cycle_assign: CycleAssign,
    total_steps: u64,
    valid_step: u64,

    step: u64,
    last_step: Option<u64>,
    valid_time: u64,
}

impl UnsTrainer {
    pub fn new(config: Config, ctx: RunContext) -> Result<UnsTrainer> {
        let solver = config.section("solver")?;
        let data = config.section("data")?;

        let total_steps: u64 = solver.req("total_steps")?;
        let mut step: u64 = solver.or("start_step", 0)?;
        let batch_size: usize = solver.req("batch_size")?;
        let d_grad_clip: f64 = solver.req("D_grad_clip")?;
        let g_grad_clip: f64 = solver.req("G_grad_clip")?;
        let num_workers: usize = solver.or("num_workers", 0)?;
        let valid_step: u64 = solver.req("valid_step")?;
        let g_iters: usize = solver.req("g_iters")?;
        let d_iters: usize = solver.req("d_iters")?;
        let lc_lambda: f64 = solver.req("Lc_lambda")?;
        let le_lambda: f64 = solver.req("Le_lambda")?;
        let cycle_assign: CycleAssign = solver.or("cycle_assign", CycleAssign::Min)?;
        let max_save_num: usize = solver.req("max_save_num")?;
        let resume: String = solver.or("resume", String::new())?;
        let resume_optim: bool = solver.or("resume_optim", false)?;
        if valid_step == 0 {
            return Err(Error::Config("solver.valid_step must be positive".into()));
        }
        if batch_size < 2 || batch_size % 2 != 0 {
            return Err(Error::Config(format!("remixing needs an even batch_size, got {batch_size}")));
        }

        let model_config = TasNetConfig::from_config(&config.section("model.gen")?)?;
        if lc_lambda > 0.0 && model_config.num_spk != 2 {
            return Err(Error::Config("the cyclic term needs a two-speaker model".into()));
        }
        let mut model = TasNet::new(model_config, &mut ctx.rng(MODEL_STREAM));
        let critic_config = CriticConfig::from_config(&config.section("model.dis")?)?;
        let mut critic = MultiScaleCritic::new(critic_config, &mut ctx.rng(CRITIC_STREAM));
        let mut g_optim = Optimizer::from_config(&config.section("g_optim")?)?;
        let mut d_optim = Optimizer::from_config(&config.section("d_optim")?)?;
        let mut lr_scheduler = ReduceLROnPlateau::from_config(&solver)?;

        let dset: String = data.or("dset", "wsj0".to_string())?;
        let spec = LoaderSpec {
            batch_size,
            num_workers,
            num_spk: model.num_spk(),
            drop_last: true,
            chunked_valid: true,
        };
        let corpus = open_corpus(&data, &dset, spec, &ctx, SOURCE_STREAM)?;
        let stream = InfiniteLoader::new(corpus.train.clone());

        if let Some(record) = optional_record(&resume)? {
            info!("resuming from step {}, previous score {:?}", record.step, record.valid_score);
            model.load_state_dict(&record.state_dict, true)?;
            let aux = record.aux_state_dict.as_ref()
                .ok_or_else(|| Error::Checkpoint("checkpoint carries no critic weights".into()))?;
            critic.load_state_dict(aux, true)?;
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

        Ok(UnsTrainer {
            config,
            ctx,
            experiment,
            dashboard,
            saver,
            model,
            critic,
            g_optim,
            d_optim,
            lr_scheduler,
            corpus,
            stream,
            g_grad_clip,
            d_grad_clip,
            g_iters,
            d_iters,
            le_lambda,
            lc_lambda,
            cycle_assign,
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

    fn train_dis_once(&mut self, step: u64) -> Result<()> {
        let mut total_d_loss = 0.0;
        for _ in 0..self.d_iters {
            // ── Fake: remixed separator output ─────────────────────────────
            let batch = self.stream.next_batch()?;
            let pass = self.model.forward(&self.ctx, &batch.mixtures, Domain::Source);
            let fake = self.critic.forward(&remix(&pass.estimates));

            // ── Real: another batch of mixtures ────────────────────────────
            let real_batch = self.stream.next_batch()?;
            let real = self.critic.forward(&real_batch.mixtures);

            let (d_loss, d_real, d_fake) = hinge_critic_loss(&real, &fake);
            let (mut grads, _) = self.critic.backward(&real, &d_real);
            grads.merge(&self.critic.backward(&fake, &d_fake).0);
            guarded_step(&mut self.d_optim, &mut self.critic, grads, self.d_grad_clip, &mut self.dashboard, "d", step)?;
            total_d_loss += d_loss;
        }
        self.dashboard.add_scalar("train/d_loss", total_d_loss / self.d_iters.max(1) as f64, step)?;
        Ok(())
    }

    fn train_gen_once(&mut self, step: u64) -> Result<()> {
        let num_spk = self.model.num_spk();
        let mut totals = [0.0; 4];

        for _ in 0..self.g_iters {
            let batch = self.stream.next_batch()?;
            let pass = self.model.forward(&self.ctx, &batch.mixtures, Domain::Source);
            let remixes = remix(&pass.estimates);

            let fake = self.critic.forward(&remixes);
            let (gan_loss, d_fake) = hinge_generator_loss(&fake);
            let (_, d_remix) = self.critic.backward(&fake, &d_fake);
            let mut d_est = zeros_like(&pass.estimates);
            remix_backward(&d_remix, num_spk, &mut d_est);

            let (le, d_le) = energy_term(&batch.mixtures, &pass.estimates, &batch.lengths);
            add_scaled(&mut d_est, &d_le, self.le_lambda);

            let mut grads = Gradients::new();
            let mut lc = 0.0;
            if self.lc_lambda > 0.0 {
                let cycle = self.model.forward(&self.ctx, &remixes, Domain::Source);
                let (loss, mut d_cycle) = cycle_term(&batch.mixtures, &batch.lengths, &cycle.estimates, self.cycle_assign);
                for g in d_cycle.iter_mut().flatten().flatten() {
                    *g *= self.lc_lambda;
                }
                let back = self.model.backward(&self.ctx, &cycle, Some(&d_cycle), None);
                grads.merge(&back.grads);
                remix_backward(&back.input, num_spk, &mut d_est);
                lc = loss;
            }
            grads.merge(&self.model.backward(&self.ctx, &pass, Some(&d_est), None).grads);

            let g_loss = gan_loss + self.le_lambda * le + self.lc_lambda * lc;
            guarded_step(&mut self.g_optim, &mut self.model, grads, self.g_grad_clip, &mut self.dashboard, "g", step)?;
            for (acc, v) in totals.iter_mut().zip([g_loss, gan_loss, le, lc]) {
                *acc += v;
            }
        }

        let iters = self.g_iters.max(1) as f64;
        for (tag, total) in ["train/total_g_loss", "train/g_loss", "train/Le_loss", "train/Lc_loss"].iter().zip(totals) {
            self.dashboard.add_scalar(tag, total / iters, step)?;
        }
        Ok(())
    }
}

impl TrainingLoop for UnsTrainer {
    fn setup(&mut self) -> Result<()> {
        info!("unsupervised training steps {}..{}", self.step, self.total_steps);
        Ok(())
    }

    fn run_step(&mut self) -> Result<()> {
        let step = self.step;
        self.train_dis_once(step)?;
        self.train_gen_once(step)?;
        self.last_step = Some(step);
        self.step += 1;
        Ok(())
    }

    fn should_validate(&self) -> bool {
        self.last_step.is_some_and(|s| s % self.valid_step == 0 && s != 0)
    }

    fn validate(&mut self) -> Result<Scalars> {
        let report = run_validation(
            &self.ctx,
            &self.model,
            &self.corpus.valid,
            Domain::Source,
            &self.corpus.gender,
            None,
        )?;
        self.dashboard.add_scalar("valid/pit_loss", report.loss, self.valid_time)?;
        self.dashboard.flush()?;
        Ok(scalars([("valid_loss", report.loss), ("valid_snr", report.snr)]))
    }

    fn checkpoint(&mut self, scores: &Scalars) -> Result<()> {
        let Some(step) = self.last_step else { return Ok(()) };
        let loss = scores.get("valid_loss").copied().unwrap_or(f64::NAN);
        if let Some(sched) = self.lr_scheduler.as_mut() {
            sched.step(loss, &mut self.g_optim);
        }

        let mut record = CheckpointRecord::new(self.model.state_dict())
            .with_config(&self.config)?
            .with_scores(scores);
        record.step = step;
        record.optim = Some(self.g_optim.state_dict()?);
        record.aux_state_dict = Some(self.critic.state_dict());
        record.aux_optim = Some(self.d_optim.state_dict()?);
        record.lr_scheduler = self.lr_scheduler.clone();

        self.saver.update(&record, loss, &step.to_string())?;
        self.saver.force_save(&record, "latest")?;
        self.valid_time += 1;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.step >= self.total_steps
    }
}
