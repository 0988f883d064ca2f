//! Epoch-based supervised training: plain PIT training (`baseline`), with
//! corpus-level feature normalization (`cmvn`), or with domain-specific
//! normalization statistics adapted on an unlabeled target corpus
//! (`transnorm`).

use log::{info, warn};

use crate::checkpoint::{self, CheckpointRecord, SaveMode, Saver};
use crate::config::Config;
use crate::context::{RunContext, MODEL_STREAM, SOURCE_STREAM, TARGET_STREAM};
use crate::data::InfiniteLoader;
use crate::error::{Error, Result};
use crate::eval::Evaluator;
use crate::logging::{scalars, Dashboard, Scalars};
use crate::loss::{mixture_si_snr, pit_loss, pit_loss_grad};
use crate::network::{Domain, Module, NormType, TasNet, TasNetConfig};
use crate::optim::Optimizer;
use crate::schedule::ReduceLROnPlateau;
use crate::train::experiment::{guarded_step, open_corpus, optional_record, CorpusSet, Experiment, LoaderSpec};
use crate::train::validate::run_validation;
use crate::train::TrainingLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisedVariant {
    Baseline,
    /// Frozen codec, fixed corpus mean/variance computed before training.
    Cmvn,
    /// Target-corpus batches keep the target normalization statistics moving.
    TransNorm,
}

pub struct SupervisedTrainer {
    variant: SupervisedVariant,
    config: Config,
    ctx: RunContext,
    experiment: Experiment,
    dashboard: Dashboard,
    saver: Saver,

    model: TasNet,
    optimizer: Optimizer,
    lr_scheduler: Option<ReduceLROnPlateau>,

    source: CorpusSet,
    /// Unlabeled corpus of `transnorm`; validated every epoch, never saved on.
    target: Option<CorpusSet>,
    target_stream: Option<InfiniteLoader>,

    epochs: u64,
    /// Next epoch to train.
    epoch: u64,
    /// Epoch whose validation is pending.
    trained: Option<u64>,
    step: u64,
    grad_clip: f64,
    save_freq: i64,
    num_workers: usize,
    /// Corpora scored by the evaluator once training ends; empty when
    /// `solver.test_after_finished` is off.
    test_dsets: Vec<String>,
}

impl SupervisedTrainer {
    pub fn new(variant: SupervisedVariant, mut config: Config, ctx: RunContext) -> Result<SupervisedTrainer> {
        let solver = config.section("solver")?;
        let data = config.section("data")?;

        let epochs: u64 = solver.req("epochs")?;
        let mut epoch: u64 = solver.or("start_epoch", 0)?;
        let batch_size: usize = solver.req("batch_size")?;
        let grad_clip: f64 = solver.req("grad_clip")?;
        let num_workers: usize = solver.or("num_workers", 0)?;
        let save_freq: i64 = solver.or("save_freq", -1)?;
        let max_save_num: usize = solver.req("max_save_num")?;
        let resume_optim: bool = solver.or("resume_optim", false)?;
        let test_after_finished: bool = solver.or("test_after_finished", false)?;
        let pretrained: String = match variant {
            SupervisedVariant::Cmvn => solver.req("pretrained")?,
            _ => solver.or("pretrained", String::new())?,
        };
        if variant == SupervisedVariant::Cmvn && pretrained.is_empty() {
            return Err(Error::MissingConfig("solver.pretrained".into()));
        }

        let mut model_config = TasNetConfig::from_config(&config.section("model")?)?;
        match variant {
            SupervisedVariant::Baseline => {}
            SupervisedVariant::Cmvn => {
                // the snapshot must describe the model that is actually saved
                model_config.norm_type = NormType::Cmvn;
                config.set("model.norm_type", NormType::Cmvn);
            }
            SupervisedVariant::TransNorm => {
                if model_config.norm_type != NormType::TransNorm {
                    return Err(Error::Config("transnorm training needs `model.norm_type: TN`".into()));
                }
            }
        }
        let mut optimizer = Optimizer::from_config(&config.section("optim")?)?;
        let mut lr_scheduler = ReduceLROnPlateau::from_config(&solver)?;

        let dset: String = data.or("dset", "wsj0".to_string())?;
        let spec = LoaderSpec {
            batch_size,
            num_workers,
            num_spk: model_config.num_spk,
            drop_last: variant == SupervisedVariant::TransNorm,
            chunked_valid: false,
        };
        let source = open_corpus(&data, &dset, spec, &ctx, SOURCE_STREAM)?;
        let (target, target_stream) = if variant == SupervisedVariant::TransNorm {
            let uns_dset: String = data.or("uns_dset", "vctk".to_string())?;
            let target = open_corpus(&data, &uns_dset, spec, &ctx, TARGET_STREAM)?;
            let stream = InfiniteLoader::new(target.train.clone());
            (Some(target), Some(stream))
        } else {
            (None, None)
        };
        info!("supervised corpus: {dset}");
        let test_dsets = match (&target, test_after_finished) {
            (_, false) => Vec::new(),
            (Some(target), true) => vec![dset.clone(), target.name.clone()],
            (None, true) => vec![dset.clone()],
        };

        let mut model = TasNet::new(model_config, &mut ctx.rng(MODEL_STREAM));
        if let Some(record) = optional_record(&pretrained)? {
            let strict = variant != SupervisedVariant::Cmvn;
            let missing = model.load_state_dict(&record.state_dict, strict)?;
            if !missing.is_empty() {
                info!("pretrained model lacks {missing:?}");
            }
            info!("loaded pretrained model (epoch {:?}, step {}): {:?}", record.epoch, record.step, record.valid_score);
        }

        let experiment = Experiment::open(&config, true)?;
        let mut dashboard = experiment.dashboard()?;
        let mut step = 0;
        let saver = if experiment.resumed {
            let record = checkpoint::load(&experiment.latest())?;
            let last = record.epoch
                .ok_or_else(|| Error::Checkpoint("latest checkpoint carries no epoch".into()))?;
            info!("resuming after epoch {last}, previous score {:?}", record.valid_score);
            model.load_state_dict(&record.state_dict, true)?;
            if resume_optim {
                let state = record.optim.as_ref()
                    .ok_or_else(|| Error::Checkpoint("latest checkpoint carries no optimizer state".into()))?;
                optimizer.load_state_dict(state)?;
            }
            if let (Some(sched), Some(saved)) = (lr_scheduler.as_mut(), record.lr_scheduler.as_ref()) {
                *sched = saved.clone();
            }
            epoch = last + 1;
            step = record.step;
            dashboard.set_epoch(epoch + 1);
            dashboard.set_step(step + 1);
            Saver::resume(max_save_num, &experiment.save_dir, SaveMode::Max, |r| r.score("valid_sisnri"))?
        } else {
            Saver::new(max_save_num, &experiment.save_dir, SaveMode::Max)?
        };

        if variant == SupervisedVariant::Cmvn {
            model.freeze_codec();
            info!("encoder and decoder frozen");
        }
        info!("model has {} trainable parameters", model.num_parameters());

        Ok(SupervisedTrainer {
            variant,
            config,
            ctx,
            experiment,
            dashboard,
            saver,
            model,
            optimizer,
            lr_scheduler,
            source,
            target,
            target_stream,
            epochs,
            epoch,
            trained: None,
            step,
            grad_clip,
            save_freq,
            num_workers,
            test_dsets,
        })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn model(&self) -> &TasNet {
        &self.model
    }

    /// Two passes over every training mixture: frame-weighted mean of the
    /// encoder output, then the variance about that mean.
    fn compute_norm_stats(&mut self) -> Result<()> {
        let dataset = self.source.train.dataset();
        let uids: Vec<String> = dataset.uids().map(str::to_string).collect();
        info!("computing feature statistics over {} utterances", uids.len());
        let (mean, var) = feature_stats(&self.ctx, &self.model, &uids, |uid| dataset.load_channel(uid, "mix"))?;
        self.model.set_mv(&mean, &var)
    }

    fn train_one_epoch(&mut self, epoch: u64) -> Result<()> {
        let mut total_loss = 0.0;
        let mut total_sisnri = 0.0;
        let mut count = 0usize;

        for batch in self.source.train.iter(epoch) {
            let batch = batch?;
            let pass = self.model.forward(&self.ctx, &batch.mixtures, Domain::Source);
            let pit = pit_loss(&batch.references, &pass.estimates, &batch.lengths)?;
            let grad_est = pit_loss_grad(&batch.references, &pass.estimates, &batch.lengths, &pit.perms);
            let back = self.model.backward(&self.ctx, &pass, Some(&grad_est), None);
            self.model.track_stats(&pass, Domain::Source);

            // ── Target batch only moves the target statistics ─────────────
            if let Some(stream) = self.target_stream.as_mut() {
                let target = stream.next_batch()?;
                let target_pass = self.model.forward(&self.ctx, &target.mixtures, Domain::Target);
                self.model.track_stats(&target_pass, Domain::Target);
            }

            guarded_step(
                &mut self.optimizer,
                &mut self.model,
                back.grads,
                self.grad_clip,
                &mut self.dashboard,
                "sep",
                self.step,
            )?;

            let mix_snr = mixture_si_snr(&batch.references, &batch.mixtures, &batch.lengths)?;
            total_loss += pit.loss * batch.len() as f64;
            total_sisnri += pit.max_snr.iter().zip(&mix_snr).map(|(s, m)| s - m).sum::<f64>();
            count += batch.len();

            self.dashboard.log_step_info("train", &scalars([("iter_loss", pit.loss)]))?;
            self.step += 1;
            self.dashboard.step();
        }

        if count == 0 {
            return Err(Error::Data(format!("training set of {} yields no batches", self.source.name)));
        }
        let meta = scalars([
            ("epoch_loss", total_loss / count as f64),
            ("epoch_sisnri", total_sisnri / count as f64),
        ]);
        info!("epoch {epoch}: loss {:.4}, SI-SNRi {:.3}", meta["epoch_loss"], meta["epoch_sisnri"]);
        self.dashboard.log_epoch_info("train", &meta)
    }

    /// Evaluation config for the final model: the latest checkpoint, the
    /// training `data` section restricted to `test_dsets`, results in the
    /// log directory.
    fn test_config(&self) -> Config {
        let mut tt = Config::from_value(serde_yaml::Value::Mapping(Default::default()));
        if let Some(data) = self.config.get("data") {
            tt.set("data", data);
        }
        tt.set("data.dsets", &self.test_dsets);
        tt.set("solver.train_config", self.experiment.save_dir.join("config.yaml"));
        tt.set("solver.checkpoint", self.experiment.latest());
        tt.set("solver.result_dir", &self.experiment.log_dir);
        tt.set("solver.compute_sdr", false);
        tt.set("solver.num_workers", self.num_workers);
        tt
    }

    fn record(&self, epoch: u64, scores: &Scalars) -> Result<CheckpointRecord> {
        let mut record = CheckpointRecord::new(self.model.state_dict())
            .with_config(&self.config)?
            .with_scores(scores);
        record.epoch = Some(epoch);
        record.step = self.step;
        record.optim = Some(self.optimizer.state_dict()?);
        record.lr_scheduler = self.lr_scheduler.clone();
        Ok(record)
    }
}

impl TrainingLoop for SupervisedTrainer {
    fn setup(&mut self) -> Result<()> {
        if self.variant == SupervisedVariant::Cmvn {
            self.compute_norm_stats()?;
        }
        info!("training epochs {}..{}", self.epoch, self.epochs);
        Ok(())
    }

    fn run_step(&mut self) -> Result<()> {
        let epoch = self.epoch;
        self.train_one_epoch(epoch)?;
        self.trained = Some(epoch);
        self.epoch += 1;
        Ok(())
    }

    fn should_validate(&self) -> bool {
        self.trained.is_some()
    }

    fn validate(&mut self) -> Result<Scalars> {
        let report = run_validation(
            &self.ctx,
            &self.model,
            &self.source.valid,
            Domain::Source,
            &self.source.gender,
            None,
        )?;
        self.dashboard.log_epoch_info("valid", &report.epoch_scalars(&self.source.name))?;

        if let Some(target) = &self.target {
            let other = run_validation(&self.ctx, &self.model, &target.valid, Domain::Target, &target.gender, None)?;
            self.dashboard.log_epoch_info("valid", &other.epoch_scalars(&target.name))?;
        }

        Ok(scalars([("valid_loss", report.loss), ("valid_sisnri", report.sisnri)]))
    }

    fn checkpoint(&mut self, scores: &Scalars) -> Result<()> {
        let Some(epoch) = self.trained.take() else { return Ok(()) };
        let record = self.record(epoch, scores)?;
        let sisnri = scores.get("valid_sisnri").copied().unwrap_or(f64::NAN);

        self.saver.update(&record, sisnri, &epoch.to_string())?;
        if self.save_freq > 0 && (epoch + 1) % self.save_freq as u64 == 0 {
            self.saver.force_save(&record, &format!("{epoch}_force"))?;
        }
        self.saver.force_save(&record, "latest")?;

        if let Some(sched) = self.lr_scheduler.as_mut() {
            match scores.get("valid_loss") {
                Some(loss) => {
                    sched.step(*loss, &mut self.optimizer);
                }
                None => warn!("no validation loss to step the lr scheduler on"),
            }
        }
        self.dashboard.epoch();
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.epoch >= self.epochs
    }

    fn finish(&mut self) -> Result<()> {
        if self.test_dsets.is_empty() {
            return Ok(());
        }
        info!("training finished, testing the latest model on {}", self.test_dsets.join(", "));
        let report = Evaluator::new(&self.test_config(), self.ctx.clone())?.run()?;
        let mut meta = Scalars::new();
        for (name, splits) in &report.datasets {
            for (split, result) in splits {
                meta.insert(format!("{name}_{split}_sisnri"), result.total_sisnri);
            }
        }
        self.dashboard.log_epoch_info("test", &meta)
    }
}

/// Corpus-level mean and variance of the raw encoder output. Each
/// utterance contributes in proportion to its frame count.
pub(crate) fn feature_stats<F>(
    ctx: &RunContext,
    model: &TasNet,
    uids: &[String],
    load: F,
) -> Result<(Vec<f64>, Vec<f64>)>
where
    F: Fn(&str) -> Result<Vec<f64>> + Sync + Send,
{
    let n = model.config.enc_dim;
    if uids.is_empty() {
        return Err(Error::Data("no utterances to compute feature statistics on".into()));
    }

    let sums = ctx.map_batch(uids, |uid| -> Result<(Vec<f64>, usize)> {
        let spec = model.encode(&load(uid)?);
        Ok((spec.sum_rows().data[0].clone(), spec.rows))
    });
    let mut mean = vec![0.0; n];
    let mut frames = 0usize;
    for item in sums {
        let (sum, t) = item?;
        for (m, s) in mean.iter_mut().zip(sum) {
            *m += s;
        }
        frames += t;
    }
    for m in &mut mean {
        *m /= frames as f64;
    }

    let sq = ctx.map_batch(uids, |uid| -> Result<Vec<f64>> {
        let spec = model.encode(&load(uid)?);
        let mut acc = vec![0.0; n];
        for row in &spec.data {
            for (j, x) in row.iter().enumerate() {
                acc[j] += (x - mean[j]).powi(2);
            }
        }
        Ok(acc)
    });
    let mut var = vec![0.0; n];
    for item in sq {
        for (v, s) in var.iter_mut().zip(item?) {
            *v += s;
        }
    }
    for v in &mut var {
        *v /= frames as f64;
    }
    Ok((mean, var))
}
