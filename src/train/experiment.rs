//! Plumbing shared by the training loops: experiment directories, corpus
//! loaders and the guarded optimizer step.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use rand::Rng;

use crate::checkpoint::{self, CheckpointRecord};
use crate::config::Config;
use crate::context::RunContext;
use crate::data::{ChunkDataset, ChunkMode, CorpusPaths, DataLoader, DatasetOptions, GenderMapper, LoaderOptions};
use crate::error::{Error, Result};
use crate::logging::{Dashboard, JsonlSink};
use crate::network::params::{clip_grad_norm, Gradients, Module};
use crate::optim::Optimizer;

/// Checkpoint and log directories of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub save_dir: PathBuf,
    pub log_dir: PathBuf,
    pub resumed: bool,
}

impl Experiment {
    /// With `allow_resume` and a non-empty `solver.resume_exp_name`, reopens
    /// that experiment (both directories must exist). Otherwise creates
    /// `{exp_name}-{timestamp}` under `solver.save_dir` and `solver.log_dir`
    /// and stores the config snapshot there.
    pub fn open(config: &Config, allow_resume: bool) -> Result<Experiment> {
        let solver = config.section("solver")?;
        let save_root: PathBuf = solver.req("save_dir")?;
        let log_root: PathBuf = solver.req("log_dir")?;

        if allow_resume {
            let resume: String = solver.or("resume_exp_name", String::new())?;
            if !resume.is_empty() {
                let save_dir = save_root.join(&resume);
                let log_dir = log_root.join(&resume);
                if !save_dir.is_dir() || !log_dir.is_dir() {
                    return Err(Error::ResumeNotFound(resume));
                }
                info!("resuming experiment {resume}");
                return Ok(Experiment { name: resume, save_dir, log_dir, resumed: true });
            }
        }

        let exp_name: String = solver.req("exp_name")?;
        let stamp = chrono::Local::now().format("%Y_%m_%d_%H_%M_%S");
        let name = format!("{exp_name}-{stamp}");
        let save_dir = save_root.join(&name);
        let log_dir = log_root.join(&name);
        fs::create_dir_all(&save_dir)?;
        fs::create_dir_all(&log_dir)?;
        config.save(&save_dir.join("config.yaml"))?;
        info!("experiment {name}: checkpoints in '{}'", save_dir.display());
        Ok(Experiment { name, save_dir, log_dir, resumed: false })
    }

    pub fn dashboard(&self) -> Result<Dashboard> {
        Ok(Dashboard::new(Box::new(JsonlSink::open(&self.log_dir)?)))
    }

    pub fn latest(&self) -> PathBuf {
        self.save_dir.join("latest.json")
    }
}

/// How the loaders of one corpus are built.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoaderSpec {
    pub batch_size: usize,
    pub num_workers: usize,
    pub num_spk: usize,
    pub drop_last: bool,
    /// Validate on fixed-length chunks instead of whole utterances.
    pub chunked_valid: bool,
}

/// Training and validation loaders of one corpus.
pub(crate) struct CorpusSet {
    pub name: String,
    pub train: DataLoader,
    pub valid: DataLoader,
    pub gender: GenderMapper,
}

pub(crate) fn open_corpus(
    data: &Config,
    name: &str,
    spec: LoaderSpec,
    ctx: &RunContext,
    stream: u64,
) -> Result<CorpusSet> {
    let paths = CorpusPaths::from_config(data, name)?;
    let mut rng = ctx.rng(stream);

    let train_opts = DatasetOptions::from_config(data, name, spec.num_spk, ChunkMode::Train)?;
    let mut valid_opts = DatasetOptions::from_config(data, name, spec.num_spk, ChunkMode::Eval)?;
    if !spec.chunked_valid {
        valid_opts.segment = None;
    }

    let train = DataLoader::new(
        Arc::new(ChunkDataset::open(&paths, "tr", train_opts)?),
        LoaderOptions {
            batch_size: spec.batch_size,
            shuffle: true,
            drop_last: spec.drop_last,
            num_workers: spec.num_workers,
            seed: rng.gen(),
        },
    )?;
    let valid = DataLoader::new(
        Arc::new(ChunkDataset::open(&paths, "cv", valid_opts)?),
        LoaderOptions {
            batch_size: spec.batch_size,
            shuffle: false,
            drop_last: false,
            num_workers: spec.num_workers,
            seed: rng.gen(),
        },
    )?;
    let gender = GenderMapper::load_or_empty(&paths.gender_path())?;
    info!("{name}: {} training batches, {} validation batches", train.len(), valid.len());
    Ok(CorpusSet { name: name.to_string(), train, valid, gender })
}

/// Clips `grads` to `max_norm` and applies them. A non-finite norm skips the
/// update, logs a warning and a `train/{tag}_nan_skip` scalar; returns
/// whether the step was taken.
pub(crate) fn guarded_step<M: Module + ?Sized>(
    optimizer: &mut Optimizer,
    model: &mut M,
    mut grads: Gradients,
    max_norm: f64,
    dashboard: &mut Dashboard,
    tag: &str,
    step: u64,
) -> Result<bool> {
    let norm = clip_grad_norm(&mut grads, max_norm);
    if !norm.is_finite() {
        warn!("{tag} gradient norm is {norm} at step {step}, skipping update");
        dashboard.add_scalar(&format!("train/{tag}_nan_skip"), 1.0, step)?;
        return Ok(false);
    }
    optimizer.step(model, &grads);
    Ok(true)
}

/// Loads a checkpoint named by a config value; empty means none.
pub(crate) fn optional_record(path: &str) -> Result<Option<CheckpointRecord>> {
    if path.is_empty() {
        return Ok(None);
    }
    info!("loading checkpoint '{path}'");
    checkpoint::load(Path::new(path)).map(Some)
}
