//! Offline evaluation of a trained separator.
//!
//! Every corpus listed in `data.dsets` is scored on its `cv` and `tt` splits,
//! one whole utterance at a time. Results (overall and per gender pair) go
//! to `{solver.result_dir}/result.json` together with the training config.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::checkpoint;
use crate::config::Config;
use crate::context::{RunContext, MODEL_STREAM};
use crate::data::{
    ChunkDataset, ChunkMode, CorpusPaths, DataLoader, DatasetOptions, GenderCategory, GenderMapper, GenderStats,
    LoaderOptions,
};
use crate::error::{Error, Result};
use crate::loss::{mixture_si_snr, pit_loss, sdr};
use crate::network::{Domain, Module, TasNet, TasNetConfig};

pub const SPLITS: [&str; 2] = ["cv", "tt"];

/// Scores of one split of one corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    pub examples: usize,
    pub total_loss: f64,
    #[serde(rename = "total_SISNRi")]
    pub total_sisnri: f64,
    #[serde(rename = "total_SDRi", default, skip_serializing_if = "Option::is_none")]
    pub total_sdri: Option<f64>,
    #[serde(rename = "gender_SISNRi")]
    pub gender_sisnri: BTreeMap<GenderCategory, f64>,
    #[serde(rename = "gender_SDRi", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gender_sdri: BTreeMap<GenderCategory, f64>,
}

/// Contents of `result.json`: `{dset: {cv, tt}, ..., tr_config, tt_config}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    #[serde(flatten)]
    pub datasets: BTreeMap<String, BTreeMap<String, SplitResult>>,
    pub tr_config: serde_json::Value,
    /// Config the evaluator itself was built from.
    pub tt_config: serde_json::Value,
}

/// SDR of the unprocessed mixtures, keyed `{split}` and `{split}_{G}`.
pub type MixSdr = BTreeMap<String, f64>;

pub fn load_mix_sdr(path: &Path) -> Result<MixSdr> {
    let file = File::open(path)
        .map_err(|e| Error::Data(format!("cannot open mixture SDR table '{}': {e}", path.display())))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn mix_sdr_entry(table: &MixSdr, key: &str) -> Result<f64> {
    table.get(key).copied()
        .ok_or_else(|| Error::Data(format!("mixture SDR table has no `{key}` entry")))
}

pub struct Evaluator {
    ctx: RunContext,
    data: Config,
    model: TasNet,
    tr_config: Config,
    tt_config: serde_json::Value,
    train_dset: String,
    dsets: Vec<(String, CorpusPaths)>,
    result_dir: PathBuf,
    compute_sdr: bool,
    num_workers: usize,
}

impl Evaluator {
    pub fn new(config: &Config, ctx: RunContext) -> Result<Evaluator> {
        let solver = config.section("solver")?;
        let data = config.section("data")?;
        let train_config: PathBuf = solver.req("train_config")?;
        let result_dir: PathBuf = solver.req("result_dir")?;
        let checkpoint_path: PathBuf = solver.req("checkpoint")?;
        let compute_sdr: bool = solver.or("compute_sdr", false)?;
        let num_workers: usize = solver.or("num_workers", 0)?;
        let names: Vec<String> = data.req("dsets")?;

        let dsets = names.into_iter()
            .map(|name| CorpusPaths::from_config(&data, &name).map(|paths| (name, paths)))
            .collect::<Result<Vec<_>>>()?;

        let tr_config = Config::load(&train_config, None)?;
        let model_section = if tr_config.contains("model.gen") { "model.gen" } else { "model" };
        let model_config = TasNetConfig::from_config(&tr_config.section(model_section)?)?;
        let train_dset: String = tr_config.or("data.dset", "wsj0".to_string())?;

        let record = checkpoint::load(&checkpoint_path)?;
        let mut model = TasNet::new(model_config, &mut ctx.rng(MODEL_STREAM));
        model.load_state_dict(&record.state_dict, true)?;
        info!(
            "evaluating '{}' (epoch {:?}, step {}), trained on {train_dset}",
            checkpoint_path.display(),
            record.epoch,
            record.step
        );

        fs::create_dir_all(&result_dir)?;
        Ok(Evaluator {
            ctx,
            data,
            model,
            tr_config,
            tt_config: serde_json::to_value(config.value())?,
            train_dset,
            dsets,
            result_dir,
            compute_sdr,
            num_workers,
        })
    }

    fn loader(&self, paths: &CorpusPaths, name: &str, split: &str) -> Result<DataLoader> {
        let mut options = DatasetOptions::from_config(&self.data, name, self.model.num_spk(), ChunkMode::Eval)?;
        options.segment = None;
        let dataset = ChunkDataset::open(paths, split, options)?;
        DataLoader::new(
            Arc::new(dataset),
            LoaderOptions { batch_size: 1, shuffle: false, drop_last: false, num_workers: self.num_workers, seed: 0 },
        )
    }

    pub fn run(&self) -> Result<EvalReport> {
        let names: Vec<&str> = self.dsets.iter().map(|(n, _)| n.as_str()).collect();
        info!("evaluating datasets: {}", names.join(", "));

        let mut datasets = BTreeMap::new();
        for (name, paths) in &self.dsets {
            let domain = if *name == self.train_dset { Domain::Source } else { Domain::Target };
            let gender = GenderMapper::load_or_empty(&paths.gender_path())?;
            let mix_sdr = if self.compute_sdr { Some(load_mix_sdr(&paths.mix_sdr_path())?) } else { None };

            let mut splits = BTreeMap::new();
            for split in SPLITS {
                let loader = self.loader(paths, name, split)?;
                let result = evaluate_split(
                    &self.ctx,
                    &self.model,
                    &loader,
                    domain,
                    &gender,
                    mix_sdr.as_ref().map(|t| (t, split)),
                )?;
                info!(
                    "{name}/{split}: {} utterances, SI-SNRi {:.3} dB{}",
                    result.examples,
                    result.total_sisnri,
                    result.total_sdri.map(|v| format!(", SDRi {v:.3} dB")).unwrap_or_default()
                );
                splits.insert(split.to_string(), result);
            }
            datasets.insert(name.clone(), splits);
        }

        let report = EvalReport {
            datasets,
            tr_config: serde_json::to_value(self.tr_config.value())?,
            tt_config: self.tt_config.clone(),
        };
        let path = self.result_dir.join("result.json");
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()?;
        info!("results written to '{}'", path.display());
        Ok(report)
    }
}

/// Scores every utterance of `loader`. With `mix_sdr`, SDR improvements are
/// computed against the table entries of the given split.
pub fn evaluate_split(
    ctx: &RunContext,
    model: &TasNet,
    loader: &DataLoader,
    domain: Domain,
    gender: &GenderMapper,
    mix_sdr: Option<(&MixSdr, &str)>,
) -> Result<SplitResult> {
    let mut total_loss = 0.0;
    let mut total_sisnri = 0.0;
    let mut total_sdr = 0.0;
    let mut count = 0usize;
    let mut gender_sisnri = GenderStats::default();
    let mut gender_sdr = GenderStats::default();
    let mut unmapped = 0usize;

    for batch in loader.iter(0) {
        let batch = batch?;
        let pass = model.forward(ctx, &batch.mixtures, domain);
        let pit = pit_loss(&batch.references, &pass.estimates, &batch.lengths)?;
        let mix_snr = mixture_si_snr(&batch.references, &batch.mixtures, &batch.lengths)?;
        total_loss += pit.loss * batch.len() as f64;

        for (b, uid) in batch.uids.iter().enumerate() {
            let len = batch.lengths[b];
            let sisnri = pit.max_snr[b] - mix_snr[b];
            total_sisnri += sisnri;
            let g = gender.category(uid);
            if g.is_none() {
                unmapped += 1;
            }
            if let Some(g) = g {
                gender_sisnri.add(g, sisnri);
            }

            if mix_sdr.is_some() {
                let refs = &batch.references[b];
                let value = pit.reordered[b].iter().zip(refs)
                    .map(|(est, r)| sdr(est, r, len))
                    .sum::<f64>() / refs.len().max(1) as f64;
                total_sdr += value;
                if let Some(g) = g {
                    gender_sdr.add(g, value);
                }
            }
        }
        count += batch.len();
    }

    if count == 0 {
        return Err(Error::Data("evaluation split yields no utterances".into()));
    }
    if unmapped > 0 && !gender.is_empty() {
        warn!("{unmapped} utterances have no gender entry");
    }

    let n = count as f64;
    let mut result = SplitResult {
        examples: count,
        total_loss: total_loss / n,
        total_sisnri: total_sisnri / n,
        gender_sisnri: gender_sisnri.means(),
        ..SplitResult::default()
    };
    if let Some((table, split)) = mix_sdr {
        result.total_sdri = Some(total_sdr / n - mix_sdr_entry(table, split)?);
        for (g, mean) in gender_sdr.means() {
            let base = mix_sdr_entry(table, &format!("{split}_{g}"))?;
            result.gender_sdri.insert(g, mean - base);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_result_omits_missing_sdr_and_empty_categories() {
        let result = SplitResult {
            examples: 2,
            total_loss: -3.0,
            total_sisnri: 4.5,
            total_sdri: None,
            gender_sisnri: BTreeMap::from([(GenderCategory::MF, 4.5)]),
            gender_sdri: BTreeMap::new(),
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["total_SISNRi"], 4.5);
        assert!(v.get("total_SDRi").is_none());
        assert!(v.get("gender_SDRi").is_none());
        assert_eq!(v["gender_SISNRi"].as_object().unwrap().len(), 1);
        assert_eq!(v["gender_SISNRi"]["MF"], 4.5);
    }

    #[test]
    fn report_flattens_datasets_next_to_config() {
        let splits = BTreeMap::from([("cv".to_string(), SplitResult::default())]);
        let report = EvalReport {
            datasets: BTreeMap::from([("wsj0".to_string(), splits)]),
            tr_config: serde_json::json!({"solver": {"epochs": 1}}),
            tt_config: serde_json::json!({"data": {"dsets": ["wsj0"]}}),
        };
        let v = serde_json::to_value(&report).unwrap();
        assert!(v["wsj0"]["cv"].is_object());
        assert_eq!(v["tr_config"]["solver"]["epochs"], 1);
        assert_eq!(v["tt_config"]["data"]["dsets"][0], "wsj0");
    }

    #[test]
    fn missing_mix_sdr_key_is_a_data_error() {
        let table = MixSdr::from([("cv".to_string(), 0.2)]);
        assert_eq!(mix_sdr_entry(&table, "cv").unwrap(), 0.2);
        assert!(matches!(mix_sdr_entry(&table, "tt_MM"), Err(Error::Data(_))));
    }
}
