//! Top-N checkpoint retention.
//!
//! A `Saver` owns one directory of JSON checkpoint records. `update` keeps
//! the best `max_num` records by validation score, `force_save` writes
//! unconditionally (`latest`, periodic snapshots) and is never evicted.
//! The ranking lives only in memory; `Saver::resume` rebuilds it by reading
//! every record back from disk.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::params::StateDict;
use crate::schedule::ReduceLROnPlateau;

const EXTENSION: &str = "json";

/// Everything needed to continue or evaluate a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub valid_score: BTreeMap<String, f64>,
    pub state_dict: StateDict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optim: Option<serde_json::Value>,
    /// Discriminator weights of the adversarial loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_state_dict: Option<StateDict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_optim: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_scheduler: Option<ReduceLROnPlateau>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Written by `force_save`; such records never take part in ranking.
    #[serde(default)]
    pub forced: bool,
}

impl CheckpointRecord {
    pub fn new(state_dict: StateDict) -> CheckpointRecord {
        CheckpointRecord { state_dict, ..CheckpointRecord::default() }
    }

    pub fn with_config(mut self, config: &Config) -> Result<CheckpointRecord> {
        self.config = serde_json::to_value(config.value())?;
        Ok(self)
    }

    /// Copies the finite entries of `scores`; JSON has no NaN.
    pub fn with_scores(mut self, scores: &BTreeMap<String, f64>) -> CheckpointRecord {
        self.valid_score = scores.iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        self
    }

    pub fn score(&self, key: &str) -> Option<f64> {
        self.valid_score.get(key).copied()
    }
}

/// Reads one checkpoint file.
pub fn load(path: &Path) -> Result<CheckpointRecord> {
    let file = File::open(path)
        .map_err(|e| Error::Checkpoint(format!("cannot open '{}': {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::Checkpoint(format!("cannot parse '{}': {e}", path.display())))
}

/// Whether higher or lower scores are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    Max,
    Min,
}

impl SaveMode {
    fn better(self, a: f64, b: f64) -> bool {
        match self {
            SaveMode::Max => a > b,
            SaveMode::Min => a < b,
        }
    }

    /// Best-first ordering.
    fn rank(self, a: f64, b: f64) -> Ordering {
        match self {
            SaveMode::Max => b.total_cmp(&a),
            SaveMode::Min => a.total_cmp(&b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Retained {
    score: f64,
    name: String,
}

#[derive(Debug)]
pub struct Saver {
    max_num: usize,
    dir: PathBuf,
    mode: SaveMode,
    /// Best first.
    retained: Vec<Retained>,
}

impl Saver {
    /// Fresh saver over an existing, writable directory.
    pub fn new(max_num: usize, dir: &Path, mode: SaveMode) -> Result<Saver> {
        if !dir.is_dir() {
            return Err(Error::Checkpoint(format!(
                "checkpoint directory '{}' does not exist",
                dir.display()
            )));
        }
        Ok(Saver { max_num, dir: dir.to_path_buf(), mode, retained: Vec::new() })
    }

    /// Saver over a directory left by an earlier run. Every non-forced record
    /// is read back and ranked by `score_fn`; records it cannot score are
    /// left on disk but not ranked. Ranked records beyond `max_num` are
    /// deleted, worst first.
    pub fn resume<F>(max_num: usize, dir: &Path, mode: SaveMode, score_fn: F) -> Result<Saver>
    where
        F: Fn(&CheckpointRecord) -> Option<f64>,
    {
        let mut saver = Saver::new(max_num, dir, mode)?;
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|x| x == EXTENSION))
            .collect();
        entries.sort();

        for path in entries {
            let record = match load(&path) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unreadable checkpoint: {e}");
                    continue;
                }
            };
            if record.forced {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            match score_fn(&record) {
                Some(score) if score.is_finite() => saver.retained.push(Retained { score, name: name.to_string() }),
                _ => warn!("checkpoint '{}' carries no usable score", path.display()),
            }
        }
        saver.sort();
        if saver.retained.len() > max_num {
            info!("keeping the best {max_num} of {} ranked checkpoints", saver.retained.len());
            saver.evict_overflow()?;
        }
        info!("resumed saver with {} ranked checkpoints in '{}'", saver.retained.len(), dir.display());
        Ok(saver)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        let name = name.strip_suffix(".json").unwrap_or(name);
        self.dir.join(format!("{name}.{EXTENSION}"))
    }

    fn sort(&mut self) {
        let mode = self.mode;
        self.retained.sort_by(|a, b| mode.rank(a.score, b.score));
    }

    /// Writes `record` as `name` when it ranks among the best `max_num`
    /// scores, evicting whatever falls out. Returns whether it was kept.
    pub fn update(&mut self, record: &CheckpointRecord, score: f64, name: &str) -> Result<bool> {
        let name = name.strip_suffix(".json").unwrap_or(name).to_string();
        if !score.is_finite() {
            warn!("not ranking checkpoint `{name}`: score {score} is not finite");
            return Ok(false);
        }
        self.retained.retain(|r| r.name != name);
        let admit = self.retained.len() < self.max_num
            || self.retained.last().is_some_and(|worst| self.mode.better(score, worst.score));
        if !admit {
            debug!("checkpoint `{name}` ({score:.4}) does not beat the retained set");
            return Ok(false);
        }

        let mut record = record.clone();
        record.forced = false;
        write_atomic(&self.path_of(&name), &record)?;
        self.retained.push(Retained { score, name });
        self.sort();
        self.evict_overflow()?;
        Ok(true)
    }

    /// Drops the worst ranked checkpoints, files included, until at most
    /// `max_num` remain.
    fn evict_overflow(&mut self) -> Result<()> {
        while self.retained.len() > self.max_num {
            if let Some(evicted) = self.retained.pop() {
                let path = self.path_of(&evicted.name);
                debug!("evicting '{}' ({:.4})", path.display(), evicted.score);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes `record` as `name` regardless of score, replacing any earlier
    /// file of that name. Ranked checkpoints are untouched.
    pub fn force_save(&self, record: &CheckpointRecord, name: &str) -> Result<()> {
        let mut record = record.clone();
        record.forced = true;
        write_atomic(&self.path_of(name), &record)
    }

    /// `(name, score)` of the ranked checkpoints, best first.
    pub fn retained(&self) -> Vec<(&str, f64)> {
        self.retained.iter().map(|r| (r.name.as_str(), r.score)).collect()
    }

    pub fn best(&self) -> Option<(&str, f64)> {
        self.retained.first().map(|r| (r.name.as_str(), r.score))
    }
}

fn write_atomic(path: &Path, record: &CheckpointRecord) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)
            .map_err(|e| Error::Checkpoint(format!("cannot write '{}': {e}", tmp.display())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Matrix;

    fn record(score: f64) -> CheckpointRecord {
        let mut r = CheckpointRecord::new(StateDict::from([("w".to_string(), Matrix::filled(1, 2, score))]));
        r.valid_score.insert("valid_sisnri".into(), score);
        r
    }

    fn on_disk(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn keeps_the_best_two_of_four() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(2, dir.path(), SaveMode::Max).unwrap();
        for (epoch, score) in [0.5, 0.7, 0.3, 0.9].into_iter().enumerate() {
            saver.update(&record(score), score, &epoch.to_string()).unwrap();
            assert!(saver.retained().len() <= 2);
        }
        let scores: Vec<f64> = saver.retained().iter().map(|(_, s)| *s).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        assert_eq!(on_disk(dir.path()), vec!["1.json", "3.json"]);
    }

    #[test]
    fn min_mode_keeps_lowest() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(1, dir.path(), SaveMode::Min).unwrap();
        assert!(saver.update(&record(2.0), 2.0, "a").unwrap());
        assert!(!saver.update(&record(3.0), 3.0, "b").unwrap());
        assert!(saver.update(&record(1.0), 1.0, "c").unwrap());
        assert_eq!(saver.best(), Some(("c", 1.0)));
        assert_eq!(on_disk(dir.path()), vec!["c.json"]);
    }

    #[test]
    fn force_save_overwrites_and_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(1, dir.path(), SaveMode::Max).unwrap();
        saver.update(&record(0.4), 0.4, "0").unwrap();
        saver.force_save(&record(0.1), "latest").unwrap();
        saver.force_save(&record(0.2), "latest").unwrap();
        assert_eq!(on_disk(dir.path()), vec!["0.json", "latest.json"]);
        let latest = load(&saver.path_of("latest")).unwrap();
        assert!(latest.forced);
        assert_eq!(latest.score("valid_sisnri"), Some(0.2));
        assert_eq!(saver.retained().len(), 1);
    }

    #[test]
    fn resume_rebuilds_ranking_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut saver = Saver::new(2, dir.path(), SaveMode::Max).unwrap();
            saver.update(&record(0.5), 0.5, "0").unwrap();
            saver.update(&record(0.8), 0.8, "1").unwrap();
            saver.force_save(&record(9.0), "latest").unwrap();
        }
        let mut saver = Saver::resume(2, dir.path(), SaveMode::Max, |r| r.score("valid_sisnri")).unwrap();
        assert_eq!(saver.retained(), vec![("1", 0.8), ("0", 0.5)]);

        saver.update(&record(0.6), 0.6, "2").unwrap();
        assert_eq!(on_disk(dir.path()), vec!["1.json", "2.json", "latest.json"]);
    }

    #[test]
    fn resume_with_smaller_capacity_trims_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut saver = Saver::new(3, dir.path(), SaveMode::Max).unwrap();
            for (i, score) in [0.1, 0.2, 0.3].into_iter().enumerate() {
                saver.update(&record(score), score, &i.to_string()).unwrap();
            }
        }
        let mut saver = Saver::resume(2, dir.path(), SaveMode::Max, |r| r.score("valid_sisnri")).unwrap();
        assert_eq!(saver.retained(), vec![("2", 0.3), ("1", 0.2)]);
        assert_eq!(on_disk(dir.path()), vec!["1.json", "2.json"]);

        assert!(!saver.update(&record(0.05), 0.05, "3").unwrap());
        assert_eq!(saver.retained().len(), 2);
        assert!(saver.update(&record(0.25), 0.25, "4").unwrap());
        assert_eq!(saver.retained(), vec![("2", 0.3), ("4", 0.25)]);
        assert_eq!(on_disk(dir.path()), vec!["2.json", "4.json"]);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(Saver::new(2, &missing, SaveMode::Max), Err(Error::Checkpoint(_))));
        assert!(Saver::resume(2, &missing, SaveMode::Max, |_| None).is_err());
    }

    #[test]
    fn nan_score_is_not_ranked() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(2, dir.path(), SaveMode::Min).unwrap();
        assert!(!saver.update(&record(0.0), f64::NAN, "0").unwrap());
        assert!(on_disk(dir.path()).is_empty());
    }
}
