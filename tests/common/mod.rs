//! A tiny two-speaker corpus on disk, laid out like the real ones:
//! `{audio_root}/{split}/{channel}/{uid}.wav` plus
//! `{list_dir}/{corpus}/id_list/{split}.json`.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ferrite_sep::data::audio::write_wav;
use ferrite_sep::data::manifest::{ChannelEntry, Manifest};
use ferrite_sep::Config;

pub const SAMPLE_RATE: u32 = 8000;

pub struct Corpus {
    pub audio_root: PathBuf,
    pub list_dir: PathBuf,
}

fn tone(freq: f64, len: usize, amp: f64) -> Vec<f64> {
    (0..len)
        .map(|t| amp * (2.0 * std::f64::consts::PI * freq * t as f64 / SAMPLE_RATE as f64).sin())
        .collect()
}

/// Writes `utterances` two-speaker mixtures per split (`tr`, `cv`, `tt`) of
/// `name`, with a gender table covering every uid.
pub fn write_corpus(root: &Path, name: &str, utterances: usize) -> Corpus {
    let audio_root = root.join("audio").join(name);
    let list_dir = root.join("lists");
    let ids = list_dir.join(name).join("id_list");
    fs::create_dir_all(&ids).unwrap();

    let mut gender = BTreeMap::new();
    for (si, split) in ["tr", "cv", "tt"].iter().enumerate() {
        let mut manifest = Manifest::default();
        for u in 0..utterances {
            let uid = format!("{split}_{u:03}");
            let len = 320 + 48 * u;
            let s1 = tone(220.0 + 40.0 * (u + si) as f64, len, 0.3);
            let s2 = tone(900.0 + 75.0 * u as f64, len, 0.2);
            let mix: Vec<f64> = s1.iter().zip(&s2).map(|(a, b)| a + b).collect();

            let mut channels = BTreeMap::new();
            for (ch, audio) in [("mix", &mix), ("s1", &s1), ("s2", &s2)] {
                let rel = format!("{split}/{ch}/{uid}.wav");
                let path = audio_root.join(&rel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                write_wav(&path, audio, SAMPLE_RATE).unwrap();
                channels.insert(ch.to_string(), ChannelEntry(rel, len));
            }
            manifest.utterances.insert(uid.clone(), channels);
            let pair = if u % 2 == 0 { ["M", "F"] } else { ["F", "F"] };
            gender.insert(uid, pair);
        }
        manifest.save(&ids.join(format!("{split}.json"))).unwrap();
    }
    fs::write(list_dir.join(name).join("gender.json"), serde_json::to_string(&gender).unwrap()).unwrap();
    Corpus { audio_root, list_dir }
}

pub const MODEL: &str = "  enc_dim: 8\n  win: 16\n  hidden: 12\n  num_spk: 2\n";

/// Baseline training config over a wsj0 corpus under `root`.
pub fn baseline_config(root: &Path, corpus: &Corpus, epochs: u64, extra_solver: &str) -> Config {
    let yaml = format!(
        "solver:\n  exp_name: tiny\n  save_dir: {save}\n  log_dir: {log}\n  epochs: {epochs}\n  \
         batch_size: 2\n  grad_clip: 5.0\n  max_save_num: 2\n{extra_solver}\
         model:\n{MODEL}\
         optim:\n  type: Adam\n  lr: 0.001\n  weight_decay: 0.0\n\
         data:\n  dset: wsj0\n  wsj_root: {audio}\n  list_dir: {lists}\n  segment: 0.05\n",
        save = root.join("ckpt").display(),
        log = root.join("logs").display(),
        audio = corpus.audio_root.display(),
        lists = corpus.list_dir.display(),
    );
    Config::from_yaml_str(&yaml).unwrap()
}

/// The single experiment directory created under `{root}/{kind}`.
pub fn only_experiment(root: &Path, kind: &str) -> PathBuf {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root.join(kind))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "expected one experiment in {kind}: {dirs:?}");
    dirs.remove(0)
}

/// Tags recorded in `metrics.jsonl`.
pub fn logged_tags(log_dir: &Path) -> Vec<String> {
    fs::read_to_string(log_dir.join("metrics.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["tag"].as_str().unwrap().to_string())
        .collect()
}
