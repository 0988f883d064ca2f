//! Fixed-length chunks of separation examples read from a manifest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::info;
use rand::Rng;

use crate::config::Config;
use crate::data::audio::read_wav;
use crate::data::manifest::{CorpusPaths, Manifest};
use crate::error::{Error, Result};
use crate::math::Signals;

pub const DEFAULT_SAMPLE_RATE: u32 = 8000;

/// One separation example. `mixture` and every reference have the same
/// length; samples past `input_len` are zero padding.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub uid: String,
    pub chunk_id: String,
    pub input_len: usize,
    pub mixture: Vec<f64>,
    pub references: Signals,
}

/// Samples stacked and zero-padded to the longest `input_len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub uids: Vec<String>,
    pub chunk_ids: Vec<String>,
    pub lengths: Vec<usize>,
    pub mixtures: Vec<Vec<f64>>,
    pub references: Vec<Signals>,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>) -> Batch {
        let t_max = samples.iter().map(|s| s.input_len).max().unwrap_or(0);
        let pad = |mut x: Vec<f64>| {
            x.resize(t_max, 0.0);
            x
        };

        let mut batch = Batch {
            uids: Vec::with_capacity(samples.len()),
            chunk_ids: Vec::with_capacity(samples.len()),
            lengths: Vec::with_capacity(samples.len()),
            mixtures: Vec::with_capacity(samples.len()),
            references: Vec::with_capacity(samples.len()),
        };
        for s in samples {
            batch.uids.push(s.uid);
            batch.chunk_ids.push(s.chunk_id);
            batch.lengths.push(s.input_len);
            batch.mixtures.push(pad(s.mixture));
            batch.references.push(s.references.into_iter().map(pad).collect());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn padded_len(&self) -> usize {
        self.mixtures.first().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// Drop utterances shorter than a segment; draw one random segment per
    /// utterance on every access.
    Train,
    /// Split every utterance into consecutive segments, keeping the tail.
    Eval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetOptions {
    /// Segment length in seconds; `None` serves whole utterances.
    pub segment: Option<f64>,
    pub sample_rate: u32,
    pub num_spk: usize,
    pub mode: ChunkMode,
    pub pre_load: bool,
}

impl DatasetOptions {
    /// Reads `segment` (per-corpus `data.{name}.segment` first, then
    /// `data.segment`; `-1` or absent means whole utterances) and
    /// `sample_rate` from the data section.
    pub fn from_config(data: &Config, corpus: &str, num_spk: usize, mode: ChunkMode) -> Result<DatasetOptions> {
        let per_corpus = format!("{corpus}.segment");
        let segment: Option<f64> = match data.opt(&per_corpus)? {
            Some(s) => Some(s),
            None => data.opt("segment")?,
        };
        Ok(DatasetOptions {
            segment: segment.filter(|s| *s > 0.0),
            sample_rate: data.or("sample_rate", DEFAULT_SAMPLE_RATE)?,
            num_spk,
            mode,
            pre_load: data.or("pre_load", false)?,
        })
    }

    fn segment_samples(&self) -> Option<usize> {
        self.segment.map(|s| (s * self.sample_rate as f64) as usize).filter(|&n| n > 0)
    }
}

#[derive(Debug, Clone)]
struct ChunkInfo {
    uid: String,
    chunk_id: String,
    /// `None` draws a random segment on access.
    span: Option<(usize, usize)>,
}

type AudioCache = BTreeMap<String, BTreeMap<String, Vec<f64>>>;

pub struct ChunkDataset {
    manifest: Manifest,
    audio_root: PathBuf,
    options: DatasetOptions,
    seg_len: Option<usize>,
    chunks: Vec<ChunkInfo>,
    cache: Option<AudioCache>,
}

impl ChunkDataset {
    pub fn new(manifest: Manifest, audio_root: &Path, options: DatasetOptions) -> Result<ChunkDataset> {
        let seg_len = options.segment_samples();
        let channels = channel_names(options.num_spk);

        let mut chunks = Vec::new();
        let mut dropped = 0usize;
        let mut dropped_samples = 0usize;
        for (uid, utt) in &manifest.utterances {
            for ch in &channels {
                if !utt.contains_key(ch) {
                    return Err(Error::Data(format!("utterance `{uid}` has no `{ch}` channel")));
                }
            }
            let utt_len = utt["mix"].1;
            match (options.mode, seg_len) {
                (ChunkMode::Train, Some(seg)) => {
                    if utt_len >= seg {
                        chunks.push(ChunkInfo { uid: uid.clone(), chunk_id: uid.clone(), span: None });
                    } else {
                        dropped += 1;
                        dropped_samples += utt_len;
                    }
                }
                (ChunkMode::Eval, Some(seg)) => {
                    let n = utt_len.div_ceil(seg);
                    for i in 0..n {
                        let start = i * seg;
                        let end = ((i + 1) * seg).min(utt_len);
                        chunks.push(ChunkInfo {
                            uid: uid.clone(),
                            chunk_id: format!("{uid}_{i}"),
                            span: Some((start, end)),
                        });
                    }
                }
                (_, None) => {
                    chunks.push(ChunkInfo { uid: uid.clone(), chunk_id: uid.clone(), span: Some((0, utt_len)) });
                }
            }
        }

        if options.mode == ChunkMode::Train {
            if let Some(seg) = seg_len {
                let hours = dropped_samples as f64 / (options.sample_rate as f64 * 3600.0);
                info!("dropped {dropped} utterances shorter than {seg} samples ({hours:.3} h)");
            }
        }

        let mut dataset = ChunkDataset {
            manifest,
            audio_root: audio_root.to_path_buf(),
            options,
            seg_len,
            chunks,
            cache: None,
        };
        if dataset.options.pre_load {
            dataset.pre_load()?;
        }
        Ok(dataset)
    }

    /// Opens `{split}` of the corpus described by `paths`.
    pub fn open(paths: &CorpusPaths, split: &str, options: DatasetOptions) -> Result<ChunkDataset> {
        let manifest = paths.load_manifest(split)?;
        info!("loaded {} utterances from {}", manifest.len(), paths.manifest_path(split).display());
        ChunkDataset::new(manifest, &paths.audio_root, options)
    }

    fn pre_load(&mut self) -> Result<()> {
        info!("pre-loading audio of {} utterances", self.manifest.len());
        let mut cache = AudioCache::new();
        for uid in self.manifest.utterances.keys() {
            let mut channels = BTreeMap::new();
            for ch in channel_names(self.options.num_spk) {
                let audio = self.read_channel(uid, &ch)?;
                channels.insert(ch, audio);
            }
            cache.insert(uid.clone(), channels);
        }
        self.cache = Some(cache);
        Ok(())
    }

    fn read_channel(&self, uid: &str, channel: &str) -> Result<Vec<f64>> {
        let entry = self.manifest.utterances.get(uid)
            .and_then(|u| u.get(channel))
            .ok_or_else(|| Error::Data(format!("no `{channel}` audio for `{uid}`")))?;
        let path = self.audio_root.join(&entry.0);
        let (samples, sr) = read_wav(&path)?;
        if sr != self.options.sample_rate {
            return Err(Error::Audio(format!(
                "'{}' is sampled at {sr} Hz, expected {}",
                path.display(),
                self.options.sample_rate
            )));
        }
        Ok(samples)
    }

    /// Full audio of one channel of an utterance.
    pub fn load_channel(&self, uid: &str, channel: &str) -> Result<Vec<f64>> {
        match self.cache.as_ref().and_then(|c| c.get(uid)).and_then(|u| u.get(channel)) {
            Some(audio) => Ok(audio.clone()),
            None => self.read_channel(uid, channel),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Utterance ids in manifest order.
    pub fn uids(&self) -> impl Iterator<Item = &str> {
        self.manifest.utterances.keys().map(String::as_str)
    }

    pub fn get<R: Rng + ?Sized>(&self, idx: usize, rng: &mut R) -> Result<Sample> {
        let info = self.chunks.get(idx)
            .ok_or_else(|| Error::Data(format!("sample index {idx} out of range ({})", self.chunks.len())))?;

        let mixture = self.load_channel(&info.uid, "mix")?;
        let references = (1..=self.options.num_spk)
            .map(|k| self.load_channel(&info.uid, &format!("s{k}")))
            .collect::<Result<Signals>>()?;
        let avail = references.iter().map(Vec::len).fold(mixture.len(), usize::min);

        let (start, end) = match (info.span, self.seg_len) {
            (Some((s, e)), _) => (s.min(avail), e.min(avail)),
            (None, Some(seg)) => {
                let seg = seg.min(avail);
                let start = rng.gen_range(0..=avail - seg);
                (start, start + seg)
            }
            (None, None) => (0, avail),
        };
        let input_len = end - start;
        let padded = match self.seg_len {
            Some(seg) => seg.max(input_len),
            None => input_len,
        };
        let cut = |x: &[f64]| {
            let mut v = x[start..end].to_vec();
            v.resize(padded, 0.0);
            v
        };

        Ok(Sample {
            uid: info.uid.clone(),
            chunk_id: info.chunk_id.clone(),
            input_len,
            mixture: cut(&mixture),
            references: references.iter().map(|r| cut(r)).collect(),
        })
    }
}

/// `mix`, `s1`, ..., `s{num_spk}`.
pub fn channel_names(num_spk: usize) -> Vec<String> {
    std::iter::once("mix".to_string())
        .chain((1..=num_spk).map(|k| format!("s{k}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::audio::write_wav;
    use crate::data::manifest::ChannelEntry;
    use rand::{rngs::StdRng, SeedableRng};

    /// Writes a corpus of utterances with the given lengths; returns its root.
    fn corpus(lengths: &[usize]) -> (tempfile::TempDir, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        for (u, &len) in lengths.iter().enumerate() {
            let uid = format!("utt{u}");
            let mut utt = BTreeMap::new();
            for ch in channel_names(2) {
                let rel = format!("{ch}_{uid}.wav");
                let samples: Vec<f64> = (0..len).map(|i| ((i + u) as f64 * 0.01).sin() * 0.3).collect();
                write_wav(&dir.path().join(&rel), &samples, 8000).unwrap();
                utt.insert(ch, ChannelEntry(rel, len));
            }
            manifest.utterances.insert(uid, utt);
        }
        (dir, manifest)
    }

    fn options(mode: ChunkMode, segment: Option<f64>) -> DatasetOptions {
        DatasetOptions { segment, sample_rate: 8000, num_spk: 2, mode, pre_load: false }
    }

    #[test]
    fn train_mode_drops_short_utterances() {
        let (dir, manifest) = corpus(&[100, 40, 80]);
        // 80 samples per segment
        let ds = ChunkDataset::new(manifest, dir.path(), options(ChunkMode::Train, Some(0.01))).unwrap();
        assert_eq!(ds.len(), 2);
        let s = ds.get(0, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(s.input_len, 80);
        assert_eq!(s.references.len(), 2);
        assert_eq!(s.mixture.len(), 80);
    }

    #[test]
    fn eval_mode_keeps_padded_tail() {
        let (dir, manifest) = corpus(&[100]);
        let ds = ChunkDataset::new(manifest, dir.path(), options(ChunkMode::Eval, Some(0.01))).unwrap();
        assert_eq!(ds.len(), 2);
        let tail = ds.get(1, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(tail.chunk_id, "utt0_1");
        assert_eq!(tail.input_len, 20);
        assert_eq!(tail.mixture.len(), 80);
        assert!(tail.mixture[20..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn whole_utterances_without_segment() {
        let (dir, manifest) = corpus(&[30, 50]);
        let mut opts = options(ChunkMode::Eval, None);
        opts.pre_load = true;
        let ds = ChunkDataset::new(manifest, dir.path(), opts).unwrap();
        let lens: Vec<usize> = (0..2).map(|i| ds.get(i, &mut StdRng::seed_from_u64(0)).unwrap().input_len).collect();
        assert_eq!(lens, vec![30, 50]);
    }

    #[test]
    fn missing_channel_fails_at_construction() {
        let (dir, mut manifest) = corpus(&[30]);
        manifest.utterances.get_mut("utt0").unwrap().remove("s2");
        assert!(ChunkDataset::new(manifest, dir.path(), options(ChunkMode::Eval, None)).is_err());
    }

    #[test]
    fn collate_pads_to_longest() {
        let short = Sample {
            uid: "a".into(),
            chunk_id: "a".into(),
            input_len: 2,
            mixture: vec![1.0, 2.0],
            references: vec![vec![1.0, 1.0], vec![0.0, 1.0]],
        };
        let long = Sample { uid: "b".into(), chunk_id: "b".into(), input_len: 4, mixture: vec![1.0; 4], references: vec![vec![0.5; 4]; 2] };
        let batch = Batch::collate(vec![long, short]);
        assert_eq!(batch.lengths, vec![4, 2]);
        assert_eq!(batch.mixtures[1], vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(batch.references[1][1], vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.padded_len(), 4);
    }
}
