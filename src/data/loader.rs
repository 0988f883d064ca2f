//! Batching over a `ChunkDataset` with optional prefetch workers.
//!
//! Workers pull `(ordering_idx, sample_idx)` jobs from an unbounded channel
//! and push loaded samples into a bounded one; the consumer puts them back
//! in order before collating, so batch contents never depend on thread
//! timing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver};
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::dataset::{Batch, ChunkDataset, Sample};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// `0` loads on the calling thread.
    pub num_workers: usize,
    pub seed: u64,
}

#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<ChunkDataset>,
    options: LoaderOptions,
}

impl DataLoader {
    pub fn new(dataset: Arc<ChunkDataset>, options: LoaderOptions) -> Result<DataLoader> {
        if options.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        Ok(DataLoader { dataset, options })
    }

    pub fn dataset(&self) -> &ChunkDataset {
        &self.dataset
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.options.drop_last {
            n / self.options.batch_size
        } else {
            n.div_ceil(self.options.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts one pass over the dataset. `epoch` reseeds shuffling and random
    /// segment selection.
    pub fn iter(&self, epoch: u64) -> BatchIter {
        let epoch_seed = self.options.seed.wrapping_add(epoch.wrapping_mul(0x9E37_79B9));
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(epoch_seed));
        }
        let n_samples = self.len() * self.options.batch_size;
        let n_samples = n_samples.min(order.len());
        order.truncate(n_samples);
        trace!("starting epoch {epoch} over {n_samples} samples");

        let mut iter = BatchIter {
            dataset: Arc::clone(&self.dataset),
            batch_size: self.options.batch_size,
            order,
            epoch_seed,
            cur_out_idx: 0,
            out_buf: BTreeMap::new(),
            out_receiver: None,
            workers: Vec::new(),
            failed: false,
        };
        if self.options.num_workers > 0 {
            iter.start_workers(self.options.num_workers);
        }
        iter
    }
}

type Job = (usize, usize);
type Loaded = (usize, Result<Sample>);

pub struct BatchIter {
    dataset: Arc<ChunkDataset>,
    batch_size: usize,
    /// Dataset index of every sample served this epoch, in serving order.
    order: Vec<usize>,
    epoch_seed: u64,
    cur_out_idx: usize,
    out_buf: BTreeMap<usize, Result<Sample>>,
    out_receiver: Option<Receiver<Loaded>>,
    workers: Vec<thread::JoinHandle<()>>,
    failed: bool,
}

impl BatchIter {
    fn start_workers(&mut self, num_workers: usize) {
        let (in_sender, in_receiver) = unbounded::<Job>();
        for (ordering_idx, &sample_idx) in self.order.iter().enumerate() {
            // the receiver is alive in this scope
            let _ = in_sender.send((ordering_idx, sample_idx));
        }
        drop(in_sender);

        let (out_sender, out_receiver) = bounded::<Loaded>(self.batch_size * 2);
        for w in 0..num_workers {
            let jobs = in_receiver.clone();
            let out = out_sender.clone();
            let ds = Arc::clone(&self.dataset);
            let epoch_seed = self.epoch_seed;
            let handle = thread::spawn(move || {
                while let Ok((ordering_idx, sample_idx)) = jobs.recv() {
                    let sample = load_sample(&ds, sample_idx, epoch_seed);
                    if out.send((ordering_idx, sample)).is_err() {
                        trace!("loader worker {w}: consumer gone");
                        return;
                    }
                }
            });
            self.workers.push(handle);
        }
        self.out_receiver = Some(out_receiver);
    }

    fn next_sample(&mut self) -> Result<Sample> {
        let idx = self.cur_out_idx;
        let Some(receiver) = self.out_receiver.as_ref() else {
            let sample_idx = self.order[idx];
            self.cur_out_idx += 1;
            return load_sample(&self.dataset, sample_idx, self.epoch_seed);
        };

        loop {
            if let Some(s) = self.out_buf.remove(&idx) {
                self.cur_out_idx += 1;
                return s;
            }
            match receiver.recv() {
                Ok((o_idx, s)) if o_idx == idx => {
                    self.cur_out_idx += 1;
                    return s;
                }
                Ok((o_idx, s)) => {
                    if s.is_err() {
                        debug!("loader worker failed on sample {o_idx}");
                    }
                    self.out_buf.insert(o_idx, s);
                }
                Err(_) => return Err(Error::Data("loader workers stopped before the epoch was drained".into())),
            }
        }
    }

    fn shutdown(&mut self) {
        drop(self.out_receiver.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("a loader worker panicked");
            }
        }
    }
}

fn load_sample(ds: &ChunkDataset, sample_idx: usize, epoch_seed: u64) -> Result<Sample> {
    let mut rng = StdRng::seed_from_u64(epoch_seed.wrapping_add(sample_idx as u64));
    ds.get(sample_idx, &mut rng)
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.failed || self.cur_out_idx >= self.order.len() {
            return None;
        }
        let end = (self.cur_out_idx + self.batch_size).min(self.order.len());
        let mut samples = Vec::with_capacity(end - self.cur_out_idx);
        while self.cur_out_idx < end {
            match self.next_sample() {
                Ok(s) => samples.push(s),
                Err(e) => {
                    self.failed = true;
                    self.shutdown();
                    return Some(Err(e));
                }
            }
        }
        if self.cur_out_idx >= self.order.len() {
            self.shutdown();
        }
        Some(Ok(Batch::collate(samples)))
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Endless batch stream over a finite loader: when one pass is exhausted the
/// next epoch is started with a fresh shuffle.
pub struct InfiniteLoader {
    loader: DataLoader,
    epoch: u64,
    current: Option<BatchIter>,
}

impl InfiniteLoader {
    pub fn new(loader: DataLoader) -> InfiniteLoader {
        InfiniteLoader { loader, epoch: 0, current: None }
    }

    /// Passes started so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        let mut restarted = false;
        loop {
            if let Some(iter) = self.current.as_mut() {
                if let Some(batch) = iter.next() {
                    return batch;
                }
                if restarted {
                    return Err(Error::Data("data loader yields no batches".into()));
                }
            }
            self.current = Some(self.loader.iter(self.epoch));
            self.epoch += 1;
            restarted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::audio::write_wav;
    use crate::data::dataset::{channel_names, ChunkMode, DatasetOptions};
    use crate::data::manifest::{ChannelEntry, Manifest};

    fn dataset(lengths: &[usize]) -> (tempfile::TempDir, Arc<ChunkDataset>) {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        for (u, &len) in lengths.iter().enumerate() {
            let uid = format!("u{u:02}");
            let mut utt = BTreeMap::new();
            for ch in channel_names(2) {
                let rel = format!("{ch}_{uid}.wav");
                let value = (u + 1) as f64 * 0.01;
                write_wav(&dir.path().join(&rel), &vec![value; len], 8000).unwrap();
                utt.insert(ch, ChannelEntry(rel, len));
            }
            manifest.utterances.insert(uid, utt);
        }
        let options = DatasetOptions { segment: None, sample_rate: 8000, num_spk: 2, mode: ChunkMode::Eval, pre_load: false };
        let ds = ChunkDataset::new(manifest, dir.path(), options).unwrap();
        (dir, Arc::new(ds))
    }

    fn options(batch_size: usize, num_workers: usize) -> LoaderOptions {
        LoaderOptions { batch_size, shuffle: false, drop_last: false, num_workers, seed: 3 }
    }

    #[test]
    fn workers_preserve_order_and_pad() {
        let (_dir, ds) = dataset(&[10, 30, 20, 5, 15]);
        let inline: Vec<Batch> = DataLoader::new(Arc::clone(&ds), options(2, 0)).unwrap()
            .iter(0).collect::<Result<_>>().unwrap();
        let threaded: Vec<Batch> = DataLoader::new(ds, options(2, 3)).unwrap()
            .iter(0).collect::<Result<_>>().unwrap();

        assert_eq!(inline, threaded);
        assert_eq!(inline.len(), 3);
        assert_eq!(inline[0].uids, vec!["u00", "u01"]);
        assert_eq!(inline[0].lengths, vec![10, 30]);
        assert_eq!(inline[0].padded_len(), 30);
        assert_eq!(inline[2].len(), 1);
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let (_dir, ds) = dataset(&[4, 4, 4]);
        let mut opts = options(2, 0);
        opts.drop_last = true;
        let loader = DataLoader::new(ds, opts).unwrap();
        assert_eq!(loader.len(), 1);
        assert_eq!(loader.iter(0).count(), 1);
    }

    #[test]
    fn shuffle_is_seeded_per_epoch() {
        let (_dir, ds) = dataset(&[4; 8]);
        let mut opts = options(8, 2);
        opts.shuffle = true;
        let loader = DataLoader::new(ds, opts).unwrap();
        let uids = |epoch| loader.iter(epoch).next().unwrap().unwrap().uids;
        assert_eq!(uids(1), uids(1));
        let mut sorted = uids(1);
        sorted.sort();
        assert_eq!(sorted.len(), 8);
        assert_ne!(uids(1), uids(2));
    }

    #[test]
    fn worker_error_reaches_consumer() {
        let (dir, ds) = dataset(&[4, 4]);
        std::fs::remove_file(dir.path().join("s1_u01.wav")).unwrap();
        let results: Vec<Result<Batch>> = DataLoader::new(ds, options(1, 2)).unwrap().iter(0).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn infinite_loader_cycles() {
        let (_dir, ds) = dataset(&[4, 4, 4]);
        let mut inf = InfiniteLoader::new(DataLoader::new(ds, options(2, 0)).unwrap());
        for _ in 0..5 {
            inf.next_batch().unwrap();
        }
        assert_eq!(inf.epoch(), 3);
    }

    #[test]
    fn infinite_loader_over_nothing_fails() {
        let (_dir, ds) = dataset(&[4]);
        let mut opts = options(2, 0);
        opts.drop_last = true;
        let mut inf = InfiniteLoader::new(DataLoader::new(ds, opts).unwrap());
        assert!(inf.next_batch().is_err());
    }
}
