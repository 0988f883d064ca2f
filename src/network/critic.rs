//! Waveform discriminator scoring audio at several time resolutions.
//!
//! Each scale average-pools the waveform by its factor, cuts the result into
//! frames of `win` samples and scores every frame with a small MLP. A
//! discriminator output is the list of frame scores per scale.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activation::activation::ActivationFunction;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::layers::dense::{Layer, LayerCache};
use crate::math::{Matrix, Signals};
use crate::network::params::{load_slots, Gradients, Module, StateDict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticConfig {
    pub win: usize,
    pub hidden: usize,
    pub scales: Vec<usize>,
}

impl CriticConfig {
    pub fn from_config(c: &Config) -> Result<CriticConfig> {
        let config = CriticConfig {
            win: c.req("win")?,
            hidden: c.req("hidden")?,
            scales: c.or("scales", vec![1, 2, 4])?,
        };
        if config.win == 0 || config.hidden == 0 || config.scales.is_empty() || config.scales.contains(&0) {
            return Err(Error::Config("critic win, hidden and scales must be positive".into()));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct ScaleHead {
    factor: usize,
    hidden: Layer,
    out: Layer,
}

#[derive(Debug, Clone)]
struct ScaleTrace {
    /// Frame rows owned by each batch item, in stacking order.
    rows: Vec<usize>,
    pooled_lens: Vec<usize>,
    hidden: LayerCache,
    out: LayerCache,
}

#[derive(Debug, Clone)]
pub struct CriticPass {
    /// Frame scores of the whole batch, one vector per scale.
    pub scores: Vec<Vec<f64>>,
    lens: Vec<usize>,
    traces: Vec<ScaleTrace>,
}

#[derive(Debug, Clone)]
pub struct MultiScaleCritic {
    pub config: CriticConfig,
    heads: Vec<ScaleHead>,
}

impl MultiScaleCritic {
    pub fn new<R: Rng + ?Sized>(config: CriticConfig, rng: &mut R) -> MultiScaleCritic {
        let heads = config.scales.iter()
            .map(|&factor| ScaleHead {
                factor,
                hidden: Layer::new(config.hidden, config.win, ActivationFunction::LeakyReLU { alpha: 0.2 }, rng),
                out: Layer::new(1, config.hidden, ActivationFunction::Identity, rng),
            })
            .collect();
        MultiScaleCritic { config, heads }
    }

    pub fn forward(&self, waves: &[Vec<f64>]) -> CriticPass {
        let win = self.config.win;
        let mut scores = Vec::with_capacity(self.heads.len());
        let mut traces = Vec::with_capacity(self.heads.len());

        for head in &self.heads {
            let mut stacked = Vec::new();
            let mut rows = Vec::with_capacity(waves.len());
            let mut pooled_lens = Vec::with_capacity(waves.len());
            for wave in waves {
                let pooled = avg_pool(wave, head.factor);
                let n_frames = pooled.len().div_ceil(win).max(1);
                stacked.extend(Matrix::from_flat(n_frames, win, &pooled).data);
                rows.push(n_frames);
                pooled_lens.push(pooled.len());
            }
            let frames = Matrix::from_data(stacked);
            let (h, hidden) = head.hidden.forward(&frames);
            let (out, out_cache) = head.out.forward(&h);
            scores.push(out.data.iter().map(|r| r[0]).collect());
            traces.push(ScaleTrace { rows, pooled_lens, hidden, out: out_cache });
        }

        CriticPass { scores, lens: waves.iter().map(Vec::len).collect(), traces }
    }

    /// `d_scores` mirrors `CriticPass::scores`. Returns parameter gradients and
    /// ∂L/∂waveform for every batch item.
    pub fn backward(&self, pass: &CriticPass, d_scores: &[Vec<f64>]) -> (Gradients, Signals) {
        let mut grads = Gradients::new();
        let mut d_waves: Signals = pass.lens.iter().map(|&t| vec![0.0; t]).collect();

        for (s, ((head, trace), d)) in self.heads.iter().zip(&pass.traces).zip(d_scores).enumerate() {
            let delta = Matrix::from_data(d.iter().map(|x| vec![*x]).collect());
            let out_g = head.out.backward(&trace.out, &delta);
            let hidden_g = head.hidden.backward(&trace.hidden, &out_g.input);
            grads.accumulate(&format!("scale{s}.0.weight"), &hidden_g.weights);
            grads.accumulate(&format!("scale{s}.0.bias"), &hidden_g.biases);
            grads.accumulate(&format!("scale{s}.1.weight"), &out_g.weights);
            grads.accumulate(&format!("scale{s}.1.bias"), &out_g.biases);

            let mut offset = 0;
            for (b, (&n_rows, &pooled_len)) in trace.rows.iter().zip(&trace.pooled_lens).enumerate() {
                let block = Matrix::from_data(hidden_g.input.data[offset..offset + n_rows].to_vec());
                offset += n_rows;
                let d_pooled = block.flatten(pooled_len);
                avg_pool_backward(&d_pooled, head.factor, &mut d_waves[b]);
            }
        }
        (grads, d_waves)
    }

    fn slot_names(&self) -> Vec<String> {
        (0..self.heads.len())
            .flat_map(|s| {
                ["0.weight", "0.bias", "1.weight", "1.bias"].map(|p| format!("scale{s}.{p}"))
            })
            .collect()
    }
}

fn avg_pool(wave: &[f64], factor: usize) -> Vec<f64> {
    wave.chunks(factor)
        .map(|c| c.iter().sum::<f64>() / c.len() as f64)
        .collect()
}

fn avg_pool_backward(d_pooled: &[f64], factor: usize, d_wave: &mut [f64]) {
    for (chunk, d) in d_wave.chunks_mut(factor).zip(d_pooled) {
        let share = d / chunk.len() as f64;
        for x in chunk.iter_mut() {
            *x += share;
        }
    }
}

/// Hinge loss of the critic for one batch of real and one of fake waveforms,
/// summed over scales, with the score gradients for each pass.
pub fn hinge_critic_loss(real: &CriticPass, fake: &CriticPass) -> (f64, Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let mut loss = 0.0;
    let mut d_real = Vec::with_capacity(real.scores.len());
    let mut d_fake = Vec::with_capacity(fake.scores.len());
    for (r, f) in real.scores.iter().zip(&fake.scores) {
        let nr = r.len().max(1) as f64;
        let nf = f.len().max(1) as f64;
        loss += r.iter().map(|x| (1.0 - x).max(0.0)).sum::<f64>() / nr;
        loss += f.iter().map(|x| (1.0 + x).max(0.0)).sum::<f64>() / nf;
        d_real.push(r.iter().map(|x| if 1.0 - x > 0.0 { -1.0 / nr } else { 0.0 }).collect());
        d_fake.push(f.iter().map(|x| if 1.0 + x > 0.0 { 1.0 / nf } else { 0.0 }).collect());
    }
    (loss, d_real, d_fake)
}

/// Generator side of the hinge objective: `Σ_scales −mean(D(fake))`.
pub fn hinge_generator_loss(fake: &CriticPass) -> (f64, Vec<Vec<f64>>) {
    let mut loss = 0.0;
    let mut d_fake = Vec::with_capacity(fake.scores.len());
    for f in &fake.scores {
        let n = f.len().max(1) as f64;
        loss -= f.iter().sum::<f64>() / n;
        d_fake.push(vec![-1.0 / n; f.len()]);
    }
    (loss, d_fake)
}

impl Module for MultiScaleCritic {
    fn parameters_mut(&mut self) -> Vec<(String, &mut Matrix)> {
        let names = self.slot_names();
        let tensors = self.heads.iter_mut().flat_map(|h| {
            [&mut h.hidden.weights, &mut h.hidden.biases, &mut h.out.weights, &mut h.out.biases]
        });
        names.into_iter().zip(tensors).collect()
    }

    fn state_dict(&self) -> StateDict {
        let tensors = self.heads.iter().flat_map(|h| {
            [&h.hidden.weights, &h.hidden.biases, &h.out.weights, &h.out.biases]
        });
        self.slot_names().into_iter().zip(tensors.cloned()).collect()
    }

    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<Vec<String>> {
        load_slots(self.parameters_mut(), state, strict)
    }
}
