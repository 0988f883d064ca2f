//! Framewise ConvTasNet-style separator.
//!
//! The mixture is cut into non-overlapping frames of `win` samples. Each frame
//! is encoded with a learned basis (`ReLU(x·W_enc)`), optionally normalized,
//! fed through a two-layer mask network that emits one sigmoid mask per
//! speaker, and every masked encoding is projected back to samples by the
//! decoder basis. The normalized encoding doubles as the feature map that the
//! domain classifier sees.
//!
//! There is no autograd: `forward` records everything `backward` needs in a
//! `TasNetPass`, and `backward` turns output/feature gradients into parameter
//! gradients plus the gradient w.r.t. the input waveform.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activation::activation::{relu, relu_derivative, ActivationFunction};
use crate::config::Config;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::layers::dense::{Layer, LayerCache};
use crate::math::{Matrix, Signals};
use crate::network::params::{load_slots, Gradients, Module, StateDict};

const NORM_EPS: f64 = 1e-8;
const TN_MOMENTUM: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormType {
    #[serde(rename = "none")]
    None,
    /// Fixed corpus-level mean/variance computed before training.
    #[serde(rename = "cmvn")]
    Cmvn,
    /// Running statistics kept separately for source and target domain.
    #[serde(rename = "TN", alias = "tn")]
    TransNorm,
}

/// Which normalization statistics a pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Source,
    Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasNetConfig {
    /// Number of basis filters N.
    pub enc_dim: usize,
    /// Frame length L in samples.
    pub win: usize,
    /// Width of the mask network's hidden layer.
    pub hidden: usize,
    pub num_spk: usize,
    pub norm_type: NormType,
}

impl TasNetConfig {
    pub fn from_config(c: &Config) -> Result<TasNetConfig> {
        let config = TasNetConfig {
            enc_dim: c.req("enc_dim")?,
            win: c.req("win")?,
            hidden: c.req("hidden")?,
            num_spk: c.or("num_spk", 2)?,
            norm_type: c.or("norm_type", NormType::None)?,
        };
        if config.enc_dim == 0 || config.win == 0 || config.hidden == 0 || config.num_spk == 0 {
            return Err(Error::Config("model dimensions must be positive".into()));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct ChannelStats {
    mean: Matrix,
    var: Matrix,
}

impl ChannelStats {
    fn identity(n: usize) -> ChannelStats {
        ChannelStats { mean: Matrix::zeros(1, n), var: Matrix::filled(1, n, 1.0) }
    }

    fn affine(&self) -> (Vec<f64>, Vec<f64>) {
        let shift = self.mean.data[0].clone();
        let inv_std = self.var.data[0].iter().map(|v| 1.0 / (v + NORM_EPS).sqrt()).collect();
        (shift, inv_std)
    }
}

#[derive(Debug, Clone)]
struct ExampleTrace {
    len: usize,
    frames: Matrix,
    enc_pre: Matrix,
    enc: Matrix,
    inv_std: Vec<f64>,
    hidden: LayerCache,
    out: LayerCache,
    masks: Matrix,
}

/// Result of one batched forward pass.
#[derive(Debug, Clone)]
pub struct TasNetPass {
    /// `[B][K][T]` separated sources, same length as each input.
    pub estimates: Vec<Signals>,
    /// `[B]` normalized encoder outputs, `frames x enc_dim` each.
    pub features: Vec<Matrix>,
    traces: Vec<ExampleTrace>,
}

impl TasNetPass {
    pub fn batch_size(&self) -> usize {
        self.estimates.len()
    }
}

/// Gradients from one backward pass.
#[derive(Debug, Clone)]
pub struct TasNetBackprop {
    pub grads: Gradients,
    /// ∂L/∂mixture per batch item.
    pub input: Signals,
}

#[derive(Debug, Clone)]
pub struct TasNet {
    pub config: TasNetConfig,
    encoder: Matrix,
    decoder: Matrix,
    mask_hidden: Layer,
    mask_out: Layer,
    source_stats: ChannelStats,
    target_stats: ChannelStats,
    frozen_codec: bool,
}

impl TasNet {
    pub fn new<R: Rng + ?Sized>(config: TasNetConfig, rng: &mut R) -> TasNet {
        let n = config.enc_dim;
        let k = config.num_spk;
        TasNet {
            encoder: Matrix::xavier(config.win, n, rng),
            decoder: Matrix::xavier(n, config.win, rng),
            mask_hidden: Layer::new(config.hidden, n, ActivationFunction::ReLU, rng),
            mask_out: Layer::new(n * k, config.hidden, ActivationFunction::Sigmoid, rng),
            source_stats: ChannelStats::identity(n),
            target_stats: ChannelStats::identity(n),
            frozen_codec: false,
            config,
        }
    }

    pub fn num_spk(&self) -> usize {
        self.config.num_spk
    }

    /// Stops gradient flow into the encoder and decoder bases.
    pub fn freeze_codec(&mut self) {
        self.frozen_codec = true;
    }

    pub fn is_codec_frozen(&self) -> bool {
        self.frozen_codec
    }

    /// Installs corpus-level feature statistics for `NormType::Cmvn`.
    pub fn set_mv(&mut self, mean: &[f64], var: &[f64]) -> Result<()> {
        let n = self.config.enc_dim;
        if mean.len() != n || var.len() != n {
            return Err(Error::Shape(format!(
                "normalization statistics must have {n} channels, got {} / {}",
                mean.len(),
                var.len()
            )));
        }
        self.source_stats = ChannelStats {
            mean: Matrix::from_data(vec![mean.to_vec()]),
            var: Matrix::from_data(vec![var.to_vec()]),
        };
        Ok(())
    }

    /// Raw (pre-normalization) encoder output of one waveform, `frames x N`.
    pub fn encode(&self, waveform: &[f64]) -> Matrix {
        let frames = self.frame(waveform);
        (&frames * &self.encoder).map(relu)
    }

    fn frame(&self, waveform: &[f64]) -> Matrix {
        let win = self.config.win;
        let n_frames = waveform.len().div_ceil(win).max(1);
        Matrix::from_flat(n_frames, win, waveform)
    }

    fn norm_affine(&self, domain: Domain) -> (Vec<f64>, Vec<f64>) {
        match (self.config.norm_type, domain) {
            (NormType::None, _) => (vec![0.0; self.config.enc_dim], vec![1.0; self.config.enc_dim]),
            (NormType::Cmvn, _) | (NormType::TransNorm, Domain::Source) => self.source_stats.affine(),
            (NormType::TransNorm, Domain::Target) => self.target_stats.affine(),
        }
    }

    pub fn forward(&self, ctx: &RunContext, mixtures: &[Vec<f64>], domain: Domain) -> TasNetPass {
        let (shift, inv_std) = self.norm_affine(domain);
        let results = ctx.map_batch(mixtures, |mix| self.forward_one(mix, &shift, &inv_std));

        let mut pass = TasNetPass {
            estimates: Vec::with_capacity(results.len()),
            features: Vec::with_capacity(results.len()),
            traces: Vec::with_capacity(results.len()),
        };
        for (est, feat, trace) in results {
            pass.estimates.push(est);
            pass.features.push(feat);
            pass.traces.push(trace);
        }
        pass
    }

    fn forward_one(&self, mixture: &[f64], shift: &[f64], inv_std: &[f64]) -> (Signals, Matrix, ExampleTrace) {
        let n = self.config.enc_dim;
        let frames = self.frame(mixture);
        let enc_pre = &frames * &self.encoder;
        let enc = enc_pre.map(relu);

        let mut normed = enc.clone();
        for row in &mut normed.data {
            for (j, x) in row.iter_mut().enumerate() {
                *x = (*x - shift[j]) * inv_std[j];
            }
        }

        let (hidden, hidden_cache) = self.mask_hidden.forward(&normed);
        let (masks, out_cache) = self.mask_out.forward(&hidden);

        let estimates = (0..self.config.num_spk)
            .map(|k| {
                let masked = enc.hadamard(&masks.columns(k * n, n));
                (&masked * &self.decoder).flatten(mixture.len())
            })
            .collect();

        let trace = ExampleTrace {
            len: mixture.len(),
            frames,
            enc_pre,
            enc,
            inv_std: inv_std.to_vec(),
            hidden: hidden_cache,
            out: out_cache,
            masks,
        };
        (estimates, normed, trace)
    }

    /// Backpropagates `grad_estimates` (`[B][K][T]`) and/or `grad_features`
    /// (`[B]` of `frames x N`) through the pass. Per-item gradients are summed
    /// in batch order so the result does not depend on the device.
    pub fn backward(
        &self,
        ctx: &RunContext,
        pass: &TasNetPass,
        grad_estimates: Option<&[Signals]>,
        grad_features: Option<&[Matrix]>,
    ) -> TasNetBackprop {
        let indices: Vec<usize> = (0..pass.traces.len()).collect();
        let results = ctx.map_batch(&indices, |&b| {
            self.backward_one(
                &pass.traces[b],
                grad_estimates.map(|g| &g[b]),
                grad_features.map(|g| &g[b]),
            )
        });

        let mut grads = Gradients::new();
        let mut input = Vec::with_capacity(results.len());
        for (g, d_input) in results {
            grads.merge(&g);
            input.push(d_input);
        }
        TasNetBackprop { grads, input }
    }

    fn backward_one(
        &self,
        tr: &ExampleTrace,
        grad_est: Option<&Signals>,
        grad_feat: Option<&Matrix>,
    ) -> (Gradients, Vec<f64>) {
        let n = self.config.enc_dim;
        let k_spk = self.config.num_spk;
        let n_frames = tr.frames.rows;
        let mut grads = Gradients::new();

        let mut d_enc = Matrix::zeros(n_frames, n);
        let mut d_normed = Matrix::zeros(n_frames, n);

        if let Some(g_est) = grad_est {
            let mut d_masks = Matrix::zeros(n_frames, n * k_spk);
            let mut d_decoder = Matrix::zeros(n, self.config.win);
            let decoder_t = self.decoder.transpose();
            for (k, g) in g_est.iter().enumerate().take(k_spk) {
                let dy = Matrix::from_flat(n_frames, self.config.win, g);
                let mask_k = tr.masks.columns(k * n, n);
                let masked = tr.enc.hadamard(&mask_k);
                d_decoder.add_assign(&(&masked.transpose() * &dy));
                let d_masked = &dy * &decoder_t;
                d_masks.set_columns(k * n, &d_masked.hadamard(&tr.enc));
                d_enc.add_assign(&d_masked.hadamard(&mask_k));
            }

            let out_g = self.mask_out.backward(&tr.out, &d_masks);
            let hidden_g = self.mask_hidden.backward(&tr.hidden, &out_g.input);
            grads.accumulate("mask.1.weight", &out_g.weights);
            grads.accumulate("mask.1.bias", &out_g.biases);
            grads.accumulate("mask.0.weight", &hidden_g.weights);
            grads.accumulate("mask.0.bias", &hidden_g.biases);
            d_normed.add_assign(&hidden_g.input);
            if !self.frozen_codec {
                grads.accumulate("decoder.weight", &d_decoder);
            }
        }

        if let Some(g_feat) = grad_feat {
            d_normed.add_assign(g_feat);
        }

        for (row, d_row) in d_enc.data.iter_mut().zip(d_normed.data.iter()) {
            for (j, (d, dn)) in row.iter_mut().zip(d_row.iter()).enumerate() {
                *d += dn * tr.inv_std[j];
            }
        }

        let d_pre = d_enc.hadamard(&tr.enc_pre.map(relu_derivative));
        if !self.frozen_codec {
            grads.accumulate("encoder.weight", &(&tr.frames.transpose() * &d_pre));
        }
        let d_frames = &d_pre * &self.encoder.transpose();
        (grads, d_frames.flatten(tr.len))
    }

    /// Folds the encoder statistics of a training pass into the running
    /// statistics of `domain`. Only `NormType::TransNorm` keeps running stats.
    pub fn track_stats(&mut self, pass: &TasNetPass, domain: Domain) {
        if self.config.norm_type != NormType::TransNorm || pass.traces.is_empty() {
            return;
        }
        let n = self.config.enc_dim;
        let mut sum = vec![0.0; n];
        let mut count = 0usize;
        for tr in &pass.traces {
            for row in &tr.enc.data {
                for (s, x) in sum.iter_mut().zip(row.iter()) {
                    *s += x;
                }
            }
            count += tr.enc.rows;
        }
        let mean: Vec<f64> = sum.iter().map(|s| s / count as f64).collect();
        let mut var = vec![0.0; n];
        for tr in &pass.traces {
            for row in &tr.enc.data {
                for (j, x) in row.iter().enumerate() {
                    var[j] += (x - mean[j]).powi(2);
                }
            }
        }

        let stats = match domain {
            Domain::Source => &mut self.source_stats,
            Domain::Target => &mut self.target_stats,
        };
        for j in 0..n {
            let batch_var = var[j] / count as f64;
            stats.mean.data[0][j] = (1.0 - TN_MOMENTUM) * stats.mean.data[0][j] + TN_MOMENTUM * mean[j];
            stats.var.data[0][j] = (1.0 - TN_MOMENTUM) * stats.var.data[0][j] + TN_MOMENTUM * batch_var;
        }
    }
}

impl Module for TasNet {
    fn parameters_mut(&mut self) -> Vec<(String, &mut Matrix)> {
        let mut params = Vec::with_capacity(6);
        if !self.frozen_codec {
            params.push(("encoder.weight".to_string(), &mut self.encoder));
            params.push(("decoder.weight".to_string(), &mut self.decoder));
        }
        params.push(("mask.0.weight".to_string(), &mut self.mask_hidden.weights));
        params.push(("mask.0.bias".to_string(), &mut self.mask_hidden.biases));
        params.push(("mask.1.weight".to_string(), &mut self.mask_out.weights));
        params.push(("mask.1.bias".to_string(), &mut self.mask_out.biases));
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("encoder.weight".to_string(), self.encoder.clone());
        state.insert("decoder.weight".to_string(), self.decoder.clone());
        state.insert("mask.0.weight".to_string(), self.mask_hidden.weights.clone());
        state.insert("mask.0.bias".to_string(), self.mask_hidden.biases.clone());
        state.insert("mask.1.weight".to_string(), self.mask_out.weights.clone());
        state.insert("mask.1.bias".to_string(), self.mask_out.biases.clone());
        if self.config.norm_type != NormType::None {
            state.insert("norm.mean".to_string(), self.source_stats.mean.clone());
            state.insert("norm.var".to_string(), self.source_stats.var.clone());
        }
        if self.config.norm_type == NormType::TransNorm {
            state.insert("norm.target_mean".to_string(), self.target_stats.mean.clone());
            state.insert("norm.target_var".to_string(), self.target_stats.var.clone());
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<Vec<String>> {
        let mut slots = vec![
            ("encoder.weight".to_string(), &mut self.encoder),
            ("decoder.weight".to_string(), &mut self.decoder),
            ("mask.0.weight".to_string(), &mut self.mask_hidden.weights),
            ("mask.0.bias".to_string(), &mut self.mask_hidden.biases),
            ("mask.1.weight".to_string(), &mut self.mask_out.weights),
            ("mask.1.bias".to_string(), &mut self.mask_out.biases),
        ];
        match self.config.norm_type {
            NormType::None => {}
            NormType::Cmvn => {
                slots.push(("norm.mean".to_string(), &mut self.source_stats.mean));
                slots.push(("norm.var".to_string(), &mut self.source_stats.var));
            }
            NormType::TransNorm => {
                slots.push(("norm.mean".to_string(), &mut self.source_stats.mean));
                slots.push(("norm.var".to_string(), &mut self.source_stats.var));
                slots.push(("norm.target_mean".to_string(), &mut self.target_stats.mean));
                slots.push(("norm.target_var".to_string(), &mut self.target_stats.var));
            }
        }
        load_slots(slots, state, strict)
    }
}
