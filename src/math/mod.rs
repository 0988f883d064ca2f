pub mod matrix;

/// A group of equally long waveforms: `[K][T]` sources of one example, or a
/// `[B][T]` batch of mixtures.
pub type Signals = Vec<Vec<f64>>;

pub use matrix::Matrix;
