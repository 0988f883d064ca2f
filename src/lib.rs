pub mod math;
pub mod activation;
pub mod layers;
pub mod network;
pub mod loss;
pub mod optim;
pub mod schedule;
pub mod data;
pub mod config;
pub mod context;
pub mod error;
pub mod checkpoint;
pub mod logging;
pub mod eval;
pub mod train;

// Convenience re-exports
pub use math::matrix::Matrix;
pub use config::Config;
pub use context::RunContext;
pub use error::{Error, Result};
pub use network::tasnet::{TasNet, TasNetConfig};
pub use loss::pit::pit_loss;
pub use optim::Optimizer;
pub use checkpoint::{CheckpointRecord, Saver};
pub use eval::Evaluator;
pub use train::{drive, Mode, Solver, TrainingLoop};
