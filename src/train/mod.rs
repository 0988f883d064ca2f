//! Training loops.
//!
//! Every loop is a small state machine driven by [`drive`]:
//! `setup`, then `run_step` until `is_done`, with `validate` and
//! `checkpoint` after every step for which `should_validate` holds, and
//! `finish` once the loop completes without being stopped.
//! The CLI mode is mapped to one closed [`Solver`] variant at startup.

pub mod dagan;
pub mod experiment;
pub mod supervised;
pub mod uns;
pub mod validate;

use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

pub use dagan::DaganTrainer;
pub use experiment::Experiment;
pub use supervised::{SupervisedTrainer, SupervisedVariant};
pub use uns::UnsTrainer;
pub use validate::{run_validation, ValidationReport};

use crate::config::Config;
use crate::context::RunContext;
use crate::error::Result;
use crate::eval::Evaluator;
use crate::logging::Scalars;

/// Capabilities shared by all training loops.
pub trait TrainingLoop {
    /// One-off work before the first step (statistics pre-pass,
    /// discriminator pre-training).
    fn setup(&mut self) -> Result<()>;

    /// One unit of training: an epoch for the supervised loops, one outer
    /// generator/discriminator step for the adversarial ones.
    fn run_step(&mut self) -> Result<()>;

    fn should_validate(&self) -> bool;

    /// Scores the model on held-out data. Nothing is updated except the
    /// dashboard.
    fn validate(&mut self) -> Result<Scalars>;

    fn checkpoint(&mut self, scores: &Scalars) -> Result<()>;

    fn is_done(&self) -> bool;

    /// Work after the last step, skipped when the run was stopped early.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Runs `lp` to completion. A raised `stop` flag ends the run at the next
/// step boundary.
pub fn drive<L: TrainingLoop + ?Sized>(lp: &mut L, stop: Option<&AtomicBool>) -> Result<()> {
    lp.setup()?;
    while !lp.is_done() {
        if stop.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            info!("stop requested, leaving the training loop");
            return Ok(());
        }
        lp.run_step()?;
        if lp.should_validate() {
            let scores = lp.validate()?;
            lp.checkpoint(&scores)?;
        }
    }
    lp.finish()
}

/// `--mode` of the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Baseline,
    Cmvn,
    Transnorm,
    Dagan,
    Uns,
}

/// The one loop (or evaluator) a process runs.
pub enum Solver {
    Supervised(Box<SupervisedTrainer>),
    Dagan(Box<DaganTrainer>),
    Uns(Box<UnsTrainer>),
    Test(Box<Evaluator>),
}

impl Solver {
    /// Builds the solver for `mode`; `test` selects the evaluator, which
    /// serves every mode. All required configuration is read here.
    pub fn build(mode: Mode, test: bool, config: Config, ctx: RunContext) -> Result<Solver> {
        if test {
            return Ok(Solver::Test(Box::new(Evaluator::new(&config, ctx)?)));
        }
        Ok(match mode {
            Mode::Baseline => Solver::Supervised(Box::new(SupervisedTrainer::new(SupervisedVariant::Baseline, config, ctx)?)),
            Mode::Cmvn => Solver::Supervised(Box::new(SupervisedTrainer::new(SupervisedVariant::Cmvn, config, ctx)?)),
            Mode::Transnorm => Solver::Supervised(Box::new(SupervisedTrainer::new(SupervisedVariant::TransNorm, config, ctx)?)),
            Mode::Dagan => Solver::Dagan(Box::new(DaganTrainer::new(config, ctx)?)),
            Mode::Uns => Solver::Uns(Box::new(UnsTrainer::new(config, ctx)?)),
        })
    }

    pub fn exec(self, stop: Option<&AtomicBool>) -> Result<()> {
        match self {
            Solver::Supervised(mut t) => drive(t.as_mut(), stop),
            Solver::Dagan(mut t) => drive(t.as_mut(), stop),
            Solver::Uns(mut t) => drive(t.as_mut(), stop),
            Solver::Test(e) => e.run().map(|_| ()),
        }
    }
}
