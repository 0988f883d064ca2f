pub mod adam;
pub mod ranger;
pub mod sgd;

use serde::{Deserialize, Serialize};

pub use adam::Adam;
pub use ranger::Ranger;
pub use sgd::Sgd;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::params::{Gradients, Module};

/// Optimizer selected by `optim.type`. The whole value, hyper-parameters and
/// per-parameter statistics, is what goes into a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Optimizer {
    #[serde(rename = "SGD")]
    Sgd(Sgd),
    Adam(Adam),
    #[serde(rename = "ranger")]
    Ranger(Ranger),
}

impl Optimizer {
    /// Reads `type`, `lr`, `weight_decay` and, for SGD, `momentum` from an
    /// optimizer section (`optim`, `g_optim` or `d_optim`).
    pub fn from_config(c: &Config) -> Result<Optimizer> {
        let kind: String = c.req("type")?;
        let lr: f64 = c.req("lr")?;
        let weight_decay: f64 = c.req("weight_decay")?;
        match kind.as_str() {
            "SGD" => Ok(Optimizer::Sgd(Sgd::new(lr, c.req("momentum")?, weight_decay))),
            "Adam" => Ok(Optimizer::Adam(Adam::new(lr, weight_decay))),
            "ranger" => Ok(Optimizer::Ranger(Ranger::new(lr, weight_decay))),
            other => Err(Error::UnknownOptimizer(other.to_string())),
        }
    }

    pub fn step<M: Module + ?Sized>(&mut self, model: &mut M, grads: &Gradients) {
        match self {
            Optimizer::Sgd(opt) => opt.step(model, grads),
            Optimizer::Adam(opt) => opt.step(model, grads),
            Optimizer::Ranger(opt) => opt.step(model, grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::Sgd(opt) => opt.learning_rate,
            Optimizer::Adam(opt) => opt.learning_rate,
            Optimizer::Ranger(opt) => opt.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Optimizer::Sgd(opt) => opt.learning_rate = lr,
            Optimizer::Adam(opt) => opt.learning_rate = lr,
            Optimizer::Ranger(opt) => opt.learning_rate = lr,
        }
    }

    pub fn state_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Replaces this optimizer with a saved one. The saved kind must match.
    pub fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        let loaded: Optimizer = serde_json::from_value(state.clone())?;
        if std::mem::discriminant(&loaded) != std::mem::discriminant(self) {
            return Err(Error::Checkpoint(format!(
                "saved optimizer is {}, configured optimizer is {}",
                loaded.kind(),
                self.kind()
            )));
        }
        *self = loaded;
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Optimizer::Sgd(_) => "SGD",
            Optimizer::Adam(_) => "Adam",
            Optimizer::Ranger(_) => "ranger",
        }
    }
}
