//! Step-indexed loss weights and learning-rate decay on plateau.

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::optim::Optimizer;

/// Weight of an adversarial loss term as a pure function of the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "lowercase")]
pub enum LambdaScheduler {
    /// `start_value` up to `start_step`, `end_value` from `end_step` on,
    /// linear in between.
    Ramp {
        start_step: u64,
        end_step: u64,
        start_value: f64,
        end_value: f64,
    },
    Constant { value: f64 },
}

impl LambdaScheduler {
    /// Builds from a section such as `solver.Lg_scheduler`.
    pub fn from_config(c: &Config) -> Result<LambdaScheduler> {
        let function: String = c.req("function")?;
        match function.as_str() {
            "ramp" => {
                let start_step: u64 = c.req("start_step")?;
                let end_step: u64 = c.req("end_step")?;
                if end_step < start_step {
                    return Err(Error::Config(format!(
                        "ramp end_step {end_step} is before start_step {start_step}"
                    )));
                }
                Ok(LambdaScheduler::Ramp {
                    start_step,
                    end_step,
                    start_value: c.req("start_value")?,
                    end_value: c.req("end_value")?,
                })
            }
            "constant" => Ok(LambdaScheduler::Constant { value: c.req("value")? }),
            other => Err(Error::Config(format!("unknown scheduler function `{other}`"))),
        }
    }

    pub fn value(&self, step: u64) -> f64 {
        match *self {
            LambdaScheduler::Constant { value } => value,
            LambdaScheduler::Ramp { start_step, end_step, start_value, end_value } => {
                if step >= end_step {
                    end_value
                } else if step <= start_step {
                    start_value
                } else {
                    let progress = (step - start_step) as f64 / (end_step - start_step) as f64;
                    start_value + (end_value - start_value) * progress
                }
            }
        }
    }
}

/// Halves (by default) the learning rate when the monitored loss has not
/// improved for more than `patience` validations. Mode is always `min`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLROnPlateau {
    pub factor: f64,
    pub patience: u32,
    pub threshold: f64,
    pub min_lr: f64,
    best: Option<f64>,
    num_bad: u32,
}

impl ReduceLROnPlateau {
    pub fn new(patience: u32) -> ReduceLROnPlateau {
        ReduceLROnPlateau { factor: 0.5, patience, threshold: 1e-4, min_lr: 0.0, best: None, num_bad: 0 }
    }

    /// Reads `scheduler.{use,type,patience}` from the solver section. Returns
    /// `None` when no scheduler is configured or it is switched off.
    pub fn from_config(solver: &Config) -> Result<Option<ReduceLROnPlateau>> {
        if !solver.contains("scheduler") {
            return Ok(None);
        }
        let c = solver.section("scheduler")?;
        if !c.or("use", false)? {
            return Ok(None);
        }
        let kind: String = c.req("type")?;
        if kind != "ReduceLROnPlateau" {
            return Err(Error::Config(format!("unsupported lr scheduler `{kind}`")));
        }
        Ok(Some(ReduceLROnPlateau::new(c.req("patience")?)))
    }

    /// Records one validation loss; returns true when the rate was lowered.
    pub fn step(&mut self, metric: f64, optimizer: &mut Optimizer) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.threshold),
        };
        if improved {
            self.best = Some(metric);
            self.num_bad = 0;
            return false;
        }

        self.num_bad += 1;
        if self.num_bad <= self.patience {
            return false;
        }
        self.num_bad = 0;
        let old = optimizer.learning_rate();
        let new = (old * self.factor).max(self.min_lr);
        if old - new > 1e-8 {
            optimizer.set_learning_rate(new);
            info!("reducing learning rate from {old:.3e} to {new:.3e}");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> LambdaScheduler {
        LambdaScheduler::Ramp { start_step: 10, end_step: 20, start_value: 0.0, end_value: 1.0 }
    }

    #[test]
    fn ramp_hits_both_endpoints() {
        let s = ramp();
        assert_eq!(s.value(0), 0.0);
        assert_eq!(s.value(10), 0.0);
        assert_eq!(s.value(20), 1.0);
        assert_eq!(s.value(1000), 1.0);
        assert!((s.value(15) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zero_length_ramp_jumps_to_end_value() {
        let s = LambdaScheduler::Ramp { start_step: 5, end_step: 5, start_value: 0.0, end_value: 1.0 };
        assert_eq!(s.value(4), 0.0);
        assert_eq!(s.value(5), 1.0);
        assert_eq!(s.value(6), 1.0);
    }

    #[test]
    fn ramp_is_strictly_increasing_inside() {
        let s = ramp();
        for step in 10..20 {
            assert!(s.value(step + 1) > s.value(step));
        }
    }

    #[test]
    fn built_from_config() {
        let c = Config::from_yaml_str("function: constant\nvalue: 0.3").unwrap();
        assert_eq!(LambdaScheduler::from_config(&c).unwrap().value(99), 0.3);
        let c = Config::from_yaml_str(
            "function: ramp\nstart_step: 0\nend_step: 4\nstart_value: 1\nend_value: 0",
        )
        .unwrap();
        assert_eq!(LambdaScheduler::from_config(&c).unwrap().value(2), 0.5);
        let c = Config::from_yaml_str("function: cosine").unwrap();
        assert!(LambdaScheduler::from_config(&c).is_err());
    }

    #[test]
    fn plateau_halves_after_patience() {
        let opt_cfg = Config::from_yaml_str("type: Adam\nlr: 0.1\nweight_decay: 0").unwrap();
        let mut opt = Optimizer::from_config(&opt_cfg).unwrap();
        let mut sched = ReduceLROnPlateau::new(1);
        assert!(!sched.step(1.0, &mut opt));
        assert!(!sched.step(1.0, &mut opt));
        assert!(sched.step(1.0, &mut opt));
        assert!((opt.learning_rate() - 0.05).abs() < 1e-12);
        assert!(!sched.step(0.5, &mut opt));
    }

    #[test]
    fn disabled_scheduler_is_none() {
        let solver = Config::from_yaml_str("scheduler:\n  use: false\n  type: ReduceLROnPlateau").unwrap();
        assert!(ReduceLROnPlateau::from_config(&solver).unwrap().is_none());
        let solver = Config::from_yaml_str("epochs: 1").unwrap();
        assert!(ReduceLROnPlateau::from_config(&solver).unwrap().is_none());
    }
}
