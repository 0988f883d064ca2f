//! Scalar metric sinks and the step/epoch-aware `Dashboard` in front of them.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Named scalars reported together, e.g. one validation pass.
pub type Scalars = BTreeMap<String, f64>;

/// Write-only destination for scalar metrics.
pub trait MetricSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    /// `None` for a non-finite value.
    pub value: Option<f64>,
    pub step: u64,
    pub time: String,
}

/// Appends one JSON object per scalar to `{log_dir}/metrics.jsonl`.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(log_dir: &Path) -> Result<JsonlSink> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("metrics.jsonl"))?;
        Ok(JsonlSink { writer: BufWriter::new(file) })
    }
}

impl MetricSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            value: value.is_finite().then_some(value),
            step,
            time: chrono::Local::now().to_rfc3339(),
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Keeps every scalar in memory. Clones share the same buffer, so a test
/// can hand one clone to a trainer and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<(String, f64, u64)>>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn events(&self) -> Vec<(String, f64, u64)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// `(step, value)` of every event with `tag`, in logging order.
    pub fn series(&self, tag: &str) -> Vec<(u64, f64)> {
        self.events().into_iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, v, s)| (s, v))
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push((tag.to_string(), value, step));
        }
        Ok(())
    }
}

/// Front end used by the training loops. Step and epoch counters are
/// one-based and advanced explicitly; a resumed run sets them from the
/// checkpoint.
pub struct Dashboard {
    sink: Box<dyn MetricSink>,
    step: u64,
    epoch: u64,
}

impl Dashboard {
    pub fn new(sink: Box<dyn MetricSink>) -> Dashboard {
        Dashboard { sink, step: 1, epoch: 1 }
    }

    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn epoch(&mut self) {
        self.epoch += 1;
    }

    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn current_step(&self) -> u64 {
        self.step
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.sink.add_scalar(tag, value, step)
    }

    /// `{prefix}/{key}` at the current step.
    pub fn log_step_info(&mut self, prefix: &str, meta: &Scalars) -> Result<()> {
        for (key, value) in meta {
            self.sink.add_scalar(&format!("{prefix}/{key}"), *value, self.step)?;
        }
        Ok(())
    }

    /// `{prefix}/{key}` at the current epoch.
    pub fn log_epoch_info(&mut self, prefix: &str, meta: &Scalars) -> Result<()> {
        for (key, value) in meta {
            self.sink.add_scalar(&format!("{prefix}/{key}"), *value, self.epoch)?;
        }
        self.sink.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }
}

/// Shorthand for building a `Scalars` map.
pub fn scalars<const N: usize>(entries: [(&str, f64); N]) -> Scalars {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_prefixes_and_counts() {
        let sink = MemorySink::new();
        let mut dash = Dashboard::new(Box::new(sink.clone()));
        dash.log_step_info("train", &scalars([("iter_loss", 1.5)])).unwrap();
        dash.step();
        dash.log_step_info("train", &scalars([("iter_loss", 1.0)])).unwrap();
        dash.log_epoch_info("valid", &scalars([("wsj0_epoch_loss", 0.5)])).unwrap();

        assert_eq!(sink.series("train/iter_loss"), vec![(1, 1.5), (2, 1.0)]);
        assert_eq!(sink.series("valid/wsj0_epoch_loss"), vec![(1, 0.5)]);
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = JsonlSink::open(dir.path()).unwrap();
            sink.add_scalar("train/d_loss", 0.25, 3).unwrap();
            sink.add_scalar("train/g_loss", f64::NAN, 3).unwrap();
        }
        let mut sink = JsonlSink::open(dir.path()).unwrap();
        sink.add_scalar("train/d_loss", 0.5, 4).unwrap();
        sink.flush().unwrap();

        let text = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
        let events: Vec<ScalarEvent> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].value, Some(0.25));
        assert_eq!(events[1].value, None);
        assert_eq!(events[2].step, 4);
    }
}
