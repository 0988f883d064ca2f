//! Speaker-gender pairing of two-speaker mixtures, used only to split metrics.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GenderCategory {
    MM,
    FF,
    /// Mixed pair, in either order.
    MF,
}

impl GenderCategory {
    pub const ALL: [GenderCategory; 3] = [GenderCategory::MF, GenderCategory::MM, GenderCategory::FF];

    pub fn from_pair(a: &str, b: &str) -> Result<GenderCategory> {
        match (parse(a)?, parse(b)?) {
            ('M', 'M') => Ok(GenderCategory::MM),
            ('F', 'F') => Ok(GenderCategory::FF),
            _ => Ok(GenderCategory::MF),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenderCategory::MM => "MM",
            GenderCategory::FF => "FF",
            GenderCategory::MF => "MF",
        }
    }
}

impl fmt::Display for GenderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse(g: &str) -> Result<char> {
    match g {
        "M" | "m" => Ok('M'),
        "F" | "f" => Ok('F'),
        other => Err(Error::Data(format!("unknown speaker gender `{other}`"))),
    }
}

/// `uid -> category` for one corpus, read from its `gender.json`
/// (`uid -> ["M"|"F", "M"|"F"]`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenderMapper {
    table: BTreeMap<String, GenderCategory>,
}

impl GenderMapper {
    pub fn load(path: &Path) -> Result<GenderMapper> {
        let file = File::open(path)
            .map_err(|e| Error::Data(format!("cannot open gender table '{}': {e}", path.display())))?;
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_reader(BufReader::new(file))?;
        let mut table = BTreeMap::new();
        for (uid, genders) in raw {
            let [a, b] = genders.as_slice() else {
                return Err(Error::Data(format!("`{uid}` needs exactly two speaker genders")));
            };
            table.insert(uid, GenderCategory::from_pair(a, b)?);
        }
        Ok(GenderMapper { table })
    }

    /// Like `load`, but a corpus without a gender table maps nothing.
    pub fn load_or_empty(path: &Path) -> Result<GenderMapper> {
        if path.exists() {
            GenderMapper::load(path)
        } else {
            warn!("no gender table at '{}', per-gender metrics are skipped", path.display());
            Ok(GenderMapper::default())
        }
    }

    pub fn insert(&mut self, uid: &str, category: GenderCategory) {
        self.table.insert(uid.to_string(), category);
    }

    pub fn category(&self, uid: &str) -> Option<GenderCategory> {
        self.table.get(uid).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Running sums of one metric per gender category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenderStats {
    sums: BTreeMap<GenderCategory, (f64, usize)>,
}

impl GenderStats {
    pub fn add(&mut self, category: GenderCategory, value: f64) {
        let entry = self.sums.entry(category).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    /// `None` for a category that received no examples.
    pub fn mean(&self, category: GenderCategory) -> Option<f64> {
        self.sums.get(&category)
            .filter(|(_, n)| *n > 0)
            .map(|(sum, n)| sum / *n as f64)
    }

    /// Means of the non-empty categories.
    pub fn means(&self) -> BTreeMap<GenderCategory, f64> {
        GenderCategory::ALL.iter()
            .filter_map(|&g| self.mean(g).map(|m| (g, m)))
            .collect()
    }

    pub fn count(&self, category: GenderCategory) -> usize {
        self.sums.get(&category).map_or(0, |(_, n)| *n)
    }
}
