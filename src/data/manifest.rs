//! Corpus id lists: `uid -> {channel -> [relative_path, length]}`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

/// One channel of an utterance: audio file and its length in samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry(pub String, pub usize);

pub type Utterance = BTreeMap<String, ChannelEntry>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub utterances: BTreeMap<String, Utterance>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        let file = File::open(path)
            .map_err(|e| Error::Data(format!("cannot open manifest '{}': {e}", path.display())))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}

/// The corpora the loaders know how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corpus {
    Wsj0,
    Wham,
    Vctk,
    Libri,
}

impl Corpus {
    pub fn resolve(name: &str) -> Result<Corpus> {
        match name {
            "wsj0" => Ok(Corpus::Wsj0),
            "wham" => Ok(Corpus::Wham),
            "vctk" => Ok(Corpus::Vctk),
            "libri" => Ok(Corpus::Libri),
            other => Err(Error::UnknownDataset(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Corpus::Wsj0 => "wsj0",
            Corpus::Wham => "wham",
            Corpus::Vctk => "vctk",
            Corpus::Libri => "libri",
        }
    }

    /// Key under `data` holding the audio root directory.
    pub fn root_key(self) -> &'static str {
        match self {
            Corpus::Wsj0 | Corpus::Wham => "wsj_root",
            Corpus::Vctk => "vctk_root",
            Corpus::Libri => "libri_root",
        }
    }
}

/// Where a corpus lives on disk, resolved from the `data` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusPaths {
    pub corpus: Corpus,
    pub audio_root: PathBuf,
    pub list_dir: PathBuf,
}

impl CorpusPaths {
    pub fn from_config(data: &Config, name: &str) -> Result<CorpusPaths> {
        let corpus = Corpus::resolve(name)?;
        let audio_root: PathBuf = data.req(corpus.root_key())?;
        let list_dir: PathBuf = data.or("list_dir", PathBuf::from("./data"))?;
        Ok(CorpusPaths { corpus, audio_root, list_dir })
    }

    pub fn manifest_path(&self, split: &str) -> PathBuf {
        self.list_dir.join(self.corpus.name()).join("id_list").join(format!("{split}.json"))
    }

    pub fn gender_path(&self) -> PathBuf {
        self.list_dir.join(self.corpus.name()).join("gender.json")
    }

    pub fn mix_sdr_path(&self) -> PathBuf {
        self.list_dir.join(self.corpus.name()).join("mix_sdr.json")
    }

    pub fn load_manifest(&self, split: &str) -> Result<Manifest> {
        Manifest::load(&self.manifest_path(split))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_corpus_is_fatal() {
        assert!(matches!(Corpus::resolve("timit"), Err(Error::UnknownDataset(n)) if n == "timit"));
    }

    #[test]
    fn wham_shares_the_wsj_root() {
        let data = Config::from_yaml_str("wsj_root: /audio/wsj\nlist_dir: /lists").unwrap();
        let paths = CorpusPaths::from_config(&data, "wham").unwrap();
        assert_eq!(paths.audio_root, PathBuf::from("/audio/wsj"));
        assert_eq!(paths.manifest_path("cv"), PathBuf::from("/lists/wham/id_list/cv.json"));
        assert!(CorpusPaths::from_config(&data, "vctk").is_err());
    }

    #[test]
    fn manifest_parses_channel_pairs() {
        let json = r#"{"u1": {"mix": ["mix/u1.wav", 16000], "s1": ["s1/u1.wav", 16000]}}"#;
        let m: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.utterances["u1"]["s1"], ChannelEntry("s1/u1.wav".into(), 16000));
    }
}
