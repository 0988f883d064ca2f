pub mod audio;
pub mod dataset;
pub mod gender;
pub mod loader;
pub mod manifest;

pub use dataset::{Batch, ChunkDataset, ChunkMode, DatasetOptions, Sample};
pub use gender::{GenderCategory, GenderMapper, GenderStats};
pub use loader::{DataLoader, InfiniteLoader, LoaderOptions};
pub use manifest::{Corpus, CorpusPaths, Manifest};
