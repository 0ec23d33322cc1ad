//! Output directory layout and sample numbering.
//!
//! Samples land in three sibling folders under `<root>/samples`: the decoded
//! original, the Lanczos-resized copy, and the enhanced copy, all sharing one
//! zero-padded index. Grids land in the output root. Numbering resumes one
//! past the highest index already on disk, so reruns never overwrite earlier
//! samples.

use std::path::{Path, PathBuf};

use crate::error::Result;

const GRID_PREFIX: &str = "grid-";

/// The fixed three-subfolder output layout.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    original: PathBuf,
    resized: PathBuf,
    improved: PathBuf,
}

impl OutputLayout {
    /// Create the output root and its sample subdirectories.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let samples = root.join("samples");
        let layout = Self {
            original: samples.join("original"),
            resized: samples.join("resized"),
            improved: samples.join("improved"),
            root,
        };
        for dir in [&layout.original, &layout.resized, &layout.improved] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn original_path(&self, index: usize) -> PathBuf {
        self.original.join(format!("{index:05}.png"))
    }

    pub fn resized_path(&self, index: usize) -> PathBuf {
        self.resized.join(format!("{index:05}.png"))
    }

    pub fn improved_path(&self, index: usize) -> PathBuf {
        self.improved.join(format!("{index:05}.png"))
    }

    pub fn grid_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("{GRID_PREFIX}{index:04}.png"))
    }

    /// First free sample index: one past the highest numbered file in the
    /// originals folder.
    pub fn next_sample_index(&self) -> Result<usize> {
        next_index(&self.original, |stem| stem.parse().ok())
    }

    /// First free grid index.
    pub fn next_grid_index(&self) -> Result<usize> {
        next_index(&self.root, |stem| {
            stem.strip_prefix(GRID_PREFIX)?.parse().ok()
        })
    }
}

fn next_index(dir: &Path, parse: impl Fn(&str) -> Option<usize>) -> Result<usize> {
    let mut highest = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let stem = path.file_stem().and_then(|s| s.to_str());
        if let Some(index) = stem.and_then(&parse) {
            highest = Some(highest.map_or(index, |h: usize| h.max(index)));
        }
    }
    Ok(highest.map_or(0, |h| h + 1))
}
