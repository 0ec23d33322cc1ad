//! Prompt batching.
//!
//! The sampler consumes fixed-size batches of prompts: either one prompt
//! repeated `batch_size` times, or the lines of a prompt file chunked into
//! groups of `batch_size`.

use std::path::Path;

use crate::error::{Error, Result};

/// Split `items` into consecutive groups of `size`; the final group may be
/// shorter. Empty input yields no groups.
pub fn chunk<T: Clone>(items: &[T], size: usize) -> Result<Vec<Vec<T>>> {
    if size == 0 {
        return Err(Error::ZeroBatchSize);
    }
    Ok(items.chunks(size).map(<[T]>::to_vec).collect())
}

/// One batch of `prompt` repeated `batch_size` times.
pub fn batches_from_prompt(prompt: &str, batch_size: usize) -> Result<Vec<Vec<String>>> {
    if batch_size == 0 {
        return Err(Error::ZeroBatchSize);
    }
    if prompt.trim().is_empty() {
        return Err(Error::EmptyPrompts);
    }
    Ok(vec![vec![prompt.to_string(); batch_size]])
}

/// Batches built from a prompt file, one prompt per line. Blank lines are
/// skipped.
pub fn batches_from_file(path: &Path, batch_size: usize) -> Result<Vec<Vec<String>>> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::PromptFile {
        path: path.to_path_buf(),
        source,
    })?;
    let prompts: Vec<String> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    if prompts.is_empty() {
        return Err(Error::EmptyPrompts);
    }
    chunk(&prompts, batch_size)
}
