use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the orchestration layer itself.
///
/// Model-loading paths report through `anyhow` with context instead, matching
/// the rest of the pipeline surface.
#[derive(Error, Debug)]
pub enum Error {
    /// A generation option failed validation.
    #[error("invalid value for `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    /// Chunking was requested with a zero batch size.
    #[error("prompt batch size must be nonzero")]
    ZeroBatchSize,

    /// No prompts were left to render.
    #[error("no prompts to render")]
    EmptyPrompts,

    /// A prompt tokenized to more tokens than the text encoder accepts.
    #[error("the prompt is too long, {len} > max tokens ({max})")]
    PromptTooLong { len: usize, max: usize },

    /// Failed to read the prompts file.
    #[error("failed to read prompts from {path}")]
    PromptFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read the model config file.
    #[error("failed to read model config from {path}")]
    ModelConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The model config file did not parse.
    #[error("failed to parse model config {path}")]
    ModelConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The watermark payload does not fit in the target image.
    #[error("watermark payload of {payload} bytes exceeds image capacity of {capacity} bytes")]
    WatermarkCapacity { payload: usize, capacity: usize },

    /// No intact watermark was found in the image.
    #[error("no watermark payload found")]
    WatermarkMissing,

    /// The image batch changed shape while being screened.
    #[error("image batch changed shape during screening: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Core(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
