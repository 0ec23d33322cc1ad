//! Core crate for interacting with txt2img_rs.
//!
//! The API mirrors the command-line driver: load a [`Pipeline`], feed it
//! prompt batches, then screen, watermark, post-process and persist the
//! decoded images.
//!
//! ```no_run
//! use txt2img_core::{
//!     GenerationParams, ModelSource, Pipeline, SamplerKind, SdVersion, Watermarker,
//! };
//! use candle_core::{DType, Device};
//!
//! let device = Device::cuda_if_available(0)?;
//! let params = GenerationParams::default();
//! let pipeline = Pipeline::load(
//!     &ModelSource::for_version(SdVersion::V1_5),
//!     SamplerKind::Ddim.scheduler_config(0.0),
//!     &device,
//!     DType::F32,
//!     &params,
//! )?;
//!
//! let images = pipeline.forward(
//!     &["a painting of a virus monster playing guitar".to_string()],
//!     &params,
//!     None,
//! )?;
//!
//! let image = txt2img_core::images::tensor_to_images(&images)?.remove(0);
//! let watermarked = Watermarker::new(txt2img_core::watermark::DEFAULT_PAYLOAD).apply(image)?;
//! watermarked.save("sample.png")?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
pub mod images;
pub mod models;
pub mod output;
pub mod pipelines;
pub mod postprocess;
pub mod prompts;
pub mod safety;
pub mod util;
pub mod watermark;

pub use error::{Error, Result};
pub use models::{ModelConfig, ModelSource, SdVersion};
pub use pipelines::{GenerationParams, Pipeline, SamplerKind};
pub use safety::{ClipSafetyChecker, SafetyChecker, SafetyFilter, SafetyVerdict};
pub use watermark::Watermarker;
