//! Content screening for decoded image batches.
//!
//! The classifier itself is an external model behind the [`SafetyChecker`]
//! trait; the bundled implementation scores images against a fixed concept
//! list with CLIP zero-shot classification. [`SafetyFilter`] owns the
//! substitution policy: flagged images are replaced in place by a placeholder
//! resized to the batch dimensions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{ops::softmax, VarBuilder};
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::imageops::FilterType;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::error::Error;
use crate::images;

/// Concepts that cause an image to be flagged.
const UNSAFE_CONCEPTS: &[&str] = &[
    "explicit nudity",
    "graphic sexual content",
    "graphic violence and gore",
];

/// Neutral anchors competing in the same softmax.
const SAFE_CONCEPTS: &[&str] = &[
    "a landscape photograph",
    "a portrait of a person",
    "an abstract painting",
    "a picture of an animal",
    "a photograph of food",
];

const DEFAULT_THRESHOLD: f32 = 0.5;

const CLIP_REPO: &str = "openai/clip-vit-base-patch32";
const CLIP_REVISION: &str = "refs/pr/15";

/// Outcome of screening one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    /// Screening was switched off.
    Unchecked,
    /// One flag per image in the batch.
    Checked(Vec<bool>),
}

impl SafetyVerdict {
    pub fn any_flagged(&self) -> bool {
        match self {
            Self::Unchecked => false,
            Self::Checked(flags) => flags.iter().any(|f| *f),
        }
    }
}

/// External classifier seam: one boolean per image in the batch.
pub trait SafetyChecker {
    fn flag(&self, images: &Tensor) -> Result<Vec<bool>>;
}

/// CLIP zero-shot screening against the fixed concept list.
pub struct ClipSafetyChecker {
    model: ClipModel,
    concept_ids: Tensor,
    image_size: usize,
    device: Device,
    threshold: f32,
}

impl ClipSafetyChecker {
    /// Build the checker, fetching the CLIP weights and tokenizer from the
    /// Hub when no local files are given.
    pub fn load(
        model_file: Option<PathBuf>,
        tokenizer_file: Option<PathBuf>,
        device: &Device,
    ) -> Result<Self> {
        let (model_file, tokenizer_file) = match (model_file, tokenizer_file) {
            (Some(m), Some(t)) => (m, t),
            (model_file, tokenizer_file) => {
                let api = hf_hub::api::sync::Api::new()?;
                let repo = api.repo(hf_hub::Repo::with_revision(
                    CLIP_REPO.to_string(),
                    hf_hub::RepoType::Model,
                    CLIP_REVISION.to_string(),
                ));
                let model_file = match model_file {
                    Some(m) => m,
                    None => repo.get("model.safetensors")?,
                };
                let tokenizer_file = match tokenizer_file {
                    Some(t) => t,
                    None => repo.get("tokenizer.json")?,
                };
                (model_file, tokenizer_file)
            }
        };

        info!("loading safety checker from {}", model_file.display());
        let config = ClipConfig::vit_base_patch32();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_file], DType::F32, device)?
        };
        let model = ClipModel::new(vb, &config)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(E::msg)?;
        let concept_ids = tokenize_concepts(&tokenizer, device)?;

        Ok(Self {
            model,
            concept_ids,
            image_size: config.image_size,
            device: device.clone(),
            threshold: DEFAULT_THRESHOLD,
        })
    }
}

fn tokenize_concepts(tokenizer: &Tokenizer, device: &Device) -> Result<Tensor> {
    let pad_id = *tokenizer
        .get_vocab(true)
        .get("<|endoftext|>")
        .context("tokenizer has no pad token")?;
    let mut tokens = Vec::new();
    for concept in UNSAFE_CONCEPTS.iter().chain(SAFE_CONCEPTS) {
        let encoding = tokenizer.encode(*concept, true).map_err(E::msg)?;
        tokens.push(encoding.get_ids().to_vec());
    }
    let max_len = tokens.iter().map(Vec::len).max().unwrap_or(0);
    for token_vec in tokens.iter_mut() {
        token_vec.resize(max_len, pad_id);
    }
    Ok(Tensor::new(tokens, device)?)
}

impl SafetyChecker for ClipSafetyChecker {
    fn flag(&self, images: &Tensor) -> Result<Vec<bool>> {
        let pixel_values = clip_pixel_values(images, self.image_size, &self.device)?;
        let (_logits_per_text, logits_per_image) =
            self.model.forward(&pixel_values, &self.concept_ids)?;
        let probabilities = softmax(&logits_per_image, 1)?.to_vec2::<f32>()?;
        Ok(probabilities
            .iter()
            .map(|row| row[..UNSAFE_CONCEPTS.len()].iter().sum::<f32>() > self.threshold)
            .collect())
    }
}

/// Re-encode a decoded `[B, 3, H, W]` batch at the classifier's input size
/// and value range.
fn clip_pixel_values(images: &Tensor, image_size: usize, device: &Device) -> Result<Tensor> {
    let mut resized = Vec::new();
    for img in images::tensor_to_images(images)? {
        let img = image::DynamicImage::ImageRgb8(img)
            .resize_to_fill(image_size as u32, image_size as u32, FilterType::Triangle)
            .to_rgb8();
        let tensor = Tensor::from_vec(
            img.into_raw(),
            (image_size, image_size, 3),
            &Device::Cpu,
        )?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?;
        resized.push(tensor);
    }
    Ok(Tensor::stack(&resized, 0)?.to_device(device)?)
}

/// Applies the screening switch and the placeholder substitution.
pub struct SafetyFilter {
    checker: Option<Box<dyn SafetyChecker>>,
    placeholder: PathBuf,
}

impl SafetyFilter {
    /// A filter that passes batches through with an [`SafetyVerdict::Unchecked`]
    /// verdict.
    pub fn disabled() -> Self {
        Self {
            checker: None,
            placeholder: PathBuf::new(),
        }
    }

    pub fn new(checker: Box<dyn SafetyChecker>, placeholder: impl Into<PathBuf>) -> Self {
        Self {
            checker: Some(checker),
            placeholder: placeholder.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.checker.is_some()
    }

    /// Screen a decoded `[B, 3, H, W]` batch, substituting flagged images.
    ///
    /// The returned batch always has the shape of the input batch.
    pub fn screen(&self, images: Tensor) -> Result<(Tensor, SafetyVerdict)> {
        let checker = match &self.checker {
            None => return Ok((images, SafetyVerdict::Unchecked)),
            Some(checker) => checker,
        };

        let flags = checker.flag(&images)?;
        if !flags.iter().any(|f| *f) {
            return Ok((images, SafetyVerdict::Checked(flags)));
        }

        let (_b, _c, h, w) = images.dims4()?;
        let shape = images.shape().clone();
        let replacement = self.load_placeholder(w as u32, h as u32, images.device());
        let mut samples = Vec::new();
        for (index, flagged) in flags.iter().enumerate() {
            let sample = images.i(index)?;
            match (&replacement, flagged) {
                (Some(replacement), true) => samples.push(replacement.clone()),
                _ => samples.push(sample),
            }
        }
        let screened = Tensor::stack(&samples, 0)?;
        if screened.shape() != &shape {
            return Err(Error::ShapeMismatch {
                expected: format!("{shape:?}"),
                actual: format!("{:?}", screened.shape()),
            }
            .into());
        }
        Ok((screened, SafetyVerdict::Checked(flags)))
    }

    /// Load the placeholder resized to the batch dimensions. A missing or
    /// unreadable placeholder leaves flagged images unreplaced.
    fn load_placeholder(&self, width: u32, height: u32, device: &Device) -> Option<Tensor> {
        match load_placeholder_image(&self.placeholder, width, height, device) {
            Ok(tensor) => Some(tensor),
            Err(err) => {
                warn!(
                    "cannot load placeholder {}: {err:#}; flagged images kept",
                    self.placeholder.display()
                );
                None
            }
        }
    }
}

fn load_placeholder_image(
    path: &Path,
    width: u32,
    height: u32,
    device: &Device,
) -> Result<Tensor> {
    let img = image::open(path)?
        .resize_exact(width, height, FilterType::Lanczos3)
        .to_rgb8();
    Ok(images::image_to_tensor(&img, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct FixedChecker {
        flags: Vec<bool>,
    }

    impl SafetyChecker for FixedChecker {
        fn flag(&self, _images: &Tensor) -> Result<Vec<bool>> {
            Ok(self.flags.clone())
        }
    }

    fn batch(b: usize, h: usize, w: usize, value: f32) -> Tensor {
        Tensor::full(value, (b, 3, h, w), &Device::Cpu).unwrap()
    }

    #[test]
    fn disabled_filter_returns_input_unchanged() {
        let images = batch(2, 4, 4, 0.25);
        let (screened, verdict) = SafetyFilter::disabled().screen(images.clone()).unwrap();
        assert_eq!(verdict, SafetyVerdict::Unchecked);
        assert!(!verdict.any_flagged());
        assert_eq!(
            screened.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            images.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn unflagged_batch_passes_through() {
        let filter = SafetyFilter::new(
            Box::new(FixedChecker {
                flags: vec![false, false],
            }),
            "missing.png",
        );
        let (screened, verdict) = filter.screen(batch(2, 4, 4, 0.5)).unwrap();
        assert_eq!(verdict, SafetyVerdict::Checked(vec![false, false]));
        assert_eq!(screened.dims(), &[2, 3, 4, 4]);
    }

    #[test]
    fn flagged_images_are_substituted_and_shape_kept() {
        let dir = tempfile::tempdir().unwrap();
        let placeholder = dir.path().join("placeholder.png");
        RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]))
            .save(&placeholder)
            .unwrap();

        let filter = SafetyFilter::new(
            Box::new(FixedChecker {
                flags: vec![true, false],
            }),
            placeholder,
        );
        let (screened, verdict) = filter.screen(batch(2, 4, 4, 0.0)).unwrap();
        assert!(verdict.any_flagged());
        assert_eq!(screened.dims(), &[2, 3, 4, 4]);

        // red placeholder in slot 0, untouched zeros in slot 1
        let first = screened.i(0).unwrap();
        let red = first.i(0).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(red.iter().all(|v| (*v - 1.0).abs() < 1e-6));
        let second = screened.i(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(second.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn missing_placeholder_keeps_flagged_images() {
        let filter = SafetyFilter::new(
            Box::new(FixedChecker {
                flags: vec![true],
            }),
            "definitely/not/here.png",
        );
        let (screened, verdict) = filter.screen(batch(1, 4, 4, 0.75)).unwrap();
        assert_eq!(verdict, SafetyVerdict::Checked(vec![true]));
        let values = screened.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 0.75).abs() < 1e-6));
    }
}
