//! Model description and weight resolution.
//!
//! A model is named by a [`SdVersion`] plus optional local files for each
//! component. Components without a local file are fetched from the Hugging
//! Face Hub, so a bare version flag is enough to run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use serde::Deserialize;

use crate::error::Error;

/// The supported latent-diffusion model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdVersion {
    #[value(name = "v1-5")]
    #[serde(rename = "v1-5")]
    V1_5,
    #[value(name = "v2-1")]
    #[serde(rename = "v2-1")]
    V2_1,
}

impl SdVersion {
    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "runwayml/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
        }
    }

    fn unet_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "unet/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "unet/diffusion_pytorch_model.safetensors"
        }
    }

    fn vae_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "vae/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "vae/diffusion_pytorch_model.safetensors"
        }
    }

    fn clip_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "text_encoder/model.fp16.safetensors"
        } else {
            "text_encoder/model.safetensors"
        }
    }

    /// Scaling factor between VAE latents and the diffusion latent space.
    pub fn vae_scale(&self) -> f64 {
        match self {
            Self::V1_5 | Self::V2_1 => 0.18215,
        }
    }

    pub(crate) fn sd_config(&self, height: usize, width: usize) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, Some(height), Some(width)),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, Some(height), Some(width)),
        }
    }
}

/// One loadable piece of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelComponent {
    Tokenizer,
    Clip,
    Unet,
    Vae,
}

/// On-disk model description.
///
/// Every field is optional; the version defaults to v1-5 and any missing
/// component is fetched from the Hub.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub version: Option<SdVersion>,
    pub tokenizer: Option<PathBuf>,
    pub clip_weights: Option<PathBuf>,
    pub unet_weights: Option<PathBuf>,
    pub vae_weights: Option<PathBuf>,
}

impl ModelConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ModelConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| Error::ModelConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved description of where model weights come from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub version: SdVersion,
    tokenizer: Option<PathBuf>,
    clip_weights: Option<PathBuf>,
    unet_weights: Option<PathBuf>,
    vae_weights: Option<PathBuf>,
}

impl ModelSource {
    /// A source that pulls every component of `version` from the Hub.
    pub fn for_version(version: SdVersion) -> Self {
        Self {
            version,
            tokenizer: None,
            clip_weights: None,
            unet_weights: None,
            vae_weights: None,
        }
    }

    /// Merge a config file with per-component overrides.
    ///
    /// An explicit override beats the config file, which beats the Hub.
    pub fn resolve(
        version: SdVersion,
        config: Option<ModelConfig>,
        tokenizer: Option<PathBuf>,
        clip_weights: Option<PathBuf>,
        unet_weights: Option<PathBuf>,
        vae_weights: Option<PathBuf>,
    ) -> Self {
        let config = config.unwrap_or_default();
        Self {
            version: config.version.unwrap_or(version),
            tokenizer: tokenizer.or(config.tokenizer),
            clip_weights: clip_weights.or(config.clip_weights),
            unet_weights: unet_weights.or(config.unet_weights),
            vae_weights: vae_weights.or(config.vae_weights),
        }
    }

    /// Path to the weights for `component`, fetching from the Hub if no local
    /// file was configured.
    pub(crate) fn get(&self, component: ModelComponent, use_f16: bool) -> Result<PathBuf> {
        let local = match component {
            ModelComponent::Tokenizer => &self.tokenizer,
            ModelComponent::Clip => &self.clip_weights,
            ModelComponent::Unet => &self.unet_weights,
            ModelComponent::Vae => &self.vae_weights,
        };
        if let Some(path) = local {
            return Ok(path.clone());
        }

        let (repo, path) = match component {
            ModelComponent::Tokenizer => (self.version.tokenizer_repo(), "tokenizer.json"),
            ModelComponent::Clip => (self.version.repo(), self.version.clip_file(use_f16)),
            ModelComponent::Unet => (self.version.repo(), self.version.unet_file(use_f16)),
            ModelComponent::Vae => (self.version.repo(), self.version.vae_file(use_f16)),
        };
        let api = hf_hub::api::sync::Api::new()?;
        api.model(repo.to_string())
            .get(path)
            .with_context(|| format!("fetching {path} from {repo}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_parses_versions_and_paths() {
        let config: ModelConfig = serde_yaml::from_str(
            "version: v2-1\nunet_weights: weights/unet.safetensors\n",
        )
        .unwrap();
        assert_eq!(config.version, Some(SdVersion::V2_1));
        assert_eq!(
            config.unet_weights.as_deref(),
            Some(Path::new("weights/unet.safetensors"))
        );
        assert!(config.tokenizer.is_none());
    }

    #[test]
    fn config_rejects_unknown_fields() {
        assert!(serde_yaml::from_str::<ModelConfig>("checkpoint: model.ckpt\n").is_err());
    }

    #[test]
    fn config_load_reports_missing_file() {
        let err = ModelConfig::load(Path::new("does/not/exist.yaml")).unwrap_err();
        assert!(matches!(err, Error::ModelConfigRead { .. }));
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "version: v1-5").unwrap();
        let config = ModelConfig::load(file.path()).unwrap();
        assert_eq!(config.version, Some(SdVersion::V1_5));
    }

    #[test]
    fn overrides_beat_config_which_beats_version() {
        let config = ModelConfig {
            version: Some(SdVersion::V2_1),
            tokenizer: Some(PathBuf::from("from-config.json")),
            ..Default::default()
        };
        let source = ModelSource::resolve(
            SdVersion::V1_5,
            Some(config),
            Some(PathBuf::from("override.json")),
            None,
            None,
            None,
        );
        assert_eq!(source.version, SdVersion::V2_1);
        assert_eq!(
            source.tokenizer.as_deref(),
            Some(Path::new("override.json"))
        );
    }
}
