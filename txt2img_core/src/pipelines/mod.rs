//! The text-to-image pipeline: text conditioning, the denoising loop, and
//! latent decoding, assembled from external model components.

mod sampler;
mod sampling;

use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::SchedulerConfig, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use tokenizers::Tokenizer;
use tracing::info;

pub use sampler::SamplerKind;

use crate::error::Error;
use crate::models::{ModelComponent, ModelSource, SdVersion};

/// Generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Image height, in pixel space.
    pub height: usize,
    /// Image width, in pixel space.
    pub width: usize,
    /// The number of denoising steps. More denoising steps usually lead to a
    /// higher quality image at the expense of slower inference.
    pub num_steps: usize,
    /// Higher guidance scale encourages images closely linked to the text
    /// prompt, usually at the expense of lower image quality.
    pub guidance_scale: f64,
    /// Channels of the latent space.
    pub latent_channels: usize,
    /// Spatial downsampling between pixel space and latent space.
    pub downsample_factor: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            height: 512,
            width: 512,
            num_steps: 50,
            guidance_scale: 7.5,
            latent_channels: 4,
            downsample_factor: 8,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> crate::Result<()> {
        if self.downsample_factor == 0 {
            return Err(Error::InvalidOption {
                name: "downsample_factor",
                reason: "must be nonzero".to_string(),
            });
        }
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % self.downsample_factor != 0 {
                return Err(Error::InvalidOption {
                    name,
                    reason: format!(
                        "{value} is not a positive multiple of the downsampling factor ({})",
                        self.downsample_factor
                    ),
                });
            }
        }
        if self.num_steps == 0 {
            return Err(Error::InvalidOption {
                name: "steps",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.latent_channels == 0 {
            return Err(Error::InvalidOption {
                name: "latent_channels",
                reason: "must be nonzero".to_string(),
            });
        }
        Ok(())
    }

    /// Shape of the starting latents for a batch of `batch_size` prompts.
    pub fn latent_shape(&self, batch_size: usize) -> (usize, usize, usize, usize) {
        (
            batch_size,
            self.latent_channels,
            self.height / self.downsample_factor,
            self.width / self.downsample_factor,
        )
    }
}

/// Represents the model and provides methods to load and interact with it.
pub struct Pipeline {
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler_config: Box<dyn SchedulerConfig>,
    sd_config: StableDiffusionConfig,
    version: SdVersion,
    device: Device,
    dtype: DType,
}

impl Pipeline {
    /// Load every model component described by `source` onto `device`.
    pub fn load(
        source: &ModelSource,
        scheduler_config: Box<dyn SchedulerConfig>,
        device: &Device,
        dtype: DType,
        params: &GenerationParams,
    ) -> Result<Self> {
        params.validate()?;
        let version = source.version;
        let use_f16 = dtype == DType::F16;
        let sd_config = version.sd_config(params.height, params.width);

        let tokenizer_file = source.get(ModelComponent::Tokenizer, use_f16)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(E::msg)?;

        info!("building the CLIP text encoder");
        let clip_weights = source.get(ModelComponent::Clip, use_f16)?;
        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            device,
            DType::F32,
        )?;

        info!("building the VAE");
        let vae_weights = source.get(ModelComponent::Vae, use_f16)?;
        let vae = sd_config.build_vae(vae_weights, device, dtype)?;

        info!("building the UNet");
        let unet_weights = source.get(ModelComponent::Unet, use_f16)?;
        let unet =
            sd_config.build_unet(unet_weights, device, params.latent_channels, false, dtype)?;

        Ok(Self {
            tokenizer,
            text_model,
            unet,
            vae,
            scheduler_config,
            sd_config,
            version,
            device: device.clone(),
            dtype,
        })
    }

    /// Draw a starting latent tensor for `batch_size` samples.
    pub fn starting_latents(
        &self,
        batch_size: usize,
        params: &GenerationParams,
    ) -> Result<Tensor> {
        let latents = Tensor::randn(0f32, 1f32, params.latent_shape(batch_size), &self.device)?;
        Ok(latents)
    }

    /// Generate one decoded image batch for one prompt batch.
    ///
    /// Returns a `[B, 3, H, W]` f32 tensor in `[0, 1]` on the CPU. When
    /// `start_code` is given it is used as the starting latents instead of
    /// fresh noise.
    pub fn forward(
        &self,
        prompts: &[String],
        params: &GenerationParams,
        start_code: Option<&Tensor>,
    ) -> Result<Tensor> {
        params.validate()?;
        if prompts.is_empty() {
            return Err(Error::EmptyPrompts.into());
        }
        let batch_size = prompts.len();

        let mut scheduler = self.scheduler_config.build(params.num_steps)?;
        let use_guidance = params.guidance_scale > 1.0;

        let cond = self.encode_prompts(prompts)?;
        let text_embeddings = if use_guidance {
            let uncond = self.encode_prompts(&vec![String::new(); batch_size])?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;

        let latents = match start_code {
            Some(code) => code.clone(),
            None => {
                let noise = self.starting_latents(batch_size, params)?;
                // scale the initial noise by the standard deviation required
                // by the scheduler
                (noise * scheduler.init_noise_sigma())?
            }
        };
        let latents = latents.to_dtype(self.dtype)?;

        let latents = sampling::denoise(
            scheduler.as_mut(),
            latents,
            params.guidance_scale,
            |input, timestep| self.unet.forward(input, timestep as f64, &text_embeddings),
        )?;

        let images = self.vae.decode(&(latents / self.version.vae_scale())?)?;
        let images = ((images / 2.)? + 0.5)?;
        Ok(images
            .clamp(0f32, 1f32)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?)
    }

    /// Tokenize and embed one batch of prompts with the text encoder.
    fn encode_prompts(&self, prompts: &[String]) -> Result<Tensor> {
        let vocab = self.tokenizer.get_vocab(true);
        let pad_id = match &self.sd_config.clip.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .context("tokenizer is missing the configured padding token")?,
            None => *vocab
                .get("<|endoftext|>")
                .context("tokenizer is missing <|endoftext|>")?,
        };
        let max_len = self.sd_config.clip.max_position_embeddings;

        let mut tokens = Vec::new();
        for prompt in prompts {
            let mut ids = self
                .tokenizer
                .encode(prompt.as_str(), true)
                .map_err(E::msg)?
                .get_ids()
                .to_vec();
            if ids.len() > max_len {
                return Err(Error::PromptTooLong {
                    len: ids.len(),
                    max: max_len,
                }
                .into());
            }
            ids.resize(max_len, pad_id);
            tokens.push(ids);
        }
        let tokens = Tensor::new(tokens, &self.device)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        GenerationParams::default().validate().unwrap();
    }

    #[test]
    fn dimensions_must_divide_by_downsampling_factor() {
        let params = GenerationParams {
            width: 513,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(Error::InvalidOption { name: "width", .. })
        ));
    }

    #[test]
    fn zero_valued_counts_are_rejected() {
        for params in [
            GenerationParams {
                num_steps: 0,
                ..Default::default()
            },
            GenerationParams {
                latent_channels: 0,
                ..Default::default()
            },
            GenerationParams {
                downsample_factor: 0,
                ..Default::default()
            },
            GenerationParams {
                height: 0,
                ..Default::default()
            },
        ] {
            assert!(params.validate().is_err());
        }
    }

    #[test]
    fn latent_shape_downsamples_spatial_dims() {
        let params = GenerationParams {
            height: 768,
            width: 512,
            ..Default::default()
        };
        assert_eq!(params.latent_shape(3), (3, 4, 96, 64));
    }
}
