use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueEnum};
use rand::Rng;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use txt2img_core::{
    images, output::OutputLayout, postprocess, prompts, watermark, ClipSafetyChecker,
    GenerationParams, ModelConfig, ModelSource, Pipeline, SafetyFilter, SamplerKind, SdVersion,
    Watermarker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Precision {
    /// 32-bit floats everywhere.
    Full,
    /// 16-bit floats for the UNet and VAE.
    Half,
}

impl Precision {
    fn dtype(self) -> DType {
        match self {
            Self::Full => DType::F32,
            Self::Half => DType::F16,
        }
    }
}

#[derive(Parser)]
#[command(version, about = "Text-to-image generation with latent diffusion models")]
struct Args {
    /// The prompt to render.
    #[arg(long, default_value = "a painting of a virus monster playing guitar")]
    prompt: String,

    /// Directory to write results to.
    #[arg(long, default_value = "outputs/txt2img-samples")]
    outdir: PathBuf,

    /// Do not save a grid, only individual samples.
    #[arg(long)]
    skip_grid: bool,

    /// Do not save individual samples. For speed measurements.
    #[arg(long)]
    skip_save: bool,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 50)]
    steps: usize,

    /// Sampling algorithm.
    #[arg(long, value_enum, default_value = "ddim")]
    sampler: SamplerKind,

    /// DDIM eta (eta=0.0 corresponds to deterministic sampling).
    #[arg(long, default_value_t = 0.0)]
    ddim_eta: f64,

    /// Reuse the same starting latents for every batch.
    #[arg(long)]
    fixed_code: bool,

    /// Sample this often.
    #[arg(long, default_value_t = 2)]
    n_iter: usize,

    /// Image height, in pixel space.
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Image width, in pixel space.
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Latent channels.
    #[arg(long, default_value_t = 4)]
    latent_channels: usize,

    /// Downsampling factor between pixel space and latent space.
    #[arg(long, default_value_t = 8)]
    downsample_factor: usize,

    /// How many samples to produce for each given prompt. A.k.a. batch size.
    #[arg(long, default_value_t = 3)]
    n_samples: usize,

    /// Images per grid row (default: n_samples).
    #[arg(long, default_value_t = 0)]
    n_rows: usize,

    /// Unconditional guidance scale.
    #[arg(long, default_value_t = 7.5)]
    scale: f64,

    /// If specified, load prompts from this file, one per line.
    #[arg(long, value_name = "FILE")]
    from_file: Option<PathBuf>,

    /// Model config file naming the version and local component weights.
    #[arg(long, value_name = "FILE")]
    model_config: Option<PathBuf>,

    /// Model version used for components not named in the config.
    #[arg(long, value_enum, default_value = "v1-5")]
    sd_version: SdVersion,

    /// The tokenizer definition, in tokenizer.json format.
    #[arg(long, value_name = "FILE")]
    tokenizer: Option<PathBuf>,

    /// The CLIP weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    clip_weights: Option<PathBuf>,

    /// The UNet weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    unet_weights: Option<PathBuf>,

    /// The VAE weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    vae_weights: Option<PathBuf>,

    /// The seed for reproducible sampling; random when unset.
    #[arg(long)]
    seed: Option<u64>,

    /// Evaluate at this precision.
    #[arg(long, value_enum, default_value = "full")]
    precision: Precision,

    /// Screen decoded images and replace flagged ones with the placeholder.
    #[arg(long)]
    nsfw_protection: bool,

    /// Placeholder image substituted for flagged samples.
    #[arg(long, value_name = "FILE", default_value = "assets/placeholder.png")]
    placeholder: PathBuf,

    /// Local safety-checker weights, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    safety_model: Option<PathBuf>,

    /// Local safety-checker tokenizer, in tokenizer.json format.
    #[arg(long, value_name = "FILE")]
    safety_tokenizer: Option<PathBuf>,

    /// Embed an invisible provenance watermark into saved images.
    #[arg(long)]
    watermark_protection: bool,

    /// Upscaling factor for the resized output.
    #[arg(long, default_value_t = 2)]
    resize_factor: u32,

    /// Run on CPU rather than on an accelerator.
    #[arg(long)]
    cpu: bool,
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        Ok(Device::new_metal(0)?)
    }
    #[cfg(not(feature = "metal"))]
    {
        Ok(Device::cuda_if_available(0)?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(args)
}

fn run(args: Args) -> Result<()> {
    let params = GenerationParams {
        height: args.height,
        width: args.width,
        num_steps: args.steps,
        guidance_scale: args.scale,
        latent_channels: args.latent_channels,
        downsample_factor: args.downsample_factor,
    };
    params.validate()?;
    if args.resize_factor == 0 {
        anyhow::bail!("resize factor must be nonzero");
    }

    let device = device(args.cpu)?;
    let dtype = args.precision.dtype();

    let seed = args
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..u64::MAX));
    info!("using seed {seed}");
    device.set_seed(seed)?;

    let batches = match &args.from_file {
        Some(path) => {
            info!("reading prompts from {}", path.display());
            prompts::batches_from_file(path, args.n_samples)?
        }
        None => prompts::batches_from_prompt(&args.prompt, args.n_samples)?,
    };

    let model_config = args
        .model_config
        .as_deref()
        .map(ModelConfig::load)
        .transpose()?;
    let source = ModelSource::resolve(
        args.sd_version,
        model_config,
        args.tokenizer.clone(),
        args.clip_weights.clone(),
        args.unet_weights.clone(),
        args.vae_weights.clone(),
    );

    info!("loading the {:?} pipeline", source.version);
    let pipeline = Pipeline::load(
        &source,
        args.sampler.scheduler_config(args.ddim_eta),
        &device,
        dtype,
        &params,
    )?;

    let safety = if args.nsfw_protection {
        let checker =
            ClipSafetyChecker::load(args.safety_model.clone(), args.safety_tokenizer.clone(), &device)?;
        SafetyFilter::new(Box::new(checker), &args.placeholder)
    } else {
        SafetyFilter::disabled()
    };

    let watermarker = if args.watermark_protection {
        info!("embedding an invisible watermark into saved images");
        Watermarker::new(watermark::DEFAULT_PAYLOAD)
    } else {
        Watermarker::disabled()
    };

    let layout = OutputLayout::create(&args.outdir)?;
    let mut sample_index = layout.next_sample_index()?;
    let grid_index = layout.next_grid_index()?;

    let start_code: Option<Tensor> = if args.fixed_code {
        Some(pipeline.starting_latents(args.n_samples, &params)?)
    } else {
        None
    };

    let per_row = if args.n_rows > 0 {
        args.n_rows
    } else {
        args.n_samples
    };
    let mut all_samples: Vec<image::RgbImage> = Vec::new();
    let started = Instant::now();

    for iteration in 0..args.n_iter {
        info!("sampling iteration {}/{}", iteration + 1, args.n_iter);
        for batch in &batches {
            let code = start_code
                .as_ref()
                .map(|code| code.narrow(0, 0, batch.len()))
                .transpose()?;
            let decoded = pipeline.forward(batch, &params, code.as_ref())?;

            let (screened, verdict) = safety.screen(decoded)?;
            if verdict.any_flagged() {
                info!("substituted flagged samples with the placeholder");
            }
            let batch_images = images::tensor_to_images(&screened)?;

            if !args.skip_save {
                for img in &batch_images {
                    let img = watermarker.apply(img.clone())?;
                    let original = layout.original_path(sample_index);
                    img.save(&original)?;
                    let resized = layout.resized_path(sample_index);
                    postprocess::resize_image(
                        &original,
                        &resized,
                        args.width as u32,
                        args.height as u32,
                        args.resize_factor,
                    )?;
                    postprocess::improve_image(&resized, &layout.improved_path(sample_index))?;
                    sample_index += 1;
                }
            }
            if !args.skip_grid {
                all_samples.extend(batch_images);
            }
        }
    }

    if !args.skip_grid && !all_samples.is_empty() {
        let grid = images::make_grid(&all_samples, per_row, 2)?;
        let grid = watermarker.apply(grid)?;
        let grid_file = layout.grid_path(grid_index);
        grid.save(&grid_file)?;
        info!("saved grid to {}", grid_file.display());
    }

    println!(
        "Sampling took {:.2}s",
        started.elapsed().as_secs_f32()
    );
    println!(
        "Your samples are ready and waiting for you here:\n{}",
        layout.root().display()
    );
    Ok(())
}
