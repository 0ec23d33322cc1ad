use std::time::Instant;

use candle_core::{DType, Device};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use txt2img_core::{images, GenerationParams, ModelSource, Pipeline, SamplerKind, SdVersion};

#[derive(Parser)]
struct Args {
    /// Prompt to use
    #[arg(short, long)]
    prompt: String,

    /// Which model version to use
    #[arg(long, value_enum, default_value = "v1-5")]
    version: SdVersion,

    /// Number of denoising steps
    #[arg(short, long, default_value_t = 30)]
    num_steps: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device = Device::cuda_if_available(0)?;
    let params = GenerationParams {
        num_steps: args.num_steps,
        ..Default::default()
    };
    let pipeline = Pipeline::load(
        &ModelSource::for_version(args.version),
        SamplerKind::Ddim.scheduler_config(0.0),
        &device,
        DType::F32,
        &params,
    )?;

    let start = Instant::now();

    let decoded = pipeline.forward(&[args.prompt], &params, None)?;

    let end = Instant::now();
    println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());

    let image = images::tensor_to_images(&decoded)?.remove(0);
    image.save("image.png")?;

    Ok(())
}
