use candle_core::{Result, Tensor};
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;

use crate::util::NiceProgressBar;

/// Run the denoising loop over `latents`.
///
/// `unet_eval` evaluates the noise predictor for one scheduler timestep; with
/// classifier-free guidance active (`guidance_scale > 1`) it receives the
/// doubled batch and its prediction halves are recombined here.
pub(crate) fn denoise(
    scheduler: &mut dyn Scheduler,
    latents: Tensor,
    guidance_scale: f64,
    unet_eval: impl Fn(&Tensor, usize) -> Result<Tensor>,
) -> Result<Tensor> {
    let use_guidance = guidance_scale > 1.0;
    let timesteps = scheduler.timesteps().to_vec();
    let mut latents = latents;
    for timestep in NiceProgressBar::new(timesteps.into_iter(), "denoising") {
        let latent_model_input = if use_guidance {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;

        let noise_pred = unet_eval(&latent_model_input, timestep)?;
        let noise_pred = if use_guidance {
            let halves = noise_pred.chunk(2, 0)?;
            let (uncond, text) = (&halves[0], &halves[1]);
            (uncond + ((text - uncond)? * guidance_scale)?)?
        } else {
            noise_pred
        };

        latents = scheduler.step(&noise_pred, timestep, &latents)?;
    }
    Ok(latents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Identity scheduler: `step` subtracts the prediction outright.
    struct TestScheduler {
        timesteps: Vec<usize>,
    }

    impl Scheduler for TestScheduler {
        fn timesteps(&self) -> &[usize] {
            &self.timesteps
        }

        fn add_noise(&self, original: &Tensor, _noise: Tensor, _timestep: usize) -> Result<Tensor> {
            Ok(original.clone())
        }

        fn init_noise_sigma(&self) -> f64 {
            1.0
        }

        fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
            Ok(sample)
        }

        fn step(&mut self, model_output: &Tensor, _timestep: usize, sample: &Tensor) -> Result<Tensor> {
            sample - model_output
        }
    }

    #[test]
    fn denoise_without_guidance_keeps_batch_size() {
        let device = Device::Cpu;
        let mut scheduler = TestScheduler {
            timesteps: vec![3, 2, 1],
        };
        let latents = Tensor::full(1f32, (2, 4, 2, 2), &device).unwrap();
        let out = denoise(&mut scheduler, latents, 1.0, |input, _t| {
            assert_eq!(input.dim(0).unwrap(), 2);
            input.affine(0.5, 0.)
        })
        .unwrap();
        assert_eq!(out.dims(), &[2, 4, 2, 2]);
        // three halving steps: 1 -> 0.5 -> 0.25 -> 0.125
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 0.125).abs() < 1e-6));
    }

    #[test]
    fn denoise_with_guidance_doubles_the_unet_batch() {
        let device = Device::Cpu;
        let mut scheduler = TestScheduler {
            timesteps: vec![1],
        };
        let latents = Tensor::full(1f32, (2, 4, 2, 2), &device).unwrap();
        let out = denoise(&mut scheduler, latents, 7.5, |input, _t| {
            assert_eq!(input.dim(0).unwrap(), 4);
            Tensor::zeros_like(input)
        })
        .unwrap();
        // zero prediction leaves the latents untouched
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }
}
