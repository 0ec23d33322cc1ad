use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig, euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::SchedulerConfig, uni_pc::UniPCSchedulerConfig,
};

/// The external sampling algorithm driving the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SamplerKind {
    /// Denoising diffusion implicit models.
    Ddim,
    /// Ancestral sampling with Euler method steps.
    EulerAncestral,
    /// UniPC multistep predictor-corrector.
    UniPc,
}

impl SamplerKind {
    /// The scheduler configuration backing this sampler. `ddim_eta` only
    /// affects the DDIM sampler.
    pub fn scheduler_config(&self, ddim_eta: f64) -> Box<dyn SchedulerConfig> {
        match self {
            Self::Ddim => Box::new(DDIMSchedulerConfig {
                eta: ddim_eta,
                ..Default::default()
            }),
            Self::EulerAncestral => Box::new(EulerAncestralDiscreteSchedulerConfig::default()),
            Self::UniPc => Box::new(UniPCSchedulerConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_sampler_builds_a_scheduler() {
        for kind in [SamplerKind::Ddim, SamplerKind::EulerAncestral, SamplerKind::UniPc] {
            let scheduler = kind.scheduler_config(0.0).build(10).unwrap();
            assert!(!scheduler.timesteps().is_empty());
        }
    }

    #[test]
    fn ddim_respects_requested_step_count() {
        let scheduler = SamplerKind::Ddim.scheduler_config(0.0).build(10).unwrap();
        assert_eq!(scheduler.timesteps().len(), 10);
    }

    #[test]
    fn ddim_timesteps_are_strictly_decreasing() {
        let scheduler = SamplerKind::Ddim.scheduler_config(0.0).build(25).unwrap();
        let timesteps = scheduler.timesteps();
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
    }
}
