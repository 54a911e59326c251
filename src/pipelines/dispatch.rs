//! Pipeline selection from a model directory.

use std::path::Path;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::models::loader::{load_components, ModelComponents, ModelIndex, PipelineKind};
use crate::tensor::Tensor;

use super::base::PipelineBase;
use super::controlnet::ControlNetPipeline;
use super::input::GenerationInput;
use super::lcm::LatentConsistencyPipeline;
use super::progress::{ProgressPayload, ProgressStatus};
use super::sd_turbo::SdTurboPipeline;
use super::stable_diffusion::StableDiffusionPipeline;

/// Any loaded pipeline variant.
pub enum DiffusionPipeline {
    StableDiffusion(StableDiffusionPipeline),
    ControlNet(ControlNetPipeline),
    SdTurbo(SdTurboPipeline),
    LatentConsistency(LatentConsistencyPipeline),
}

impl DiffusionPipeline {
    /// Loads the variant named by the directory's `model_index.json`.
    pub fn from_pretrained(model_dir: &Path, config: &RuntimeConfig) -> Result<Self> {
        Self::from_pretrained_with_progress(model_dir, config, &mut |_| {})
    }

    pub fn from_pretrained_with_progress(
        model_dir: &Path,
        config: &RuntimeConfig,
        on_progress: &mut dyn FnMut(&ProgressPayload),
    ) -> Result<Self> {
        let kind = ModelIndex::from_dir(model_dir)?.pipeline_kind()?;
        tracing::info!(kind = %kind, dir = %model_dir.display(), "Selected pipeline");

        let components = load_components(model_dir, kind, config)?;
        let pipeline = Self::from_components(kind, components)?;
        on_progress(&ProgressPayload::status(ProgressStatus::Ready));
        Ok(pipeline)
    }

    pub fn from_components(kind: PipelineKind, components: ModelComponents) -> Result<Self> {
        Ok(match kind {
            PipelineKind::StableDiffusion => {
                Self::StableDiffusion(StableDiffusionPipeline::from_components(components)?)
            }
            PipelineKind::ControlNet => {
                Self::ControlNet(ControlNetPipeline::from_components(components)?)
            }
            PipelineKind::SdTurbo => Self::SdTurbo(SdTurboPipeline::from_components(components)?),
            PipelineKind::LatentConsistency => {
                Self::LatentConsistency(LatentConsistencyPipeline::from_components(components)?)
            }
        })
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::StableDiffusion(_) => PipelineKind::StableDiffusion,
            Self::ControlNet(_) => PipelineKind::ControlNet,
            Self::SdTurbo(_) => PipelineKind::SdTurbo,
            Self::LatentConsistency(_) => PipelineKind::LatentConsistency,
        }
    }

    pub fn base(&self) -> &PipelineBase {
        match self {
            Self::StableDiffusion(p) => p.base(),
            Self::ControlNet(p) => p.base(),
            Self::SdTurbo(p) => p.base(),
            Self::LatentConsistency(p) => p.base(),
        }
    }

    pub fn run(&mut self, input: &GenerationInput) -> Result<Vec<Tensor>> {
        self.run_with_progress(input, &mut |_| {})
    }

    pub fn run_with_progress(
        &mut self,
        input: &GenerationInput,
        on_progress: &mut dyn FnMut(&ProgressPayload),
    ) -> Result<Vec<Tensor>> {
        match self {
            Self::StableDiffusion(p) => p.run_with_progress(input, on_progress),
            Self::ControlNet(p) => p.run_with_progress(input, on_progress),
            Self::SdTurbo(p) => p.run_with_progress(input, on_progress),
            Self::LatentConsistency(p) => p.run_with_progress(input, on_progress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::pipelines::testing::{mock_components, MockSetup};
    use crate::schedulers::SchedulerKind;

    fn small(prompt: &str) -> GenerationInput {
        GenerationInput {
            width: Some(16),
            height: Some(16),
            seed: "dispatch".to_string(),
            num_inference_steps: Some(2),
            ..GenerationInput::new(prompt)
        }
    }

    #[test]
    fn each_kind_gets_its_scheduler() {
        for kind in [
            PipelineKind::StableDiffusion,
            PipelineKind::SdTurbo,
            PipelineKind::LatentConsistency,
            PipelineKind::ControlNet,
        ] {
            let setup = MockSetup::new(SchedulerKind::Pndm);
            let components = mock_components(&setup, kind == PipelineKind::ControlNet);
            let pipeline = DiffusionPipeline::from_components(kind, components).unwrap();
            assert_eq!(pipeline.kind(), kind);
            assert_eq!(pipeline.base().scheduler.kind(), kind.scheduler_kind());
        }
    }

    #[test]
    fn controlnet_without_session_fails() {
        let setup = MockSetup::new(SchedulerKind::Pndm);
        let err = DiffusionPipeline::from_components(
            PipelineKind::ControlNet,
            mock_components(&setup, false),
        )
        .err()
        .unwrap();
        assert_eq!(err.code, ErrorCode::ModelNotFound);
    }

    #[test]
    fn run_dispatches_to_variant() {
        let setup = MockSetup::new(SchedulerKind::Pndm);
        let mut pipeline =
            DiffusionPipeline::from_components(PipelineKind::SdTurbo, mock_components(&setup, false))
                .unwrap();
        let images = pipeline.run(&small("a lantern")).unwrap();
        assert_eq!(images[0].shape(), &[1, 3, 16, 16]);
        assert_eq!(setup.unet_calls().len(), 2);
    }

    #[test]
    fn missing_model_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DiffusionPipeline::from_pretrained(dir.path(), &RuntimeConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::ModelNotFound);
    }

    #[test]
    fn unknown_pipeline_class_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("model_index.json"),
            r#"{"_class_name": "StableDiffusionXLPipeline"}"#,
        )
        .unwrap();
        let err = DiffusionPipeline::from_pretrained(dir.path(), &RuntimeConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }
}
