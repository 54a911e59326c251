//! diffusers-ort: one-shot image generation from an ONNX diffusers export.

use std::time::Instant;

use tracing::Level;

use diffusers_ort::cli::Cli;
use diffusers_ort::config::RuntimeConfig;
use diffusers_ort::error::{DiffusionError, Result};
use diffusers_ort::imageio::{load_image, save_image, ImageRange};
use diffusers_ort::models::PipelineKind;
use diffusers_ort::pipelines::{DiffusionPipeline, GenerationInput, ProgressPayload, ProgressStatus};

fn main() {
    let cli = Cli::parse_args();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).compact().init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = RuntimeConfig::from_env();
    cli.apply_to(&mut config);
    if let Some(reason) = config.validate() {
        return Err(DiffusionError::invalid_config(reason));
    }

    let model_dir = config.effective_model_path();
    eprintln!("=== diffusers-ort ===");
    eprintln!("Prompt: \"{}\"", cli.prompt);
    eprintln!("Model directory: {}", model_dir.display());
    eprintln!("Device: {}", config.device);
    eprintln!("Output: {}", cli.output.display());
    eprintln!();

    let load_start = Instant::now();
    let mut pipeline = DiffusionPipeline::from_pretrained_with_progress(
        &model_dir,
        &config,
        &mut |p| tracing::info!(status = %p.status, "Pipeline progress"),
    )?;
    eprintln!(
        "Loaded {} pipeline in {:.1}s",
        pipeline.kind(),
        load_start.elapsed().as_secs_f32()
    );

    let input = build_input(cli, &config, pipeline.kind())?;

    let start = Instant::now();
    let mut preview_error = None;
    let mut on_progress = |p: &ProgressPayload| match p.status {
        ProgressStatus::RunningUnet => {
            if let (Some(step), Some(total)) = (p.step, p.total_steps) {
                eprint!("\rStep {}/{}", step, total);
            }
        }
        ProgressStatus::RunningVae => {
            if let (Some(step), Some(images)) = (p.step, p.images.as_ref()) {
                if let Some(image) = images.first() {
                    if let Err(e) = save_image(image, &cli.preview_path(step)) {
                        preview_error.get_or_insert(e);
                    }
                }
            }
        }
        ProgressStatus::Done => eprintln!(),
        _ => tracing::info!(status = %p.status, "Pipeline progress"),
    };
    let images = pipeline.run_with_progress(&input, &mut on_progress)?;

    if let Some(e) = preview_error {
        tracing::warn!(error = %e, "Failed to write a preview image");
    }

    let image = images
        .first()
        .ok_or_else(|| DiffusionError::inference_failed("Pipeline returned no images"))?;
    save_image(image, &cli.output)?;

    eprintln!(
        "Generated {} in {:.1}s",
        cli.output.display(),
        start.elapsed().as_secs_f32()
    );
    Ok(())
}

/// Merges command-line values with the configured defaults.
///
/// LCM keeps its own size default (UNet sample size times the VAE factor)
/// unless a size is given explicitly.
fn build_input(cli: &Cli, config: &RuntimeConfig, kind: PipelineKind) -> Result<GenerationInput> {
    let defaults = &config.defaults;
    let (width, height) = match (cli.width, cli.height, kind) {
        (None, None, PipelineKind::LatentConsistency) => (None, None),
        (w, h, _) => (
            Some(w.unwrap_or(defaults.width)),
            Some(h.unwrap_or(defaults.height)),
        ),
    };

    let mut input = GenerationInput {
        negative_prompt: cli.negative_prompt.clone(),
        guidance_scale: cli.guidance.or(defaults.guidance_scale),
        seed: cli.seed.clone(),
        width,
        height,
        num_inference_steps: cli.steps.map(|s| s as usize).or(defaults.steps),
        sd_v1: cli.sd_v1,
        run_vae_on_each_step: cli.preview,
        strength: Some(cli.strength.unwrap_or(defaults.strength)),
        conditioning_scale: cli.conditioning_scale,
        ..GenerationInput::new(cli.prompt.clone())
    };

    if cli.init_image.is_some() || cli.control_image.is_some() {
        let (w, h) = match (input.width, input.height) {
            (Some(w), Some(h)) => (w, h),
            _ => (defaults.width, defaults.height),
        };
        input.width = Some(w);
        input.height = Some(h);

        if let Some(ref path) = cli.init_image {
            input.init_image = Some(load_image(path, w, h, ImageRange::MinusOneToOne)?);
        }
        if let Some(ref path) = cli.control_image {
            input.control_image = Some(load_image(path, w, h, ImageRange::ZeroToOne)?);
        }
    }

    input.validate()?;
    Ok(input)
}
