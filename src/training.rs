use std::{fs, path::Path};

use anyhow::{Context, Result};
use burn::{
    config::Config,
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};

use crate::{
    checkpoint::CheckpointKeeper,
    config::Paths,
    data::{load_labeled_dir, PlateBatcher, TripletSampler},
    loss::TripletLossConfig,
    metrics::Metrics,
    model::{ModelConfig, MODEL_NAME},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: AdamConfig,

    #[config(default = 10_000)]
    pub iters: usize,

    #[config(default = 4)]
    pub classes_per_batch: usize,

    #[config(default = 4)]
    pub samples_per_class: usize,

    #[config(default = 16)]
    pub eval_batch_size: usize,

    #[config(default = 5)]
    pub eval_every: usize,

    #[config(default = 100)]
    pub loss_window: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-4)]
    pub learning_rate: f64,

    #[config(default = 1.0)]
    pub margin: f32,
}

/// Mean of the trailing `window` values, or of all values when fewer are
/// present.
pub fn rolling_mean(values: &[f32], window: usize) -> f32 {
    let tail = &values[values.len().saturating_sub(window)..];
    tail.iter().sum::<f32>() / tail.len() as f32
}

/// In-memory history of evaluation events. The log file is rewritten in full
/// from this history on every evaluation step.
#[derive(Default)]
pub struct RunLog {
    entries: Vec<(f32, f64, f64)>,
}

impl RunLog {
    pub fn push(&mut self, avg_loss: f32, mae_val: f64, best_mae: f64) {
        self.entries.push((avg_loss, mae_val, best_mae));
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut contents = String::new();
        for (avg_loss, mae_val, best_mae) in &self.entries {
            contents.push_str(&format!("{avg_loss}; {mae_val}; {best_mae}\n"));
        }
        fs::write(path, contents)
            .with_context(|| format!("cannot write log file '{}'", path.display()))
    }
}

/// Runs exactly `config.iters` optimization steps. Every `eval_every`-th step
/// (step 0 excluded) the validation MAE is computed; on improvement the
/// previous checkpoint is replaced and the run log rewritten. Any failure
/// aborts the run, there is no retry and no resumption.
pub fn train<B: AutodiffBackend>(
    paths: &Paths,
    image_size: u32,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    fs::create_dir_all(paths.logs_dir())
        .with_context(|| format!("cannot create '{}'", paths.logs_dir().display()))?;
    config
        .save(paths.output_dir.join("config.json"))
        .context("cannot save training config")?;

    B::seed(config.seed);

    let plates = load_labeled_dir(&paths.train_dir, image_size)?;
    let mut sampler = TripletSampler::new(
        plates,
        config.classes_per_batch,
        config.samples_per_class,
        config.seed,
    )?;

    let metrics = Metrics::<B::InnerBackend>::new(
        &paths.val_dir,
        image_size,
        config.eval_batch_size,
        device.clone(),
        paths.visualizations_dir(),
    )?;

    let batcher = PlateBatcher::<B>::new(device.clone(), image_size);
    let mut model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init();
    let loss_fn = TripletLossConfig::new().with_margin(config.margin).init();

    let base_file_name = format!("{MODEL_NAME}_{image_size}");
    let keeper = CheckpointKeeper::new(paths.models_dir(), base_file_name.clone())?;
    let log_path = paths.logs_dir().join(format!("{base_file_name}.txt"));

    tracing::info!(
        "training settings: input size {image_size}, network {MODEL_NAME}, batch size {}",
        sampler.batch_size()
    );

    let mut losses: Vec<f32> = Vec::with_capacity(config.iters);
    let mut run_log = RunLog::default();
    let mut best_mae: Option<f64> = None;

    for i in 0..config.iters {
        let batch = batcher.batch(sampler.next_batch());

        let embeddings = model.forward(batch.images);
        let loss = loss_fn.forward(embeddings, batch.targets);
        losses.push(loss.clone().into_scalar().elem::<f32>());

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(config.learning_rate, model, grads);

        if i % config.eval_every == 0 && i != 0 {
            let avg_loss = rolling_mean(&losses, config.loss_window);
            let mae_val = metrics.compute(&model.valid(), false)?;
            tracing::info!("iter {i}: avg train loss {avg_loss}, validation mae {mae_val}");

            if best_mae.map_or(true, |best| mae_val < best) {
                best_mae = Some(mae_val);
                let snapshot = model.clone();
                let saved = keeper.replace(mae_val, move |path| {
                    snapshot
                        .save_file(path, &CompactRecorder::new())
                        .with_context(|| format!("cannot save model to '{}'", path.display()))
                })?;
                tracing::info!("new best mae {mae_val}, saved '{}'", saved.display());
            }

            run_log.push(avg_loss, mae_val, best_mae.unwrap_or(mae_val));
            run_log.write(&log_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_uses_all_values_when_short_of_window() {
        assert_eq!(rolling_mean(&[1.0, 1.0, 1.0, 1.0, 1.0], 100), 1.0);
        assert_eq!(rolling_mean(&[1.0, 2.0, 3.0], 100), 2.0);
    }

    #[test]
    fn rolling_mean_only_looks_at_the_window_tail() {
        let mut values = vec![100.0; 50];
        values.extend(std::iter::repeat(2.0).take(100));
        assert_eq!(rolling_mean(&values, 100), 2.0);
    }

    #[test]
    fn run_log_rewrites_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embednet_224.txt");

        let mut log = RunLog::default();
        log.push(0.5, 4.0, 4.0);
        log.write(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0.5; 4; 4\n");

        log.push(0.25, 3.5, 3.5);
        log.write(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "0.5; 4; 4\n0.25; 3.5; 3.5\n"
        );
    }

    #[test]
    fn training_config_defaults_match_the_run_policy() {
        let config = TrainingConfig::new(ModelConfig::new(128), AdamConfig::new());
        assert_eq!(config.iters, 10_000);
        assert_eq!(config.eval_every, 5);
        assert_eq!(config.loss_window, 100);
        assert_eq!(config.classes_per_batch * config.samples_per_class, 16);
    }
}
