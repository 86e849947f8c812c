use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    module::Module,
    optim::AdamConfig,
    record::CompactRecorder,
};
use clap::{Args, Parser, Subcommand};

use config::{parse_image_size, Paths};
use metrics::Metrics;
use model::{EmbeddingNet, ModelConfig};
use training::TrainingConfig;

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod module;
pub mod training;

const EMBEDDING_DIM: usize = 128;
const EVAL_BATCH_SIZE: usize = 16;

type Backend = Wgpu<f32, i32>;
type AutodiffBackend = Autodiff<Backend>;

#[derive(Parser)]
#[command(
    name = "platematch",
    about = "Match photographs to atlas plates with a triplet-loss embedding network"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the embedding network with triplet semi-hard loss
    Train {
        /// The size of images (224 or 1024)
        image_size: String,

        /// Number of iterations to train for
        #[arg(long, default_value_t = 10_000)]
        iters: usize,

        #[command(flatten)]
        paths: PathArgs,
    },

    /// Evaluate trained weights on the test dataset
    Evaluate {
        /// The size of images (224 or 1024)
        image_size: String,

        /// Path to model weights
        weights: PathBuf,

        /// Visualize predicted atlas plates
        #[arg(short, long)]
        visualize: bool,

        #[command(flatten)]
        paths: PathArgs,
    },

    /// Predict the atlas plate for an image
    Predict {
        /// The image to predict the atlas plate for
        image: PathBuf,

        /// The size of images (224 or 1024)
        image_size: String,

        /// Path to model weights
        weights: PathBuf,

        #[command(flatten)]
        paths: PathArgs,
    },
}

#[derive(Args)]
struct PathArgs {
    /// Training images, one subdirectory per plate index
    #[arg(long, default_value = "data/train")]
    train_dir: PathBuf,

    /// Validation split with plates/ and queries/ subdirectories
    #[arg(long, default_value = "data/val")]
    val_dir: PathBuf,

    /// Test split with plates/ and queries/ subdirectories
    #[arg(long, default_value = "data/test")]
    test_dir: PathBuf,

    /// Where logs, models and visualizations are written
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
}

impl From<PathArgs> for Paths {
    fn from(args: PathArgs) -> Self {
        Paths {
            train_dir: args.train_dir,
            val_dir: args.val_dir,
            test_dir: args.test_dir,
            output_dir: args.output_dir,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("platematch=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Commands::Train {
            image_size,
            iters,
            paths,
        } => cmd_train(&image_size, iters, paths.into()),
        Commands::Evaluate {
            image_size,
            weights,
            visualize,
            paths,
        } => cmd_evaluate(&image_size, &weights, visualize, paths.into()),
        Commands::Predict {
            image,
            image_size,
            weights,
            paths,
        } => cmd_predict(&image, &image_size, &weights, paths.into()),
    }
}

fn cmd_train(raw_size: &str, iters: usize, paths: Paths) -> Result<()> {
    let image_size = parse_image_size(raw_size)?;
    let device = WgpuDevice::default();

    let config = TrainingConfig::new(ModelConfig::new(EMBEDDING_DIM), AdamConfig::new())
        .with_iters(iters);

    training::train::<AutodiffBackend>(&paths, image_size, config, device)
}

fn cmd_evaluate(raw_size: &str, weights: &Path, visualize: bool, paths: Paths) -> Result<()> {
    let image_size = parse_image_size(raw_size)?;
    let device = WgpuDevice::default();

    let model = load_model(weights, &device)?;
    let metrics = Metrics::<Backend>::new(
        &paths.test_dir,
        image_size,
        EVAL_BATCH_SIZE,
        device,
        paths.visualizations_dir(),
    )?;

    let mae = metrics.compute(&model, visualize)?;
    println!("mae: {mae}");

    Ok(())
}

fn cmd_predict(image: &Path, raw_size: &str, weights: &Path, paths: Paths) -> Result<()> {
    let image_size = parse_image_size(raw_size)?;
    let device = WgpuDevice::default();

    let model = load_model(weights, &device)?;
    let metrics = Metrics::<Backend>::new(
        &paths.test_dir,
        image_size,
        EVAL_BATCH_SIZE,
        device,
        paths.visualizations_dir(),
    )?;

    let prediction = metrics.predict(&model, image)?;
    println!("{prediction}");

    Ok(())
}

fn load_model(weights: &Path, device: &WgpuDevice) -> Result<EmbeddingNet<Backend>> {
    // The recorder appends its own extension, so accept both the bare path
    // and the .mpk file name it produced.
    let path = if weights.extension().map_or(false, |ext| ext == "mpk") {
        weights.with_extension("")
    } else {
        weights.to_path_buf()
    };

    ModelConfig::new(EMBEDDING_DIM)
        .init::<Backend>(device)
        .load_file(path, &CompactRecorder::new(), device)
        .with_context(|| format!("cannot load model weights '{}'", weights.display()))
}
