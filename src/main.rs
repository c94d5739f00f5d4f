use std::path::PathBuf;

use anyhow::Result;
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::{decay::WeightDecayConfig, AdamConfig},
};
use clap::Parser;
use landseg::{
    data::CLASS_COUNT,
    model::ModelConfig,
    training::{train, TrainingConfig},
};

#[derive(Parser, Debug)]
#[command(
    name = "landseg",
    about = "Semantic segmentation training for aerial land-cover imagery"
)]
struct Args {
    /// Root path to the data directory (expects train/ and validation/).
    #[arg(long, default_value = "hw2_data")]
    data_dir: PathBuf,

    /// Number of data loading workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Directory checkpoints are written into.
    #[arg(long, default_value = "models")]
    save_dir: PathBuf,

    /// Initialize the encoder from pretrained weights in the data directory.
    #[arg(long)]
    pretrained: bool,

    /// GPU device id.
    #[arg(long, default_value_t = 0)]
    gpu: usize,

    /// Number of training epochs.
    #[arg(long, default_value_t = 100)]
    epoch: usize,

    /// Run validation every N epochs.
    #[arg(long, default_value_t = 1)]
    val_epoch: usize,

    /// Train batch size.
    #[arg(long, default_value_t = 32)]
    train_batch: usize,

    /// Test batch size.
    #[arg(long, default_value_t = 32)]
    test_batch: usize,

    /// Initial learning rate.
    #[arg(long, default_value_t = 2.0e-4)]
    lr: f64,

    /// L2 weight decay penalty.
    #[arg(long, default_value_t = 5.0e-4)]
    weight_decay: f64,

    /// Batches to accumulate gradients over before an optimizer step.
    #[arg(long, default_value_t = 1)]
    accumulate_gradient: usize,

    /// Path to a trained model checkpoint to resume from.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Random seed.
    #[arg(long, default_value_t = 42)]
    random_seed: u64,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let device = WgpuDevice::DiscreteGpu(args.gpu);

    let optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(args.weight_decay)));
    let config = TrainingConfig::new(ModelConfig::new(CLASS_COUNT), optimizer)
        .with_epoch_count(args.epoch)
        .with_val_interval(args.val_epoch)
        .with_train_batch_size(args.train_batch)
        .with_test_batch_size(args.test_batch)
        .with_accumulate_gradient(args.accumulate_gradient)
        .with_learning_rate(args.lr)
        .with_seed(args.random_seed)
        .with_worker_count(args.workers);

    train::<AutodiffBackend>(
        &args.data_dir,
        &args.save_dir,
        args.resume.as_deref(),
        args.pretrained,
        config,
        device,
    )
}
