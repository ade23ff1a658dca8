use anyhow::Result;
use clap::{Parser, ValueEnum};
use lenet::{
    dataset::{
        mnist::{Mnist, MnistKind},
        synthetic::Synthetic,
        ArrayDataset, Dataset,
    },
    device::Device,
    init::Init,
    learn::neural_network::{classifier::Lenet5, NetworkTrainer, TrainerConfig},
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Data {
    /// Local MNIST IDX files.
    Mnist,
    /// Local FashionMNIST IDX files.
    Fashion,
    /// Generated 1 x 10 x 10 images in 2 separable classes.
    Synthetic,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InitArg {
    HeNormal,
    XavierUniform,
}

impl From<InitArg> for Init {
    fn from(init: InitArg) -> Self {
        match init {
            InitArg::HeNormal => Init::HeNormal,
            InitArg::XavierUniform => Init::XavierUniform,
        }
    }
}

/// Trains a LeNet-5 classifier.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Options {
    #[arg(long, value_enum, default_value_t = Data::Mnist)]
    data: Data,
    /// Folder with the IDX files, defaults to "mnist" in the Downloads folder.
    #[arg(long)]
    path: Option<PathBuf>,
    /// Json trainer config, overridden by the flags below.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value_t = 10)]
    epochs: usize,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long)]
    momentum: Option<f32>,
    #[arg(long)]
    train_batch_size: Option<usize>,
    #[arg(long)]
    test_batch_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    no_shuffle: bool,
    #[arg(long)]
    prefetch: Option<usize>,
    /// Worker threads, 0 for all cores. Runs serially if not specified.
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, default_value_t = 0)]
    padding: usize,
    #[arg(long, value_enum, default_value_t = InitArg::HeNormal)]
    init: InitArg,
    /// Write the per epoch metrics as json.
    #[arg(long)]
    history: Option<PathBuf>,
}

impl Options {
    fn trainer_config(&self) -> Result<TrainerConfig> {
        let mut config = if let Some(path) = self.config.as_ref() {
            TrainerConfig::from_path(path)?
        } else {
            TrainerConfig::default()
        };
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if self.momentum.is_some() {
            config.momentum = self.momentum;
        }
        if let Some(train_batch_size) = self.train_batch_size {
            config.train_batch_size = train_batch_size;
        }
        if let Some(test_batch_size) = self.test_batch_size {
            config.test_batch_size = test_batch_size;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.no_shuffle {
            config.shuffle = false;
        }
        if let Some(prefetch) = self.prefetch {
            config.prefetch = prefetch;
        }
        Ok(config)
    }
    fn datasets(&self) -> Result<(ArrayDataset, ArrayDataset)> {
        let kind = match self.data {
            Data::Mnist => MnistKind::Digits,
            Data::Fashion => MnistKind::Fashion,
            Data::Synthetic => {
                let dataset = Synthetic::builder()
                    .len(1_000)
                    .seed(self.seed.unwrap_or_default())
                    .build()?;
                return Ok(dataset.split_at(800));
            }
        };
        let mut builder = Mnist::builder().kind(kind);
        if let Some(path) = self.path.as_ref() {
            builder = builder.path(path);
        }
        Ok(builder.build()?.into_train_test())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let options = Options::parse();
    let config = options.trainer_config()?;
    println!("{options:#?}");
    println!("{}", serde_json::to_string_pretty(&config)?);
    let device = if let Some(threads) = options.threads {
        Device::builder().threads(threads).build()?
    } else {
        Device::host()
    };
    let (train, test) = options.datasets()?;
    let [channels, height, width] = train.image_shape();
    let model = Lenet5::builder()
        .device(device)
        .input_shape([channels, height, width])
        .classes(train.classes())
        .filter(if height < 28 { 3 } else { 5 })
        .padding(options.padding)
        .init(options.init.into())
        .seed(config.seed)
        .build()?;
    let mut trainer = NetworkTrainer::new(model, config)?;
    let history = trainer.fit(&train, &test, options.epochs)?;
    let summary = trainer.summary();
    println!(
        "epochs: {} total time: {:.2?} train: {} test: {}",
        summary.epoch(),
        summary.total_time(),
        summary.train(),
        summary.test()
    );
    if let Some(path) = options.history.as_ref() {
        history.to_path(path)?;
    }
    Ok(())
}
