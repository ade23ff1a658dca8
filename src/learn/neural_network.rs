/*!
# Example
Training a [`Lenet5`](classifier::Lenet5) on a synthetic dataset:
```no_run
use lenet::{
    dataset::synthetic::Synthetic,
    learn::neural_network::{classifier::Lenet5, NetworkTrainer, TrainerConfig},
};
# fn main() -> anyhow::Result<()> {
let (train, test) = Synthetic::builder().len(100).build()?.split_at(80);
let model = Lenet5::builder()
    .input_shape([1, 10, 10])
    .classes(2)
    .filter(3)
    .seed(Some(0))
    .build()?;
let config = TrainerConfig {
    learning_rate: 0.05,
    train_batch_size: 10,
    seed: Some(0),
    ..TrainerConfig::default()
};
let mut trainer = NetworkTrainer::new(model, config)?;
let history = trainer.fit(&train, &test, 10)?;
println!("{:?}", history.test_accuracy);
# Ok(())
# }
```
*/
use self::{
    autograd::Variable4,
    layer::{Forward, Layer},
    optimizer::{Optimizer, SGD},
};
use super::{
    criterion::{Accuracy, Criterion, CrossEntropyLoss},
    History, Stats, Summary,
};
use crate::{
    dataset::{Batch, Batches, Dataset},
    error::Error,
};
use anyhow::{ensure, Context, Result};
use rand::{rngs::SmallRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Variables and Parameters
pub mod autograd;
/// Classifiers
pub mod classifier;
/// Layers
pub mod layer;
/// Optimizers
pub mod optimizer;

/// Trainer configuration.
///
/// Every field has a default, so a partial json object is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Step size of SGD. Defaults to 0.01.
    pub learning_rate: f32,
    /// SGD momentum. Defaults to None (plain SGD).
    pub momentum: Option<f32>,
    /// Defaults to 64.
    pub train_batch_size: usize,
    /// Defaults to 1000.
    pub test_batch_size: usize,
    /// Shuffle the training set each epoch. Defaults to true.
    pub shuffle: bool,
    /// Seed for shuffling. If None, seeded from entropy.
    pub seed: Option<u64>,
    /// The number of batches prepared ahead on a background thread. 0 prepares batches
    /// inline. Defaults to 2.
    pub prefetch: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: None,
            train_batch_size: 64,
            test_batch_size: 1000,
            shuffle: true,
            seed: None,
            prefetch: 2,
        }
    }
}

impl TrainerConfig {
    /// Loads from a json file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}!"))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {path:?}!"))
    }
    /// Saves as json to `path`.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {path:?}!"))
    }
    fn validate(&self) -> Result<()> {
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.,
            "learning_rate must be positive, found {}!",
            self.learning_rate
        );
        ensure!(
            self.train_batch_size > 0 && self.test_batch_size > 0,
            "Batch sizes must be positive!"
        );
        Ok(())
    }
}

/// A trainer for a network classifying images.
///
/// Owns the network, the [`SGD`] optimizer and the shuffling rng. Every step that mutates
/// the parameters takes `&mut self`, so steps never overlap. Between steps the network is
/// not training, its parameters have no gradients.
#[derive(Debug)]
pub struct NetworkTrainer<L> {
    network: L,
    optimizer: SGD,
    config: TrainerConfig,
    rng: SmallRng,
    summary: Summary,
}

impl<L: Layer + Forward<Variable4, Output = autograd::Variable2>> NetworkTrainer<L> {
    /// Creates a trainer for `network`.
    ///
    /// **Errors**
    /// - The learning rate or a batch size is not positive.
    pub fn new(mut network: L, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        network.set_training(false)?;
        let mut optimizer = SGD::builder();
        if let Some(momentum) = config.momentum {
            optimizer = optimizer.momentum(momentum);
        }
        let rng = config
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        Ok(Self {
            network,
            optimizer: optimizer.build(),
            config,
            rng,
            summary: Summary::default(),
        })
    }
    /// The network.
    pub fn network(&self) -> &L {
        &self.network
    }
    /// Consumes the trainer, returning the network.
    pub fn into_network(self) -> L {
        self.network
    }
    /// The optimizer.
    pub fn optimizer(&self) -> &SGD {
        &self.optimizer
    }
    /// The config.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }
    /// The summary of the last epoch run by [`.fit()`](Self::fit).
    pub fn summary(&self) -> &Summary {
        &self.summary
    }
    /// Performs one optimization step on `batch`, returning the batch loss.
    ///
    /// Gradients are cleared, computed for this batch only, and applied with SGD.
    ///
    /// **Errors**
    /// - The batch does not fit the network, or a label is out of range.
    pub fn train_step(&mut self, batch: Batch) -> Result<f32> {
        self.network.set_training(true)?;
        let loss = self.step(batch);
        self.network.set_training(false)?;
        loss
    }
    fn step(&mut self, batch: Batch) -> Result<f32> {
        let Batch { images, labels } = batch;
        let logits = self.network.forward(Variable4::from(images))?;
        let loss = CrossEntropyLoss.eval(logits, labels)?;
        loss.backward()?;
        let learning_rate = self.config.learning_rate;
        let optimizer = &self.optimizer;
        for parameter in self.network.parameters_mut()? {
            optimizer.update(learning_rate, parameter)?;
        }
        Ok(loss.value()[()])
    }
    /// Trains for one pass over `dataset`, one step per batch.
    ///
    /// **Errors**
    /// - [`Error::EmptyDataset`] if the dataset has no samples.
    /// - See [`.train_step()`](Self::train_step).
    pub fn train_epoch(&mut self, dataset: &dyn Dataset) -> Result<()> {
        if dataset.is_empty() {
            return Err(Error::EmptyDataset.into());
        }
        let mut batches = Batches::new(dataset, self.config.train_batch_size)?;
        if self.config.shuffle {
            batches = batches.shuffled(&mut self.rng);
        }
        let steps = batches.len();
        let mut step = 0;
        batches.try_for_each(self.config.prefetch, |batch| {
            let loss = self.train_step(batch)?;
            step += 1;
            log::debug!("step: {step}/{steps} loss: {loss:.5}");
            Ok(())
        })
    }
    /// Computes the stats of the network on `dataset`.
    ///
    /// Batches are visited in order, the parameters are not modified.
    ///
    /// **Errors**
    /// - [`Error::EmptyDataset`] if the dataset has no samples.
    /// - The dataset does not fit the network, or a label is out of range.
    pub fn test(&self, dataset: &dyn Dataset) -> Result<Stats> {
        if dataset.is_empty() {
            return Err(Error::EmptyDataset.into());
        }
        let mut stats = Stats::default();
        Batches::new(dataset, self.config.test_batch_size)?.try_for_each(
            self.config.prefetch,
            |batch| {
                let logits = self.network.forward(Variable4::from(batch.images))?;
                let logits = logits.value();
                let loss = CrossEntropyLoss.eval(logits.view(), batch.labels.view())?;
                let correct = Accuracy.eval(logits.view(), batch.labels.view())?;
                stats.add_batch(batch.labels.len(), loss, correct);
                Ok(())
            },
        )?;
        Ok(stats)
    }
    /// Evaluates the network on `dataset`, returning (mean loss, accuracy).
    ///
    /// **Errors**
    ///
    /// See [`.test()`](Self::test).
    pub fn evaluate(&self, dataset: &dyn Dataset) -> Result<(f32, f32)> {
        loss_accuracy(&self.test(dataset)?)
    }
    /// Trains for `epochs` epochs, evaluating on `train` and `test` after each.
    ///
    /// Returns the metrics of each epoch. 0 epochs returns an empty history.
    ///
    /// **Errors**
    /// - [`Error::EmptyDataset`] if either dataset has no samples.
    /// - Any error from training or evaluation, which aborts the run.
    pub fn fit(
        &mut self,
        train: &dyn Dataset,
        test: &dyn Dataset,
        epochs: usize,
    ) -> Result<History> {
        if train.is_empty() || test.is_empty() {
            return Err(Error::EmptyDataset.into());
        }
        let mut history = History::default();
        for _ in 0..epochs {
            let mut summary = std::mem::take(&mut self.summary);
            let result = summary.run_epoch(|_| {
                self.train_epoch(train)?;
                Ok((self.test(train)?, self.test(test)?))
            });
            self.summary = summary;
            let (train_stats, test_stats) = result?;
            log::info!(
                "epoch: {} elapsed: {:.2?} train: {train_stats} test: {test_stats}",
                self.summary.epoch(),
                self.summary.epoch_time(),
            );
            history.push(loss_accuracy(&train_stats)?, loss_accuracy(&test_stats)?);
        }
        Ok(history)
    }
}

fn loss_accuracy(stats: &Stats) -> Result<(f32, f32)> {
    stats
        .mean_loss()
        .zip(stats.accuracy())
        .ok_or_else(|| Error::EmptyDataset.into())
}
