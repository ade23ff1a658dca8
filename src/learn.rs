use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    path::Path,
    time::{Duration, Instant},
};

/// Loss functions and metrics.
pub mod criterion;
/// Neural networks.
pub mod neural_network;

/// Training / Testing statistics.
///
/// Accumulated over the batches of one pass over a dataset.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: f32,
    correct: usize,
}

impl Stats {
    /// Adds a batch of `count` samples with mean loss `loss` and `correct` correct predictions.
    pub fn add_batch(&mut self, count: usize, loss: f32, correct: usize) {
        self.count += count;
        self.loss += loss * count as f32;
        self.correct += correct;
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The summed loss.
    pub fn loss_sum(&self) -> f32 {
        self.loss
    }
    /// The number of correct predictions.
    pub fn correct(&self) -> usize {
        self.correct
    }
    /// The mean loss, or None if empty.
    pub fn mean_loss(&self) -> Option<f32> {
        (self.count > 0).then(|| self.loss / self.count as f32)
    }
    /// The accuracy in \[0, 1\], or None if empty.
    pub fn accuracy(&self) -> Option<f32> {
        (self.count > 0).then(|| self.correct as f32 / self.count as f32)
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.mean_loss(), self.accuracy()) {
            (Some(loss), Some(accuracy)) => write!(
                f,
                "loss: {loss:.5} accuracy: {:.2}% ({}/{})",
                accuracy * 100.,
                self.correct,
                self.count
            ),
            _ => write!(f, "empty"),
        }
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
    test: Stats,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<(Stats, Stats)>
    where
        F: FnMut(&Self) -> Result<(Stats, Stats)>,
    {
        let start = Instant::now();
        let (train, test) = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        self.test = test;
        Ok((train, test))
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The duration of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The training stats of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
    /// The test stats of the last epoch.
    pub fn test(&self) -> &Stats {
        &self.test
    }
}

/// Per epoch metrics of a run.
///
/// Each sequence has one entry per epoch, in order.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Mean loss on the training set.
    pub train_loss: Vec<f32>,
    /// Accuracy on the training set.
    pub train_accuracy: Vec<f32>,
    /// Mean loss on the test set.
    pub test_loss: Vec<f32>,
    /// Accuracy on the test set.
    pub test_accuracy: Vec<f32>,
}

impl History {
    /// The number of epochs recorded.
    pub fn len(&self) -> usize {
        self.train_loss.len()
    }
    /// Whether no epochs are recorded.
    pub fn is_empty(&self) -> bool {
        self.train_loss.is_empty()
    }
    /// Appends an epoch.
    pub fn push(
        &mut self,
        (train_loss, train_accuracy): (f32, f32),
        (test_loss, test_accuracy): (f32, f32),
    ) {
        self.train_loss.push(train_loss);
        self.train_accuracy.push(train_accuracy);
        self.test_loss.push(test_loss);
        self.test_accuracy.push(test_accuracy);
    }
    /// Saves as json to `path`.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {path:?}!"))
    }
}
