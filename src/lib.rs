/*!
A LeNet-5 style image classifier with a small reverse-mode autograd.

# Overview
- [`dataset`]: the [`Dataset`](dataset::Dataset) trait, in memory datasets, batching and a
local MNIST loader.
- [`learn::neural_network`]: [`Variable`](learn::neural_network::autograd::Variable)'s and
[`Parameter`](learn::neural_network::autograd::Parameter)'s, layers, the
[`Lenet5`](learn::neural_network::classifier::Lenet5) classifier, [`SGD`](learn::neural_network::optimizer::SGD)
and the [`NetworkTrainer`](learn::neural_network::NetworkTrainer).
- [`learn::criterion`]: cross entropy loss and accuracy.
- [`device`]: serial or multithreaded execution on the host.

Functions return [`anyhow::Result`]. Errors that callers may want to handle are
[`error::Error`]'s.

# Logging
Epoch metrics are logged at info level and step losses at debug level with [log](https://docs.rs/log).
*/
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Datasets.
pub mod dataset;
/// Devices.
pub mod device;
/// Errors.
pub mod error;
/// Initializers.
pub mod init;
/// Machine learning.
pub mod learn;
/// Host kernels.
pub mod ops;
