use thiserror::Error;

/// Errors raised by the classifier, the criteria and the training loops.
///
/// Functions return [`anyhow::Result`], use
/// [`downcast_ref`](anyhow::Error::downcast_ref) to match on the kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input shape is incompatible with the fixed topology.
    #[error("{stage}: input shape {shape:?} is incompatible ({reason})!")]
    Shape {
        /// The stage that rejected the input.
        stage: &'static str,
        /// The offending shape.
        shape: Vec<usize>,
        /// Why it was rejected.
        reason: String,
    },
    /// The flattened feature count does not match the first dense layer.
    #[error("{layer}: expected {expected} input features, found {found}!")]
    DimensionMismatch {
        /// The layer that rejected the input.
        layer: &'static str,
        /// The fixed input width of the layer.
        expected: usize,
        /// The width of the input.
        found: usize,
    },
    /// A loop was given a dataset without samples.
    #[error("Dataset is empty!")]
    EmptyDataset,
    /// A label is outside `[0, classes)`.
    #[error("Label {label} at index {index} is out of range for {classes} classes!")]
    LabelRange {
        /// Position of the label (within the batch or dataset).
        index: usize,
        /// The label.
        label: usize,
        /// The number of classes.
        classes: usize,
    },
}

impl Error {
    pub(crate) fn shape(stage: &'static str, shape: &[usize], reason: impl Into<String>) -> Self {
        Self::Shape {
            stage,
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }
}
