//! Datasets and batching.
//!
//! A [`Dataset`] is an ordered, finite collection of labeled images. [`Batches`] stacks
//! samples into [`Batch`]'s, in sequential or shuffled order, optionally on a background
//! thread.
use crate::error::Error;
use anyhow::{ensure, Result};
use crossbeam_channel::Receiver;
use ndarray::{ArcArray, ArcArray1, Array1, Array4, Axis, CowArray, Ix3, Ix4, Slice};
use rand::{seq::SliceRandom, Rng};

/// MNIST.
pub mod mnist;
/// Generated datasets.
pub mod synthetic;

/// A labeled image.
#[derive(Debug, Clone)]
pub struct Sample<'a> {
    /// \[channels, height, width\].
    pub image: CowArray<'a, f32, Ix3>,
    /// The class, in \[0, classes).
    pub label: usize,
}

/// A stack of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// \[batch, channels, height, width\].
    pub images: ArcArray<f32, Ix4>,
    /// \[batch\].
    pub labels: ArcArray1<usize>,
}

impl Batch {
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }
    /// Whether the batch has no samples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Dataset.
///
/// Every image has the shape [`.image_shape()`](Dataset::image_shape) and every label is
/// less than [`.classes()`](Dataset::classes).
pub trait Dataset: Send + Sync {
    /// The number of samples.
    fn len(&self) -> usize;
    /// Whether there are no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The shape of each image, \[channels, height, width\].
    fn image_shape(&self) -> [usize; 3];
    /// The number of classes.
    fn classes(&self) -> usize;
    /// The sample at `index`.
    ///
    /// **Errors**
    /// - `index` is out of bounds.
    fn sample(&self, index: usize) -> Result<Sample<'_>>;
    /// Stacks the samples at `indices`.
    ///
    /// **Errors**
    /// - An index is out of bounds.
    /// - A sample does not have the advertised shape or class range.
    fn batch(&self, indices: &[usize]) -> Result<Batch> {
        let [c, h, w] = self.image_shape();
        let classes = self.classes();
        let mut images = Array4::zeros([indices.len(), c, h, w]);
        let mut labels = Array1::zeros(indices.len());
        for ((mut image, label), index) in images
            .outer_iter_mut()
            .zip(labels.iter_mut())
            .zip(indices.iter().copied())
        {
            let sample = self.sample(index)?;
            if sample.image.shape() != [c, h, w] {
                return Err(Error::shape(
                    "Dataset",
                    sample.image.shape(),
                    format!("expected {:?}", [c, h, w]),
                )
                .into());
            }
            if sample.label >= classes {
                return Err(Error::LabelRange {
                    index,
                    label: sample.label,
                    classes,
                }
                .into());
            }
            image.assign(&sample.image);
            *label = sample.label;
        }
        Ok(Batch {
            images: images.into_shared(),
            labels: labels.into_shared(),
        })
    }
}

/// An in memory dataset.
#[derive(Debug, Clone)]
pub struct ArrayDataset {
    images: ArcArray<f32, Ix4>,
    labels: ArcArray1<usize>,
    classes: usize,
}

impl ArrayDataset {
    /// Creates a dataset from `images` \[len, channels, height, width\] and `labels` \[len\].
    ///
    /// **Errors**
    /// - [`Error::Shape`] if the number of images and labels differ.
    /// - [`Error::LabelRange`] if a label is not less than `classes`.
    pub fn new(
        images: ArcArray<f32, Ix4>,
        labels: ArcArray1<usize>,
        classes: usize,
    ) -> Result<Self> {
        ensure!(classes > 0, "ArrayDataset: classes must be positive!");
        if images.len_of(Axis(0)) != labels.len() {
            return Err(Error::shape(
                "ArrayDataset",
                images.shape(),
                format!("found {} labels", labels.len()),
            )
            .into());
        }
        if let Some((index, label)) = labels
            .iter()
            .copied()
            .enumerate()
            .find(|(_, label)| *label >= classes)
        {
            return Err(Error::LabelRange {
                index,
                label,
                classes,
            }
            .into());
        }
        Ok(Self {
            images,
            labels,
            classes,
        })
    }
    /// The images.
    pub fn images(&self) -> &ArcArray<f32, Ix4> {
        &self.images
    }
    /// The labels.
    pub fn labels(&self) -> &ArcArray1<usize> {
        &self.labels
    }
    /// Splits into the first `index` samples and the rest.
    ///
    /// The data is shared, not copied. `index` is clamped to the length.
    pub fn split_at(&self, index: usize) -> (Self, Self) {
        let index = index.min(self.len());
        let slice = |slice: Slice| {
            let mut images = self.images.clone();
            images.slice_axis_inplace(Axis(0), slice);
            let mut labels = self.labels.clone();
            labels.slice_axis_inplace(Axis(0), slice);
            Self {
                images,
                labels,
                classes: self.classes,
            }
        };
        (
            slice(Slice::from(..index)),
            slice(Slice::from(index..)),
        )
    }
}

impl Dataset for ArrayDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }
    fn image_shape(&self) -> [usize; 3] {
        let (_, c, h, w) = self.images.dim();
        [c, h, w]
    }
    fn classes(&self) -> usize {
        self.classes
    }
    fn sample(&self, index: usize) -> Result<Sample<'_>> {
        ensure!(
            index < self.len(),
            "Index {index} out of bounds for dataset of length {}!",
            self.len()
        );
        Ok(Sample {
            image: self.images.index_axis(Axis(0), index).into(),
            label: self.labels[index],
        })
    }
    fn batch(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(index) = indices.iter().find(|index| **index >= self.len()) {
            anyhow::bail!(
                "Index {index} out of bounds for dataset of length {}!",
                self.len()
            );
        }
        Ok(Batch {
            images: self.images.select(Axis(0), indices).into_shared(),
            labels: self.labels.select(Axis(0), indices).into_shared(),
        })
    }
}

/// An iterator over the batches of a dataset.
///
/// Every sample is visited exactly once, the last batch may be smaller.
pub struct Batches<'a> {
    dataset: &'a dyn Dataset,
    indices: Vec<usize>,
    batch_size: usize,
    offset: usize,
}

impl<'a> Batches<'a> {
    /// Batches of `dataset` in sequential order.
    ///
    /// **Errors**
    /// - `batch_size` is 0.
    pub fn new(dataset: &'a dyn Dataset, batch_size: usize) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive!");
        Ok(Self {
            dataset,
            indices: (0..dataset.len()).collect(),
            batch_size,
            offset: 0,
        })
    }
    /// Shuffles the order of the samples with `rng`.
    pub fn shuffled<R: Rng + ?Sized>(mut self, rng: &mut R) -> Self {
        self.indices[self.offset..].shuffle(rng);
        self
    }
    /// Calls `f` with each batch.
    ///
    /// If `prefetch` > 0, batches are stacked on a scoped thread, up to `prefetch` ahead of
    /// `f`. Stops at the first error.
    pub fn try_for_each<F>(self, prefetch: usize, mut f: F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        if prefetch == 0 {
            for batch in self {
                f(batch?)?;
            }
            return Ok(());
        }
        let (sender, receiver) = crossbeam_channel::bounded(prefetch);
        std::thread::scope(|scope| {
            scope.spawn(move || {
                for batch in self {
                    let stop = batch.is_err();
                    // A closed channel means the consumer stopped.
                    if sender.send(batch).is_err() || stop {
                        break;
                    }
                }
            });
            consume(receiver, f)
        })
    }
}

// Drops the receiver on return, which unblocks the producer.
fn consume<F>(receiver: Receiver<Result<Batch>>, mut f: F) -> Result<()>
where
    F: FnMut(Batch) -> Result<()>,
{
    for batch in receiver.iter() {
        f(batch?)?;
    }
    Ok(())
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.indices.len() {
            return None;
        }
        let end = self.offset + self.batch_size.min(self.indices.len() - self.offset);
        let batch = self.dataset.batch(&self.indices[self.offset..end]);
        self.offset = end;
        Some(batch)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len() - self.offset;
        let batches =
            remaining / self.batch_size + usize::from(remaining % self.batch_size != 0);
        (batches, Some(batches))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    fn dataset(len: usize) -> ArrayDataset {
        let images = Array4::from_shape_fn([len, 1, 2, 2], |(i, _, _, _)| i as f32).into_shared();
        let labels = Array1::from_iter((0..len).map(|i| i % 3)).into_shared();
        ArrayDataset::new(images, labels, 3).unwrap()
    }

    fn visited(batches: Batches) -> Result<Vec<usize>> {
        let mut indices = Vec::new();
        batches.try_for_each(0, |batch| {
            indices.extend(batch.images.iter().step_by(4).map(|x| *x as usize));
            Ok(())
        })?;
        Ok(indices)
    }

    #[test]
    fn partial_batch() -> Result<()> {
        let dataset = dataset(23);
        let batches = Batches::new(&dataset, 5)?;
        assert_eq!(batches.len(), 5);
        let sizes: Vec<_> = batches.map(|batch| batch.unwrap().len()).collect();
        assert_eq!(sizes, [5, 5, 5, 5, 3]);
        assert_eq!(visited(Batches::new(&dataset, 5)?)?, (0..23).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn shuffled_visits_every_sample_once() -> Result<()> {
        let dataset = dataset(23);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut indices = visited(Batches::new(&dataset, 4)?.shuffled(&mut rng))?;
        assert_ne!(indices, (0..23).collect::<Vec<_>>());
        indices.sort_unstable();
        assert_eq!(indices, (0..23).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn prefetch_matches_serial() -> Result<()> {
        let dataset = dataset(50);
        let shuffled = |seed| Batches::new(&dataset, 7).map(|batches| {
            batches.shuffled(&mut SmallRng::seed_from_u64(seed))
        });
        let mut serial = Vec::new();
        shuffled(1)?.try_for_each(0, |batch| {
            serial.push(batch.labels);
            Ok(())
        })?;
        let mut prefetched = Vec::new();
        shuffled(1)?.try_for_each(2, |batch| {
            prefetched.push(batch.labels);
            Ok(())
        })?;
        assert_eq!(serial, prefetched);
        Ok(())
    }

    #[test]
    fn prefetch_stops_on_error() {
        let dataset = dataset(100);
        let mut count = 0;
        let result = Batches::new(&dataset, 1).unwrap().try_for_each(1, |_| {
            count += 1;
            anyhow::ensure!(count < 3, "stop");
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(count, 3);
    }

    #[test]
    fn array_dataset_validates() {
        let images = Array4::<f32>::zeros([3, 1, 2, 2]).into_shared();
        let error =
            ArrayDataset::new(images.clone(), Array1::from_vec(vec![0, 1]).into_shared(), 2)
                .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Shape { .. })
        ));
        let error =
            ArrayDataset::new(images, Array1::from_vec(vec![0, 1, 2]).into_shared(), 2)
                .unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::LabelRange {
                index: 2,
                label: 2,
                classes: 2
            })
        );
    }

    #[test]
    fn split_at() -> Result<()> {
        let (train, test) = dataset(10).split_at(8);
        assert_eq!((train.len(), test.len()), (8, 2));
        assert_eq!(test.sample(1)?.image[(0, 0, 0)], 9.);
        assert_eq!(test.sample(1)?.label, 0);
        assert!(test.sample(2).is_err());
        Ok(())
    }

    #[test]
    fn batch_size_larger_than_dataset() -> Result<()> {
        let dataset = dataset(3);
        let mut batches = Batches::new(&dataset, usize::MAX)?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches.next().transpose()?.map(|batch| batch.len()), Some(3));
        assert_eq!(batches.len(), 0);
        assert!(batches.next().is_none());
        Ok(())
    }

    #[test]
    fn batch_size_zero() {
        let dataset = dataset(1);
        assert!(Batches::new(&dataset, 0).is_err());
    }
}
