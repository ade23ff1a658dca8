use super::ArrayDataset;
use anyhow::{ensure, Result};
use ndarray::{Array1, Array4, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// The kind of synthetic data.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SyntheticKind {
    /// Each class fills its images from a disjoint intensity band, so the classes are
    /// separable by mean intensity.
    #[default]
    Separable,
    /// Uniform noise in \[-0.5, 0.5\], unrelated to the labels.
    Noise,
}

/// Synthetic builder.
pub mod builders {
    use super::*;

    /// Synthetic builder.
    #[derive(Debug, Clone)]
    pub struct SyntheticBuilder {
        pub(super) kind: SyntheticKind,
        pub(super) image_shape: [usize; 3],
        pub(super) classes: usize,
        pub(super) len: usize,
        pub(super) seed: u64,
    }

    impl Default for SyntheticBuilder {
        fn default() -> Self {
            Self {
                kind: SyntheticKind::default(),
                image_shape: [1, 10, 10],
                classes: 2,
                len: 100,
                seed: 0,
            }
        }
    }

    impl SyntheticBuilder {
        /// The kind. Defaults to [`SyntheticKind::Separable`].
        pub fn kind(self, kind: SyntheticKind) -> Self {
            Self { kind, ..self }
        }
        /// The image shape \[channels, height, width\]. Defaults to \[1, 10, 10\].
        pub fn image_shape(self, image_shape: [usize; 3]) -> Self {
            Self {
                image_shape,
                ..self
            }
        }
        /// The number of classes. Defaults to 2.
        pub fn classes(self, classes: usize) -> Self {
            Self { classes, ..self }
        }
        /// The number of samples. Defaults to 100.
        pub fn len(self, len: usize) -> Self {
            Self { len, ..self }
        }
        /// The seed. Defaults to 0.
        pub fn seed(self, seed: u64) -> Self {
            Self { seed, ..self }
        }
        /// Generates the dataset.
        ///
        /// Sample `i` has label `i % classes`.
        ///
        /// **Errors**
        /// - `classes` or an image dimension is 0.
        pub fn build(&self) -> Result<ArrayDataset> {
            generate(self)
        }
    }
}
use builders::SyntheticBuilder;

/// Generated datasets.
#[derive(Debug)]
pub struct Synthetic;

impl Synthetic {
    /// Returns a [`SyntheticBuilder`] used to specify options.
    pub fn builder() -> SyntheticBuilder {
        SyntheticBuilder::default()
    }
}

fn generate(builder: &SyntheticBuilder) -> Result<ArrayDataset> {
    let SyntheticBuilder {
        kind,
        image_shape: [c, h, w],
        classes,
        len,
        seed,
    } = *builder;
    ensure!(classes > 0, "Synthetic: classes must be positive!");
    ensure!(
        c > 0 && h > 0 && w > 0,
        "Synthetic: image shape {:?} has a zero dimension!",
        [c, h, w]
    );
    let mut rng = SmallRng::seed_from_u64(seed);
    let labels = Array1::from_iter((0..len).map(|i| i % classes));
    let mut images = Array4::zeros([len, c, h, w]);
    for (mut image, label) in images.axis_iter_mut(Axis(0)).zip(labels.iter().copied()) {
        match kind {
            SyntheticKind::Separable => {
                // Band `label` is [label, label + 0.3] / classes, centered on 0.
                let low = label as f32 / classes as f32;
                let width = 0.3 / classes as f32;
                image.map_inplace(|x| *x = low + width * rng.gen::<f32>() - 0.5);
            }
            SyntheticKind::Noise => {
                image.map_inplace(|x| *x = rng.gen::<f32>() - 0.5);
            }
        }
    }
    ArrayDataset::new(images.into_shared(), labels.into_shared(), classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    #[test]
    fn separable() -> Result<()> {
        let dataset = Synthetic::builder().build()?;
        assert_eq!(dataset.len(), 100);
        assert_eq!(dataset.image_shape(), [1, 10, 10]);
        assert_eq!(dataset.classes(), 2);
        for (image, label) in dataset.images().outer_iter().zip(dataset.labels().iter()) {
            let (low, high) = if *label == 0 { (-0.5, -0.35) } else { (0., 0.15) };
            assert!(image.iter().all(|x| (low..=high).contains(x)));
        }
        Ok(())
    }

    #[test]
    fn noise_is_seeded() -> Result<()> {
        let builder = Synthetic::builder()
            .kind(SyntheticKind::Noise)
            .classes(4)
            .len(9)
            .seed(7);
        let a = builder.build()?;
        let b = builder.build()?;
        assert_eq!(a.images(), b.images());
        assert_eq!(a.labels().to_vec(), [0, 1, 2, 3, 0, 1, 2, 3, 0]);
        assert!(a.images().iter().all(|x| (-0.5..=0.5).contains(x)));
        Ok(())
    }

    #[test]
    fn zero_classes() {
        assert!(Synthetic::builder().classes(0).build().is_err());
    }
}
