use super::{ArrayDataset, Dataset};
use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use ndarray::{Array, ArcArray1};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    Fashion,
}

impl MnistKind {
    fn name(self) -> &'static str {
        match self {
            Self::Digits => "mnist",
            Self::Fashion => "fashion-mnist",
        }
    }
}

/// Mnist builder.
pub mod builders {
    use super::*;

    /// Mnist builder.
    #[derive(Debug, Clone)]
    pub struct MnistBuilder {
        pub(super) path: Option<PathBuf>,
        pub(super) kind: MnistKind,
        pub(super) normalize: Option<(f32, f32)>,
    }

    impl Default for MnistBuilder {
        fn default() -> Self {
            Self {
                path: None,
                kind: MnistKind::Digits,
                normalize: Some((0.1307, 0.3081)),
            }
        }
    }

    impl MnistBuilder {
        /// The folder containing the files.
        ///
        /// If not specified, uses "mnist" or "fashion-mnist" in the OS specific "Downloads"
        /// directory or the "Temp" directory.
        pub fn path(self, path: impl Into<PathBuf>) -> Self {
            Self {
                path: Some(path.into()),
                ..self
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`] (ie the original MNIST dataset).
        ///
        /// Only affects the default path.
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        /// Pixels are scaled to \[0, 1\], then `(x - mean) / std`. Defaults to
        /// (0.1307, 0.3081).
        ///
        /// Pass None to only scale.
        pub fn normalize(self, normalize: Option<(f32, f32)>) -> Self {
            Self { normalize, ..self }
        }
        /// Loads the dataset.
        ///
        /// Each of "train-images-idx3-ubyte", "train-labels-idx1-ubyte",
        /// "t10k-images-idx3-ubyte" and "t10k-labels-idx1-ubyte" is read as is or with a
        /// ".gz" extension.
        ///
        /// **Errors**
        /// - The files were not found.
        /// - Decompressing / parsing the data failed.
        /// - A label is not less than 10.
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

/// The MNIST dataset.
#[derive(Debug, Clone)]
pub struct Mnist {
    kind: MnistKind,
    train: ArrayDataset,
    test: ArrayDataset,
}

impl Mnist {
    /// The number of classes.
    pub const CLASSES: usize = 10;
    /// Returns an [`MnistBuilder`] used to specify options.
    pub fn builder() -> MnistBuilder {
        MnistBuilder::default()
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        let path = builder.path.clone().unwrap_or_else(|| {
            dirs::download_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(builder.kind.name())
        });
        let normalize = builder.normalize;
        let train = load_split(&path, "train", normalize)?;
        let test = load_split(&path, "t10k", normalize)?;
        ensure!(
            train.image_shape() == test.image_shape(),
            "Mnist: train images {:?} and test images {:?} differ!",
            train.image_shape(),
            test.image_shape()
        );
        log::info!(
            "Loaded {} from {path:?}: {} train, {} test",
            builder.kind.name(),
            train.len(),
            test.len()
        );
        Ok(Self {
            kind: builder.kind,
            train,
            test,
        })
    }
    /// The kind.
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    /// The training set, \[len, 1, rows, cols\].
    pub fn train(&self) -> &ArrayDataset {
        &self.train
    }
    /// The test set, \[len, 1, rows, cols\].
    pub fn test(&self) -> &ArrayDataset {
        &self.test
    }
    /// Consumes self, returning the training and test sets.
    pub fn into_train_test(self) -> (ArrayDataset, ArrayDataset) {
        (self.train, self.test)
    }
}

const IMAGES_MAGIC: i32 = 2_051;
const LABELS_MAGIC: i32 = 2_049;

fn load_split(path: &Path, split: &str, normalize: Option<(f32, f32)>) -> Result<ArrayDataset> {
    let (dims, images) = read_idx(path, &format!("{split}-images-idx3-ubyte"), IMAGES_MAGIC)?;
    let (label_dims, labels) = read_idx(path, &format!("{split}-labels-idx1-ubyte"), LABELS_MAGIC)?;
    ensure!(
        dims[0] == label_dims[0],
        "Mnist {split}: found {} images and {} labels!",
        dims[0],
        label_dims[0]
    );
    let (mean, std) = normalize.unwrap_or((0., 1.));
    ensure!(std > 0., "Mnist: std must be positive, found {std}!");
    let images = Array::from_shape_vec([dims[0], 1, dims[1], dims[2]], images)?
        .mapv(|x| (x as f32 / 255. - mean) / std)
        .into_shared();
    let labels = ArcArray1::from_iter(labels.into_iter().map(usize::from));
    ArrayDataset::new(images, labels, Mnist::CLASSES)
        .with_context(|| format!("Mnist {split} is invalid!"))
}

/// Reads an IDX file of u8, returning the dims and the data.
fn read_idx(path: &Path, name: &str, magic: i32) -> Result<(Vec<usize>, Vec<u8>)> {
    let raw_path = path.join(name);
    let gz_path = raw_path.with_extension("gz");
    let (file_path, mut reader): (_, Box<dyn Read>) = if raw_path.exists() {
        let file = File::open(&raw_path).with_context(|| format!("Failed to open {raw_path:?}!"))?;
        (raw_path, Box::new(BufReader::new(file)))
    } else {
        let file = File::open(&gz_path).with_context(|| {
            format!("Failed to open {raw_path:?} or {gz_path:?}!")
        })?;
        (gz_path, Box::new(GzDecoder::new(BufReader::new(file))))
    };
    let found = reader
        .read_i32::<BigEndian>()
        .with_context(|| format!("Failed to read {file_path:?}!"))?;
    ensure!(
        found == magic,
        "Expected magic {magic} in {file_path:?}, found {found}!"
    );
    let ndim = (magic & 0xff) as usize;
    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        let dim = reader
            .read_i32::<BigEndian>()
            .with_context(|| format!("Failed to read {file_path:?}!"))?;
        ensure!(dim >= 0, "Negative dimension {dim} in {file_path:?}!");
        dims.push(dim as usize);
    }
    let len = dims.iter().try_fold(1usize, |len, dim| len.checked_mul(*dim));
    let Some(len) = len else {
        bail!("Dims {dims:?} in {file_path:?} are too large!");
    };
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .with_context(|| format!("Failed to read {file_path:?}!"))?;
    ensure!(
        data.len() == len,
        "Expected {len} bytes of data in {file_path:?} for dims {dims:?}, found {}!",
        data.len()
    );
    Ok((dims, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn idx(magic: i32, dims: &[usize], data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_i32::<BigEndian>(magic).unwrap();
        for dim in dims {
            bytes.write_i32::<BigEndian>(*dim as i32).unwrap();
        }
        bytes.extend_from_slice(data);
        bytes
    }

    fn write(path: &Path, name: &str, bytes: &[u8], gz: bool) {
        if gz {
            let file = File::create(path.join(name).with_extension("gz")).unwrap();
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(bytes).unwrap();
            encoder.finish().unwrap();
        } else {
            std::fs::write(path.join(name), bytes).unwrap();
        }
    }

    fn write_split(path: &Path, split: &str, n: usize, labels: &[u8], gz: bool) {
        let pixels: Vec<u8> = (0..n * 2 * 3).map(|x| (x * 10) as u8).collect();
        write(
            path,
            &format!("{split}-images-idx3-ubyte"),
            &idx(IMAGES_MAGIC, &[n, 2, 3], &pixels),
            gz,
        );
        write(
            path,
            &format!("{split}-labels-idx1-ubyte"),
            &idx(LABELS_MAGIC, &[labels.len()], labels),
            gz,
        );
    }

    #[test]
    fn load_raw_and_gz() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_split(dir.path(), "train", 3, &[0, 9, 4], false);
        write_split(dir.path(), "t10k", 2, &[1, 2], true);
        let mnist = Mnist::builder().path(dir.path()).normalize(None).build()?;
        assert_eq!(mnist.train().len(), 3);
        assert_eq!(mnist.test().len(), 2);
        assert_eq!(mnist.train().image_shape(), [1, 2, 3]);
        assert_eq!(mnist.train().labels().to_vec(), [0, 9, 4]);
        approx::assert_relative_eq!(mnist.train().images()[(0, 0, 0, 1)], 10. / 255.);
        approx::assert_relative_eq!(mnist.test().images()[(1, 0, 1, 2)], 110. / 255.);
        Ok(())
    }

    #[test]
    fn normalizes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_split(dir.path(), "train", 1, &[0], false);
        write_split(dir.path(), "t10k", 1, &[0], false);
        let mnist = Mnist::builder().path(dir.path()).build()?;
        approx::assert_relative_eq!(
            mnist.train().images()[(0, 0, 0, 0)],
            -0.1307 / 0.3081,
            max_relative = 1e-6
        );
        Ok(())
    }

    #[test]
    fn missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let error = Mnist::builder().path(dir.path()).build().unwrap_err();
        assert!(format!("{error}").contains("train-images-idx3-ubyte"));
    }

    #[test]
    fn bad_magic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_split(dir.path(), "train", 1, &[0], false);
        write(
            dir.path(),
            "train-images-idx3-ubyte",
            &idx(LABELS_MAGIC, &[1], &[0]),
            false,
        );
        write_split(dir.path(), "t10k", 1, &[0], false);
        assert!(Mnist::builder().path(dir.path()).build().is_err());
        Ok(())
    }

    #[test]
    fn truncated_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_split(dir.path(), "train", 2, &[0], false);
        write_split(dir.path(), "t10k", 1, &[0], false);
        let error = Mnist::builder().path(dir.path()).build().unwrap_err();
        assert!(format!("{error}").contains("2 images and 1 labels"));
        Ok(())
    }

    #[test]
    fn oversized_dims() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dim = i32::MAX as usize;
        write(
            dir.path(),
            "train-images-idx3-ubyte",
            &idx(IMAGES_MAGIC, &[dim, dim, dim], &[0]),
            false,
        );
        let error = read_idx(dir.path(), "train-images-idx3-ubyte", IMAGES_MAGIC).unwrap_err();
        assert!(format!("{error}").contains("too large"));
        Ok(())
    }

    #[test]
    fn label_out_of_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_split(dir.path(), "train", 1, &[10], false);
        write_split(dir.path(), "t10k", 1, &[0], false);
        let error = Mnist::builder().path(dir.path()).build().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<crate::error::Error>(),
            Some(crate::error::Error::LabelRange { label: 10, .. })
        ));
        Ok(())
    }
}
