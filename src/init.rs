//! Parameter initialization.
use ndarray::ArrayViewMutD;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Fills a parameter.
///
/// Weights are laid out as \[outputs, inputs, ..\], trailing axes (the filter of a
/// convolution) count towards both fan in and fan out.
pub trait Initializer: Debug {
    /// Fills `array` with values sampled from `rng`.
    fn fill<R: Rng + ?Sized>(&self, array: &mut ArrayViewMutD<f32>, rng: &mut R);
}

fn fans(shape: &[usize]) -> (usize, usize) {
    let receptive = shape.iter().skip(2).product::<usize>();
    let fan_in = shape.get(1).copied().unwrap_or(1) * receptive;
    let fan_out = shape.first().copied().unwrap_or(1) * receptive;
    (fan_in.max(1), fan_out.max(1))
}

/// Samples from a fixed distribution.
#[derive(Debug, Clone, Copy)]
pub struct Random<D> {
    distr: D,
}

impl<D> Random<D> {
    /// Samples from `distr`.
    pub fn new(distr: D) -> Self {
        Self { distr }
    }
}

impl<D: Distribution<f32> + Debug> Initializer for Random<D> {
    fn fill<R: Rng + ?Sized>(&self, array: &mut ArrayViewMutD<f32>, rng: &mut R) {
        array.map_inplace(|x| *x = self.distr.sample(rng));
    }
}

/// Weight initialization scheme.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Init {
    /// Normal with std_dev = sqrt(2 / fan_in).
    #[default]
    HeNormal,
    /// Uniform (-a, a) where a = sqrt(6 / (fan_in + fan_out)).
    XavierUniform,
}

impl Initializer for Init {
    fn fill<R: Rng + ?Sized>(&self, array: &mut ArrayViewMutD<f32>, rng: &mut R) {
        let (fan_in, fan_out) = fans(array.shape());
        match self {
            Self::HeNormal => {
                let std_dev = (2. / fan_in as f32).sqrt();
                // std_dev is finite and positive
                if let Ok(normal) = Normal::new(0., std_dev) {
                    Random::new(normal).fill(array, rng);
                }
            }
            Self::XavierUniform => {
                let a = (6. / (fan_in + fan_out) as f32).sqrt();
                Random::new(Uniform::new(-a, a)).fill(array, rng);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn conv_fans() {
        assert_eq!(fans(&[6, 1, 5, 5]), (25, 150));
        assert_eq!(fans(&[120, 256]), (256, 120));
        assert_eq!(fans(&[10]), (1, 10));
    }

    #[test]
    fn xavier_uniform_bounds() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut x = ArrayD::<f32>::zeros(vec![16, 6, 5, 5]);
        Init::XavierUniform.fill(&mut x.view_mut(), &mut rng);
        let a = (6f32 / (150. + 400.)).sqrt();
        assert!(x.iter().all(|x| x.abs() <= a));
        assert!(x.iter().any(|x| *x != 0.));
    }

    #[test]
    fn he_normal_std_dev() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut x = ArrayD::<f32>::zeros(vec![400, 50]);
        Init::HeNormal.fill(&mut x.view_mut(), &mut rng);
        let std_dev = x.map(|x| x * x).mean().unwrap().sqrt();
        approx::assert_relative_eq!(std_dev, (2f32 / 50.).sqrt(), max_relative = 0.05);
    }

    #[test]
    fn seeded_fill_is_reproducible() {
        let fill = |seed| {
            let mut x = ArrayD::<f32>::zeros(vec![3, 4]);
            Init::HeNormal.fill(&mut x.view_mut(), &mut SmallRng::seed_from_u64(seed));
            x
        };
        assert_eq!(fill(7), fill(7));
        assert_ne!(fill(7), fill(8));
    }
}
