#[cfg(doc)]
use super::autograd::Parameter;
use super::autograd::ParameterViewMutD;
use anyhow::{ensure, format_err, Result};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};
use std::any::TypeId;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`SGD`].
    pub struct SGDBuilder {
        momentum: Option<f32>,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self { momentum: None }
        }
        /// Momentum. Default is None.
        ///
        /// If set, a "velocity" tensor will be added to the [`State`] of each [`Parameter`].
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> SGD {
            let Self { momentum } = self;
            SGD { momentum }
        }
    }
}
use builder::*;

/// Optimizer State.
///
/// Created with [`ParameterViewMut::init_optimizer_state()`](super::autograd::ParameterViewMut::init_optimizer_state).
/// Stores per parameter training progress.
#[derive(Debug, Clone)]
pub struct State {
    name: String,
    id: TypeId,
    key_values: Vec<(String, ArrayD<f32>)>,
}

impl State {
    pub(crate) fn new(
        shape: &[usize],
        name: String,
        id: TypeId,
        key_values: Vec<(String, ArrayD<f32>)>,
    ) -> Result<Self> {
        for (key, tensor) in key_values.iter() {
            ensure!(
                tensor.shape() == shape,
                "Expected {name:?}.{key:?} shape {:?} to match parameter {shape:?}!",
                tensor.shape()
            );
        }
        Ok(Self {
            name,
            id,
            key_values,
        })
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Type id of the [`Optimizer`].
    pub fn id(&self) -> TypeId {
        self.id
    }
    /// Iterator over keys and tensors, each with the shape of the parameter.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ArrayViewD<f32>)> {
        self.key_values
            .iter()
            .map(|(key, tensor)| (key.as_str(), tensor.view()))
    }
    /// Iterator over keys and mutable tensors.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, ArrayViewMutD<f32>)> {
        self.key_values
            .iter_mut()
            .map(|(key, tensor)| (key.as_str(), tensor.view_mut()))
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// Parameters without a gradient are left unchanged.
    fn update(&self, learning_rate: f32, parameter: ParameterViewMutD) -> Result<()>;
}

/// Stochastic Gradient Descent.
///
/// Plain SGD updates `w -= learning_rate * dw`. With momentum the update is
/// `v = momentum * v + dw; w -= learning_rate * v`.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct SGD {
    momentum: Option<f32>,
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    /// The momentum.
    pub fn momentum(&self) -> Option<f32> {
        self.momentum
    }
    fn init_state(&self, parameter: &mut ParameterViewMutD) -> Result<()> {
        if let Some(state) = parameter.optimizer_state() {
            if state.id() == TypeId::of::<Self>()
                && self.momentum.is_some() == state.iter().next().is_some()
            {
                return Ok(());
            }
        }
        let mut key_values = Vec::new();
        if self.momentum.is_some() {
            let velocity = ArrayD::zeros(parameter.raw_dim());
            key_values.push(("velocity".to_string(), velocity));
        }
        parameter.init_optimizer_state("SGD", TypeId::of::<Self>(), key_values)
    }
}

impl Optimizer for SGD {
    fn update(&self, learning_rate: f32, mut parameter: ParameterViewMutD) -> Result<()> {
        self.init_state(&mut parameter)?;
        let Some(grad) = parameter.grad() else {
            return Ok(());
        };
        ensure!(
            grad.shape() == parameter.shape(),
            "SGD: gradient shape {:?} does not match parameter {:?}!",
            grad.shape(),
            parameter.shape()
        );
        let (value, state) = parameter.value_view_optimizer_state_mut();
        if let Some(momentum) = self.momentum {
            let velocity = state
                .and_then(|state| {
                    state
                        .iter_mut()
                        .find(|(key, _)| *key == "velocity")
                        .map(|(_, tensor)| tensor)
                })
                .ok_or_else(|| format_err!("SGD: velocity is not initialized!"))?;
            sgd_update_with_momentum(value, learning_rate, grad.view(), momentum, velocity);
        } else {
            sgd_update(value, learning_rate, grad.view());
        }
        Ok(())
    }
}

fn sgd_update(value: ArrayViewMutD<f32>, learning_rate: f32, grad: ArrayViewD<f32>) {
    Zip::from(value).and(grad).for_each(|w, dw| {
        *w -= learning_rate * dw;
    });
}

fn sgd_update_with_momentum(
    value: ArrayViewMutD<f32>,
    learning_rate: f32,
    grad: ArrayViewD<f32>,
    momentum: f32,
    velocity: ArrayViewMutD<f32>,
) {
    Zip::from(value)
        .and(grad)
        .and(velocity)
        .for_each(|w, dw, v| {
            *v = momentum * *v + dw;
            *w -= learning_rate * *v;
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use ndarray::{arr1, Array1};

    fn parameter_with_grad(value: Array1<f32>) -> Result<Parameter<ndarray::Ix1>> {
        let mut parameter = Parameter::from(value);
        parameter.set_training(true);
        parameter.to_variable().node().unwrap().backward()?;
        Ok(parameter)
    }

    #[test]
    fn sgd() -> Result<()> {
        let mut parameter = parameter_with_grad(arr1(&[1., 2.]))?;
        let sgd = SGD::default();
        sgd.update(0.5, parameter.make_view_mut().into_dyn())?;
        assert_eq!(parameter.value(), &arr1(&[0.5, 1.5]));
        assert!(parameter.optimizer_state().unwrap().iter().next().is_none());
        Ok(())
    }

    #[test]
    fn sgd_momentum() -> Result<()> {
        let mut parameter = parameter_with_grad(arr1(&[1.]))?;
        let sgd = SGD::builder().momentum(0.5).build();
        sgd.update(0.1, parameter.make_view_mut().into_dyn())?;
        sgd.update(0.1, parameter.make_view_mut().into_dyn())?;
        // v1 = 1, v2 = 1.5
        approx::assert_relative_eq!(parameter.value()[0], 1. - 0.1 - 0.15);
        let state = parameter.optimizer_state().unwrap();
        assert_eq!(state.name(), "SGD");
        let (key, velocity) = state.iter().next().unwrap();
        assert_eq!(key, "velocity");
        approx::assert_relative_eq!(velocity[0], 1.5);
        Ok(())
    }

    #[test]
    fn sgd_without_grad_is_noop() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, 2.]));
        SGD::default().update(1., parameter.make_view_mut().into_dyn())?;
        assert_eq!(parameter.value(), &arr1(&[1., 2.]));
        Ok(())
    }
}
