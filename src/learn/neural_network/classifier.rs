use super::{
    autograd::{ParameterD, ParameterViewMutD, Variable2, Variable4},
    layer::{Conv2, Dense, Forward, Layer, MaxPool2, Relu},
};
use crate::{
    device::Device,
    error::Error,
    init::Init,
    ops::{Conv2Options, MaxPool2Options},
};
use anyhow::{ensure, Result};

/// Classifier builders.
pub mod builders {
    use super::*;

    /// Builder for creating a [`Lenet5`].
    #[derive(Debug, Clone)]
    pub struct Lenet5Builder {
        pub(super) device: Device,
        pub(super) input_shape: [usize; 3],
        pub(super) classes: usize,
        pub(super) filter: usize,
        pub(super) padding: usize,
        pub(super) hidden: [usize; 2],
        pub(super) init: Init,
        pub(super) seed: Option<u64>,
    }

    impl Default for Lenet5Builder {
        fn default() -> Self {
            Self {
                device: Device::host(),
                input_shape: [1, 28, 28],
                classes: 10,
                filter: 5,
                padding: 0,
                hidden: [120, 84],
                init: Init::default(),
                seed: None,
            }
        }
    }

    impl Lenet5Builder {
        /// Sets the device, defaults to the host.
        pub fn device(self, device: Device) -> Self {
            Self { device, ..self }
        }
        /// The input shape \[channels, height, width\]. Defaults to \[1, 28, 28\].
        pub fn input_shape(self, input_shape: [usize; 3]) -> Self {
            Self {
                input_shape,
                ..self
            }
        }
        /// The number of classes. Defaults to 10.
        pub fn classes(self, classes: usize) -> Self {
            Self { classes, ..self }
        }
        /// The square filter size of both convolutions. Defaults to 5.
        pub fn filter(self, filter: usize) -> Self {
            Self { filter, ..self }
        }
        /// Zero padding of both convolutions. Defaults to 0.
        pub fn padding(self, padding: usize) -> Self {
            Self { padding, ..self }
        }
        /// The outputs of the hidden dense layers. Defaults to \[120, 84\].
        pub fn hidden(self, hidden: [usize; 2]) -> Self {
            Self { hidden, ..self }
        }
        /// Weight initialization. Defaults to [`Init::HeNormal`].
        pub fn init(self, init: Init) -> Self {
            Self { init, ..self }
        }
        /// Seed for initialization. If None, seeded from entropy.
        pub fn seed(self, seed: Option<u64>) -> Self {
            Self { seed, ..self }
        }
        /// Builds the classifier.
        ///
        /// **Errors**
        /// - [`Error::Shape`] if the input shape does not fit through the convolutions and
        /// pools.
        /// - A size is 0.
        pub fn build(self) -> Result<Lenet5> {
            Lenet5::build(self)
        }
    }
}
use builders::Lenet5Builder;

/// A LeNet-5 style classifier.
///
/// conv1 (6, ReLU) -> pool1 -> conv2 (16, ReLU) -> pool2 -> flatten -> dense1 (ReLU) ->
/// dense2 (ReLU) -> dense3. Maps \[batch, channels, height, width\] images to
/// \[batch, classes\] logits.
#[derive(Debug, Clone)]
pub struct Lenet5 {
    conv1: Conv2<Relu>,
    pool1: MaxPool2,
    conv2: Conv2<Relu>,
    pool2: MaxPool2,
    dense1: Dense<Relu>,
    dense2: Dense<Relu>,
    dense3: Dense,
}

impl Lenet5 {
    /// Returns a builder for creating a [`Lenet5`].
    pub fn builder() -> Lenet5Builder {
        Lenet5Builder::default()
    }
    fn build(builder: Lenet5Builder) -> Result<Self> {
        let Lenet5Builder {
            device,
            input_shape,
            classes,
            filter,
            padding,
            hidden,
            init,
            seed,
        } = builder;
        let [channels, height, width] = input_shape;
        ensure!(
            channels > 0 && classes > 0 && filter > 0,
            "Lenet5: channels ({channels}), classes ({classes}) and filter ({filter}) must be positive!"
        );
        let conv_options = Conv2Options {
            filter: [filter, filter],
            padding: [padding, padding],
            ..Conv2Options::default()
        };
        let pool_options = MaxPool2Options::default();
        let mut spatial = [height, width];
        for stage in ["conv1", "pool1", "conv2", "pool2"] {
            let next = if stage.starts_with("conv") {
                conv_options.output_shape(spatial)
            } else {
                pool_options.output_shape(spatial)
            };
            spatial = next.ok_or_else(|| {
                Error::shape(
                    "Lenet5",
                    &input_shape,
                    format!("the spatial size is {spatial:?} at {stage}"),
                )
            })?;
        }
        let features = 16 * spatial[0] * spatial[1];
        // Each layer draws from its own stream so that layers do not share a sequence.
        let layer_seed = |i: u64| seed.map(|seed| seed.wrapping_mul(8).wrapping_add(i));
        let conv = |inputs, outputs, i| {
            Conv2::builder()
                .device(device.clone())
                .inputs(inputs)
                .outputs(outputs)
                .filter(conv_options.filter)
                .padding(conv_options.padding)
                .bias(true)
                .init(init)
                .seed(layer_seed(i))
                .activation(Relu)
                .build()
        };
        let pool = || {
            MaxPool2::builder()
                .device(device.clone())
                .size(pool_options.size)
                .strides(pool_options.strides)
                .build()
        };
        let conv1 = conv(channels, 6, 0)?;
        let pool1 = pool();
        let conv2 = conv(6, 16, 1)?;
        let pool2 = pool();
        let dense1 = Dense::builder()
            .inputs(features)
            .outputs(hidden[0])
            .bias(true)
            .init(init)
            .seed(layer_seed(2))
            .activation(Relu)
            .build()?;
        let dense2 = Dense::builder()
            .inputs(hidden[0])
            .outputs(hidden[1])
            .bias(true)
            .init(init)
            .seed(layer_seed(3))
            .activation(Relu)
            .build()?;
        let dense3 = Dense::builder()
            .inputs(hidden[1])
            .outputs(classes)
            .bias(true)
            .init(init)
            .seed(layer_seed(4))
            .build()?;
        Ok(Self {
            conv1,
            pool1,
            conv2,
            pool2,
            dense1,
            dense2,
            dense3,
        })
    }
    /// The number of input channels.
    pub fn inputs(&self) -> usize {
        self.conv1.inputs()
    }
    /// The number of classes.
    pub fn classes(&self) -> usize {
        self.dense3.outputs()
    }
    /// The number of features after flattening, the inputs of dense1.
    pub fn features(&self) -> usize {
        self.dense1.inputs()
    }
    /// The parameters with their names, ie "conv1.weight".
    pub fn named_parameters(&self) -> Vec<(String, ParameterD)> {
        let mut named = Vec::new();
        let mut push = |layer: &str, parameters: Vec<ParameterD>| {
            for (parameter, name) in parameters.into_iter().zip(["weight", "bias"]) {
                named.push((format!("{layer}.{name}"), parameter));
            }
        };
        push("conv1", self.conv1.parameters());
        push("conv2", self.conv2.parameters());
        push("dense1", self.dense1.parameters());
        push("dense2", self.dense2.parameters());
        push("dense3", self.dense3.parameters());
        named
    }
}

impl Layer for Lenet5 {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.conv1.set_training(training)?;
        self.conv2.set_training(training)?;
        self.dense1.set_training(training)?;
        self.dense2.set_training(training)?;
        self.dense3.set_training(training)?;
        Ok(())
    }
    fn parameters(&self) -> Vec<ParameterD> {
        self.conv1
            .parameters()
            .into_iter()
            .chain(self.conv2.parameters())
            .chain(self.dense1.parameters())
            .chain(self.dense2.parameters())
            .chain(self.dense3.parameters())
            .collect()
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        Ok(self
            .conv1
            .parameters_mut()?
            .into_iter()
            .chain(self.conv2.parameters_mut()?)
            .chain(self.dense1.parameters_mut()?)
            .chain(self.dense2.parameters_mut()?)
            .chain(self.dense3.parameters_mut()?)
            .collect())
    }
}

impl Forward<Variable4> for Lenet5 {
    type Output = Variable2;
    fn forward(&self, input: Variable4) -> Result<Self::Output> {
        let Self {
            conv1,
            pool1,
            conv2,
            pool2,
            dense1,
            dense2,
            dense3,
        } = self;
        input
            .forward(conv1)?
            .forward(pool1)?
            .forward(conv2)?
            .forward(pool2)?
            .flatten()?
            .forward(dense1)?
            .forward(dense2)?
            .forward(dense3)
    }
}
