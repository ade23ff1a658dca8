use super::autograd::{
    Parameter, Parameter1, Parameter2, Parameter4, ParameterD, ParameterViewMutD, Variable,
    Variable2, Variable4,
};
use crate::{
    device::Device,
    error::Error,
    init::{Init, Initializer},
    ops::{
        Col2ImConv2, Conv2Options, Im2ColConv2, MaxPool2 as _, MaxPool2Backward, MaxPool2Options,
    },
};
use anyhow::{ensure, Result};
use ndarray::{ArcArray, ArcArray2, Array1, Array2, Array4, Axis, Dimension, Ix4, Zip};
use rand::{rngs::SmallRng, SeedableRng};

/// Layer builders.
pub mod builder {
    use super::*;

    fn rng(seed: Option<u64>) -> SmallRng {
        seed.map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64)
    }

    /// Builder for creating a [`Conv2`].
    #[derive(Debug, Clone)]
    pub struct Conv2Builder<A = Identity> {
        device: Device,
        inputs: usize,
        outputs: usize,
        options: Conv2Options,
        bias: bool,
        init: Init,
        seed: Option<u64>,
        activation: A,
    }

    impl Conv2Builder {
        pub(super) fn new() -> Self {
            Self {
                device: Device::host(),
                inputs: 0,
                outputs: 0,
                options: Conv2Options::default(),
                bias: false,
                init: Init::default(),
                seed: None,
                activation: Identity,
            }
        }
    }

    impl<A> Conv2Builder<A> {
        /// Sets the device, defaults to the host.
        pub fn device(self, device: Device) -> Self {
            Self { device, ..self }
        }
        /// The number of input channels.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// The number of output channels.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// The filter size. Defaults to 1 x 1.
        pub fn filter(mut self, filter: [usize; 2]) -> Self {
            self.options.filter = filter;
            self
        }
        /// Zero padding. Defaults to 0.
        pub fn padding(mut self, padding: [usize; 2]) -> Self {
            self.options.padding = padding;
            self
        }
        /// Adds a bias, initialized with 0's. Defaults to false.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Weight initialization. Defaults to [`Init::HeNormal`].
        pub fn init(self, init: Init) -> Self {
            Self { init, ..self }
        }
        /// Seed for initialization. If None, the weight is seeded from entropy.
        pub fn seed(self, seed: Option<u64>) -> Self {
            Self { seed, ..self }
        }
        /// Activation applied to the output.
        pub fn activation<A2>(self, activation: A2) -> Conv2Builder<A2> {
            let Self {
                device,
                inputs,
                outputs,
                options,
                bias,
                init,
                seed,
                activation: _,
            } = self;
            Conv2Builder {
                device,
                inputs,
                outputs,
                options,
                bias,
                init,
                seed,
                activation,
            }
        }
        /// Builds the layer.
        ///
        /// **Errors**
        /// - `inputs`, `outputs` or the filter are 0.
        pub fn build(self) -> Result<Conv2<A>> {
            let Self {
                device,
                inputs,
                outputs,
                options,
                bias,
                init,
                seed,
                activation,
            } = self;
            let [fh, fw] = options.filter;
            ensure!(
                inputs > 0 && outputs > 0,
                "Conv2: inputs ({inputs}) and outputs ({outputs}) must be positive!"
            );
            ensure!(
                fh > 0 && fw > 0,
                "Conv2: filter {:?} must be positive!",
                options.filter
            );
            let mut weight = Array4::zeros([outputs, inputs, fh, fw]);
            init.fill(&mut weight.view_mut().into_dyn(), &mut rng(seed));
            let bias = bias.then(|| Parameter::from(Array1::zeros(outputs)));
            Ok(Conv2 {
                device,
                weight: weight.into(),
                bias,
                options,
                activation,
            })
        }
    }

    /// Builder for creating a [`Dense`].
    #[derive(Debug, Clone)]
    pub struct DenseBuilder<A = Identity> {
        inputs: usize,
        outputs: usize,
        bias: bool,
        init: Init,
        seed: Option<u64>,
        activation: A,
    }

    impl DenseBuilder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 0,
                outputs: 0,
                bias: false,
                init: Init::default(),
                seed: None,
                activation: Identity,
            }
        }
    }

    impl<A> DenseBuilder<A> {
        /// The number of input features.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// The number of outputs.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Adds a bias, initialized with 0's. Defaults to false.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Weight initialization. Defaults to [`Init::HeNormal`].
        pub fn init(self, init: Init) -> Self {
            Self { init, ..self }
        }
        /// Seed for initialization. If None, the weight is seeded from entropy.
        pub fn seed(self, seed: Option<u64>) -> Self {
            Self { seed, ..self }
        }
        /// Activation applied to the output.
        pub fn activation<A2>(self, activation: A2) -> DenseBuilder<A2> {
            let Self {
                inputs,
                outputs,
                bias,
                init,
                seed,
                activation: _,
            } = self;
            DenseBuilder {
                inputs,
                outputs,
                bias,
                init,
                seed,
                activation,
            }
        }
        /// Builds the layer.
        ///
        /// **Errors**
        /// - `inputs` or `outputs` are 0.
        pub fn build(self) -> Result<Dense<A>> {
            let Self {
                inputs,
                outputs,
                bias,
                init,
                seed,
                activation,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0,
                "Dense: inputs ({inputs}) and outputs ({outputs}) must be positive!"
            );
            let mut weight = Array2::zeros([outputs, inputs]);
            init.fill(&mut weight.view_mut().into_dyn(), &mut rng(seed));
            let bias = bias.then(|| Parameter::from(Array1::zeros(outputs)));
            Ok(Dense {
                weight: weight.into(),
                bias,
                activation,
            })
        }
    }

    /// Builder for creating a [`MaxPool2`].
    #[derive(Debug, Clone)]
    pub struct MaxPool2Builder {
        device: Device,
        options: MaxPool2Options,
    }

    impl MaxPool2Builder {
        pub(super) fn new() -> Self {
            Self {
                device: Device::host(),
                options: MaxPool2Options::default(),
            }
        }
        /// Sets the device, defaults to the host.
        pub fn device(self, device: Device) -> Self {
            Self { device, ..self }
        }
        /// The window size. Defaults to 2 x 2.
        pub fn size(mut self, size: [usize; 2]) -> Self {
            self.options.size = size;
            self
        }
        /// The strides. Defaults to 2 x 2.
        pub fn strides(mut self, strides: [usize; 2]) -> Self {
            self.options.strides = strides;
            self
        }
        /// Builds the layer.
        pub fn build(self) -> MaxPool2 {
            let Self { device, options } = self;
            MaxPool2 { device, options }
        }
    }
}
use builder::*;

/// Layer.
///
/// Layers own [`Parameter`]'s and implement [`Forward`]. Networks are composed of layers and
/// implement [`Layer`] by chaining the methods of their children.
pub trait Layer {
    /// Enables / disables training.
    ///
    /// See [`Parameter::set_training()`].
    fn set_training(&mut self, _training: bool) -> Result<()> {
        Ok(())
    }
    /// The parameters of the layer, including child layers.
    fn parameters(&self) -> Vec<ParameterD> {
        Vec::new()
    }
    /// Mutable views of the parameters, for the optimizer.
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        Ok(Vec::new())
    }
}

/// Forward.
///
/// Computes the output as a function of the input. When the input or the parameters have a
/// [`Node`](super::autograd::Node), the implementation adds edges for the backward pass via
/// [`Variable::builder()`].
pub trait Forward<X> {
    /// The output.
    type Output;
    /// Computes the forward pass.
    ///
    /// **Errors**
    ///
    /// Returns an error if the input is not compatible with the layer. Generally the
    /// implementation should return an error instead of panicking.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

/// Identity.
#[derive(Default, Debug, Clone, Copy)]
pub struct Identity;

impl Layer for Identity {}

impl<X> Forward<X> for Identity {
    type Output = X;
    fn forward(&self, input: X) -> Result<X> {
        Ok(input)
    }
}

/// ReLU activation, `max(x, 0)`.
#[derive(Default, Debug, Clone, Copy)]
pub struct Relu;

impl Layer for Relu {}

impl<D: Dimension + 'static> Forward<Variable<D>> for Relu {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Self::Output> {
        let output = input.value().map(|x| x.max(0.)).into_shared();
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let output = output.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, D>| {
                let mut input_grad = output_grad.into_owned();
                Zip::from(&mut input_grad).and(&output).for_each(|dx, y| {
                    if *y <= 0. {
                        *dx = 0.;
                    }
                });
                Ok(input_grad.into_shared())
            });
        }
        Ok(builder.build(output))
    }
}

/// Convolutional layer.
///
/// The weight has shape \[outputs, inputs, fh, fw\], the optional bias \[outputs\].
/// Computed with [`Im2ColConv2`] and a matrix product.
#[derive(Debug, Clone)]
pub struct Conv2<A = Identity> {
    device: Device,
    weight: Parameter4,
    bias: Option<Parameter1>,
    options: Conv2Options,
    activation: A,
}

impl Conv2 {
    /// Returns a builder for creating a [`Conv2`].
    pub fn builder() -> Conv2Builder {
        Conv2Builder::new()
    }
}

impl<A> Conv2<A> {
    /// The number of input channels.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1]
    }
    /// The number of output channels.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
    /// The options.
    pub fn options(&self) -> &Conv2Options {
        &self.options
    }
    /// The weight.
    pub fn weight(&self) -> &Parameter4 {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&Parameter1> {
        self.bias.as_ref()
    }
}

impl<A: Layer> Layer for Conv2<A> {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        if let Some(bias) = self.bias.as_mut() {
            bias.set_training(training);
        }
        self.activation.set_training(training)
    }
    fn parameters(&self) -> Vec<ParameterD> {
        std::iter::once(self.weight.clone().into_dyn())
            .chain(self.bias.clone().map(Parameter::into_dyn))
            .chain(self.activation.parameters())
            .collect()
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        let mut parameters = vec![self.weight.make_view_mut().into_dyn()];
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias.make_view_mut().into_dyn());
        }
        parameters.extend(self.activation.parameters_mut()?);
        Ok(parameters)
    }
}

// [batch, outputs, oh, ow] -> [batch * oh * ow, outputs]
fn conv2_output_grad_rows(output_grad: ArcArray<f32, Ix4>) -> Result<Array2<f32>> {
    let (bs, outputs, oh, ow) = output_grad.dim();
    Ok(output_grad
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape([bs * oh * ow, outputs])?)
}

impl<A: Forward<Variable4, Output = Variable4>> Forward<Variable4> for Conv2<A> {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Self::Output> {
        let (bs, c, ih, iw) = input.dim();
        let (outputs, inputs, fh, fw) = self.weight.value().dim();
        if bs == 0 {
            return Err(Error::shape("Conv2", input.shape(), "the batch is empty").into());
        }
        if c != inputs {
            return Err(Error::shape(
                "Conv2",
                input.shape(),
                format!("expected {inputs} channels"),
            )
            .into());
        }
        let [oh, ow] = self.options.output_shape([ih, iw]).ok_or_else(|| {
            Error::shape(
                "Conv2",
                input.shape(),
                format!("a {fh}x{fw} filter does not fit"),
            )
        })?;
        let weight = self.weight.to_variable();
        let bias = self.bias.as_ref().map(Parameter::to_variable);
        let cols = input
            .value()
            .im2col_conv2(&self.device, &self.options)?
            .into_shared();
        let weight_rows = weight
            .value()
            .clone()
            .into_shape([outputs, inputs * fh * fw])?;
        let mut output = cols.dot(&weight_rows.t());
        if let Some(bias) = bias.as_ref() {
            output += bias.value();
        }
        let output = output
            .into_shape([bs, oh, ow, outputs])?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let device = self.device.clone();
            let options = self.options;
            let weight_rows = weight_rows.clone();
            builder.edge(node, move |output_grad| {
                let output_grad = conv2_output_grad_rows(output_grad)?;
                let input_grad = output_grad.dot(&weight_rows).col2im_conv2(
                    &device,
                    [bs, c, ih, iw],
                    &options,
                )?;
                Ok(input_grad.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let cols = cols.clone();
            builder.edge(node, move |output_grad| {
                let output_grad = conv2_output_grad_rows(output_grad)?;
                Ok(output_grad
                    .t()
                    .dot(&cols)
                    .into_shape([outputs, inputs, fh, fw])?
                    .into_shared())
            });
        }
        if let Some(node) = bias.as_ref().and_then(|bias| bias.node()) {
            builder.edge(node, |output_grad| {
                let output_grad = conv2_output_grad_rows(output_grad)?;
                Ok(output_grad.sum_axis(Axis(0)).into_shared())
            });
        }
        builder.build(output.into_shared()).forward(&self.activation)
    }
}

/// Dense / fully connected layer.
///
/// The weight has shape \[outputs, inputs\], the optional bias \[outputs\].
#[derive(Debug, Clone)]
pub struct Dense<A = Identity> {
    weight: Parameter2,
    bias: Option<Parameter1>,
    activation: A,
}

impl Dense {
    /// Returns a builder for creating a [`Dense`].
    pub fn builder() -> DenseBuilder {
        DenseBuilder::new()
    }
}

impl<A> Dense<A> {
    /// The number of input features.
    pub fn inputs(&self) -> usize {
        self.weight.shape()[1]
    }
    /// The number of outputs.
    pub fn outputs(&self) -> usize {
        self.weight.shape()[0]
    }
    /// The weight.
    pub fn weight(&self) -> &Parameter2 {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&Parameter1> {
        self.bias.as_ref()
    }
}

impl<A: Layer> Layer for Dense<A> {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        if let Some(bias) = self.bias.as_mut() {
            bias.set_training(training);
        }
        self.activation.set_training(training)
    }
    fn parameters(&self) -> Vec<ParameterD> {
        std::iter::once(self.weight.clone().into_dyn())
            .chain(self.bias.clone().map(Parameter::into_dyn))
            .chain(self.activation.parameters())
            .collect()
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        let mut parameters = vec![self.weight.make_view_mut().into_dyn()];
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias.make_view_mut().into_dyn());
        }
        parameters.extend(self.activation.parameters_mut()?);
        Ok(parameters)
    }
}

impl<A: Forward<Variable2, Output = Variable2>> Forward<Variable2> for Dense<A> {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Self::Output> {
        let (batch, features) = input.dim();
        let inputs = self.inputs();
        if batch == 0 {
            return Err(Error::shape("Dense", input.shape(), "the batch is empty").into());
        }
        if features != inputs {
            return Err(Error::DimensionMismatch {
                layer: "Dense",
                expected: inputs,
                found: features,
            }
            .into());
        }
        let weight = self.weight.to_variable();
        let bias = self.bias.as_ref().map(Parameter::to_variable);
        let mut output = input.value().dot(&weight.value().t());
        if let Some(bias) = bias.as_ref() {
            output += bias.value();
        }
        let mut builder = Variable2::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            builder.edge(node, move |output_grad: ArcArray2<f32>| {
                Ok(output_grad.dot(&weight).into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let input = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray2<f32>| {
                Ok(output_grad.t().dot(&input).into_shared())
            });
        }
        if let Some(node) = bias.as_ref().and_then(|bias| bias.node()) {
            builder.edge(node, |output_grad: ArcArray2<f32>| {
                Ok(output_grad.sum_axis(Axis(0)).into_shared())
            });
        }
        builder.build(output.into_shared()).forward(&self.activation)
    }
}

/// Max pooling layer.
///
/// Partial windows at the edges are dropped (odd sizes are floored).
#[derive(Debug, Clone)]
pub struct MaxPool2 {
    device: Device,
    options: MaxPool2Options,
}

impl MaxPool2 {
    /// Returns a builder for creating a [`MaxPool2`].
    pub fn builder() -> MaxPool2Builder {
        MaxPool2Builder::new()
    }
    /// The options.
    pub fn options(&self) -> &MaxPool2Options {
        &self.options
    }
}

impl Layer for MaxPool2 {}

impl Forward<Variable4> for MaxPool2 {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Self::Output> {
        let (bs, _, ih, iw) = input.dim();
        if bs == 0 {
            return Err(Error::shape("MaxPool2", input.shape(), "the batch is empty").into());
        }
        if self.options.output_shape([ih, iw]).is_none() {
            return Err(Error::shape(
                "MaxPool2",
                input.shape(),
                format!("a {:?} window does not fit", self.options.size),
            )
            .into());
        }
        let output = input
            .value()
            .max_pool2(&self.device, &self.options)?
            .into_shared();
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let device = self.device.clone();
            let options = self.options;
            let input = input.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(input
                    .max_pool2_backward(&device, output_grad, &options)?
                    .into_shared())
            });
        }
        Ok(builder.build(output))
    }
}
