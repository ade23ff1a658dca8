use super::{layer::Forward, optimizer::State as OptimizerState};
#[cfg(doc)]
use super::optimizer::Optimizer;
use anyhow::{ensure, format_err, Result};
use ndarray::{
    ArcArray, Array, ArrayD, ArrayView, ArrayViewMut, Dimension, IntoDimension, Ix0, Ix1, Ix2,
    Ix3, Ix4, IxDyn, ShapeError,
};
use parking_lot::{Mutex, RwLock};
use std::{
    any::TypeId,
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use anyhow::Result;
    /// # use ndarray::ArcArray2;
    /// # use lenet::learn::neural_network::autograd::{Variable, Variable2};
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcArray2<f32>| -> Result<ArcArray2<f32>> { todo!() });
    /// }
    /// let output_value: ArcArray2<f32> = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added.
        pub fn node(mut self) -> Self {
            self.grad.get_or_insert_with(GradLock::default);
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of `node`
        /// given the gradient of `self`.
        /// When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcArray<f32, D>) -> Result<ArcArray<f32, D2>> + Send + Sync + 'static,
        {
            let mut output_grad_lock = Some(self.grad.get_or_insert_with(GradLock::default).clone());
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || -> Result<()> {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock
                        .read()
                        .clone()
                        .ok_or_else(|| format_err!("{name}: output gradient not computed!"))?;
                    std::mem::drop(output_grad_lock);
                    let grad = (f)(grad.into_dimensionality()?)?;
                    ensure!(
                        grad.shape() == dim.slice(),
                        "{name}: expected gradient of shape {:?}, found {:?}!",
                        dim.slice(),
                        grad.shape()
                    );
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass, seeding the gradient with 1's.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcArray::ones(self.inner.dim.clone()).into_dimensionality()?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Edges are visited breadth first, a node is expanded once every edge into it has
    /// contributed its gradient. Does nothing if the gradient was already computed.
    pub fn backward_grad(&self, grad: ArcArray<f32, D>) -> Result<()> {
        ensure!(
            grad.shape() == self.inner.dim.slice(),
            "backward: expected gradient of shape {:?}, found {:?}!",
            self.inner.dim.slice(),
            grad.shape()
        );
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node);
                }
            }
        }
        Ok(())
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are arrays with an optional [`Node`] that stores a gradient. Operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables can be created from arrays via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 3 dimensions
pub type Variable3 = Variable<Ix3>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: Forward<Self>>(self, f: &F) -> Result<F::Output> {
        f.forward(self)
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Variable {
            value: self.value.into_dimensionality()?,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dimensionality),
        }
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
}

fn standard_layout<D: Dimension>(array: ArcArray<f32, D>) -> ArcArray<f32, D> {
    if array.is_standard_layout() {
        array
    } else {
        array.as_standard_layout().into_owned().into_shared()
    }
}

impl<D: Dimension + 'static> Variable<D> {
    /// Converts into `shape`.
    ///
    /// **Errors**
    /// - The number of elements differs.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>, ShapeError>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(standard_layout(output_grad).into_shape(dim)?)
            });
        }
        Ok(builder.build(standard_layout(self.value).into_shape(shape)?))
    }
    /// Flattens the variable into \[batch, features\].
    pub fn flatten(self) -> Result<Variable2, ShapeError> {
        let batch = self.shape().first().copied().unwrap_or(1);
        let features = self.shape().iter().skip(1).product::<usize>();
        self.into_shape([batch, features])
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

/// Parameter.
///
/// Parameter values are updated during training by the [`Optimizer`]. A Parameter
/// can be converted to a [`Variable`] via [`.to_variable()`](Parameter::to_variable),
/// which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`].
/// A parameter stores the [`OptimizerState`] which can be updated during training
/// in [`Optimizer::update`].
#[derive(Clone)]
pub struct Parameter<D: Dimension> {
    value: ArcArray<f32, D>,
    grad: Option<GradLock>,
    optim_state: Option<OptimizerState>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 2 dimensions.
pub type Parameter2 = Parameter<Ix2>;
/// Parameter with 4 dimensions.
pub type Parameter4 = Parameter<Ix4>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Borrows the value of the parameter mutably.
    ///
    /// Copies the value if it is shared.
    pub fn value_view_mut(&mut self) -> ArrayViewMut<f32, D> {
        self.value.view_mut()
    }
    /// The gradient of the parameter.
    ///
    /// None unless training and a backward pass reached the parameter.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Whether training is enabled.
    pub fn training(&self) -> bool {
        self.grad.is_some()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient. Any previous gradient is cleared,
    /// gradients never accumulate across calls.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        self.grad = training.then(GradLock::default);
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optim_state.as_ref()
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Makes a mutable parameter view.
    ///
    /// Copies the value if it is shared.
    pub fn make_view_mut(&mut self) -> ParameterViewMut<D> {
        let grad = self.grad();
        let Self {
            value, optim_state, ..
        } = self;
        ParameterViewMut {
            value: value.view_mut(),
            grad,
            optim_state,
        }
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            optim_state: self.optim_state,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Parameter<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            grad: None,
            optim_state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("value", &self.value)
            .field("grad", &self.grad())
            .field("optim_state", &self.optim_state)
            .finish()
    }
}

/// Mutable parameter view.
///
/// Passed to [`Optimizer::update`]. See [`Parameter::make_view_mut`].
pub struct ParameterViewMut<'a, D: Dimension> {
    value: ArrayViewMut<'a, f32, D>,
    grad: Option<ArcArray<f32, D>>,
    optim_state: &'a mut Option<OptimizerState>,
}

/// Mutable parameter view with dynamic dimensions.
pub type ParameterViewMutD<'a> = ParameterViewMut<'a, IxDyn>;

impl<'a, D: Dimension> ParameterViewMut<'a, D> {
    /// The value of the parameter.
    pub fn value(&self) -> ArrayView<f32, D> {
        self.value.view()
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.grad.clone()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optim_state.as_ref()
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_view_optimizer_state_mut(
        &mut self,
    ) -> (ArrayViewMut<f32, D>, Option<&mut OptimizerState>) {
        (self.value.view_mut(), self.optim_state.as_mut())
    }
    /// Initializes the optimizer state.
    ///
    /// The `name` should be the name of the optimizer, for example "SGD".
    /// The `id` is the [`TypeId`] of the optimizer.
    ///
    /// **Errors**
    /// - A tensor value does not have the shape of the parameter.
    pub fn init_optimizer_state(
        &mut self,
        name: impl Into<String>,
        id: TypeId,
        key_values: impl IntoIterator<Item = (String, ArrayD<f32>)>,
    ) -> Result<()> {
        let state = OptimizerState::new(
            self.shape(),
            name.into(),
            id,
            key_values.into_iter().collect(),
        )?;
        self.optim_state.replace(state);
        Ok(())
    }
    /// Converts into a dynamic dimensional view.
    pub fn into_dyn(self) -> ParameterViewMutD<'a> {
        ParameterViewMut {
            value: self.value.into_dyn(),
            grad: self.grad.map(ArcArray::into_dyn),
            optim_state: self.optim_state,
        }
    }
}

impl<D: Dimension> Debug for ParameterViewMut<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParameterViewMut")
            .field("value", &self.value)
            .field("grad", &self.grad)
            .field("optim_state", &self.optim_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1, Array2};

    fn training_parameter(value: Array2<f32>) -> Parameter<Ix2> {
        let mut parameter = Parameter::from(value);
        parameter.set_training(true);
        parameter
    }

    #[test]
    fn into_shape_backward() -> Result<()> {
        let parameter = training_parameter(Array2::zeros([2, 3]));
        let y = parameter.to_variable().into_shape([6])?;
        y.node()
            .unwrap()
            .backward_grad(Array1::from_iter((0..6).map(|x| x as f32)).into_shared())?;
        let grad = parameter.grad().unwrap();
        assert_eq!(grad.shape(), &[2, 3]);
        assert_eq!(grad[(1, 0)], 3.);
        Ok(())
    }

    #[test]
    fn edges_accumulate() -> Result<()> {
        let parameter = training_parameter(Array2::zeros([1, 2]));
        let x = parameter.to_variable();
        // Diamond: a = x, b = 2x, y = a + b
        let mut builder = Variable::builder();
        builder.edge(x.node().unwrap(), |dy: ArcArray<f32, Ix2>| Ok(dy));
        let a = builder.build(x.value().clone());
        let mut builder = Variable::builder();
        builder.edge(x.node().unwrap(), |dy: ArcArray<f32, Ix2>| {
            Ok(dy.map(|dy| 2. * dy).into_shared())
        });
        let b = builder.build(x.value().clone());
        let mut builder = Variable::builder();
        builder.edge(a.node().unwrap(), |dy: ArcArray<f32, Ix2>| Ok(dy));
        builder.edge(b.node().unwrap(), |dy: ArcArray<f32, Ix2>| Ok(dy));
        let y = builder.build((a.value() + b.value()).into_shared());
        y.node().unwrap().backward()?;
        assert_eq!(parameter.grad().unwrap(), arr1(&[3., 3.]).into_shape([1, 2])?);
        Ok(())
    }

    #[test]
    fn set_training_clears_grad() -> Result<()> {
        let mut parameter = training_parameter(Array2::ones([2, 2]));
        parameter.to_variable().node().unwrap().backward()?;
        assert!(parameter.grad().is_some());
        parameter.set_training(true);
        assert!(parameter.grad().is_none());
        assert!(parameter.training());
        parameter.set_training(false);
        assert!(!parameter.training());
        assert!(parameter.to_variable().node().is_none());
        Ok(())
    }

    #[test]
    fn backward_checks_shape() {
        let parameter = training_parameter(Array2::zeros([2, 2]));
        let x = parameter.to_variable();
        assert!(x
            .node()
            .unwrap()
            .backward_grad(ArcArray::zeros([3, 2]))
            .is_err());
    }

    #[test]
    fn inference_has_no_node() -> Result<()> {
        let parameter = Parameter::from(Array2::<f32>::zeros([2, 2]));
        let y = parameter.to_variable().flatten()?;
        assert!(y.node().is_none());
        assert_eq!(y.shape(), &[2, 2]);
        Ok(())
    }
}
