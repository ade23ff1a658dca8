//! Loss functions and metrics.
use crate::{
    error::Error,
    learn::neural_network::autograd::{Variable0, Variable2},
};
use anyhow::Result;
use ndarray::{
    arr0, ArcArray, ArcArray1, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix0, Ix1, Ix2,
};

/// Criterion.
///
/// Evaluates `input` (logits) against `target` (class labels).
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates the criterion.
    ///
    /// **Errors**
    /// - [`Error::Shape`] if the batch is empty or the number of labels differs.
    /// - [`Error::LabelRange`] if a label is not less than the number of classes.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

fn check_targets(
    criterion: &'static str,
    input: &ArrayView2<f32>,
    target: &ArrayView1<usize>,
) -> Result<()> {
    let (batch_size, classes) = input.dim();
    if batch_size == 0 || classes == 0 {
        return Err(Error::shape(criterion, input.shape(), "the logits are empty").into());
    }
    if target.len() != batch_size {
        return Err(Error::shape(
            criterion,
            input.shape(),
            format!("found {} labels", target.len()),
        )
        .into());
    }
    if let Some((index, label)) = target
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
    Ok(())
}

/// Accuracy.
///
/// Evaluates to the number of rows whose argmax equals the label. On ties the lowest
/// index wins.
#[derive(Default, Debug, Clone, Copy)]
pub struct Accuracy;

impl<S1: Data<Elem = f32>, S2: Data<Elem = usize>>
    Criterion<ArrayBase<S1, Ix2>, ArrayBase<S2, Ix1>> for Accuracy
{
    type Output = usize;
    fn eval(&self, input: ArrayBase<S1, Ix2>, target: ArrayBase<S2, Ix1>) -> Result<Self::Output> {
        let (input, target) = (input.view(), target.view());
        check_targets("Accuracy", &input, &target)?;
        Ok(accuracy_host(input, target))
    }
}

fn argmax(x: ArrayView1<f32>) -> usize {
    let mut max = x[0];
    let mut max_index = 0;
    for (i, x) in x.iter().copied().enumerate() {
        if x > max {
            max = x;
            max_index = i;
        }
    }
    max_index
}

fn accuracy_host(input: ArrayView2<f32>, target: ArrayView1<usize>) -> usize {
    input
        .outer_iter()
        .zip(target.iter().copied())
        .filter(|(input, class)| argmax(input.view()) == *class)
        .count()
}

/// The fraction of rows of `logits` whose argmax equals the label, in \[0, 1\].
///
/// **Errors**
///
/// See [`Criterion::eval()`].
pub fn accuracy<S1: Data<Elem = f32>, S2: Data<Elem = usize>>(
    logits: &ArrayBase<S1, Ix2>,
    labels: &ArrayBase<S2, Ix1>,
) -> Result<f32> {
    let correct = Accuracy.eval(logits.view(), labels.view())?;
    Ok(correct as f32 / labels.len() as f32)
}

/// Cross entropy loss.
///
/// Fuses softmax and negative log likelihood. For each row the loss is
/// `m + ln(sum(exp(x - m))) - x[t]` where `m` is the max of the row, the batch loss is the
/// mean over rows. The gradient with respect to the logits is `(softmax(x) - onehot(t)) / batch`.
#[derive(Default, Debug, Clone, Copy)]
pub struct CrossEntropyLoss;

impl<S1: Data<Elem = f32>, S2: Data<Elem = usize>>
    Criterion<ArrayBase<S1, Ix2>, ArrayBase<S2, Ix1>> for CrossEntropyLoss
{
    type Output = f32;
    fn eval(&self, input: ArrayBase<S1, Ix2>, target: ArrayBase<S2, Ix1>) -> Result<Self::Output> {
        let (input, target) = (input.view(), target.view());
        check_targets("CrossEntropyLoss", &input, &target)?;
        Ok(cross_entropy_loss_host(input, target))
    }
}

impl Criterion<Variable2, ArcArray1<usize>> for CrossEntropyLoss {
    type Output = Variable0;
    fn eval(&self, input: Variable2, target: ArcArray1<usize>) -> Result<Self::Output> {
        let loss = self.eval(input.value().view(), target.view())?;
        let mut builder = Variable0::builder();
        if let Some(node) = input.node() {
            let input = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = output_grad[()];
                let input_grad = cross_entropy_loss_backward_host(input.view(), target.view(), dy);
                Ok(input_grad.into_shared())
            });
        }
        Ok(builder.build(arr0(loss).into_shared()))
    }
}

fn log_sum_exp(x: ArrayView1<f32>) -> (f32, f32) {
    let m = x.iter().copied().fold(x[0], f32::max);
    let s: f32 = x.iter().map(|x| (x - m).exp()).sum();
    (m, s)
}

fn cross_entropy_loss_host(input: ArrayView2<f32>, target: ArrayView1<usize>) -> f32 {
    let sum: f32 = input
        .outer_iter()
        .zip(target.iter().copied())
        .map(|(x, t)| {
            let (m, s) = log_sum_exp(x.view());
            s.ln() - (x[t] - m)
        })
        .sum();
    sum / input.nrows() as f32
}

fn cross_entropy_loss_backward_host(
    x: ArrayView2<f32>,
    t: ArrayView1<usize>,
    dy: f32,
) -> Array2<f32> {
    let mut dx = Array2::zeros(x.raw_dim());
    let scale = dy / x.nrows() as f32;
    for ((x, t), mut dx) in x
        .outer_iter()
        .zip(t.iter().copied())
        .zip(dx.outer_iter_mut())
    {
        let (m, s) = log_sum_exp(x.view());
        for (j, (x, dx)) in x.iter().copied().zip(dx.iter_mut()).enumerate() {
            let onehot = if j == t { 1. } else { 0. };
            *dx = scale * ((x - m).exp() / s - onehot);
        }
    }
    dx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Parameter;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn accuracy_ties_lowest_index() -> Result<()> {
        let x = arr2(&[[1f32, 1., 0.], [0., 2., 2.], [3., 0., 3.]]);
        let t = arr1(&[0usize, 2, 0]);
        assert_eq!(Accuracy.eval(x.view(), t.view())?, 2);
        assert_relative_eq!(accuracy(&x, &t)?, 2. / 3.);
        Ok(())
    }

    #[test]
    fn accuracy_all_correct() -> Result<()> {
        let x = arr2(&[[0f32, 5.], [5., 0.]]);
        assert_eq!(accuracy(&x, &arr1(&[1usize, 0]))?, 1.);
        assert_eq!(accuracy(&x, &arr1(&[0usize, 1]))?, 0.);
        Ok(())
    }

    #[test]
    fn cross_entropy_uniform_logits() -> Result<()> {
        let x = Array2::<f32>::zeros([4, 10]);
        let t = arr1(&[0usize, 3, 9, 5]);
        assert_relative_eq!(
            CrossEntropyLoss.eval(x, t)?,
            10f32.ln(),
            max_relative = 1e-6
        );
        Ok(())
    }

    #[test]
    fn cross_entropy_is_stable() -> Result<()> {
        let x = arr2(&[[1000f32, 0.], [-1000., 1000.]]);
        let loss = CrossEntropyLoss.eval(x, arr1(&[0usize, 1]))?;
        assert!(loss.is_finite());
        assert!(loss >= 0.);
        let loss = CrossEntropyLoss.eval(arr2(&[[0f32, 1000.]]), arr1(&[0usize]))?;
        assert_relative_eq!(loss, 1000., max_relative = 1e-6);
        Ok(())
    }

    #[test]
    fn cross_entropy_positive_for_finite_logits() -> Result<()> {
        let x = arr2(&[[2f32, -1., 0.5], [0.1, 0.2, 0.3]]);
        assert!(CrossEntropyLoss.eval(x, arr1(&[0usize, 2]))? > 0.);
        Ok(())
    }

    #[test]
    fn label_out_of_range() {
        let x = Array2::<f32>::zeros([2, 3]);
        let error = CrossEntropyLoss.eval(x.view(), arr1(&[1usize, 3])).unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::LabelRange {
                index: 1,
                label: 3,
                classes: 3
            })
        );
        assert!(Accuracy.eval(x.view(), arr1(&[7usize, 0])).is_err());
    }

    #[test]
    fn mismatched_labels() {
        let x = Array2::<f32>::zeros([2, 3]);
        let error = CrossEntropyLoss.eval(x, arr1(&[1usize])).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Shape { .. })
        ));
    }

    #[test]
    fn cross_entropy_backward() -> Result<()> {
        let mut parameter = Parameter::from(arr2(&[[1f32, 2., 3.], [0., 0., 0.]]));
        parameter.set_training(true);
        let target = arr1(&[2usize, 0]).into_shared();
        let loss = CrossEntropyLoss.eval(parameter.to_variable(), target)?;
        loss.backward()?;
        let grad = parameter.grad().unwrap();
        let s = 1f32.exp() + 2f32.exp() + 3f32.exp();
        assert_relative_eq!(grad[(0, 2)], (3f32.exp() / s - 1.) / 2., max_relative = 1e-5);
        assert_relative_eq!(grad[(1, 0)], (1. / 3. - 1.) / 2., max_relative = 1e-5);
        assert_relative_eq!(grad[(1, 1)], 1. / 6., max_relative = 1e-5);
        // Each row of the gradient sums to 0.
        for row in grad.outer_iter() {
            approx::assert_abs_diff_eq!(row.sum(), 0., epsilon = 1e-6);
        }
        Ok(())
    }
}
