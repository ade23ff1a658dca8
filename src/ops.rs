//! Host kernels for the convolution and pooling layers.
//!
//! Convolutions are lowered to matrix products with im2col / col2im. Each kernel works on
//! one sample at a time, on a [`Device`] with threads the samples of a batch are processed
//! in parallel.
use crate::device::Device;
use anyhow::{format_err, Result};
use ndarray::{
    Array2, Array3, Array4, ArrayBase, ArrayView2, ArrayView3, ArrayViewMut2, ArrayViewMut3, Data,
    Ix2, Ix4, Zip,
};

/// Options for [`Im2ColConv2`] and [`Col2ImConv2`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2Options {
    /// Filter height and width.
    pub filter: [usize; 2],
    /// Zero padding added to both sides of each spatial dimension.
    pub padding: [usize; 2],
    /// Strides.
    pub stride: [usize; 2],
}

impl Default for Conv2Options {
    fn default() -> Self {
        Self {
            filter: [1, 1],
            padding: [0, 0],
            stride: [1, 1],
        }
    }
}

impl Conv2Options {
    /// The spatial output shape for an input of `shape`.
    ///
    /// Returns None if the (padded) input is smaller than the filter.
    pub fn output_shape(&self, shape: [usize; 2]) -> Option<[usize; 2]> {
        let mut output = [0; 2];
        for (i, output) in output.iter_mut().enumerate() {
            let padded = shape[i] + 2 * self.padding[i];
            if self.filter[i] == 0 || self.stride[i] == 0 || padded < self.filter[i] {
                return None;
            }
            *output = (padded - self.filter[i]) / self.stride[i] + 1;
        }
        Some(output)
    }
}

/// Options for [`MaxPool2`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxPool2Options {
    /// Window height and width.
    pub size: [usize; 2],
    /// Strides.
    pub strides: [usize; 2],
}

impl Default for MaxPool2Options {
    fn default() -> Self {
        Self {
            size: [2, 2],
            strides: [2, 2],
        }
    }
}

impl MaxPool2Options {
    /// The spatial output shape for an input of `shape`.
    ///
    /// Partial windows are dropped, ie odd sizes are floored. Returns None if no window
    /// fits.
    pub fn output_shape(&self, shape: [usize; 2]) -> Option<[usize; 2]> {
        let mut output = [0; 2];
        for (i, output) in output.iter_mut().enumerate() {
            if self.size[i] == 0 || self.strides[i] == 0 || shape[i] < self.size[i] {
                return None;
            }
            *output = (shape[i] - self.size[i]) / self.strides[i] + 1;
        }
        Some(output)
    }
}

/// Unfolds the patches of a \[batch, channels, height, width\] input into rows.
pub trait Im2ColConv2 {
    /// The output.
    type Output;
    /// Output shape = \[batch * oh * ow, channels * fh * fw\].
    ///
    /// **Errors**
    /// - The filter does not fit into the (padded) input.
    fn im2col_conv2(&self, device: &Device, options: &Conv2Options) -> Result<Self::Output>;
}

/// The adjoint of [`Im2ColConv2`], sums the rows back into an image.
pub trait Col2ImConv2 {
    /// The output.
    type Output;
    /// `shape` is the \[batch, channels, height, width\] of the image.
    ///
    /// **Errors**
    /// - The rows do not match `shape` and `options`.
    fn col2im_conv2(
        &self,
        device: &Device,
        shape: [usize; 4],
        options: &Conv2Options,
    ) -> Result<Self::Output>;
}

/// Max pooling.
pub trait MaxPool2 {
    /// The output.
    type Output;
    /// Takes the max of each window, the first max wins ties.
    ///
    /// **Errors**
    /// - The window does not fit into the input.
    fn max_pool2(&self, device: &Device, options: &MaxPool2Options) -> Result<Self::Output>;
}

/// Backward pass of [`MaxPool2`].
pub trait MaxPool2Backward<G> {
    /// The output.
    type Output;
    /// Routes each output gradient to the position that was selected by the forward pass.
    ///
    /// **Errors**
    /// - `output_grad` does not match the pooled shape.
    fn max_pool2_backward(
        &self,
        device: &Device,
        output_grad: G,
        options: &MaxPool2Options,
    ) -> Result<Self::Output>;
}

impl<S: Data<Elem = f32>> Im2ColConv2 for ArrayBase<S, Ix4> {
    type Output = Array2<f32>;
    fn im2col_conv2(&self, device: &Device, options: &Conv2Options) -> Result<Self::Output> {
        let (bs, c, ih, iw) = self.dim();
        let [oh, ow] = options.output_shape([ih, iw]).ok_or_else(|| {
            format_err!("im2col_conv2: {options:?} incompatible with {:?}!", self.shape())
        })?;
        let Conv2Options {
            filter: [fh, fw],
            padding: [ph, pw],
            stride: [sh, sw],
        } = *options;
        let mut output = Array3::zeros([bs, oh * ow, c * fh * fw]);
        let im2col = |mut output: ArrayViewMut2<f32>, input: ArrayView3<f32>| {
            for (pid, mut row) in output.outer_iter_mut().enumerate() {
                let (hid, wid) = (pid / ow, pid % ow);
                for (cid, input) in input.outer_iter().enumerate() {
                    for fi in 0..fh {
                        let hidx = (hid * sh + fi) as isize - ph as isize;
                        if hidx < 0 || hidx >= ih as isize {
                            continue;
                        }
                        for fj in 0..fw {
                            let widx = (wid * sw + fj) as isize - pw as isize;
                            if widx >= 0 && widx < iw as isize {
                                row[(cid * fh + fi) * fw + fj] =
                                    input[(hidx as usize, widx as usize)];
                            }
                        }
                    }
                }
            }
        };
        let zip = Zip::from(output.outer_iter_mut()).and(self.outer_iter());
        if device.is_parallel() {
            device.install(|| zip.par_for_each(im2col));
        } else {
            zip.for_each(im2col);
        }
        Ok(output.into_shape([bs * oh * ow, c * fh * fw])?)
    }
}

impl<S: Data<Elem = f32>> Col2ImConv2 for ArrayBase<S, Ix2> {
    type Output = Array4<f32>;
    fn col2im_conv2(
        &self,
        device: &Device,
        shape: [usize; 4],
        options: &Conv2Options,
    ) -> Result<Self::Output> {
        let [bs, c, ih, iw] = shape;
        let [oh, ow] = options.output_shape([ih, iw]).ok_or_else(|| {
            format_err!("col2im_conv2: {options:?} incompatible with {shape:?}!")
        })?;
        let Conv2Options {
            filter: [fh, fw],
            padding: [ph, pw],
            stride: [sh, sw],
        } = *options;
        let expected = (bs * oh * ow, c * fh * fw);
        if self.dim() != expected {
            return Err(format_err!(
                "col2im_conv2: expected rows {expected:?}, found {:?}!",
                self.dim()
            ));
        }
        let input = self.as_standard_layout();
        let input = input.view().into_shape([bs, oh * ow, c * fh * fw])?;
        let mut output = Array4::zeros(shape);
        let col2im = |mut output: ArrayViewMut3<f32>, input: ArrayView2<f32>| {
            for (pid, row) in input.outer_iter().enumerate() {
                let (hid, wid) = (pid / ow, pid % ow);
                for (cid, mut output) in output.outer_iter_mut().enumerate() {
                    for fi in 0..fh {
                        let hidx = (hid * sh + fi) as isize - ph as isize;
                        if hidx < 0 || hidx >= ih as isize {
                            continue;
                        }
                        for fj in 0..fw {
                            let widx = (wid * sw + fj) as isize - pw as isize;
                            if widx >= 0 && widx < iw as isize {
                                output[(hidx as usize, widx as usize)] +=
                                    row[(cid * fh + fi) * fw + fj];
                            }
                        }
                    }
                }
            }
        };
        let zip = Zip::from(output.outer_iter_mut()).and(input.outer_iter());
        if device.is_parallel() {
            device.install(|| zip.par_for_each(col2im));
        } else {
            zip.for_each(col2im);
        }
        Ok(output)
    }
}

// Index of the first max within the window at (row, col).
fn window_argmax(
    input: &ArrayView2<f32>,
    row: usize,
    col: usize,
    options: &MaxPool2Options,
) -> (usize, usize) {
    let MaxPool2Options {
        size: [h, w],
        strides: [sh, sw],
    } = *options;
    let (mut mi, mut mj) = (row * sh, col * sw);
    let mut m = input[(mi, mj)];
    for i in 0..h {
        for j in 0..w {
            let x = input[(row * sh + i, col * sw + j)];
            if x > m {
                m = x;
                mi = row * sh + i;
                mj = col * sw + j;
            }
        }
    }
    (mi, mj)
}

impl<S: Data<Elem = f32>> MaxPool2 for ArrayBase<S, Ix4> {
    type Output = Array4<f32>;
    fn max_pool2(&self, device: &Device, options: &MaxPool2Options) -> Result<Self::Output> {
        let (bs, c, ih, iw) = self.dim();
        let [oh, ow] = options.output_shape([ih, iw]).ok_or_else(|| {
            format_err!("max_pool2: {options:?} incompatible with {:?}!", self.shape())
        })?;
        let mut output = Array4::zeros([bs, c, oh, ow]);
        let pool = |mut output: ArrayViewMut3<f32>, input: ArrayView3<f32>| {
            for (mut y, x) in output.outer_iter_mut().zip(input.outer_iter()) {
                for ((row, col), y) in y.indexed_iter_mut() {
                    *y = x[window_argmax(&x, row, col, options)];
                }
            }
        };
        let zip = Zip::from(output.outer_iter_mut()).and(self.outer_iter());
        if device.is_parallel() {
            device.install(|| zip.par_for_each(pool));
        } else {
            zip.for_each(pool);
        }
        Ok(output)
    }
}

impl<S1: Data<Elem = f32>, S2: Data<Elem = f32>> MaxPool2Backward<ArrayBase<S2, Ix4>>
    for ArrayBase<S1, Ix4>
{
    type Output = Array4<f32>;
    fn max_pool2_backward(
        &self,
        device: &Device,
        output_grad: ArrayBase<S2, Ix4>,
        options: &MaxPool2Options,
    ) -> Result<Self::Output> {
        let (bs, c, ih, iw) = self.dim();
        let [oh, ow] = options.output_shape([ih, iw]).ok_or_else(|| {
            format_err!("max_pool2_backward: {options:?} incompatible with {:?}!", self.shape())
        })?;
        if output_grad.dim() != (bs, c, oh, ow) {
            return Err(format_err!(
                "max_pool2_backward: expected output_grad {:?}, found {:?}!",
                [bs, c, oh, ow],
                output_grad.shape()
            ));
        }
        let mut input_grad = Array4::zeros(self.raw_dim());
        let route = |mut dx: ArrayViewMut3<f32>, x: ArrayView3<f32>, dy: ArrayView3<f32>| {
            for ((mut dx, x), dy) in dx.outer_iter_mut().zip(x.outer_iter()).zip(dy.outer_iter()) {
                for ((row, col), dy) in dy.indexed_iter() {
                    dx[window_argmax(&x, row, col, options)] += *dy;
                }
            }
        };
        let zip = Zip::from(input_grad.outer_iter_mut())
            .and(self.outer_iter())
            .and(output_grad.outer_iter());
        if device.is_parallel() {
            device.install(|| zip.par_for_each(route));
        } else {
            zip.for_each(route);
        }
        Ok(input_grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array1};

    fn iota4(shape: [usize; 4]) -> Array4<f32> {
        let len = shape.iter().product::<usize>();
        Array::from_iter((0..len).map(|x| ((x * 7) % 11) as f32 - 5.))
            .into_shape(shape)
            .unwrap()
    }

    fn conv2_naive(x: &Array4<f32>, w: &Array4<f32>, options: &Conv2Options) -> Array4<f32> {
        let (bs, c, ih, iw) = x.dim();
        let (oc, _, fh, fw) = w.dim();
        let [oh, ow] = options.output_shape([ih, iw]).unwrap();
        let [ph, pw] = options.padding;
        let [sh, sw] = options.stride;
        let mut y = Array4::zeros([bs, oc, oh, ow]);
        for ((b, o, r, s), y) in y.indexed_iter_mut() {
            for ci in 0..c {
                for fi in 0..fh {
                    for fj in 0..fw {
                        let hi = (r * sh + fi) as isize - ph as isize;
                        let wi = (s * sw + fj) as isize - pw as isize;
                        if hi >= 0 && hi < ih as isize && wi >= 0 && wi < iw as isize {
                            *y += x[(b, ci, hi as usize, wi as usize)] * w[(o, ci, fi, fj)];
                        }
                    }
                }
            }
        }
        y
    }

    #[test]
    fn conv2_output_shape() {
        let options = Conv2Options {
            filter: [5, 5],
            ..Default::default()
        };
        assert_eq!(options.output_shape([28, 28]), Some([24, 24]));
        assert_eq!(options.output_shape([4, 4]), None);
        let padded = Conv2Options {
            padding: [2, 2],
            ..options
        };
        assert_eq!(padded.output_shape([28, 28]), Some([28, 28]));
    }

    #[test]
    fn max_pool2_output_shape_floors() {
        let options = MaxPool2Options::default();
        assert_eq!(options.output_shape([24, 24]), Some([12, 12]));
        assert_eq!(options.output_shape([5, 5]), Some([2, 2]));
        assert_eq!(options.output_shape([1, 4]), None);
    }

    fn im2col_matches_naive_conv(device: &Device, options: Conv2Options) {
        let x = iota4([2, 3, 7, 6]);
        let w = iota4([4, 3, 3, 3]).map(|x| x * 0.1);
        let [oh, ow] = options.output_shape([7, 6]).unwrap();
        let cols = x.im2col_conv2(device, &options).unwrap();
        let y = cols
            .dot(&w.clone().into_shape([4, 27]).unwrap().t())
            .into_shape([2, oh, ow, 4])
            .unwrap()
            .permuted_axes([0, 3, 1, 2]);
        let y_true = conv2_naive(&x, &w, &options);
        approx::assert_abs_diff_eq!(y, y_true, epsilon = 1e-4);
    }

    #[test]
    fn im2col_conv2() {
        let options = Conv2Options {
            filter: [3, 3],
            ..Default::default()
        };
        im2col_matches_naive_conv(&Device::host(), options);
    }

    #[test]
    fn im2col_conv2_padding_stride_parallel() {
        let device = Device::builder().threads(2).build().unwrap();
        let options = Conv2Options {
            filter: [3, 3],
            padding: [1, 1],
            stride: [2, 1],
        };
        im2col_matches_naive_conv(&Device::host(), options);
        im2col_matches_naive_conv(&device, options);
    }

    #[test]
    fn col2im_conv2_is_adjoint() {
        let device = Device::host();
        let options = Conv2Options {
            filter: [3, 2],
            padding: [1, 0],
            stride: [1, 2],
        };
        let x = iota4([2, 2, 5, 6]);
        let cols = x.im2col_conv2(&device, &options).unwrap();
        let y = Array1::from_iter((0..cols.len()).map(|i| (i % 5) as f32 - 2.))
            .into_shape(cols.raw_dim())
            .unwrap();
        let x_grad = y.col2im_conv2(&device, [2, 2, 5, 6], &options).unwrap();
        let lhs = (&cols * &y).sum();
        let rhs = (&x * &x_grad).sum();
        approx::assert_relative_eq!(lhs, rhs, max_relative = 1e-5);
    }

    #[test]
    fn col2im_conv2_checks_rows() {
        let options = Conv2Options {
            filter: [3, 3],
            ..Default::default()
        };
        let cols = Array2::<f32>::zeros([10, 9]);
        assert!(cols
            .col2im_conv2(&Device::host(), [1, 1, 5, 5], &options)
            .is_err());
    }

    #[test]
    fn max_pool2_forward_backward() {
        let device = Device::builder().threads(2).build().unwrap();
        let x = Array::from_shape_vec(
            [1, 1, 2, 4],
            vec![1., 3., 2., 2., 4., -1., 0., 1.],
        )
        .unwrap();
        let options = MaxPool2Options::default();
        let y = x.max_pool2(&device, &options).unwrap();
        assert_eq!(y.into_raw_vec(), vec![4., 2.]);
        let dy = Array::from_shape_vec([1, 1, 1, 2], vec![10., 20.]).unwrap();
        let dx = x.max_pool2_backward(&device, dy, &options).unwrap();
        // The tie at [2, 2] goes to the first element.
        assert_eq!(dx.into_raw_vec(), vec![0., 0., 20., 0., 10., 0., 0., 0.]);
    }
}
