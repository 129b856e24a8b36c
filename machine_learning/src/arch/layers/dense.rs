use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};

use crate::{MlErr, Result, arch::activations::ActFn};

/// A fully connected layer.
///
/// Its parameters live outside of it, in a flat slice laid out as the `dim.0 x dim.1`
/// weights matrix (row-major) followed by the `dim.1` biases.
#[derive(Clone, Debug)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,

    // Forward metadata
    x: Array2<f32>,
    z: Array2<f32>,
    a: Array2<f32>,

    // Backward metadata
    d: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The amount of inputs and outputs of the layer.
    /// * `act_fn` - The activation applied to the layer's output, if any.
    ///
    /// # Returns
    /// A new `Dense` instance.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        let zeros = Array2::zeros((0, 0));

        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
            act_fn,
            x: zeros.clone(),
            z: zeros.clone(),
            a: zeros.clone(),
            d: zeros,
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Computes the output of the layer without keeping any metadata for a later backward pass.
    ///
    /// # Arguments
    /// * `params` - The parameters of this layer.
    /// * `x` - The input batch, one sample per row.
    ///
    /// # Returns
    /// The layer's output or an error if the sizes don't match.
    pub fn infer(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_input(x.ncols())?;
        let (w, b) = self.view_params(params)?;

        let mut z = x.dot(&w);
        z += &b;

        if let Some(act_fn) = self.act_fn {
            z.mapv_inplace(|z| act_fn.f(z));
        }

        Ok(z)
    }

    /// Computes the output of the layer and stores what the backward pass needs.
    ///
    /// # Arguments
    /// * `params` - The parameters of this layer.
    /// * `x` - The input batch, one sample per row.
    ///
    /// # Returns
    /// A view of the layer's output or an error if the sizes don't match.
    pub fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<ArrayView2<'_, f32>> {
        self.check_input(x.ncols())?;
        let (w, b) = self.view_params(params)?;

        let mut z = x.dot(&w);
        z += &b;

        self.x = x.to_owned();
        self.a = match self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };
        self.z = z;

        Ok(self.a.view())
    }

    /// Propagates the deltas of this layer's output backwards, writing this layer's gradient.
    ///
    /// # Arguments
    /// * `params` - The parameters of this layer.
    /// * `grad` - The slice where this layer's gradient will be written.
    /// * `d` - The deltas with respect to this layer's output.
    ///
    /// # Returns
    /// The deltas with respect to this layer's input.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: ArrayViewMut2<f32>,
    ) -> Result<ArrayViewMut2<'_, f32>> {
        if d.dim() != self.z.dim() {
            return Err(MlErr::SizeMismatch {
                what: "dense deltas",
                got: d.len(),
                expected: self.z.len(),
            });
        }

        if let Some(act_fn) = self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let (w, _) = self.view_params(params)?;
        self.d = d.dot(&w.t());

        Ok(self.d.view_mut())
    }

    fn check_input(&self, ncols: usize) -> Result<()> {
        if ncols != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "dense input",
                got: ncols,
                expected: self.dim.0,
            });
        }

        Ok(())
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    ///
    /// # Arguments
    /// * `grad` - A gradient slice.
    ///
    /// # Returns
    /// A tuple containing the delta weights and delta biases.
    fn view_grad<'g>(
        &self,
        grad: &'g mut [f32],
    ) -> Result<(ArrayViewMut2<'g, f32>, ArrayViewMut1<'g, f32>)> {
        if grad.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense gradient",
                got: grad.len(),
                expected: self.size,
            });
        }

        let (dw_raw, db_raw) = grad.split_at_mut(self.size - self.dim.1);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).map_err(|_| self.shape_err())?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).map_err(|_| self.shape_err())?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    ///
    /// # Arguments
    /// * `params` - A slice of parameters.
    ///
    /// # Returns
    /// A tuple containing the weights and biases.
    fn view_params<'p>(
        &self,
        params: &'p [f32],
    ) -> Result<(ArrayView2<'p, f32>, ArrayView1<'p, f32>)> {
        if params.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense parameters",
                got: params.len(),
                expected: self.size,
            });
        }

        let (w_raw, b_raw) = params.split_at(self.size - self.dim.1);
        let w = ArrayView2::from_shape(self.dim, w_raw).map_err(|_| self.shape_err())?;
        let b = ArrayView1::from_shape(self.dim.1, b_raw).map_err(|_| self.shape_err())?;
        Ok((w, b))
    }

    fn shape_err(&self) -> MlErr {
        MlErr::SizeMismatch {
            what: "dense shape",
            got: self.size,
            expected: (self.dim.0 + 1) * self.dim.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    // 2 inputs, 2 outputs: w = [[1, 2], [3, 4]], b = [0.5, -0.5]
    const PARAMS: [f32; 6] = [1., 2., 3., 4., 0.5, -0.5];

    #[test]
    fn infer_and_forward_agree() {
        let mut layer = Dense::new((2, 2), None);
        let x = array![[1., 1.], [0., 2.]];

        let inferred = layer.infer(&PARAMS, x.view()).unwrap();
        let forwarded = layer.forward(&PARAMS, x.view()).unwrap().to_owned();

        assert_eq!(inferred, array![[4.5, 5.5], [6.5, 7.5]]);
        assert_eq!(inferred, forwarded);
    }

    #[test]
    fn backward_writes_the_gradient() {
        let mut layer = Dense::new((2, 2), None);
        let x = array![[1., 2.]];
        layer.forward(&PARAMS, x.view()).unwrap();

        let mut grad = [0.; 6];
        let mut d = array![[1., -1.]];
        let d_in = layer
            .backward(&PARAMS, &mut grad, d.view_mut())
            .unwrap()
            .to_owned();

        // dw = x^T d, db = d, d_in = d w^T
        assert_eq!(grad, [1., -1., 2., -2., 1., -1.]);
        assert_eq!(d_in, array![[-1., -1.]]);
    }

    #[test]
    fn mismatched_input_is_rejected() {
        let layer = Dense::new((3, 2), None);
        let x = array![[1., 1.]];

        let err = layer.infer(&[0.; 8], x.view()).unwrap_err();
        assert!(matches!(err, MlErr::SizeMismatch { what: "dense input", .. }));
    }
}
