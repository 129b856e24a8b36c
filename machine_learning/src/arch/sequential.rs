use ndarray::{Array2, ArrayView2};

use super::{Model, layers::Layer, loss::LossFn};
use crate::{MlErr, Result, optimization::Optimizer};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
#[derive(Clone, Debug)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Makes a forward pass through the network, keeping each layer's metadata.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `x` - The input data.
    ///
    /// # Returns
    /// The output of the last layer or an error if occurred.
    pub fn forward<'x>(
        &'x mut self,
        params: &[f32],
        mut x: ArrayView2<'x, f32>,
    ) -> Result<ArrayView2<'x, f32>> {
        self.check_params(params.len())?;
        let mut offset = 0;

        for layer in self.layers.iter_mut() {
            let size = layer.size();
            x = layer.forward(&params[offset..offset + size], x)?;
            offset += size;
        }

        Ok(x)
    }

    fn check_params(&self, got: usize) -> Result<()> {
        let expected = self.size();
        if got != expected {
            return Err(MlErr::SizeMismatch {
                what: "model parameters",
                got,
                expected,
            });
        }

        Ok(())
    }
}

impl Model for Sequential {
    fn size(&self) -> usize {
        self.layers.iter().map(|layer| layer.size()).sum()
    }

    fn predict(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_params(params.len())?;

        let mut offset = 0;
        let mut out = x.to_owned();

        for layer in &self.layers {
            let size = layer.size();
            out = layer.infer(&params[offset..offset + size], out.view())?;
            offset += size;
        }

        Ok(out)
    }

    // NOTE: the returned loss is the mean of each batch's loss measured before its update, not a
    // second pass over the data with the final parameters.
    fn backprop<'a, O, L, I>(
        &mut self,
        params: &mut [f32],
        grad: &mut [f32],
        optimizer: &mut O,
        loss_fn: &L,
        batches: I,
    ) -> Result<f32>
    where
        O: Optimizer,
        L: LossFn,
        I: Iterator<Item = (ArrayView2<'a, f32>, ArrayView2<'a, f32>)>,
    {
        let total = self.size();
        if grad.len() != total {
            return Err(MlErr::SizeMismatch {
                what: "gradient buffer",
                got: grad.len(),
                expected: total,
            });
        }

        let mut total_loss = 0.0;
        let mut num_batches = 0;

        for (x, y) in batches {
            grad.fill(0.);

            let y_pred = self.forward(params, x)?;
            total_loss += loss_fn.loss(y_pred, y);
            num_batches += 1;

            let mut d_last = loss_fn.loss_prime(y_pred, y);
            let mut d = d_last.view_mut();
            let mut end = total;

            for layer in self.layers.iter_mut().rev() {
                let start = end - layer.size();
                d = layer.backward(&params[start..end], &mut grad[start..end], d)?;
                end = start;
            }

            optimizer.update_params(grad, params)?;
        }

        if num_batches == 0 {
            return Err(MlErr::EmptyDataset);
        }

        Ok(total_loss / num_batches as f32)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{arch::loss::CrossEntropy, optimization::GradientDescent};

    fn two_layers() -> Sequential {
        Sequential::new([Layer::dense((2, 2), None), Layer::dense((2, 1), None)])
    }

    #[test]
    fn size_adds_up_every_layer() {
        assert_eq!(two_layers().size(), 6 + 3);
    }

    #[test]
    fn predict_matches_forward() {
        let mut model = two_layers();
        let params: Vec<f32> = (0..9).map(|i| i as f32 * 0.1).collect();
        let x = array![[1., -1.], [0.5, 2.]];

        let predicted = model.predict(&params, x.view()).unwrap();
        let forwarded = model.forward(&params, x.view()).unwrap().to_owned();
        assert_eq!(predicted, forwarded);
    }

    #[test]
    fn backprop_lowers_the_loss() {
        let mut model = Sequential::new([Layer::dense((1, 2), None)]);
        let mut params = vec![0.; 4];
        let mut grad = vec![0.; 4];
        let mut optimizer = GradientDescent::new(0.5);

        let x = array![[1.]];
        let y = array![[1., 0.]];

        let mut losses = Vec::new();
        for _ in 0..50 {
            let batches = std::iter::once((x.view(), y.view()));
            let loss = model
                .backprop(&mut params, &mut grad, &mut optimizer, &CrossEntropy, batches)
                .unwrap();
            losses.push(loss);
        }

        assert!(losses[49] < losses[0] * 0.2);

        let logits = model.predict(&params, x.view()).unwrap();
        assert!(logits[[0, 0]] > logits[[0, 1]]);
    }

    #[test]
    fn wrong_parameter_count_is_rejected() {
        let model = two_layers();
        let x = array![[1., 1.]];

        let err = model.predict(&[0.; 4], x.view()).unwrap_err();
        assert!(matches!(err, MlErr::SizeMismatch { what: "model parameters", .. }));
    }
}
