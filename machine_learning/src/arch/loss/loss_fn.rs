use ndarray::{Array2, ArrayView2};

/// A differentiable loss over a batch of predictions, one sample per row.
pub trait LossFn {
    /// Returns the loss of `y_pred` with respect to the expected `y`.
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32;

    /// Returns the derivative of the loss with respect to each entry of `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32>;
}
