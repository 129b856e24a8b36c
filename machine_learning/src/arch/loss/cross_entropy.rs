use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;

/// Categorical cross entropy computed over the softmax of raw logits.
///
/// The model's last layer is expected to output logits, the softmax is folded into the loss so
/// that its derivative stays `softmax(z) - y`.
#[derive(Default, Clone, Copy, Debug)]
pub struct CrossEntropy;

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let rows = y_pred.nrows().max(1) as f32;
        let mut total = 0.;

        for (z, t) in y_pred.rows().into_iter().zip(y.rows()) {
            let max = z.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let log_sum = z.mapv(|v| (v - max).exp()).sum().ln() + max;

            total -= z
                .iter()
                .zip(t.iter())
                .map(|(&v, &t)| t * (v - log_sum))
                .sum::<f32>();
        }

        total / rows
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let rows = y_pred.nrows().max(1) as f32;
        (softmax_rows(y_pred) - &y) / rows
    }
}

/// Applies a numerically stable softmax to every row of `z`.
///
/// # Arguments
/// * `z` - The logits, one sample per row.
///
/// # Returns
/// A matrix of the same shape whose rows add up to one.
pub fn softmax_rows(z: ArrayView2<f32>) -> Array2<f32> {
    let mut out = z.to_owned();

    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());

        let sum = row.sum();
        if sum > 0. {
            row /= sum;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn softmax_rows_add_up_to_one() {
        let z = array![[1000., 1000., 1000.], [0., 3.007, 0.]];
        let probs = softmax_rows(z.view());

        for row in probs.rows() {
            assert!((row.sum() - 1.).abs() < 1e-5);
        }

        assert!((probs[[0, 0]] - 1. / 3.).abs() < 1e-5);
        assert!((probs[[1, 1]] - 0.91).abs() < 1e-3);
    }

    #[test]
    fn loss_prime_is_softmax_minus_target() {
        let z = array![[0., 0.]];
        let y = array![[1., 0.]];

        let d = CrossEntropy.loss_prime(z.view(), y.view());
        assert_eq!(d, array![[-0.5, 0.5]]);

        let loss = CrossEntropy.loss(z.view(), y.view());
        assert!((loss - 2f32.ln()).abs() < 1e-6);
    }
}
