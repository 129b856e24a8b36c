use super::{Optimizer, gradient_descent::check_len};
use crate::Result;

/// Gradient descent with momentum: `v = mu * v + g` and `w -= lr * v`.
#[derive(Clone, Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Vec<f32>,
}

impl GradientDescentWithMomentum {
    /// Returns a new `GradientDescentWithMomentum`.
    ///
    /// # Arguments
    /// * `learning_rate` - The scale applied to each gradient.
    /// * `momentum` - The fraction of the previous step kept on the next one.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;

        if self.velocity.len() != params.len() {
            self.velocity = vec![0.; params.len()];
        }

        let (lr, mu) = (self.learning_rate, self.momentum);
        for ((w, v), g) in params.iter_mut().zip(&mut self.velocity).zip(grad) {
            *v = mu * *v + g;
            *w -= lr * *v;
        }

        Ok(())
    }
}
