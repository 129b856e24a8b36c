use crate::Result;

/// Runs a whole training session over a set of parameters.
pub trait Trainer {
    /// Trains over `params` in place.
    ///
    /// # Returns
    /// The loss of every epoch, in order.
    fn train(&mut self, params: &mut [f32]) -> Result<Vec<f32>>;
}
