mod cross_entropy;
mod loss_fn;

pub use cross_entropy::{CrossEntropy, softmax_rows};
pub use loss_fn::LossFn;
