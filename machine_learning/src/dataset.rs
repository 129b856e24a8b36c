use std::num::NonZeroUsize;

use ndarray::{ArrayView2, Axis};
use rand::{Rng, seq::SliceRandom};

use crate::{MlErr, Result};

/// An in-memory dataset. Each row holds the `x_size` features of a sample followed by its
/// `y_size` expected outputs.
#[derive(Clone, Debug)]
pub struct Dataset {
    x_size: usize,
    y_size: usize,
    data: Vec<f32>,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `data` - The samples, laid out row after row.
    /// * `x_size` - The amount of features per sample.
    /// * `y_size` - The amount of expected outputs per sample.
    ///
    /// # Returns
    /// A new `Dataset` or an error if `data` is empty or doesn't split into whole rows.
    pub fn new(data: Vec<f32>, x_size: usize, y_size: usize) -> Result<Self> {
        let row = x_size + y_size;

        if data.is_empty() || row == 0 {
            return Err(MlErr::EmptyDataset);
        }

        if data.len() % row != 0 {
            return Err(MlErr::SizeMismatch {
                what: "dataset rows",
                got: data.len(),
                expected: data.len() / row * row,
            });
        }

        Ok(Self {
            x_size,
            y_size,
            data,
        })
    }

    /// Returns the amount of samples.
    pub fn len(&self) -> usize {
        self.data.len() / (self.x_size + self.y_size)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Randomly permutes the samples, keeping each one's features next to its outputs.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let row = self.x_size + self.y_size;
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        let mut shuffled = Vec::with_capacity(self.data.len());
        for i in order {
            shuffled.extend_from_slice(&self.data[i * row..(i + 1) * row]);
        }

        self.data = shuffled;
    }

    /// Splits the dataset in batches of `batch_size` samples, the last one may be smaller.
    ///
    /// # Returns
    /// An iterator of `(x, y)` views, one sample per row.
    pub fn batches(
        &self,
        batch_size: NonZeroUsize,
    ) -> impl Iterator<Item = (ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        let row = self.x_size + self.y_size;
        let x_size = self.x_size;

        self.data
            .chunks(batch_size.get() * row)
            .filter_map(move |chunk| ArrayView2::from_shape((chunk.len() / row, row), chunk).ok())
            .map(move |view| view.split_at(Axis(1), x_size))
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn three_samples() -> Dataset {
        // x = [i, i], y = [-i]
        Dataset::new(vec![1., 1., -1., 2., 2., -2., 3., 3., -3.], 2, 1).unwrap()
    }

    #[test]
    fn batches_split_features_from_outputs() {
        let dataset = three_samples();
        let batches: Vec<_> = dataset.batches(NonZeroUsize::new(2).unwrap()).collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.dim(), (2, 2));
        assert_eq!(batches[0].1.dim(), (2, 1));
        assert_eq!(batches[1].0.dim(), (1, 2));
        assert_eq!(batches[1].1[[0, 0]], -3.);
    }

    #[test]
    fn shuffle_keeps_rows_together() {
        let mut dataset = three_samples();
        dataset.shuffle(&mut StdRng::seed_from_u64(7));

        let mut seen: Vec<f32> = Vec::new();
        for (x, y) in dataset.batches(NonZeroUsize::new(1).unwrap()) {
            assert_eq!(x[[0, 0]], x[[0, 1]]);
            assert_eq!(x[[0, 0]], -y[[0, 0]]);
            seen.push(x[[0, 0]]);
        }

        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, [1., 2., 3.]);
    }

    #[test]
    fn ragged_or_empty_data_is_rejected() {
        assert_eq!(Dataset::new(vec![], 2, 1).unwrap_err(), MlErr::EmptyDataset);
        assert!(Dataset::new(vec![1., 2.], 2, 1).is_err());
    }
}
