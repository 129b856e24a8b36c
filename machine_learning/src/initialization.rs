use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::{MlErr, Result};

/// A way of generating the initial values of a model's parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamGen {
    Const(f32),
    Uniform { low: f32, high: f32 },
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    XavierUniform { fan_in: usize, fan_out: usize },
    Normal { mean: f32, std_dev: f32 },
}

impl ParamGen {
    /// Fills `out` with values drawn from this generator.
    ///
    /// # Arguments
    /// * `rng` - The source of randomness.
    /// * `out` - The slice to overwrite.
    ///
    /// # Returns
    /// An error if the distribution's arguments are invalid.
    pub fn fill<R: Rng>(&self, rng: &mut R, out: &mut [f32]) -> Result<()> {
        match *self {
            ParamGen::Const(value) => out.fill(value),
            ParamGen::Uniform { low, high } => sample_uniform(rng, out, low, high)?,
            ParamGen::XavierUniform { fan_in, fan_out } => {
                let limit = (6. / (fan_in + fan_out).max(1) as f32).sqrt();
                sample_uniform(rng, out, -limit, limit)?;
            }
            ParamGen::Normal { mean, std_dev } => {
                let dist = Normal::new(mean, std_dev)
                    .map_err(|e| MlErr::InvalidDistribution(e.to_string()))?;
                for w in out.iter_mut() {
                    *w = dist.sample(rng);
                }
            }
        }

        Ok(())
    }
}

fn sample_uniform<R: Rng>(rng: &mut R, out: &mut [f32], low: f32, high: f32) -> Result<()> {
    let dist = Uniform::new(low, high).map_err(|e| MlErr::InvalidDistribution(e.to_string()))?;
    for w in out.iter_mut() {
        *w = dist.sample(rng);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn xavier_stays_within_its_limit() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut out = [0.; 64];

        ParamGen::XavierUniform {
            fan_in: 4,
            fan_out: 2,
        }
        .fill(&mut rng, &mut out)
        .unwrap();

        assert!(out.iter().all(|w| w.abs() <= 1.));
        assert!(out.iter().any(|&w| w != 0.));
    }

    #[test]
    fn empty_uniform_range_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = ParamGen::Uniform { low: 1., high: 1. }
            .fill(&mut rng, &mut [0.; 2])
            .unwrap_err();

        assert!(matches!(err, MlErr::InvalidDistribution(_)));
    }

    #[test]
    fn const_fills_every_slot() {
        let mut out = [1.; 3];
        ParamGen::Const(0.)
            .fill(&mut StdRng::seed_from_u64(0), &mut out)
            .unwrap();
        assert_eq!(out, [0.; 3]);
    }
}
