/// The element-wise activation functions a layer can apply to its output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ActFn {
    /// `amp / (1 + e^-z)`.
    Sigmoid { amp: f32 },
    /// `max(0, z)`.
    Relu,
}

impl ActFn {
    pub fn sigmoid(amp: f32) -> Self {
        Self::Sigmoid { amp }
    }

    pub fn relu() -> Self {
        Self::Relu
    }

    /// Evaluates the function at `z`.
    pub fn f(&self, z: f32) -> f32 {
        match *self {
            Self::Sigmoid { amp } => amp / (1. + (-z).exp()),
            Self::Relu => z.max(0.),
        }
    }

    /// Evaluates the derivative of the function at `z`.
    pub fn df(&self, z: f32) -> f32 {
        match *self {
            Self::Sigmoid { amp } => {
                let e = (-z).exp();
                (amp * e) / (e + 1.).powi(2)
            }
            Self::Relu if z > 0. => 1.,
            Self::Relu => 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_centered_at_half_its_amplitude() {
        let act_fn = ActFn::sigmoid(2.);
        assert!((act_fn.f(0.) - 1.).abs() < 1e-6);
        assert!((act_fn.df(0.) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn relu_clamps_negative_inputs() {
        let act_fn = ActFn::relu();
        assert_eq!(act_fn.f(-3.), 0.);
        assert_eq!(act_fn.f(3.), 3.);
        assert_eq!(act_fn.df(-3.), 0.);
        assert_eq!(act_fn.df(3.), 1.);
    }
}
