use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const FRAC_1_SQRT_2PI: f32 = 0.398_942_3;
const GELU_CUBIC: f32 = 0.044_715;

/// Pointwise functions with a closed-form derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Activation {
    Relu,
    Sigmoid,
    Silu,
    /// Exact GELU, `x·Φ(x)`.
    Gelu,
    /// GPT-2's tanh approximation of GELU.
    GeluNew,
    /// Replaces NaN and ±inf with zero and blocks their gradient.
    Sanitize,
    Clamp { min: f32, max: f32 },
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Activation {
    pub(crate) fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => sigmoid(x),
            Self::Silu => x * sigmoid(x),
            Self::Gelu => 0.5 * x * (1.0 + libm::erff(x * core::f32::consts::FRAC_1_SQRT_2)),
            Self::GeluNew => {
                let u = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
                0.5 * x * (1.0 + u.tanh())
            }
            Self::Sanitize => {
                if x.is_finite() {
                    x
                } else {
                    0.0
                }
            }
            Self::Clamp { min, max } => x.clamp(min, max),
        }
    }

    /// `dy/dx` evaluated at the forward input.
    pub(crate) fn derivative(self, x: f32) -> f32 {
        match self {
            Self::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            Self::Silu => {
                let s = sigmoid(x);
                s + x * s * (1.0 - s)
            }
            Self::Gelu => {
                let cdf = 0.5 * (1.0 + libm::erff(x * core::f32::consts::FRAC_1_SQRT_2));
                let pdf = FRAC_1_SQRT_2PI * (-0.5 * x * x).exp();
                cdf + x * pdf
            }
            Self::GeluNew => {
                let u = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
                let t = u.tanh();
                let du = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_CUBIC * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
            }
            Self::Sanitize => {
                if x.is_finite() {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Clamp { min, max } => {
                if x >= min && x <= max {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Silu => "silu",
            Self::Gelu => "gelu",
            Self::GeluNew => "gelu_new",
            Self::Sanitize => "sanitize",
            Self::Clamp { .. } => "clamp",
        }
    }
}

/// `out = f(input)` for one [`Activation`].
pub(crate) struct Unary {
    activation: Activation,
    input: Storage,
    output: Storage,
}

impl Unary {
    pub(crate) fn new(activation: Activation, input: Storage, output: Storage) -> Self {
        Self {
            activation,
            input,
            output,
        }
    }
}

impl Kernel for Unary {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let act = self.activation;
        let x = self.input.value.clone();
        let y = self.output.value.clone();
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            y.par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(y, &x)| *y = act.apply(x));
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let act = self.activation;
        let x = self.input.value.clone();
        let dx = self.input.grad.clone();
        let dy = self.output.grad.clone();
        cmd.encode(move || {
            let x = x.read();
            let dy = dy.read();
            let mut dx = dx.write();
            dx.par_iter_mut()
                .zip(x.par_iter().zip(dy.par_iter()))
                .for_each(|(dx, (&x, &g))| *dx += g * act.derivative(x));
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        self.activation.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::{F32_MAX_ERROR, finite_diff_scalar};

    #[test]
    fn derivatives_match_central_differences() {
        let acts = [
            Activation::Relu,
            Activation::Sigmoid,
            Activation::Silu,
            Activation::Gelu,
            Activation::GeluNew,
            Activation::Clamp { min: -0.5, max: 0.7 },
        ];
        for act in acts {
            for &x in &[-2.3f32, -0.9, -0.2, 0.3, 1.1, 2.7] {
                let numeric = finite_diff_scalar(|v| act.apply(v), x);
                let analytic = act.derivative(x);
                assert!(
                    (numeric - analytic).abs() < 5.0 * F32_MAX_ERROR,
                    "{act:?} at {x}: numeric {numeric} vs analytic {analytic}"
                );
            }
        }
    }

    #[test]
    fn gelu_variants_agree_roughly() {
        for &x in &[-3.0f32, -1.0, 0.0, 0.5, 2.0] {
            let exact = Activation::Gelu.apply(x);
            let approx = Activation::GeluNew.apply(x);
            assert!((exact - approx).abs() < 1e-2, "{x}: {exact} vs {approx}");
        }
        assert!((Activation::Gelu.apply(1.0) - 0.841_344_7).abs() < 1e-5);
    }

    #[test]
    fn sanitize_zeroes_non_finite() {
        let s = Activation::Sanitize;
        assert_eq!(s.apply(f32::NAN), 0.0);
        assert_eq!(s.apply(f32::NEG_INFINITY), 0.0);
        assert_eq!(s.apply(2.0), 2.0);
        assert_eq!(s.derivative(f32::INFINITY), 0.0);
    }
}
