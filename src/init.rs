//! Weight initialisation policies.
//!
//! An [`Initializer`] turns a layer's fan-in and fan-out into a scale `w`
//! and picks the [`Distribution`] the scale applies to: `U(-w, w)` or
//! `N(0, w²)`. The device only samples; which family and which scale are
//! decided here.
//!
//! # Example
//!
//! ```
//! use gradpipe::init::{Initializer, XavierUniform, GAIN_TANH};
//!
//! let init = XavierUniform::new(GAIN_TANH);
//! let w = init.norm_k(64, 32);
//! assert!((w - GAIN_TANH * (6.0f32 / 96.0).sqrt()).abs() < 1e-6);
//! ```

use rand::Rng;
use rand_distr::StandardNormal;

/// Recommended gain for ReLU layers.
pub const GAIN_RELU: f32 = core::f32::consts::SQRT_2;
/// Recommended gain for tanh layers.
pub const GAIN_TANH: f32 = 5.0 / 3.0;
/// Recommended gain for sigmoid layers.
pub const GAIN_SIGMOID: f32 = 1.0;
/// Gain for linear layers.
pub const GAIN_LINEAR: f32 = 1.0;

/// Sampling family for initial weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// `U(-w, w)`.
    #[default]
    Uniform,
    /// `N(0, w²)`.
    Normal,
}

impl Distribution {
    /// Fills `out` with samples at scale `w`.
    ///
    /// # Panics
    /// Panics if `w` is negative or not finite.
    pub fn fill<R: Rng>(self, w: f32, rng: &mut R, out: &mut [f32]) {
        assert!(
            w.is_finite() && w >= 0.0,
            "initializer scale must be finite and non-negative, got {w}"
        );
        if w == 0.0 {
            out.fill(0.0);
            return;
        }
        match self {
            Self::Uniform => out.iter_mut().for_each(|v| *v = rng.random_range(-w..=w)),
            Self::Normal => out
                .iter_mut()
                .for_each(|v| *v = w * rng.sample::<f32, _>(StandardNormal)),
        }
    }
}

/// Scale policy for a freshly allocated parameter.
pub trait Initializer {
    /// Scale `w` for a layer with the given fan-in and fan-out.
    fn norm_k(&self, fan_in: usize, fan_out: usize) -> f32;

    /// Distribution the scale applies to.
    fn distribution(&self) -> Distribution {
        Distribution::Uniform
    }
}

/// A constant scale, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fixed(pub f32);

impl Initializer for Fixed {
    fn norm_k(&self, _fan_in: usize, _fan_out: usize) -> f32 {
        self.0
    }
}

/// A constant standard deviation, sampled normally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedNormal(pub f32);

impl Initializer for FixedNormal {
    fn norm_k(&self, _fan_in: usize, _fan_out: usize) -> f32 {
        self.0
    }

    fn distribution(&self) -> Distribution {
        Distribution::Normal
    }
}

/// Glorot uniform: `gain · sqrt(6 / (fan_in + fan_out))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XavierUniform {
    gain: f32,
}

impl XavierUniform {
    /// Creates the policy with the given gain.
    pub const fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Initializer for XavierUniform {
    fn norm_k(&self, fan_in: usize, fan_out: usize) -> f32 {
        self.gain * (6.0 / (fan_in + fan_out) as f32).sqrt()
    }
}

/// Glorot normal: `gain · sqrt(2 / (fan_in + fan_out))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XavierNormal {
    gain: f32,
}

impl XavierNormal {
    /// Creates the policy with the given gain.
    pub const fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Initializer for XavierNormal {
    fn norm_k(&self, fan_in: usize, fan_out: usize) -> f32 {
        self.gain * (2.0 / (fan_in + fan_out) as f32).sqrt()
    }

    fn distribution(&self) -> Distribution {
        Distribution::Normal
    }
}

/// He-style scale from the fan-in only: `gain · sqrt(6 / fan_in)`, sampled normally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KaimingNormal {
    gain: f32,
}

impl KaimingNormal {
    /// Creates the policy with the given gain.
    pub const fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Initializer for KaimingNormal {
    fn norm_k(&self, fan_in: usize, _fan_out: usize) -> f32 {
        self.gain * (6.0 / fan_in as f32).sqrt()
    }

    fn distribution(&self) -> Distribution {
        Distribution::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn scales() {
        assert_eq!(Fixed(0.25).norm_k(10, 10), 0.25);
        assert!((XavierNormal::new(1.0).norm_k(3, 5) - 0.5).abs() < 1e-6);
        assert!((KaimingNormal::new(GAIN_RELU).norm_k(12, 1) - GAIN_RELU * 0.5f32.sqrt()).abs() < 1e-6);
        assert_eq!(XavierUniform::new(1.0).distribution(), Distribution::Uniform);
        assert_eq!(FixedNormal(1.0).distribution(), Distribution::Normal);
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut out = vec![0.0; 1000];
        Distribution::Uniform.fill(0.3, &mut rng, &mut out);
        assert!(out.iter().all(|v| (-0.3..=0.3).contains(v)));
        assert!(out.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn normal_has_requested_spread() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut out = vec![0.0; 20_000];
        Distribution::Normal.fill(2.0, &mut rng, &mut out);
        let n = out.len() as f32;
        let mean = out.iter().sum::<f32>() / n;
        let var = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.1, "std {}", var.sqrt());
    }

    #[test]
    fn same_seed_same_weights() {
        let mut a = vec![0.0; 16];
        let mut b = vec![0.0; 16];
        Distribution::Normal.fill(1.0, &mut StdRng::seed_from_u64(3), &mut a);
        Distribution::Normal.fill(1.0, &mut StdRng::seed_from_u64(3), &mut b);
        assert_eq!(a, b);
    }
}
