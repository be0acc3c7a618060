//! Adam with precomputed bias corrections.

use std::collections::HashSet;

use rayon::prelude::*;

#[cfg(feature = "wgpu")]
use crate::backend::{Backend, get_backend};
use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::error::Result;
use crate::node::{Storage, Tensor};

use super::{Optimizer, ParameterUpdate};

/// Hyperparameters and iteration budget of an Adam run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// Number of iterations the bias-correction tables cover.
    pub iterations: usize,
    /// First-moment decay.
    pub beta1: f32,
    /// Second-moment decay.
    pub beta2: f32,
    /// Base learning rate.
    pub learning_rate: f32,
    /// Denominator regulariser.
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            beta1: 0.9,
            beta2: 0.999,
            learning_rate: 1e-3,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Creates a configuration.
    ///
    /// # Panics
    /// Panics if a decay rate is outside `[0, 1)` or the learning rate or
    /// `eps` is negative.
    pub fn new(iterations: usize, beta1: f32, beta2: f32, learning_rate: f32, eps: f32) -> Self {
        let config = Self {
            iterations,
            beta1,
            beta2,
            learning_rate,
            eps,
        };
        config.validate();
        config
    }

    /// Checks the ranges documented on [`AdamConfig::new`]; the fields are
    /// public, so binding re-runs this on hand-built configurations.
    fn validate(&self) {
        let Self {
            beta1,
            beta2,
            learning_rate,
            eps,
            ..
        } = *self;
        assert!((0.0..1.0).contains(&beta1), "beta1 must be in [0, 1), got {beta1}");
        assert!((0.0..1.0).contains(&beta2), "beta2 must be in [0, 1), got {beta2}");
        assert!(learning_rate >= 0.0, "learning rate must be non-negative");
        assert!(eps >= 0.0, "eps must be non-negative");
    }
}

impl Optimizer for AdamConfig {
    type Update = Adam;

    fn bind(&self, params: &[Tensor]) -> Result<Adam> {
        Adam::new(*self, params)
    }
}

/// Scalars one update command needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AdamStep {
    pub beta1: f32,
    pub beta2: f32,
    pub learning_rate: f32,
    pub v_correction: f32,
    pub eps: f32,
}

struct Slot {
    param: Storage,
    m: Buffer,
    v: Buffer,
}

/// Adam bound to a parameter list.
///
/// Momentum and variance buffers are allocated once in [`Adam::new`] and
/// owned exclusively by the scheduler.
pub struct Adam {
    config: AdamConfig,
    slots: Vec<Slot>,
    beta1_corrections: Vec<f32>,
    beta2_corrections: Vec<f32>,
    overrun_reported: bool,
}

fn inverse_corrections(beta: f32, len: usize) -> Vec<f32> {
    let mut pow = 1.0f32;
    (0..len)
        .map(|_| {
            pow *= beta;
            1.0 / (1.0 - pow)
        })
        .collect()
}

impl Adam {
    /// Allocates state for every distinct parameter in `params`.
    ///
    /// # Panics
    /// Panics if a tensor is not a leaf, since only leaves can be updated in
    /// place, or if `config` is out of range (see [`AdamConfig::new`]).
    ///
    /// # Errors
    /// Returns an allocation error if the moment buffers cannot be reserved.
    pub fn new(config: AdamConfig, params: &[Tensor]) -> Result<Self> {
        config.validate();
        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(params.len());
        for param in params {
            assert!(
                param.is_leaf(),
                "adam can only update leaf tensors, got {param:?}"
            );
            if !seen.insert(param.owner()) {
                log::warn!("adam: parameter {:?} bound twice, ignoring duplicate", param.id());
                continue;
            }
            slots.push(Slot {
                param: param.storage().clone(),
                m: Buffer::zeroed(param.len())?,
                v: Buffer::zeroed(param.len())?,
            });
        }
        // one extra entry so the last budgeted iteration still has a table slot
        let len = config.iterations + 1;
        log::debug!(
            "adam: bound {} parameters ({} floats), {len} precomputed steps",
            slots.len(),
            slots.iter().map(|s| s.m.len()).sum::<usize>()
        );
        Ok(Self {
            config,
            slots,
            beta1_corrections: inverse_corrections(config.beta1, len),
            beta2_corrections: inverse_corrections(config.beta2, len),
            overrun_reported: false,
        })
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no parameters are bound.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `1/(1-β1^t)` and `1/(1-β2^t)` for zero-based `iteration` (`t = iteration + 1`).
    pub fn corrections(&mut self, iteration: usize) -> (f32, f32) {
        match (
            self.beta1_corrections.get(iteration),
            self.beta2_corrections.get(iteration),
        ) {
            (Some(&c1), Some(&c2)) => (c1, c2),
            _ => {
                if !self.overrun_reported {
                    log::warn!(
                        "adam: iteration {iteration} exceeds the budget of {}, computing corrections on the fly",
                        self.config.iterations
                    );
                    self.overrun_reported = true;
                }
                let t = i32::try_from(iteration + 1).unwrap_or(i32::MAX);
                (
                    1.0 / (1.0 - self.config.beta1.powi(t)),
                    1.0 / (1.0 - self.config.beta2.powi(t)),
                )
            }
        }
    }

    /// Encodes one update of every bound parameter.
    pub fn step(&mut self, cmd: &mut CommandBuffer, iteration: usize) {
        let (c1, c2) = self.corrections(iteration);
        let step = AdamStep {
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            learning_rate: self.config.learning_rate * c1,
            v_correction: c2,
            eps: self.config.eps,
        };
        for slot in &self.slots {
            let (value, grad) = (slot.param.value.clone(), slot.param.grad.clone());
            let (m, v) = (slot.m.clone(), slot.v.clone());
            cmd.encode(move || {
                let grad = grad.read();
                let mut value = value.write();
                let mut m = m.write();
                let mut v = v.write();
                if !adam_gpu(&mut value, &grad, &mut m, &mut v, step) {
                    adam_cpu(&mut value, &grad, &mut m, &mut v, step);
                }
                Ok(())
            });
        }
    }
}

impl ParameterUpdate for Adam {
    fn update(&mut self, cmd: &mut CommandBuffer, iteration: usize) {
        self.step(cmd, iteration);
    }
}

/// Runs the step as a compute shader when the `wgpu` backend is active.
/// Returns `false` if the host path has to run instead.
#[allow(unused_variables)]
fn adam_gpu(value: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32], step: AdamStep) -> bool {
    #[cfg(feature = "wgpu")]
    if get_backend() == Backend::Wgpu {
        match crate::gpu::adam(value, grad, m, v, step) {
            Ok(()) => return true,
            Err(err) => log::warn!("gpu adam failed, using cpu: {err}"),
        }
    }
    false
}

/// In-place Adam step on host slices.
pub(crate) fn adam_cpu(value: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32], step: AdamStep) {
    let AdamStep {
        beta1,
        beta2,
        learning_rate,
        v_correction,
        eps,
    } = step;
    value
        .par_iter_mut()
        .zip(grad.par_iter())
        .zip(m.par_iter_mut().zip(v.par_iter_mut()))
        .for_each(|((x, &g), (m, v))| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *x -= learning_rate * *m / ((*v * v_correction).sqrt() + eps);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::F32_MIN_ERROR;

    #[test]
    fn eps_regularised_denominator() {
        for eps in [1e-2f32, 1e-1] {
            let mut value = [1.0];
            let (mut m, mut v) = ([0.0], [0.0]);
            let step = AdamStep {
                beta1: 0.0,
                beta2: 0.0,
                learning_rate: 1.0,
                v_correction: 1.0,
                eps,
            };
            adam_cpu(&mut value, &[1.0], &mut m, &mut v, step);
            assert!((value[0] - (1.0 - 1.0 / (1.0 + eps))).abs() < F32_MIN_ERROR);
        }
    }

    #[test]
    fn corrections_follow_powers() {
        let config = AdamConfig::new(3, 0.5, 0.75, 0.1, 1e-8);
        let mut adam = Adam::new(config, &[]).unwrap();
        let (c1, c2) = adam.corrections(0);
        assert!((c1 - 2.0).abs() < 1e-6);
        assert!((c2 - 4.0).abs() < 1e-6);
        let (c1, _) = adam.corrections(1);
        assert!((c1 - 1.0 / 0.75).abs() < 1e-6);
        // past the table: computed, not indexed
        let (c1, c2) = adam.corrections(9);
        assert!((c1 - 1.0 / (1.0 - 0.5f32.powi(10))).abs() < 1e-6);
        assert!((c2 - 1.0 / (1.0 - 0.75f32.powi(10))).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "beta1 must be in [0, 1)")]
    fn rejects_bad_decay() {
        AdamConfig::new(10, 1.0, 0.9, 1e-3, 1e-8);
    }

    #[test]
    #[should_panic(expected = "beta2 must be in [0, 1)")]
    fn bind_rejects_hand_built_config() {
        use crate::optim::Optimizer;

        let config = AdamConfig {
            beta2: 1.5,
            ..AdamConfig::default()
        };
        let _ = config.bind(&[]);
    }
}
