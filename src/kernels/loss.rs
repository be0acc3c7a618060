//! Reductions and loss functions.

use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::node::Storage;

/// Floor applied to probabilities before taking their log.
pub(crate) const NLL_MIN_PROB: f32 = 1e-9;
/// Probabilities fed to binary cross-entropy are clamped to `[BCE_EPS, 1 - BCE_EPS]`.
pub(crate) const BCE_EPS: f32 = 1e-7;

/// Mean of every element into a `1×1×1` output.
pub(crate) struct Mean {
    input: Storage,
    output: Storage,
}

impl Mean {
    pub(crate) fn new(input: Storage, output: Storage) -> Self {
        Self { input, output }
    }
}

impl Kernel for Mean {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let sum: f32 = x.par_iter().sum();
            y.write()[0] = sum / x.len() as f32;
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (dx, dy) = (self.input.grad.clone(), self.output.grad.clone());
        cmd.encode(move || {
            let g = dy.read()[0];
            let mut dx = dx.write();
            let share = g / dx.len() as f32;
            dx.par_iter_mut().for_each(|dx| *dx += share);
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "mean"
    }
}

fn class_index(raw: f32, classes: usize) -> Result<usize> {
    if raw.is_finite() && raw >= 0.0 && (raw as usize) < classes {
        Ok(raw as usize)
    } else {
        Err(Error::Submission(format!(
            "target class {raw} is outside {classes} classes"
        )))
    }
}

/// Negative log-likelihood of one target class per probability row.
pub(crate) struct NllPos {
    classes: usize,
    probs: Storage,
    targets: Storage,
    output: Storage,
}

impl NllPos {
    pub(crate) fn new(classes: usize, probs: Storage, targets: Storage, output: Storage) -> Self {
        Self {
            classes,
            probs,
            targets,
            output,
        }
    }
}

impl Kernel for NllPos {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let classes = self.classes;
        let (p, t, y) = (
            self.probs.value.clone(),
            self.targets.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let p = p.read();
            let t = t.read();
            let mut y = y.write();
            y.par_iter_mut()
                .zip(p.par_chunks(classes).zip(t.par_iter()))
                .try_for_each(|(y, (row, &target))| {
                    let c = class_index(target, classes)?;
                    *y = -row[c].max(NLL_MIN_PROB).ln();
                    Ok(())
                })
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let classes = self.classes;
        let (p, dp, t, dy) = (
            self.probs.value.clone(),
            self.probs.grad.clone(),
            self.targets.value.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let p = p.read();
            let t = t.read();
            let dy = dy.read();
            let mut dp = dp.write();
            dp.par_chunks_mut(classes)
                .zip(p.par_chunks(classes))
                .zip(t.par_iter().zip(dy.par_iter()))
                .try_for_each(|((dp, row), (&target, &g))| {
                    let c = class_index(target, classes)?;
                    dp[c] -= g / row[c].max(NLL_MIN_PROB);
                    Ok(())
                })
        });
    }

    fn name(&self) -> &'static str {
        "nll_pos"
    }
}

/// Elementwise binary cross-entropy against soft or hard targets.
pub(crate) struct BinaryCrossEntropy {
    probs: Storage,
    targets: Storage,
    output: Storage,
}

impl BinaryCrossEntropy {
    pub(crate) fn new(probs: Storage, targets: Storage, output: Storage) -> Self {
        Self {
            probs,
            targets,
            output,
        }
    }
}

impl Kernel for BinaryCrossEntropy {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (p, t, y) = (
            self.probs.value.clone(),
            self.targets.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let p = p.read();
            let t = t.read();
            let mut y = y.write();
            y.par_iter_mut()
                .zip(p.par_iter().zip(t.par_iter()))
                .for_each(|(y, (&p, &t))| {
                    let p = p.clamp(BCE_EPS, 1.0 - BCE_EPS);
                    *y = -(t * p.ln() + (1.0 - t) * (1.0 - p).ln());
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (p, dp, t, dy) = (
            self.probs.value.clone(),
            self.probs.grad.clone(),
            self.targets.value.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let p = p.read();
            let t = t.read();
            let dy = dy.read();
            let mut dp = dp.write();
            dp.par_iter_mut()
                .zip(p.par_iter().zip(t.par_iter().zip(dy.par_iter())))
                .for_each(|(dp, (&p, (&t, &g)))| {
                    let p = p.clamp(BCE_EPS, 1.0 - BCE_EPS);
                    *dp += g * (p - t) / (p * (1.0 - p));
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "binary_cross_entropy"
    }
}
