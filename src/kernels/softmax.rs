//! Row-wise softmax and the causal mask that usually precedes it.

use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;
use crate::shape::Shape;

/// Softmax over each `w`-wide row.
pub(crate) struct Softmax {
    width: usize,
    input: Storage,
    output: Storage,
}

impl Softmax {
    pub(crate) fn new(width: usize, input: Storage, output: Storage) -> Self {
        Self {
            width,
            input,
            output,
        }
    }
}

impl Kernel for Softmax {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let width = self.width;
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            y.par_chunks_mut(width)
                .zip(x.par_chunks(width))
                .for_each(|(y, x)| {
                    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    if max == f32::NEG_INFINITY {
                        // fully masked row
                        y.fill(0.0);
                        return;
                    }
                    let mut sum = 0.0;
                    for (y, &x) in y.iter_mut().zip(x) {
                        *y = (x - max).exp();
                        sum += *y;
                    }
                    y.iter_mut().for_each(|y| *y /= sum);
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let width = self.width;
        let (dx, y, dy) = (
            self.input.grad.clone(),
            self.output.value.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let y = y.read();
            let dy = dy.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(width)
                .zip(y.par_chunks(width).zip(dy.par_chunks(width)))
                .for_each(|(dx, (y, g))| {
                    let dot: f32 = y.iter().zip(g).map(|(y, g)| y * g).sum();
                    for ((dx, &y), &g) in dx.iter_mut().zip(y).zip(g) {
                        *dx += y * (g - dot);
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "softmax"
    }
}

/// Fills every strictly-upper-triangular entry (`x > y`) with `-inf`.
pub(crate) struct TrilMask {
    shape: Shape,
    input: Storage,
    output: Storage,
}

impl TrilMask {
    pub(crate) fn new(shape: Shape, input: Storage, output: Storage) -> Self {
        Self {
            shape,
            input,
            output,
        }
    }
}

impl Kernel for TrilMask {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let w = self.shape.w;
        let h = self.shape.h;
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            y.par_chunks_mut(w)
                .zip(x.par_chunks(w))
                .enumerate()
                .for_each(|(r, (y, x))| {
                    let row = r % h;
                    for (col, (y, &x)) in y.iter_mut().zip(x).enumerate() {
                        *y = if col > row { f32::NEG_INFINITY } else { x };
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let w = self.shape.w;
        let h = self.shape.h;
        let (dx, dy) = (self.input.grad.clone(), self.output.grad.clone());
        cmd.encode(move || {
            let dy = dy.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(w)
                .zip(dy.par_chunks(w))
                .enumerate()
                .for_each(|(r, (dx, g))| {
                    let row = r % h;
                    for (dx, &g) in dx.iter_mut().zip(g).take(row + 1) {
                        *dx += g;
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "tril_mask"
    }
}
