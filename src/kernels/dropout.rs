use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::node::Storage;

/// Inverted dropout: kept elements are scaled by `1 / (1 - prob)`.
///
/// A fresh mask seed is drawn from the kernel's own generator every time the
/// forward pass is encoded, so a fixed construction seed reproduces every
/// iteration's mask.
pub(crate) struct Dropout {
    prob: f32,
    input: Storage,
    output: Storage,
    mask: Buffer,
    rng: Mutex<StdRng>,
}

impl Dropout {
    pub(crate) fn new(prob: f32, seed: u64, input: Storage, output: Storage) -> Result<Self> {
        let mask = Buffer::zeroed(input.len())?;
        Ok(Self {
            prob,
            input,
            output,
            mask,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }
}

impl Kernel for Dropout {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let prob = self.prob;
        let seed = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_u64();
        let (x, y, mask) = (
            self.input.value.clone(),
            self.output.value.clone(),
            self.mask.clone(),
        );
        cmd.encode(move || {
            let scale = 1.0 / (1.0 - prob);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut mask = mask.write();
            for m in mask.iter_mut() {
                *m = if rng.random::<f32>() < prob { 0.0 } else { scale };
            }
            let x = x.read();
            let mut y = y.write();
            y.par_iter_mut()
                .zip(x.par_iter().zip(mask.par_iter()))
                .for_each(|(y, (&x, &m))| *y = x * m);
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (dx, dy, mask) = (
            self.input.grad.clone(),
            self.output.grad.clone(),
            self.mask.clone(),
        );
        cmd.encode(move || {
            let dy = dy.read();
            let mask = mask.read();
            let mut dx = dx.write();
            dx.par_iter_mut()
                .zip(dy.par_iter().zip(mask.par_iter()))
                .for_each(|(dx, (&g, &m))| *dx += g * m);
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "dropout"
    }
}
