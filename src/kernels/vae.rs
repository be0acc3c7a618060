//! Variational autoencoder heads.
//!
//! Both kernels read an encoder output whose rows are `2·latent` wide: the
//! first half holds the means, the second half the log-variances.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::node::Storage;

/// Reparameterised sample `z = μ + exp(½·logσ²)·ε`, `ε ~ N(0, 1)`.
pub(crate) struct VaeSample {
    latent: usize,
    input: Storage,
    output: Storage,
    noise: Buffer,
    rng: Mutex<StdRng>,
}

impl VaeSample {
    pub(crate) fn new(latent: usize, seed: u64, input: Storage, output: Storage) -> Result<Self> {
        let noise = Buffer::zeroed(output.len())?;
        Ok(Self {
            latent,
            input,
            output,
            noise,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }
}

impl Kernel for VaeSample {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let latent = self.latent;
        let seed = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_u64();
        let (x, z, noise) = (
            self.input.value.clone(),
            self.output.value.clone(),
            self.noise.clone(),
        );
        cmd.encode(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut noise = noise.write();
            for e in noise.iter_mut() {
                *e = rng.sample(StandardNormal);
            }
            let x = x.read();
            let mut z = z.write();
            z.par_chunks_mut(latent)
                .zip(x.par_chunks(2 * latent).zip(noise.par_chunks(latent)))
                .for_each(|(z, (row, eps))| {
                    let (mu, logvar) = row.split_at(latent);
                    for i in 0..latent {
                        z[i] = mu[i] + (0.5 * logvar[i]).exp() * eps[i];
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let latent = self.latent;
        let (x, dx, dz, noise) = (
            self.input.value.clone(),
            self.input.grad.clone(),
            self.output.grad.clone(),
            self.noise.clone(),
        );
        cmd.encode(move || {
            let x = x.read();
            let dz = dz.read();
            let noise = noise.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(2 * latent)
                .zip(x.par_chunks(2 * latent))
                .zip(dz.par_chunks(latent).zip(noise.par_chunks(latent)))
                .for_each(|((drow, row), (g, eps))| {
                    let logvar = &row[latent..];
                    let (dmu, dlogvar) = drow.split_at_mut(latent);
                    for i in 0..latent {
                        dmu[i] += g[i];
                        dlogvar[i] += g[i] * eps[i] * 0.5 * (0.5 * logvar[i]).exp();
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "vae_sample"
    }
}

/// KL divergence of each row's diagonal Gaussian from the standard normal.
pub(crate) struct VaeKl {
    latent: usize,
    input: Storage,
    output: Storage,
}

impl VaeKl {
    pub(crate) fn new(latent: usize, input: Storage, output: Storage) -> Self {
        Self {
            latent,
            input,
            output,
        }
    }
}

impl Kernel for VaeKl {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let latent = self.latent;
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            y.par_iter_mut()
                .zip(x.par_chunks(2 * latent))
                .for_each(|(y, row)| {
                    let (mu, logvar) = row.split_at(latent);
                    let sum: f32 = mu
                        .iter()
                        .zip(logvar)
                        .map(|(&m, &lv)| 1.0 + lv - m * m - lv.exp())
                        .sum();
                    *y = -0.5 * sum;
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let latent = self.latent;
        let (x, dx, dy) = (
            self.input.value.clone(),
            self.input.grad.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let x = x.read();
            let dy = dy.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(2 * latent)
                .zip(x.par_chunks(2 * latent).zip(dy.par_iter()))
                .for_each(|(drow, (row, &g))| {
                    let (mu, logvar) = row.split_at(latent);
                    let (dmu, dlogvar) = drow.split_at_mut(latent);
                    for i in 0..latent {
                        dmu[i] += g * mu[i];
                        dlogvar[i] += g * 0.5 * (logvar[i].exp() - 1.0);
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "vae_kl_divergence"
    }
}
