//! Row normalisation without affine parameters.
//!
//! Both kernels treat the input as consecutive rows of `width` floats and
//! cache per-row statistics during the forward pass for reuse by backward.

use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::node::Storage;

const RMS_EPS: f32 = 1e-6;

/// `(x - mean) / sqrt(var + eps)` per row.
pub(crate) struct LayerNorm {
    width: usize,
    eps: f32,
    input: Storage,
    output: Storage,
    inv_std: Buffer,
}

impl LayerNorm {
    pub(crate) fn new(width: usize, eps: f32, input: Storage, output: Storage) -> Result<Self> {
        let inv_std = Buffer::zeroed(input.len() / width)?;
        Ok(Self {
            width,
            eps,
            input,
            output,
            inv_std,
        })
    }
}

impl Kernel for LayerNorm {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (width, eps) = (self.width, self.eps);
        let (x, y, inv_std) = (
            self.input.value.clone(),
            self.output.value.clone(),
            self.inv_std.clone(),
        );
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            let mut inv_std = inv_std.write();
            y.par_chunks_mut(width)
                .zip(x.par_chunks(width))
                .zip(inv_std.par_iter_mut())
                .for_each(|((y, x), inv)| {
                    let n = width as f32;
                    let mean = x.iter().sum::<f32>() / n;
                    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
                    *inv = 1.0 / (var + eps).sqrt();
                    for (y, &x) in y.iter_mut().zip(x) {
                        *y = (x - mean) * *inv;
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let width = self.width;
        let (dx, y, dy, inv_std) = (
            self.input.grad.clone(),
            self.output.value.clone(),
            self.output.grad.clone(),
            self.inv_std.clone(),
        );
        cmd.encode(move || {
            let y = y.read();
            let dy = dy.read();
            let inv_std = inv_std.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(width)
                .zip(y.par_chunks(width).zip(dy.par_chunks(width)))
                .zip(inv_std.par_iter())
                .for_each(|((dx, (xhat, g)), &inv)| {
                    let n = width as f32;
                    let mean_g = g.iter().sum::<f32>() / n;
                    let mean_gx = g.iter().zip(xhat).map(|(g, x)| g * x).sum::<f32>() / n;
                    for ((dx, &g), &x) in dx.iter_mut().zip(g).zip(xhat) {
                        *dx += inv * (g - mean_g - x * mean_gx);
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "layer_norm"
    }
}

/// `x / sqrt(mean(x²) + eps)` per row.
pub(crate) struct RmsNorm {
    width: usize,
    input: Storage,
    output: Storage,
    rms: Buffer,
}

impl RmsNorm {
    pub(crate) fn new(width: usize, input: Storage, output: Storage) -> Result<Self> {
        let rms = Buffer::zeroed(input.len() / width)?;
        Ok(Self {
            width,
            input,
            output,
            rms,
        })
    }
}

impl Kernel for RmsNorm {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let width = self.width;
        let (x, y, rms) = (
            self.input.value.clone(),
            self.output.value.clone(),
            self.rms.clone(),
        );
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            let mut rms = rms.write();
            y.par_chunks_mut(width)
                .zip(x.par_chunks(width))
                .zip(rms.par_iter_mut())
                .for_each(|((y, x), rms)| {
                    let ms = x.iter().map(|v| v * v).sum::<f32>() / width as f32;
                    *rms = (ms + RMS_EPS).sqrt();
                    for (y, &x) in y.iter_mut().zip(x) {
                        *y = x / *rms;
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let width = self.width;
        let (dx, y, dy, rms) = (
            self.input.grad.clone(),
            self.output.value.clone(),
            self.output.grad.clone(),
            self.rms.clone(),
        );
        cmd.encode(move || {
            let y = y.read();
            let dy = dy.read();
            let rms = rms.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(width)
                .zip(y.par_chunks(width).zip(dy.par_chunks(width)))
                .zip(rms.par_iter())
                .for_each(|((dx, (y, g)), &rms)| {
                    let mean_gy = g.iter().zip(y).map(|(g, y)| g * y).sum::<f32>() / width as f32;
                    for ((dx, &g), &y) in dx.iter_mut().zip(g).zip(y) {
                        *dx += (g - y * mean_gy) / rms;
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "rms_norm"
    }
}
