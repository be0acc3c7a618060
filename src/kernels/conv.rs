//! 2D convolution over batched, multi-channel feature maps.
//!
//! Depth indices are laid out batch-major: input slice `b·C + c`, weight
//! slice `f·C + c` and output slice `b·F + f`.

use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;

/// Spatial and channel extents of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub in_w: usize,
    pub in_h: usize,
    pub channels: usize,
    pub batch: usize,
    pub filters: usize,
    pub kernel_w: usize,
    pub kernel_h: usize,
    pub padding: usize,
    pub stride: usize,
    pub out_w: usize,
    pub out_h: usize,
}

impl ConvGeometry {
    /// Input coordinate hit by output `(ox, oy)` and kernel tap `(kx, ky)`, if inside the image.
    fn source(&self, ox: usize, oy: usize, kx: usize, ky: usize) -> Option<usize> {
        let ix = (ox * self.stride + kx).checked_sub(self.padding)?;
        let iy = (oy * self.stride + ky).checked_sub(self.padding)?;
        (ix < self.in_w && iy < self.in_h).then_some(iy * self.in_w + ix)
    }

    fn in_slice(&self) -> usize {
        self.in_w * self.in_h
    }

    fn out_slice(&self) -> usize {
        self.out_w * self.out_h
    }

    fn taps(&self) -> usize {
        self.kernel_w * self.kernel_h
    }
}

pub(crate) struct Conv {
    geo: ConvGeometry,
    input: Storage,
    weights: Storage,
    biases: Storage,
    output: Storage,
}

impl Conv {
    pub(crate) fn new(
        geo: ConvGeometry,
        input: Storage,
        weights: Storage,
        biases: Storage,
        output: Storage,
    ) -> Self {
        Self {
            geo,
            input,
            weights,
            biases,
            output,
        }
    }
}

impl Kernel for Conv {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let geo = self.geo;
        let (x, w, bias, y) = (
            self.input.value.clone(),
            self.weights.value.clone(),
            self.biases.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let bias = bias.read();
            let mut y = y.write();
            Buffer::read_pair(&x, &w, |x, w| {
                y.par_chunks_mut(geo.out_slice())
                    .enumerate()
                    .for_each(|(slice, out)| {
                        let (b, f) = (slice / geo.filters, slice % geo.filters);
                        for oy in 0..geo.out_h {
                            for ox in 0..geo.out_w {
                                let mut acc = bias[f];
                                for c in 0..geo.channels {
                                    let img = &x[(b * geo.channels + c) * geo.in_slice()..];
                                    let ker = &w[(f * geo.channels + c) * geo.taps()..];
                                    for ky in 0..geo.kernel_h {
                                        for kx in 0..geo.kernel_w {
                                            if let Some(src) = geo.source(ox, oy, kx, ky) {
                                                acc += img[src] * ker[ky * geo.kernel_w + kx];
                                            }
                                        }
                                    }
                                }
                                out[oy * geo.out_w + ox] = acc;
                            }
                        }
                    });
            });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let geo = self.geo;
        let (input, weights, biases) = (
            self.input.clone(),
            self.weights.clone(),
            self.biases.clone(),
        );
        let dy = self.output.grad.clone();
        cmd.encode(move || {
            let g = dy.read();
            {
                let w = weights.value.read();
                let mut dx = input.grad.write();
                dx.par_chunks_mut(geo.in_slice())
                    .enumerate()
                    .for_each(|(slice, img_grad)| {
                        let (b, c) = (slice / geo.channels, slice % geo.channels);
                        for f in 0..geo.filters {
                            let out_grad = &g[(b * geo.filters + f) * geo.out_slice()..];
                            let ker = &w[(f * geo.channels + c) * geo.taps()..];
                            for oy in 0..geo.out_h {
                                for ox in 0..geo.out_w {
                                    let gv = out_grad[oy * geo.out_w + ox];
                                    for ky in 0..geo.kernel_h {
                                        for kx in 0..geo.kernel_w {
                                            if let Some(src) = geo.source(ox, oy, kx, ky) {
                                                img_grad[src] += gv * ker[ky * geo.kernel_w + kx];
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    });
            }
            {
                let x = input.value.read();
                let mut dw = weights.grad.write();
                dw.par_chunks_mut(geo.taps())
                    .enumerate()
                    .for_each(|(slice, ker_grad)| {
                        let (f, c) = (slice / geo.channels, slice % geo.channels);
                        for b in 0..geo.batch {
                            let out_grad = &g[(b * geo.filters + f) * geo.out_slice()..];
                            let img = &x[(b * geo.channels + c) * geo.in_slice()..];
                            for oy in 0..geo.out_h {
                                for ox in 0..geo.out_w {
                                    let gv = out_grad[oy * geo.out_w + ox];
                                    for ky in 0..geo.kernel_h {
                                        for kx in 0..geo.kernel_w {
                                            if let Some(src) = geo.source(ox, oy, kx, ky) {
                                                ker_grad[ky * geo.kernel_w + kx] += gv * img[src];
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    });
            }
            let mut db = biases.grad.write();
            db.par_iter_mut().enumerate().for_each(|(f, dx)| {
                *dx += (0..geo.batch)
                    .map(|b| {
                        let start = (b * geo.filters + f) * geo.out_slice();
                        g[start..start + geo.out_slice()].iter().sum::<f32>()
                    })
                    .sum::<f32>();
            });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "conv"
    }
}
