use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::node::Storage;

/// Pooling window geometry, applied independently to every depth slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolGeometry {
    pub in_w: usize,
    pub in_h: usize,
    pub depth: usize,
    pub pool: usize,
    pub padding: usize,
    pub stride: usize,
    pub out_w: usize,
    pub out_h: usize,
}

/// Max pooling; remembers the winning input index of each window.
pub(crate) struct MaxPool {
    geo: PoolGeometry,
    input: Storage,
    output: Storage,
    /// Slice-local argmax per output element, `usize::MAX` for windows entirely in the padding.
    argmax: Arc<Mutex<Vec<usize>>>,
}

impl MaxPool {
    pub(crate) fn new(geo: PoolGeometry, input: Storage, output: Storage) -> Result<Self> {
        let argmax = unset_indices(geo.out_w * geo.out_h * geo.depth)?;
        Ok(Self {
            geo,
            input,
            output,
            argmax: Arc::new(Mutex::new(argmax)),
        })
    }
}

fn unset_indices(len: usize) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    indices
        .try_reserve_exact(len)
        .map_err(|_| Error::Allocation { len })?;
    indices.resize(len, usize::MAX);
    Ok(indices)
}

impl Kernel for MaxPool {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let geo = self.geo;
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        let argmax = Arc::clone(&self.argmax);
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            let mut argmax = argmax.lock().unwrap_or_else(PoisonError::into_inner);
            let (in_slice, out_slice) = (geo.in_w * geo.in_h, geo.out_w * geo.out_h);
            y.par_chunks_mut(out_slice)
                .zip(argmax.par_chunks_mut(out_slice))
                .enumerate()
                .for_each(|(d, (out, arg))| {
                    let img = &x[d * in_slice..][..in_slice];
                    for oy in 0..geo.out_h {
                        for ox in 0..geo.out_w {
                            let mut best = (usize::MAX, f32::NEG_INFINITY);
                            for py in 0..geo.pool {
                                for px in 0..geo.pool {
                                    let ix = (ox * geo.stride + px).checked_sub(geo.padding);
                                    let iy = (oy * geo.stride + py).checked_sub(geo.padding);
                                    let (Some(ix), Some(iy)) = (ix, iy) else { continue };
                                    if ix >= geo.in_w || iy >= geo.in_h {
                                        continue;
                                    }
                                    let src = iy * geo.in_w + ix;
                                    if best.0 == usize::MAX || img[src] > best.1 {
                                        best = (src, img[src]);
                                    }
                                }
                            }
                            let o = oy * geo.out_w + ox;
                            arg[o] = best.0;
                            out[o] = if best.0 == usize::MAX { 0.0 } else { best.1 };
                        }
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let geo = self.geo;
        let (dx, dy) = (self.input.grad.clone(), self.output.grad.clone());
        let argmax = Arc::clone(&self.argmax);
        cmd.encode(move || {
            let dy = dy.read();
            let argmax = argmax.lock().unwrap_or_else(PoisonError::into_inner);
            let mut dx = dx.write();
            let (in_slice, out_slice) = (geo.in_w * geo.in_h, geo.out_w * geo.out_h);
            dx.par_chunks_mut(in_slice)
                .enumerate()
                .for_each(|(d, img_grad)| {
                    let base = d * out_slice;
                    for o in 0..out_slice {
                        let src = argmax[base + o];
                        if src != usize::MAX {
                            img_grad[src] += dy[base + o];
                        }
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "max_pool_2d"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_indices_start_empty() {
        assert_eq!(unset_indices(3).unwrap(), vec![usize::MAX; 3]);
    }

    #[test]
    fn oversized_mask_is_an_allocation_error() {
        let err = unset_indices(usize::MAX / 2).unwrap_err();
        assert!(matches!(err, Error::Allocation { len } if len == usize::MAX / 2));
    }
}
