//! Batched matrix multiplication with depth broadcasting.
//!
//! `a` is `k` wide and `m` tall, `b` is `n` wide and `k` tall, and the output
//! is `n × m` per depth slice. Either operand may have depth 1, in which case
//! its single slice is reused for every output slice and its gradient sums
//! the contributions of all of them.

use rayon::prelude::*;

#[cfg(feature = "wgpu")]
use crate::backend::{Backend, get_backend};
use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;

/// Problem size of one batched product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MatMulDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub batch: usize,
    pub a_batched: bool,
    pub b_batched: bool,
    pub alpha: f32,
}

impl MatMulDims {
    fn a_offset(&self, z: usize) -> usize {
        if self.a_batched { z * self.m * self.k } else { 0 }
    }

    fn b_offset(&self, z: usize) -> usize {
        if self.b_batched { z * self.k * self.n } else { 0 }
    }
}

/// Host implementation of `c = alpha · a × b`, overwriting `c`.
pub(crate) fn matmul_cpu(a: &[f32], b: &[f32], c: &mut [f32], dims: MatMulDims) {
    let MatMulDims { m, k, n, alpha, .. } = dims;
    c.par_chunks_mut(n).enumerate().for_each(|(r, row)| {
        let (z, i) = (r / m, r % m);
        let a_row = &a[dims.a_offset(z) + i * k..][..k];
        let b_mat = &b[dims.b_offset(z)..];
        row.fill(0.0);
        for (p, &av) in a_row.iter().enumerate() {
            let b_row = &b_mat[p * n..][..n];
            for (o, &bv) in row.iter_mut().zip(b_row) {
                *o += av * bv;
            }
        }
        if alpha != 1.0 {
            row.iter_mut().for_each(|o| *o *= alpha);
        }
    });
}

/// Runs the product as a compute shader when the `wgpu` backend is active.
/// Returns `false` if the host path has to run instead.
#[allow(unused_variables)]
fn matmul_gpu(a: &[f32], b: &[f32], c: &mut [f32], dims: MatMulDims) -> bool {
    #[cfg(feature = "wgpu")]
    if get_backend() == Backend::Wgpu {
        match crate::gpu::matmul(a, b, c, dims) {
            Ok(()) => return true,
            Err(err) => log::warn!("gpu matmul failed, using cpu: {err}"),
        }
    }
    false
}

pub(crate) struct MatMul {
    dims: MatMulDims,
    a: Storage,
    b: Storage,
    output: Storage,
}

impl MatMul {
    pub(crate) fn new(dims: MatMulDims, a: Storage, b: Storage, output: Storage) -> Self {
        Self { dims, a, b, output }
    }
}

impl Kernel for MatMul {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let dims = self.dims;
        let (a, b, c) = (
            self.a.value.clone(),
            self.b.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let mut c = c.write();
            Buffer::read_pair(&a, &b, |a, b| {
                if !matmul_gpu(a, b, &mut c, dims) {
                    matmul_cpu(a, b, &mut c, dims);
                }
            });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let MatMulDims {
            m,
            k,
            n,
            batch,
            a_batched,
            b_batched,
            alpha,
        } = self.dims;
        let dims = self.dims;
        let (a, b) = (self.a.clone(), self.b.clone());
        let dc = self.output.grad.clone();
        cmd.encode(move || {
            let g = dc.read();
            // dA += alpha · G × Bᵀ
            {
                let bv = b.value.read();
                let mut da = a.grad.write();
                da.par_chunks_mut(k).enumerate().for_each(|(r, row)| {
                    let (zs, i) = if a_batched {
                        (r / m..r / m + 1, r % m)
                    } else {
                        (0..batch, r)
                    };
                    for z in zs {
                        let g_row = &g[z * m * n + i * n..][..n];
                        let b_mat = &bv[dims.b_offset(z)..];
                        for (p, dx) in row.iter_mut().enumerate() {
                            let b_row = &b_mat[p * n..][..n];
                            let dot: f32 = g_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
                            *dx += alpha * dot;
                        }
                    }
                });
            }
            // dB += alpha · Aᵀ × G
            let av = a.value.read();
            let mut db = b.grad.write();
            db.par_chunks_mut(n).enumerate().for_each(|(r, row)| {
                let (zs, p) = if b_batched {
                    (r / k..r / k + 1, r % k)
                } else {
                    (0..batch, r)
                };
                for z in zs {
                    let a_mat = &av[dims.a_offset(z)..];
                    for i in 0..m {
                        let a_ip = alpha * a_mat[i * k + p];
                        let g_row = &g[z * m * n + i * n..][..n];
                        for (dx, &gv) in row.iter_mut().zip(g_row) {
                            *dx += a_ip * gv;
                        }
                    }
                }
            });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "matmul"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_left_operand() {
        // a: 2x2 shared, b: two 2x1 slices
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 1.0, 2.0, 0.0];
        let mut c = [0.0; 4];
        let dims = MatMulDims {
            m: 2,
            k: 2,
            n: 1,
            batch: 2,
            a_batched: false,
            b_batched: true,
            alpha: 0.5,
        };
        matmul_cpu(&a, &b, &mut c, dims);
        assert_eq!(c, [1.5, 3.5, 1.0, 3.0]);
    }
}
