//! Rotary position embedding over feature columns.
//!
//! Each `w`-wide row is a token at position `y` (its row within the depth
//! slice). The row is split into heads of `head_size` features, and every
//! adjacent pair `(2i, 2i+1)` of a head is rotated by
//! `θ = y · base^(-2i / head_size)`.

use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;
use crate::shape::Shape;

pub(crate) const ROPE_BASE: f32 = 10_000.0;

pub(crate) struct RopeCols {
    shape: Shape,
    head_size: usize,
    input: Storage,
    output: Storage,
}

impl RopeCols {
    pub(crate) fn new(shape: Shape, head_size: usize, input: Storage, output: Storage) -> Self {
        Self {
            shape,
            head_size,
            input,
            output,
        }
    }
}

/// Rotates every pair of `src` into `dst` for a row at `position`; `sign = -1` undoes the rotation.
fn rotate_row(src: &[f32], dst: &mut [f32], position: usize, head_size: usize, sign: f32, accumulate: bool) {
    for (head_src, head_dst) in src.chunks(head_size).zip(dst.chunks_mut(head_size)) {
        for i in 0..head_size / 2 {
            let freq = ROPE_BASE.powf(-2.0 * i as f32 / head_size as f32);
            let (sin, cos) = (position as f32 * freq).sin_cos();
            let sin = sign * sin;
            let (a, b) = (head_src[2 * i], head_src[2 * i + 1]);
            let ra = a * cos - b * sin;
            let rb = a * sin + b * cos;
            if accumulate {
                head_dst[2 * i] += ra;
                head_dst[2 * i + 1] += rb;
            } else {
                head_dst[2 * i] = ra;
                head_dst[2 * i + 1] = rb;
            }
        }
    }
}

impl Kernel for RopeCols {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (shape, head_size) = (self.shape, self.head_size);
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            y.par_chunks_mut(shape.w)
                .zip(x.par_chunks(shape.w))
                .enumerate()
                .for_each(|(r, (dst, src))| rotate_row(src, dst, r % shape.h, head_size, 1.0, false));
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (shape, head_size) = (self.shape, self.head_size);
        let (dx, dy) = (self.input.grad.clone(), self.output.grad.clone());
        cmd.encode(move || {
            let dy = dy.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(shape.w)
                .zip(dy.par_chunks(shape.w))
                .enumerate()
                .for_each(|(r, (dst, src))| rotate_row(src, dst, r % shape.h, head_size, -1.0, true));
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "rope_cols"
    }
}
