use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;
use crate::shape::Shape;

/// Swaps width and height within every depth slice.
pub(crate) struct Transpose {
    shape: Shape,
    input: Storage,
    output: Storage,
}

impl Transpose {
    /// `shape` is the input shape; the output is `h × w × d`.
    pub(crate) fn new(shape: Shape, input: Storage, output: Storage) -> Self {
        Self {
            shape,
            input,
            output,
        }
    }
}

impl Kernel for Transpose {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let Shape { w, h, .. } = self.shape;
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            y.par_chunks_mut(w * h)
                .zip(x.par_chunks(w * h))
                .for_each(|(out, src)| {
                    for row in 0..h {
                        for col in 0..w {
                            out[col * h + row] = src[row * w + col];
                        }
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let Shape { w, h, .. } = self.shape;
        let (dx, dy) = (self.input.grad.clone(), self.output.grad.clone());
        cmd.encode(move || {
            let dy = dy.read();
            let mut dx = dx.write();
            dx.par_chunks_mut(w * h)
                .zip(dy.par_chunks(w * h))
                .for_each(|(dx, g)| {
                    for row in 0..h {
                        for col in 0..w {
                            dx[row * w + col] += g[col * h + row];
                        }
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "transpose"
    }
}
