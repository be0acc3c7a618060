use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;
use crate::shape::Shape;

/// Nearest-neighbour upsampling by an integer factor in both spatial axes.
pub(crate) struct Upsample2d {
    input_shape: Shape,
    scale: usize,
    input: Storage,
    output: Storage,
}

impl Upsample2d {
    pub(crate) fn new(input_shape: Shape, scale: usize, input: Storage, output: Storage) -> Self {
        Self {
            input_shape,
            scale,
            input,
            output,
        }
    }
}

impl Kernel for Upsample2d {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (Shape { w, h, .. }, s) = (self.input_shape, self.scale);
        let (x, y) = (self.input.value.clone(), self.output.value.clone());
        cmd.encode(move || {
            let x = x.read();
            let mut y = y.write();
            let out_w = w * s;
            y.par_chunks_mut(out_w * h * s)
                .zip(x.par_chunks(w * h))
                .for_each(|(out, src)| {
                    for (i, v) in out.iter_mut().enumerate() {
                        let (oy, ox) = (i / out_w, i % out_w);
                        *v = src[(oy / s) * w + ox / s];
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (Shape { w, h, .. }, s) = (self.input_shape, self.scale);
        let (dx, dy) = (self.input.grad.clone(), self.output.grad.clone());
        cmd.encode(move || {
            let dy = dy.read();
            let mut dx = dx.write();
            let out_w = w * s;
            dx.par_chunks_mut(w * h)
                .zip(dy.par_chunks(out_w * h * s))
                .for_each(|(dx, g)| {
                    for (i, &gv) in g.iter().enumerate() {
                        let (oy, ox) = (i / out_w, i % out_w);
                        dx[(oy / s) * w + ox / s] += gv;
                    }
                });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "upsample_2d"
    }
}
