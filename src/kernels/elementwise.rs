use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;

/// `out = a + b` over equally long operands.
pub(crate) struct AddEqual {
    a: Storage,
    b: Storage,
    output: Storage,
}

impl AddEqual {
    pub(crate) fn new(a: Storage, b: Storage, output: Storage) -> Self {
        Self { a, b, output }
    }
}

impl Kernel for AddEqual {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (a, b, y) = (
            self.a.value.clone(),
            self.b.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let mut y = y.write();
            Buffer::read_pair(&a, &b, |a, b| {
                y.par_iter_mut()
                    .zip(a.par_iter().zip(b.par_iter()))
                    .for_each(|(y, (&a, &b))| *y = a + b);
            });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (da, db, dy) = (
            self.a.grad.clone(),
            self.b.grad.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let dy = dy.read();
            for target in [&da, &db] {
                let mut dx = target.write();
                dx.par_iter_mut()
                    .zip(dy.par_iter())
                    .for_each(|(dx, &g)| *dx += g);
            }
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "add_equal"
    }
}

/// `out = a ⊙ b` over equally long operands.
pub(crate) struct MulEqual {
    a: Storage,
    b: Storage,
    output: Storage,
}

impl MulEqual {
    pub(crate) fn new(a: Storage, b: Storage, output: Storage) -> Self {
        Self { a, b, output }
    }
}

impl Kernel for MulEqual {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (a, b, y) = (
            self.a.value.clone(),
            self.b.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let mut y = y.write();
            Buffer::read_pair(&a, &b, |a, b| {
                y.par_iter_mut()
                    .zip(a.par_iter().zip(b.par_iter()))
                    .for_each(|(y, (&a, &b))| *y = a * b);
            });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (a, b) = (self.a.clone(), self.b.clone());
        let dy = self.output.grad.clone();
        cmd.encode(move || {
            let dy = dy.read();
            // each operand's gradient is scaled by the other operand's value
            for (target, other) in [(&a.grad, &b.value), (&b.grad, &a.value)] {
                let other = other.read();
                let mut dx = target.write();
                dx.par_iter_mut()
                    .zip(dy.par_iter().zip(other.par_iter()))
                    .for_each(|(dx, (&g, &o))| *dx += g * o);
            }
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "mul_equal"
    }
}
