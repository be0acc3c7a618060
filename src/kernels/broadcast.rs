//! Broadcasting of a small operand across the rows or columns of a larger one.
//!
//! The output always has the larger operand's shape. Backward passes reduce
//! the output gradient over the broadcast axis and add the sums into the
//! small operand's gradient.

use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::kernel::Kernel;
use crate::node::Storage;
use crate::shape::Shape;

/// Which axis the small operand is repeated along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Axis {
    /// `b` has one value per column (`w` values), repeated down every row.
    Row,
    /// `b` has one value per row (`h` values), repeated across columns and depth slices.
    Col,
}

/// Combining function applied between the large and small operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Combine {
    Add,
    Mul,
}

pub(crate) struct Broadcast {
    axis: Axis,
    combine: Combine,
    shape: Shape,
    a: Storage,
    b: Storage,
    output: Storage,
}

impl Broadcast {
    pub(crate) fn new(
        axis: Axis,
        combine: Combine,
        shape: Shape,
        a: Storage,
        b: Storage,
        output: Storage,
    ) -> Self {
        Self {
            axis,
            combine,
            shape,
            a,
            b,
            output,
        }
    }
}

fn small_index(axis: Axis, shape: Shape, i: usize) -> usize {
    match axis {
        Axis::Row => i % shape.w,
        Axis::Col => (i / shape.w) % shape.h,
    }
}

/// Sum of `f(i)` over all flat indices `i` that map onto `j` of the small operand.
fn reduce_onto(axis: Axis, shape: Shape, j: usize, f: impl Fn(usize) -> f32) -> f32 {
    match axis {
        Axis::Row => (0..shape.rows()).map(|r| f(r * shape.w + j)).sum(),
        Axis::Col => (0..shape.d)
            .flat_map(|d| {
                let start = d * shape.slice_len() + j * shape.w;
                start..start + shape.w
            })
            .map(f)
            .sum(),
    }
}

impl Kernel for Broadcast {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (axis, combine, shape) = (self.axis, self.combine, self.shape);
        let (a, b, y) = (
            self.a.value.clone(),
            self.b.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let a = a.read();
            let b = b.read();
            let mut y = y.write();
            y.par_iter_mut().enumerate().for_each(|(i, y)| {
                let s = b[small_index(axis, shape, i)];
                *y = match combine {
                    Combine::Add => a[i] + s,
                    Combine::Mul => a[i] * s,
                };
            });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (axis, combine, shape) = (self.axis, self.combine, self.shape);
        let (a, b) = (self.a.clone(), self.b.clone());
        let dy = self.output.grad.clone();
        cmd.encode(move || {
            let dy = dy.read();
            {
                let mut da = a.grad.write();
                match combine {
                    Combine::Add => da
                        .par_iter_mut()
                        .zip(dy.par_iter())
                        .for_each(|(dx, &g)| *dx += g),
                    Combine::Mul => {
                        let bv = b.value.read();
                        da.par_iter_mut().enumerate().for_each(|(i, dx)| {
                            *dx += dy[i] * bv[small_index(axis, shape, i)];
                        });
                    }
                }
            }
            let mut db = b.grad.write();
            match combine {
                Combine::Add => db.par_iter_mut().enumerate().for_each(|(j, dx)| {
                    *dx += reduce_onto(axis, shape, j, |i| dy[i]);
                }),
                Combine::Mul => {
                    let av = a.value.read();
                    db.par_iter_mut().enumerate().for_each(|(j, dx)| {
                        *dx += reduce_onto(axis, shape, j, |i| dy[i] * av[i]);
                    });
                }
            }
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        match (self.axis, self.combine) {
            (Axis::Row, Combine::Add) => "add_row",
            (Axis::Row, Combine::Mul) => "mul_row",
            (Axis::Col, Combine::Add) => "add_col",
            (Axis::Col, Combine::Mul) => "mul_col",
        }
    }
}
