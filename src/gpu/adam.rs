use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::optim::AdamStep;

use super::{context, spread_groups, to_u32};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    len: u32,
    beta1: f32,
    beta2: f32,
    lr: f32,
    v_correction: f32,
    eps: f32,
    pad0: u32,
    pad1: u32,
}

/// One Adam step on the GPU; `value`, `m` and `v` are updated in place.
pub(crate) fn adam(
    value: &mut [f32],
    grad: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    step: AdamStep,
) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    let ctx = context()?;
    let params = Params {
        len: to_u32(value.len(), "parameter length")?,
        beta1: step.beta1,
        beta2: step.beta2,
        lr: step.learning_rate,
        v_correction: step.v_correction,
        eps: step.eps,
        pad0: 0,
        pad1: 0,
    };
    let uniform = ctx.uniform("adam_params", &params);
    let x = ctx.storage("adam_value", value);
    let dx = ctx.storage("adam_grad", grad);
    let m1 = ctx.storage("adam_m", m);
    let m2 = ctx.storage("adam_v", v);
    let (gx, gy) = spread_groups(params.len.div_ceil(64));
    ctx.run(
        &ctx.adam,
        &[&uniform, &x, &dx, &m1, &m2],
        (gx, gy, 1),
        &mut [(&x, value), (&m1, m), (&m2, v)],
    )
}
