use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::kernels::MatMulDims;

use super::{MAX_GROUPS_PER_AXIS, context, to_u32};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    m: u32,
    k: u32,
    n: u32,
    batch: u32,
    a_batched: u32,
    b_batched: u32,
    alpha: f32,
    pad0: u32,
}

/// Workgroups along (columns, rows, batch) for 8×8 output tiles.
///
/// Every axis must fit the per-dimension dispatch limit; oversized problems
/// are left to the cpu path.
fn dispatch_groups(m: u32, n: u32, batch: u32) -> Result<(u32, u32, u32)> {
    let groups = (n.div_ceil(8), m.div_ceil(8), batch);
    if groups.0.max(groups.1).max(groups.2) > MAX_GROUPS_PER_AXIS {
        return Err(Error::Gpu(format!(
            "matmul dispatch {groups:?} exceeds {MAX_GROUPS_PER_AXIS} workgroups per axis"
        )));
    }
    Ok(groups)
}

/// `c = alpha · a × b` on the GPU, overwriting `c`.
pub(crate) fn matmul(a: &[f32], b: &[f32], c: &mut [f32], dims: MatMulDims) -> Result<()> {
    if c.is_empty() {
        return Ok(());
    }
    if dims.k == 0 {
        c.fill(0.0);
        return Ok(());
    }
    let params = Params {
        m: to_u32(dims.m, "rows")?,
        k: to_u32(dims.k, "inner extent")?,
        n: to_u32(dims.n, "columns")?,
        batch: to_u32(dims.batch, "batch")?,
        a_batched: u32::from(dims.a_batched),
        b_batched: u32::from(dims.b_batched),
        alpha: dims.alpha,
        pad0: 0,
    };
    let groups = dispatch_groups(params.m, params.n, params.batch)?;
    let ctx = context()?;
    let uniform = ctx.uniform("matmul_params", &params);
    let lhs = ctx.storage("matmul_a", a);
    let rhs = ctx.storage("matmul_b", b);
    let out = ctx.output("matmul_c", c.len());
    ctx.run(
        &ctx.matmul,
        &[&uniform, &lhs, &rhs, &out],
        groups,
        &mut [(&out, c)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_every_tile() {
        assert_eq!(dispatch_groups(9, 16, 3).unwrap(), (2, 2, 3));
        assert_eq!(dispatch_groups(1, 1, MAX_GROUPS_PER_AXIS).unwrap(), (1, 1, 65_535));
    }

    #[test]
    fn deep_batches_are_rejected() {
        let err = dispatch_groups(4, 4, MAX_GROUPS_PER_AXIS + 1).unwrap_err();
        assert!(matches!(err, Error::Gpu(_)), "{err}");
        assert!(dispatch_groups(8 * 70_000, 4, 1).is_err());
    }
}
