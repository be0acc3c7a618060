//! The seam between the graph and the numeric kernels.

use crate::command::CommandBuffer;

/// A forward/backward pair bound to fixed node buffers at construction time.
///
/// `forward` encodes commands that read operand values and overwrite the
/// output value. `backward` encodes commands that read the output gradient
/// (and whatever forward state the kernel keeps) and *accumulate* into the
/// operand gradients, never overwriting them.
///
/// Neither method executes anything: both only append to `cmd`.
pub trait Kernel: Send + Sync {
    /// Encodes the forward computation.
    fn forward(&self, cmd: &mut CommandBuffer);

    /// Encodes the gradient accumulation.
    fn backward(&self, cmd: &mut CommandBuffer);

    /// Short name used in logs and `Debug` output.
    fn name(&self) -> &'static str;
}
