//! Parameter update schedulers.
//!
//! An [`Optimizer`] is a factory: bound once to the parameter list of a
//! compiled graph it yields a [`ParameterUpdate`], which encodes one step per
//! training iteration into the command buffer the pipeline hands it.
//!
//! ```no_run
//! # use gradpipe::{Device, DeviceConfig, Shape, optim::{AdamConfig, Optimizer, ParameterUpdate}};
//! # fn main() -> gradpipe::Result<()> {
//! let device = Device::new(DeviceConfig::default())?;
//! let w = device.new_parameter("w", Shape::vector(3), &[0.5, -0.5, 1.0])?;
//! let loss = device.mean(&device.mul_equal(&w, &w)?)?;
//! let pipeline = device.compile(&loss);
//! let mut adam = AdamConfig::default().bind(&pipeline.parameters())?;
//! for iteration in 0..100 {
//!     pipeline.train_iteration(|cmd| adam.update(cmd, iteration))?;
//! }
//! # Ok(())
//! # }
//! ```

mod adam;

pub use self::adam::{Adam, AdamConfig};
#[cfg(feature = "wgpu")]
pub(crate) use self::adam::AdamStep;

use crate::command::CommandBuffer;
use crate::error::Result;
use crate::node::Tensor;

/// Per-iteration parameter step.
pub trait ParameterUpdate {
    /// Encodes the step for zero-based `iteration` into `cmd`.
    fn update(&mut self, cmd: &mut CommandBuffer, iteration: usize);
}

impl<F> ParameterUpdate for F
where
    F: FnMut(&mut CommandBuffer, usize),
{
    fn update(&mut self, cmd: &mut CommandBuffer, iteration: usize) {
        self(cmd, iteration)
    }
}

/// Builds a [`ParameterUpdate`] for a fixed parameter list.
pub trait Optimizer {
    /// The bound scheduler.
    type Update: ParameterUpdate;

    /// Allocates per-parameter state for `params`.
    ///
    /// # Errors
    /// Returns an allocation error if optimizer state cannot be reserved.
    fn bind(&self, params: &[Tensor]) -> Result<Self::Update>;
}
