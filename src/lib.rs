//! gradpipe: a lazily built tensor graph with reverse-mode autodiff, replayed
//! through batched command buffers.
//!
//! Models are assembled once by calling [`Device`] methods, one per
//! operation. Nothing is computed while the graph grows: every call allocates
//! an output node and binds a kernel to it. [`Device::compile`] then freezes
//! the graph behind a terminal node into a [`Pipeline`], which replays the
//! forward pass, the backward pass and an optimizer step every iteration,
//! batching the kernel dispatches into command buffers that execute on a
//! dedicated queue thread.
//!
//! # Features
//!
//! - Value and gradient buffers per node; gradients accumulate across every
//!   consumer and are reset once per storage owner before each backward pass.
//! - Zero-copy reshapes that alias their source's storage.
//! - Convolution, pooling, normalisation, attention masking, embeddings,
//!   dropout, VAE heads and the usual losses.
//! - Adam with precomputed bias corrections.
//! - Parameter snapshots keyed by name.
//! - Optional `wgpu` compute shaders for matrix multiply and the Adam step.
//!
//! # Modules
//!
//! - [`device`]: the operation builder.
//! - [`pipeline`]: topologically ordered replay plans.
//! - [`command`]: command buffers, chains and the executing queue.
//! - [`node`], [`buffer`], [`shape`]: the graph's data model.
//! - [`optim`], [`init`]: parameter updates and initialisation.
//! - [`checkpoint`]: saving and restoring parameter values.
//!
//! # Example
//!
//! ```rust
//! use gradpipe::{Device, Shape, optim::Optimizer};
//!
//! # fn main() -> gradpipe::Result<()> {
//! let device = Device::cpu()?;
//! let x = device.new_data_with_values(Shape::vector(2), &[1.0, 2.0])?;
//! let w = device.new_parameter("w", Shape::vector(2), &[0.0, 0.0])?;
//! let err = device.add_equal(&x, &w)?;
//! let loss = device.mean(&device.mul_equal(&err, &err)?)?;
//!
//! let pipeline = device.compile(&loss);
//! let mut adam = device
//!     .optimizer_adam(300, 0.9, 0.999, 0.05, 1e-8)
//!     .bind(&pipeline.parameters())?;
//! for i in 0..300 {
//!     pipeline.train_step(&mut adam, i)?;
//! }
//! assert!(pipeline.evaluate()?[0] < 1e-2);
//! # Ok(())
//! # }
//! ```

pub mod approx;
pub mod backend;
pub mod buffer;
pub mod checkpoint;
pub mod command;
pub mod device;
pub mod error;
pub mod init;
pub mod kernel;
pub mod node;
pub mod optim;
pub mod pipeline;
pub mod shape;

#[cfg(feature = "wgpu")]
mod gpu;
pub(crate) mod kernels;

pub use crate::backend::Backend;
pub use crate::buffer::Buffer;
pub use crate::command::{CommandBuffer, CommandChain, CommandQueue};
pub use crate::device::{Device, DeviceConfig};
pub use crate::error::{Error, Result};
pub use crate::kernel::Kernel;
pub use crate::node::{NodeKind, Storage, Tensor};
pub use crate::pipeline::Pipeline;
pub use crate::shape::Shape;
