//! Host kernels implementing the [`Kernel`](crate::kernel::Kernel) contract.
//!
//! # Features
//!
//! - One kernel type per operation family, each bound to fixed node storages.
//! - Parallel execution using [`rayon`](https://docs.rs/rayon).
//! - Matrix multiply and the Adam update dispatch to `wgpu` compute shaders
//!   when that backend is active, falling back to the host path on failure.
//!
//! ## Design Highlights
//!
//! - Commands capture buffer handles, never node handles, so the graph can
//!   be dropped while a chain is still executing.
//! - Backward commands only ever add into operand gradients.
//! - At most one gradient write lock is held at a time. Operands may alias
//!   (`x * x`, a view next to its source).

mod activation;
mod broadcast;
mod conv;
mod dropout;
mod elementwise;
mod embeddings;
mod loss;
mod matmul;
mod maxpool;
mod norm;
mod rope;
mod softmax;
mod transpose;
mod upsample;
mod vae;

pub(crate) use self::activation::{Activation, Unary};
pub(crate) use self::broadcast::{Axis, Broadcast, Combine};
pub(crate) use self::conv::{Conv, ConvGeometry};
pub(crate) use self::dropout::Dropout;
pub(crate) use self::elementwise::{AddEqual, MulEqual};
pub(crate) use self::embeddings::{Embeddings, PositionalAdd};
pub(crate) use self::loss::{BinaryCrossEntropy, Mean, NllPos};
pub(crate) use self::matmul::{MatMul, MatMulDims};
pub(crate) use self::maxpool::{MaxPool, PoolGeometry};
pub(crate) use self::norm::{LayerNorm, RmsNorm};
pub(crate) use self::rope::RopeCols;
pub(crate) use self::softmax::{Softmax, TrilMask};
pub(crate) use self::transpose::Transpose;
pub(crate) use self::upsample::Upsample2d;
pub(crate) use self::vae::{VaeKl, VaeSample};
