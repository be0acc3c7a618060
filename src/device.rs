//! Graph builder.
//!
//! A [`Device`] owns the command queue that executes kernels and exposes one
//! method per graph operation. Each method checks its operands' shapes,
//! allocates the output node, binds the kernel to the operand and output
//! storages, and returns the new [`Tensor`] for further composition. Nothing
//! runs until a [`Pipeline`] compiled from the result is invoked.
//!
//! Shape mismatches and impossible arguments are bugs in the model being
//! built, so they panic with a descriptive message. Only allocation failures
//! are returned as errors.
//!
//! # Example
//!
//! ```
//! use gradpipe::{Device, Shape};
//!
//! # fn main() -> gradpipe::Result<()> {
//! let device = Device::cpu()?;
//! let a = device.new_data_with_values(Shape::vector(3), &[1.0, 2.0, 3.0])?;
//! let b = device.new_data_with_values(Shape::vector(3), &[4.0, 5.0, 6.0])?;
//! let y = device.mul_equal(&a, &b)?;
//! let pipeline = device.compile(&y);
//! assert_eq!(pipeline.evaluate()?, vec![4.0, 10.0, 18.0]);
//! # Ok(())
//! # }
//! ```

use rand::Rng;

use crate::backend::{Backend, claim_backend, get_backend};
use crate::command::{CommandBuffer, CommandQueue};
use crate::error::Result;
use crate::init::{Distribution, Initializer};
use crate::kernel::Kernel;
use crate::kernels::{
    Activation, AddEqual, Axis, BinaryCrossEntropy, Broadcast, Combine, Conv, ConvGeometry,
    Dropout, Embeddings, LayerNorm, MatMul, MatMulDims, MaxPool, Mean, MulEqual, NllPos,
    PoolGeometry, PositionalAdd, RmsNorm, RopeCols, Softmax, Transpose, TrilMask, Unary,
    Upsample2d, VaeKl, VaeSample,
};
use crate::node::{NodeKind, Storage, Tensor};
use crate::optim::AdamConfig;
use crate::pipeline::Pipeline;
use crate::shape::Shape;

/// Environment variable selecting the backend (`cpu` or `wgpu`).
pub const ENV_BACKEND: &str = "GRADPIPE_BACKEND";
/// Environment variable overriding [`DeviceConfig::commands_per_buffer`].
pub const ENV_COMMANDS_PER_BUFFER: &str = "GRADPIPE_COMMANDS_PER_BUFFER";

const DEFAULT_COMMANDS_PER_BUFFER: usize = 64;

/// Settings a [`Device`] is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Backend selected when the device is created.
    ///
    /// The selection is process-wide (see [`crate::backend`]): it applies
    /// to every device's queue, not just this one.
    pub backend: Backend,
    /// Node dispatches encoded before a pipeline commits and continues.
    pub commands_per_buffer: usize,
    /// Queue label, also the worker thread name prefix.
    pub label: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Cpu,
            commands_per_buffer: DEFAULT_COMMANDS_PER_BUFFER,
            label: "gradpipe".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by [`ENV_BACKEND`] and [`ENV_COMMANDS_PER_BUFFER`].
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_BACKEND) {
            match raw.parse() {
                Ok(backend) => config.backend = backend,
                Err(err) => log::warn!("{ENV_BACKEND}: {err}"),
            }
        }
        if let Ok(raw) = std::env::var(ENV_COMMANDS_PER_BUFFER) {
            match raw.trim().parse::<usize>() {
                Ok(n) => config = config.with_commands_per_buffer(n),
                Err(err) => log::warn!("{ENV_COMMANDS_PER_BUFFER}=`{raw}`: {err}"),
            }
        }
        config
    }

    /// Sets the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the batching threshold; values below 1 are raised to 1.
    pub fn with_commands_per_buffer(mut self, n: usize) -> Self {
        self.commands_per_buffer = n.max(1);
        self
    }

    /// Sets the queue label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Output extent of a sliding window along one axis.
fn window_extent(input: usize, window: usize, padding: usize, stride: usize) -> usize {
    let padded = input + 2 * padding;
    assert!(
        padded >= window,
        "window of {window} does not fit an extent of {input} with padding {padding}"
    );
    (padded - window) / stride + 1
}

/// Operation factory and owner of the execution queue.
#[derive(Clone)]
pub struct Device {
    config: DeviceConfig,
    backend: Backend,
    queue: CommandQueue,
}

impl Device {
    /// Creates a device, selects its backend and starts its queue worker.
    ///
    /// The backend is a process-wide setting, so a device created with a
    /// different backend than an earlier one switches both of them.
    ///
    /// # Errors
    /// Returns [`Error::Io`](crate::Error::Io) if the worker thread cannot be spawned.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let replaced = claim_backend(config.backend);
        #[cfg(feature = "wgpu")]
        if get_backend() == Backend::Wgpu {
            if let Err(err) = crate::gpu::context() {
                log::warn!("{err}; falling back to cpu");
                crate::backend::set_backend(Backend::Cpu);
            }
        }
        let backend = get_backend();
        if let Some(previous) = replaced.filter(|&previous| previous != backend) {
            log::warn!(
                "{}: switching every device from {previous:?} to {backend:?}",
                config.label
            );
        }
        let queue = CommandQueue::new(&config.label)?;
        log::debug!(
            "{}: device ready on {backend:?}, {} commands per buffer",
            config.label,
            config.commands_per_buffer
        );
        Ok(Self {
            config,
            backend,
            queue,
        })
    }

    /// A CPU device with default settings.
    ///
    /// # Errors
    /// See [`Device::new`].
    pub fn cpu() -> Result<Self> {
        Self::new(DeviceConfig::default())
    }

    /// Settings this device was created with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Backend that was active once this device was set up.
    ///
    /// A later device may have switched the process-wide backend since; see
    /// [`get_backend`](crate::backend::get_backend) for the current one.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The queue kernels of this device execute on.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// A fresh chain on this device's queue, for encoding work by hand.
    pub fn command_buffer(&self) -> CommandBuffer {
        self.queue.command_buffer()
    }

    /// Freezes the graph ending at `terminal` into a replay plan.
    pub fn compile(&self, terminal: &Tensor) -> Pipeline {
        Pipeline::new(self.queue.clone(), terminal, self.config.commands_per_buffer)
    }

    /// Adam hyperparameters, bound later with [`Optimizer::bind`](crate::optim::Optimizer::bind).
    pub fn optimizer_adam(
        &self,
        iterations: usize,
        beta1: f32,
        beta2: f32,
        learning_rate: f32,
        eps: f32,
    ) -> AdamConfig {
        AdamConfig::new(iterations, beta1, beta2, learning_rate, eps)
    }

    fn op<K, F>(&self, shape: Shape, deps: &[&Tensor], kernel: F) -> Result<Tensor>
    where
        K: Kernel + 'static,
        F: FnOnce(Storage) -> Result<K>,
    {
        let storage = Storage::zeroed(shape.len())?;
        let kernel = kernel(storage.clone())?;
        let deps = deps.iter().map(|t| (*t).clone()).collect();
        Ok(Tensor::operation(shape, storage, deps, Box::new(kernel)))
    }

    fn unary(&self, activation: Activation, x: &Tensor) -> Result<Tensor> {
        self.op(x.shape(), &[x], |out| {
            Ok(Unary::new(activation, x.storage().clone(), out))
        })
    }

    fn broadcast(
        &self,
        axis: Axis,
        combine: Combine,
        a: &Tensor,
        b: &Tensor,
    ) -> Result<Tensor> {
        let shape = a.shape();
        self.op(shape, &[a, b], |out| {
            Ok(Broadcast::new(
                axis,
                combine,
                shape,
                a.storage().clone(),
                b.storage().clone(),
                out,
            ))
        })
    }

    // ---- leaves -------------------------------------------------------------

    /// A zero-filled input.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`](crate::Error::Allocation) if the buffers cannot be reserved.
    pub fn new_data(&self, shape: Shape) -> Result<Tensor> {
        let storage = Storage::zeroed(shape.len())?;
        Ok(Tensor::leaf(shape, storage, NodeKind::Input, None))
    }

    /// Same as [`Device::new_data`]; kept for call sites that want the
    /// fallible nature spelled out.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn try_new_data(&self, shape: Shape) -> Result<Tensor> {
        self.new_data(shape)
    }

    /// An input holding a copy of `values`.
    ///
    /// # Panics
    /// Panics if `values.len() != shape.len()`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn new_data_with_values(&self, shape: Shape, values: &[f32]) -> Result<Tensor> {
        assert_eq!(
            values.len(),
            shape.len(),
            "shape {shape} needs {} values, got {}",
            shape.len(),
            values.len()
        );
        let storage = Storage::with_values(values.to_vec())?;
        Ok(Tensor::leaf(shape, storage, NodeKind::Input, None))
    }

    /// A named trainable parameter initialised to `values`.
    ///
    /// # Panics
    /// Panics if `values.len() != shape.len()`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn new_parameter(&self, name: &str, shape: Shape, values: &[f32]) -> Result<Tensor> {
        assert_eq!(
            values.len(),
            shape.len(),
            "parameter `{name}` of shape {shape} needs {} values, got {}",
            shape.len(),
            values.len()
        );
        let storage = Storage::with_values(values.to_vec())?;
        Ok(Tensor::leaf(
            shape,
            storage,
            NodeKind::Parameter,
            Some(name.to_string()),
        ))
    }

    fn sampled_parameter<R: Rng>(
        &self,
        name: Option<String>,
        shape: Shape,
        distribution: Distribution,
        w: f32,
        rng: &mut R,
    ) -> Result<Tensor> {
        let storage = Storage::zeroed(shape.len())?;
        distribution.fill(w, rng, &mut storage.value.write());
        Ok(Tensor::leaf(shape, storage, NodeKind::Parameter, name))
    }

    /// An unnamed parameter sampled from `U(-w, w)`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn new_data_rand_uniform_weighted<R: Rng>(
        &self,
        shape: Shape,
        w: f32,
        rng: &mut R,
    ) -> Result<Tensor> {
        self.sampled_parameter(None, shape, Distribution::Uniform, w, rng)
    }

    /// An unnamed parameter sampled from `N(0, w²)`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn new_data_rand_normal_weighted<R: Rng>(
        &self,
        shape: Shape,
        w: f32,
        rng: &mut R,
    ) -> Result<Tensor> {
        self.sampled_parameter(None, shape, Distribution::Normal, w, rng)
    }

    /// A named parameter whose scale and distribution come from `init`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn init_parameter<R: Rng>(
        &self,
        name: &str,
        shape: Shape,
        init: &dyn Initializer,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        let w = init.norm_k(fan_in, fan_out);
        self.sampled_parameter(Some(name.to_string()), shape, init.distribution(), w, rng)
    }

    /// A `features × alphabet` lookup table sampled from `U(-w, w)`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn new_token_embedding_table<R: Rng>(
        &self,
        name: &str,
        features: usize,
        alphabet: usize,
        w: f32,
        rng: &mut R,
    ) -> Result<Tensor> {
        self.sampled_parameter(
            Some(name.to_string()),
            Shape::matrix(features, alphabet),
            Distribution::Uniform,
            w,
            rng,
        )
    }

    // ---- views --------------------------------------------------------------

    /// Reinterprets `x` under `shape` without copying.
    ///
    /// The result shares `x`'s value and gradient buffers and has no kernel.
    ///
    /// # Panics
    /// Panics if the element counts differ.
    pub fn reshape(&self, x: &Tensor, shape: Shape) -> Tensor {
        assert_eq!(
            x.len(),
            shape.len(),
            "cannot reshape {} into {shape}",
            x.shape()
        );
        Tensor::view(shape, x)
    }

    // ---- elementwise --------------------------------------------------------

    /// `a + b`, dispatched on the operand shapes.
    ///
    /// Equal shapes add elementwise; a `(W,1,1)` right operand matching `a`'s
    /// width is added to every row.
    ///
    /// # Panics
    /// Panics for any other shape combination.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        if a.shape() == b.shape() {
            self.add_equal(a, b)
        } else if b.shape().is_row_vector() && b.shape().w == a.shape().w {
            self.add_row(a, b)
        } else {
            panic!("add of {} and {} is not implemented", a.shape(), b.shape())
        }
    }

    /// Elementwise `a + b`.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn add_equal(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        assert_eq!(
            a.shape(),
            b.shape(),
            "add_equal needs equal shapes, got {} and {}",
            a.shape(),
            b.shape()
        );
        self.op(a.shape(), &[a, b], |out| {
            Ok(AddEqual::new(a.storage().clone(), b.storage().clone(), out))
        })
    }

    /// Elementwise `a · b`.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn mul_equal(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        assert_eq!(
            a.len(),
            b.len(),
            "mul_equal needs equal lengths, got {} and {}",
            a.shape(),
            b.shape()
        );
        self.op(a.shape(), &[a, b], |out| {
            Ok(MulEqual::new(a.storage().clone(), b.storage().clone(), out))
        })
    }

    /// Adds the `W` values of `b` to every row of `a`.
    ///
    /// # Panics
    /// Panics unless `b` holds exactly `a.w` values.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn add_row(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        assert_eq!(
            b.len(),
            a.shape().w,
            "add_row needs {} values, got {}",
            a.shape().w,
            b.shape()
        );
        self.broadcast(Axis::Row, Combine::Add, a, b)
    }

    /// Multiplies every row of `a` by the `W` values of `b`.
    ///
    /// # Panics
    /// Panics unless `b` holds exactly `a.w` values.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn mul_row(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        assert_eq!(
            b.len(),
            a.shape().w,
            "mul_row needs {} values, got {}",
            a.shape().w,
            b.shape()
        );
        self.broadcast(Axis::Row, Combine::Mul, a, b)
    }

    /// Adds `b[y]` to row `y` of every depth slice of `a`.
    ///
    /// # Panics
    /// Panics unless `b` holds exactly `a.h` values.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn add_col(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        assert_eq!(
            b.len(),
            a.shape().h,
            "add_col needs {} values, got {}",
            a.shape().h,
            b.shape()
        );
        self.broadcast(Axis::Col, Combine::Add, a, b)
    }

    /// Multiplies row `y` of every depth slice of `a` by `b[y]`.
    ///
    /// # Panics
    /// Panics unless `b` holds exactly `a.h` values.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn mul_col(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        assert_eq!(
            b.len(),
            a.shape().h,
            "mul_col needs {} values, got {}",
            a.shape().h,
            b.shape()
        );
        self.broadcast(Axis::Col, Combine::Mul, a, b)
    }

    // ---- activations --------------------------------------------------------

    /// `max(x, 0)`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn relu(&self, x: &Tensor) -> Result<Tensor> {
        self.unary(Activation::Relu, x)
    }

    /// Logistic sigmoid.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn sigmoid(&self, x: &Tensor) -> Result<Tensor> {
        self.unary(Activation::Sigmoid, x)
    }

    /// `x · sigmoid(x)`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn silu(&self, x: &Tensor) -> Result<Tensor> {
        self.unary(Activation::Silu, x)
    }

    /// Exact GELU.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn gelu(&self, x: &Tensor) -> Result<Tensor> {
        self.unary(Activation::Gelu, x)
    }

    /// Tanh-approximated GELU.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn gelu_new(&self, x: &Tensor) -> Result<Tensor> {
        self.unary(Activation::GeluNew, x)
    }

    /// Replaces non-finite values with zero; no gradient flows through them.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn sanitize(&self, x: &Tensor) -> Result<Tensor> {
        self.unary(Activation::Sanitize, x)
    }

    /// Clamps into `[min, max]`.
    ///
    /// # Panics
    /// Panics if `min > max`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn clamp(&self, x: &Tensor, min: f32, max: f32) -> Result<Tensor> {
        assert!(min <= max, "clamp bounds are reversed: {min} > {max}");
        self.unary(Activation::Clamp { min, max }, x)
    }

    // ---- normalisation and position -----------------------------------------

    /// Normalises every `width`-wide row to zero mean and unit variance.
    ///
    /// # Panics
    /// Panics if `width` is zero or does not divide the length.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn layer_norm(&self, x: &Tensor, width: usize, eps: f32) -> Result<Tensor> {
        assert!(
            width > 0 && x.len() % width == 0,
            "layer_norm width {width} does not divide {}",
            x.shape()
        );
        self.op(x.shape(), &[x], |out| {
            LayerNorm::new(width, eps, x.storage().clone(), out)
        })
    }

    /// Divides every `width`-wide row by its root mean square.
    ///
    /// # Panics
    /// Panics if `width` is zero or does not divide the length.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn rms_norm(&self, x: &Tensor, width: usize) -> Result<Tensor> {
        assert!(
            width > 0 && x.len() % width == 0,
            "rms_norm width {width} does not divide {}",
            x.shape()
        );
        self.op(x.shape(), &[x], |out| {
            RmsNorm::new(width, x.storage().clone(), out)
        })
    }

    /// Rotary position embedding applied per head of `head_size` columns.
    ///
    /// # Panics
    /// Panics unless `head_size` is even, non-zero and divides `x.w`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn rope_cols(&self, x: &Tensor, head_size: usize) -> Result<Tensor> {
        let shape = x.shape();
        assert!(
            head_size > 0 && head_size % 2 == 0 && shape.w % head_size == 0,
            "rope head size {head_size} must be even and divide the width of {shape}"
        );
        self.op(shape, &[x], |out| {
            Ok(RopeCols::new(shape, head_size, x.storage().clone(), out))
        })
    }

    /// Adds a learned `(W, H, 1)` table to every depth slice of `x`.
    ///
    /// # Panics
    /// Panics if the table does not match one slice of `x`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn positional_add(&self, x: &Tensor, table: &Tensor) -> Result<Tensor> {
        let (s, t) = (x.shape(), table.shape());
        assert!(
            t.w == s.w && t.h == s.h && t.d == 1,
            "positional table {t} does not match a slice of {s}"
        );
        self.op(s, &[x, table], |out| {
            Ok(PositionalAdd::new(
                x.storage().clone(),
                table.storage().clone(),
                out,
            ))
        })
    }

    // ---- attention ----------------------------------------------------------

    /// Sets every entry with column > row to `-inf`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn tril_mask(&self, x: &Tensor) -> Result<Tensor> {
        let shape = x.shape();
        self.op(shape, &[x], |out| {
            Ok(TrilMask::new(shape, x.storage().clone(), out))
        })
    }

    /// Softmax over every `W`-wide row.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn softmax(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.shape().w;
        self.op(x.shape(), &[x], |out| {
            Ok(Softmax::new(width, x.storage().clone(), out))
        })
    }

    /// Causal softmax: `softmax(tril_mask(x))`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn triangle_lower_softmax(&self, x: &Tensor) -> Result<Tensor> {
        let masked = self.tril_mask(x)?;
        self.softmax(&masked)
    }

    /// Swaps rows and columns of every depth slice.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn transpose(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        self.op(Shape::new(s.h, s.w, s.d), &[x], |out| {
            Ok(Transpose::new(s, x.storage().clone(), out))
        })
    }

    /// `alpha · a × b` per depth slice.
    ///
    /// `a` is `(K, M, Da)`, `b` is `(N, K, Db)` and the result is
    /// `(N, M, max(Da, Db))`. A depth of 1 is broadcast across the other
    /// operand's depth.
    ///
    /// # Panics
    /// Panics if the inner extents differ or the depths are incompatible.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn matrix_multiply(&self, a: &Tensor, b: &Tensor, alpha: f32) -> Result<Tensor> {
        let (sa, sb) = (a.shape(), b.shape());
        assert_eq!(
            sa.w, sb.h,
            "matrix_multiply inner extents differ: {sa} × {sb}"
        );
        assert!(
            sa.d == sb.d || sa.d == 1 || sb.d == 1,
            "matrix_multiply depths {} and {} neither match nor broadcast",
            sa.d,
            sb.d
        );
        let batch = sa.d.max(sb.d);
        let dims = MatMulDims {
            m: sa.h,
            k: sa.w,
            n: sb.w,
            batch,
            a_batched: sa.d != 1,
            b_batched: sb.d != 1,
            alpha,
        };
        self.op(Shape::new(sb.w, sa.h, batch), &[a, b], |out| {
            Ok(MatMul::new(dims, a.storage().clone(), b.storage().clone(), out))
        })
    }

    // ---- convolution and pooling --------------------------------------------

    /// Output shape of [`Device::conv`] for the given operands.
    ///
    /// # Panics
    /// Panics if the kernel does not fit the padded input or `stride` is zero.
    pub fn conv_output_shape(
        input: Shape,
        weights: Shape,
        filters: usize,
        batch: usize,
        padding: usize,
        stride: usize,
    ) -> Shape {
        assert!(stride >= 1, "conv stride must be at least 1");
        Shape::new(
            window_extent(input.w, weights.w, padding, stride),
            window_extent(input.h, weights.h, padding, stride),
            filters * batch,
        )
    }

    /// 2D convolution of a batch of multi-channel maps.
    ///
    /// `input` is `(W, H, C·batch)`, `weights` is `(KW, KH, C·filters)` and
    /// `biases` holds one value per filter. The result is
    /// `(OW, OH, filters·batch)` with `O = (I − K + 2·padding) / stride + 1`.
    ///
    /// # Panics
    /// Panics on inconsistent channel counts, a bias of the wrong length or
    /// a kernel that does not fit.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    #[allow(clippy::too_many_arguments)]
    pub fn conv(
        &self,
        input: &Tensor,
        weights: &Tensor,
        biases: &Tensor,
        filters: usize,
        batch: usize,
        padding: usize,
        stride: usize,
    ) -> Result<Tensor> {
        let (si, sw) = (input.shape(), weights.shape());
        assert!(
            filters > 0 && batch > 0 && si.d % batch == 0,
            "conv input {si} does not split into a batch of {batch}"
        );
        let channels = si.d / batch;
        assert_eq!(
            sw.d,
            channels * filters,
            "conv weights {sw} need depth {channels}·{filters}"
        );
        assert_eq!(
            biases.len(),
            filters,
            "conv needs one bias per filter, got {}",
            biases.shape()
        );
        let out = Self::conv_output_shape(si, sw, filters, batch, padding, stride);
        let geo = ConvGeometry {
            in_w: si.w,
            in_h: si.h,
            channels,
            batch,
            filters,
            kernel_w: sw.w,
            kernel_h: sw.h,
            padding,
            stride,
            out_w: out.w,
            out_h: out.h,
        };
        self.op(out, &[input, weights, biases], |storage| {
            Ok(Conv::new(
                geo,
                input.storage().clone(),
                weights.storage().clone(),
                biases.storage().clone(),
                storage,
            ))
        })
    }

    /// Output shape of [`Device::max_pool_2d`].
    ///
    /// # Panics
    /// Panics if `pool` or `stride` is zero or the window does not fit.
    pub fn pool_output_shape(input: Shape, pool: usize, padding: usize, stride: usize) -> Shape {
        assert!(pool >= 1, "pool size must be at least 1");
        assert!(stride >= 1, "pool stride must be at least 1");
        Shape::new(
            window_extent(input.w, pool, padding, stride),
            window_extent(input.h, pool, padding, stride),
            input.d,
        )
    }

    /// Max pooling over `pool × pool` windows of every depth slice.
    ///
    /// # Panics
    /// See [`Device::pool_output_shape`].
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn max_pool_2d(
        &self,
        x: &Tensor,
        pool: usize,
        padding: usize,
        stride: usize,
    ) -> Result<Tensor> {
        let s = x.shape();
        let out = Self::pool_output_shape(s, pool, padding, stride);
        let geo = PoolGeometry {
            in_w: s.w,
            in_h: s.h,
            depth: s.d,
            pool,
            padding,
            stride,
            out_w: out.w,
            out_h: out.h,
        };
        self.op(out, &[x], |storage| {
            MaxPool::new(geo, x.storage().clone(), storage)
        })
    }

    /// Nearest-neighbour upsampling of every depth slice by `scale`.
    ///
    /// # Panics
    /// Panics if `scale` is zero.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn upsample_2d(&self, x: &Tensor, scale: usize) -> Result<Tensor> {
        assert!(scale >= 1, "upsample scale must be at least 1");
        let s = x.shape();
        self.op(Shape::new(s.w * scale, s.h * scale, s.d), &[x], |out| {
            Ok(Upsample2d::new(s, scale, x.storage().clone(), out))
        })
    }

    // ---- embeddings ---------------------------------------------------------

    /// Looks up one table row per token.
    ///
    /// `tokens` is `(context, batch, 1)` and holds class indices as floats;
    /// `table` is `(features, alphabet, 1)`. The result is
    /// `(features, context, batch)`. An out-of-range token fails the command
    /// that reads it.
    ///
    /// # Panics
    /// Panics if either operand has depth other than 1.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn embeddings(&self, tokens: &Tensor, table: &Tensor) -> Result<Tensor> {
        let (st, se) = (tokens.shape(), table.shape());
        assert_eq!(st.d, 1, "tokens must be (context, batch, 1), got {st}");
        assert_eq!(se.d, 1, "embedding table must be (features, alphabet, 1), got {se}");
        let (features, alphabet) = (se.w, se.h);
        self.op(Shape::new(features, st.w, st.h), &[tokens, table], |out| {
            Ok(Embeddings::new(
                features,
                alphabet,
                tokens.storage().clone(),
                table.storage().clone(),
                out,
            ))
        })
    }

    // ---- stochastic ---------------------------------------------------------

    /// Inverted dropout with drop probability `prob`.
    ///
    /// The kernel owns a generator seeded from `rng` now, and draws a fresh
    /// mask every time the forward pass is encoded. `prob == 0` returns `x`.
    ///
    /// # Panics
    /// Panics unless `0 <= prob < 1`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn dropout<R: Rng>(&self, x: &Tensor, prob: f32, rng: &mut R) -> Result<Tensor> {
        assert!(
            (0.0..1.0).contains(&prob),
            "dropout probability must be in [0, 1), got {prob}"
        );
        if prob == 0.0 {
            return Ok(x.clone());
        }
        let seed = rng.random::<u64>();
        self.op(x.shape(), &[x], |out| {
            Dropout::new(prob, seed, x.storage().clone(), out)
        })
    }

    /// Reparameterised VAE sample from rows of `[μ | logσ²]`.
    ///
    /// `x` is `(2·latent, H, D)`; the result is `(latent, H, D)`.
    ///
    /// # Panics
    /// Panics if `x.w` is odd or zero.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn vae_sample<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        let s = x.shape();
        assert!(
            s.w > 0 && s.w % 2 == 0,
            "vae input width must be even, got {s}"
        );
        let latent = s.w / 2;
        let seed = rng.random::<u64>();
        self.op(Shape::new(latent, s.h, s.d), &[x], |out| {
            VaeSample::new(latent, seed, x.storage().clone(), out)
        })
    }

    // ---- losses -------------------------------------------------------------

    /// Mean of every element, `(1, 1, 1)`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn mean(&self, x: &Tensor) -> Result<Tensor> {
        assert!(!x.is_empty(), "mean of an empty tensor");
        self.op(Shape::scalar(), &[x], |out| {
            Ok(Mean::new(x.storage().clone(), out))
        })
    }

    /// Negative log-likelihood of the target class of every probability row.
    ///
    /// `targets` is `(1, H, D)` with class indices as floats; the result has
    /// the same shape.
    ///
    /// # Panics
    /// Panics unless `targets` has one entry per row of `probs`.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn nll_pos(&self, probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (sp, st) = (probs.shape(), targets.shape());
        assert!(
            st.w == 1 && st.h == sp.h && st.d == sp.d,
            "targets {st} do not hold one class per row of {sp}"
        );
        let classes = sp.w;
        self.op(st, &[probs, targets], |out| {
            Ok(NllPos::new(
                classes,
                probs.storage().clone(),
                targets.storage().clone(),
                out,
            ))
        })
    }

    /// Cross-entropy of raw `logits` against class indices:
    /// `nll_pos(softmax(sanitize(logits)), targets)`.
    ///
    /// # Panics
    /// See [`Device::nll_pos`].
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn cross_entropy_pos(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let clean = self.sanitize(logits)?;
        let probs = self.softmax(&clean)?;
        self.nll_pos(&probs, targets)
    }

    /// Elementwise binary cross-entropy.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn binary_cross_entropy(&self, probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        assert_eq!(
            probs.len(),
            targets.len(),
            "binary_cross_entropy of {} against {}",
            probs.shape(),
            targets.shape()
        );
        self.op(probs.shape(), &[probs, targets], |out| {
            Ok(BinaryCrossEntropy::new(
                probs.storage().clone(),
                targets.storage().clone(),
                out,
            ))
        })
    }

    /// KL divergence of every `[μ | logσ²]` row from `N(0, 1)`, `(1, H, D)`.
    ///
    /// # Panics
    /// Panics if `x.w` is odd or zero.
    ///
    /// # Errors
    /// See [`Device::new_data`].
    pub fn vae_kl_divergence(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        assert!(
            s.w > 0 && s.w % 2 == 0,
            "vae input width must be even, got {s}"
        );
        self.op(Shape::new(1, s.h, s.d), &[x], |out| {
            Ok(VaeKl::new(s.w / 2, x.storage().clone(), out))
        })
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    #[cfg(not(feature = "wgpu"))]
    fn gpu_request_without_feature_stays_on_cpu() {
        let device = Device::new(DeviceConfig::default().with_backend(Backend::Wgpu)).unwrap();
        assert_eq!(device.backend(), Backend::Cpu);
        assert_eq!(get_backend(), Backend::Cpu);
    }

    #[test]
    fn window_extents() {
        assert_eq!(window_extent(4, 2, 0, 2), 2);
        assert_eq!(window_extent(5, 3, 1, 1), 5);
        assert_eq!(
            Device::pool_output_shape(Shape::new(6, 4, 3), 2, 0, 2),
            Shape::new(3, 2, 3)
        );
    }

    #[test]
    fn matmul_shape_broadcasts_depth() {
        let device = Device::cpu().unwrap();
        let a = device.new_data(Shape::new(3, 2, 4)).unwrap();
        let b = device.new_data(Shape::new(5, 3, 1)).unwrap();
        let c = device.matrix_multiply(&a, &b, 1.0).unwrap();
        assert_eq!(c.shape(), Shape::new(5, 2, 4));
        assert_eq!(c.op_name(), "matmul");
    }

    #[test]
    #[should_panic(expected = "inner extents differ")]
    fn matmul_rejects_inner_mismatch() {
        let device = Device::cpu().unwrap();
        let a = device.new_data(Shape::new(3, 2, 1)).unwrap();
        let b = device.new_data(Shape::new(2, 2, 1)).unwrap();
        let _ = device.matrix_multiply(&a, &b, 1.0);
    }

    #[test]
    #[should_panic(expected = "is not implemented")]
    fn add_stays_restrictive() {
        let device = Device::cpu().unwrap();
        let a = device.new_data(Shape::new(3, 2, 1)).unwrap();
        let col = device.new_data(Shape::new(1, 2, 1)).unwrap();
        let _ = device.add(&a, &col);
    }

    #[test]
    fn add_dispatches_row_vectors() {
        let device = Device::cpu().unwrap();
        let a = device.new_data(Shape::new(3, 2, 1)).unwrap();
        let row = device.new_data(Shape::vector(3)).unwrap();
        assert_eq!(device.add(&a, &row).unwrap().op_name(), "add_row");
        assert_eq!(device.add(&a, &a).unwrap().op_name(), "add_equal");
    }

    #[test]
    fn zero_dropout_is_identity() {
        let device = Device::cpu().unwrap();
        let x = device.new_data(Shape::vector(4)).unwrap();
        let y = device.dropout(&x, 0.0, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(y.ptr_eq(&x));
    }

    #[test]
    fn init_parameter_is_named() {
        let device = Device::cpu().unwrap();
        let w = device
            .init_parameter(
                "fc.weight",
                Shape::matrix(4, 3),
                &crate::init::XavierUniform::new(1.0),
                4,
                3,
                &mut StdRng::seed_from_u64(5),
            )
            .unwrap();
        assert!(w.is_parameter());
        assert_eq!(w.name(), Some("fc.weight"));
        let bound = (6.0f32 / 7.0).sqrt();
        assert!(w.values().iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn config_clamps_batching() {
        let config = DeviceConfig::default().with_commands_per_buffer(0);
        assert_eq!(config.commands_per_buffer, 1);
    }
}
