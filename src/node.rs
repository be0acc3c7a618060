//! Graph nodes.
//!
//! A [`Tensor`] is a shared handle to a [`Node`]: a shape, a value buffer, a
//! gradient buffer, the upstream tensors it was computed from, and the kernel
//! that computes it. Nodes are immutable once built, so the graph is acyclic
//! by construction and can be shared freely between pipelines.
//!
//! # Storage owners
//!
//! A node's buffers live in a [`Storage`]. Ordinary nodes allocate their own;
//! a view (see [`Device::reshape`](crate::device::Device::reshape)) clones the
//! storage of the node it reinterprets. [`Tensor::owner`] identifies the
//! allocation, which is what gradient resets iterate over.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{Buffer, BufferId};
use crate::command::CommandBuffer;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::shape::Shape;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, monotonically increasing node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Paired value and gradient buffers of equal length.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Forward values.
    pub value: Buffer,
    /// Accumulated gradient of the loss with respect to `value`.
    pub grad: Buffer,
}

impl Storage {
    /// Allocates zeroed value and gradient buffers.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`](crate::error::Error::Allocation) if either buffer cannot be reserved.
    pub fn zeroed(len: usize) -> Result<Self> {
        Ok(Self {
            value: Buffer::zeroed(len)?,
            grad: Buffer::zeroed(len)?,
        })
    }

    /// Wraps `values` and allocates a matching zeroed gradient.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`](crate::error::Error::Allocation) if the gradient cannot be reserved.
    pub fn with_values(values: Vec<f32>) -> Result<Self> {
        let grad = Buffer::zeroed(values.len())?;
        Ok(Self {
            value: Buffer::from_vec(values),
            grad,
        })
    }

    /// Identity of the underlying allocation.
    pub fn id(&self) -> BufferId {
        self.value.id()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns `true` for zero-length storage.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// What role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Leaf fed by the caller (inputs, targets, constants).
    Input,
    /// Leaf updated by an optimizer.
    Parameter,
    /// Output of a kernel.
    Operation,
    /// Alias of a dependency's storage under a different shape.
    View,
}

/// One vertex of the computation graph.
pub struct Node {
    id: NodeId,
    shape: Shape,
    storage: Storage,
    deps: Vec<Tensor>,
    kernel: Option<Box<dyn Kernel>>,
    kind: NodeKind,
    name: Option<String>,
}

/// Shared handle to a [`Node`].
#[derive(Clone)]
pub struct Tensor(Arc<Node>);

impl Tensor {
    /// Creates a leaf over existing storage.
    pub(crate) fn leaf(shape: Shape, storage: Storage, kind: NodeKind, name: Option<String>) -> Self {
        debug_assert_eq!(shape.len(), storage.len());
        Self(Arc::new(Node {
            id: NodeId::next(),
            shape,
            storage,
            deps: Vec::new(),
            kernel: None,
            kind,
            name,
        }))
    }

    /// Creates an operation node driven by `kernel`.
    pub(crate) fn operation(
        shape: Shape,
        storage: Storage,
        deps: Vec<Tensor>,
        kernel: Box<dyn Kernel>,
    ) -> Self {
        debug_assert_eq!(shape.len(), storage.len());
        Self(Arc::new(Node {
            id: NodeId::next(),
            shape,
            storage,
            deps,
            kernel: Some(kernel),
            kind: NodeKind::Operation,
            name: None,
        }))
    }

    /// Creates a view sharing `source`'s storage.
    pub(crate) fn view(shape: Shape, source: &Tensor) -> Self {
        debug_assert_eq!(shape.len(), source.len());
        Self(Arc::new(Node {
            id: NodeId::next(),
            shape,
            storage: source.storage().clone(),
            deps: vec![source.clone()],
            kernel: None,
            kind: NodeKind::View,
            name: None,
        }))
    }

    /// Node identity.
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// Shape under which this node's storage is interpreted.
    pub fn shape(&self) -> Shape {
        self.0.shape
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.0.shape.len()
    }

    /// Returns `true` if the node has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.shape.is_empty()
    }

    /// Value buffer.
    pub fn value(&self) -> &Buffer {
        &self.0.storage.value
    }

    /// Gradient buffer.
    pub fn grad(&self) -> &Buffer {
        &self.0.storage.grad
    }

    /// Both buffers.
    pub fn storage(&self) -> &Storage {
        &self.0.storage
    }

    /// Identity of the storage owner. Views report their source's owner.
    pub fn owner(&self) -> BufferId {
        self.0.storage.id()
    }

    /// Upstream nodes, in operand order.
    pub fn deps(&self) -> &[Tensor] {
        &self.0.deps
    }

    /// Role of this node.
    pub fn kind(&self) -> NodeKind {
        self.0.kind
    }

    /// Returns `true` for reshaped aliases.
    pub fn is_view(&self) -> bool {
        self.0.kind == NodeKind::View
    }

    /// Returns `true` for nodes without dependencies.
    pub fn is_leaf(&self) -> bool {
        self.0.deps.is_empty()
    }

    /// Returns `true` for optimizer-updatable leaves.
    pub fn is_parameter(&self) -> bool {
        self.0.kind == NodeKind::Parameter
    }

    /// Parameter name, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Name of the bound kernel, or the node kind for leaves and views.
    pub fn op_name(&self) -> &'static str {
        match (&self.0.kernel, self.0.kind) {
            (Some(kernel), _) => kernel.name(),
            (None, NodeKind::Input) => "input",
            (None, NodeKind::Parameter) => "parameter",
            (None, NodeKind::View) => "view",
            (None, NodeKind::Operation) => "operation",
        }
    }

    /// Encodes the forward kernel. No-op for leaves and views.
    pub fn forward(&self, cmd: &mut CommandBuffer) {
        if let Some(kernel) = &self.0.kernel {
            kernel.forward(cmd);
        }
    }

    /// Encodes the backward kernel. No-op for leaves and views.
    pub fn backward(&self, cmd: &mut CommandBuffer) {
        if let Some(kernel) = &self.0.kernel {
            kernel.backward(cmd);
        }
    }

    /// Copies of the current values.
    ///
    /// Only meaningful when no chain touching this node is in flight.
    pub fn values(&self) -> Vec<f32> {
        self.value().to_vec()
    }

    /// Copies of the current gradient.
    pub fn gradients(&self) -> Vec<f32> {
        self.grad().to_vec()
    }

    /// Overwrites the values from the host.
    ///
    /// # Panics
    /// Panics if `values.len()` differs from the node length.
    pub fn set_values(&self, values: &[f32]) {
        self.value().copy_from_slice(values);
    }

    /// Overwrites the gradient from the host.
    ///
    /// # Panics
    /// Panics if `grads.len()` differs from the node length.
    pub fn set_gradients(&self, grads: &[f32]) {
        self.grad().copy_from_slice(grads);
    }

    /// Returns `true` if both handles refer to the same node.
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Tensor");
        s.field("id", &self.0.id)
            .field("op", &self.op_name())
            .field("shape", &self.0.shape);
        if let Some(name) = &self.0.name {
            s.field("name", name);
        }
        s.field("deps", &self.0.deps.iter().map(Tensor::id).collect::<Vec<_>>())
            .finish()
    }
}
