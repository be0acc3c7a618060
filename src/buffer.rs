//! Shared float storage backing node values, gradients and optimizer state.
//!
//! A [`Buffer`] is a fixed-length, host-visible array of `f32` behind an
//! `Arc<RwLock<..>>`. Cloning a buffer clones the handle, never the data, so
//! kernels can capture their operands and hand them to the command queue
//! worker while the graph keeps its own handles.
//!
//! Every buffer carries a process-unique [`BufferId`]. The pipeline uses it
//! to identify storage owners: a view node and the node it aliases report the
//! same id, so gradient resets iterate owners instead of nodes.
//!
//! Locks are only ever taken inside executing commands or by host code after
//! a chain has completed, so contention is limited to one thread at a time.
//! A poisoned lock (a panicking command) is recovered rather than
//! propagated; the panic itself is reported through the command chain.

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct Inner {
    id: BufferId,
    len: usize,
    data: RwLock<Vec<f32>>,
}

/// Cheaply clonable handle to a fixed-length `f32` array.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Inner>,
}

/// Shared view of a buffer's contents.
pub struct ReadGuard<'a>(RwLockReadGuard<'a, Vec<f32>>);

/// Exclusive view of a buffer's contents. The length cannot change.
pub struct WriteGuard<'a>(RwLockWriteGuard<'a, Vec<f32>>);

impl Deref for ReadGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl Deref for WriteGuard<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.0
    }
}

impl Buffer {
    /// Allocates a zero-filled buffer.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`] if the memory cannot be reserved.
    pub fn zeroed(len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::Allocation { len })?;
        data.resize(len, 0.0);
        Ok(Self::from_vec(data))
    }

    /// Wraps an existing vector without copying.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: BufferId::next(),
                len: data.len(),
                data: RwLock::new(data),
            }),
        }
    }

    /// Copies `values` into a new buffer.
    pub fn from_slice(values: &[f32]) -> Self {
        Self::from_vec(values.to_vec())
    }

    /// The allocation identity shared by every clone of this handle.
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Number of floats.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Returns `true` for zero-length buffers.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Returns `true` if both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Locks the buffer for reading.
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard(self.inner.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Locks the buffer for writing.
    pub fn write(&self) -> WriteGuard<'_> {
        WriteGuard(self.inner.data.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Reads two buffers at once, locking only once when they alias.
    pub fn read_pair<R>(a: &Buffer, b: &Buffer, f: impl FnOnce(&[f32], &[f32]) -> R) -> R {
        let ga = a.read();
        if a.ptr_eq(b) {
            f(&ga, &ga)
        } else {
            let gb = b.read();
            f(&ga, &gb)
        }
    }

    /// Copies the contents out.
    pub fn to_vec(&self) -> Vec<f32> {
        self.read().to_vec()
    }

    /// Overwrites the contents.
    ///
    /// # Panics
    /// Panics if `values.len()` differs from the buffer length.
    pub fn copy_from_slice(&self, values: &[f32]) {
        assert_eq!(
            values.len(),
            self.len(),
            "buffer holds {} floats, got {}",
            self.len(),
            values.len()
        );
        self.write().copy_from_slice(values);
    }

    /// Sets every element to `value`.
    pub fn fill(&self, value: f32) {
        self.write().fill(value);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let a = Buffer::from_slice(&[1.0, 2.0, 3.0]);
        let b = a.clone();
        b.write()[1] = 7.0;
        assert_eq!(a.to_vec(), vec![1.0, 7.0, 3.0]);
        assert_eq!(a.id(), b.id());
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn distinct_allocations_have_distinct_ids() {
        let a = Buffer::zeroed(4).unwrap();
        let b = Buffer::zeroed(4).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(!a.ptr_eq(&b));
        assert_eq!(a.to_vec(), vec![0.0; 4]);
    }

    #[test]
    fn read_pair_on_alias() {
        let a = Buffer::from_slice(&[2.0, 3.0]);
        let dot = Buffer::read_pair(&a, &a, |x, y| x.iter().zip(y).map(|(p, q)| p * q).sum::<f32>());
        assert_eq!(dot, 13.0);
    }

    #[test]
    fn huge_allocation_fails_cleanly() {
        let err = Buffer::zeroed(usize::MAX / 2).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
    }

    #[test]
    #[should_panic(expected = "buffer holds 2 floats")]
    fn copy_checks_length() {
        Buffer::zeroed(2).unwrap().copy_from_slice(&[1.0]);
    }
}
