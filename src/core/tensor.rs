//! Tensors and learnable parameters.
//!
//! The tensor math inside neural modules is out of scope here; what this
//! module pins down is the *sharing* contract: a [`Parameter`] is a handle
//! to one allocation, and two components share a parameter if and only if
//! their handles point at the same allocation. Persistence and in-place
//! loading preserve that sharing.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::error::{PipelineError, Result};

/// A dense f32 tensor with an explicit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Dimension sizes, outermost first.
    pub shape: Vec<usize>,
    /// Row-major data; `data.len()` equals the product of `shape`.
    pub data: Vec<f32>,
}

impl Tensor {
    /// A tensor of the given shape filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Build a tensor from a shape and flat data, validating the length.
    pub fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(PipelineError::Persistence {
                message: format!(
                    "tensor data length {} does not match shape {:?} (expected {})",
                    data.len(),
                    shape,
                    expected
                ),
            });
        }
        Ok(Self { shape, data })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element-wise closeness within an absolute tolerance.
    pub fn allclose(&self, other: &Tensor, tolerance: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

/// A learnable parameter: a shared, mutable handle to one [`Tensor`].
///
/// Cloning a `Parameter` clones the handle, not the tensor; mutations
/// through any clone are visible through all of them. This is how one
/// embedding table can be owned by several components at once.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<Mutex<Tensor>>,
}

impl Parameter {
    /// Wrap a tensor into a fresh allocation.
    pub fn new(tensor: Tensor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tensor)),
        }
    }

    /// A deep copy of the current value.
    pub fn tensor(&self) -> Tensor {
        self.inner.lock().clone()
    }

    /// Replace the value in place, keeping the allocation (and therefore
    /// the sharing) intact. The shapes must match.
    pub fn load(&self, tensor: Tensor) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.shape != tensor.shape {
            return Err(PipelineError::Persistence {
                message: format!(
                    "cannot load tensor of shape {:?} into parameter of shape {:?}",
                    tensor.shape, guard.shape
                ),
            });
        }
        *guard = tensor;
        Ok(())
    }

    /// Mutate the value in place.
    pub fn update(&self, f: impl FnOnce(&mut Tensor)) {
        f(&mut self.inner.lock());
    }

    /// Whether two handles point at the same allocation.
    pub fn shares_allocation_with(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A stable key for the allocation, used to group shared tensors.
    pub(crate) fn allocation_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tensor = self.inner.lock();
        f.debug_struct("Parameter")
            .field("shape", &tensor.shape)
            .finish()
    }
}

/// Where a component's tensors live.
///
/// Placement is an explicit, idempotent operation on components; nothing in
/// the caching layer triggers it implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// Accelerator by index.
    Accelerator(usize),
}
