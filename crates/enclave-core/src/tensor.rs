//! Native tensor buffers.
//!
//! A [`Tensor`] is a shared, immutable `f32` buffer in row-major order plus one
//! [`BufferTag`]. Clones share the buffer and therefore the tag. Kernels never
//! mutate a buffer in place; every result is a fresh buffer tagged by the
//! instance that produced it.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tag::{BufferTag, InstanceId, Owner};

struct Storage {
    shape: Vec<usize>,
    data: Vec<f32>,
    tag: BufferTag,
}

/// Shared handle to a tagged `f32` buffer.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
}

impl Tensor {
    /// Create an untagged tensor from a shape and matching data.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = checked_element_count(&shape)?;
        if data.len() != expected {
            return Err(Error::invocation(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self::from_parts(shape, data, BufferTag::new()))
    }

    /// Untagged tensor filled with `value`.
    ///
    /// Fails with `InvocationFailure` when the shape holds more than
    /// [`MAX_ELEMENTS`] elements.
    pub fn full(shape: &[usize], value: f32) -> Result<Self> {
        let data = vec![value; allocation_size(shape)?];
        Ok(Self::from_parts(shape.to_vec(), data, BufferTag::new()))
    }

    pub fn zeros(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 1.0)
    }

    /// Untagged tensor with unspecified contents (zeroed).
    pub fn empty(shape: &[usize]) -> Result<Self> {
        Self::zeros(shape)
    }

    /// Zero-dimensional tensor.
    pub fn scalar(value: f32) -> Self {
        Self::from_parts(Vec::new(), vec![value], BufferTag::new())
    }

    /// Tensor allocated inside an instance; tagged from birth.
    pub(crate) fn owned(shape: Vec<usize>, data: Vec<f32>, owner: &Owner) -> Self {
        debug_assert_eq!(element_count(&shape), Some(data.len()));
        Self::from_parts(shape, data, BufferTag::claimed(owner.clone()))
    }

    fn from_parts(shape: Vec<usize>, data: Vec<f32>, tag: BufferTag) -> Self {
        Self {
            storage: Arc::new(Storage { shape, data, tag }),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.storage.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.storage.data
    }

    pub fn numel(&self) -> usize {
        self.storage.data.len()
    }

    pub fn tag(&self) -> &BufferTag {
        &self.storage.tag
    }

    /// Owning instance, if the buffer has been claimed.
    pub fn owner(&self) -> Option<InstanceId> {
        self.storage.tag.owner()
    }

    /// Whether both handles share one buffer.
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Bitwise equality of shape and contents.
    pub fn equal(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
            && self
                .data()
                .iter()
                .zip(other.data())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    /// `|a - b| <= atol + rtol * |b|` for every element.
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> bool {
        self.shape() == other.shape()
            && self
                .data()
                .iter()
                .zip(other.data())
                .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.storage.shape)
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Largest number of elements a freshly allocated tensor may hold.
pub const MAX_ELEMENTS: usize = 1 << 28;

/// Product of the dimensions, or `None` on overflow.
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

fn checked_element_count(shape: &[usize]) -> Result<usize> {
    element_count(shape)
        .ok_or_else(|| Error::invocation(format!("shape {:?} overflows the element count", shape)))
}

/// Element count for a buffer about to be allocated from nothing but a shape.
pub(crate) fn allocation_size(shape: &[usize]) -> Result<usize> {
    let count = checked_element_count(shape)?;
    if count > MAX_ELEMENTS {
        return Err(Error::invocation(format!(
            "shape {:?} needs {} elements, limit is {}",
            shape, count, MAX_ELEMENTS
        )));
    }
    Ok(count)
}

// =============================================================================
// Kernels
// =============================================================================
//
// Kernels take checked inputs and return raw (shape, data) pairs; the caller
// tags the result with its own instance.

pub(crate) type Buffer = (Vec<usize>, Vec<f32>);

pub(crate) fn map(input: &Tensor, f: impl Fn(f32) -> f32) -> Buffer {
    let data = input.data().iter().map(|&x| f(x)).collect();
    (input.shape().to_vec(), data)
}

pub(crate) fn zip_with(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Buffer> {
    if a.shape() != b.shape() {
        return Err(Error::invocation(format!(
            "shape mismatch: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let data = a.data().iter().zip(b.data()).map(|(&x, &y)| f(x, y)).collect();
    Ok((a.shape().to_vec(), data))
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// `input @ weight^T + bias` over the last dimension of `input`.
pub(crate) fn linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Buffer> {
    let [out_features, in_features] = weight.shape() else {
        return Err(Error::invocation(format!(
            "linear weight must be 2-d, got shape {:?}",
            weight.shape()
        )));
    };
    let (out_features, in_features) = (*out_features, *in_features);
    if in_features == 0 {
        return Err(Error::invocation("linear weight has no input features"));
    }

    let Some((&last, batch)) = input.shape().split_last() else {
        return Err(Error::invocation("linear input must have at least one dimension"));
    };
    if last != in_features {
        return Err(Error::invocation(format!(
            "linear expects {} input features, got {}",
            in_features, last
        )));
    }
    if let Some(bias) = bias
        && bias.shape() != [out_features]
    {
        return Err(Error::invocation(format!(
            "linear bias must have shape [{}], got {:?}",
            out_features,
            bias.shape()
        )));
    }

    let rows = input.numel() / in_features;
    let w = weight.data();
    let mut data = Vec::with_capacity(rows * out_features);
    for row in input.data().chunks_exact(in_features).take(rows) {
        for o in 0..out_features {
            let weights = &w[o * in_features..(o + 1) * in_features];
            let mut acc = 0.0f32;
            for (x, wk) in row.iter().zip(weights) {
                acc += x * wk;
            }
            if let Some(bias) = bias {
                acc += bias.data()[o];
            }
            data.push(acc);
        }
    }

    let mut shape = batch.to_vec();
    shape.push(out_features);
    Ok((shape, data))
}

pub(crate) fn sum(input: &Tensor) -> f32 {
    input.data().iter().fold(0.0f32, |acc, x| acc + x)
}
