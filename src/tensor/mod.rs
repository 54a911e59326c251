//! Owned n-dimensional f32 tensor used by the schedulers and pipelines.
//!
//! Pure operations return a new tensor over a fresh buffer. The `*_inplace`
//! variants mutate the receiver. Elementwise operations between two tensors
//! require identical shapes and fail with `SHAPE_MISMATCH` otherwise.

mod random;
mod value;

pub use random::{random_normal, seed_to_u64, NoiseGenerator};
pub use value::{DType, Value};

use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice, Zip};

use crate::error::{DiffusionError, Result};

/// Owned f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
}

impl Tensor {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Wraps an existing ndarray.
    pub fn from_array(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    /// Tensor of zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::from_array(ArrayD::zeros(IxDyn(shape)))
    }

    /// Tensor filled with `value`.
    pub fn full(shape: &[usize], value: f32) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Builds a tensor from a flat buffer. Fails unless `data.len() == product(shape)`.
    pub fn from_shape_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DiffusionError::shape_mismatch(format!(
                "Buffer of length {} does not fit shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self::from_array(ArrayD::from_shape_vec(IxDyn(shape), data)?))
    }

    /// One-element tensor of shape `[1]`.
    pub fn scalar(value: f32) -> Self {
        Self::full(&[1], value)
    }

    /// 1-D tensor `[start, start + step, ...)` stopping before `end`.
    pub fn range(start: f32, end: f32, step: f32) -> Self {
        let mut values = Vec::new();
        if step != 0.0 {
            let mut i = 0usize;
            loop {
                let v = start + step * i as f32;
                if (step > 0.0 && v >= end) || (step < 0.0 && v <= end) {
                    break;
                }
                values.push(v);
                i += 1;
            }
        }
        Self::vector(values)
    }

    /// `num` evenly spaced values from `start` to `end` inclusive.
    pub fn linspace(start: f64, end: f64, num: usize) -> Self {
        let values: Vec<f32> = match num {
            0 => Vec::new(),
            1 => vec![start as f32],
            _ => {
                let step = (end - start) / (num - 1) as f64;
                (0..num).map(|i| (start + step * i as f64) as f32).collect()
            }
        };
        Self::vector(values)
    }

    /// 1-D tensor from a vector.
    pub fn vector(values: Vec<f32>) -> Self {
        let len = values.len();
        Self::from_array(
            ArrayD::from_shape_vec(IxDyn(&[len]), values)
                .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0]))),
        )
    }

    /// One-dimensional piecewise linear interpolation of `x` against the
    /// increasing sample points `xp` with values `fp`.
    ///
    /// Points outside `xp` take the boundary value.
    pub fn interp(x: &[f32], xp: &[f32], fp: &[f32]) -> Result<Self> {
        if xp.len() != fp.len() || xp.is_empty() {
            return Err(DiffusionError::shape_mismatch(format!(
                "interp needs matching non-empty sample points, got {} and {}",
                xp.len(),
                fp.len()
            )));
        }
        let last = xp.len() - 1;
        let values = x
            .iter()
            .map(|&v| {
                if v <= xp[0] {
                    return fp[0];
                }
                if v >= xp[last] {
                    return fp[last];
                }
                // First sample point strictly greater than v.
                let hi = xp.partition_point(|&p| p <= v);
                let lo = hi - 1;
                let span = xp[hi] - xp[lo];
                if span == 0.0 {
                    return fp[lo];
                }
                let w = (v - xp[lo]) / span;
                fp[lo] + (fp[hi] - fp[lo]) * w
            })
            .collect();
        Ok(Self::vector(values))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Row-major strides derived from the shape.
    pub fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element at a flat (row-major) index.
    pub fn get(&self, index: usize) -> Option<f32> {
        match self.data.as_slice() {
            Some(flat) => flat.get(index).copied(),
            None => self.data.iter().nth(index).copied(),
        }
    }

    /// Copies the elements into a row-major vector.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Borrows the underlying array.
    pub fn as_array(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Consumes the tensor, returning the underlying array.
    pub fn into_array(self) -> ArrayD<f32> {
        self.data
    }

    /// Largest element, or negative infinity for an empty tensor.
    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    // ========================================================================
    // Elementwise arithmetic
    // ========================================================================

    fn check_same_shape(&self, other: &Tensor, op: &str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(DiffusionError::shape_mismatch(format!(
                "Cannot {} tensors of shape {:?} and {:?}",
                op,
                self.shape(),
                other.shape()
            )));
        }
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other, "add")?;
        Ok(Self::from_array(&self.data + &other.data))
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other, "subtract")?;
        Ok(Self::from_array(&self.data - &other.data))
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other, "multiply")?;
        Ok(Self::from_array(&self.data * &other.data))
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other, "divide")?;
        Ok(Self::from_array(&self.data / &other.data))
    }

    pub fn add_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v + value)
    }

    pub fn sub_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v - value)
    }

    pub fn mul_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v * value)
    }

    pub fn div_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v / value)
    }

    pub fn add_inplace(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape(other, "add")?;
        Zip::from(&mut self.data).and(&other.data).for_each(|a, &b| *a += b);
        Ok(())
    }

    pub fn sub_inplace(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape(other, "subtract")?;
        Zip::from(&mut self.data).and(&other.data).for_each(|a, &b| *a -= b);
        Ok(())
    }

    pub fn mul_inplace(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape(other, "multiply")?;
        Zip::from(&mut self.data).and(&other.data).for_each(|a, &b| *a *= b);
        Ok(())
    }

    pub fn div_inplace(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape(other, "divide")?;
        Zip::from(&mut self.data).and(&other.data).for_each(|a, &b| *a /= b);
        Ok(())
    }

    pub fn add_scalar_inplace(&mut self, value: f32) {
        self.data.mapv_inplace(|v| v + value);
    }

    pub fn mul_scalar_inplace(&mut self, value: f32) {
        self.data.mapv_inplace(|v| v * value);
    }

    pub fn div_scalar_inplace(&mut self, value: f32) {
        self.data.mapv_inplace(|v| v / value);
    }

    /// Applies `f` to every element, returning a new tensor.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Self::from_array(self.data.mapv(f))
    }

    pub fn pow(&self, exponent: f32) -> Tensor {
        self.map(|v| v.powf(exponent))
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    pub fn exp(&self) -> Tensor {
        self.map(f32::exp)
    }

    pub fn sin(&self) -> Tensor {
        self.map(f32::sin)
    }

    pub fn cos(&self) -> Tensor {
        self.map(f32::cos)
    }

    pub fn round(&self) -> Tensor {
        self.map(f32::round)
    }

    pub fn clip(&self, min: f32, max: f32) -> Tensor {
        self.map(|v| v.clamp(min, max))
    }

    pub fn clip_inplace(&mut self, min: f32, max: f32) {
        self.data.mapv_inplace(|v| v.clamp(min, max));
    }

    // ========================================================================
    // Structural operations
    // ========================================================================

    /// Reverses the order along the first axis.
    pub fn reverse(&self) -> Tensor {
        if self.data.ndim() == 0 {
            return self.clone();
        }
        let mut data = self.data.clone();
        data.invert_axis(Axis(0));
        Self::from_array(data.as_standard_layout().into_owned())
    }

    /// Cumulative product over the flattened elements, preserving shape.
    pub fn cumprod(&self) -> Tensor {
        let mut acc = 1.0f64;
        let values: Vec<f32> = self
            .data
            .iter()
            .map(|&v| {
                acc *= v as f64;
                acc as f32
            })
            .collect();
        match ArrayD::from_shape_vec(self.data.raw_dim(), values) {
            Ok(data) => Self::from_array(data),
            Err(_) => self.clone(),
        }
    }

    /// Returns a tensor with the same elements and a new shape.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        Self::from_shape_vec(shape, self.to_vec())
    }

    /// Slice of `len` entries starting at `start` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        if axis >= self.data.ndim() || start + len > self.shape()[axis] {
            return Err(DiffusionError::shape_mismatch(format!(
                "Cannot take [{}, {}) along axis {} of shape {:?}",
                start,
                start + len,
                axis,
                self.shape()
            )));
        }
        let view = self
            .data
            .slice_axis(Axis(axis), Slice::from(start..start + len));
        Ok(Self::from_array(view.to_owned()))
    }

    /// Repeats the tensor `reps` times along the first axis.
    pub fn tile(&self, reps: usize) -> Result<Tensor> {
        let parts: Vec<&Tensor> = std::iter::repeat(self).take(reps).collect();
        Self::cat(&parts, 0)
    }

    /// Concatenates tensors along `axis`. Negative axes count from the end.
    pub fn cat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| DiffusionError::shape_mismatch("Cannot concatenate zero tensors"))?;
        let ndim = first.data.ndim() as isize;
        let resolved = if axis < 0 { ndim + axis } else { axis };
        if resolved < 0 || resolved >= ndim {
            return Err(DiffusionError::shape_mismatch(format!(
                "Axis {} out of range for rank {}",
                axis, ndim
            )));
        }
        let resolved = resolved as usize;
        for t in tensors.iter().skip(1) {
            let same_rank = t.data.ndim() == first.data.ndim();
            let same_other_dims = same_rank
                && t.shape()
                    .iter()
                    .zip(first.shape())
                    .enumerate()
                    .all(|(i, (a, b))| i == resolved || a == b);
            if !same_other_dims {
                return Err(DiffusionError::shape_mismatch(format!(
                    "Cannot concatenate {:?} with {:?} along axis {}",
                    first.shape(),
                    t.shape(),
                    resolved
                )));
            }
        }
        let views: Vec<_> = tensors.iter().map(|t| t.data.view()).collect();
        Ok(Self::from_array(concatenate(Axis(resolved), &views)?))
    }

    /// Splits a batch of two along the first axis into its halves.
    pub fn split_batch(&self) -> Result<(Tensor, Tensor)> {
        let batch = self.shape().first().copied().unwrap_or(0);
        if batch == 0 || batch % 2 != 0 {
            return Err(DiffusionError::shape_mismatch(format!(
                "Cannot split batch of shape {:?} in two",
                self.shape()
            )));
        }
        let half = batch / 2;
        Ok((self.narrow(0, 0, half)?, self.narrow(0, half, half)?))
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(data: ArrayD<f32>) -> Self {
        Self::from_array(data)
    }
}
