//! Dense tensor value held by variables.
//!
//! The buffer is reference counted so that gradient linking can alias an
//! outer tensor into a step scope without copying. Mutation goes through
//! copy-on-write, so an alias never observes writes made through another
//! handle.

use crate::device::Place;
use crate::error::FrameworkError;
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;

/// Tensor dimensions. Most tensors in this runtime have rank <= 4.
pub type Dims = SmallVec<[usize; 4]>;

/// Element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    I64,
    Bool,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::I64 => "i64",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Typed, shared element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Rc<Vec<f32>>),
    I64(Rc<Vec<i64>>),
    Bool(Rc<Vec<bool>>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::I64(_) => DataType::I64,
            TensorData::Bool(_) => DataType::Bool,
        }
    }

    fn ptr_eq(&self, other: &TensorData) -> bool {
        match (self, other) {
            (TensorData::F32(a), TensorData::F32(b)) => Rc::ptr_eq(a, b),
            (TensorData::I64(a), TensorData::I64(b)) => Rc::ptr_eq(a, b),
            (TensorData::Bool(a), TensorData::Bool(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Dense, row-major tensor with a place tag.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    data: TensorData,
    dims: Dims,
    place: Place,
}

fn numel_of(dims: &[usize]) -> usize {
    dims.iter().product()
}

impl DenseTensor {
    fn from_data(data: TensorData, dims: &[usize]) -> Result<Self, FrameworkError> {
        let expected = numel_of(dims);
        if data.len() != expected {
            return Err(FrameworkError::shape_mismatch(
                "tensor data",
                expected,
                data.len(),
            ));
        }
        Ok(Self {
            data,
            dims: Dims::from_slice(dims),
            place: Place::Cpu,
        })
    }

    /// Create an f32 tensor from data and dims.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `data.len()` differs from the product of `dims`.
    ///
    /// # Example
    ///
    /// ```
    /// use dygraph::DenseTensor;
    ///
    /// let t = DenseTensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    /// assert_eq!(t.dims(), &[2, 2]);
    /// assert_eq!(t.numel(), 4);
    /// ```
    pub fn from_f32(data: Vec<f32>, dims: &[usize]) -> Result<Self, FrameworkError> {
        Self::from_data(TensorData::F32(Rc::new(data)), dims)
    }

    /// Create an i64 tensor from data and dims.
    pub fn from_i64(data: Vec<i64>, dims: &[usize]) -> Result<Self, FrameworkError> {
        Self::from_data(TensorData::I64(Rc::new(data)), dims)
    }

    /// Create a bool tensor from data and dims.
    pub fn from_bool(data: Vec<bool>, dims: &[usize]) -> Result<Self, FrameworkError> {
        Self::from_data(TensorData::Bool(Rc::new(data)), dims)
    }

    /// Single-element f32 tensor with dims `[1]`.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            data: TensorData::F32(Rc::new(vec![value])),
            dims: Dims::from_slice(&[1]),
            place: Place::Cpu,
        }
    }

    /// Single-element bool tensor with dims `[1]`.
    pub fn scalar_bool(value: bool) -> Self {
        Self {
            data: TensorData::Bool(Rc::new(vec![value])),
            dims: Dims::from_slice(&[1]),
            place: Place::Cpu,
        }
    }

    /// Tensor of `dims` filled with `value` converted to `dtype`.
    pub fn full(dims: &[usize], dtype: DataType, value: f64) -> Self {
        let len = numel_of(dims);
        let data = match dtype {
            DataType::F32 => TensorData::F32(Rc::new(vec![value as f32; len])),
            DataType::I64 => TensorData::I64(Rc::new(vec![value as i64; len])),
            DataType::Bool => TensorData::Bool(Rc::new(vec![value != 0.0; len])),
        };
        Self {
            data,
            dims: Dims::from_slice(dims),
            place: Place::Cpu,
        }
    }

    /// Zero tensor of `dims` and `dtype`.
    pub fn zeros(dims: &[usize], dtype: DataType) -> Self {
        Self::full(dims, dtype, 0.0)
    }

    /// Zero tensor matching another tensor's dims and dtype.
    pub fn zeros_like(other: &DenseTensor) -> Self {
        Self::zeros(other.dims(), other.dtype()).with_place(other.place)
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements.
    #[inline]
    pub fn numel(&self) -> usize {
        numel_of(&self.dims)
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    #[inline]
    pub fn place(&self) -> Place {
        self.place
    }

    /// Same tensor tagged as resident on `place`.
    pub fn with_place(mut self, place: Place) -> Self {
        self.place = place;
        self
    }

    /// Make `self` an alias of `other`'s buffer, dims and place.
    pub fn share_data_with(&mut self, other: &DenseTensor) {
        self.data = other.data.clone();
        self.dims = other.dims.clone();
        self.place = other.place;
    }

    /// Whether both tensors alias the same buffer.
    pub fn shares_buffer_with(&self, other: &DenseTensor) -> bool {
        self.data.ptr_eq(&other.data)
    }

    fn type_error(&self, expected: DataType) -> FrameworkError {
        FrameworkError::TypeMismatch {
            name: "tensor".to_string(),
            expected: expected.to_string(),
            actual: self.dtype().to_string(),
        }
    }

    /// Borrow f32 elements.
    pub fn as_f32(&self) -> Result<&[f32], FrameworkError> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            _ => Err(self.type_error(DataType::F32)),
        }
    }

    /// Mutable f32 elements; detaches from any alias first.
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32], FrameworkError> {
        let err = self.type_error(DataType::F32);
        match &mut self.data {
            TensorData::F32(v) => Ok(Rc::make_mut(v).as_mut_slice()),
            _ => Err(err),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64], FrameworkError> {
        match &self.data {
            TensorData::I64(v) => Ok(v),
            _ => Err(self.type_error(DataType::I64)),
        }
    }

    pub fn as_bool(&self) -> Result<&[bool], FrameworkError> {
        match &self.data {
            TensorData::Bool(v) => Ok(v),
            _ => Err(self.type_error(DataType::Bool)),
        }
    }

    /// Apply `f` to every f32 element.
    pub fn map_f32(&self, f: impl Fn(f32) -> f32) -> Result<DenseTensor, FrameworkError> {
        let data: Vec<f32> = self.as_f32()?.iter().map(|&x| f(x)).collect();
        Ok(DenseTensor::from_f32(data, &self.dims)?.with_place(self.place))
    }

    /// Combine two f32 tensors of identical dims element by element.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if dims differ, `TypeMismatch` for non-f32 data.
    pub fn zip_map_f32(
        &self,
        other: &DenseTensor,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<DenseTensor, FrameworkError> {
        if self.dims != other.dims {
            return Err(FrameworkError::shape_mismatch(
                "elementwise operand",
                self.dims.as_slice(),
                other.dims.as_slice(),
            ));
        }
        let data: Vec<f32> = self
            .as_f32()?
            .iter()
            .zip(other.as_f32()?)
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(DenseTensor::from_f32(data, &self.dims)?.with_place(self.place))
    }

    /// Element-wise sum.
    pub fn add(&self, other: &DenseTensor) -> Result<DenseTensor, FrameworkError> {
        self.zip_map_f32(other, |a, b| a + b)
    }

    /// Add `other` into `self` in place.
    pub fn add_assign(&mut self, other: &DenseTensor) -> Result<(), FrameworkError> {
        if self.dims != other.dims {
            return Err(FrameworkError::shape_mismatch(
                "accumulator",
                self.dims.as_slice(),
                other.dims.as_slice(),
            ));
        }
        let rhs = other.as_f32()?.to_vec();
        for (acc, x) in self.as_f32_mut()?.iter_mut().zip(rhs) {
            *acc += x;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_f32_shape_mismatch() {
        let result = DenseTensor::from_f32(vec![1.0, 2.0, 3.0], &[2, 2]);
        assert!(matches!(result, Err(FrameworkError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zero_size_tensor() {
        let t = DenseTensor::zeros(&[0, 3], DataType::F32);
        assert_eq!(t.numel(), 0);
        assert!(t.as_f32().unwrap().is_empty());
    }

    #[test]
    fn test_share_data_then_write_detaches() {
        let outer = DenseTensor::from_f32(vec![1.0, 2.0], &[2]).unwrap();
        let mut inner = DenseTensor::zeros(&[5], DataType::F32);
        inner.share_data_with(&outer);
        assert!(inner.shares_buffer_with(&outer));
        assert_eq!(inner.dims(), &[2]);

        inner.as_f32_mut().unwrap()[0] = 10.0;
        assert!(!inner.shares_buffer_with(&outer));
        assert_eq!(outer.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_add_assign() {
        let mut acc = DenseTensor::zeros(&[2], DataType::F32);
        let g = DenseTensor::from_f32(vec![0.5, 1.5], &[2]).unwrap();
        acc.add_assign(&g).unwrap();
        acc.add_assign(&g).unwrap();
        let data = acc.as_f32().unwrap();
        assert_relative_eq!(data[0], 1.0);
        assert_relative_eq!(data[1], 3.0);
    }

    #[test]
    fn test_type_mismatch() {
        let t = DenseTensor::scalar_bool(true);
        assert!(matches!(t.as_f32(), Err(FrameworkError::TypeMismatch { .. })));
        assert_eq!(t.as_bool().unwrap(), &[true]);
    }
}
