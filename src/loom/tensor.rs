use itertools::Itertools;
use thiserror::Error;

use super::{
    layout::Shape,
    num::{DataType, Scalar},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: shape {0} holds {1} elements, but data len is {2}")]
    Create(Shape, usize, usize),
    #[error("tensor shape error: shape {0} mismatches {1}")]
    Shape(Shape, Shape),
}

/// A tensor that exclusively owns its buffer.
///
/// The buffer is sized to the physical extents of the shape. Padding elements are zero unless a
/// kernel writes them.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    shape: Shape,
    data: Box<[T]>,
}

impl<T: Scalar> Tensor<T> {
    /// Create a tensor of zeros.
    #[inline]
    pub fn zeros(shape: Shape) -> Self {
        let data = vec![T::zero(); shape.storage_size()].into_boxed_slice();
        Self { shape, data }
    }

    /// Create a tensor from a buffer already laid out over the physical extents.
    #[inline]
    pub fn create(shape: Shape, data: impl Into<Box<[T]>>) -> Result<Self, TensorError> {
        let data = data.into();
        if data.len() != shape.storage_size() {
            return Err(TensorError::Create(shape.clone(), shape.storage_size(), data.len()));
        }
        Ok(Self { shape, data })
    }

    /// Create a tensor from logical elements in row-major order, scattering them past the padding.
    pub fn from_logical(shape: Shape, data: impl AsRef<[T]>) -> Result<Self, TensorError> {
        let data = data.as_ref();
        if data.len() != shape.size() {
            return Err(TensorError::Create(shape.clone(), shape.size(), data.len()));
        }
        let mut tensor = Self::zeros(shape);
        let coords = tensor
            .shape
            .dims()
            .iter()
            .map(|&dim| 0..dim)
            .multi_cartesian_product();
        for (coord, &value) in coords.zip_eq(data.iter()) {
            tensor.set(&coord, value);
        }
        Ok(tensor)
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data.len() * T::DATA_TYPE.size()
    }

    /// The whole physical buffer.
    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// # Panics
    /// Panics if `coord` is outside the physical extents.
    #[inline]
    pub fn get(&self, coord: &[usize]) -> T {
        self.data[self.shape.offset(coord)]
    }

    /// # Panics
    /// Panics if `coord` is outside the physical extents.
    #[inline]
    pub fn set(&mut self, coord: &[usize], value: T) {
        let offset = self.shape.offset(coord);
        self.data[offset] = value;
    }

    /// Logical elements in row-major order, padding stripped.
    pub fn to_logical_vec(&self) -> Vec<T> {
        self.shape
            .dims()
            .iter()
            .map(|&dim| 0..dim)
            .multi_cartesian_product()
            .map(|coord| self.get(&coord))
            .collect()
    }

    /// Checks the tensor has exactly the given shape.
    #[inline]
    pub fn check_shape(&self, shape: &Shape) -> Result<(), TensorError> {
        match &self.shape == shape {
            true => Ok(()),
            false => Err(TensorError::Shape(self.shape.clone(), shape.clone())),
        }
    }
}
