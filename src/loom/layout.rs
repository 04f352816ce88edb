use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ordering of the logical axes of a tensor, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataLayout {
    NCHW,
    NHWC,
    NC,
    X,
}

impl DataLayout {
    /// Number of axes the layout names.
    pub const fn rank(self) -> usize {
        match self {
            DataLayout::NCHW | DataLayout::NHWC => 4,
            DataLayout::NC => 2,
            DataLayout::X => 1,
        }
    }
}

/// Per-dimension logical extents, their physical ordering and alignment padding.
///
/// The buffer of a tensor with this shape is row-major over the *physical* extents,
/// i.e., `dims[i] + padding[i]` along dimension `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{layout}({}) pad ({})", dims.iter().format(", "), padding.iter().format(", "))]
pub struct Shape {
    dims: Vec<usize>,
    layout: DataLayout,
    padding: Vec<usize>,
}

impl Shape {
    /// Creates an unpadded shape.
    #[inline]
    pub fn new(dims: impl Into<Vec<usize>>, layout: DataLayout) -> Self {
        let dims = dims.into();
        let padding = vec![0; dims.len()];
        Self {
            dims,
            layout,
            padding,
        }
    }

    /// Creates a shape whose innermost dimension is padded up to a multiple of `alignment`.
    #[inline]
    pub fn with_alignment(dims: impl Into<Vec<usize>>, layout: DataLayout, alignment: usize) -> Self {
        let mut shape = Self::new(dims, layout);
        if let (Some(&last), Some(pad)) = (shape.dims.last(), shape.padding.last_mut()) {
            let alignment = alignment.max(1);
            *pad = last.next_multiple_of(alignment) - last;
        }
        shape
    }

    /// Creates a shape with explicit per-dimension padding.
    ///
    /// # Panics
    /// Panics if `padding` does not have one entry per dimension.
    #[inline]
    pub fn with_padding(
        dims: impl Into<Vec<usize>>,
        layout: DataLayout,
        padding: impl Into<Vec<usize>>,
    ) -> Self {
        let dims = dims.into();
        let padding = padding.into();
        assert_eq!(dims.len(), padding.len(), "padding rank must match shape rank");
        Self {
            dims,
            layout,
            padding,
        }
    }

    #[inline]
    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn dim(&self, index: usize) -> usize {
        self.dims[index]
    }

    #[inline]
    pub fn padding(&self, index: usize) -> usize {
        self.padding[index]
    }

    #[inline]
    pub fn paddings(&self) -> &[usize] {
        &self.padding
    }

    /// Physical (padded) extent along dimension `index`.
    #[inline]
    pub fn physical(&self, index: usize) -> usize {
        self.dims[index] + self.padding[index]
    }

    /// Number of dimensions.
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Number of logical elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of elements the backing buffer holds, padding included.
    #[inline]
    pub fn storage_size(&self) -> usize {
        (0..self.len()).map(|index| self.physical(index)).product()
    }

    /// Row-major strides over the physical extents.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.len()];
        for index in (0..self.len().saturating_sub(1)).rev() {
            strides[index] = strides[index + 1] * self.physical(index + 1);
        }
        strides
    }

    /// Translates a coordinate into a linear buffer offset.
    ///
    /// # Panics
    /// Panics if the coordinate rank mismatches or any component is outside its physical extent.
    #[inline]
    pub fn offset(&self, coord: &[usize]) -> usize {
        assert_eq!(
            coord.len(),
            self.len(),
            "coordinate rank must match shape rank: {coord:?} for {self}"
        );
        let mut offset = 0;
        for (index, &x) in coord.iter().enumerate() {
            let extent = self.physical(index);
            assert!(x < extent, "coordinate {coord:?} out of bounds for {self}");
            offset = offset * extent + x;
        }
        offset
    }

    /// Returns `true` if `coord` addresses a logical (non-padding) element.
    #[inline]
    pub fn contains(&self, coord: &[usize]) -> bool {
        coord.len() == self.len() && coord.iter().zip_eq(self.dims.iter()).all(|(x, d)| x < d)
    }
}
