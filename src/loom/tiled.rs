use itertools::Itertools;
use thiserror::Error;

use super::{layout::Shape, num::Scalar, tensor::Tensor};

#[derive(Debug, Error)]
pub enum TileError {
    #[error("tiling error: {0} tile extents given for shape {1}")]
    TileRank(usize, Shape),
    #[error("tiling error: {0} halo widths given for shape {1}")]
    HaloRank(usize, Shape),
    #[error("tiling error: dimension {0} of shape {1} has zero extent")]
    Empty(usize, Shape),
    #[error("tiling error: tile extent along dimension {0} is zero")]
    ZeroTile(usize),
}

/// A logical tensor subdivided into a grid of owned tiles.
///
/// Tiles are stored row-major over tile coordinates. Along dimension `d` a tile holds
/// `core + 2 * halo[d]` logical elements, where `core` is the tile's share of the original
/// tensor and the halos are copies of the neighbouring elements (zeros past the tensor border).
/// A tile narrower than the nominal extent (the last one along a dimension that does not divide
/// evenly) carries the difference as padding, so all tiles of a grid have the same storage size.
#[derive(Debug, Clone, PartialEq)]
pub struct TiledTensor<T> {
    shape: Shape,
    extents: Vec<usize>,
    counts: Vec<usize>,
    halo: Vec<usize>,
    tiles: Vec<Tensor<T>>,
}

impl<T: Scalar> TiledTensor<T> {
    /// Splits `tensor` into tiles of nominal `extents` with the given `halo` widths.
    ///
    /// Tile extents larger than the tensor are clamped to the tensor's extent.
    pub fn generate(tensor: &Tensor<T>, extents: &[usize], halo: &[usize]) -> Result<Self, TileError> {
        let shape = tensor.shape().clone();
        if extents.len() != shape.len() {
            return Err(TileError::TileRank(extents.len(), shape));
        }
        if halo.len() != shape.len() {
            return Err(TileError::HaloRank(halo.len(), shape));
        }
        if let Some(dim) = shape.dims().iter().position(|&x| x == 0) {
            return Err(TileError::Empty(dim, shape));
        }
        if let Some(dim) = extents.iter().position(|&x| x == 0) {
            return Err(TileError::ZeroTile(dim));
        }

        let extents = extents
            .iter()
            .zip_eq(shape.dims())
            .map(|(&tile, &dim)| tile.min(dim))
            .collect_vec();
        let counts = extents
            .iter()
            .zip_eq(shape.dims())
            .map(|(&tile, &dim)| dim.div_ceil(tile))
            .collect_vec();
        let halo = halo.to_vec();

        let mut tiled = Self {
            shape,
            extents,
            counts,
            halo,
            tiles: vec![],
        };
        let tiles = (0..tiled.len()).map(|index| tiled.cut(tensor, index)).collect();
        tiled.tiles = tiles;
        Ok(tiled)
    }

    /// Copies one tile, halo included, out of the original tensor.
    fn cut(&self, tensor: &Tensor<T>, index: usize) -> Tensor<T> {
        let origin = self.origin(index);
        let core = self.core(index);
        let dims = izip_dims(&core, &self.halo, |core, halo| core + 2 * halo);
        let padding = izip_dims(&self.extents, &core, |extent, core| extent - core);
        let mut tile = Tensor::zeros(Shape::with_padding(dims, self.shape.layout(), padding));

        let coords = tile
            .shape()
            .dims()
            .iter()
            .map(|&dim| 0..dim)
            .multi_cartesian_product();
        for local in coords {
            // position in the original tensor; `None` if it falls past the border
            let source: Option<Vec<usize>> = itertools::izip!(&local, &origin, &self.halo)
                .map(|(&local, &origin, &halo)| (origin + local).checked_sub(halo))
                .collect();
            if let Some(source) = source.filter(|source| self.shape.contains(source)) {
                tile.set(&local, tensor.get(&source));
            }
        }
        tile
    }

    /// Shape of the original, untiled tensor.
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Nominal (non-halo) tile extent per dimension.
    #[inline]
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    /// Number of tiles per dimension.
    #[inline]
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    #[inline]
    pub fn halo(&self) -> &[usize] {
        &self.halo
    }

    /// Total number of tiles.
    #[inline]
    pub fn len(&self) -> usize {
        self.counts.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a tile coordinate to the position of the tile in the grid.
    ///
    /// # Panics
    /// Panics if the coordinate rank mismatches or any component exceeds the tile count.
    #[inline]
    pub fn index(&self, coord: &[usize]) -> usize {
        assert_eq!(coord.len(), self.counts.len(), "tile coordinate rank mismatch: {coord:?}");
        coord.iter().zip_eq(&self.counts).fold(0, |index, (&x, &count)| {
            assert!(x < count, "tile coordinate {coord:?} out of range {:?}", self.counts);
            index * count + x
        })
    }

    /// Inverse of [`TiledTensor::index`].
    ///
    /// # Panics
    /// Panics if `index` is not less than [`TiledTensor::len`].
    pub fn coord(&self, index: usize) -> Vec<usize> {
        assert!(index < self.len(), "tile index {index} out of range {}", self.len());
        let mut rest = index;
        let mut coord = vec![0; self.counts.len()];
        for (x, &count) in coord.iter_mut().zip(&self.counts).rev() {
            *x = rest % count;
            rest /= count;
        }
        coord
    }

    /// Logical coordinate of the first core element of a tile.
    #[inline]
    pub fn origin(&self, index: usize) -> Vec<usize> {
        izip_dims(&self.coord(index), &self.extents, |x, extent| x * extent)
    }

    /// Per-dimension core (non-halo, non-padding) extent of a tile.
    #[inline]
    pub fn core(&self, index: usize) -> Vec<usize> {
        let origin = self.origin(index);
        itertools::izip!(&origin, &self.extents, self.shape.dims())
            .map(|(&origin, &extent, &dim)| extent.min(dim - origin))
            .collect()
    }

    #[inline]
    pub fn tile(&self, index: usize) -> &Tensor<T> {
        &self.tiles[index]
    }

    #[inline]
    pub fn tile_mut(&mut self, index: usize) -> &mut Tensor<T> {
        &mut self.tiles[index]
    }

    #[inline]
    pub fn tile_at(&self, coord: &[usize]) -> &Tensor<T> {
        self.tile(self.index(coord))
    }

    #[inline]
    pub fn tiles(&self) -> &[Tensor<T>] {
        &self.tiles
    }

    #[inline]
    pub fn tiles_mut(&mut self) -> &mut [Tensor<T>] {
        &mut self.tiles
    }

    /// Reassembles the canonical tensor by stripping halos and boundary padding.
    pub fn untile(&self) -> Tensor<T> {
        let mut output = Tensor::zeros(self.shape.clone());
        for (index, tile) in self.tiles.iter().enumerate() {
            let origin = self.origin(index);
            let coords = self
                .core(index)
                .into_iter()
                .map(|dim| 0..dim)
                .multi_cartesian_product();
            for local in coords {
                let target = izip_dims(&origin, &local, |origin, local| origin + local);
                let source = izip_dims(&local, &self.halo, |local, halo| local + halo);
                output.set(&target, tile.get(&source));
            }
        }
        output
    }
}

#[inline]
fn izip_dims(x: &[usize], y: &[usize], f: impl Fn(usize, usize) -> usize) -> Vec<usize> {
    x.iter().zip_eq(y).map(|(&x, &y)| f(x, y)).collect()
}
