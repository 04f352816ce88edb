use std::iter;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loom::{
    num::{DataType, Scalar},
    tensor::Tensor,
    tiled::{TileError, TiledTensor},
};

/// Hardware limits that bound the size of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{num_pes} PEs, {maccs_per_pe} MACCs per PE, {spad_bytes} bytes per scratchpad")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct Capacity {
    /// Number of processing elements. Output-channel tile extents are multiples of this.
    pub num_pes: usize,
    /// MAC lanes per processing element. Channel tile extents are multiples of this.
    pub maccs_per_pe: usize,
    /// Size of the scratchpad holding one operand tile.
    pub spad_bytes: usize,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            num_pes: 8,
            maccs_per_pe: 32,
            spad_bytes: 32 * 1024,
        }
    }
}

impl Capacity {
    pub fn num_pes(mut self, num_pes: usize) -> Self {
        self.num_pes = num_pes;
        self
    }

    pub fn maccs_per_pe(mut self, maccs_per_pe: usize) -> Self {
        self.maccs_per_pe = maccs_per_pe;
        self
    }

    pub fn spad_bytes(mut self, spad_bytes: usize) -> Self {
        self.spad_bytes = spad_bytes;
        self
    }

    /// Number of elements of `data_type` one scratchpad holds.
    #[inline]
    pub fn budget(&self, data_type: DataType) -> usize {
        self.spad_bytes / data_type.size()
    }
}

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("capacity error: {0} must be positive")]
    Zero(&'static str),
    #[error("capacity error: no {operand} tile fits in {budget} elements ({capacity})")]
    Fit {
        operand: &'static str,
        budget: usize,
        capacity: Capacity,
    },
}

/// Nominal tile extents of the three convolution operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TilingConfig {
    /// `[1, rows, W, channels]`.
    pub inputs: [usize; 4],
    /// `[K tile, R, S, channels]`.
    pub weights: [usize; 4],
    /// `[1, output rows, Wo, K tile]`.
    pub outputs: [usize; 4],
    /// Halo widths of the input tiles.
    pub input_halo: [usize; 4],
}

/// Picks the largest tile extents that fit the scratchpads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingOptimizer {
    pub capacity: Capacity,
    pub row_stride: usize,
    pub col_stride: usize,
}

impl TilingOptimizer {
    pub fn new(capacity: Capacity, row_stride: usize, col_stride: usize) -> Self {
        Self {
            capacity,
            row_stride,
            col_stride,
        }
    }

    /// Computes tile extents for an NHWC input `[N, H, W, C]`, weights `[K, R, S, C]` and an
    /// output `[N, Ho, Wo, K]`.
    ///
    /// Each extent is the whole dimension if it fits, otherwise the largest multiple of the
    /// dimension's hardware unit that fits. When both the input and the weights split their
    /// channels, the two extents are equalized so the channel tiles pair up one to one.
    pub fn compute_basic_tile_shapes(
        &self,
        input: [usize; 4],
        weights: [usize; 4],
        output: [usize; 4],
        data_type: DataType,
    ) -> Result<TilingConfig, CapacityError> {
        let Capacity {
            num_pes,
            maccs_per_pe,
            ..
        } = self.capacity;
        if num_pes == 0 {
            return Err(CapacityError::Zero("num_pes"));
        }
        if maccs_per_pe == 0 {
            return Err(CapacityError::Zero("maccs_per_pe"));
        }
        if self.capacity.spad_bytes == 0 {
            return Err(CapacityError::Zero("spad_bytes"));
        }

        let budget = self.capacity.budget(data_type);
        let fits = |elements: usize| elements <= budget;
        let fault = |operand| CapacityError::Fit {
            operand,
            budget,
            capacity: self.capacity,
        };

        let [_, h, w, c] = input;
        let [k, r, s, _] = weights;
        let [_, _, wo, _] = output;
        let row_stride = self.row_stride.max(1);
        let [halo_r, halo_s] = [r / 2, s / 2];

        let k_unit = num_pes.min(k);
        let row_unit = row_stride.min(h);
        let output_rows = |rows: usize| rows.div_ceil(row_stride);
        let input_tile = |rows: usize, channels: usize| (rows + 2 * halo_r) * (w + 2 * halo_s) * channels;

        let wc = candidates(c, maccs_per_pe)
            .find(|&wc| fits(k_unit * r * s * wc))
            .ok_or_else(|| fault("weight"))?;
        let wk = candidates(k, num_pes)
            .find(|&wk| fits(wk * r * s * wc) && fits(output_rows(row_unit) * wo * wk))
            .ok_or_else(|| fault("output"))?;
        let ic = candidates(c, maccs_per_pe)
            .find(|&ic| fits(input_tile(row_unit, ic)))
            .ok_or_else(|| fault("input"))?;

        // both split: equalize so the channel tiles pair one to one
        let (ic, wc) = match ic < c && wc < c {
            true => (ic.min(wc), ic.min(wc)),
            false => (ic, wc),
        };

        let rows = candidates(h, row_stride)
            .find(|&rows| fits(input_tile(rows, ic)) && fits(output_rows(rows) * wo * wk))
            .ok_or_else(|| fault("input"))?;

        let config = TilingConfig {
            inputs: [1, rows, w, ic],
            weights: [wk, r, s, wc],
            outputs: [1, output_rows(rows), wo, wk],
            input_halo: [0, halo_r, halo_s, 0],
        };
        log::debug!(
            "tiling: input {input:?} -> {:?}, weights {weights:?} -> {:?}, output {output:?} -> {:?}",
            config.inputs,
            config.weights,
            config.outputs
        );
        Ok(config)
    }

    /// Materializes the tile grid of one operand, injecting the halos.
    pub fn generate_tiled_tensor<T: Scalar>(
        tensor: &Tensor<T>,
        extents: &[usize],
        halo: &[usize],
    ) -> Result<TiledTensor<T>, TileError> {
        let tiled = TiledTensor::generate(tensor, extents, halo)?;
        log::trace!(
            "tiled {} into {:?} tiles of {extents:?}, halo {halo:?}",
            tensor.shape(),
            tiled.counts()
        );
        Ok(tiled)
    }
}

/// Candidate tile extents of a dimension, largest first: the whole extent, then the multiples of
/// `unit` below it.
fn candidates(extent: usize, unit: usize) -> impl Iterator<Item = usize> {
    let unit = unit.min(extent).max(1);
    let count = extent.saturating_sub(1) / unit;
    iter::once(extent).chain((1..=count).rev().map(move |x| x * unit))
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Capacity, CapacityError, TilingConfig, TilingOptimizer, candidates};
    use crate::loom::{
        layout::{DataLayout, Shape},
        num::DataType,
        tensor::Tensor,
    };

    #[test]
    fn test_candidates() {
        assert_eq!(candidates(16, 8).collect_vec(), vec![16, 8]);
        assert_eq!(candidates(20, 8).collect_vec(), vec![20, 16, 8]);
        assert_eq!(candidates(5, 8).collect_vec(), vec![5]);
        assert_eq!(candidates(7, 1).collect_vec(), vec![7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(candidates(9, 2).collect_vec(), vec![9, 8, 6, 4, 2]);
    }

    #[test]
    fn test_channel_split_on_input_only() -> Result<(), Box<dyn Error>> {
        let capacity = Capacity::default()
            .num_pes(8)
            .maccs_per_pe(8)
            .spad_bytes(8192);
        let optimizer = TilingOptimizer::new(capacity, 1, 1);
        let config = optimizer.compute_basic_tile_shapes(
            [1, 8, 64, 16],
            [8, 3, 3, 16],
            [1, 8, 64, 8],
            DataType::F32,
        )?;

        assert_eq!(
            config,
            TilingConfig {
                inputs: [1, 1, 64, 8],
                weights: [8, 3, 3, 16],
                outputs: [1, 1, 64, 8],
                input_halo: [0, 1, 1, 0],
            }
        );
        Ok(())
    }

    #[test]
    fn test_channel_split_on_both_is_equalized() -> Result<(), Box<dyn Error>> {
        let capacity = Capacity::default()
            .num_pes(4)
            .maccs_per_pe(8)
            .spad_bytes(2048);
        let optimizer = TilingOptimizer::new(capacity, 1, 1);
        let config = optimizer.compute_basic_tile_shapes(
            [1, 4, 16, 24],
            [8, 3, 3, 24],
            [1, 4, 16, 8],
            DataType::F32,
        )?;

        assert_eq!(config.inputs, [1, 1, 16, 8]);
        assert_eq!(config.weights, [4, 3, 3, 8]);
        assert_eq!(config.outputs, [1, 1, 16, 4]);
        Ok(())
    }

    #[test]
    fn test_everything_fits_whole() -> Result<(), Box<dyn Error>> {
        let optimizer = TilingOptimizer::new(Capacity::default(), 2, 2);
        let config = optimizer.compute_basic_tile_shapes(
            [1, 9, 7, 8],
            [4, 3, 3, 8],
            [1, 5, 4, 4],
            DataType::F16,
        )?;

        assert_eq!(config.inputs, [1, 9, 7, 8]);
        assert_eq!(config.weights, [4, 3, 3, 8]);
        assert_eq!(config.outputs, [1, 5, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_strided_rows_stay_aligned() -> Result<(), Box<dyn Error>> {
        let capacity = Capacity::default()
            .num_pes(4)
            .maccs_per_pe(4)
            .spad_bytes(1024);
        let optimizer = TilingOptimizer::new(capacity, 2, 2);
        let config = optimizer.compute_basic_tile_shapes(
            [1, 9, 7, 8],
            [4, 3, 3, 8],
            [1, 5, 4, 4],
            DataType::F32,
        )?;

        assert_eq!(config.inputs, [1, 4, 7, 4]);
        assert_eq!(config.outputs, [1, 2, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_tiles_fit_budget() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        for _ in 0..32 {
            let [h, w, c, k] = [0; 4].map(|_| fastrand::usize(1..=24));
            let r = fastrand::usize(1..=3);
            let input = [1, h, w, c];
            let weights = [k, r, r, c];
            let output = [1, h, w, k];
            let capacity = Capacity::default()
                .num_pes(4)
                .maccs_per_pe(4)
                .spad_bytes(fastrand::usize(1024..8192));
            let optimizer = TilingOptimizer::new(capacity, 1, 1);
            let budget = capacity.budget(DataType::F32);

            let Ok(config) = optimizer.compute_basic_tile_shapes(input, weights, output, DataType::F32)
            else {
                continue;
            };
            let halo = config.input_halo;
            let input_tile = config
                .inputs
                .iter()
                .zip(halo)
                .map(|(x, halo)| x + 2 * halo)
                .product::<usize>();
            assert!(input_tile <= budget, "{config:?}");
            assert!(config.weights.iter().product::<usize>() <= budget, "{config:?}");
            assert!(config.outputs.iter().product::<usize>() <= budget, "{config:?}");

            let input_counts = c.div_ceil(config.inputs[3]);
            let weight_counts = c.div_ceil(config.weights[3]);
            assert!(input_counts == weight_counts || input_counts == 1 || weight_counts == 1);
        }
        Ok(())
    }

    #[test]
    fn test_capacity_faults() {
        let optimizer = TilingOptimizer::new(Capacity::default().spad_bytes(64), 1, 1);
        let err = optimizer.compute_basic_tile_shapes(
            [1, 8, 8, 64],
            [8, 3, 3, 64],
            [1, 8, 8, 8],
            DataType::F32,
        );
        assert!(matches!(err, Err(CapacityError::Fit { .. })));

        let optimizer = TilingOptimizer::new(Capacity::default().num_pes(0), 1, 1);
        let err = optimizer.compute_basic_tile_shapes(
            [1, 8, 8, 64],
            [8, 3, 3, 64],
            [1, 8, 8, 8],
            DataType::F32,
        );
        assert!(matches!(err, Err(CapacityError::Zero("num_pes"))));
    }

    #[test]
    fn test_generate_tiled_tensor_injects_halo() -> Result<(), Box<dyn Error>> {
        let shape = Shape::new([1, 4, 4, 2], DataLayout::NHWC);
        let tensor = Tensor::from_logical(shape, (0..32).map(|x| x as f32).collect_vec())?;
        let tiled = TilingOptimizer::generate_tiled_tensor(&tensor, &[1, 2, 4, 2], &[0, 1, 1, 0])?;

        assert_eq!(tiled.counts(), &[1, 2, 1, 1]);
        assert_eq!(tiled.tile(0).shape().dims(), &[1, 4, 6, 2]);
        assert_eq!(tiled.untile(), tensor);
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_capacity_serde() -> Result<(), Box<dyn Error>> {
        let capacity = Capacity::default().spad_bytes(4096);
        let json = serde_json::to_string(&capacity)?;
        assert_eq!(serde_json::from_str::<Capacity>(&json)?, capacity);

        let partial: Capacity = serde_json::from_str(r#"{"num_pes": 16}"#)?;
        assert_eq!(partial, Capacity::default().num_pes(16));
        Ok(())
    }
}
