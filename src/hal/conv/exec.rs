use super::ConfigError;
use crate::loom::{
    device::{TileArgs, TileCall},
    num::Scalar,
    tensor::Tensor,
    tiled::TiledTensor,
};

/// One matched pair of channel tiles along the reduction axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TilePair {
    pub input: usize,
    pub weight: usize,
    /// The first pair of the reduction; the kernel initializes the output tile.
    pub first: bool,
}

/// Walks the channel tiles of the input and the weights with two cursors.
///
/// Equal tile counts advance both cursors together. If one operand holds a single channel tile,
/// it is broadcast: its cursor stays at zero while the other one advances. The walk yields
/// `max(inputs, weights)` pairs, the first one flagged.
#[derive(Debug, Clone)]
pub struct ChannelPairs {
    inputs: usize,
    weights: usize,
    input: usize,
    weight: usize,
    step: usize,
    len: usize,
}

impl ChannelPairs {
    pub fn new(inputs: usize, weights: usize) -> Result<Self, ConfigError> {
        let matched = inputs == weights || inputs == 1 || weights == 1;
        if inputs == 0 || weights == 0 || !matched {
            return Err(ConfigError::Channels { inputs, weights });
        }
        Ok(Self {
            inputs,
            weights,
            input: 0,
            weight: 0,
            step: 0,
            len: inputs.max(weights),
        })
    }
}

impl Iterator for ChannelPairs {
    type Item = TilePair;

    fn next(&mut self) -> Option<Self::Item> {
        if self.step == self.len {
            return None;
        }
        let pair = TilePair {
            input: self.input,
            weight: self.weight,
            first: self.step == 0,
        };
        self.step += 1;

        if self.inputs == self.weights {
            self.input += 1;
            self.weight += 1;
        } else if self.inputs == 1 {
            self.weight += 1;
        } else {
            self.input += 1;
        }
        Some(pair)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len - self.step;
        (len, Some(len))
    }
}

impl ExactSizeIterator for ChannelPairs {}

/// Produces the tile calls of one convolution, in enqueue order.
///
/// The outer walk goes over batch tiles, input row tiles and weight groups; the channel axis is
/// reduced with [`ChannelPairs`]. The grids are checked for alignment before any call is made.
pub fn plan<T: Scalar>(
    inputs: &TiledTensor<T>,
    weights: &TiledTensor<T>,
    outputs: &TiledTensor<T>,
    row_stride: usize,
    col_stride: usize,
) -> Result<Vec<TileCall>, ConfigError> {
    let [batches, rows, columns, _] = counts("input", inputs)?;
    let [groups, kernel_rows, kernel_columns, _] = counts("weight", weights)?;
    let output = counts("output", outputs)?;

    let checks = [
        ("input", 2, columns, 1),
        ("weight", 1, kernel_rows, 1),
        ("weight", 2, kernel_columns, 1),
        ("output", 0, output[0], batches),
        ("output", 1, output[1], rows),
        ("output", 2, output[2], 1),
        ("output", 3, output[3], groups),
    ];
    if let Some((operand, dim, count, expected)) = checks
        .into_iter()
        .find(|&(_, _, count, expected)| count != expected)
    {
        return Err(ConfigError::Grid {
            operand,
            dim,
            count,
            expected,
        });
    }

    let pairs = ChannelPairs::new(inputs.counts()[3], weights.counts()[3])?;

    let mut calls = Vec::with_capacity(batches * rows * groups * pairs.len());
    for (batch, row, group) in itertools::iproduct!(0..batches, 0..rows, 0..groups) {
        let output = outputs.index(&[batch, row, 0, group]);
        for pair in pairs.clone() {
            let input = inputs.index(&[batch, row, 0, pair.input]);
            let weight = weights.index(&[group, 0, 0, pair.weight]);

            let (input_tile, weight_tile, output_tile) =
                (inputs.tile(input), weights.tile(weight), outputs.tile(output));
            let args = TileArgs {
                input_dims: dims(input_tile),
                weight_dims: dims(weight_tile),
                output_dims: dims(output_tile),
                input_pad: input_tile.shape().padding(3),
                weight_pad: weight_tile.shape().padding(3),
                output_pad: output_tile.shape().padding(3),
                row_stride,
                col_stride,
                weight_group: group,
                input_channel_tile: pair.input,
                input_channel_start: inputs.origin(input)[3],
                weight_channel_start: weights.origin(weight)[3],
                first: pair.first,
            };
            calls.push(TileCall {
                input,
                weight,
                output,
                args,
            });
        }
    }

    log::debug!(
        "planned {} tile calls: {} outer positions, {} channel pairs each",
        calls.len(),
        batches * rows * groups,
        pairs.len()
    );
    Ok(calls)
}

fn counts<T: Scalar>(operand: &'static str, grid: &TiledTensor<T>) -> Result<[usize; 4], ConfigError> {
    grid.counts().try_into().map_err(|_| ConfigError::Rank {
        operand,
        rank: grid.counts().len(),
    })
}

#[inline]
fn dims<T: Scalar>(tile: &Tensor<T>) -> [usize; 4] {
    std::array::from_fn(|index| tile.shape().dim(index))
}
